// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Panel identification and size derivation
//!
//! Every payload whose width depends on the panel model - area bitmaps,
//! zone bitmaps, zone numbers - is sized from the shape derived here, so a
//! malformed identification string must fail rather than guess.

use super::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelShape {
    pub panel_type: String,
    pub firmware_version: String,
    pub zones: u16,
    pub users: u16,
    pub areas: u8,
    /// Width in bytes of an area bitmap on the wire.
    pub area_bitmap_len: usize,
    /// Width in bytes of a zone bitmap on the wire; one bit per zone.
    pub zone_bitmap_len: usize,
    /// Width in bytes of a zone (or user) number on the wire.
    pub zone_num_len: usize,
}

impl PanelShape {
    /// Derive the size table row from the 32-byte identification string,
    /// e.g. `"Premier48 48 X V4.00"`.
    pub fn from_identification(idstr: &str) -> Result<PanelShape, Error> {
        let tokens: Vec<&str> = idstr.split_whitespace().collect();
        let (panel_type, zones, firmware_version) = match tokens.as_slice() {
            [panel_type, zones, _, firmware] => (*panel_type, *zones, *firmware),
            _ => return Err(Error::Identification(idstr.trim().to_string())),
        };
        let zones: u16 = zones
            .parse()
            .map_err(|_| Error::Identification(idstr.trim().to_string()))?;

        let (users, areas, area_bitmap_len, zone_num_len) = match zones {
            12 => (8, 2, 1, 1),
            24 => (25, 2, 1, 1),
            48 => (50, 4, 1, 1),
            64 => (50, 4, 1, 1),
            88 => (100, 8, 1, 1),
            168 => (200, 16, 2, 1),
            640 => (1000, 64, 8, 2),
            _ => return Err(Error::Identification(idstr.trim().to_string())),
        };

        Ok(PanelShape {
            panel_type: panel_type.to_string(),
            firmware_version: firmware_version.to_string(),
            zones,
            users,
            areas,
            area_bitmap_len,
            zone_bitmap_len: zones as usize / 8,
            zone_num_len,
        })
    }

    /// Encode a zone or user number at this panel's wire width
    /// (little-endian).
    pub fn encode_zone_num(&self, number: u16) -> Vec<u8> {
        number.to_le_bytes()[..self.zone_num_len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_panel() {
        let shape = PanelShape::from_identification("Premier48 48 X V4.00").unwrap();
        assert_eq!(shape.panel_type, "Premier48");
        assert_eq!(shape.firmware_version, "V4.00");
        assert_eq!(shape.zones, 48);
        assert_eq!(shape.users, 50);
        assert_eq!(shape.areas, 4);
        assert_eq!(shape.area_bitmap_len, 1);
        assert_eq!(shape.zone_bitmap_len, 6);
        assert_eq!(shape.zone_num_len, 1);
    }

    #[test]
    fn test_largest_panel() {
        let shape = PanelShape::from_identification("Premier640 640 X V4.00").unwrap();
        assert_eq!(shape.areas, 64);
        assert_eq!(shape.area_bitmap_len, 8);
        assert_eq!(shape.zone_bitmap_len, 80);
        assert_eq!(shape.zone_num_len, 2);
        assert_eq!(shape.encode_zone_num(0x0201), vec![0x01, 0x02]);
    }

    #[test]
    fn test_trailing_padding_tolerated() {
        // identification strings are 32 bytes, right-padded
        let shape = PanelShape::from_identification("Elite24 24 X V5.02          ").unwrap();
        assert_eq!(shape.zones, 24);
        assert_eq!(shape.users, 25);
    }

    #[test]
    fn test_malformed_identification_fails() {
        assert!(PanelShape::from_identification("Premier Elite 48 X V4.00").is_err());
        assert!(PanelShape::from_identification("Premier48 notanumber X V4.00").is_err());
        // 96 zones is not a known model
        assert!(PanelShape::from_identification("Premier96 96 X V4.00").is_err());
        assert!(PanelShape::from_identification("").is_err());
    }
}
