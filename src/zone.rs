// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Information about a zone and its current state

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use super::constant::{self, ZONETYPE_UNUSED};

/// Low two bits of the zone state byte: the detector contact condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Contact {
    Secure = 0,
    Active = 1,
    Tamper = 2,
    Short = 3,
}

impl Contact {
    pub fn text(self) -> &'static str {
        match self {
            Contact::Secure => "secure",
            Contact::Active => "active",
            Contact::Tamper => "tamper",
            Contact::Short => "short",
        }
    }
}

bitflags! {
    /// Upper bits of the zone state byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZoneFlags: u8 {
        const FAULT = 1 << 2;
        const FAILED_TEST = 1 << 3;
        const ALARMED = 1 << 4;
        const MANUAL_BYPASS = 1 << 5;
        const AUTO_BYPASS = 1 << 6;
        const MASKED = 1 << 7;
    }
}

/// Decoded zone state. The raw byte is kept for diagnostics; consumers
/// should use the typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStatus {
    pub raw: u8,
    pub contact: Contact,
    pub flags: ZoneFlags,
}

impl ZoneStatus {
    pub fn from_raw(raw: u8) -> ZoneStatus {
        let contact = Contact::try_from_primitive(raw & 0x3).unwrap_or(Contact::Secure);
        ZoneStatus {
            raw,
            contact,
            flags: ZoneFlags::from_bits_truncate(raw),
        }
    }

    pub fn text(&self) -> String {
        let mut text = String::from(self.contact.text());
        if self.flags.contains(ZoneFlags::FAULT) {
            text.push_str(", fault");
        }
        if self.flags.contains(ZoneFlags::FAILED_TEST) {
            text.push_str(", failed test");
        }
        if self.flags.contains(ZoneFlags::ALARMED) {
            text.push_str(", alarmed");
        }
        if self.flags.contains(ZoneFlags::MANUAL_BYPASS) {
            text.push_str(", manual bypassed");
        }
        if self.flags.contains(ZoneFlags::AUTO_BYPASS) {
            text.push_str(", auto bypassed");
        }
        if self.flags.contains(ZoneFlags::MASKED) {
            text.push_str(", zone masked");
        }
        text
    }
}

/// A single sensor input. Created on first reference and kept for the life
/// of the process; its identity is its 1-based number.
#[derive(Debug, Clone)]
pub struct Zone {
    pub number: u16,
    pub text: String,
    pub zone_type: u8,
    pub zone_type_text: &'static str,
    /// Raw area membership bitmap as reported by zone details.
    pub area_bitmap: Vec<u8>,
    /// Area numbers this zone belongs to; mirrored by `Area::zones`.
    pub areas: BTreeSet<u8>,
    pub status: Option<ZoneStatus>,
    active: bool,
    armed: bool,
    active_since: Option<Instant>,
    last_active: Option<Instant>,
    smoothed_active: bool,
    /// How long `smoothed_active` stays set after the last activation.
    smoothed_active_delay: Duration,
}

impl Zone {
    pub fn new(number: u16) -> Zone {
        Zone {
            number,
            text: format!("Zone{}", number),
            zone_type: ZONETYPE_UNUSED,
            zone_type_text: "unknown",
            area_bitmap: Vec::new(),
            areas: BTreeSet::new(),
            status: None,
            active: false,
            armed: false,
            active_since: None,
            last_active: None,
            smoothed_active: false,
            smoothed_active_delay: Duration::from_secs(30),
        }
    }

    pub fn is_unused(&self) -> bool {
        self.zone_type == ZONETYPE_UNUSED
    }

    pub fn set_zone_type(&mut self, zone_type: u8) {
        self.zone_type = zone_type;
        self.zone_type_text = constant::zone_type_text(zone_type);
    }

    /// Apply a state byte from a zone event or state poll.
    pub fn save_status(&mut self, raw: u8) {
        let status = ZoneStatus::from_raw(raw);
        self.set_active(status.contact == Contact::Active);
        self.armed = status.flags.contains(ZoneFlags::ALARMED);
        self.status = Some(status);
    }

    fn set_active(&mut self, active: bool) {
        if active == self.active {
            return;
        }
        self.active = active;
        if active {
            self.active_since = Some(Instant::now());
            self.smoothed_active = true;
        } else {
            self.active_since = None;
            self.last_active = Some(Instant::now());
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    /// True while the zone is active or was active within the smoothing
    /// window.
    pub fn smoothed_active(&self) -> bool {
        self.smoothed_active
    }

    pub fn state_text(&self) -> String {
        match &self.status {
            Some(status) => status.text(),
            None => String::from("unknown"),
        }
    }

    /// Periodic decay of the smoothed-active flag; run from the main loop.
    pub fn tick(&mut self) {
        if self.smoothed_active && !self.active {
            if let Some(last_active) = self.last_active {
                if last_active.elapsed() > self.smoothed_active_delay {
                    self.smoothed_active = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode() {
        let status = ZoneStatus::from_raw(0x01);
        assert_eq!(status.contact, Contact::Active);
        assert_eq!(status.text(), "active");

        let status = ZoneStatus::from_raw(0x02 | 1 << 2 | 1 << 4);
        assert_eq!(status.contact, Contact::Tamper);
        assert!(status.flags.contains(ZoneFlags::FAULT));
        assert!(status.flags.contains(ZoneFlags::ALARMED));
        assert_eq!(status.text(), "tamper, fault, alarmed");

        let status = ZoneStatus::from_raw(0xFF);
        assert_eq!(
            status.text(),
            "short, fault, failed test, alarmed, manual bypassed, auto bypassed, zone masked"
        );
    }

    #[test]
    fn test_active_and_armed_derivation() {
        let mut zone = Zone::new(3);
        assert!(!zone.active());

        zone.save_status(0x01);
        assert!(zone.active());
        assert!(!zone.armed());
        assert!(zone.smoothed_active());

        zone.save_status(0x10);
        assert!(!zone.active());
        assert!(zone.armed());
        // smoothing holds after deactivation until the delay passes
        assert!(zone.smoothed_active());
        zone.tick();
        assert!(zone.smoothed_active());
    }

    #[test]
    fn test_default_name() {
        let zone = Zone::new(12);
        assert_eq!(zone.text, "Zone12");
        assert!(zone.is_unused());
    }
}
