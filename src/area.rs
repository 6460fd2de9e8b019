// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Information about an area and its current state

use std::collections::BTreeSet;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Arming state as reported by area events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AreaState {
    Disarmed = 0,
    InExit = 1,
    InEntry = 2,
    Armed = 3,
    PartArmed = 4,
    InAlarm = 5,
}

impl AreaState {
    pub fn text(self) -> &'static str {
        match self {
            AreaState::Disarmed => "disarmed",
            AreaState::InExit => "in exit",
            AreaState::InEntry => "in entry",
            AreaState::Armed => "armed",
            AreaState::PartArmed => "part armed",
            AreaState::InAlarm => "in alarm",
        }
    }
}

/// A partition of the installation that arms and disarms independently.
/// Created on first reference and kept for the life of the process.
#[derive(Debug, Clone)]
pub struct Area {
    pub number: u8,
    pub text: String,
    pub state: Option<AreaState>,
    pub exit_delay: u16,
    pub entry1_delay: u16,
    pub entry2_delay: u16,
    pub second_entry: u16,
    /// Zone numbers belonging to this area; mirrored by `Zone::areas`.
    pub zones: BTreeSet<u16>,
}

impl Area {
    pub fn new(number: u8) -> Area {
        Area {
            number,
            text: format!("Area{}", number),
            state: None,
            exit_delay: 0,
            entry1_delay: 0,
            entry2_delay: 0,
            second_entry: 0,
            zones: BTreeSet::new(),
        }
    }

    pub fn save_state(&mut self, state: AreaState) {
        self.state = Some(state);
    }

    pub fn state_text(&self) -> &'static str {
        match self.state {
            Some(state) => state.text(),
            None => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn test_state_from_wire_byte() {
        assert_eq!(AreaState::try_from(4).ok(), Some(AreaState::PartArmed));
        assert!(AreaState::try_from(6).is_err());
    }

    #[test]
    fn test_save_state() {
        let mut area = Area::new(1);
        assert_eq!(area.text, "Area1");
        assert_eq!(area.state_text(), "unknown");
        area.save_state(AreaState::InAlarm);
        assert_eq!(area.state, Some(AreaState::InAlarm));
        assert_eq!(area.state_text(), "in alarm");
    }
}
