// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Panel user records

use byteorder::{ByteOrder, LittleEndian};

use super::constant::{bcd_decode, normalize_text};
use super::error::Error;

/// The only user record layout we can decode. The protocol has other forms
/// on some firmware; those slots are skipped rather than guessed at.
pub const USER_RECORD_LEN: usize = 23;

#[derive(Debug, Clone, Default)]
pub struct User {
    pub name: String,
    pub passcode: String,
    /// Area bitmap this user may operate.
    pub areas: u8,
    pub modifiers: u8,
    pub locks: u8,
    pub doors: [u8; 3],
    /// Prox tag digits; the last BCD byte is always 0xFF.
    pub tag: String,
    pub config: u16,
}

impl User {
    /// Decode the 23-byte GET_USER response form: 8-byte name, 3-byte BCD
    /// passcode, area byte, modifier, lock, 3 door bytes, 4-byte BCD tag,
    /// 2-byte config.
    pub fn from_record(details: &[u8]) -> Result<User, Error> {
        if details.len() != USER_RECORD_LEN {
            return Err(Error::ResponseLength {
                command: super::constant::CMD_GETUSER,
                expected: USER_RECORD_LEN,
                actual: details.len(),
            });
        }
        let name = String::from_utf8_lossy(&details[0..8]);
        Ok(User {
            name: normalize_text(&name),
            passcode: bcd_decode(&details[8..11]),
            areas: details[11],
            modifiers: details[12],
            locks: details[13],
            doors: [details[14], details[15], details[16]],
            tag: bcd_decode(&details[17..21]),
            config: LittleEndian::read_u16(&details[21..23]),
        })
    }

    /// Slot 0 is not a stored record; the panel reserves it for the
    /// engineer code.
    pub fn engineer() -> User {
        User {
            name: String::from("Engineer"),
            ..User::default()
        }
    }

    pub fn valid(&self) -> bool {
        !self.name.is_empty() || !self.passcode.is_empty()
    }
}
