// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Decoding of unsolicited `M` frames
//!
//! The first payload byte is the message-type tag; the layout of the rest
//! depends on the tag and, for zone and log events, on the panel size. The
//! panel size is never consulted directly: each size has a distinct payload
//! length, so decoding switches on length.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Debug(String),
    Zone { zone: u16, status: u8 },
    Area { area: u8, state: u8 },
    Output { location: u8, state: u8 },
    User { user: u8, state: u8 },
    Log(LogEvent),
}

/// One panel log entry, as carried by a LOGEVENT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub event_type: u8,
    /// Low 6 bits group table index, bit 6 comm-delayed, bit 7 communicated.
    pub group_type: u8,
    pub parameter: u16,
    pub areas: u32,
    pub timestamp: LogTimestamp,
}

impl LogEvent {
    pub fn event_text(&self) -> String {
        match constant::log_event_text(self.event_type) {
            Some(text) => text.to_string(),
            None => format!("Unknown log event type {}", self.event_type),
        }
    }

    pub fn group_text(&self) -> String {
        let group = self.group_type & 0b0011_1111;
        let mut text = match constant::log_event_group_text(group) {
            Some(text) => text.to_string(),
            None => format!("Unknown log event group type {}", group),
        };
        if self.group_type & 0b0100_0000 != 0 {
            text.push_str(" [comm delayed]");
        }
        if self.group_type & 0b1000_0000 != 0 {
            text.push_str(" [communicated]");
        }
        text
    }
}

/// Log timestamps are a packed 32-bit field; the panel clock has no
/// timezone, so the fields are kept as-is rather than converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl LogTimestamp {
    pub fn unpack(v: u32) -> LogTimestamp {
        LogTimestamp {
            second: (v & 63) as u8,
            minute: ((v >> 6) & 63) as u8,
            month: ((v >> 12) & 15) as u8,
            hour: ((v >> 16) & 31) as u8,
            day: ((v >> 21) & 31) as u8,
            year: 2000 + ((v >> 26) & 63) as u16,
        }
    }
}

impl fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Parse an unsolicited message payload (tag byte included).
/// `None` means an unknown tag or a payload whose length fits no form;
/// the session carries on regardless.
pub fn parse(payload: &[u8]) -> Option<Message> {
    let (tag, body) = payload.split_first()?;
    match *tag {
        constant::MSG_DEBUG => Some(Message::Debug(
            String::from_utf8_lossy(body).into_owned(),
        )),
        constant::MSG_ZONEEVENT => match body.len() {
            // zone number is 1 byte, or 2 bytes little-endian on 640-zone panels
            2 => Some(Message::Zone {
                zone: body[0] as u16,
                status: body[1],
            }),
            3 => Some(Message::Zone {
                zone: LittleEndian::read_u16(&body[0..2]),
                status: body[2],
            }),
            _ => None,
        },
        constant::MSG_AREAEVENT => {
            if body.len() < 2 {
                return None;
            }
            Some(Message::Area {
                area: body[0],
                state: body[1],
            })
        }
        constant::MSG_OUTPUTEVENT => {
            if body.len() < 2 {
                return None;
            }
            Some(Message::Output {
                location: body[0],
                state: body[1],
            })
        }
        constant::MSG_USEREVENT => {
            if body.len() < 2 {
                return None;
            }
            Some(Message::User {
                user: body[0],
                state: body[1],
            })
        }
        constant::MSG_LOGEVENT => parse_log_event(body).map(Message::Log),
        _ => None,
    }
}

fn parse_log_event(body: &[u8]) -> Option<LogEvent> {
    let (parameter, areas, timestamp) = match body.len() {
        8 => (
            body[2] as u16,
            body[3] as u32,
            LittleEndian::read_u32(&body[4..8]),
        ),
        // Premier 168 - longer message as 16 bits of area info
        9 => (
            body[2] as u16,
            body[3] as u32 | (body[8] as u32) << 8,
            LittleEndian::read_u32(&body[4..8]),
        ),
        // Premier 640 form; untested against a real panel
        16 => (
            LittleEndian::read_u16(&body[2..4]),
            LittleEndian::read_u32(&body[4..8]),
            LittleEndian::read_u32(&body[8..12]),
        ),
        _ => return None,
    };
    Some(LogEvent {
        event_type: body[0],
        group_type: body[1],
        parameter,
        areas,
        timestamp: LogTimestamp::unpack(timestamp),
    })
}

/// Human-readable name of an output event location.
pub fn output_location_text(location: u8) -> String {
    const LOCATIONS: [&str; 10] = [
        "Panel outputs",
        "Digi outputs",
        "Digi Channel low 8",
        "Digi Channel high 8",
        "Redcare outputs",
        "Custom outputs 1",
        "Custom outputs 2",
        "Custom outputs 3",
        "Custom outputs 4",
        "X-10 outputs",
    ];
    if let Some(name) = LOCATIONS.get(location as usize) {
        (*name).to_string()
    } else if location & 0xF == 0 {
        format!("Network {} keypad outputs", location >> 4)
    } else {
        format!(
            "Network {} expander {} outputs",
            location >> 4,
            location & 0xF
        )
    }
}

/// Logon method reported by a user event.
pub fn user_state_text(state: u8) -> &'static str {
    match state {
        0 => "code",
        1 => "tag",
        2 => "code+tag",
        _ => "unknown",
    }
}
