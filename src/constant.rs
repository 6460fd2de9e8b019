// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

use std::time::Duration;

// Simple Protocol commands, in order of their command number
pub const CMD_LOGIN: u8 = 1;
pub const CMD_GETZONESTATE: u8 = 2;
pub const CMD_GETZONEDETAILS: u8 = 3;
pub const CMD_ARMAREAS: u8 = 6;
pub const CMD_DISARMAREAS: u8 = 8;
pub const CMD_RESETAREAS: u8 = 9;
pub const CMD_GETSYSTEMFLAGS: u8 = 10;
pub const CMD_GETAREAFLAGS: u8 = 11;
pub const CMD_GETLCDDISPLAY: u8 = 13;
pub const CMD_GETLOGPOINTER: u8 = 15;
pub const CMD_GETPANELIDENTIFICATION: u8 = 22;
pub const CMD_GETDATETIME: u8 = 23;
pub const CMD_GETSYSTEMPOWER: u8 = 25;
pub const CMD_GETUSER: u8 = 27;
pub const CMD_GETAREADETAILS: u8 = 35;
pub const CMD_GETZONECHANGES: u8 = 36;
pub const CMD_SETEVENTMESSAGES: u8 = 37;

pub const CMD_RESPONSE_ACK: u8 = 0x06;
pub const CMD_RESPONSE_NAK: u8 = 0x15;

// 2-3 seconds is mentioned in section 5.5 of the protocol specification.
// Increasing this value is not recommended: when the panel fails to respond
// to a command (as it sometimes does if it sends an event at the same time
// we send a command) it takes longer for us to notice and resend.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(2);
pub const CMD_RETRIES: u32 = 3;

/// The panel ignores anything sent sooner than this after connect;
/// Texecom recommend 500ms.
pub const CONNECT_PAUSE: Duration = Duration::from_millis(500);
/// Wait between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// The panel drops the session after ~60s of silence, so idle probes run
/// at half that.
pub const IDLE_PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// How long the panel must stay unreachable before the loss notifier fires.
pub const CONNECTION_LOSS_NOTIFY_AFTER: Duration = Duration::from_secs(60);
/// Default period of the alive heartbeat callback.
pub const DEFAULT_ALIVE_HEARTBEAT: Duration = Duration::from_secs(300);

/// A single GET_ZONE_STATE request can cover at most this many zones.
pub const ZONE_STATE_CHUNK: u16 = 168;

/// GET_AREA_FLAGS row carrying the armed/disarmed bit per area.
pub const AREA_FLAG_ARMED: u8 = 21;

// SET_EVENT_MESSAGES bitmask
pub const EVENT_DEBUG: u16 = 1;
pub const EVENT_ZONE: u16 = 1 << 1;
pub const EVENT_AREA: u16 = 1 << 2;
pub const EVENT_OUTPUT: u16 = 1 << 3;
pub const EVENT_USER: u16 = 1 << 4;
pub const EVENT_LOG: u16 = 1 << 5;

// unsolicited message type tags
pub const MSG_DEBUG: u8 = 0;
pub const MSG_ZONEEVENT: u8 = 1;
pub const MSG_AREAEVENT: u8 = 2;
pub const MSG_OUTPUTEVENT: u8 = 3;
pub const MSG_USEREVENT: u8 = 4;
pub const MSG_LOGEVENT: u8 = 5;

/// Arming preset sent as the first body byte of ARM_AREAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmingType {
    Full = 0,
    Part1 = 1,
    Part2 = 2,
    Part3 = 3,
}

pub const ZONETYPE_UNUSED: u8 = 0;

pub fn zone_type_text(zone_type: u8) -> &'static str {
    match zone_type {
        0 => "Unused",
        1 => "Entry/Exit 1",
        2 => "Entry/Exit 2",
        3 => "Interior",
        4 => "Perimeter",
        5 => "24hr Audible",
        6 => "24hr Silent",
        7 => "Audible PA",
        8 => "Silent PA",
        9 => "Fire Alarm",
        10 => "Medical",
        11 => "24Hr Gas Alarm",
        12 => "Auxiliary Alarm",
        13 => "24hr Tamper Alarm",
        14 => "Exit Terminator",
        15 => "Keyswitch - Momentary",
        16 => "Keyswitch - Latching",
        17 => "Security Key",
        18 => "Omit Key",
        19 => "Custom Alarm",
        20 | 21 => "Confirmed PA Audible",
        _ => "unknown",
    }
}

/// Log event type whose observation means the panel programming changed and
/// the site data must be re-enumerated.
pub const LOG_EVENT_SITE_DATA_CHANGED: u8 = 100;

pub fn log_event_text(event_type: u8) -> Option<&'static str> {
    let text = match event_type {
        1 => "Entry/Exit 1",
        2 => "Entry/Exit 2",
        3 => "Interior",
        4 => "Perimeter",
        5 => "24hr Audible",
        6 => "24hr Silent",
        7 => "Audible PA",
        8 => "Silent PA",
        9 => "Fire Alarm",
        10 => "Medical",
        11 => "24Hr Gas Alarm",
        12 => "Auxiliary Alarm",
        13 => "24hr Tamper Alarm",
        14 => "Exit Terminator",
        15 => "Keyswitch - Momentary",
        16 => "Keyswitch - Latching",
        17 => "Security Key",
        18 => "Omit Key",
        19 => "Custom Alarm",
        20 | 21 => "Confirmed PA Audible",
        22 => "Keypad Medical",
        23 => "Keypad Fire",
        24 => "Keypad Audible PA",
        25 => "Keypad Silent PA",
        26 => "Duress Code Alarm",
        27 => "Alarm Active",
        28 => "Bell Active",
        29 => "Re-arm",
        30 => "Verified Cross Zone Alarm",
        31 => "User Code",
        32 => "Exit Started",
        33 => "Exit Error (Arming Failed)",
        34 => "Entry Started",
        35 => "Part Arm Suite",
        36 => "Armed with Line Fault",
        37 => "Open/Close (Away Armed)",
        38 => "Part Armed",
        39 => "Auto Open/Close",
        40 => "Auto Arm Deferred",
        41 => "Open After Alarm (Alarm Abort)",
        42 => "Remote Open/Close",
        43 => "Quick Arm",
        44 => "Recent Closing",
        45 => "Reset After Alarm",
        46 => "Power O/P Fault",
        47 => "AC Fail",
        48 => "Low Battery",
        49 => "System Power Up",
        50 => "Mains Over Voltage",
        51 => "Telephone Line Fault",
        52 => "Fail to Communicate",
        53 => "Download Start",
        54 => "Download End",
        55 => "Log Capacity Alert (80%)",
        56 => "Date Changed",
        57 => "Time Changed",
        58 => "Installer Programming Start",
        59 => "Installer Programming End",
        60 => "Panel Box Tamper",
        61 => "Bell Tamper",
        62 => "Auxiliary Tamper",
        63 => "Expander Tamper",
        64 => "Keypad Tamper",
        65 => "Expander Trouble (Network error)",
        66 => "Remote Keypad Trouble (Network error)",
        67 => "Fire Zone Tamper",
        68 => "Zone Tamper",
        69 => "Keypad Lockout",
        70 => "Code Tamper Alarm",
        71 => "Soak Test Alarm",
        72 => "Manual Test Transmission",
        73 => "Automatic Test Transmission",
        74 => "User Walk Test Start/End",
        75 => "NVM Defaults Loaded",
        76 => "First Knock",
        77 => "Door Access",
        78 => "Part Arm 1",
        79 => "Part Arm 2",
        80 => "Part Arm 3",
        81 => "Auto Arming Started",
        82 => "Confirmed Alarm",
        83 => "Prox Tag",
        84 => "Access Code Changed/Deleted",
        85 => "Arm Failed",
        86 => "Log Cleared",
        87 => "iD Loop Shorted",
        88 => "Communication Port",
        89 => "TAG System Exit (Batt. OK)",
        90 => "TAG System Exit (Batt. LOW)",
        91 => "TAG System Entry (Batt. OK)",
        92 => "TAG System Entry (Batt. LOW)",
        93 => "Microphone Activated",
        94 => "AV Cleared Down",
        95 => "Monitored Alarm",
        96 => "Expander Low Voltage",
        97 => "Supervision Fault",
        98 => "PA from Remote FOB",
        99 => "RF Device Low Battery",
        100 => "Site Data Changed",
        101 => "Radio Jamming",
        102 => "Test Call Passed",
        103 => "Test Call Failed",
        104 => "Zone Fault",
        105 => "Zone Masked",
        106 => "Faults Overridden",
        107 => "PSU AC Fail",
        108 => "PSU Battery Fail",
        109 => "PSU Low Output Fail",
        110 => "PSU Tamper",
        111 => "Door Access",
        112 => "CIE Reset",
        113 => "Remote Command",
        114 => "User Added",
        115 => "User Deleted",
        116 => "Confirmed PA",
        117 => "User Acknowledged",
        118 => "Power Unit Failure",
        119 => "Battery Charger Fault",
        120 => "Confirmed Intruder",
        121 => "GSM Tamper",
        122 => "Radio Config. Failure",
        _ => return None,
    };
    Some(text)
}

pub fn log_event_group_text(group_type: u8) -> Option<&'static str> {
    let text = match group_type {
        0 => "Not Reported",
        1 => "Priority Alarm",
        2 => "Priority Alarm Restore",
        3 => "Alarm",
        4 => "Restore",
        5 => "Open",
        6 => "Close",
        7 => "Bypassed",
        8 => "Unbypassed",
        9 => "Maintenance Alarm",
        10 => "Maintenance Restore",
        11 => "Tamper Alarm",
        12 => "Tamper Restore",
        13 => "Test Start",
        14 => "Test End",
        15 => "Disarmed",
        16 => "Armed",
        17 => "Tested",
        18 => "Started",
        19 => "Ended",
        20 => "Fault",
        21 => "Omitted",
        22 => "Reinstated",
        23 => "Stopped",
        24 => "Start",
        25 => "Deleted",
        26 => "Active",
        27 => "Not Used",
        28 => "Changed",
        29 => "Low Battery",
        30 => "Radio",
        31 => "Deactivated",
        32 => "Added",
        33 => "Bad Action",
        34 => "PA Timer Reset",
        35 => "PA Zone Lockout",
        _ => return None,
    };
    Some(text)
}

/// Panel text fields are fixed-width ASCII padded with NULs and may carry
/// stray non-printable bytes. NULs become spaces, runs of non-word characters
/// collapse to a single space, and the result is trimmed.
pub fn normalize_text(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode packed BCD: each nibble is a digit, any nibble above 9
/// terminates the run. Passcodes and tags are stored this way.
pub fn bcd_decode(bytes: &[u8]) -> String {
    let mut result = String::new();
    for byte in bytes {
        for val in [byte >> 4, byte & 0xF].iter() {
            if *val > 9 {
                return result;
            }
            result.push((b'0' + val) as char);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bcd_decode() {
        assert_eq!(bcd_decode(&[0x12, 0x34, 0xFF]), "1234");
        assert_eq!(bcd_decode(&[0x56, 0x7F]), "567");
        assert_eq!(bcd_decode(&[0xFF, 0xFF, 0xFF, 0xFF]), "");
        assert_eq!(bcd_decode(&[]), "");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("Front\x00Door\x00\x00\x00"), "Front Door");
        assert_eq!(normalize_text("  Kitchen -- PIR  "), "Kitchen PIR");
        assert_eq!(normalize_text("\x00\x00\x00"), "");
    }

    #[test]
    fn test_normalize_text_idempotent() {
        let once = normalize_text("Back\x00\x00Gate !!");
        assert_eq!(normalize_text(&once), once);
    }

    #[test]
    fn test_zone_type_table() {
        assert_eq!(zone_type_text(0), "Unused");
        assert_eq!(zone_type_text(9), "Fire Alarm");
        assert_eq!(zone_type_text(200), "unknown");
    }

    #[test]
    fn test_log_event_tables() {
        assert_eq!(log_event_text(100), Some("Site Data Changed"));
        assert_eq!(log_event_text(123), None);
        assert_eq!(log_event_group_text(16), Some("Armed"));
        assert_eq!(log_event_group_text(36), None);
    }
}
