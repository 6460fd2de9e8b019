// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

use std::error;
use std::fmt;
use std::io::{Error as IOError, ErrorKind};

#[derive(Debug)]
pub enum Error {
    /// Establishing the TCP session failed.
    Connect(String),
    IOError(ErrorKind),
    /// No response arrived within the command timeout (or the retry
    /// budget for the current command is exhausted).
    Timeout,
    /// The panel closed the connection (zero-length read).
    Closed,
    /// The panel sent `+++`: it dropped the session, usually for inactivity.
    SessionDropped,
    /// The panel sent `+++A`: a modem hangup, usually because we
    /// reconnected too quickly after the last session.
    ModemHangup,
    /// A frame began with something other than the `t` start byte.
    BadStart(u8),
    /// A command frame arrived from the panel; only we send commands.
    UnexpectedCommand,
    /// The response carried a different command id than the one in flight.
    WrongCommandId { expected: u8, actual: u8 },
    /// A response payload had the wrong size for its command.
    ResponseLength {
        command: u8,
        expected: usize,
        actual: usize,
    },
    /// The panel NAKed a command that answers with ACK/NAK.
    Nak,
    /// An ACK/NAK command returned neither.
    UnexpectedAck(Vec<u8>),
    /// A mid-session `LOGIN` NAK: the panel timed our session out and the
    /// connection must be restarted.
    LoginTimedOut,
    /// The panel identification string could not be parsed into a size table
    /// row. Guessing a shape would corrupt every later decode.
    Identification(String),
    NotConnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Connect(s) => write!(f, "connection error: {}", s),
            Error::IOError(kind) => write!(f, "IO error: {:?}", kind),
            Error::Timeout => write!(f, "timed out waiting for panel response"),
            Error::Closed => write!(f, "panel has closed connection"),
            Error::SessionDropped => {
                write!(f, "panel has forcibly dropped connection (inactivity)")
            }
            Error::ModemHangup => write!(
                f,
                "panel is trying to hangup modem; probably connected too soon"
            ),
            Error::BadStart(b) => write!(f, "unexpected msg start: {:#04x}", b),
            Error::UnexpectedCommand => write!(f, "received command frame unexpectedly"),
            Error::WrongCommandId { expected, actual } => write!(
                f,
                "got response for wrong command id: expected {:#04x}, got {:#04x}",
                expected, actual
            ),
            Error::ResponseLength {
                command,
                expected,
                actual,
            } => write!(
                f,
                "command {:#04x}: response wrong length: {}/{}",
                command, actual, expected
            ),
            Error::Nak => write!(f, "NAK response from panel"),
            Error::UnexpectedAck(payload) => {
                write!(f, "unexpected ack payload: 0x{}", hex::encode(payload))
            }
            Error::LoginTimedOut => write!(
                f,
                "received 'Log on NAK' from panel - session has timed out and needs to be restarted"
            ),
            Error::Identification(s) => {
                write!(f, "cannot derive panel size from identification {:?}", s)
            }
            Error::NotConnected => write!(f, "client not connected"),
        }
    }
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Self {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
            kind => Error::IOError(kind),
        }
    }
}

// This is important for other errors to wrap this one.
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}
