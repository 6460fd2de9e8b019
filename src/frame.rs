// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Simple Protocol frame codec
//!
//! A frame is `'t' | TYPE | LEN | SEQ | body... | CRC8`. LEN counts the
//! whole frame including the trailing CRC. The CRC is polynomial 0x185,
//! initial value 0xFF, non-reflected, over everything before the CRC byte.

use log::{debug, warn};

use super::error::Error;
use super::transport::Transport;

pub const HEADER_START: u8 = b't';
pub const HEADER_LENGTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Command,
    Response,
    Message,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<FrameKind> {
        match b {
            b'C' => Some(FrameKind::Command),
            b'R' => Some(FrameKind::Response),
            b'M' => Some(FrameKind::Message),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Command => b'C',
            FrameKind::Response => b'R',
            FrameKind::Message => b'M',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u8,
    pub payload: Vec<u8>,
}

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x85;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Frame a body (command id plus its arguments) for the wire.
/// LEN = body length + 5: header, body and CRC.
pub fn encode(kind: FrameKind, seq: u8, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + HEADER_LENGTH + 1);
    data.push(HEADER_START);
    data.push(kind.to_byte());
    data.push((body.len() + 5) as u8);
    data.push(seq);
    data.extend_from_slice(body);
    data.push(crc8(&data));
    data
}

/// Read one frame from the transport.
///
/// `Ok(None)` is a soft discard (short header, short payload, CRC mismatch):
/// the caller keeps receiving and lets the command timeout drive a retry.
/// Hard faults - the `+++`/`+++A` hangup sentinels, a closed connection, a
/// bad start byte - come back as errors and cost the session.
pub fn read<T: Transport>(transport: &mut T) -> Result<Option<Frame>, Error> {
    let header = transport.recv(HEADER_LENGTH)?;
    if header == b"+++" {
        return Err(Error::SessionDropped);
    }
    if header == b"+++A" {
        return Err(Error::ModemHangup);
    }
    if header.is_empty() {
        return Err(Error::Closed);
    }
    if header.len() < HEADER_LENGTH {
        warn!(
            "header received from panel is too short, only {} bytes, ignoring - contents: {}",
            header.len(),
            hex::encode(&header)
        );
        return Ok(None);
    }
    if header[0] != HEADER_START {
        return Err(Error::BadStart(header[0]));
    }
    let kind = match FrameKind::from_byte(header[1]) {
        Some(kind) => kind,
        None => {
            warn!("unknown frame type {:#04x}, ignoring", header[1]);
            return Ok(None);
        }
    };
    let length = header[2] as usize;
    let seq = header[3];
    if length < HEADER_LENGTH + 1 {
        warn!("frame length {} too small, ignoring", length);
        return Ok(None);
    }

    let expected = length - HEADER_LENGTH;
    let mut tail = transport.recv(expected)?;
    if tail.len() < expected {
        warn!(
            "ignoring message, payload shorter than expected - got {} bytes, expected {}",
            tail.len(),
            expected
        );
        debug!("header: {} payload: {}", hex::encode(&header), hex::encode(&tail));
        return Ok(None);
    }
    let crc = match tail.pop() {
        Some(crc) => crc,
        None => return Ok(None),
    };

    let mut checked = Vec::with_capacity(header.len() + tail.len());
    checked.extend_from_slice(&header);
    checked.extend_from_slice(&tail);
    let expected_crc = crc8(&checked);
    if crc != expected_crc {
        warn!("crc: expected={} actual={}", expected_crc, crc);
        return Ok(None);
    }

    Ok(Some(Frame {
        kind,
        seq,
        payload: tail,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Serves scripted chunks; empty script reads as a closed connection.
    struct ByteStream {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ByteStream {
        fn new(chunks: Vec<Vec<u8>>) -> ByteStream {
            ByteStream {
                chunks: chunks.into_iter().collect(),
            }
        }

        fn from_frame(data: &[u8]) -> ByteStream {
            ByteStream::new(vec![
                data[..HEADER_LENGTH].to_vec(),
                data[HEADER_LENGTH..].to_vec(),
            ])
        }
    }

    impl Transport for ByteStream {
        fn send(&mut self, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }

        fn recv(&mut self, max: usize) -> Result<Vec<u8>, Error> {
            match self.chunks.pop_front() {
                Some(mut chunk) => {
                    if chunk.len() > max {
                        let rest = chunk.split_off(max);
                        self.chunks.push_front(rest);
                    }
                    Ok(chunk)
                }
                None => Ok(Vec::new()),
            }
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_encode_round_trip() {
        let data = encode(FrameKind::Command, 7, &[2, 1, 8]);
        assert_eq!(data[0], b't');
        assert_eq!(data[1], b'C');
        assert_eq!(data[2], 8); // 3-byte body + 5
        assert_eq!(data[3], 7);

        let mut stream = ByteStream::from_frame(&data);
        let frame = read(&mut stream).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Command);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.payload, vec![2, 1, 8]);

        // re-encoding the decoded frame reproduces the original bytes
        assert_eq!(encode(frame.kind, frame.seq, &frame.payload), data);
    }

    #[test]
    fn test_crc_mismatch_is_soft_discard() {
        let mut data = encode(FrameKind::Response, 3, &[1, 0x06]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let mut stream = ByteStream::from_frame(&data);
        assert!(read(&mut stream).unwrap().is_none());
    }

    #[test]
    fn test_hangup_sentinels() {
        let mut stream = ByteStream::new(vec![b"+++".to_vec()]);
        match read(&mut stream) {
            Err(Error::SessionDropped) => {}
            other => panic!("expected SessionDropped, got {:?}", other),
        }

        let mut stream = ByteStream::new(vec![b"+++A".to_vec()]);
        match read(&mut stream) {
            Err(Error::ModemHangup) => {}
            other => panic!("expected ModemHangup, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_connection() {
        let mut stream = ByteStream::new(vec![]);
        match read(&mut stream) {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_start_byte() {
        let mut stream = ByteStream::new(vec![vec![b'x', b'R', 6, 0]]);
        match read(&mut stream) {
            Err(Error::BadStart(b'x')) => {}
            other => panic!("expected BadStart, got {:?}", other),
        }
    }

    #[test]
    fn test_short_header_ignored() {
        let mut stream = ByteStream::new(vec![vec![b't', b'R'], b"+++".to_vec()]);
        assert!(read(&mut stream).unwrap().is_none());
    }

    #[test]
    fn test_crc_known_frame() {
        // CRC over the login command for password "1234", seq 0
        let data = encode(FrameKind::Command, 0, b"\x011234");
        let body_len = data.len() - 1;
        assert_eq!(data[body_len], crc8(&data[..body_len]));
        // a one-bit change in the body must change the crc
        let mut flipped = data[..body_len].to_vec();
        flipped[4] ^= 1;
        assert_ne!(crc8(&flipped), data[body_len]);
    }
}
