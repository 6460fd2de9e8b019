// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Transport seam between the protocol engine and the wire

use super::error::Error;

/// An established byte stream to the panel.
///
/// ## How can I implement `Transport`?
///
/// `recv` must mirror socket semantics: return up to `max` bytes, an empty
/// buffer when the peer has closed, and `Error::Timeout` when the read
/// timeout elapses. The read timeout drives the whole command engine, so an
/// implementation without one will hang the client.
pub trait Transport {
    /// Send raw frame bytes to the panel.
    fn send(&mut self, data: &[u8]) -> Result<(), Error>;
    /// Receive up to `max` bytes. An empty result means the peer closed.
    fn recv(&mut self, max: usize) -> Result<Vec<u8>, Error>;
    /// Best-effort shutdown; errors are ignored.
    fn close(&mut self);
}

/// Opens a fresh [`Transport`] for each panel session. The client
/// reconnects for the life of the process, so it holds a connector rather
/// than a single stream.
pub trait Connect {
    type Stream: Transport;

    fn open(&self) -> Result<Self::Stream, Error>;
}
