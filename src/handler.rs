// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Consumer callback surface

use super::area::Area;
use super::panel::PanelShape;
use super::zone::Zone;

/// Receives state changes from the client.
///
/// Callbacks run on the protocol thread, between socket reads, and must not
/// block: the panel drops the session after about a minute of silence.
/// Entities are passed as immutable snapshots.
///
/// Every method has a no-op default, so a consumer implements only what it
/// consumes.
pub trait EventHandler {
    /// Periodic liveness signal; period set by
    /// [`Client::set_alive_heartbeat`](crate::client::Client::set_alive_heartbeat).
    fn alive(&mut self) {}

    /// A zone changed state (event or state poll).
    fn zone_event(&mut self, _zone: &Zone) {}

    /// An area changed state (event or armed-flag poll).
    fn area_event(&mut self, _area: &Area) {}

    /// A used zone was enumerated during topology load.
    fn zone_details(&mut self, _zone: &Zone, _panel: &PanelShape) {}

    /// An area was enumerated during topology load.
    fn area_details(&mut self, _area: &Area, _panel: &PanelShape) {}

    /// A decoded line for every unsolicited panel message, including the
    /// kinds with no richer callback (debug, output, user, log).
    fn log_event(&mut self, _message: &str) {}
}

/// Discards every event.
pub struct NullHandler;

impl EventHandler for NullHandler {}
