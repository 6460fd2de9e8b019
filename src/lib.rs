// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! This crate provides a client for the Simple Protocol spoken by Texecom
//! Premier family alarm panels over TCP. It logs in with the UDL password,
//! enumerates the panel's areas, zones and users, then tracks state changes
//! from the panel's event stream, surfacing them through an
//! [`EventHandler`](handler::EventHandler). Arm, disarm and reset requests
//! are queued through a [`ControlHandle`](client::ControlHandle) and issued
//! from the protocol thread.
//!
//! # Examples
//! ```no_run
//! # use texecom::{client::Client, tcp};
//! # use std::time::Duration;
//!
//! # fn main() {
//!     let mut opts = tcp::Options::new("192.168.1.9", 10001);
//!     opts.connection_timeout = Some(Duration::from_secs(10));
//!     let connector = tcp::Connector::new(opts);
//!
//!     let mut client = Client::new(connector, "1234");
//!     client.set_alive_heartbeat(Duration::from_secs(300));
//!     let control = client.control_handle();
//!     // hand `control` to another thread, register an EventHandler, then:
//!     client.event_loop();
//! # }
//! ```
pub mod area;
pub mod client;
pub mod constant;
pub mod error;
pub mod event;
pub mod frame;
pub mod handler;
pub mod notify;
pub mod panel;
pub mod tcp;
pub mod transport;
pub mod user;
pub mod zone;
