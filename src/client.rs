// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! The protocol engine: command send/receive, unsolicited event dispatch,
//! topology enumeration, idle probing and the reconnecting main loop.

use std::collections::{BTreeMap, VecDeque};
use std::convert::TryFrom;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Local, NaiveDate};
use log::{debug, info, warn};

use super::area::{Area, AreaState};
use super::constant::{self, ArmingType};
use super::error::Error;
use super::event::{self, Message};
use super::frame::{self, FrameKind};
use super::handler::{EventHandler, NullHandler};
use super::notify::{Notifier, NullNotifier};
use super::panel::PanelShape;
use super::transport::{Connect, Transport};
use super::user::User;
use super::zone::Zone;

/// An externally requested panel operation, queued for the protocol thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Arm { arming: ArmingType, areas: Vec<u8> },
    Disarm { areas: Vec<u8> },
    Reset { areas: Vec<u8> },
}

/// Clone-able producer side of the arm/disarm/reset queue. Requests are
/// drained by the protocol thread in FIFO order, only while no command is
/// in flight, so pushing from another thread (an MQTT callback, say) is
/// safe.
#[derive(Clone, Default)]
pub struct ControlHandle {
    queue: Arc<Mutex<VecDeque<ControlRequest>>>,
}

impl ControlHandle {
    pub fn request_arm(&self, area_bitmap: &[u8]) {
        self.push(ControlRequest::Arm {
            arming: ArmingType::Full,
            areas: area_bitmap.to_vec(),
        });
    }

    pub fn request_part_arm(&self, area_bitmap: &[u8]) {
        self.push(ControlRequest::Arm {
            arming: ArmingType::Part1,
            areas: area_bitmap.to_vec(),
        });
    }

    pub fn request_disarm(&self, area_bitmap: &[u8]) {
        self.push(ControlRequest::Disarm {
            areas: area_bitmap.to_vec(),
        });
    }

    pub fn request_reset(&self, area_bitmap: &[u8]) {
        self.push(ControlRequest::Reset {
            areas: area_bitmap.to_vec(),
        });
    }

    fn push(&self, request: ControlRequest) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(request);
        }
    }

    fn pop(&self) -> Option<ControlRequest> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop_front())
    }
}

/// Battery and supply readings from GET_SYSTEM_POWER.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemPower {
    pub system_voltage: f64,
    pub battery_voltage: f64,
    pub system_current: u32,
    pub battery_current: u32,
}

/// Client for one Texecom Premier panel.
///
/// Single-threaded and cooperative around a blocking socket: all waiting
/// happens inside the 2-second read timeout, which also drives command
/// retries, idle probes and the heartbeat. [`event_loop`](Client::event_loop)
/// runs forever, reconnecting as needed; other threads interact only
/// through a [`ControlHandle`] and the registered [`EventHandler`].
pub struct Client<C: Connect> {
    connector: C,
    stream: Option<C::Stream>,
    udl_password: Vec<u8>,

    next_seq: u8,
    last_sequence: u8,
    last_received_seq: Option<u8>,
    last_command: Option<Vec<u8>>,
    last_command_time: Instant,

    time_last_heartbeat: Instant,
    alive_heartbeat: Duration,
    zone_probe_next: bool,

    shape: Option<PanelShape>,
    zones: BTreeMap<u16, Zone>,
    areas: BTreeMap<u8, Area>,
    users: BTreeMap<u16, User>,
    highest_used_zone: u16,
    site_data_changed: bool,

    queue: ControlHandle,
    handler: Box<dyn EventHandler>,
    notifier: Box<dyn Notifier>,
    request_output_events: bool,
}

impl<C: Connect> Client<C> {
    pub fn new(connector: C, udl_password: &str) -> Client<C> {
        Client {
            connector,
            stream: None,
            udl_password: udl_password.as_bytes().to_vec(),
            next_seq: 0,
            last_sequence: 0,
            last_received_seq: None,
            last_command: None,
            last_command_time: Instant::now(),
            time_last_heartbeat: Instant::now(),
            alive_heartbeat: constant::DEFAULT_ALIVE_HEARTBEAT,
            zone_probe_next: true,
            shape: None,
            zones: BTreeMap::new(),
            areas: BTreeMap::new(),
            users: BTreeMap::new(),
            highest_used_zone: 0,
            site_data_changed: false,
            queue: ControlHandle::default(),
            handler: Box::new(NullHandler),
            notifier: Box::new(NullNotifier),
            request_output_events: true,
        }
    }

    pub fn set_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = handler;
    }

    pub fn set_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.notifier = notifier;
    }

    /// Ask the panel for output events too when enabling event reporting.
    pub fn enable_output_events(&mut self, enable: bool) {
        self.request_output_events = enable;
    }

    pub fn set_alive_heartbeat(&mut self, period: Duration) {
        self.alive_heartbeat = period;
    }

    /// Producer handle for arm/disarm/reset requests; hand this to the
    /// consumer thread.
    pub fn control_handle(&self) -> ControlHandle {
        self.queue.clone()
    }

    pub fn panel_shape(&self) -> Option<&PanelShape> {
        self.shape.as_ref()
    }

    pub fn zones(&self) -> &BTreeMap<u16, Zone> {
        &self.zones
    }

    pub fn areas(&self) -> &BTreeMap<u8, Area> {
        &self.areas
    }

    pub fn users(&self) -> &BTreeMap<u16, User> {
        &self.users
    }

    // ## Connection lifecycle

    pub fn connect(&mut self) -> Result<(), Error> {
        self.stream = Some(self.connector.open()?);
        self.last_command_time = Instant::now();
        self.last_received_seq = None;
        Ok(())
    }

    fn close_socket(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    /// Outer reconnection loop plus inner per-session loop; never returns.
    /// Signal handling is the caller's business.
    pub fn event_loop(&mut self) {
        let mut last_connected_at = Instant::now();
        let mut notified_connection_loss = false;
        let mut connected = false;
        loop {
            if connected {
                last_connected_at = Instant::now();
                connected = false;
                notified_connection_loss = false;
                info!("connection lost");
            }
            if last_connected_at.elapsed() >= constant::CONNECTION_LOSS_NOTIFY_AFTER
                && !notified_connection_loss
            {
                info!("connection lost for over 60 seconds - notifying");
                self.notifier.connection_lost();
                notified_connection_loss = true;
            }
            if let Err(e) = self.connect() {
                warn!("connect failed - {}; sleeping for 5 seconds", e);
                thread::sleep(constant::RECONNECT_DELAY);
                continue;
            }
            if let Err(e) = self.login() {
                warn!(
                    "login failed ({}) - udl password incorrect, pre-v4 panel, or trying to \
                     connect too soon: closing socket, trying again in 5 seconds",
                    e
                );
                thread::sleep(constant::RECONNECT_DELAY);
                self.close_socket();
                continue;
            }
            info!("login successful");
            if let Err(e) = self.set_event_messages() {
                warn!("set event messages failed ({}), closing socket", e);
                self.close_socket();
                continue;
            }
            connected = true;
            if notified_connection_loss {
                info!("connection regained - notifying");
                self.notifier.connection_regained();
            }
            if let Err(e) = self.load_panel() {
                warn!("loading panel state failed ({}), closing socket", e);
                self.close_socket();
                continue;
            }
            info!("got all areas/zones/users; waiting for events");
            while self.stream.is_some() {
                for zone in self.zones.values_mut() {
                    zone.tick();
                }
                if self.site_data_changed {
                    self.site_data_changed = false;
                    if let Err(e) = self.load_site_data() {
                        warn!("reloading site data failed ({}), closing socket", e);
                        self.close_socket();
                        break;
                    }
                }
                match self.recv_response() {
                    // a response with no command in flight is stale; drop it
                    Ok(_) => {}
                    // we didn't send any command, so a timeout is the
                    // expected result
                    Err(Error::Timeout) => {}
                    Err(e) => {
                        debug!("session ended: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // ## Command engine

    /// Send one command and wait for its response payload, dispatching any
    /// unsolicited messages that arrive first. On timeout the identical
    /// bytes are resent (same sequence number) up to the retry budget.
    fn send_command(&mut self, cmd: u8, body: &[u8]) -> Result<Vec<u8>, Error> {
        let mut framed = Vec::with_capacity(body.len() + 1);
        framed.push(cmd);
        framed.extend_from_slice(body);
        self.send_command_body(&framed)?;
        self.last_command_time = Instant::now();

        let mut response = None;
        for _ in 0..constant::CMD_RETRIES {
            match self.recv_response() {
                Ok(payload) => {
                    response = Some(payload);
                    break;
                }
                Err(Error::Timeout) => {
                    let data = match &self.last_command {
                        Some(data) => data.clone(),
                        None => break,
                    };
                    warn!("timeout waiting for response, resending last command");
                    self.last_command_time = Instant::now();
                    match self.stream.as_mut() {
                        Some(stream) => stream.send(&data)?,
                        None => break,
                    }
                }
                Err(e) => {
                    self.last_command = None;
                    return Err(e);
                }
            }
        }
        self.last_command = None;
        let response = response.ok_or(Error::Timeout)?;

        let command_id = match response.first() {
            Some(id) => *id,
            None => {
                return Err(Error::ResponseLength {
                    command: cmd,
                    expected: 1,
                    actual: 0,
                })
            }
        };
        let payload = &response[1..];
        if command_id != cmd {
            if command_id == constant::CMD_LOGIN
                && payload.first() == Some(&constant::CMD_RESPONSE_NAK)
            {
                warn!("{}", Error::LoginTimedOut);
                return Err(Error::LoginTimedOut);
            }
            warn!(
                "got response for wrong command id: expected {:#04x}, got {:#04x}; payload: 0x{}",
                cmd,
                command_id,
                hex::encode(payload)
            );
            return Err(Error::WrongCommandId {
                expected: cmd,
                actual: command_id,
            });
        }
        Ok(payload.to_vec())
    }

    fn send_command_body(&mut self, body: &[u8]) -> Result<(), Error> {
        self.last_sequence = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let data = frame::encode(FrameKind::Command, self.last_sequence, body);
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream.send(&data)?;
        self.last_command = Some(data);
        Ok(())
    }

    /// Receive until a response to the outstanding command arrives.
    /// Unsolicited messages are dispatched along the way; when no command
    /// is outstanding this is also where queued control requests drain and
    /// idle probes run.
    fn recv_response(&mut self) -> Result<Vec<u8>, Error> {
        let start = Instant::now();
        loop {
            // a run of event messages can keep the socket busy past the
            // command deadline without any single read timing out
            if start.elapsed() > constant::CMD_TIMEOUT {
                return Err(Error::Timeout);
            }
            if self.last_command.is_none() {
                if let Some(request) = self.queue.pop() {
                    self.apply_control(request)?;
                } else if self.last_command_time.elapsed() > constant::IDLE_PROBE_INTERVAL {
                    if let Err(e) = self.run_idle_probe() {
                        warn!("idle command failed ({}); closing socket", e);
                        self.close_socket();
                        return Err(e);
                    }
                }
            }
            if self.time_last_heartbeat.elapsed() > self.alive_heartbeat {
                self.alive();
            }

            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let frame = match frame::read(stream) {
                Ok(Some(frame)) => frame,
                // short or corrupt frame; keep waiting and let the retry
                // timer do its work
                Ok(None) => continue,
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(e) => {
                    info!("{}", e);
                    self.close_socket();
                    return Err(e);
                }
            };

            match frame.kind {
                FrameKind::Response => {
                    if frame.seq != self.last_sequence {
                        warn!(
                            "incorrect response seq: expected={} actual={}",
                            self.last_sequence, frame.seq
                        );
                        // either the correct reply is next or we time out
                        // and retry the command
                        continue;
                    }
                    return Ok(frame.payload);
                }
                FrameKind::Message => {
                    if self.note_message_seq(frame.seq) {
                        self.dispatch_message(&frame.payload);
                    }
                }
                FrameKind::Command => {
                    warn!("{}", Error::UnexpectedCommand);
                    self.close_socket();
                    return Err(Error::UnexpectedCommand);
                }
            }
        }
    }

    /// Track message sequence numbers; returns false for an outright
    /// duplicate. Gaps are logged but the message is processed anyway -
    /// perhaps we missed one or they arrived out of order.
    fn note_message_seq(&mut self, seq: u8) -> bool {
        if let Some(last) = self.last_received_seq {
            let next = last.wrapping_add(1);
            if seq == last {
                warn!(
                    "ignoring message, sequence number is the same as last message: \
                     expected={} actual={}",
                    next, seq
                );
                return false;
            }
            if seq != next {
                warn!(
                    "message seq incorrect - processing message anyway: expected={} actual={}",
                    next, seq
                );
            }
        }
        self.last_received_seq = Some(seq);
        true
    }

    fn alive(&mut self) {
        self.time_last_heartbeat = Instant::now();
        info!("alive ok");
        self.handler.alive();
    }

    // ## Idle scheduling

    /// Alternate the two idle polls. Either one refreshes state the panel
    /// may have dropped events for, and resets the panel's 60-second
    /// inactivity hangup.
    fn run_idle_probe(&mut self) -> Result<(), Error> {
        let zone_probe = self.zone_probe_next;
        self.zone_probe_next = !zone_probe;
        if zone_probe {
            self.refresh_changed_zones()
        } else {
            self.refresh_armed_state()
        }
    }

    fn apply_control(&mut self, request: ControlRequest) -> Result<(), Error> {
        let bitmap_len = match &self.shape {
            Some(shape) => shape.area_bitmap_len,
            None => {
                warn!("dropping control request; panel shape not known yet");
                return Ok(());
            }
        };
        let (cmd, cmd_text, body) = match &request {
            ControlRequest::Arm { arming, areas } => {
                let mut body = vec![*arming as u8];
                body.extend(areas.iter().copied().take(bitmap_len));
                let text = if *arming == ArmingType::Full {
                    "arm"
                } else {
                    "part arm"
                };
                (constant::CMD_ARMAREAS, text, body)
            }
            ControlRequest::Disarm { areas } => (
                constant::CMD_DISARMAREAS,
                "disarm",
                areas.iter().copied().take(bitmap_len).collect(),
            ),
            ControlRequest::Reset { areas } => (
                constant::CMD_RESETAREAS,
                "reset",
                areas.iter().copied().take(bitmap_len).collect(),
            ),
        };
        let payload = self.send_command(cmd, &body)?;
        match self.expect_ack(&payload) {
            Ok(()) => info!("cmd {} areas: 0x{}", cmd_text, hex::encode(&body)),
            // a refused request costs nothing; the session carries on
            Err(e) => warn!("{} request refused: {}", cmd_text, e),
        }
        Ok(())
    }

    // ## Panel commands

    fn expect_ack(&self, payload: &[u8]) -> Result<(), Error> {
        match payload {
            [byte] if *byte == constant::CMD_RESPONSE_ACK => Ok(()),
            [byte] if *byte == constant::CMD_RESPONSE_NAK => Err(Error::Nak),
            other => Err(Error::UnexpectedAck(other.to_vec())),
        }
    }

    fn length_error(&self, command: u8, expected: usize, payload: &[u8]) -> Error {
        let err = Error::ResponseLength {
            command,
            expected,
            actual: payload.len(),
        };
        warn!("{}; payload: 0x{}", err, hex::encode(payload));
        err
    }

    pub fn login(&mut self) -> Result<(), Error> {
        let udl = self.udl_password.clone();
        let payload = self.send_command(constant::CMD_LOGIN, &udl)?;
        self.expect_ack(&payload)
    }

    /// Tell the panel which unsolicited message kinds to send.
    pub fn set_event_messages(&mut self) -> Result<(), Error> {
        let mut events = constant::EVENT_ZONE
            | constant::EVENT_AREA
            | constant::EVENT_USER
            | constant::EVENT_LOG;
        if self.request_output_events {
            events |= constant::EVENT_OUTPUT;
        }
        let payload = self.send_command(constant::CMD_SETEVENTMESSAGES, &events.to_le_bytes())?;
        self.expect_ack(&payload)
    }

    pub fn get_panel_identification(&mut self) -> Result<String, Error> {
        let payload = self.send_command(constant::CMD_GETPANELIDENTIFICATION, &[])?;
        if payload.len() != 32 {
            return Err(self.length_error(constant::CMD_GETPANELIDENTIFICATION, 32, &payload));
        }
        let idstr = String::from_utf8_lossy(&payload).into_owned();
        info!("panel identification: {}", idstr.trim_end());
        Ok(idstr)
    }

    pub fn get_date_time(&mut self) -> Result<String, Error> {
        let payload = self.send_command(constant::CMD_GETDATETIME, &[])?;
        if payload.len() < 6 {
            return Err(self.length_error(constant::CMD_GETDATETIME, 6, &payload));
        }
        let text = format!(
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
            payload[2], payload[1], payload[0], payload[3], payload[4], payload[5]
        );
        let panel_time = NaiveDate::from_ymd_opt(
            2000 + payload[2] as i32,
            payload[1] as u32,
            payload[0] as u32,
        )
        .and_then(|date| {
            date.and_hms_opt(payload[3] as u32, payload[4] as u32, payload[5] as u32)
        });
        match panel_time {
            Some(panel_time) => {
                let drift = panel_time
                    .signed_duration_since(Local::now().naive_local())
                    .num_seconds();
                if drift > 0 {
                    info!("panel date/time: {} (panel is ahead by {} seconds)", text, drift);
                } else {
                    info!("panel date/time: {} (panel is behind by {} seconds)", text, -drift);
                }
            }
            None => warn!("panel date/time is not a valid calendar date: {}", text),
        }
        Ok(text)
    }

    pub fn get_system_power(&mut self) -> Result<SystemPower, Error> {
        let payload = self.send_command(constant::CMD_GETSYSTEMPOWER, &[])?;
        if payload.len() != 5 {
            return Err(self.length_error(constant::CMD_GETSYSTEMPOWER, 5, &payload));
        }
        let ref_v = payload[0] as f64;
        let power = SystemPower {
            system_voltage: 13.7 + (payload[1] as f64 - ref_v) * 0.070,
            battery_voltage: 13.7 + (payload[2] as f64 - ref_v) * 0.070,
            system_current: payload[3] as u32 * 9,
            battery_current: payload[4] as u32 * 9,
        };
        info!(
            "system power: system voltage {:.2} battery voltage {:.2} system current {} \
             battery current {}",
            power.system_voltage, power.battery_voltage, power.system_current,
            power.battery_current
        );
        Ok(power)
    }

    pub fn get_log_pointer(&mut self) -> Result<u16, Error> {
        let payload = self.send_command(constant::CMD_GETLOGPOINTER, &[])?;
        if payload.len() != 2 {
            return Err(self.length_error(constant::CMD_GETLOGPOINTER, 2, &payload));
        }
        let pointer = LittleEndian::read_u16(&payload);
        info!("log pointer: {}", pointer);
        Ok(pointer)
    }

    pub fn get_lcd_display(&mut self) -> Result<String, Error> {
        let payload = self.send_command(constant::CMD_GETLCDDISPLAY, &[])?;
        if payload.len() != 32 {
            return Err(self.length_error(constant::CMD_GETLCDDISPLAY, 32, &payload));
        }
        let display = String::from_utf8_lossy(&payload).into_owned();
        info!("panel LCD display: {}", display);
        Ok(display)
    }

    pub fn get_system_flags(&mut self) -> Result<Vec<u8>, Error> {
        let payload = self.send_command(constant::CMD_GETSYSTEMFLAGS, &[])?;
        if payload.len() != 8 {
            return Err(self.length_error(constant::CMD_GETSYSTEMFLAGS, 8, &payload));
        }
        for (idx, flags) in payload.iter().enumerate() {
            info!("systemFlags {}: {}", idx, flags);
        }
        Ok(payload)
    }

    /// Fetch one user record. `Ok(None)` means the record layout was not
    /// the 23-byte form we can decode; the slot is skipped.
    pub fn get_user(&mut self, number: u16) -> Result<Option<User>, Error> {
        let body = self.require_shape()?.encode_zone_num(number);
        let payload = self.send_command(constant::CMD_GETUSER, &body)?;
        match User::from_record(&payload) {
            Ok(user) => {
                if user.valid() {
                    info!("user {} name '{}'", number, user.name);
                }
                Ok(Some(user))
            }
            Err(e) => {
                warn!("GETUSER: {}; payload: 0x{}", e, hex::encode(&payload));
                Ok(None)
            }
        }
    }

    pub fn get_area_details(&mut self, number: u8) -> Result<(), Error> {
        let payload = self.send_command(constant::CMD_GETAREADETAILS, &[number])?;
        if payload.len() != 25 {
            return Err(self.length_error(constant::CMD_GETAREADETAILS, 25, &payload));
        }
        // first byte is the area number
        let text = constant::normalize_text(&String::from_utf8_lossy(&payload[1..17]));
        let area = self.areas.entry(number).or_insert_with(|| Area::new(number));
        if !text.is_empty() {
            area.text = text;
        }
        area.exit_delay = LittleEndian::read_u16(&payload[17..19]);
        area.entry1_delay = LittleEndian::read_u16(&payload[19..21]);
        area.entry2_delay = LittleEndian::read_u16(&payload[21..23]);
        area.second_entry = LittleEndian::read_u16(&payload[23..25]);
        info!(
            "area {} text '{}' exitDelay {} entry1 {} entry2 {} secondEntry {}",
            number, area.text, area.exit_delay, area.entry1_delay, area.entry2_delay,
            area.second_entry
        );
        if let Some(shape) = &self.shape {
            self.handler.area_details(area, shape);
        }
        Ok(())
    }

    pub fn get_zone_details(&mut self, number: u16) -> Result<(), Error> {
        let (body, bitmap_len) = {
            let shape = self.require_shape()?;
            (shape.encode_zone_num(number), shape.area_bitmap_len)
        };
        let payload = self.send_command(constant::CMD_GETZONEDETAILS, &body)?;
        if payload.len() != 33 + bitmap_len {
            return Err(self.length_error(constant::CMD_GETZONEDETAILS, 33 + bitmap_len, &payload));
        }
        let zone = self.zones.entry(number).or_insert_with(|| Zone::new(number));
        zone.set_zone_type(payload[0]);
        zone.area_bitmap = payload[1..=bitmap_len].to_vec();
        let text = constant::normalize_text(&String::from_utf8_lossy(&payload[1 + bitmap_len..]));
        if !text.is_empty() {
            zone.text = text;
        }
        if !zone.is_unused() {
            info!("zone {} type {} name '{}'", number, zone.zone_type_text, zone.text);
            if let Some(shape) = &self.shape {
                self.handler.zone_details(zone, shape);
            }
        }
        Ok(())
    }

    /// Read state bytes for a zone range, splitting into chunks the panel
    /// accepts. State changes update the store and fire the zone callback.
    pub fn get_zone_state(&mut self, start_zone: u16, num_zones: u16) -> Result<(), Error> {
        let mut start = start_zone;
        let mut remaining = num_zones;
        while remaining > 0 {
            let chunk = remaining.min(constant::ZONE_STATE_CHUNK);
            self.get_zone_state_chunk(start, chunk)?;
            start += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    fn get_zone_state_chunk(&mut self, start_zone: u16, num_zones: u16) -> Result<(), Error> {
        let body = [(start_zone & 0xFF) as u8, (num_zones & 0xFF) as u8];
        let payload = self.send_command(constant::CMD_GETZONESTATE, &body)?;
        if payload.len() != num_zones as usize {
            return Err(self.length_error(constant::CMD_GETZONESTATE, num_zones as usize, &payload));
        }
        for (idx, new_state) in payload.iter().enumerate() {
            let number = start_zone + idx as u16;
            let zone = self.zones.entry(number).or_insert_with(|| Zone::new(number));
            if zone.is_unused() {
                continue;
            }
            if zone.status.map(|status| status.raw) == Some(*new_state) {
                continue;
            }
            zone.save_status(*new_state);
            info!("zoneState: zone {} '{}' {}", number, zone.state_text(), zone.text);
            self.handler.zone_event(zone);
        }
        Ok(())
    }

    pub fn get_zone_changes(&mut self) -> Result<Vec<u8>, Error> {
        let expected = self.require_shape()?.zone_bitmap_len;
        let payload = self.send_command(constant::CMD_GETZONECHANGES, &[])?;
        if payload.len() != expected {
            return Err(self.length_error(constant::CMD_GETZONECHANGES, expected, &payload));
        }
        Ok(payload)
    }

    /// One row of area flags per requested index, each `area_bitmap_len`
    /// bytes wide.
    pub fn get_area_flags(&mut self, start_flag: u8, num_flags: u8) -> Result<Vec<Vec<u8>>, Error> {
        let (bitmap_len, zones) = {
            let shape = self.require_shape()?;
            (shape.area_bitmap_len, shape.zones)
        };
        let num_flags = if zones == 640 && num_flags > 31 {
            31
        } else {
            num_flags
        };
        let payload = self.send_command(constant::CMD_GETAREAFLAGS, &[start_flag, num_flags])?;
        let expected = bitmap_len * num_flags as usize;
        if payload.len() != expected {
            return Err(self.length_error(constant::CMD_GETAREAFLAGS, expected, &payload));
        }
        Ok(payload.chunks(bitmap_len).map(|chunk| chunk.to_vec()).collect())
    }

    fn require_shape(&self) -> Result<&PanelShape, Error> {
        self.shape.as_ref().ok_or(Error::NotConnected)
    }

    // ## Topology loading

    /// Runs once per successful login: identification, clock, power, log
    /// pointer, then the full area/zone/user enumeration and current state.
    fn load_panel(&mut self) -> Result<(), Error> {
        let idstr = self.get_panel_identification()?;
        self.shape = Some(PanelShape::from_identification(&idstr)?);
        self.get_date_time()?;
        self.get_system_power()?;
        self.get_log_pointer()?;
        self.load_site_data()?;
        self.refresh_all_zone_state()?;
        self.refresh_armed_state()
    }

    fn load_site_data(&mut self) -> Result<(), Error> {
        self.load_all_areas()?;
        self.load_all_zones()?;
        self.load_all_users()
    }

    fn load_all_areas(&mut self) -> Result<(), Error> {
        let count = self.require_shape()?.areas;
        for number in 1..=count {
            self.get_area_details(number)?;
        }
        Ok(())
    }

    fn load_all_zones(&mut self) -> Result<(), Error> {
        let count = self.require_shape()?.zones;
        for number in 1..=count {
            self.get_zone_details(number)?;
            let used = self
                .zones
                .get(&number)
                .map(|zone| !zone.is_unused())
                .unwrap_or(false);
            if used {
                self.highest_used_zone = number;
                self.associate_zone_with_areas(number);
            } else {
                self.dissociate_zone(number);
            }
        }
        Ok(())
    }

    fn load_all_users(&mut self) -> Result<(), Error> {
        let count = self.require_shape()?.users;
        for number in 1..count {
            if let Some(user) = self.get_user(number)? {
                if user.valid() {
                    self.users.insert(number, user);
                }
            }
        }
        self.users.insert(0, User::engineer());
        Ok(())
    }

    /// Rebuild both sides of the zone/area membership from the zone's area
    /// bitmap. The two sets mirror each other.
    fn associate_zone_with_areas(&mut self, number: u16) {
        let area_count = match &self.shape {
            Some(shape) => shape.areas,
            None => return,
        };
        let (mut flags, zone_text) = match self.zones.get(&number) {
            Some(zone) => (bitmap_bits(&zone.area_bitmap), zone.text.clone()),
            None => return,
        };
        for area_number in 1..=area_count {
            let in_area = flags & 1 == 1;
            flags >>= 1;
            let area = self
                .areas
                .entry(area_number)
                .or_insert_with(|| Area::new(area_number));
            if in_area {
                area.zones.insert(number);
                let area_text = area.text.clone();
                if let Some(zone) = self.zones.get_mut(&number) {
                    zone.areas.insert(area_number);
                }
                info!(
                    "zone {} -> area {} ('{}' -> '{}')",
                    number, area_number, zone_text, area_text
                );
            } else {
                area.zones.remove(&number);
                if let Some(zone) = self.zones.get_mut(&number) {
                    zone.areas.remove(&area_number);
                }
            }
        }
    }

    /// An unused zone belongs to no area.
    fn dissociate_zone(&mut self, number: u16) {
        for area in self.areas.values_mut() {
            area.zones.remove(&number);
        }
        if let Some(zone) = self.zones.get_mut(&number) {
            zone.areas.clear();
        }
    }

    fn refresh_all_zone_state(&mut self) -> Result<(), Error> {
        if self.highest_used_zone == 0 {
            return Ok(());
        }
        self.get_zone_state(1, self.highest_used_zone)
    }

    /// Re-query state for every zone the panel flags as changed since the
    /// last poll. Covers any event messages the panel dropped.
    fn refresh_changed_zones(&mut self) -> Result<(), Error> {
        let bitmap = self.get_zone_changes()?;
        for (start, count) in changed_zone_runs(&bitmap, self.highest_used_zone) {
            self.get_zone_state(start, count)?;
        }
        Ok(())
    }

    fn refresh_armed_state(&mut self) -> Result<(), Error> {
        let rows = self.get_area_flags(constant::AREA_FLAG_ARMED, 1)?;
        if let Some(row) = rows.into_iter().next() {
            self.save_areas_armed_state(&row, AreaState::Armed);
        }
        Ok(())
    }

    /// Reconcile area states against an armed-area bitmap. The flags are
    /// binary armed/disarmed, so a part-armed area is never downgraded to
    /// plain armed; any interim state self-corrects on the next event.
    fn save_areas_armed_state(&mut self, area_bitmap: &[u8], state_when_set: AreaState) {
        let area_count = match &self.shape {
            Some(shape) => shape.areas,
            None => return,
        };
        let mut flags = bitmap_bits(area_bitmap);
        for number in 1..=area_count {
            let bit = flags & 1 == 1;
            flags >>= 1;
            let area = self.areas.entry(number).or_insert_with(|| Area::new(number));
            let new_state = if bit {
                state_when_set
            } else {
                area.state.unwrap_or(AreaState::Disarmed)
            };
            let part_arm_clobber =
                area.state == Some(AreaState::PartArmed) && new_state == AreaState::Armed;
            if area.state != Some(new_state) && !part_arm_clobber {
                area.save_state(new_state);
                info!(
                    "areaState {} '{}': {} {}",
                    number,
                    area.text,
                    u8::from(new_state),
                    area.state_text()
                );
                self.handler.area_event(area);
            }
        }
    }

    // ## Event dispatch

    /// Decode one unsolicited message, update the entity store, fire the
    /// matching callback and log the human-readable line.
    fn dispatch_message(&mut self, payload: &[u8]) {
        let message = match event::parse(payload) {
            Some(message) => message,
            None => {
                warn!("unknown message payload: 0x{}", hex::encode(payload));
                return;
            }
        };
        let line = match message {
            Message::Debug(text) => format!("Debug message: {}", text),
            Message::Zone { zone: number, status } => {
                let zone = self.zones.entry(number).or_insert_with(|| Zone::new(number));
                zone.save_status(status);
                let line = format!(
                    "Zone event: zone {} '{}' {}",
                    zone.number,
                    zone.state_text(),
                    zone.text
                );
                self.handler.zone_event(zone);
                line
            }
            Message::Area { area: number, state } => {
                let state = match AreaState::try_from(state) {
                    Ok(state) => state,
                    Err(_) => {
                        warn!("unknown area state {} for area {}", state, number);
                        return;
                    }
                };
                let area = self.areas.entry(number).or_insert_with(|| Area::new(number));
                area.save_state(state);
                let line = format!(
                    "Area event: area {} {} {}",
                    area.number,
                    area.state_text(),
                    area.text
                );
                self.handler.area_event(area);
                line
            }
            Message::Output { location, state } => format!(
                "Output event message: location {}['{}'] now {:#04x}",
                location,
                event::output_location_text(location),
                state
            ),
            Message::User { user, state } => {
                let name = self
                    .users
                    .get(&(user as u16))
                    .map(|user| user.name.as_str())
                    .unwrap_or("unknown");
                format!(
                    "User event message: logon by user '{}' {} {}",
                    name,
                    user,
                    event::user_state_text(state)
                )
            }
            Message::Log(log_event) => {
                if log_event.event_type == constant::LOG_EVENT_SITE_DATA_CHANGED {
                    // panel programming changed under us; reload topology
                    // from the main loop
                    self.site_data_changed = true;
                }
                format!(
                    "Log event message: {} {}, {} parameter: {} areas: {}",
                    log_event.timestamp,
                    log_event.event_text(),
                    log_event.group_text(),
                    log_event.parameter,
                    log_event.areas
                )
            }
        };
        info!("{}", line);
        self.handler.log_event(&line);
    }
}

/// Fold a little-endian bitmap into one bit word; bit 0 is zone/area 1.
fn bitmap_bits(bitmap: &[u8]) -> u64 {
    let mut bits = 0u64;
    for (i, byte) in bitmap.iter().enumerate().take(8) {
        bits |= (*byte as u64) << (8 * i);
    }
    bits
}

/// Contiguous runs of set bits in a changed-zones bitmap, as
/// `(first_zone, count)` blocks no larger than one zone-state request.
fn changed_zone_runs(bitmap: &[u8], highest_zone: u16) -> Vec<(u16, u16)> {
    let mut runs = Vec::new();
    let mut start = 0u16;
    let mut len = 0u16;
    for zone in 1..=highest_zone {
        let idx = (zone - 1) as usize;
        let set = bitmap
            .get(idx / 8)
            .map(|byte| (byte >> (idx % 8)) & 1 == 1)
            .unwrap_or(false);
        if set {
            if start == 0 {
                start = zone;
                len = 0;
            }
            len += 1;
            if len == constant::ZONE_STATE_CHUNK {
                runs.push((start, len));
                start = 0;
                len = 0;
            }
        } else if start != 0 {
            runs.push((start, len));
            start = 0;
            len = 0;
        }
    }
    if start != 0 {
        runs.push((start, len));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::cell::RefCell;
    use std::rc::Rc;

    type SharedScript = Rc<RefCell<Script>>;
    type SharedEvents = Rc<RefCell<Vec<String>>>;

    enum Action {
        Chunk(Vec<u8>),
        Timeout,
    }

    #[derive(Default)]
    struct Script {
        actions: VecDeque<Action>,
        sent: Vec<Vec<u8>>,
    }

    struct TestStream {
        script: SharedScript,
    }

    impl Transport for TestStream {
        fn send(&mut self, data: &[u8]) -> Result<(), Error> {
            self.script.borrow_mut().sent.push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, max: usize) -> Result<Vec<u8>, Error> {
            let mut script = self.script.borrow_mut();
            match script.actions.pop_front() {
                Some(Action::Chunk(mut chunk)) => {
                    if chunk.len() > max {
                        let rest = chunk.split_off(max);
                        script.actions.push_front(Action::Chunk(rest));
                    }
                    Ok(chunk)
                }
                // nothing scripted: behave like a silent panel
                Some(Action::Timeout) | None => Err(Error::Timeout),
            }
        }

        fn close(&mut self) {}
    }

    struct TestConnect {
        script: SharedScript,
    }

    impl Connect for TestConnect {
        type Stream = TestStream;

        fn open(&self) -> Result<TestStream, Error> {
            Ok(TestStream {
                script: Rc::clone(&self.script),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl EventHandler for Recorder {
        fn zone_event(&mut self, zone: &Zone) {
            self.events
                .borrow_mut()
                .push(format!("zone {} {}", zone.number, zone.state_text()));
        }

        fn area_event(&mut self, area: &Area) {
            self.events
                .borrow_mut()
                .push(format!("area {} {}", area.number, area.state_text()));
        }
    }

    fn test_client() -> (Client<TestConnect>, SharedScript, SharedEvents) {
        let script = Rc::new(RefCell::new(Script::default()));
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut client = Client::new(
            TestConnect {
                script: Rc::clone(&script),
            },
            "1234",
        );
        client.set_handler(Box::new(Recorder {
            events: Rc::clone(&events),
        }));
        client.connect().unwrap();
        (client, script, events)
    }

    fn push_frame(script: &SharedScript, kind: FrameKind, seq: u8, body: &[u8]) {
        script
            .borrow_mut()
            .actions
            .push_back(Action::Chunk(frame::encode(kind, seq, body)));
    }

    fn shape_48() -> PanelShape {
        PanelShape::from_identification("Premier48 48 X V4.00").unwrap()
    }

    fn sent_frames(script: &SharedScript) -> Vec<Frame> {
        script
            .borrow()
            .sent
            .iter()
            .map(|data| Frame {
                kind: FrameKind::Command,
                seq: data[3],
                payload: data[4..data.len() - 1].to_vec(),
            })
            .collect()
    }

    #[test]
    fn test_login_ack() {
        let (mut client, script, _) = test_client();
        push_frame(&script, FrameKind::Response, 0, &[constant::CMD_LOGIN, 0x06]);
        client.login().unwrap();
        let sent = sent_frames(&script);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"\x011234");
    }

    #[test]
    fn test_login_nak() {
        let (mut client, script, _) = test_client();
        push_frame(&script, FrameKind::Response, 0, &[constant::CMD_LOGIN, 0x15]);
        match client.login() {
            Err(Error::Nak) => {}
            other => panic!("expected Nak, got {:?}", other),
        }
    }

    #[test]
    fn test_message_interleaved_with_response() {
        let (mut client, script, events) = test_client();
        // an area event lands before the response to our command
        push_frame(
            &script,
            FrameKind::Message,
            42,
            &[constant::MSG_AREAEVENT, 1, 4],
        );
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_GETZONESTATE, 0x00],
        );
        client.get_zone_state(5, 1).unwrap();

        assert_eq!(client.areas()[&1].state, Some(AreaState::PartArmed));
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(events.borrow()[0], "area 1 part armed");
        assert_eq!(client.last_received_seq, Some(42));
    }

    #[test]
    fn test_corrupt_response_is_retried_with_identical_bytes() {
        let (mut client, script, _) = test_client();
        let mut corrupt = frame::encode(FrameKind::Response, 0, &[constant::CMD_GETLOGPOINTER, 9, 0]);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        script.borrow_mut().actions.push_back(Action::Chunk(corrupt));
        script.borrow_mut().actions.push_back(Action::Timeout);
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_GETLOGPOINTER, 9, 0],
        );

        assert_eq!(client.get_log_pointer().unwrap(), 9);
        let sent = script.borrow().sent.clone();
        assert_eq!(sent.len(), 2);
        // the resend is byte-identical, sequence number included
        assert_eq!(sent[0], sent[1]);
    }

    #[test]
    fn test_mismatched_response_seq_is_skipped() {
        let (mut client, script, _) = test_client();
        push_frame(
            &script,
            FrameKind::Response,
            9,
            &[constant::CMD_GETLOGPOINTER, 1, 0],
        );
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_GETLOGPOINTER, 2, 0],
        );
        assert_eq!(client.get_log_pointer().unwrap(), 2);
    }

    #[test]
    fn test_wrong_command_id() {
        let (mut client, script, _) = test_client();
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_GETDATETIME, 1, 2, 3, 4, 5, 6],
        );
        match client.get_log_pointer() {
            Err(Error::WrongCommandId {
                expected: constant::CMD_GETLOGPOINTER,
                actual: constant::CMD_GETDATETIME,
            }) => {}
            other => panic!("expected WrongCommandId, got {:?}", other),
        }
    }

    #[test]
    fn test_mid_session_login_nak() {
        let (mut client, script, _) = test_client();
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_LOGIN, constant::CMD_RESPONSE_NAK],
        );
        match client.get_log_pointer() {
            Err(Error::LoginTimedOut) => {}
            other => panic!("expected LoginTimedOut, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_wraps_mod_256() {
        let (mut client, script, _) = test_client();
        client.next_seq = 255;
        push_frame(
            &script,
            FrameKind::Response,
            255,
            &[constant::CMD_GETLOGPOINTER, 1, 0],
        );
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_GETLOGPOINTER, 2, 0],
        );
        client.get_log_pointer().unwrap();
        client.get_log_pointer().unwrap();
        let sent = sent_frames(&script);
        assert_eq!(sent[0].seq, 255);
        assert_eq!(sent[1].seq, 0);
    }

    #[test]
    fn test_zone_state_request_is_chunked() {
        let (mut client, script, _) = test_client();
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &{
                let mut body = vec![constant::CMD_GETZONESTATE];
                body.extend(vec![0u8; 168]);
                body
            },
        );
        push_frame(
            &script,
            FrameKind::Response,
            1,
            &{
                let mut body = vec![constant::CMD_GETZONESTATE];
                body.extend(vec![0u8; 32]);
                body
            },
        );
        client.get_zone_state(1, 200).unwrap();
        let sent = sent_frames(&script);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload, [constant::CMD_GETZONESTATE, 1, 168]);
        assert_eq!(sent[1].payload, [constant::CMD_GETZONESTATE, 169, 32]);
    }

    #[test]
    fn test_changed_zone_runs_split_at_request_cap() {
        // 200 consecutive set bits starting at zone 1
        let mut bitmap = vec![0xFFu8; 25];
        for idx in 200..bitmap.len() * 8 {
            bitmap[idx / 8] &= !(1u8 << (idx % 8));
        }
        assert_eq!(changed_zone_runs(&bitmap, 640), vec![(1, 168), (169, 32)]);
    }

    #[test]
    fn test_changed_zone_runs_scattered() {
        // zones 2-3 and 6 set
        let bitmap = [0b0010_0110u8];
        assert_eq!(changed_zone_runs(&bitmap, 8), vec![(2, 2), (6, 1)]);
        // runs past highest_zone are clipped
        assert_eq!(changed_zone_runs(&bitmap, 2), vec![(2, 1)]);
    }

    #[test]
    fn test_part_armed_not_clobbered_by_armed_flag_poll() {
        let (mut client, _, events) = test_client();
        client.shape = Some(shape_48());
        client.dispatch_message(&[constant::MSG_AREAEVENT, 1, 4]);
        assert_eq!(client.areas()[&1].state, Some(AreaState::PartArmed));
        events.borrow_mut().clear();

        // the poll reports area 1 armed; part arm must survive, and areas
        // with no known state settle as disarmed
        client.save_areas_armed_state(&[0x01], AreaState::Armed);
        assert_eq!(client.areas()[&1].state, Some(AreaState::PartArmed));
        assert_eq!(client.areas()[&2].state, Some(AreaState::Disarmed));
        let events = events.borrow();
        assert!(events.iter().all(|event| !event.starts_with("area 1")));
    }

    #[test]
    fn test_armed_flag_poll_applies_plain_armed() {
        let (mut client, _, events) = test_client();
        client.shape = Some(shape_48());
        client.save_areas_armed_state(&[0x02], AreaState::Armed);
        assert_eq!(client.areas()[&2].state, Some(AreaState::Armed));
        assert!(events.borrow().iter().any(|event| event == "area 2 armed"));
    }

    #[test]
    fn test_zone_area_membership_mirrors() {
        let (mut client, _, _) = test_client();
        client.shape = Some(shape_48());
        let mut zone = Zone::new(7);
        zone.set_zone_type(3);
        zone.area_bitmap = vec![0b0000_0101]; // areas 1 and 3
        client.zones.insert(7, zone);
        client.associate_zone_with_areas(7);

        assert_eq!(
            client.zones()[&7].areas.iter().copied().collect::<Vec<_>>(),
            [1, 3]
        );
        assert!(client.areas()[&1].zones.contains(&7));
        assert!(client.areas()[&3].zones.contains(&7));
        assert!(!client.areas()[&2].zones.contains(&7));

        // membership change removes the old mirror entries
        if let Some(zone) = client.zones.get_mut(&7) {
            zone.area_bitmap = vec![0b0000_0010]; // area 2 only
        }
        client.associate_zone_with_areas(7);
        assert_eq!(
            client.zones()[&7].areas.iter().copied().collect::<Vec<_>>(),
            [2]
        );
        assert!(!client.areas()[&1].zones.contains(&7));
        assert!(client.areas()[&2].zones.contains(&7));

        // a zone that becomes unused leaves every area
        client.dissociate_zone(7);
        assert!(client.zones()[&7].areas.is_empty());
        assert!(!client.areas()[&2].zones.contains(&7));
    }

    #[test]
    fn test_duplicate_message_seq_ignored() {
        let (mut client, script, events) = test_client();
        push_frame(&script, FrameKind::Message, 5, &[constant::MSG_AREAEVENT, 1, 3]);
        push_frame(&script, FrameKind::Message, 5, &[constant::MSG_AREAEVENT, 1, 0]);
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_GETLOGPOINTER, 0, 0],
        );
        client.get_log_pointer().unwrap();
        // the duplicate seq 5 message must not have been dispatched
        assert_eq!(client.areas()[&1].state, Some(AreaState::Armed));
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(events.borrow()[0], "area 1 armed");
    }

    #[test]
    fn test_site_data_changed_log_event_sets_reload_flag() {
        let (mut client, _, _) = test_client();
        let mut payload = vec![constant::MSG_LOGEVENT, 100, 0, 0, 0];
        payload.extend_from_slice(&0u32.to_le_bytes());
        client.dispatch_message(&payload);
        assert!(client.site_data_changed);
    }

    #[test]
    fn test_queued_control_request_drains_when_idle() {
        let (mut client, script, _) = test_client();
        client.shape = Some(shape_48());
        let handle = client.control_handle();
        handle.request_arm(&[0x03]);

        // the queue is drained from the idle receive path; the arm command
        // is ACKed, then the recv times out as normal
        push_frame(
            &script,
            FrameKind::Response,
            0,
            &[constant::CMD_ARMAREAS, constant::CMD_RESPONSE_ACK],
        );
        match client.recv_response() {
            Err(Error::Timeout) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        let sent = sent_frames(&script);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].payload,
            [constant::CMD_ARMAREAS, ArmingType::Full as u8, 0x03]
        );
    }

    #[test]
    fn test_unexpected_command_frame_aborts() {
        let (mut client, script, _) = test_client();
        push_frame(&script, FrameKind::Command, 0, &[constant::CMD_LOGIN]);
        match client.recv_response() {
            Err(Error::UnexpectedCommand) => {}
            other => panic!("expected UnexpectedCommand, got {:?}", other),
        }
        assert!(client.stream.is_none());
    }
}
