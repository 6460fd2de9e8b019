// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! TCP transport implementation

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use log::debug;

use super::constant;
use super::error::Error;
use super::transport::{Connect, Transport as PackTrait};

/// a set of options for the TCP connection
#[derive(Debug, Clone)]
pub struct Options {
    pub connection_timeout: Option<Duration>,
    /// The read timeout doubles as the command timeout: every suspension in
    /// the client happens inside a socket read.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How long to wait after connect before the first send. The panel
    /// silently ignores frames that arrive sooner.
    pub connect_pause: Duration,
    address: String,
}

impl Options {
    pub fn new(host: &str, port: u16) -> Options {
        Options {
            connection_timeout: None,
            read_timeout: constant::CMD_TIMEOUT,
            write_timeout: constant::CMD_TIMEOUT,
            connect_pause: constant::CONNECT_PAUSE,
            address: format!("{}:{}", host, port),
        }
    }
}

pub struct Transport {
    stream: TcpStream,
}

impl PackTrait for Transport {
    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        debug!("sending: 0x{}", hex::encode(data));
        self.stream.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; max];
        let n = self.stream.read(&mut data)?;
        data.truncate(n);
        if !data.is_empty() {
            debug!("received: 0x{}", hex::encode(&data));
        }
        Ok(data)
    }

    fn close(&mut self) {
        // best effort; the panel may already have dropped the session
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Opens a fresh session to the panel for every connection attempt.
pub struct Connector {
    options: Options,
}

impl Connector {
    pub fn new(options: Options) -> Connector {
        Connector { options }
    }
}

impl Connect for Connector {
    type Stream = Transport;

    fn open(&self) -> Result<Transport, Error> {
        let stream = match self.options.connection_timeout {
            Some(timeout) => match self.options.address.parse::<std::net::SocketAddr>() {
                Ok(socket_address) => TcpStream::connect_timeout(&socket_address, timeout)?,
                Err(e) => return Err(Error::Connect(e.to_string())),
            },
            None => TcpStream::connect(&self.options.address)?,
        };

        stream.set_read_timeout(Some(self.options.read_timeout))?;
        stream.set_write_timeout(Some(self.options.write_timeout))?;

        // if we send the login message too fast the panel ignores it
        thread::sleep(self.options.connect_pause);

        Ok(Transport { stream })
    }
}
