// Copyright 2021 the texecom crate authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the Apache-2.0 license. See the LICENSE file for details.

//! Connection loss/recovery notification

use std::path::PathBuf;
use std::process::Command;

use log::{info, warn};

/// Told when the panel has been unreachable for over a minute, and again
/// when the session is regained. At most one loss notification fires per
/// outage.
pub trait Notifier {
    fn connection_lost(&mut self) {}
    fn connection_regained(&mut self) {}
}

/// Ignores both notifications.
pub struct NullNotifier;

impl Notifier for NullNotifier {}

/// Runs an external program with a single message argument, for sites that
/// page someone when the alarm panel goes dark.
pub struct ScriptNotifier {
    program: PathBuf,
}

impl ScriptNotifier {
    pub fn new<P: Into<PathBuf>>(program: P) -> ScriptNotifier {
        ScriptNotifier {
            program: program.into(),
        }
    }

    fn run(&self, message: &str) {
        info!("calling {:?} '{}'", self.program, message);
        match Command::new(&self.program).arg(message).status() {
            Ok(status) if !status.success() => {
                warn!("notifier {:?} exited with {}", self.program, status)
            }
            Ok(_) => {}
            Err(e) => warn!("notifier {:?} failed to run: {}", self.program, e),
        }
    }
}

impl Notifier for ScriptNotifier {
    fn connection_lost(&mut self) {
        self.run("connection lost");
    }

    fn connection_regained(&mut self) {
        self.run("connection regained");
    }
}
