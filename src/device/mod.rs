//! Device identity and the platform command plane.
//!
//! The orchestrator never talks to a phone directly; everything goes through
//! an external vendor tool (`adb`/`am instrument` on Android, `xcodebuild`/
//! `cfgutil`/`ideviceinfo` on iOS). [`DeviceDriver`] turns a task into the
//! concrete command line for the platform, and [`CommandExec`] is the narrow
//! subprocess seam that runs it, so pipeline logic never touches
//! platform-specific command construction.

pub mod driver;
pub mod mock;

pub use driver::{AndroidDriver, IosDriver};

use crate::error::{AppResult, OrchestratorError};
use std::fmt;
use std::process::Command;

/// A physical device's addressable identity. Long-lived; not owned by any
/// single experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Serial number (Android) or UDID (iOS).
    pub serial: String,
    /// Model tag selecting platform-specific command templates.
    pub model: String,
    /// Unique chip id (ECID), resolved at runtime before the iOS hardware
    /// bridge is used; `cfgutil` does not accept the UDID.
    pub chip_id: Option<String>,
    /// Device loses its USB connection during eSIM install/removal.
    pub esim_quirk: bool,
}

impl DeviceHandle {
    pub fn new(serial: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            model: model.into(),
            chip_id: None,
            esim_quirk: false,
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serial)
    }
}

/// One external command to run: program, arguments, and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Captured result of one external command. The exit status alone is not
/// authoritative for instrumentation runs; callers also scan `output`.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    /// Interleaved stdout + stderr, as the vendor tools mix the two.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Blocking subprocess execution seam.
pub trait CommandExec: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> AppResult<CommandOutput>;
}

/// Runs commands as real subprocesses, capturing stdout and stderr together.
pub struct SystemExec;

impl CommandExec for SystemExec {
    fn run(&self, spec: &CommandSpec) -> AppResult<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        let result = command
            .output()
            .map_err(|err| OrchestratorError::Command(format!("failed to spawn {spec}: {err}")))?;
        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        Ok(CommandOutput {
            success: result.status.success(),
            output,
        })
    }
}
