//! Hardware-level device recovery.
//!
//! When a device drops off the host mid-experiment, the software paths are
//! useless until it reappears. [`DeviceRecovery`] drives the platform's
//! hardware reset (HID helper on Android, `cfgutil erase` on iOS) and then
//! polls the discovery command until the device is visible again or the
//! ceiling elapses.

use crate::config::TimingSettings;
use crate::device::driver::DeviceDriver;
use crate::device::{CommandExec, DeviceHandle};
use crate::error::{AppResult, OrchestratorError};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{info, warn};

/// Concurrent invocations of the hardware bridge tool corrupt host-side
/// device discovery, so every caller in the process takes this lock first.
static BRIDGE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct DeviceRecovery {
    driver: Arc<dyn DeviceDriver>,
    exec: Arc<dyn CommandExec>,
    timing: TimingSettings,
}

impl DeviceRecovery {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        exec: Arc<dyn CommandExec>,
        timing: TimingSettings,
    ) -> Self {
        Self {
            driver,
            exec,
            timing,
        }
    }

    /// Hardware-resets the device and blocks until it is discoverable again.
    pub fn recover(&self, device: &DeviceHandle) -> AppResult<()> {
        info!(%device, "starting hardware recovery");
        let resolved = self.resolve_bridge_id(device)?;
        {
            let _bridge = BRIDGE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            for spec in self.driver.hardware_reset(&resolved) {
                let output = self.exec.run(&spec)?;
                if !output.success {
                    warn!(%device, command = %spec, error = %output.output.trim(),
                        "hardware reset command failed, continuing to discovery");
                }
            }
        }
        self.await_visible(device)
    }

    /// Hardware-assisted initial setup (navigates the out-of-box screens).
    /// Runs under the bridge lock, like every other bridge invocation.
    pub fn initial_setup(&self, device: &DeviceHandle) -> AppResult<()> {
        let resolved = self.resolve_bridge_id(device)?;
        let _bridge = BRIDGE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for spec in self.driver.initial_setup(&resolved) {
            let output = self.exec.run(&spec)?;
            if !output.success {
                return Err(OrchestratorError::Command(format!(
                    "initial setup failed on {device}: {}",
                    output.output.trim()
                )));
            }
        }
        Ok(())
    }

    /// The hardware bridge may key devices on something other than the
    /// serial (the ECID on iOS); look it up once before emitting bridge
    /// commands. Platforms keyed on the serial pass the handle through.
    fn resolve_bridge_id(&self, device: &DeviceHandle) -> AppResult<DeviceHandle> {
        if device.chip_id.is_some() {
            return Ok(device.clone());
        }
        let Some(query) = self.driver.chip_id_query(device) else {
            return Ok(device.clone());
        };
        let output = self.exec.run(&query)?;
        let chip_id = output.output.trim();
        if !output.success || chip_id.is_empty() {
            return Err(OrchestratorError::Command(format!(
                "could not resolve the bridge id of {device}: {}",
                output.output.trim()
            )));
        }
        let mut resolved = device.clone();
        resolved.chip_id = Some(chip_id.to_string());
        Ok(resolved)
    }

    /// Polls the discovery command until the device shows up, bounded by the
    /// configured ceiling. Also used after a software factory reset.
    pub fn await_visible(&self, device: &DeviceHandle) -> AppResult<()> {
        let started = Instant::now();
        loop {
            let spec = self.driver.discovery(device);
            match self.exec.run(&spec) {
                Ok(output) if self.driver.device_visible(device, &output) => {
                    info!(%device, elapsed = ?started.elapsed(), "device is back");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => warn!(%device, %err, "discovery command failed"),
            }
            if started.elapsed() >= self.timing.discovery_ceiling {
                return Err(OrchestratorError::RecoveryTimeout {
                    device: device.serial.clone(),
                });
            }
            info!(%device, "device not yet discoverable, waiting");
            thread::sleep(self.timing.discovery_poll_interval);
        }
    }
}
