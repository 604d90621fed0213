//! The task runner: one instrumentation command against one device.
//!
//! [`TaskRunner::run`] invokes the external instrumentation command with the
//! task arguments merged with device-identity context, inspects both exit
//! status and textual output, and applies the classification policy from
//! [`classify`]. It has no knowledge of experiment structure; the stage
//! pipeline decides *what* to run, this module decides *whether it worked*.

mod classify;

pub use classify::NO_PERSONALIZATION_MARKER;

use crate::config::{RetrySettings, TimingSettings};
use crate::console::{EscalationChoice, OperatorConsole};
use crate::device::driver::DeviceDriver;
use crate::device::{CommandExec, CommandOutput, DeviceHandle};
use crate::harvester::CollectionService;
use classify::{classify, FailureContext, Verdict};
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// One external instrumentation action performed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    FactoryReset,
    MuteSound,
    DisableScreenTimeout,
    DisableUpdates,
    SetupWifi,
    DisplayAlwaysOn,
    PrivacySettings,
    InstallEsim,
    RemoveEsim,
    DisableCellular,
    Login,
    VerifyLogin,
    Signal,
    EnablePersonalization,
    DisablePersonalization,
    Measurement,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::FactoryReset => "factory_reset",
            TaskKind::MuteSound => "mute_sound",
            TaskKind::DisableScreenTimeout => "disable_screen_timeout",
            TaskKind::DisableUpdates => "disable_updates",
            TaskKind::SetupWifi => "setup_wifi",
            TaskKind::DisplayAlwaysOn => "display_always_on",
            TaskKind::PrivacySettings => "privacy_settings",
            TaskKind::InstallEsim => "install_esim",
            TaskKind::RemoveEsim => "remove_esim",
            TaskKind::DisableCellular => "disable_cellular",
            TaskKind::Login => "login",
            TaskKind::VerifyLogin => "verify_login",
            TaskKind::Signal => "signal",
            TaskKind::EnablePersonalization => "enable_personalization",
            TaskKind::DisablePersonalization => "disable_personalization",
            TaskKind::Measurement => "measurement",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one task-runner invocation. Never silently dropped: every
/// command-level failure is classified into one of these.
///
/// [`TaskRunner::run`] resolves `Retryable` and `Escalate` internally (by
/// retrying, or by asking the operator); only `Success`, `NoPersonalization`
/// and `Fatal` cross into the stage pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// The account never receives personalization; dependent stages skip.
    NoPersonalization,
    Retryable(String),
    Escalate(String),
    Fatal(String),
}

/// Executes instrumentation tasks with retry and escalation policy.
///
/// Holds the consecutive-measurement-failure counter for the duration of one
/// experiment; the counter is deliberately instance state, not process
/// state.
pub struct TaskRunner {
    driver: Arc<dyn DeviceDriver>,
    exec: Arc<dyn CommandExec>,
    console: Arc<dyn OperatorConsole>,
    collection: Arc<dyn CollectionService>,
    retry: RetrySettings,
    timing: TimingSettings,
    measurement_failures: u32,
}

impl TaskRunner {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        exec: Arc<dyn CommandExec>,
        console: Arc<dyn OperatorConsole>,
        collection: Arc<dyn CollectionService>,
        retry: RetrySettings,
        timing: TimingSettings,
    ) -> Self {
        Self {
            driver,
            exec,
            console,
            collection,
            retry,
            timing,
            measurement_failures: 0,
        }
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn exec(&self) -> &Arc<dyn CommandExec> {
        &self.exec
    }

    /// Consecutive failed measurement attempts so far.
    pub fn measurement_failures(&self) -> u32 {
        self.measurement_failures
    }

    /// Runs one task to a final outcome, applying the classification policy
    /// on every failed attempt.
    pub fn run(
        &mut self,
        device: &DeviceHandle,
        task: TaskKind,
        args: &[(String, String)],
        restartable: bool,
    ) -> TaskOutcome {
        for attempt in 0..self.retry.max_task_attempts {
            // A half-installed eSIM leaves the SIM resource locked and
            // blocks reinsertion; release it before every retry.
            if task == TaskKind::InstallEsim && attempt > 0 {
                if let Some(phonenumber) = arg_value(args, "phonenumber") {
                    if let Err(err) = self.collection.release_sim(phonenumber) {
                        warn!(%device, %err, "failed to release SIM before retry");
                    }
                }
            }

            let output = self.invoke(device, task, args);
            let failed = !output.success || self.driver.output_indicates_failure(&output.output);
            if !failed {
                if task == TaskKind::Measurement {
                    self.measurement_failures = 0;
                }
                return TaskOutcome::Success;
            }

            let context = FailureContext {
                task,
                device_missing: self.driver.is_device_missing(device, &output.output),
                esim_quirk: device.esim_quirk,
                output: &output.output,
                restartable,
            };
            let (rule, verdict) = classify(&context);
            debug!(%device, %task, attempt, rule, "classified failed attempt");

            match verdict {
                Verdict::ManualCaptcha => {
                    error!(%device, %task, "CAPTCHA encountered, requesting operator");
                    self.console.await_captcha_solved(&device.serial);
                    info!(%device, "operator confirmed, starting guided captcha completion");
                    if self.guided_captcha_completion(device, args) {
                        info!(%device, "finished guided captcha task successfully");
                        return TaskOutcome::Success;
                    }
                    warn!(%device, "guided captcha completion did not verify, re-attempting");
                }
                Verdict::NoPersonalization => {
                    error!(
                        %device,
                        account = arg_value(args, "accountEmail").unwrap_or("<unknown>"),
                        "account does not get personalized ads; related measurements are invalid"
                    );
                    return TaskOutcome::NoPersonalization;
                }
                Verdict::MeasurementCrash => {
                    self.measurement_failures += 1;
                    if self.measurement_failures > self.retry.measurement_failure_threshold {
                        let reason = format!(
                            "measurement task crashed {} times in a row on device {device}",
                            self.measurement_failures
                        );
                        error!(%device, "{reason}");
                        return TaskOutcome::Fatal(reason);
                    }
                    warn!(
                        %device,
                        failures = self.measurement_failures,
                        "measurement task crashed, continuing with next run"
                    );
                    // The sampling loop re-invokes until the externally
                    // tracked counter confirms enough samples.
                    return TaskOutcome::Success;
                }
                Verdict::RebootNoise => {
                    info!(%device, "ignoring factory reset error, device is rebooting");
                    return TaskOutcome::Success;
                }
                Verdict::EsimQuirk => {
                    info!(%device, %task, "ignoring device gone missing during eSIM handling");
                    if task == TaskKind::InstallEsim {
                        if let Some(phonenumber) = arg_value(args, "phonenumber") {
                            if let Err(err) =
                                self.collection.log_sim_insertion(phonenumber, &device.serial)
                            {
                                warn!(%device, %err, "could not log eSIM installation");
                            }
                        }
                    }
                    // Give the device a moment to come back before the next
                    // task trips over it.
                    thread::sleep(self.timing.esim_quirk_grace);
                    return TaskOutcome::Success;
                }
                Verdict::Restart => {
                    // Long restart streaks get promoted to warnings.
                    if attempt > 5 {
                        warn!(%device, %task, attempt, "restarting task");
                    } else {
                        info!(%device, %task, attempt, "restarting task");
                    }
                    info!(%device, error = %output.output.trim(), "instrumentation error");
                    thread::sleep(self.timing.restart_backoff);
                }
                Verdict::Escalate => {
                    error!(%device, %task, error = %output.output.trim(), "task failed, escalating");
                    match self
                        .console
                        .escalate(task.name(), &device.serial, &output.output)
                    {
                        EscalationChoice::Continue => return TaskOutcome::Success,
                        EscalationChoice::Retry => {}
                        EscalationChoice::Abort => {
                            return TaskOutcome::Fatal(format!(
                                "task {task} aborted by supervisor on device {device}"
                            ))
                        }
                    }
                }
            }
        }
        TaskOutcome::Fatal(format!(
            "task {task} failed after {} attempts on device {device}",
            self.retry.max_task_attempts
        ))
    }

    fn invoke(&self, device: &DeviceHandle, task: TaskKind, args: &[(String, String)]) -> CommandOutput {
        let spec = self.driver.instrumentation(device, task, args);
        debug!(%device, %task, command = %spec, "running instrumentation task");
        match self.exec.run(&spec) {
            Ok(output) => output,
            // A spawn failure is classified like any other failed attempt.
            Err(err) => CommandOutput::failed(err.to_string()),
        }
    }

    /// Single uninterpreted invocation, for post-condition probes. True when
    /// both the exit status and the output look clean.
    pub fn check(&self, device: &DeviceHandle, task: TaskKind, args: &[(String, String)]) -> bool {
        let output = self.invoke(device, task, args);
        output.success && !self.driver.output_indicates_failure(&output.output)
    }

    /// Guided CAPTCHA completion: re-run the login flow with CAPTCHA
    /// handling enabled, then verify with the independent login probe
    /// rather than trusting operator confirmation alone.
    fn guided_captcha_completion(&self, device: &DeviceHandle, args: &[(String, String)]) -> bool {
        let email = arg_value(args, "accountEmail").unwrap_or_default().to_string();
        let login_args = vec![
            ("accountEmail".to_string(), email.clone()),
            ("handleCaptcha".to_string(), "true".to_string()),
        ];
        let login = self.invoke(device, TaskKind::Login, &login_args);
        if !login.success || self.driver.output_indicates_failure(&login.output) {
            return false;
        }
        let probe_args = vec![("accountEmail".to_string(), email)];
        let probe = self.invoke(device, TaskKind::VerifyLogin, &probe_args);
        probe.success && !self.driver.output_indicates_failure(&probe.output)
    }
}

fn arg_value<'a>(args: &'a [(String, String)], key: &str) -> Option<&'a str> {
    args.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
