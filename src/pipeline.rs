//! The experiment state machine for one device worker.
//!
//! Stages run strictly in [`StageName`] order. `resume_at` selects a suffix
//! of that order; `signal_step` decides whether this pair signals a persona
//! (and skips extraction) or extracts ads (and skips signalling). The two
//! sibling workers of a pair synchronize at the shared barriers and share
//! one [`AbortSignal`]: a fatal stage on either side trips it, which
//! force-releases the sibling from any barrier wait.

use crate::barrier::{AbortSignal, BarrierWait, Rendezvous};
use crate::config::{RetrySettings, TimingSettings};
use crate::device::DeviceHandle;
use crate::error::{AppResult, OrchestratorError};
use crate::harvester::{AccountDetails, CollectionService};
use crate::recovery::DeviceRecovery;
use crate::sampling::AdExtractor;
use crate::spec::{ExperimentSpec, StageName};
use crate::task::{TaskKind, TaskOutcome, TaskRunner};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// The rendezvous points shared by the two workers of one pair.
#[derive(Clone)]
pub struct PairBarriers {
    pub pre_signal: Arc<Rendezvous>,
    pub main: Arc<Rendezvous>,
    pub personalization: Arc<Rendezvous>,
}

impl PairBarriers {
    pub fn new(parties: usize, sub_group_id: &str) -> Self {
        let tagged = |name: &'static str| {
            let sub_group = sub_group_id.to_string();
            Arc::new(Rendezvous::with_callback(parties, move || {
                info!(sub_group_id = %sub_group, barrier = name, "all workers arrived, releasing");
            }))
        };
        Self {
            pre_signal: tagged("pre_signal"),
            main: tagged("main"),
            personalization: tagged("personalization"),
        }
    }
}

/// Drives one device through the stages of one experiment.
pub struct StagePipeline {
    runner: TaskRunner,
    recovery: DeviceRecovery,
    extractor: AdExtractor,
    collection: Arc<dyn CollectionService>,
    timing: TimingSettings,
    retry: RetrySettings,
    barriers: PairBarriers,
    abort: AbortSignal,
}

impl StagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: TaskRunner,
        recovery: DeviceRecovery,
        extractor: AdExtractor,
        collection: Arc<dyn CollectionService>,
        timing: TimingSettings,
        retry: RetrySettings,
        barriers: PairBarriers,
        abort: AbortSignal,
    ) -> Self {
        Self {
            runner,
            recovery,
            extractor,
            collection,
            timing,
            retry,
            barriers,
            abort,
        }
    }

    /// Runs the full stage sequence. Any error trips the abort signal so the
    /// sibling worker is released from whatever barrier it is waiting at.
    pub fn run(
        &mut self,
        device: &DeviceHandle,
        experiment: &ExperimentSpec,
        account: &AccountDetails,
        comment: &str,
    ) -> AppResult<()> {
        let result = self.run_stages(device, experiment, account, comment);
        if let Err(err) = &result {
            warn!(%device, %err, "pipeline failed, tripping the pair abort signal");
            self.abort.trip();
        }
        result
    }

    fn run_stages(
        &mut self,
        device: &DeviceHandle,
        experiment: &ExperimentSpec,
        account: &AccountDetails,
        comment: &str,
    ) -> AppResult<()> {
        let enabled = |stage: StageName| {
            experiment.resume_at.map_or(true, |resume| stage >= resume)
        };

        if enabled(StageName::Reset) {
            self.checkpoint(device, StageName::Reset)?;
            self.reset(device)?;
        }
        if enabled(StageName::Setup) {
            self.checkpoint(device, StageName::Setup)?;
            self.setup(device)?;
        }
        if enabled(StageName::Install) {
            self.checkpoint(device, StageName::Install)?;
            self.install(device)?;
            self.configure(device)?;
        }
        if enabled(StageName::Esim) {
            self.checkpoint(device, StageName::Esim)?;
            self.esim(device, &account.phonenumber)?;
        }
        if enabled(StageName::Login) {
            self.checkpoint(device, StageName::Login)?;
            self.login(device, &account.email)?;
        }
        if experiment.signal_step && enabled(StageName::Signal) {
            self.checkpoint(device, StageName::Signal)?;
            self.signal(device, &account.email)?;
        }

        // Always awaited, so the faster sibling never races ahead into the
        // measurement window.
        self.checkpoint(device, StageName::Barrier)?;
        self.rendezvous(device, "main", &self.barriers.main)?;

        if !experiment.signal_step && enabled(StageName::Measurement) {
            self.checkpoint(device, StageName::Measurement)?;
            self.measure(device, experiment, account, comment)?;
        }
        if !experiment.signal_step
            && experiment.extract_post_personalization
            && enabled(StageName::PostPersonalizationMeasurement)
        {
            self.checkpoint(device, StageName::PostPersonalizationMeasurement)?;
            self.post_personalization(device, experiment, account, comment)?;
        }
        if enabled(StageName::Cleanup) {
            self.checkpoint(device, StageName::Cleanup)?;
            self.cleanup(device, &account.phonenumber)?;
        }
        info!(%device, "pipeline finished");
        Ok(())
    }

    /// Reset, initial setup, and instrumentation install, outside any
    /// experiment. Used for the fleet-wide cleanup after a batch so accounts
    /// do not stay logged in longer than intended.
    pub fn provision(&mut self, device: &DeviceHandle) -> AppResult<()> {
        self.reset(device)?;
        self.setup(device)?;
        self.install(device)
    }

    /// Stage boundary: bail out early if the sibling already failed.
    fn checkpoint(&self, device: &DeviceHandle, stage: StageName) -> AppResult<()> {
        if self.abort.is_tripped() {
            return Err(OrchestratorError::Aborted);
        }
        info!(%device, %stage, "entering stage");
        Ok(())
    }

    fn rendezvous(
        &self,
        device: &DeviceHandle,
        name: &str,
        barrier: &Rendezvous,
    ) -> AppResult<()> {
        info!(%device, barrier = name, "waiting for sibling");
        match barrier.wait(&self.abort) {
            BarrierWait::Released => Ok(()),
            BarrierWait::Aborted => Err(OrchestratorError::Aborted),
        }
    }

    fn require_success(
        &self,
        stage: StageName,
        device: &DeviceHandle,
        outcome: TaskOutcome,
    ) -> AppResult<()> {
        match outcome {
            TaskOutcome::Success | TaskOutcome::NoPersonalization => Ok(()),
            TaskOutcome::Fatal(reason) => Err(OrchestratorError::StageFatal {
                stage,
                device: device.serial.clone(),
                reason,
            }),
            other => Err(OrchestratorError::StageFatal {
                stage,
                device: device.serial.clone(),
                reason: format!("unresolved task outcome: {other:?}"),
            }),
        }
    }

    /// Software factory reset, then wait for the device to come back up.
    fn reset(&mut self, device: &DeviceHandle) -> AppResult<()> {
        let outcome = self.runner.run(device, TaskKind::FactoryReset, &[], true);
        self.require_success(StageName::Reset, device, outcome)?;
        self.recovery.await_visible(device)
    }

    /// Hardware-assisted initial setup (navigates the out-of-box screens).
    fn setup(&self, device: &DeviceHandle) -> AppResult<()> {
        self.recovery.initial_setup(device)
    }

    /// Installs the instrumentation packages. A vanished device falls back
    /// to hardware recovery plus a fresh initial setup, then tries again.
    fn install(&self, device: &DeviceHandle) -> AppResult<()> {
        let driver = Arc::clone(self.runner.driver());
        for attempt in 0..self.retry.max_task_attempts {
            let mut vanished = false;
            let mut installed = true;
            for spec in driver.install_instrumentation(device) {
                let output = self.runner.exec().run(&spec)?;
                if output.success {
                    continue;
                }
                installed = false;
                if driver.is_device_missing(device, &output.output) {
                    vanished = true;
                    break;
                }
                return Err(OrchestratorError::Command(format!(
                    "instrumentation install failed on {device}: {}",
                    output.output.trim()
                )));
            }
            if installed {
                return Ok(());
            }
            warn!(%device, attempt, "device lost during install, attempting hardware recovery");
            debug_assert!(vanished);
            thread::sleep(self.timing.pre_recovery_delay);
            match self.recovery.recover(device) {
                Ok(()) => self.setup(device)?,
                Err(err) => warn!(%device, %err, "hardware recovery failed, retrying install"),
            }
        }
        Err(OrchestratorError::Command(format!(
            "instrumentation install on {device} failed after {} attempts",
            self.retry.max_task_attempts
        )))
    }

    /// Post-install device configuration tasks, in platform order.
    fn configure(&mut self, device: &DeviceHandle) -> AppResult<()> {
        if let Some(spec) = self.runner.driver().mute_key(device) {
            let output = self.runner.exec().run(&spec)?;
            if !output.output.trim().is_empty() {
                warn!(%device, output = %output.output.trim(), "mute keypress returned output");
            }
        }
        for task in self.runner.driver().configuration_tasks() {
            let mut outcome = self.runner.run(device, task, &[], true);
            // A mute task that exhausts its attempts usually means the
            // out-of-box setup landed in the wrong state (typically the
            // wrong language); one full re-provision fixes that.
            if task == TaskKind::MuteSound && matches!(outcome, TaskOutcome::Fatal(_)) {
                warn!(%device, "mute task keeps failing, re-provisioning the device");
                self.recovery.recover(device)?;
                self.setup(device)?;
                self.install(device)?;
                outcome = self.runner.run(device, task, &[], true);
            }
            self.require_success(StageName::Install, device, outcome)?;
        }
        Ok(())
    }

    /// Reserves the SIM, installs the eSIM, and makes sure cellular data
    /// stays off. The reservation is returned on permanent failure.
    fn esim(&mut self, device: &DeviceHandle, phonenumber: &str) -> AppResult<()> {
        if self.collection.sim_locked(phonenumber)? {
            return Err(OrchestratorError::StageFatal {
                stage: StageName::Esim,
                device: device.serial.clone(),
                reason: format!("SIM {phonenumber} is locked by another run"),
            });
        }
        self.collection.lock_sim(phonenumber)?;
        let args = vec![("phonenumber".to_string(), phonenumber.to_string())];
        let outcome = self.runner.run(device, TaskKind::InstallEsim, &args, true);
        if let Err(err) = self.require_success(StageName::Esim, device, outcome) {
            if let Err(release_err) = self.collection.release_sim(phonenumber) {
                warn!(%device, %release_err, "could not release SIM after failed install");
            }
            return Err(err);
        }
        self.collection.log_sim_insertion(phonenumber, &device.serial)?;

        // The instrumentation can die right after registering the eSIM;
        // kill cellular data out of band to avoid roaming cost.
        if let Some(spec) = self.runner.driver().cellular_kill_switch(device) {
            let output = self.runner.exec().run(&spec)?;
            if !output.output.trim().is_empty() {
                warn!(%device, output = %output.output.trim(), "cellular kill switch returned output");
            }
        }
        if self.runner.driver().supports(TaskKind::DisableCellular) {
            let outcome = self.runner.run(device, TaskKind::DisableCellular, &args, true);
            self.require_success(StageName::Esim, device, outcome)?;
        }
        Ok(())
    }

    /// Login plus an independent "is logged in" probe; the task exit status
    /// alone is not trusted.
    fn login(&mut self, device: &DeviceHandle, email: &str) -> AppResult<()> {
        let args = vec![
            ("accountEmail".to_string(), email.to_string()),
            ("handleCaptcha".to_string(), "false".to_string()),
        ];
        let probe_args = vec![("accountEmail".to_string(), email.to_string())];
        for attempt in 0..self.retry.login_attempts {
            let outcome = self.runner.run(device, TaskKind::Login, &args, true);
            self.require_success(StageName::Login, device, outcome)?;
            if self.runner.check(device, TaskKind::VerifyLogin, &probe_args) {
                self.collection
                    .log_account_action(email, &device.serial, "login")?;
                return Ok(());
            }
            warn!(%device, %email, attempt, "login probe failed, retrying login");
            thread::sleep(self.timing.login_retry_delay);
        }
        Err(OrchestratorError::StageFatal {
            stage: StageName::Login,
            device: device.serial.clone(),
            reason: format!(
                "login for {email} never verified after {} attempts",
                self.retry.login_attempts
            ),
        })
    }

    /// Persona signalling, entered in lockstep with the sibling.
    fn signal(&mut self, device: &DeviceHandle, email: &str) -> AppResult<()> {
        self.rendezvous(device, "pre_signal", &self.barriers.pre_signal)?;
        let args = vec![("accountEmail".to_string(), email.to_string())];
        let outcome = self.runner.run(device, TaskKind::Signal, &args, true);
        self.require_success(StageName::Signal, device, outcome)?;
        self.collection
            .log_account_action(email, &device.serial, "signal")?;

        // Cooldown so rate limiting does not bleed into the next phase.
        info!(%device, "signalling done, cooling down");
        thread::sleep(self.timing.signal_cooldown);

        if let Some(spec) = self.runner.driver().installed_apps(device) {
            match self.runner.exec().run(&spec) {
                Ok(output) => info!(%device, apps = %output.output.trim(), "installed apps"),
                Err(err) => warn!(%device, %err, "could not list installed apps"),
            }
        }
        Ok(())
    }

    /// Primary extraction: enable personalization, then sample until the
    /// target is reached. A `NoPersonalization` account skips extraction.
    fn measure(
        &mut self,
        device: &DeviceHandle,
        experiment: &ExperimentSpec,
        account: &AccountDetails,
        comment: &str,
    ) -> AppResult<()> {
        let settle = Duration::from_secs(u64::from(experiment.pre_measurement_timeout) * 60);
        if !settle.is_zero() {
            info!(%device, ?settle, "pre-measurement wait");
            thread::sleep(settle);
        }

        let args = vec![("accountEmail".to_string(), account.email.clone())];
        match self
            .runner
            .run(device, TaskKind::EnablePersonalization, &args, true)
        {
            TaskOutcome::NoPersonalization => {
                info!(%device, email = %account.email, "account gets no ads, skipping extraction");
                return Ok(());
            }
            outcome => self.require_success(StageName::Measurement, device, outcome)?,
        }
        self.extractor
            .extract(&mut self.runner, device, experiment, &account.email, comment)
    }

    /// Re-extraction with personalization off. The barrier is waited on both
    /// paths so a failed toggle never strands the sibling.
    fn post_personalization(
        &mut self,
        device: &DeviceHandle,
        experiment: &ExperimentSpec,
        account: &AccountDetails,
        comment: &str,
    ) -> AppResult<()> {
        info!(%device, "settling before disabling personalization");
        thread::sleep(self.timing.post_personalization_delay);

        let args = vec![("accountEmail".to_string(), account.email.clone())];
        let toggled = match self
            .runner
            .run(device, TaskKind::DisablePersonalization, &args, true)
        {
            TaskOutcome::NoPersonalization => false,
            outcome => {
                self.require_success(StageName::PostPersonalizationMeasurement, device, outcome)?;
                true
            }
        };

        self.rendezvous(device, "personalization", &self.barriers.personalization)?;

        if !toggled {
            info!(%device, email = %account.email, "account gets no ads, skipping re-extraction");
            return Ok(());
        }
        let tagged_comment = format!("{comment}_no_personalization");
        self.extractor.extract(
            &mut self.runner,
            device,
            experiment,
            &account.email,
            &tagged_comment,
        )
    }

    /// Ejects the eSIM and returns the SIM reservation. Logout is implied by
    /// the next reset and deliberately not automated.
    fn cleanup(&mut self, device: &DeviceHandle, phonenumber: &str) -> AppResult<()> {
        let args = vec![("phonenumber".to_string(), phonenumber.to_string())];
        let outcome = self.runner.run(device, TaskKind::RemoveEsim, &args, true);
        self.require_success(StageName::Cleanup, device, outcome)?;
        self.collection.release_sim(phonenumber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AndroidSettings;
    use crate::console::ScriptedConsole;
    use crate::device::driver::{AndroidDriver, DeviceDriver};
    use crate::device::mock::ScriptedExec;
    use crate::device::{CommandOutput, CommandSpec};
    use crate::testutil::{fast_retry, fast_timing, FakeCollection};

    fn experiment() -> ExperimentSpec {
        ExperimentSpec {
            group_id: "g1".into(),
            sub_group_id: "sg1".into(),
            control_account_email: "c@x.com".into(),
            treatment_account_email: "t@x.com".into(),
            control_device_serial: "SER_A".into(),
            treatment_device_serial: "SER_B".into(),
            number_of_ads: 5,
            number_of_repetitions: 1,
            repeat_every_minutes: 0,
            pre_measurement_timeout: 0,
            comment: "pilot".into(),
            signal_step: false,
            extract_post_personalization: false,
            resume_at: None,
        }
    }

    fn account() -> AccountDetails {
        AccountDetails {
            email: "c@x.com".into(),
            phonenumber: "+4912345".into(),
            password: None,
        }
    }

    /// Answers every command cleanly; discovery polls report the serial so
    /// reset and recovery terminate immediately.
    fn clean_responder(spec: &CommandSpec, _index: usize) -> CommandOutput {
        if spec.program.ends_with("hid-setup") && spec.args.len() <= 1 {
            CommandOutput::ok("SER_A\nSER_B")
        } else {
            CommandOutput::ok("")
        }
    }

    fn pipeline(
        exec: Arc<ScriptedExec>,
        collection: Arc<FakeCollection>,
        abort: AbortSignal,
    ) -> StagePipeline {
        let driver: Arc<dyn DeviceDriver> =
            Arc::new(AndroidDriver::new(AndroidSettings::default()));
        let runner = TaskRunner::new(
            Arc::clone(&driver),
            Arc::clone(&exec) as Arc<dyn crate::device::CommandExec>,
            Arc::new(ScriptedConsole::default()),
            Arc::clone(&collection) as Arc<dyn CollectionService>,
            fast_retry(),
            fast_timing(),
        );
        let recovery = DeviceRecovery::new(
            driver,
            exec as Arc<dyn crate::device::CommandExec>,
            fast_timing(),
        );
        let extractor =
            AdExtractor::new(Arc::clone(&collection) as Arc<dyn CollectionService>);
        StagePipeline::new(
            runner,
            recovery,
            extractor,
            collection as Arc<dyn CollectionService>,
            fast_timing(),
            fast_retry(),
            PairBarriers::new(1, "sg1"),
            abort,
        )
    }

    /// The `-e task` values of all instrumentation calls, in order.
    fn ran_tasks(exec: &ScriptedExec) -> Vec<String> {
        exec.calls()
            .iter()
            .filter_map(|spec| {
                spec.args
                    .windows(3)
                    .find(|w| w[0] == "-e" && w[1] == "task")
                    .map(|w| w[2].clone())
            })
            .collect()
    }

    #[test]
    fn full_run_executes_stages_in_protocol_order() {
        let collection = Arc::new(FakeCollection::with_ad_counts(vec![0, 5]));
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let mut pipeline = pipeline(Arc::clone(&exec), Arc::clone(&collection), AbortSignal::new());
        let device = DeviceHandle::new("SER_A", "g23");

        pipeline
            .run(&device, &experiment(), &account(), "pilotcontrol_group")
            .expect("pipeline");

        let tasks = ran_tasks(&exec);
        assert_eq!(
            tasks,
            vec![
                "factoryReset",
                "disableSound",
                "disableScreenTimeout",
                "disableUpdates",
                "setupWifi",
                "installESIM",
                "disableCellular",
                "loginAccount",
                "isLoggedIn",
                "enablePersonalization",
                "measurement",
                "removeESIM",
            ]
        );
        assert_eq!(collection.locks.lock().expect("locks").len(), 1);
        assert_eq!(collection.releases.lock().expect("releases").len(), 1);
        let actions = collection.action_logs.lock().expect("actions").clone();
        assert_eq!(actions, vec!["login:c@x.com".to_string()]);
    }

    #[test]
    fn resume_at_login_skips_everything_before_it() {
        let collection = Arc::new(FakeCollection::with_ad_counts(vec![0, 5]));
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let mut pipeline = pipeline(Arc::clone(&exec), Arc::clone(&collection), AbortSignal::new());
        let device = DeviceHandle::new("SER_A", "g23");
        let mut spec = experiment();
        spec.resume_at = Some(StageName::Login);

        pipeline
            .run(&device, &spec, &account(), "pilot")
            .expect("pipeline");

        let tasks = ran_tasks(&exec);
        assert_eq!(
            tasks,
            vec![
                "loginAccount",
                "isLoggedIn",
                "enablePersonalization",
                "measurement",
                "removeESIM",
            ]
        );
        // No eSIM stage means no SIM lock either.
        assert!(collection.locks.lock().expect("locks").is_empty());
    }

    #[test]
    fn signalling_run_signals_and_never_measures() {
        let collection = Arc::new(FakeCollection::default());
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let mut pipeline = pipeline(Arc::clone(&exec), Arc::clone(&collection), AbortSignal::new());
        let device = DeviceHandle::new("SER_A", "g23");
        let mut spec = experiment();
        spec.signal_step = true;

        pipeline
            .run(&device, &spec, &account(), "pilot")
            .expect("pipeline");

        let tasks = ran_tasks(&exec);
        assert!(tasks.contains(&"signalPersona".to_string()));
        assert!(!tasks.contains(&"measurement".to_string()));
        assert!(!tasks.contains(&"enablePersonalization".to_string()));
    }

    #[test]
    fn no_personalization_skips_both_extractions() {
        let collection = Arc::new(FakeCollection::default());
        let exec = Arc::new(ScriptedExec::new(|spec: &CommandSpec, index| {
            let line = spec.to_string();
            if line.contains("enablePersonalization") || line.contains("disablePersonalization") {
                CommandOutput::failed("ACCOUNT_DOES_NOT_HAVE_PERSONALIZATION")
            } else {
                clean_responder(spec, index)
            }
        }));
        let mut pipeline = pipeline(Arc::clone(&exec), Arc::clone(&collection), AbortSignal::new());
        let device = DeviceHandle::new("SER_A", "g23");
        let mut spec = experiment();
        spec.extract_post_personalization = true;

        pipeline
            .run(&device, &spec, &account(), "pilot")
            .expect("pipeline");

        let tasks = ran_tasks(&exec);
        assert!(!tasks.contains(&"measurement".to_string()));
        assert!(collection.experiments.lock().expect("experiments").is_empty());
    }

    #[test]
    fn stubborn_mute_failure_reprovisions_the_device_and_continues() {
        use std::sync::atomic::{AtomicBool, Ordering};

        // The mute task fails until a hardware reset has happened, as it
        // does when the out-of-box setup left the device misconfigured.
        let reprovisioned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reprovisioned);
        let exec = Arc::new(ScriptedExec::new(move |spec: &CommandSpec, index| {
            if spec.args.contains(&"reset".to_string()) {
                flag.store(true, Ordering::SeqCst);
                return CommandOutput::ok("");
            }
            if spec.to_string().contains("disableSound") && !flag.load(Ordering::SeqCst) {
                return CommandOutput::failed("sound settings screen not found");
            }
            clean_responder(spec, index)
        }));
        let collection = Arc::new(FakeCollection::with_ad_counts(vec![0, 5]));
        let mut pipeline =
            pipeline(Arc::clone(&exec), Arc::clone(&collection), AbortSignal::new());
        let device = DeviceHandle::new("SER_A", "g23");

        pipeline
            .run(&device, &experiment(), &account(), "pilot")
            .expect("pipeline");

        assert!(reprovisioned.load(Ordering::SeqCst));
        let tasks = ran_tasks(&exec);
        // The re-provision is a hardware reset, not a second software one.
        assert_eq!(tasks.iter().filter(|t| *t == "factoryReset").count(), 1);
        assert!(tasks.contains(&"loginAccount".to_string()));
        assert!(tasks.contains(&"measurement".to_string()));
    }

    #[test]
    fn locked_sim_fails_the_esim_stage() {
        let collection = Arc::new(FakeCollection::default());
        collection
            .sim_is_locked
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let abort = AbortSignal::new();
        let mut pipeline = pipeline(exec, Arc::clone(&collection), abort.clone());
        let device = DeviceHandle::new("SER_A", "g23");

        let err = pipeline
            .run(&device, &experiment(), &account(), "pilot")
            .expect_err("locked sim");
        assert!(matches!(
            err,
            OrchestratorError::StageFatal {
                stage: StageName::Esim,
                ..
            }
        ));
        assert!(collection.locks.lock().expect("locks").is_empty());
        assert!(abort.is_tripped());
    }

    #[test]
    fn fatal_stage_trips_the_abort_signal() {
        let collection = Arc::new(FakeCollection::default());
        // The factory reset never succeeds and never matches a tolerated
        // pattern, so the retry budget runs out.
        let exec = Arc::new(ScriptedExec::new(|spec: &CommandSpec, index| {
            if spec.to_string().contains("factoryReset") {
                CommandOutput::failed("persistent failure")
            } else {
                clean_responder(spec, index)
            }
        }));
        let abort = AbortSignal::new();
        let mut pipeline = pipeline(exec, collection, abort.clone());
        let device = DeviceHandle::new("SER_A", "g23");

        let err = pipeline
            .run(&device, &experiment(), &account(), "pilot")
            .expect_err("fatal reset");
        assert!(matches!(err, OrchestratorError::StageFatal { .. }));
        assert!(abort.is_tripped());
    }

    #[test]
    fn tripped_abort_stops_the_pipeline_at_the_next_stage() {
        let collection = Arc::new(FakeCollection::default());
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let abort = AbortSignal::new();
        abort.trip();
        let mut pipeline = pipeline(Arc::clone(&exec), collection, abort);
        let device = DeviceHandle::new("SER_A", "g23");

        let err = pipeline
            .run(&device, &experiment(), &account(), "pilot")
            .expect_err("aborted");
        assert!(matches!(err, OrchestratorError::Aborted));
        assert!(exec.calls().is_empty());
    }
}
