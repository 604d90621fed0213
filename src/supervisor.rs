//! The fleet supervisor: batch intake and worker pair management.
//!
//! Experiments run sequentially, one pair at a time. Each batch row spawns
//! one OS thread per device; the two threads share the pair's barriers and
//! abort signal and are joined before the next row starts. A failed pair is
//! reported and the batch continues. After the last row every used device is
//! reset and re-provisioned so no account stays logged in.

use crate::barrier::AbortSignal;
use crate::config::Settings;
use crate::console::OperatorConsole;
use crate::device::driver::DeviceDriver;
use crate::device::{CommandExec, DeviceHandle};
use crate::error::{AppResult, OrchestratorError};
use crate::harvester::{AccountDetails, CollectionService};
use crate::pipeline::{PairBarriers, StagePipeline};
use crate::recovery::DeviceRecovery;
use crate::sampling::AdExtractor;
use crate::spec::{read_batch, ExperimentSpec};
use crate::task::TaskRunner;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

pub struct FleetSupervisor {
    settings: Settings,
    driver: Arc<dyn DeviceDriver>,
    exec: Arc<dyn CommandExec>,
    console: Arc<dyn OperatorConsole>,
    collection: Arc<dyn CollectionService>,
}

impl FleetSupervisor {
    pub fn new(
        settings: Settings,
        driver: Arc<dyn DeviceDriver>,
        exec: Arc<dyn CommandExec>,
        console: Arc<dyn OperatorConsole>,
        collection: Arc<dyn CollectionService>,
    ) -> Self {
        Self {
            settings,
            driver,
            exec,
            console,
            collection,
        }
    }

    /// Runs every experiment in the batch file, then cleans up the fleet.
    pub fn run_batch(&self, path: &Path) -> AppResult<()> {
        let specs = read_batch(path)?;
        info!(experiments = specs.len(), "batch loaded");

        let mut used_serials = BTreeSet::new();
        for spec in &specs {
            used_serials.insert(spec.control_device_serial.clone());
            used_serials.insert(spec.treatment_device_serial.clone());

            info!(
                group_id = %spec.group_id,
                sub_group_id = %spec.sub_group_id,
                comment = %spec.comment,
                "beginning experiment"
            );
            match self.run_pair(spec) {
                Ok(()) => info!(sub_group_id = %spec.sub_group_id, "experiment pair finished"),
                Err(err) => {
                    error!(
                        sub_group_id = %spec.sub_group_id,
                        %err,
                        "experiment pair failed, continuing with next row"
                    );
                }
            }
        }

        // Reset every device we touched so no account stays logged in.
        info!("starting fleet cleanup");
        for serial in &used_serials {
            if let Err(err) = self.refresh_device(serial) {
                error!(%serial, %err, "cleanup failed for device");
            }
        }
        info!("finished all experiments in the batch");
        Ok(())
    }

    /// Spawns the control and treatment workers for one row and joins both.
    ///
    /// Everything fallible (account lookups, serial resolution, pipeline
    /// wiring) happens before the first thread starts. Once a worker is
    /// running, the only way out of this function is through a join, so no
    /// worker is ever left parked at a barrier with its handle dropped.
    pub fn run_pair(&self, spec: &ExperimentSpec) -> AppResult<()> {
        let control_account = self.collection.account(&spec.control_account_email)?;
        let treatment_account = self.collection.account(&spec.treatment_account_email)?;
        let control_device = self.device_handle(&spec.control_device_serial)?;
        let treatment_device = self.device_handle(&spec.treatment_device_serial)?;

        let barriers = PairBarriers::new(2, &spec.sub_group_id);
        let abort = AbortSignal::new();
        let control_pipeline = self.build_pipeline(barriers.clone(), abort.clone());
        let treatment_pipeline = self.build_pipeline(barriers, abort.clone());

        let control = spawn_worker(
            control_pipeline,
            control_device,
            spec.clone(),
            control_account,
            format!("{}control_group", spec.comment),
        );
        let treatment = spawn_worker(
            treatment_pipeline,
            treatment_device,
            spec.clone(),
            treatment_account,
            format!("{}treatment_group", spec.comment),
        );

        let (control, treatment) = match (control, treatment) {
            (Ok(control), Ok(treatment)) => (control, treatment),
            (control, treatment) => {
                // One spawn failed; release and join whichever one started.
                abort.trip();
                let mut spawn_err = OrchestratorError::Batch("worker spawn failed".into());
                for handle in [control, treatment] {
                    match handle {
                        Ok(handle) => report(&spec.sub_group_id, &join_worker(handle)),
                        Err(err) => spawn_err = err,
                    }
                }
                return Err(spawn_err);
            }
        };

        let control_result = join_worker(control);
        let treatment_result = join_worker(treatment);
        report(&spec.control_device_serial, &control_result);
        report(&spec.treatment_device_serial, &treatment_result);
        control_result.and(treatment_result)
    }

    /// Resolves a serial into a full device handle using the fleet map.
    fn device_handle(&self, serial: &str) -> AppResult<DeviceHandle> {
        let model = self
            .settings
            .fleet
            .device_models
            .get(serial)
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "device '{serial}' has no model entry in the fleet configuration"
                ))
            })?;
        let mut device = DeviceHandle::new(serial, model);
        device.esim_quirk = self
            .settings
            .fleet
            .esim_quirk_serials
            .iter()
            .any(|quirky| quirky == serial);
        Ok(device)
    }

    fn build_pipeline(&self, barriers: PairBarriers, abort: AbortSignal) -> StagePipeline {
        let runner = TaskRunner::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.exec),
            Arc::clone(&self.console),
            Arc::clone(&self.collection),
            self.settings.retry.clone(),
            self.settings.timing.clone(),
        );
        let recovery = DeviceRecovery::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.exec),
            self.settings.timing.clone(),
        );
        let extractor = AdExtractor::new(Arc::clone(&self.collection));
        StagePipeline::new(
            runner,
            recovery,
            extractor,
            Arc::clone(&self.collection),
            self.settings.timing.clone(),
            self.settings.retry.clone(),
            barriers,
            abort,
        )
    }

    /// Reset, setup, and instrumentation install for one device.
    fn refresh_device(&self, serial: &str) -> AppResult<()> {
        let device = self.device_handle(serial)?;
        let mut pipeline =
            self.build_pipeline(PairBarriers::new(1, "cleanup"), AbortSignal::new());
        pipeline.provision(&device)
    }
}

fn spawn_worker(
    mut pipeline: StagePipeline,
    device: DeviceHandle,
    spec: ExperimentSpec,
    account: AccountDetails,
    comment: String,
) -> AppResult<thread::JoinHandle<AppResult<()>>> {
    let handle = thread::Builder::new()
        .name(format!("worker-{}", device.serial))
        .spawn(move || pipeline.run(&device, &spec, &account, &comment))?;
    Ok(handle)
}

fn join_worker(handle: thread::JoinHandle<AppResult<()>>) -> AppResult<()> {
    handle
        .join()
        .map_err(|_| OrchestratorError::Batch("worker thread panicked".into()))?
}

fn report(serial: &str, result: &AppResult<()>) {
    match result {
        Ok(()) => info!(%serial, "worker finished"),
        Err(err) => error!(%serial, %err, "worker failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AndroidSettings, FleetSettings};
    use crate::console::ScriptedConsole;
    use crate::device::driver::AndroidDriver;
    use crate::device::mock::ScriptedExec;
    use crate::device::{CommandExec, CommandOutput, CommandSpec};
    use crate::testutil::{fast_retry, fast_timing, FakeCollection};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn settings() -> Settings {
        Settings {
            fleet: FleetSettings {
                device_models: HashMap::from([
                    ("SER_A".to_string(), "g23".to_string()),
                    ("SER_B".to_string(), "g23".to_string()),
                ]),
                ..FleetSettings::default()
            },
            timing: fast_timing(),
            retry: fast_retry(),
            ..Settings::default()
        }
    }

    fn supervisor(exec: Arc<ScriptedExec>, collection: Arc<FakeCollection>) -> FleetSupervisor {
        FleetSupervisor::new(
            settings(),
            Arc::new(AndroidDriver::new(AndroidSettings::default())),
            exec,
            Arc::new(ScriptedConsole::default()),
            collection,
        )
    }

    /// Succeeds everything; discovery polls see both serials.
    fn clean_responder(spec: &CommandSpec, _index: usize) -> CommandOutput {
        if spec.program.ends_with("hid-setup") && spec.args.is_empty() {
            CommandOutput::ok("SER_A\nSER_B")
        } else {
            CommandOutput::ok("")
        }
    }

    fn signalling_batch() -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "group_id,control_account_email,treatment_account_email,control_device_serial,\
             treatment_device_serial,number_of_ads,number_of_repetitions,repeat_every_minutes,\
             pre_measurement_timeout,comment,signal_step,extract_post_personalization,resume_at"
        )
        .expect("header");
        writeln!(file, "g1,c@x.com,t@x.com,SER_A,SER_B,5,1,0,0,pilot,1,0,").expect("row");
        file
    }

    #[test]
    fn signalling_batch_runs_both_workers_and_cleans_up() {
        let collection = Arc::new(FakeCollection::default());
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let file = signalling_batch();

        supervisor(Arc::clone(&exec), Arc::clone(&collection))
            .run_batch(file.path())
            .expect("batch");

        let actions = collection.action_logs.lock().expect("actions").clone();
        assert!(actions.contains(&"signal:c@x.com".to_string()));
        assert!(actions.contains(&"signal:t@x.com".to_string()));

        // Two worker resets plus one cleanup reset per device.
        let resets = exec
            .calls()
            .iter()
            .filter(|spec| spec.to_string().contains("factoryReset"))
            .count();
        assert_eq!(resets, 4);
    }

    #[test]
    fn fatal_worker_aborts_its_sibling() {
        let collection = Arc::new(FakeCollection::default());
        // SER_A never survives its factory reset; SER_B is healthy and waits
        // at the pre-signal barrier until the abort releases it.
        let exec = Arc::new(ScriptedExec::new(|spec: &CommandSpec, index| {
            let on_a = spec
                .env
                .contains(&("ANDROID_SERIAL".to_string(), "SER_A".to_string()));
            if on_a && spec.to_string().contains("factoryReset") {
                CommandOutput::failed("persistent failure")
            } else {
                clean_responder(spec, index)
            }
        }));
        let file = signalling_batch();
        let specs = read_batch(file.path()).expect("batch");

        let err = supervisor(exec, collection)
            .run_pair(&specs[0])
            .expect_err("pair fails");
        assert!(matches!(
            err,
            OrchestratorError::StageFatal { .. } | OrchestratorError::Aborted
        ));
    }

    #[test]
    fn unresolvable_sibling_fails_the_row_before_any_worker_starts() {
        // SER_B has no model entry. The row must fail outright, with no
        // half-spawned control worker left running the protocol and parked
        // at the main barrier.
        let collection = Arc::new(FakeCollection::default());
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let settings = Settings {
            fleet: FleetSettings {
                device_models: HashMap::from([("SER_A".to_string(), "g23".to_string())]),
                ..FleetSettings::default()
            },
            timing: fast_timing(),
            retry: fast_retry(),
            ..Settings::default()
        };
        let supervisor = FleetSupervisor::new(
            settings,
            Arc::new(AndroidDriver::new(AndroidSettings::default())),
            Arc::clone(&exec) as Arc<dyn CommandExec>,
            Arc::new(ScriptedConsole::default()),
            collection,
        );
        let file = signalling_batch();
        let specs = read_batch(file.path()).expect("batch");

        let err = supervisor.run_pair(&specs[0]).expect_err("row fails");
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert_eq!(exec.call_count(), 0, "no worker should have started");
    }

    #[test]
    fn unknown_serial_is_a_configuration_error() {
        let collection = Arc::new(FakeCollection::default());
        let exec = Arc::new(ScriptedExec::new(clean_responder));
        let supervisor = supervisor(exec, collection);

        let err = supervisor
            .device_handle("SER_UNKNOWN")
            .expect_err("no model entry");
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }
}
