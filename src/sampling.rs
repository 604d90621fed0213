//! The ad-extraction sampling loop.
//!
//! One extraction run creates an experiment record with the collection
//! service and then repeats the measurement task until the service-side
//! sample counter has grown by the configured target. The counter is the
//! ground truth: the instrumentation may crash mid-run and the loop simply
//! invokes it again until enough samples have landed.
//!
//! Repetitions are scheduled on absolute deadlines (`repetition start +
//! interval`) so a slow repetition does not shift the whole schedule.

use crate::device::DeviceHandle;
use crate::error::{AppResult, OrchestratorError};
use crate::harvester::{CollectionService, NewExperiment};
use crate::spec::{ExperimentSpec, StageName};
use crate::task::{TaskKind, TaskOutcome, TaskRunner};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

pub struct AdExtractor {
    collection: Arc<dyn CollectionService>,
}

impl AdExtractor {
    pub fn new(collection: Arc<dyn CollectionService>) -> Self {
        Self { collection }
    }

    /// Creates the experiment record and runs the full repetition schedule.
    pub fn extract(
        &self,
        runner: &mut TaskRunner,
        device: &DeviceHandle,
        experiment: &ExperimentSpec,
        account_email: &str,
        comment: &str,
    ) -> AppResult<()> {
        let record = NewExperiment {
            platform: runner.driver().platform().as_str().to_string(),
            device_serial: device.serial.clone(),
            group_id: experiment.group_id.clone(),
            sub_group_id: experiment.sub_group_id.clone(),
            comment: comment.to_string(),
            account_email: account_email.to_string(),
        };
        let experiment_id = self.collection.create_experiment(&record)?;
        let mut overall: u64 = 0;

        for repetition in 0..experiment.number_of_repetitions {
            let started = Utc::now();
            info!(
                %device,
                repetition,
                of = experiment.number_of_repetitions,
                "starting extraction repetition"
            );
            overall += self.run_repetition(runner, device, experiment, account_email, &experiment_id)?;

            if repetition + 1 < experiment.number_of_repetitions {
                sleep_until_deadline(device, started, experiment.repeat_every_minutes);
            }
        }
        info!(%device, samples = overall, "extraction finished");
        Ok(())
    }

    /// Invokes the measurement task until the counter delta reaches the
    /// target for this repetition.
    fn run_repetition(
        &self,
        runner: &mut TaskRunner,
        device: &DeviceHandle,
        experiment: &ExperimentSpec,
        account_email: &str,
        experiment_id: &str,
    ) -> AppResult<u64> {
        let baseline = self.collection.ad_count(experiment_id)?;
        let mut collected: u64 = 0;
        while collected < experiment.number_of_ads {
            let args = vec![
                ("experimentID".to_string(), experiment_id.to_string()),
                ("accountEmail".to_string(), account_email.to_string()),
                ("numberOfAds".to_string(), experiment.number_of_ads.to_string()),
            ];
            match runner.run(device, TaskKind::Measurement, &args, false) {
                TaskOutcome::Success => {}
                TaskOutcome::Fatal(reason) => {
                    return Err(OrchestratorError::StageFatal {
                        stage: StageName::Measurement,
                        device: device.serial.clone(),
                        reason,
                    })
                }
                // The measurement task has no other terminal outcomes.
                other => {
                    return Err(OrchestratorError::StageFatal {
                        stage: StageName::Measurement,
                        device: device.serial.clone(),
                        reason: format!("unexpected measurement outcome: {other:?}"),
                    })
                }
            }
            let current = self.collection.ad_count(experiment_id)?;
            collected = current.saturating_sub(baseline);
            info!(
                %device,
                collected,
                target = experiment.number_of_ads,
                "sample counter progressed"
            );
        }
        Ok(collected)
    }
}

/// Sleeps until `started + interval_minutes`. A deadline already in the past
/// is skipped with a warning.
fn sleep_until_deadline(device: &DeviceHandle, started: DateTime<Utc>, interval_minutes: u32) {
    let deadline = started + ChronoDuration::minutes(i64::from(interval_minutes));
    let remaining = deadline - Utc::now();
    match remaining.to_std() {
        Ok(wait) => {
            info!(%device, deadline = %deadline.to_rfc3339(), "waiting for next repetition");
            thread::sleep(wait);
        }
        Err(_) => {
            warn!(
                %device,
                deadline = %deadline.to_rfc3339(),
                "repetition overran its interval, starting the next one immediately"
            );
        }
    }
}
