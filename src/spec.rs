//! Experiment definitions and the protocol stage order.
//!
//! An [`ExperimentSpec`] is the immutable description of one paired run,
//! parsed from one row of a batch CSV file. [`StageName`] is the ordered list
//! of protocol checkpoints; its total order is what gives `resume_at` its
//! meaning ("skip everything strictly before this stage").

use crate::error::{AppResult, OrchestratorError};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::error;
use uuid::Uuid;

/// Ordered protocol checkpoints for one device's run of one experiment.
///
/// The declaration order *is* the protocol order; `Ord` is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageName {
    Reset,
    Setup,
    Install,
    Esim,
    Login,
    Signal,
    Barrier,
    Measurement,
    PostPersonalizationMeasurement,
    Cleanup,
}

impl StageName {
    /// All stages in protocol order.
    pub const ALL: [StageName; 10] = [
        StageName::Reset,
        StageName::Setup,
        StageName::Install,
        StageName::Esim,
        StageName::Login,
        StageName::Signal,
        StageName::Barrier,
        StageName::Measurement,
        StageName::PostPersonalizationMeasurement,
        StageName::Cleanup,
    ];

    /// Stages that are meaningful resume targets. Resuming before `esim`
    /// makes no sense because the reset/setup/install effects are durable.
    pub const RESUME_TARGETS: [StageName; 5] = [
        StageName::Esim,
        StageName::Login,
        StageName::Signal,
        StageName::Measurement,
        StageName::PostPersonalizationMeasurement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Reset => "reset",
            StageName::Setup => "setup",
            StageName::Install => "install",
            StageName::Esim => "esim",
            StageName::Login => "login",
            StageName::Signal => "signal",
            StageName::Barrier => "barrier",
            StageName::Measurement => "measurement",
            StageName::PostPersonalizationMeasurement => "post_personalization_measurement",
            StageName::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stage = match s {
            "reset" => StageName::Reset,
            "setup" => StageName::Setup,
            "install" => StageName::Install,
            "esim" => StageName::Esim,
            "login" => StageName::Login,
            // older batch files spell this stage "signalling"
            "signal" | "signalling" => StageName::Signal,
            "barrier" => StageName::Barrier,
            "measurement" => StageName::Measurement,
            "post_personalization_measurement" => StageName::PostPersonalizationMeasurement,
            "cleanup" => StageName::Cleanup,
            other => {
                return Err(OrchestratorError::Batch(format!(
                    "unknown stage name '{other}'"
                )))
            }
        };
        Ok(stage)
    }
}

/// Immutable description of one paired control/treatment run.
#[derive(Debug, Clone)]
pub struct ExperimentSpec {
    pub group_id: String,
    /// Minted per batch row, ties the two workers of this pair together.
    pub sub_group_id: String,
    pub control_account_email: String,
    pub treatment_account_email: String,
    pub control_device_serial: String,
    pub treatment_device_serial: String,
    /// Target number of new samples per repetition.
    pub number_of_ads: u64,
    pub number_of_repetitions: u32,
    pub repeat_every_minutes: u32,
    /// Extra wait before the measurement stage starts, in minutes.
    pub pre_measurement_timeout: u32,
    pub comment: String,
    pub signal_step: bool,
    pub extract_post_personalization: bool,
    pub resume_at: Option<StageName>,
}

impl ExperimentSpec {
    fn validate(&self) -> AppResult<()> {
        if self.control_account_email == self.treatment_account_email {
            return Err(OrchestratorError::Batch(
                "control and treatment account must differ".into(),
            ));
        }
        if self.control_device_serial == self.treatment_device_serial {
            return Err(OrchestratorError::Batch(
                "control and treatment device must differ".into(),
            ));
        }
        if let Some(stage) = self.resume_at {
            if !StageName::RESUME_TARGETS.contains(&stage) {
                return Err(OrchestratorError::Batch(format!(
                    "'{stage}' is not a valid resume target"
                )));
            }
        }
        Ok(())
    }
}

/// Raw CSV row as written by the operator. Flags come in as "0"/"1" and the
/// optional columns may be missing or empty.
#[derive(Debug, Deserialize)]
struct BatchRow {
    group_id: String,
    control_account_email: String,
    treatment_account_email: String,
    control_device_serial: String,
    treatment_device_serial: String,
    number_of_ads: u64,
    number_of_repetitions: u32,
    repeat_every_minutes: u32,
    #[serde(default)]
    pre_measurement_timeout: u32,
    #[serde(default)]
    comment: String,
    signal_step: u8,
    #[serde(default)]
    extract_post_personalization: u8,
    #[serde(default)]
    resume_at: Option<String>,
}

impl BatchRow {
    fn into_spec(self) -> AppResult<ExperimentSpec> {
        let resume_at = match self.resume_at.as_deref() {
            None | Some("") => None,
            Some(name) => Some(name.parse::<StageName>()?),
        };
        let spec = ExperimentSpec {
            group_id: self.group_id,
            sub_group_id: Uuid::new_v4().to_string(),
            control_account_email: self.control_account_email,
            treatment_account_email: self.treatment_account_email,
            control_device_serial: self.control_device_serial,
            treatment_device_serial: self.treatment_device_serial,
            number_of_ads: self.number_of_ads,
            number_of_repetitions: self.number_of_repetitions,
            repeat_every_minutes: self.repeat_every_minutes,
            pre_measurement_timeout: self.pre_measurement_timeout,
            comment: self.comment,
            signal_step: self.signal_step != 0,
            extract_post_personalization: self.extract_post_personalization != 0,
            resume_at,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Reads a batch definition file. A malformed row aborts that row's
/// experiment, not the whole batch: it is logged and skipped.
pub fn read_batch(path: &Path) -> AppResult<Vec<ExperimentSpec>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut specs = Vec::new();
    for (index, record) in reader.deserialize::<BatchRow>().enumerate() {
        let parsed = record
            .map_err(OrchestratorError::from)
            .and_then(BatchRow::into_spec);
        match parsed {
            Ok(spec) => specs.push(spec),
            Err(err) => {
                error!(row = index + 1, %err, "skipping malformed batch row");
            }
        }
    }
    Ok(specs)
}
