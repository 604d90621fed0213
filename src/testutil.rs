//! Shared fakes for unit tests.

use crate::config::{RetrySettings, TimingSettings};
use crate::error::AppResult;
use crate::harvester::{AccountDetails, CollectionService, NewExperiment};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory collection service recording all traffic.
#[derive(Default)]
pub(crate) struct FakeCollection {
    pub releases: Mutex<Vec<String>>,
    pub insert_logs: Mutex<Vec<String>>,
    pub action_logs: Mutex<Vec<String>>,
    pub locks: Mutex<Vec<String>>,
    pub experiments: Mutex<Vec<NewExperiment>>,
    /// Successive `ad_count` answers; the last one repeats.
    pub ad_counts: Mutex<Vec<u64>>,
    pub sim_is_locked: AtomicBool,
    count_calls: AtomicUsize,
}

impl FakeCollection {
    pub fn with_ad_counts(counts: Vec<u64>) -> Self {
        Self {
            ad_counts: Mutex::new(counts),
            ..Self::default()
        }
    }

    pub fn ad_count_queries(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }
}

impl CollectionService for FakeCollection {
    fn create_experiment(&self, experiment: &NewExperiment) -> AppResult<String> {
        let mut experiments = self.experiments.lock().unwrap_or_else(|e| e.into_inner());
        experiments.push(experiment.clone());
        Ok(format!("exp-{}", experiments.len()))
    }

    fn account(&self, email: &str) -> AppResult<AccountDetails> {
        Ok(AccountDetails {
            email: email.to_string(),
            phonenumber: format!("+49-{email}"),
            password: None,
        })
    }

    fn sim_locked(&self, _phonenumber: &str) -> AppResult<bool> {
        Ok(self.sim_is_locked.load(Ordering::SeqCst))
    }

    fn lock_sim(&self, phonenumber: &str) -> AppResult<()> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(phonenumber.to_string());
        Ok(())
    }

    fn release_sim(&self, phonenumber: &str) -> AppResult<()> {
        self.releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(phonenumber.to_string());
        Ok(())
    }

    fn log_sim_insertion(&self, phonenumber: &str, serial: &str) -> AppResult<()> {
        self.insert_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{phonenumber}@{serial}"));
        Ok(())
    }

    fn log_account_action(&self, email: &str, _serial: &str, action: &str) -> AppResult<()> {
        self.action_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{action}:{email}"));
        Ok(())
    }

    fn ad_count(&self, _experiment_id: &str) -> AppResult<u64> {
        let counts = self.ad_counts.lock().unwrap_or_else(|e| e.into_inner());
        let index = self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*counts.get(index).or(counts.last()).unwrap_or(&0))
    }
}

/// Default retry budgets with millisecond backoffs.
pub(crate) fn fast_retry() -> RetrySettings {
    RetrySettings {
        http_backoff: Duration::from_millis(1),
        ..RetrySettings::default()
    }
}

/// All protocol sleeps reduced to milliseconds.
pub(crate) fn fast_timing() -> TimingSettings {
    TimingSettings {
        restart_backoff: Duration::from_millis(1),
        esim_quirk_grace: Duration::from_millis(1),
        signal_cooldown: Duration::from_millis(1),
        post_personalization_delay: Duration::from_millis(1),
        login_retry_delay: Duration::from_millis(1),
        discovery_poll_interval: Duration::from_millis(1),
        discovery_ceiling: Duration::from_millis(50),
        pre_recovery_delay: Duration::from_millis(1),
    }
}
