//! Client for the external collection service ("harvester").
//!
//! The service owns experiment records, account credentials, the SIM
//! resource pool, and the authoritative sample counter. It can be briefly
//! unavailable during multi-hour experiments, so every call goes through a
//! bounded retry loop with exponential backoff on 500/501/502/503/504 and on
//! transport errors.
//!
//! [`CollectionService`] is the seam the rest of the orchestrator depends
//! on; tests substitute an in-memory implementation.

use crate::config::{CollectionSettings, RetrySettings};
use crate::error::{AppResult, OrchestratorError};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Statuses the service emits while briefly unavailable.
const RETRYABLE_STATUSES: [u16; 5] = [500, 501, 502, 503, 504];
/// Backoff ceiling; doubling stops here.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Request body for creating an experiment record.
#[derive(Debug, Clone, Serialize)]
pub struct NewExperiment {
    pub platform: String,
    pub device_serial: String,
    pub group_id: String,
    pub sub_group_id: String,
    pub comment: String,
    pub account_email: String,
}

/// Account credentials as stored by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountDetails {
    pub email: String,
    pub phonenumber: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExperimentCreated {
    experiment_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SimStatus {
    #[serde(default)]
    locked: bool,
}

#[derive(Debug, Deserialize)]
struct AdCount {
    ads: u64,
}

/// Operations the orchestrator needs from the collection service.
pub trait CollectionService: Send + Sync {
    /// Creates an experiment record and returns its id.
    fn create_experiment(&self, experiment: &NewExperiment) -> AppResult<String>;

    /// Fetches account credentials by email.
    fn account(&self, email: &str) -> AppResult<AccountDetails>;

    /// Whether the SIM resource is currently locked by another holder.
    fn sim_locked(&self, phonenumber: &str) -> AppResult<bool>;

    /// Reserves the SIM resource for the calling worker.
    fn lock_sim(&self, phonenumber: &str) -> AppResult<()>;

    /// Releases the SIM resource. Also required before re-attempting an
    /// install, because a half-installed SIM stays locked server-side.
    fn release_sim(&self, phonenumber: &str) -> AppResult<()>;

    /// Records a successful eSIM insertion.
    fn log_sim_insertion(&self, phonenumber: &str, serial: &str) -> AppResult<()>;

    /// Records an account-level event (login, signal, extract, ...).
    fn log_account_action(&self, email: &str, serial: &str, action: &str) -> AppResult<()>;

    /// Current sample count for an experiment; the ground truth for how many
    /// samples have been captured, even across instrumentation crashes.
    fn ad_count(&self, experiment_id: &str) -> AppResult<u64>;
}

/// HTTP implementation of [`CollectionService`].
pub struct HarvesterClient {
    http: Client,
    base_url: String,
    auth_token: String,
    attempts: u32,
    backoff: Duration,
}

impl HarvesterClient {
    pub fn new(collection: &CollectionSettings, retry: &RetrySettings) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base_url: collection.base_url.trim_end_matches('/').to_string(),
            auth_token: collection.auth_token.clone(),
            attempts: retry.http_attempts,
            backoff: retry.http_backoff,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends a request built by `build`, retrying on transport errors and on
    /// the retryable status set with exponentially growing backoff.
    fn send_with_retry<F>(&self, what: &str, build: F) -> AppResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut delay = self.backoff;
        for attempt in 0..self.attempts {
            let request = build(&self.http).header("Authorization", &self.auth_token);
            match request.send() {
                Ok(response) if !RETRYABLE_STATUSES.contains(&response.status().as_u16()) => {
                    return error_for_status(what, response);
                }
                Ok(response) => {
                    warn!(
                        %what,
                        attempt,
                        status = response.status().as_u16(),
                        "collection service unavailable, backing off"
                    );
                }
                Err(err) => {
                    warn!(%what, attempt, %err, "collection service request failed, backing off");
                }
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        Err(OrchestratorError::Collection(format!(
            "{what}: gave up after {} attempts",
            self.attempts
        )))
    }
}

fn error_for_status(what: &str, response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        Ok(response)
    } else {
        Err(OrchestratorError::Collection(format!(
            "{what}: service answered {status}"
        )))
    }
}

impl CollectionService for HarvesterClient {
    fn create_experiment(&self, experiment: &NewExperiment) -> AppResult<String> {
        let response = self.send_with_retry("create experiment", |client| {
            client.post(self.url("/experiment")).json(experiment)
        })?;
        let created: ExperimentCreated = response.json()?;
        // The id comes back as a bare number on some deployments.
        let id = match created.experiment_id {
            serde_json::Value::String(id) => id,
            other => other.to_string(),
        };
        info!(experiment_id = %id, "created experiment record");
        Ok(id)
    }

    fn account(&self, email: &str) -> AppResult<AccountDetails> {
        let response = self.send_with_retry("fetch account", |client| {
            client.get(self.url("/account")).query(&[("email", email)])
        })?;
        Ok(response.json()?)
    }

    fn sim_locked(&self, phonenumber: &str) -> AppResult<bool> {
        let response = self.send_with_retry("fetch sim", |client| {
            client
                .get(self.url("/sim"))
                .query(&[("phonenumber", phonenumber)])
        })?;
        let status: SimStatus = response.json()?;
        Ok(status.locked)
    }

    fn lock_sim(&self, phonenumber: &str) -> AppResult<()> {
        debug!(%phonenumber, "locking SIM");
        self.send_with_retry("lock sim", |client| {
            client
                .get(self.url("/sim/lock"))
                .query(&[("phonenumber", phonenumber)])
        })?;
        Ok(())
    }

    fn release_sim(&self, phonenumber: &str) -> AppResult<()> {
        info!(%phonenumber, "releasing SIM");
        self.send_with_retry("release sim", |client| {
            client
                .get(self.url("/sim/release"))
                .query(&[("phonenumber", phonenumber)])
        })?;
        Ok(())
    }

    fn log_sim_insertion(&self, phonenumber: &str, serial: &str) -> AppResult<()> {
        info!(%phonenumber, %serial, "logging eSIM installation");
        self.send_with_retry("log sim insertion", |client| {
            client.post(self.url("/sim/log")).json(&serde_json::json!({
                "phonenumber": phonenumber,
                "serial": serial,
                "time": chrono::Utc::now().to_rfc3339(),
            }))
        })?;
        Ok(())
    }

    fn log_account_action(&self, email: &str, serial: &str, action: &str) -> AppResult<()> {
        debug!(%email, %serial, %action, "logging account action");
        self.send_with_retry("log account action", |client| {
            client
                .post(self.url("/account/log"))
                .json(&serde_json::json!({
                    "email": email,
                    "device_serial": serial,
                    "time": chrono::Utc::now().to_rfc3339(),
                    "action": action,
                }))
        })?;
        Ok(())
    }

    fn ad_count(&self, experiment_id: &str) -> AppResult<u64> {
        let response = self.send_with_retry("fetch ad count", |client| {
            client
                .get(self.url("/ad_data/count"))
                .query(&[("experiment_id", experiment_id)])
        })?;
        let count: AdCount = response.json()?;
        Ok(count.ads)
    }
}
