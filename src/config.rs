//! Application configuration.
//!
//! `Settings::new(None)` yields the built-in defaults; an optional TOML file
//! and `ADFLEET_*` environment variables layer on top of them. All durations
//! are written in human form ("30s", "10m") via `humantime-serde`.

use crate::error::AppResult;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Top-level settings for one orchestrator process.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub collection: CollectionSettings,
    pub fleet: FleetSettings,
    pub timing: TimingSettings,
    pub retry: RetrySettings,
    pub android: AndroidSettings,
    pub ios: IosSettings,
}

/// Collection-service endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub base_url: String,
    /// Sent as the `Authorization` header. Usually supplied via
    /// `ADFLEET_COLLECTION__AUTH_TOKEN`.
    pub auth_token: String,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            base_url: "https://harvester.example.org".into(),
            auth_token: String::new(),
        }
    }
}

/// Fleet composition: which platform this process drives and what it knows
/// about the individual devices.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FleetSettings {
    pub platform: PlatformName,
    /// Serial/UDID to device-model map; the model selects platform-specific
    /// command templates.
    pub device_models: HashMap<String, String>,
    /// Devices known to drop their USB connection during eSIM install or
    /// removal. Failures matching the "device not found" signature on these
    /// devices are treated as success.
    pub esim_quirk_serials: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformName {
    #[default]
    Android,
    Ios,
}

impl PlatformName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformName::Android => "android",
            PlatformName::Ios => "ios",
        }
    }
}

/// Fixed sleeps and polling cadences used across the protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Backoff between restartable task attempts.
    #[serde(with = "humantime_serde")]
    pub restart_backoff: Duration,
    /// Grace period after the eSIM connectivity quirk before continuing.
    #[serde(with = "humantime_serde")]
    pub esim_quirk_grace: Duration,
    /// Cooldown after signalling, to avoid rate-limiting the next phase.
    #[serde(with = "humantime_serde")]
    pub signal_cooldown: Duration,
    /// Settle time before disabling personalization for re-extraction.
    #[serde(with = "humantime_serde")]
    pub post_personalization_delay: Duration,
    /// Delay between login verification attempts.
    #[serde(with = "humantime_serde")]
    pub login_retry_delay: Duration,
    /// Poll cadence while waiting for a device to reappear.
    #[serde(with = "humantime_serde")]
    pub discovery_poll_interval: Duration,
    /// Ceiling on waiting for a device to reappear.
    #[serde(with = "humantime_serde")]
    pub discovery_ceiling: Duration,
    /// Wait before attempting hardware recovery after an install failure.
    #[serde(with = "humantime_serde")]
    pub pre_recovery_delay: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(10),
            esim_quirk_grace: Duration::from_secs(10),
            signal_cooldown: Duration::from_secs(3 * 60),
            post_personalization_delay: Duration::from_secs(10 * 60),
            login_retry_delay: Duration::from_secs(20),
            discovery_poll_interval: Duration::from_secs(30),
            discovery_ceiling: Duration::from_secs(30 * 60),
            pre_recovery_delay: Duration::from_secs(15),
        }
    }
}

/// Attempt budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts for one instrumentation task.
    pub max_task_attempts: u32,
    /// Consecutive measurement crashes tolerated before the experiment dies.
    pub measurement_failure_threshold: u32,
    /// Login-plus-probe rounds before the login stage is fatal.
    pub login_attempts: u32,
    /// HTTP retries against the collection service.
    pub http_attempts: u32,
    /// Base backoff for HTTP retries; doubles per attempt, capped internally.
    #[serde(with = "humantime_serde")]
    pub http_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_task_attempts: 10,
            measurement_failure_threshold: 50,
            login_attempts: 3,
            http_attempts: 100,
            http_backoff: Duration::from_millis(100),
        }
    }
}

/// Android command templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AndroidSettings {
    /// Instrumentation component passed to `am instrument -w`.
    pub instrumentation_component: String,
    /// APKs installed during the install stage, in order.
    pub apk_paths: Vec<String>,
    /// Path to the HID-based setup/reset helper.
    pub hid_setup_path: String,
}

impl Default for AndroidSettings {
    fn default() -> Self {
        Self {
            instrumentation_component:
                "com.example.adextractauto.test/androidx.test.runner.AndroidJUnitRunner".into(),
            apk_paths: vec![
                "app/build/outputs/apk/debug/app-debug.apk".into(),
                "app/build/outputs/apk/androidTest/debug/app-debug-androidTest.apk".into(),
            ],
            hid_setup_path: "build-auto/hid-setup/hid-setup".into(),
        }
    }
}

/// iOS command templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IosSettings {
    pub xcode_project: String,
    pub xcode_scheme: String,
    /// Configuration profile installed right after erase.
    pub device_profile: String,
}

impl Default for IosSettings {
    fn default() -> Self {
        Self {
            xcode_project: "app_store_ad_extraction.xcodeproj".into(),
            xcode_scheme: "app_store_ad_extraction".into(),
            device_profile: "test_device.mobileconfig".into(),
        }
    }
}

impl Settings {
    /// Builds settings from defaults, an optional TOML file, and the
    /// `ADFLEET_*` environment.
    pub fn new(config_path: Option<&str>) -> AppResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("ADFLEET").separator("__"))
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
