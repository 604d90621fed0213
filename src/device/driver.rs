//! Platform-specific command construction.
//!
//! Android drives devices through `adb` and `am instrument`; iOS through
//! `xcodebuild test-without-building`, `cfgutil`, and the libimobiledevice
//! tools. Both are modeled behind [`DeviceDriver`] so the pipeline never
//! needs to know which vendor tool it is talking to.
//!
//! `am instrument` is known to exit 0 even when the test run failed, so the
//! Android driver additionally scans output for the JUnit failure banner.

use super::{CommandOutput, CommandSpec, DeviceHandle};
use crate::config::{AndroidSettings, IosSettings, PlatformName};
use crate::task::TaskKind;

/// Android instrumentation output marking a failed run despite exit code 0.
const ANDROID_FAILURE_MARKER: &str = "FAILURES!!!";
/// Bare runner banner: everything after it was cut off because the device
/// went down mid-run.
const ANDROID_RUNNER_BANNER: &str = "com.example.adextractauto.AutomationTest:";

/// Capability surface for one device platform.
pub trait DeviceDriver: Send + Sync {
    fn platform(&self) -> PlatformName;

    /// Whether the platform has a native automation entry for this task.
    fn supports(&self, task: TaskKind) -> bool;

    /// Post-install configuration tasks for this platform, in order.
    fn configuration_tasks(&self) -> Vec<TaskKind>;

    /// The instrumentation invocation for one task, with device identity
    /// merged into the command context.
    fn instrumentation(
        &self,
        device: &DeviceHandle,
        task: TaskKind,
        args: &[(String, String)],
    ) -> CommandSpec;

    /// Scans textual output for a failure marker that the exit code missed.
    fn output_indicates_failure(&self, output: &str) -> bool;

    /// Matches the "device unreachable" signature for this platform.
    fn is_device_missing(&self, device: &DeviceHandle, output: &str) -> bool;

    /// Command resolving the id the hardware bridge keys devices on, when
    /// that is not the serial. `None` means the serial is the bridge id.
    fn chip_id_query(&self, _device: &DeviceHandle) -> Option<CommandSpec> {
        None
    }

    /// Hardware-level reset, distinct from the software factory reset.
    fn hardware_reset(&self, device: &DeviceHandle) -> Vec<CommandSpec>;

    /// Hardware-assisted initial setup after a reset.
    fn initial_setup(&self, device: &DeviceHandle) -> Vec<CommandSpec>;

    /// Command whose output shows whether the device is back on the host.
    fn discovery(&self, device: &DeviceHandle) -> CommandSpec;

    /// Interprets [`Self::discovery`] output.
    fn device_visible(&self, device: &DeviceHandle, out: &CommandOutput) -> bool;

    /// Commands installing the instrumentation packages, in order. May be
    /// empty when the platform runs tests from the host.
    fn install_instrumentation(&self, device: &DeviceHandle) -> Vec<CommandSpec>;

    /// Out-of-band cellular-data kill switch, if the platform has one.
    fn cellular_kill_switch(&self, device: &DeviceHandle) -> Option<CommandSpec>;

    /// Lists installed packages, for post-signal verification.
    fn installed_apps(&self, device: &DeviceHandle) -> Option<CommandSpec>;

    /// Out-of-band mute keypress sent before the mute task, if any.
    fn mute_key(&self, device: &DeviceHandle) -> Option<CommandSpec>;
}

impl TaskKind {
    /// `-e task` value understood by the Android instrumentation runner.
    fn android_name(&self) -> &'static str {
        match self {
            TaskKind::FactoryReset => "factoryReset",
            TaskKind::MuteSound => "disableSound",
            TaskKind::DisableScreenTimeout => "disableScreenTimeout",
            TaskKind::DisableUpdates => "disableUpdates",
            TaskKind::SetupWifi => "setupWifi",
            TaskKind::DisplayAlwaysOn => "disableScreenTimeout",
            TaskKind::PrivacySettings => "setPrivacySettings",
            TaskKind::InstallEsim => "installESIM",
            TaskKind::RemoveEsim => "removeESIM",
            TaskKind::DisableCellular => "disableCellular",
            TaskKind::Login => "loginAccount",
            TaskKind::VerifyLogin => "isLoggedIn",
            TaskKind::Signal => "signalPersona",
            TaskKind::EnablePersonalization => "enablePersonalization",
            TaskKind::DisablePersonalization => "disablePersonalization",
            TaskKind::Measurement => "measurement",
        }
    }

    /// XCUITest case name on iOS.
    fn ios_testcase(&self) -> &'static str {
        match self {
            TaskKind::FactoryReset => "test_erase_device",
            TaskKind::MuteSound => "test_mute_device",
            TaskKind::DisableScreenTimeout | TaskKind::DisplayAlwaysOn => "test_display_always_on",
            TaskKind::DisableUpdates => "test_disable_updates",
            TaskKind::SetupWifi => "test_setup_wifi",
            TaskKind::PrivacySettings => "test_privacy_settings_all_on",
            TaskKind::InstallEsim => "test_install_sim",
            TaskKind::RemoveEsim => "test_remove_current_sim",
            TaskKind::DisableCellular => "test_disable_cellular",
            TaskKind::Login => "test_app_store_login",
            TaskKind::VerifyLogin => "test_is_logged_in",
            TaskKind::Signal => "test_install_apps",
            TaskKind::EnablePersonalization => "test_activate_personalized_ads",
            TaskKind::DisablePersonalization => "test_deactivate_personalized_ads",
            TaskKind::Measurement => "test_extract_ads",
        }
    }
}

/// Drives Android devices via `adb`, `am instrument`, and the HID helper.
pub struct AndroidDriver {
    settings: AndroidSettings,
}

impl AndroidDriver {
    pub fn new(settings: AndroidSettings) -> Self {
        Self { settings }
    }

    fn adb(&self, device: &DeviceHandle) -> CommandSpec {
        CommandSpec::new("adb").env("ANDROID_SERIAL", &device.serial)
    }
}

impl DeviceDriver for AndroidDriver {
    fn platform(&self) -> PlatformName {
        PlatformName::Android
    }

    fn supports(&self, task: TaskKind) -> bool {
        !matches!(
            task,
            TaskKind::DisplayAlwaysOn | TaskKind::PrivacySettings
        )
    }

    fn configuration_tasks(&self) -> Vec<TaskKind> {
        vec![
            TaskKind::MuteSound,
            TaskKind::DisableScreenTimeout,
            TaskKind::DisableUpdates,
            TaskKind::SetupWifi,
        ]
    }

    fn instrumentation(
        &self,
        device: &DeviceHandle,
        task: TaskKind,
        args: &[(String, String)],
    ) -> CommandSpec {
        let mut spec = self.adb(device).args(["shell", "am", "instrument"]);
        for (key, value) in args {
            spec = spec.arg("-e").arg(key).arg(value);
        }
        spec.arg("-e")
            .arg("task")
            .arg(task.android_name())
            .arg("-e")
            .arg("deviceType")
            .arg(&device.model)
            .arg("-w")
            .arg(&self.settings.instrumentation_component)
    }

    fn output_indicates_failure(&self, output: &str) -> bool {
        output.contains(ANDROID_FAILURE_MARKER)
    }

    fn is_device_missing(&self, device: &DeviceHandle, output: &str) -> bool {
        output.contains(&format!("adb: device '{}' not found", device.serial))
            || output.trim() == ANDROID_RUNNER_BANNER
    }

    fn hardware_reset(&self, device: &DeviceHandle) -> Vec<CommandSpec> {
        vec![CommandSpec::new(&self.settings.hid_setup_path)
            .arg(&device.serial)
            .arg(&device.model)
            .arg("reset")]
    }

    fn initial_setup(&self, device: &DeviceHandle) -> Vec<CommandSpec> {
        vec![CommandSpec::new(&self.settings.hid_setup_path)
            .arg(&device.serial)
            .arg(&device.model)]
    }

    fn discovery(&self, _device: &DeviceHandle) -> CommandSpec {
        // hid-setup without arguments reports the serials it can see.
        CommandSpec::new(&self.settings.hid_setup_path)
    }

    fn device_visible(&self, device: &DeviceHandle, out: &CommandOutput) -> bool {
        out.output.contains(&device.serial)
    }

    fn install_instrumentation(&self, device: &DeviceHandle) -> Vec<CommandSpec> {
        self.settings
            .apk_paths
            .iter()
            .map(|apk| self.adb(device).arg("install").arg(apk))
            .collect()
    }

    fn cellular_kill_switch(&self, device: &DeviceHandle) -> Option<CommandSpec> {
        Some(
            self.adb(device)
                .arg("-s")
                .arg(&device.serial)
                .args(["shell", "svc", "data", "disable"]),
        )
    }

    fn installed_apps(&self, device: &DeviceHandle) -> Option<CommandSpec> {
        Some(
            self.adb(device)
                .arg("-s")
                .arg(&device.serial)
                .args(["shell", "pm", "list", "packages"]),
        )
    }

    fn mute_key(&self, device: &DeviceHandle) -> Option<CommandSpec> {
        // keyevent 164 is KEYCODE_VOLUME_MUTE
        Some(
            self.adb(device)
                .arg("-s")
                .arg(&device.serial)
                .args(["shell", "input", "keyevent", "164"]),
        )
    }
}

/// Drives iOS devices via `xcodebuild`, `cfgutil`, and libimobiledevice.
pub struct IosDriver {
    settings: IosSettings,
    api_endpoint: String,
    api_token: String,
}

impl IosDriver {
    pub fn new(settings: IosSettings, api_endpoint: String, api_token: String) -> Self {
        Self {
            settings,
            api_endpoint,
            api_token,
        }
    }

    fn chip_id<'a>(&self, device: &'a DeviceHandle) -> &'a str {
        device.chip_id.as_deref().unwrap_or(&device.serial)
    }

    /// XCUITest parameters travel as TEST_RUNNER_* environment variables.
    fn env_key(key: &str) -> String {
        let mut snake = String::with_capacity(key.len() + 12);
        let mut prev_upper = true;
        for ch in key.chars() {
            if ch.is_ascii_uppercase() && !prev_upper {
                snake.push('_');
            }
            prev_upper = ch.is_ascii_uppercase();
            snake.push(ch.to_ascii_uppercase());
        }
        format!("TEST_RUNNER_{snake}")
    }
}

impl DeviceDriver for IosDriver {
    fn platform(&self) -> PlatformName {
        PlatformName::Ios
    }

    fn supports(&self, task: TaskKind) -> bool {
        !matches!(
            task,
            TaskKind::MuteSound
                | TaskKind::DisableScreenTimeout
                | TaskKind::DisableUpdates
                | TaskKind::SetupWifi
                | TaskKind::DisableCellular
        )
    }

    fn configuration_tasks(&self) -> Vec<TaskKind> {
        vec![TaskKind::DisplayAlwaysOn, TaskKind::PrivacySettings]
    }

    fn instrumentation(
        &self,
        device: &DeviceHandle,
        task: TaskKind,
        args: &[(String, String)],
    ) -> CommandSpec {
        let mut spec = CommandSpec::new("xcodebuild")
            .args([
                "test-without-building",
                "-project",
                &self.settings.xcode_project,
                "-scheme",
                &self.settings.xcode_scheme,
            ])
            .arg("-destination")
            .arg(format!("platform=iOS,id={}", device.serial))
            .arg(format!(
                "-only-testing:app_store_ad_extractionUITests/ui_testUITests/{}",
                task.ios_testcase()
            ))
            .env("TEST_RUNNER_API_ENDPOINT", &self.api_endpoint)
            .env("TEST_RUNNER_API_TOKEN", &self.api_token);
        for (key, value) in args {
            spec = spec.env(Self::env_key(key), value);
        }
        spec
    }

    fn output_indicates_failure(&self, _output: &str) -> bool {
        // xcodebuild signals test failure through its exit code.
        false
    }

    fn is_device_missing(&self, device: &DeviceHandle, output: &str) -> bool {
        output.contains("Unable to find a destination matching")
            || output.contains(&format!("Could not locate device with id {}", device.serial))
    }

    fn chip_id_query(&self, device: &DeviceHandle) -> Option<CommandSpec> {
        Some(
            CommandSpec::new("ideviceinfo")
                .arg("-u")
                .arg(&device.serial)
                .args(["-k", "UniqueChipID"]),
        )
    }

    fn hardware_reset(&self, device: &DeviceHandle) -> Vec<CommandSpec> {
        vec![CommandSpec::new("cfgutil")
            .arg("-e")
            .arg(self.chip_id(device))
            .arg("erase")]
    }

    fn initial_setup(&self, device: &DeviceHandle) -> Vec<CommandSpec> {
        let ecid = self.chip_id(device).to_string();
        vec![
            CommandSpec::new("cfgutil")
                .arg("-e")
                .arg(&ecid)
                .arg("install-profile")
                .arg(&self.settings.device_profile),
            CommandSpec::new("cfgutil")
                .arg("-e")
                .arg(&ecid)
                .args(["prepare", "--skip-all", "--skip-tos"]),
            CommandSpec::new("devmodectl")
                .arg("single")
                .arg(&device.serial),
        ]
    }

    fn discovery(&self, device: &DeviceHandle) -> CommandSpec {
        CommandSpec::new("ideviceinfo").arg("-u").arg(&device.serial)
    }

    fn device_visible(&self, _device: &DeviceHandle, out: &CommandOutput) -> bool {
        out.success
    }

    fn install_instrumentation(&self, _device: &DeviceHandle) -> Vec<CommandSpec> {
        // UI tests run from the host; nothing to push onto the device.
        Vec::new()
    }

    fn cellular_kill_switch(&self, _device: &DeviceHandle) -> Option<CommandSpec> {
        None
    }

    fn installed_apps(&self, device: &DeviceHandle) -> Option<CommandSpec> {
        Some(
            CommandSpec::new("ideviceinstaller")
                .arg("-l")
                .arg("-u")
                .arg(&device.serial),
        )
    }

    fn mute_key(&self, _device: &DeviceHandle) -> Option<CommandSpec> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn android() -> AndroidDriver {
        AndroidDriver::new(AndroidSettings::default())
    }

    fn device() -> DeviceHandle {
        DeviceHandle::new("SER_A", "g23")
    }

    #[test]
    fn android_instrumentation_command_shape() {
        let spec = android().instrumentation(
            &device(),
            TaskKind::InstallEsim,
            &[("phonenumber".to_string(), "+4912345".to_string())],
        );
        assert_eq!(spec.program, "adb");
        let line = spec.to_string();
        assert!(line.contains("am instrument"));
        assert!(line.contains("-e phonenumber +4912345"));
        assert!(line.contains("-e task installESIM"));
        assert!(line.contains("-e deviceType g23"));
        assert!(spec.env.contains(&("ANDROID_SERIAL".into(), "SER_A".into())));
    }

    #[test]
    fn android_failure_marker_and_missing_device() {
        let drv = android();
        assert!(drv.output_indicates_failure("....\nFAILURES!!!\nTests run: 1"));
        assert!(!drv.output_indicates_failure("OK (1 test)"));
        assert!(drv.is_device_missing(&device(), "adb: device 'SER_A' not found"));
        assert!(drv.is_device_missing(&device(), "com.example.adextractauto.AutomationTest:\n"));
        assert!(!drv.is_device_missing(&device(), "adb: device 'SER_B' not found"));
    }

    #[test]
    fn android_hardware_reset_uses_hid_helper() {
        let cmds = android().hardware_reset(&device());
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].program.ends_with("hid-setup"));
        assert_eq!(cmds[0].args, vec!["SER_A", "g23", "reset"]);
    }

    #[test]
    fn ios_env_key_mapping() {
        assert_eq!(IosDriver::env_key("accountEmail"), "TEST_RUNNER_ACCOUNT_EMAIL");
        assert_eq!(IosDriver::env_key("experimentID"), "TEST_RUNNER_EXPERIMENT_ID");
        assert_eq!(IosDriver::env_key("phonenumber"), "TEST_RUNNER_PHONENUMBER");
    }

    #[test]
    fn ios_instrumentation_targets_testcase() {
        let drv = IosDriver::new(
            IosSettings::default(),
            "https://harvester.example.org".into(),
            "token".into(),
        );
        let ios_device = DeviceHandle::new("00008110-XYZ", "iphone_13");
        let spec = drv.instrumentation(
            &ios_device,
            TaskKind::Measurement,
            &[("accountEmail".to_string(), "a@x.com".to_string())],
        );
        assert_eq!(spec.program, "xcodebuild");
        assert!(spec.to_string().contains("test_extract_ads"));
        assert!(spec
            .env
            .contains(&("TEST_RUNNER_ACCOUNT_EMAIL".into(), "a@x.com".into())));
    }
}
