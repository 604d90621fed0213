//! Ordered failure-classification rules.
//!
//! The rules encode hard-won operational knowledge about the instrumentation
//! and the devices, matched by literal substring on the command output. They
//! are kept as an explicit, ordered table so the policy can be reviewed and
//! tested on its own; the first rule that matches wins.

use super::TaskKind;

/// Instrumentation marker for accounts that never receive personalization.
pub const NO_PERSONALIZATION_MARKER: &str = "ACCOUNT_DOES_NOT_HAVE_PERSONALIZATION";
/// Instrumentation marker requiring manual operator intervention.
const CAPTCHA_MARKER: &str = "CAPTCHA";

/// Everything a rule may look at about one failed attempt.
pub(crate) struct FailureContext<'a> {
    pub task: TaskKind,
    /// Device matches the "device not found" signature for its platform.
    pub device_missing: bool,
    /// Device is on the known eSIM-connectivity-quirk list.
    pub esim_quirk: bool,
    pub output: &'a str,
    pub restartable: bool,
}

/// What the task runner should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Pause for the operator, then run the guided completion path.
    ManualCaptcha,
    /// Alternate non-error path: the account gets no personalization.
    NoPersonalization,
    /// Measurement crashes are absorbed; the sampling loop re-invokes.
    MeasurementCrash,
    /// The device is mid-reboot; the reset already took effect.
    RebootNoise,
    /// Known connectivity quirk during eSIM handling; success after a grace
    /// period.
    EsimQuirk,
    /// Sleep and retry the same attempt.
    Restart,
    /// Hand the failure to the operator.
    Escalate,
}

pub(crate) struct Rule {
    pub name: &'static str,
    eval: fn(&FailureContext) -> Option<Verdict>,
}

/// The policy, in priority order. The final rule always matches.
pub(crate) const RULES: &[Rule] = &[
    Rule {
        name: "captcha",
        eval: |ctx| ctx.output.contains(CAPTCHA_MARKER).then_some(Verdict::ManualCaptcha),
    },
    Rule {
        name: "no-personalization",
        eval: |ctx| {
            (matches!(
                ctx.task,
                TaskKind::EnablePersonalization | TaskKind::DisablePersonalization
            ) && ctx.output.contains(NO_PERSONALIZATION_MARKER))
            .then_some(Verdict::NoPersonalization)
        },
    },
    Rule {
        name: "measurement-crash",
        eval: |ctx| (ctx.task == TaskKind::Measurement).then_some(Verdict::MeasurementCrash),
    },
    Rule {
        name: "reset-reboot-noise",
        eval: |ctx| {
            (ctx.task == TaskKind::FactoryReset && ctx.device_missing)
                .then_some(Verdict::RebootNoise)
        },
    },
    Rule {
        name: "esim-connectivity-quirk",
        eval: |ctx| {
            (matches!(ctx.task, TaskKind::InstallEsim | TaskKind::RemoveEsim)
                && ctx.esim_quirk
                && ctx.device_missing)
                .then_some(Verdict::EsimQuirk)
        },
    },
    Rule {
        name: "restartable",
        eval: |ctx| ctx.restartable.then_some(Verdict::Restart),
    },
    Rule {
        name: "escalate",
        eval: |_| Some(Verdict::Escalate),
    },
];

/// Runs the table; returns the matching rule's name and verdict.
pub(crate) fn classify(ctx: &FailureContext) -> (&'static str, Verdict) {
    for rule in RULES {
        if let Some(verdict) = (rule.eval)(ctx) {
            return (rule.name, verdict);
        }
    }
    // The table ends in a catch-all; this is unreachable in practice.
    ("escalate", Verdict::Escalate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(task: TaskKind, output: &str) -> FailureContext<'_> {
        FailureContext {
            task,
            device_missing: false,
            esim_quirk: false,
            output,
            restartable: false,
        }
    }

    #[test]
    fn captcha_wins_over_everything() {
        let mut context = ctx(TaskKind::Measurement, "blocked by CAPTCHA challenge");
        context.restartable = true;
        assert_eq!(classify(&context).1, Verdict::ManualCaptcha);
    }

    #[test]
    fn personalization_marker_only_for_toggle_tasks() {
        let toggled = ctx(
            TaskKind::EnablePersonalization,
            "ACCOUNT_DOES_NOT_HAVE_PERSONALIZATION",
        );
        assert_eq!(classify(&toggled).1, Verdict::NoPersonalization);

        let other = ctx(TaskKind::Login, "ACCOUNT_DOES_NOT_HAVE_PERSONALIZATION");
        assert_eq!(classify(&other).1, Verdict::Escalate);
    }

    #[test]
    fn measurement_never_escalates() {
        assert_eq!(
            classify(&ctx(TaskKind::Measurement, "Process crashed")).1,
            Verdict::MeasurementCrash
        );
    }

    #[test]
    fn reset_is_idempotent_when_device_goes_down() {
        let mut context = ctx(TaskKind::FactoryReset, "adb: device 'SER_A' not found");
        context.device_missing = true;
        assert_eq!(classify(&context).1, Verdict::RebootNoise);

        // Same output on another task is not reboot noise.
        let mut other = ctx(TaskKind::SetupWifi, "adb: device 'SER_A' not found");
        other.device_missing = true;
        assert_eq!(classify(&other).1, Verdict::Escalate);
    }

    #[test]
    fn esim_quirk_requires_quirky_device() {
        let mut quirky = ctx(TaskKind::InstallEsim, "adb: device 'SER_Q' not found");
        quirky.device_missing = true;
        quirky.esim_quirk = true;
        assert_eq!(classify(&quirky).1, Verdict::EsimQuirk);

        let mut normal = ctx(TaskKind::InstallEsim, "adb: device 'SER_A' not found");
        normal.device_missing = true;
        assert_eq!(classify(&normal).1, Verdict::Escalate);
    }

    #[test]
    fn restartable_retries_before_escalation() {
        let mut context = ctx(TaskKind::SetupWifi, "some transient failure");
        context.restartable = true;
        assert_eq!(classify(&context).1, Verdict::Restart);
        context.restartable = false;
        assert_eq!(classify(&context).1, Verdict::Escalate);
    }
}
