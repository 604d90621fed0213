//! Scripted command execution for tests.
//!
//! Plays the same role the mock adapters play for the hardware layer: the
//! retry and pipeline logic is exercised against a scripted responder
//! instead of real vendor tools.

use super::{CommandExec, CommandOutput, CommandSpec};
use crate::error::AppResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Responder = Box<dyn Fn(&CommandSpec, usize) -> CommandOutput + Send + Sync>;

/// A [`CommandExec`] that answers from a closure and records every
/// invocation. The closure receives the command and the zero-based index of
/// the call, so tests can script "fail twice, then succeed" behavior.
pub struct ScriptedExec {
    responder: Responder,
    calls: Mutex<Vec<CommandSpec>>,
    call_count: AtomicUsize,
}

impl ScriptedExec {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec, usize) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Every command succeeds with empty output.
    pub fn always_ok() -> Self {
        Self::new(|_, _| CommandOutput::ok(""))
    }

    /// All commands issued so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl CommandExec for ScriptedExec {
    fn run(&self, spec: &CommandSpec) -> AppResult<CommandOutput> {
        let index = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        Ok((self.responder)(spec, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_exec_counts_and_records() {
        let exec = ScriptedExec::new(|_, index| {
            if index < 2 {
                CommandOutput::failed("boom")
            } else {
                CommandOutput::ok("fine")
            }
        });
        let spec = CommandSpec::new("adb").arg("devices");
        assert!(!exec.run(&spec).expect("scripted").success);
        assert!(!exec.run(&spec).expect("scripted").success);
        assert!(exec.run(&spec).expect("scripted").success);
        assert_eq!(exec.call_count(), 3);
        assert_eq!(exec.calls().len(), 3);
    }
}
