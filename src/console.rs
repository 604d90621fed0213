//! Blocking operator prompts.
//!
//! CAPTCHA intervention and supervisor escalation are intentionally
//! synchronous human-in-the-loop gates. The trait exists so tests can script
//! the operator.

use std::io::{self, BufRead, Write};
use std::sync::Mutex;

/// The operator's answer to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationChoice {
    /// Skip the task and continue with the next one.
    Continue,
    /// Run the same task again.
    Retry,
    /// Terminate the worker pair.
    Abort,
}

pub trait OperatorConsole: Send + Sync {
    /// Blocks until the operator confirms the manual CAPTCHA task is done.
    fn await_captcha_solved(&self, device: &str);

    /// Presents a failed task and returns the operator's decision.
    fn escalate(&self, task: &str, device: &str, error: &str) -> EscalationChoice;
}

/// Real console on stdin/stdout.
pub struct StdinConsole;

impl OperatorConsole for StdinConsole {
    fn await_captcha_solved(&self, device: &str) {
        println!("Found CAPTCHA, please intervene manually on device {device}.");
        print!("Please hit enter after finishing the task: ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
    }

    fn escalate(&self, task: &str, device: &str, error: &str) -> EscalationChoice {
        println!("Task {task} failed on device {device}:\n{error}");
        print!("Enter 'c' to continue with next task, 'r' to retry, anything else to abort: ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return EscalationChoice::Abort;
        }
        match line.trim().to_lowercase().as_str() {
            "c" => EscalationChoice::Continue,
            "r" => EscalationChoice::Retry,
            _ => EscalationChoice::Abort,
        }
    }
}

/// Scripted operator for tests: answers from a queue, defaulting to abort.
#[derive(Default)]
pub struct ScriptedConsole {
    answers: Mutex<Vec<EscalationChoice>>,
    escalations: Mutex<Vec<String>>,
    captchas: Mutex<Vec<String>>,
}

impl ScriptedConsole {
    pub fn answering(answers: Vec<EscalationChoice>) -> Self {
        Self {
            answers: Mutex::new(answers),
            ..Self::default()
        }
    }

    pub fn escalations(&self) -> Vec<String> {
        self.escalations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn captcha_prompts(&self) -> usize {
        self.captchas.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl OperatorConsole for ScriptedConsole {
    fn await_captcha_solved(&self, device: &str) {
        self.captchas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device.to_string());
    }

    fn escalate(&self, task: &str, device: &str, _error: &str) -> EscalationChoice {
        self.escalations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{task}@{device}"));
        let mut answers = self.answers.lock().unwrap_or_else(|e| e.into_inner());
        if answers.is_empty() {
            EscalationChoice::Abort
        } else {
            answers.remove(0)
        }
    }
}
