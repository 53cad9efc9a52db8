// Code runner contract: one candidate program against one test case

use crate::error::SandboxError;
use async_trait::async_trait;
use skillgrade_common::types::TestStatus;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub code: &'a str,
    pub input: &'a str,
    pub expected_output: &'a str,
    pub language: &'a str,
    pub timeout: Duration,
}

/// What happened to one test case execution
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: TestStatus,
    pub stdout: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    pub fn with_status(status: TestStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            error: None,
            execution_time_ms: 0,
        }
    }
}

/// Executes untrusted code in isolation.
///
/// Timeouts, crashes and resource violations are reported as an `Ok` outcome with a
/// failing status. `Err` is reserved for runs that could not be launched at all.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutcome, SandboxError>;
}

#[async_trait]
impl<T: CodeRunner + ?Sized> CodeRunner for std::sync::Arc<T> {
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutcome, SandboxError> {
        (**self).run(request).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for tests that must not need Docker

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub enum Scripted {
        Outcome(TestStatus),
        LaunchFailure,
    }

    /// Replays scripted outcomes in call order; falls back to `default` once exhausted
    pub struct ScriptedRunner {
        script: Mutex<VecDeque<Scripted>>,
        default: TestStatus,
        pub calls: Mutex<Vec<(String, String, String)>>,
    }

    impl ScriptedRunner {
        pub fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                default: TestStatus::WrongAnswer,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always(status: TestStatus) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                default: status,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CodeRunner for ScriptedRunner {
        async fn run(&self, request: RunRequest<'_>) -> Result<RunOutcome, SandboxError> {
            self.calls.lock().unwrap().push((
                request.language.to_string(),
                request.input.to_string(),
                request.expected_output.to_string(),
            ));

            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::LaunchFailure) => {
                    Err(SandboxError::UnsupportedLanguage(request.language.to_string()))
                }
                Some(Scripted::Outcome(status)) => Ok(RunOutcome::with_status(status)),
                None => Ok(RunOutcome::with_status(self.default)),
            }
        }
    }
}
