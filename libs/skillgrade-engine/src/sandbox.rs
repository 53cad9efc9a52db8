/// Docker Sandbox - isolated execution of candidate code
///
/// **Core Responsibility:**
/// Run one candidate program against one test case in a fresh container and
/// report a [`RunOutcome`]. Scoring is the evaluator's job.
///
/// **Container Rules:**
/// - One container per test case, nothing shared between test cases or candidates
/// - Network disabled
/// - Memory (no swap), CPU and pids limits from `languages.json`
/// - Read-only root filesystem; the only writable paths are size-limited tmpfs
///   mounts at `/sandbox` (scratch) and `/tmp`
/// - All capabilities dropped, `no-new-privileges`, unprivileged user
/// - Hard wall-clock timeout covering compile and run; the container is killed on expiry
/// - stdout capped; exceeding the cap is a failed test case
/// - Removed on every exit path through [`ContainerGuard`]
/// - `function_result` expectations are rendered in a container of their own that
///   runs no candidate code, then cached per language and raw value
use crate::error::SandboxError;
use crate::harness::PreparedRun;
use crate::languages::{Comparison, LanguageConfig, LanguageRegistry};
use crate::runner::{CodeRunner, RunOutcome, RunRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use skillgrade_common::types::TestStatus;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Program and stdin travel base64-encoded in environment variables, which the
/// kernel caps at 128 KiB per string.
const MAX_PAYLOAD_BYTES: usize = 90 * 1024;
const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const SCRATCH_DIR: &str = "/sandbox";
const SANDBOX_USER: &str = "65534:65534";
const PROGRAM_ENV: &str = "SKILLGRADE_PROGRAM";
const STDIN_ENV: &str = "SKILLGRADE_STDIN";
const MAX_CACHED_EXPECTATIONS: usize = 4096;

/// Container cleanup guard - guarantees container removal on drop, including
/// timeout, error and cancellation of the surrounding future
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        let container_id = std::mem::take(&mut self.container_id);
        let docker = self.docker.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %container_id, "No runtime available, container left behind");
            return;
        };

        handle.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// Raw result of one container run, before judging
#[derive(Debug, Default)]
struct RawExecution {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    timed_out: bool,
    output_exceeded: bool,
    execution_time_ms: u64,
}

/// Docker-backed [`CodeRunner`]
pub struct DockerSandbox {
    docker: Docker,
    languages: LanguageRegistry,
    /// Rendered `function_result` expectations keyed by (language, raw expected output)
    expectations: Mutex<HashMap<(String, String), String>>,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon
    pub fn connect(languages: LanguageRegistry) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            languages,
            expectations: Mutex::new(HashMap::new()),
        })
    }

    /// Shell prelude: decode program into scratch, compile (diagnostics to stderr), run with stdin
    fn launch_script(config: &LanguageConfig) -> String {
        let mut script = format!(
            "set -e\nprintf '%s' \"${program}\" | base64 -d > {dir}/{file}\n",
            program = PROGRAM_ENV,
            dir = SCRATCH_DIR,
            file = config.file_name,
        );
        if let Some(compile) = &config.compile {
            script.push_str(&format!("{} 1>&2\n", compile));
        }
        script.push_str(&format!(
            "printf '%s' \"${stdin}\" | base64 -d | {run}\n",
            stdin = STDIN_ENV,
            run = config.run,
        ));
        script
    }

    fn host_config(config: &LanguageConfig) -> HostConfig {
        let memory = i64::from(config.memory_limit_mb) * 1024 * 1024;
        let tmpfs = HashMap::from([
            (
                SCRATCH_DIR.to_string(),
                "rw,exec,nosuid,size=64m,mode=1777".to_string(),
            ),
            ("/tmp".to_string(), "rw,nosuid,size=64m,mode=1777".to_string()),
        ]);

        HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(config.pids_limit),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }
    }

    /// Ensure the language image is present, pulling it on a cache miss
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    #[tracing::instrument(skip(self, config, prepared), fields(language = %config.name, timeout_ms = timeout.as_millis() as u64))]
    async fn execute(
        &self,
        config: &LanguageConfig,
        prepared: &PreparedRun,
        timeout: Duration,
    ) -> Result<RawExecution, SandboxError> {
        self.ensure_image(&config.image).await?;

        let container_name = format!("skillgrade-{}", uuid::Uuid::new_v4());
        let env = vec![
            format!("{}={}", PROGRAM_ENV, general_purpose::STANDARD.encode(&prepared.program)),
            format!("{}={}", STDIN_ENV, general_purpose::STANDARD.encode(&prepared.stdin)),
        ];

        let container_config = Config {
            image: Some(config.image.clone()),
            entrypoint: Some(vec!["sh".to_string(), "-c".to_string()]),
            cmd: Some(vec![Self::launch_script(config)]),
            env: Some(env),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SCRATCH_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(Self::host_config(config)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), container_config)
            .await?;
        let container_id = container.id.clone();

        // Set up immediately so every exit path below removes the container
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;

        let execution_future = async {
            let mut raw = RawExecution::default();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs_stream = self.docker.logs(&container_id, logs_options);

            while let Some(output) = logs_stream.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => {
                        if raw.stdout.len() + message.len() > MAX_OUTPUT_BYTES {
                            raw.output_exceeded = true;
                            break;
                        }
                        raw.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        if raw.stderr.len() < MAX_OUTPUT_BYTES {
                            raw.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            if raw.output_exceeded {
                return raw;
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            raw.exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to get container exit code");
                    None
                }
                None => None,
            };

            raw
        };

        let mut raw = match tokio::time::timeout(timeout, execution_future).await {
            Ok(raw) => raw,
            Err(_) => RawExecution {
                timed_out: true,
                ..Default::default()
            },
        };

        if raw.timed_out || raw.output_exceeded {
            // No partial output is trusted after a limit violation
            raw.stdout.clear();
            if let Err(e) = self
                .docker
                .kill_container(&container_id, None::<KillContainerOptions<String>>)
                .await
            {
                debug!(error = %e, "Kill after limit violation failed (container may have exited)");
            }
        }

        raw.execution_time_ms = start_time.elapsed().as_millis() as u64;
        Ok(raw)
    }

    /// Render a `function_result` expected output in its own container, with no candidate code
    async fn expected_value(
        &self,
        config: &LanguageConfig,
        expected_output: &str,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        let key = (config.name.clone(), expected_output.to_string());
        if let Some(rendered) = self.expectations.lock().await.get(&key) {
            return Ok(rendered.clone());
        }

        let prepared = PreparedRun::expectation(expected_output);
        check_payload(&prepared)?;
        let raw = self.execute(config, &prepared, timeout).await?;
        if raw.exit_code != Some(0) {
            return Err(SandboxError::Expectation(format!(
                "exit code {:?}: {}",
                raw.exit_code,
                raw.stderr.trim()
            )));
        }
        let rendered = prepared
            .read_expectation(&raw.stdout)
            .ok_or_else(|| SandboxError::Expectation("no rendered value in output".to_string()))?;

        let mut cache = self.expectations.lock().await;
        if cache.len() >= MAX_CACHED_EXPECTATIONS {
            cache.clear();
        }
        cache.insert(key, rendered.clone());
        Ok(rendered)
    }
}

fn check_payload(prepared: &PreparedRun) -> Result<(), SandboxError> {
    if prepared.program.len() > MAX_PAYLOAD_BYTES {
        return Err(SandboxError::InputTooLarge {
            what: "program",
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    if prepared.stdin.len() > MAX_PAYLOAD_BYTES {
        return Err(SandboxError::InputTooLarge {
            what: "test input",
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// Map a raw execution to a test status
fn classify(raw: &RawExecution, prepared: &PreparedRun, expected_output: &str) -> RunOutcome {
    let mut outcome = RunOutcome {
        status: TestStatus::WrongAnswer,
        stdout: String::new(),
        error: None,
        execution_time_ms: raw.execution_time_ms,
    };

    if raw.timed_out {
        outcome.status = TestStatus::TimedOut;
        outcome.error = Some("[Execution timed out]".to_string());
    } else if raw.output_exceeded {
        outcome.status = TestStatus::OutputLimitExceeded;
        outcome.error = Some(format!("[Output exceeded {} bytes]", MAX_OUTPUT_BYTES));
    } else if raw.exit_code != Some(0) {
        outcome.status = TestStatus::RuntimeError;
        let mut error = raw.stderr.clone();
        match raw.exit_code {
            Some(137) => error.push_str("\n[Container killed: likely exceeded memory limit]"),
            Some(139) => error.push_str("\n[Container killed: segmentation fault]"),
            Some(_) => {}
            None => error.push_str("\n[No exit code captured]"),
        }
        outcome.error = Some(error);
    } else {
        let judgement = prepared.judge(&raw.stdout, expected_output);
        outcome.status = if judgement.passed {
            TestStatus::Passed
        } else {
            TestStatus::WrongAnswer
        };
        outcome.stdout = judgement.actual;
        if !raw.stderr.is_empty() {
            outcome.error = Some(raw.stderr.clone());
        }
    }

    outcome
}

#[async_trait]
impl CodeRunner for DockerSandbox {
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutcome, SandboxError> {
        let config = self
            .languages
            .get(request.language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(request.language.to_string()))?;

        let prepared = PreparedRun::new(config.comparison, request.code, request.input);
        check_payload(&prepared)?;

        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(request.timeout);

        let expected = match config.comparison {
            Comparison::FunctionResult => {
                self.expected_value(config, request.expected_output, timeout)
                    .await?
            }
            Comparison::Stdout => request.expected_output.to_string(),
        };

        let raw = self.execute(config, &prepared, timeout).await?;
        let outcome = classify(&raw, &prepared, &expected);

        debug!(
            language = %config.name,
            status = ?outcome.status,
            execution_ms = outcome.execution_time_ms,
            "Test case executed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn language(compile: Option<&str>) -> LanguageConfig {
        LanguageConfig {
            name: "rust".to_string(),
            image: "rust:1-slim".to_string(),
            file_name: "main.rs".to_string(),
            compile: compile.map(str::to_string),
            run: "/sandbox/main".to_string(),
            comparison: Comparison::Stdout,
            memory_limit_mb: 128,
            cpu_limit: 0.5,
            timeout_ms: None,
            pids_limit: 32,
        }
    }

    fn raw(stdout: &str, exit_code: Option<i64>) -> RawExecution {
        RawExecution {
            stdout: stdout.to_string(),
            exit_code,
            execution_time_ms: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_launch_script_with_compile_step() {
        let script = DockerSandbox::launch_script(&language(Some("rustc -o /sandbox/main /sandbox/main.rs")));
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "set -e");
        assert!(lines[1].contains("base64 -d > /sandbox/main.rs"));
        assert_eq!(lines[2], "rustc -o /sandbox/main /sandbox/main.rs 1>&2");
        assert!(lines[3].contains("$SKILLGRADE_STDIN"));
        assert!(lines[3].ends_with("| /sandbox/main"));
    }

    #[test]
    fn test_launch_script_without_compile_step() {
        let script = DockerSandbox::launch_script(&language(None));
        assert_eq!(script.lines().count(), 3);
    }

    #[test]
    fn test_host_config_isolation() {
        let host = DockerSandbox::host_config(&language(None));

        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(32));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert!(host.tmpfs.unwrap().contains_key(SCRATCH_DIR));
    }

    #[test]
    fn test_payload_limits() {
        let small = PreparedRun::new(Comparison::Stdout, "fn main() {}", "1");
        assert!(check_payload(&small).is_ok());

        let big_program = PreparedRun::new(Comparison::Stdout, &"x".repeat(MAX_PAYLOAD_BYTES + 1), "");
        assert!(matches!(
            check_payload(&big_program),
            Err(SandboxError::InputTooLarge { what: "program", .. })
        ));

        let big_input = PreparedRun::new(Comparison::Stdout, "", &"1".repeat(MAX_PAYLOAD_BYTES + 1));
        assert!(matches!(
            check_payload(&big_input),
            Err(SandboxError::InputTooLarge { what: "test input", .. })
        ));
    }

    #[test]
    fn test_classify_passed_and_wrong_answer() {
        let prepared = PreparedRun::new(Comparison::Stdout, "", "");

        let passed = classify(&raw("42\n", Some(0)), &prepared, "42");
        assert_eq!(passed.status, TestStatus::Passed);
        assert_eq!(passed.stdout, "42");
        assert_eq!(passed.execution_time_ms, 12);

        let wrong = classify(&raw("41", Some(0)), &prepared, "42");
        assert_eq!(wrong.status, TestStatus::WrongAnswer);
    }

    #[test]
    fn test_classify_runtime_error_ignores_output() {
        let prepared = PreparedRun::new(Comparison::Stdout, "", "");
        let outcome = classify(&raw("42", Some(137)), &prepared, "42");

        assert_eq!(outcome.status, TestStatus::RuntimeError);
        assert!(outcome.error.unwrap().contains("memory limit"));
    }

    #[test]
    fn test_classify_missing_exit_code_is_runtime_error() {
        let prepared = PreparedRun::new(Comparison::Stdout, "", "");
        let outcome = classify(&raw("42", None), &prepared, "42");
        assert_eq!(outcome.status, TestStatus::RuntimeError);
    }

    #[test]
    fn test_classify_limits_take_priority() {
        let prepared = PreparedRun::new(Comparison::Stdout, "", "");

        let timed_out = RawExecution {
            timed_out: true,
            ..raw("", None)
        };
        assert_eq!(classify(&timed_out, &prepared, "42").status, TestStatus::TimedOut);

        let flooded = RawExecution {
            output_exceeded: true,
            ..raw("", Some(0))
        };
        assert_eq!(
            classify(&flooded, &prepared, "42").status,
            TestStatus::OutputLimitExceeded
        );
    }
}
