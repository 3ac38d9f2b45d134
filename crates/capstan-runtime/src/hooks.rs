//! Lifecycle hook execution.
//!
//! Hooks are external programs run by the controller, never by the init
//! process: pre-start hooks run mid-bootstrap while the controller still
//! sees the host view of the init pid, post-start and post-stop hooks run
//! around the workload's lifetime. Each hook receives the container state
//! as a single JSON line on stdin and runs under a deadline; a hook that
//! outlives its deadline is killed.
//!
//! Pre-start failures abort the creation. Post-start and post-stop
//! failures are logged and otherwise ignored, so a broken notification
//! script cannot wedge a stop or destroy.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::HookSpec;
use capstan_common::types::{ContainerId, ContainerStatus};

/// How often a running hook is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builds the one-line JSON state document passed to hooks on stdin.
#[must_use]
pub fn payload(id: &ContainerId, pid: i32, status: ContainerStatus) -> String {
    let mut line = serde_json::json!({
        "id": id.as_str(),
        "pid": pid,
        "status": status.to_string(),
    })
    .to_string();
    line.push('\n');
    line
}

/// Runs hook programs with a per-hook deadline.
#[derive(Debug, Clone)]
pub struct HookRunner {
    default_timeout: Duration,
}

impl HookRunner {
    /// A runner whose hooks default to the given deadline.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Runs pre-start hooks in order; the first failure aborts.
    ///
    /// # Errors
    ///
    /// Returns a bootstrap error naming the failing hook; the caller
    /// tears the creation down.
    pub fn run_pre_start(&self, hooks: &[HookSpec], payload: &str) -> Result<()> {
        for hook in hooks {
            self.run_one(hook, payload)
                .map_err(|message| CapstanError::bootstrap("PreStartHooks", message))?;
        }
        Ok(())
    }

    /// Runs hooks in order, logging failures instead of returning them.
    pub fn run_best_effort(&self, phase: &'static str, hooks: &[HookSpec], payload: &str) {
        for hook in hooks {
            if let Err(message) = self.run_one(hook, payload) {
                tracing::warn!(phase, %message, "lifecycle hook failed");
            }
        }
    }

    fn timeout_for(&self, hook: &HookSpec) -> Duration {
        hook.timeout_secs
            .map_or(self.default_timeout, Duration::from_secs)
    }

    /// Runs a single hook to completion or its deadline.
    ///
    /// The hook's environment is exactly the spec's, stdin carries the
    /// payload, stdout is discarded, and stderr is kept for the failure
    /// message.
    fn run_one(&self, hook: &HookSpec, payload: &str) -> std::result::Result<(), String> {
        let program = hook.program.display();
        let mut command = Command::new(&hook.program);
        let _ = command
            .args(&hook.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        for entry in &hook.env {
            match entry.split_once('=') {
                Some((key, value)) => {
                    let _ = command.env(key, value);
                }
                None => {
                    tracing::warn!(hook = %program, entry, "ignoring malformed environment entry");
                }
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| format!("hook {program}: spawn: {e}"))?;

        // A hook is free to ignore its stdin; EPIPE here is not a failure.
        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write;
            let _ = stdin.write_all(payload.as_bytes());
        }

        let timeout = self.timeout_for(hook);
        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(format!(
                            "hook {program} timed out after {}s",
                            timeout.as_secs()
                        ));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(format!("hook {program}: wait: {e}")),
            }
        };

        if status.success() {
            tracing::debug!(hook = %program, "lifecycle hook finished");
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let detail = stderr.trim();
        if detail.is_empty() {
            Err(format!("hook {program}: {status}"))
        } else {
            Err(format!("hook {program}: {status}: {detail}"))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    fn sh(script: &str, env: Vec<String>) -> HookSpec {
        let mut hook = HookSpec::new("/bin/sh");
        hook.args = vec!["-c".into(), script.into()];
        hook.env = env;
        hook
    }

    fn runner() -> HookRunner {
        HookRunner::new(Duration::from_secs(5))
    }

    #[test]
    fn payload_is_one_json_line() {
        let line = payload(&ContainerId::new("alpha"), 4321, ContainerStatus::Running);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(&line).expect("valid JSON");
        assert_eq!(value["id"], "alpha");
        assert_eq!(value["pid"], 4321);
        assert_eq!(value["status"], "running");
    }

    #[test]
    fn pre_start_hooks_run_in_order_and_see_the_payload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let order = dir.path().join("order");
        let captured = dir.path().join("captured");
        let env = vec![
            "PATH=/usr/bin:/bin".to_owned(),
            format!("ORDER={}", order.display()),
            format!("CAPTURED={}", captured.display()),
        ];

        let hooks = vec![
            sh("echo first >> \"$ORDER\"; cat > \"$CAPTURED\"", env.clone()),
            sh("echo second >> \"$ORDER\"", env),
        ];
        let line = payload(&ContainerId::new("alpha"), 7, ContainerStatus::Creating);
        runner()
            .run_pre_start(&hooks, &line)
            .expect("hooks succeed");

        let order = std::fs::read_to_string(order).expect("order file");
        assert_eq!(order, "first\nsecond\n");
        let captured = std::fs::read_to_string(captured).expect("captured payload");
        assert_eq!(captured, line);
    }

    #[test]
    fn pre_start_failure_names_the_hook_and_its_stderr() {
        let hooks = vec![sh("echo boom >&2; exit 3", Vec::new())];
        let err = runner()
            .run_pre_start(&hooks, "{}\n")
            .expect_err("failing hook");
        assert!(
            matches!(
                &err,
                CapstanError::Bootstrap { step, message }
                    if step == "PreStartHooks"
                        && message.contains("/bin/sh")
                        && message.contains("boom")
            ),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn pre_start_stops_at_the_first_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let marker = dir.path().join("marker");
        let env = vec![
            "PATH=/usr/bin:/bin".to_owned(),
            format!("MARKER={}", marker.display()),
        ];

        let hooks = vec![
            sh("exit 1", Vec::new()),
            sh("touch \"$MARKER\"", env),
        ];
        assert!(runner().run_pre_start(&hooks, "{}\n").is_err());
        assert!(!marker.exists(), "later hooks must not run after a failure");
    }

    #[test]
    fn hook_exceeding_its_deadline_is_killed() {
        let mut hook = sh("sleep 30", vec!["PATH=/usr/bin:/bin".to_owned()]);
        hook.timeout_secs = Some(1);

        let started = Instant::now();
        let err = runner()
            .run_pre_start(&[hook], "{}\n")
            .expect_err("hook must time out");
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10), "kill is prompt");
    }

    #[test]
    fn best_effort_hooks_swallow_failures_but_keep_running() {
        let dir = tempfile::tempdir().expect("temp dir");
        let marker = dir.path().join("marker");
        let env = vec![
            "PATH=/usr/bin:/bin".to_owned(),
            format!("MARKER={}", marker.display()),
        ];

        let hooks = vec![
            sh("exit 1", Vec::new()),
            sh("touch \"$MARKER\"", env),
        ];
        runner().run_best_effort("post-stop", &hooks, "{}\n");
        assert!(marker.exists(), "failure must not stop later hooks");
    }

    #[test]
    fn hook_environment_is_exactly_the_spec_environment() {
        let dir = tempfile::tempdir().expect("temp dir");
        let out = dir.path().join("env");
        let env = vec![format!("OUT={}", out.display()), "ONLY=this".into()];

        // `set` is a builtin, so the hook works without any PATH.
        let hooks = vec![sh("set > \"$OUT\"", env)];
        runner().run_pre_start(&hooks, "{}\n").expect("hook succeeds");

        let seen = std::fs::read_to_string(out).expect("variable dump");
        assert!(seen.contains("ONLY"), "{seen}");
        assert!(!seen.contains("CARGO"), "controller environment must not leak: {seen}");
    }
}
