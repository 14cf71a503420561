//! Shared CLI engine behind the three container backends.
//!
//! The backends accept an identical flag dialect for everything this
//! control plane emits (`run`, `logs`, `inspect`, `exec`, `rm`), so one
//! engine parameterized by binary name covers all of them.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::claw::schema::{NetworkMode, RuntimeTarget};
use crate::policy::Policy;

use super::adapter::{Adapter, RunOutput, RunRequest};
use super::RuntimeError;

/// One container backend, addressed through its CLI binary.
#[derive(Debug, Clone)]
pub struct CliBackend {
    bin: &'static str,
    target: RuntimeTarget,
}

impl CliBackend {
    /// Creates a backend for `bin` reporting as `target`.
    #[must_use]
    pub const fn new(bin: &'static str, target: RuntimeTarget) -> Self {
        Self { bin, target }
    }

    /// The backend binary name.
    #[must_use]
    pub const fn bin(&self) -> &'static str {
        self.bin
    }
}

impl Adapter for CliBackend {
    fn name(&self) -> RuntimeTarget {
        self.target
    }

    fn available(&self) -> bool {
        binary_on_path(self.bin)
    }

    fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError> {
        let mut args = vec!["run".to_string(), "--name".to_string(), request.container_name.clone()];
        if request.detach {
            args.push("-d".to_string());
        }
        args.extend(policy_flags(
            &request.policy,
            &request.env,
            request.workdir.as_deref(),
            request.user.as_deref(),
            request.cpu.as_deref(),
            request.memory.as_deref(),
        ));
        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());

        debug!(bin = self.bin, container = %request.container_name, "starting container");
        let (stdout, stderr, exit_code) = self.capture(&args, &request.env, None)?;
        let container_id = if request.detach {
            stdout.trim().to_string()
        } else {
            request.container_name.clone()
        };
        Ok(RunOutput {
            container_id,
            exit_code,
            stdout,
            stderr,
        })
    }

    fn logs(&self, container_id: &str, follow: bool) -> Result<String, RuntimeError> {
        if follow {
            // Stream straight to the caller's terminal until the container
            // (or the operator) ends the session.
            Command::new(self.bin)
                .args(["logs", "--follow", container_id])
                .status()
                .map_err(|source| RuntimeError::Spawn {
                    bin: self.bin,
                    source,
                })?;
            return Ok(String::new());
        }
        let (stdout, stderr, _) = self.capture(
            &["logs".to_string(), container_id.to_string()],
            &BTreeMap::new(),
            None,
        )?;
        Ok(format!("{stdout}{stderr}"))
    }

    fn inspect(&self, container_id: &str, deadline: Duration) -> Result<String, RuntimeError> {
        let (stdout, _, _) = self.capture(
            &["inspect".to_string(), container_id.to_string()],
            &BTreeMap::new(),
            Some(deadline),
        )?;
        Ok(stdout)
    }

    fn exec_shell(&self, container_id: &str) -> Result<(), RuntimeError> {
        let status = Command::new(self.bin)
            .args(["exec", "-it", container_id, "sh"])
            .status()
            .map_err(|source| RuntimeError::Spawn {
                bin: self.bin,
                source,
            })?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(RuntimeError::ShellExit { code }),
            None => Err(RuntimeError::ShellExit { code: -1 }),
        }
    }

    fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.capture(
            &["rm".to_string(), "-f".to_string(), container_id.to_string()],
            &BTreeMap::new(),
            None,
        )
        .map(|_| ())
    }
}

impl CliBackend {
    /// Runs the backend binary, capturing stdout/stderr and the exit code.
    ///
    /// Env values ride in the subprocess environment only; the argv never
    /// carries them. With a deadline the child is polled and killed on
    /// expiry (inspect payloads are small enough not to fill the pipe
    /// before exit).
    fn capture(
        &self,
        args: &[String],
        extra_env: &BTreeMap<String, String>,
        deadline: Option<Duration>,
    ) -> Result<(String, String, i32), RuntimeError> {
        let mut cmd = Command::new(self.bin);
        cmd.args(args)
            .envs(extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            bin: self.bin,
            source,
        })?;

        if let Some(deadline) = deadline {
            let started = Instant::now();
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {
                        if started.elapsed() > deadline {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(RuntimeError::DeadlineExceeded {
                                bin: self.bin,
                                seconds: deadline.as_secs(),
                            });
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(source) => {
                        return Err(RuntimeError::Collect {
                            bin: self.bin,
                            source,
                        })
                    }
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|source| RuntimeError::Collect {
                bin: self.bin,
                source,
            })?;
        let exit = output.status.code().unwrap_or(-1);
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            exit,
        ))
    }
}

/// Translates the policy and env into backend flags.
///
/// Env keys appear on the argv as `-e KEY` only; the backend reads the
/// value by name from its own environment.
#[must_use]
pub fn policy_flags(
    policy: &Policy,
    env: &BTreeMap<String, String>,
    workdir: Option<&str>,
    user: Option<&str>,
    cpu: Option<&str>,
    memory: Option<&str>,
) -> Vec<String> {
    let mut args = Vec::new();
    match policy.network.mode {
        NetworkMode::None => args.push("--network=none".to_string()),
        NetworkMode::Outbound => args.push("--network=bridge".to_string()),
        NetworkMode::All => args.push("--network=host".to_string()),
    }
    for mount in &policy.mounts {
        let mut volume = format!("{}:{}", mount.source, mount.target);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }
    for key in env.keys() {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    if let Some(workdir) = workdir.filter(|w| !w.is_empty()) {
        args.push("-w".to_string());
        args.push(workdir.to_string());
    }
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        args.push("-u".to_string());
        args.push(user.to_string());
    }
    if let Some(cpu) = cpu.filter(|c| !c.is_empty()) {
        args.push("--cpus".to_string());
        args.push(cpu.to_string());
    }
    if let Some(memory) = memory.filter(|m| !m.is_empty()) {
        args.push("--memory".to_string());
        args.push(memory.to_string());
    }
    args
}

fn binary_on_path(bin: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(bin)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MountPolicy, NetworkPolicy};

    fn policy(mode: NetworkMode) -> Policy {
        Policy {
            version: crate::policy::POLICY_VERSION.to_string(),
            network: NetworkPolicy {
                mode,
                allowed: mode != NetworkMode::None,
            },
            mounts: vec![MountPolicy {
                source: "/host/data".to_string(),
                target: "/data".to_string(),
                read_only: true,
            }],
            env_allowlist: vec!["OPENAI_API_KEY".to_string()],
            workdir: None,
            user: None,
        }
    }

    #[test]
    fn env_values_never_reach_the_argv() {
        let env: BTreeMap<String, String> =
            [("OPENAI_API_KEY".to_string(), "sk-secret".to_string())]
                .into_iter()
                .collect();
        let args = policy_flags(&policy(NetworkMode::None), &env, Some("/work"), None, Some("0.5"), Some("256m"));

        assert!(!args.iter().any(|a| a.contains("sk-secret")));
        assert!(!args.iter().any(|a| a.contains('=') && a.contains("OPENAI")));
        let key_pos = args.iter().position(|a| a == "OPENAI_API_KEY").unwrap();
        assert_eq!(args[key_pos - 1], "-e");
    }

    #[test]
    fn network_modes_map_to_backend_flags() {
        let env = BTreeMap::new();
        for (mode, flag) in [
            (NetworkMode::None, "--network=none"),
            (NetworkMode::Outbound, "--network=bridge"),
            (NetworkMode::All, "--network=host"),
        ] {
            let args = policy_flags(&policy(mode), &env, None, None, None, None);
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
    }

    #[test]
    fn read_only_mounts_carry_the_ro_suffix() {
        let args = policy_flags(&policy(NetworkMode::None), &BTreeMap::new(), None, None, None, None);
        let volume_pos = args.iter().position(|a| a == "-v").unwrap();
        assert_eq!(args[volume_pos + 1], "/host/data:/data:ro");
    }

    #[test]
    fn resource_flags_are_emitted_in_pairs() {
        let args = policy_flags(
            &policy(NetworkMode::None),
            &BTreeMap::new(),
            Some("/work"),
            Some("1000"),
            Some("2"),
            Some("2g"),
        );
        for (flag, value) in [("-w", "/work"), ("-u", "1000"), ("--cpus", "2"), ("--memory", "2g")] {
            let pos = args.iter().position(|a| a == flag).unwrap();
            assert_eq!(args[pos + 1], value);
        }
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let backend = CliBackend::new("metaclaw-test-no-such-binary", RuntimeTarget::Docker);
        assert!(!backend.available());
    }
}
