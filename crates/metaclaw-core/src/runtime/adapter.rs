//! The adapter contract every backend implements.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::claw::schema::RuntimeTarget;
use crate::policy::Policy;

use super::RuntimeError;

/// A container run request, fully resolved by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Container name (`metaclaw_<run-id>`).
    pub container_name: String,
    /// Digest-pinned image reference.
    pub image: String,
    /// Command argv.
    pub command: Vec<String>,
    /// Detach instead of waiting for exit.
    pub detach: bool,
    /// Compiled policy translated into backend flags.
    pub policy: Policy,
    /// Resolved env bindings. Keys are passed on the argv as `-e KEY`;
    /// values travel only through the subprocess environment.
    pub env: BTreeMap<String, String>,
    /// Container working directory.
    pub workdir: Option<String>,
    /// Container user.
    pub user: Option<String>,
    /// `--cpus` value.
    pub cpu: Option<String>,
    /// `--memory` value.
    pub memory: Option<String>,
}

/// What a run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Container id: backend-printed for detached runs, the container name
    /// otherwise.
    pub container_id: String,
    /// Backend exit code (the container's for attached runs).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Uniform capability set over the container backends.
pub trait Adapter {
    /// Which backend this is.
    fn name(&self) -> RuntimeTarget;

    /// Whether the backend binary is installed on this host.
    fn available(&self) -> bool;

    /// Runs a container.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] only for spawn-level failures; a container
    /// that started and exited non-zero is reported through
    /// [`RunOutput::exit_code`].
    fn run(&self, request: &RunRequest) -> Result<RunOutput, RuntimeError>;

    /// Fetches container logs. With `follow` the backend streams to the
    /// caller's terminal and the returned string is empty.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] on spawn or collection failure.
    fn logs(&self, container_id: &str, follow: bool) -> Result<String, RuntimeError>;

    /// Returns the backend's inspect JSON as an opaque string, bounded by
    /// `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DeadlineExceeded`] when the backend hangs,
    /// spawn errors otherwise.
    fn inspect(&self, container_id: &str, deadline: Duration) -> Result<String, RuntimeError>;

    /// Attaches an interactive shell to a container on the caller's tty.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShellExit`] for a non-zero shell exit.
    fn exec_shell(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Force-removes a container; callers treat failures as best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] on spawn failure.
    fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
}
