//! Runtime adapter layer: a uniform contract over container backends.
//!
//! Three backends (podman, docker, apple `container`) share one CLI
//! engine; the [`Resolver`] picks one by precedence: explicit override,
//! then the clawfile target, then the host default order, skipping any
//! backend whose binary is not installed.

pub mod adapter;
pub mod cli;
pub mod inspect;

use thiserror::Error;

pub use adapter::{Adapter, RunOutput, RunRequest};
pub use cli::CliBackend;

use crate::claw::schema::RuntimeTarget;

/// Errors produced by the runtime layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The requested backend is not installed.
    #[error("runtime {0} is not available on this host")]
    TargetUnavailable(RuntimeTarget),

    /// The clawfile-declared backend is not installed.
    #[error("runtime {0} declared in clawfile is not available")]
    ClawfileTargetUnavailable(RuntimeTarget),

    /// No backend could be found at all.
    #[error("no supported runtime available; install podman, docker, or apple container")]
    NoRuntimeAvailable,

    /// The backend binary failed to spawn.
    #[error("spawn {bin}: {source}")]
    Spawn {
        /// Backend binary name.
        bin: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading the backend's output failed.
    #[error("collect {bin} output: {source}")]
    Collect {
        /// Backend binary name.
        bin: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A deadline-bounded call did not finish in time.
    #[error("{bin} did not finish within {seconds}s")]
    DeadlineExceeded {
        /// Backend binary name.
        bin: &'static str,
        /// Deadline that elapsed.
        seconds: u64,
    },

    /// An interactive shell ended with a non-zero status.
    #[error("shell session ended with non-zero exit ({code})")]
    ShellExit {
        /// Exit code of the shell.
        code: i32,
    },

    /// The backend returned an empty inspect payload.
    #[error("empty inspect payload")]
    EmptyInspect,

    /// The inspect payload could not be decoded.
    #[error("parse inspect payload: {0}")]
    InspectParse(#[source] serde_json::Error),

    /// The inspect payload carries no container status.
    #[error("inspect payload missing container status")]
    InspectMissingStatus,
}

/// Selects an adapter from the installed backends.
pub struct Resolver {
    adapters: Vec<CliBackend>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    /// Builds the resolver with all known backends.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: vec![
                CliBackend::new("podman", RuntimeTarget::Podman),
                CliBackend::new("container", RuntimeTarget::AppleContainer),
                CliBackend::new("docker", RuntimeTarget::Docker),
            ],
        }
    }

    /// Looks up the adapter for a target regardless of availability.
    #[must_use]
    pub fn adapter(&self, target: RuntimeTarget) -> Option<&CliBackend> {
        self.adapters.iter().find(|a| a.name() == target)
    }

    /// Resolves the adapter to run with.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::TargetUnavailable`] when an explicit override is not
    /// installed, [`RuntimeError::ClawfileTargetUnavailable`] for a missing
    /// clawfile target, [`RuntimeError::NoRuntimeAvailable`] when nothing
    /// on the host default order probes as available.
    pub fn resolve(
        &self,
        cli_override: Option<RuntimeTarget>,
        clawfile_target: Option<RuntimeTarget>,
    ) -> Result<&CliBackend, RuntimeError> {
        if let Some(target) = cli_override {
            let adapter = self
                .adapter(target)
                .filter(|a| a.available())
                .ok_or(RuntimeError::TargetUnavailable(target))?;
            return Ok(adapter);
        }
        if let Some(target) = clawfile_target {
            let adapter = self
                .adapter(target)
                .filter(|a| a.available())
                .ok_or(RuntimeError::ClawfileTargetUnavailable(target))?;
            return Ok(adapter);
        }
        for target in host_default_order() {
            if let Some(adapter) = self.adapter(target).filter(|a| a.available()) {
                return Ok(adapter);
            }
        }
        Err(RuntimeError::NoRuntimeAvailable)
    }
}

/// Backend preference when nothing is declared.
#[must_use]
pub fn host_default_order() -> [RuntimeTarget; 3] {
    if cfg!(target_os = "macos") {
        [
            RuntimeTarget::AppleContainer,
            RuntimeTarget::Docker,
            RuntimeTarget::Podman,
        ]
    } else {
        [
            RuntimeTarget::Podman,
            RuntimeTarget::Docker,
            RuntimeTarget::AppleContainer,
        ]
    }
}
