//! Run lifecycle management.
//!
//! The manager owns the whole path from input (clawfile or capsule
//! directory) to a persisted, observable run: compile/load, capsule
//! upsert, adapter resolution, env resolution, the run itself, stdout and
//! stderr capture, status transitions, and the event trail. Detached rows
//! are reconciled against the backend on every read.

mod reconcile;

pub use reconcile::{map_container_status, ContainerDisposition, INSPECT_DEADLINE};

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Timelike, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::capsule::{self, CapsuleError};
use crate::claw::schema::{Clawfile, LifecycleMode, RuntimeTarget};
use crate::claw::validate::ENV_NAME;
use crate::compiler::{self, CompileError};
use crate::events::{self, EventDraft, Phase};
use crate::llm::{self, LlmError};
use crate::policy::Policy;
use crate::runtime::{Adapter, Resolver, RunRequest, RuntimeError};
use crate::store::{RunRecord, RunStatus, Store, StoreError};

/// Options accepted by [`Manager::run`].
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// `.claw` file or capsule directory.
    pub input_path: PathBuf,
    /// Detach regardless of lifecycle.
    pub detach: bool,
    /// Explicit backend override.
    pub runtime_override: Option<RuntimeTarget>,
    /// Inline LLM API key.
    pub llm_api_key: Option<String>,
    /// Host env name to read the LLM API key from.
    pub llm_api_key_env: Option<String>,
    /// Host env names to inject as secrets (repeatable flag).
    pub secret_envs: Vec<String>,
}

/// Errors produced by the lifecycle manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Input is neither a `.claw` file nor a directory.
    #[error("input must be .claw file or capsule directory: {0}")]
    InvalidInput(String),

    /// Input path could not be inspected.
    #[error("stat {path}: {source}")]
    Stat {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Compilation of a `.claw` input failed.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Loading a capsule directory failed.
    #[error("load capsule: {0}")]
    Capsule(#[from] CapsuleError),

    /// A capsule document could not be decoded.
    #[error("parse capsule {what}: {source}")]
    CapsuleDoc {
        /// `ir` or `policy`.
        what: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// Reading a capsule document failed.
    #[error("read capsule {what}: {source}")]
    CapsuleRead {
        /// `ir` or `policy`.
        what: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Runtime layer failure.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// LLM key resolution failure.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// A `--secret-env` name fails the env-name pattern.
    #[error("invalid --secret-env name: {0:?}")]
    InvalidSecretEnv(String),

    /// A `--secret-env` host variable is unset or blank.
    #[error("host env {0} is empty")]
    SecretEnvEmpty(String),

    /// The stored runtime target of a run no longer parses.
    #[error("{0}")]
    InvalidRuntimeTarget(String),

    /// The adapter for a stored run is not registered.
    #[error("runtime adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// A debug shell was requested for a non-debuggable run.
    #[error("run {run_id} is not debuggable (status={status})")]
    NotDebuggable {
        /// The run.
        run_id: String,
        /// Its current status.
        status: RunStatus,
    },
}

/// The lifecycle manager.
pub struct Manager {
    state_dir: PathBuf,
    store: Store,
    resolver: Resolver,
}

#[derive(Debug, Deserialize)]
struct IrDoc {
    clawfile: Clawfile,
}

impl Manager {
    /// Opens a manager over `state_dir` (default `.metaclaw`).
    ///
    /// # Errors
    ///
    /// Store open errors.
    pub fn open(state_dir: &Path) -> Result<Self, ManagerError> {
        let store = Store::open(state_dir)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            store,
            resolver: Resolver::new(),
        })
    }

    /// The state directory this manager operates on.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Executes a run end to end and returns the final record.
    ///
    /// Failed runs come back as `Ok` with a terminal failure status; `Err`
    /// is reserved for infrastructure failures before or around the
    /// container itself.
    ///
    /// # Errors
    ///
    /// Compile/load, store, resolution, and env errors.
    pub fn run(&self, opts: &RunOptions) -> Result<RunRecord, ManagerError> {
        let (cfg, policy, capsule_path, capsule_id) = self.prepare_capsule(&opts.input_path)?;
        self.store
            .upsert_capsule(&capsule_id, &capsule_path.display().to_string())?;

        let adapter = self
            .resolver
            .resolve(opts.runtime_override, cfg.agent.runtime.target)?;
        let target = adapter.name();

        let resolved_llm = llm::resolve(
            &cfg.agent.llm,
            &llm::RuntimeOptions {
                api_key: opts.llm_api_key.clone(),
                api_key_env: opts.llm_api_key_env.clone(),
            },
        )?;
        let secrets = resolve_host_secret_envs(&opts.secret_envs)?;
        let env = merge_env([cfg.agent.habitat.env.clone(), resolved_llm.env, secrets]);

        let run_id = make_run_id();
        let mut record = RunRecord {
            run_id: run_id.clone(),
            capsule_id,
            capsule_path: capsule_path.display().to_string(),
            status: RunStatus::Running,
            lifecycle: serde_variant(cfg.agent.lifecycle()),
            runtime_target: target.to_string(),
            container_id: String::new(),
            exit_code: None,
            started_at: crate::store::now_rfc3339(),
            ended_at: String::new(),
            last_error: String::new(),
        };
        self.store.insert_run(&record)?;
        self.emit(
            &run_id,
            EventDraft::new(Phase::Resolve, target.as_str(), "runtime selected"),
        );

        let container_name = format!("metaclaw_{run_id}");
        let detached = opts.detach || cfg.agent.lifecycle() == LifecycleMode::Daemon;
        let request = RunRequest {
            container_name: container_name.clone(),
            image: cfg.agent.image().to_string(),
            command: cfg.agent.command.clone(),
            detach: detached,
            policy,
            env,
            workdir: cfg.agent.habitat.workdir.clone(),
            user: cfg.agent.habitat.user.clone(),
            cpu: cfg.agent.runtime.resources.cpu.clone(),
            memory: cfg.agent.runtime.resources.memory.clone(),
        };
        let run_result = adapter.run(&request);

        let (output, run_error) = match run_result {
            Ok(output) => {
                let error = (output.exit_code != 0)
                    .then(|| format!("run failed with exit code {}", output.exit_code));
                (output, error)
            }
            Err(err) => (crate::runtime::RunOutput::default(), Some(err.to_string())),
        };
        let container_id = if output.container_id.is_empty() {
            container_name
        } else {
            output.container_id.clone()
        };
        record.container_id = container_id.clone();
        self.write_run_output(&run_id, "stdout.log", &output.stdout);
        self.write_run_output(&run_id, "stderr.log", &output.stderr);

        if detached {
            return self.finish_detached(record, target, &container_id, &output, run_error);
        }
        self.finish_attached(&cfg, record, target, &container_id, &output, run_error)
    }

    fn finish_detached(
        &self,
        mut record: RunRecord,
        target: RuntimeTarget,
        container_id: &str,
        output: &crate::runtime::RunOutput,
        run_error: Option<String>,
    ) -> Result<RunRecord, ManagerError> {
        if let Some(error) = run_error {
            self.emit(
                &record.run_id,
                EventDraft::new(Phase::Start, target.as_str(), "daemon start failed")
                    .container(container_id)
                    .error(&error),
            );
            self.store.update_run_completion(
                &record.run_id,
                RunStatus::Failed,
                container_id,
                Some(output.exit_code),
                &error,
            )?;
            record.status = RunStatus::Failed;
            record.exit_code = Some(output.exit_code);
            record.last_error = error;
            return Ok(record);
        }

        self.emit(
            &record.run_id,
            EventDraft::new(Phase::Start, target.as_str(), "daemon started")
                .container(container_id),
        );
        self.store
            .update_run_status(&record.run_id, RunStatus::Running, container_id, "")?;
        record.status = RunStatus::Running;

        // One immediate reconciliation so a container that already died
        // surfaces as terminal rather than lingering as running.
        Ok(self.refresh_run_status(record))
    }

    fn finish_attached(
        &self,
        cfg: &Clawfile,
        mut record: RunRecord,
        target: RuntimeTarget,
        container_id: &str,
        output: &crate::runtime::RunOutput,
        run_error: Option<String>,
    ) -> Result<RunRecord, ManagerError> {
        let failed = run_error.is_some();
        let last_error = run_error.unwrap_or_default();
        let adapter = self.resolver.adapter(target);

        let status = if failed {
            if cfg.agent.lifecycle() == LifecycleMode::Debug {
                self.emit(
                    &record.run_id,
                    EventDraft::new(Phase::Pause, target.as_str(), "container preserved for debug")
                        .container(container_id)
                        .error(&last_error),
                );
                RunStatus::FailedPaused
            } else {
                self.remove_container(&record.run_id, target, adapter, container_id);
                RunStatus::Failed
            }
        } else {
            self.remove_container(&record.run_id, target, adapter, container_id);
            RunStatus::Succeeded
        };

        self.store.update_run_completion(
            &record.run_id,
            status,
            container_id,
            Some(output.exit_code),
            &last_error,
        )?;
        record.status = status;
        record.exit_code = Some(output.exit_code);
        record.last_error = last_error.clone();
        record.ended_at = crate::store::now_rfc3339();

        if status == RunStatus::Succeeded {
            self.emit(
                &record.run_id,
                EventDraft::new(Phase::Exit, target.as_str(), "completed").container(container_id),
            );
        } else if status != RunStatus::FailedPaused {
            self.emit(
                &record.run_id,
                EventDraft::new(Phase::Exit, target.as_str(), "failed")
                    .container(container_id)
                    .error(&last_error),
            );
        }
        Ok(record)
    }

    fn remove_container(
        &self,
        run_id: &str,
        target: RuntimeTarget,
        adapter: Option<&crate::runtime::CliBackend>,
        container_id: &str,
    ) {
        let Some(adapter) = adapter else { return };
        match adapter.remove(container_id) {
            Ok(()) => self.emit(
                run_id,
                EventDraft::new(Phase::Cleanup, target.as_str(), "container removed")
                    .container(container_id),
            ),
            Err(err) => warn!(container = container_id, error = %err, "container removal failed"),
        }
    }

    /// Lists runs (newest first), reconciling each before returning it.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, ManagerError> {
        let records = self.store.list_runs(limit)?;
        Ok(records
            .into_iter()
            .map(|r| self.refresh_run_status(r))
            .collect())
    }

    /// Fetches one run, reconciled.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`] via [`ManagerError::Store`].
    pub fn get_run(&self, run_id: &str) -> Result<RunRecord, ManagerError> {
        let record = self.store.get_run(run_id)?;
        Ok(self.refresh_run_status(record))
    }

    /// Raw event lines for a run.
    ///
    /// # Errors
    ///
    /// I/O errors, including a missing log.
    pub fn read_events(&self, run_id: &str) -> Result<Vec<String>, events::EventError> {
        events::read(&self.state_dir, run_id)
    }

    /// Captured stdout/stderr paths for a run.
    #[must_use]
    pub fn run_log_path(&self, run_id: &str, file_name: &str) -> PathBuf {
        self.state_dir.join("runs").join(run_id).join(file_name)
    }

    /// Backend logs for a run's container.
    ///
    /// # Errors
    ///
    /// Adapter lookup or backend errors.
    pub fn runtime_logs(&self, record: &RunRecord, follow: bool) -> Result<String, ManagerError> {
        let adapter = self.adapter_for(record)?;
        Ok(adapter.logs(&record.container_id, follow)?)
    }

    /// Backend inspect payload for a run's container, as an opaque string.
    ///
    /// # Errors
    ///
    /// Adapter lookup or backend errors.
    pub fn runtime_inspect(&self, record: &RunRecord) -> Result<String, ManagerError> {
        let adapter = self.adapter_for(record)?;
        Ok(adapter.inspect(&record.container_id, INSPECT_DEADLINE)?)
    }

    /// Opens an interactive shell inside a preserved or running container.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotDebuggable`] unless the run is `running` or
    /// `failed_paused`; adapter errors otherwise.
    pub fn debug_shell(&self, run_id: &str) -> Result<(), ManagerError> {
        let record = self.store.get_run(run_id)?;
        if record.status != RunStatus::Running && record.status != RunStatus::FailedPaused {
            return Err(ManagerError::NotDebuggable {
                run_id: run_id.to_string(),
                status: record.status,
            });
        }
        let adapter = self.adapter_for(&record)?;
        Ok(adapter.exec_shell(&record.container_id)?)
    }

    fn adapter_for(&self, record: &RunRecord) -> Result<&crate::runtime::CliBackend, ManagerError> {
        let target = record
            .runtime_target
            .parse::<RuntimeTarget>()
            .map_err(ManagerError::InvalidRuntimeTarget)?;
        self.resolver
            .adapter(target)
            .ok_or_else(|| ManagerError::AdapterUnavailable(record.runtime_target.clone()))
    }

    fn prepare_capsule(
        &self,
        input_path: &Path,
    ) -> Result<(Clawfile, Policy, PathBuf, String), ManagerError> {
        let meta = fs::metadata(input_path).map_err(|source| ManagerError::Stat {
            path: input_path.display().to_string(),
            source,
        })?;
        if meta.is_dir() {
            return self.load_from_capsule_dir(input_path);
        }
        if input_path.extension().is_some_and(|ext| ext == "claw") {
            let out_dir = self.state_dir.join("capsules");
            fs::create_dir_all(&out_dir).map_err(|source| ManagerError::Stat {
                path: out_dir.display().to_string(),
                source,
            })?;
            let result = compiler::compile(input_path, &out_dir)?;
            return Ok((
                result.config,
                result.policy,
                result.capsule.path,
                result.capsule.id,
            ));
        }
        Err(ManagerError::InvalidInput(
            input_path.display().to_string(),
        ))
    }

    fn load_from_capsule_dir(
        &self,
        capsule_path: &Path,
    ) -> Result<(Clawfile, Policy, PathBuf, String), ManagerError> {
        let manifest = capsule::load(capsule_path)?;
        let ir_bytes =
            fs::read(capsule_path.join("ir.json")).map_err(|source| ManagerError::CapsuleRead {
                what: "ir",
                source,
            })?;
        let ir: IrDoc = serde_json::from_slice(&ir_bytes)
            .map_err(|source| ManagerError::CapsuleDoc { what: "ir", source })?;
        let policy_bytes = fs::read(capsule_path.join("policy.json")).map_err(|source| {
            ManagerError::CapsuleRead {
                what: "policy",
                source,
            }
        })?;
        let policy: Policy = serde_json::from_slice(&policy_bytes).map_err(|source| {
            ManagerError::CapsuleDoc {
                what: "policy",
                source,
            }
        })?;
        Ok((
            ir.clawfile,
            policy,
            capsule_path.to_path_buf(),
            manifest.capsule_id,
        ))
    }

    fn write_run_output(&self, run_id: &str, file_name: &str, content: &str) {
        let path = self.run_log_path(run_id, file_name);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "create run log dir failed");
                return;
            }
        }
        if let Err(err) = fs::write(&path, content) {
            warn!(path = %path.display(), error = %err, "write run output failed");
        }
    }

    fn emit(&self, run_id: &str, draft: EventDraft) {
        if let Err(err) = events::append(&self.state_dir, run_id, draft) {
            warn!(run_id, error = %err, "event append failed");
        }
    }
}

/// Generates a run id: compact UTC timestamp plus 9-digit nanoseconds.
#[must_use]
pub fn make_run_id() -> String {
    let now = Utc::now();
    format!("{}{:09}", now.format("%Y%m%dT%H%M%SZ"), now.nanosecond() % 1_000_000_000)
}

/// Merges env maps in order; later entries win.
#[must_use]
pub fn merge_env<const N: usize>(maps: [BTreeMap<String, String>; N]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for map in maps {
        out.extend(map);
    }
    out
}

/// Resolves `--secret-env` names against the host environment.
///
/// Names are trimmed, validated against the env pattern, deduplicated, and
/// sorted; every survivor must be non-empty on the host.
///
/// # Errors
///
/// [`ManagerError::InvalidSecretEnv`] or [`ManagerError::SecretEnvEmpty`].
pub fn resolve_host_secret_envs(
    names: &[String],
) -> Result<BTreeMap<String, String>, ManagerError> {
    let mut normalized = BTreeSet::new();
    for raw in names {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        if !ENV_NAME.is_match(name) {
            return Err(ManagerError::InvalidSecretEnv(raw.clone()));
        }
        normalized.insert(name.to_string());
    }
    let mut out = BTreeMap::new();
    for name in normalized {
        let value = std::env::var(&name).unwrap_or_default();
        if value.trim().is_empty() {
            return Err(ManagerError::SecretEnvEmpty(name));
        }
        out.insert(name, value);
    }
    Ok(out)
}

fn serde_variant(lifecycle: LifecycleMode) -> String {
    match lifecycle {
        LifecycleMode::Ephemeral => "ephemeral",
        LifecycleMode::Daemon => "daemon",
        LifecycleMode::Debug => "debug",
    }
    .to_string()
}
