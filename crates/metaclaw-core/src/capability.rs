//! Capability contracts: per-skill permission declarations.
//!
//! Every skill referenced by local path must ship a sibling
//! `capability.contract.{yaml,yml,json}` declaring the network level,
//! mounts, env names, secrets, and runtime targets it needs. The contract
//! is validated structurally and then enforced against the agent's habitat
//! before a capsule can be compiled.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claw::schema::{AgentSpec, NetworkMode, RuntimeTarget};
use crate::claw::validate::ENV_NAME;
use crate::llm;

/// apiVersion accepted for capability contracts.
pub const CONTRACT_API_VERSION: &str = "metaclaw.capability/v1";

/// kind accepted for capability contracts.
pub const CONTRACT_KIND: &str = "CapabilityContract";

/// File names probed when discovering a contract, in order.
pub const CONTRACT_FILE_NAMES: [&str; 3] = [
    "capability.contract.yaml",
    "capability.contract.yml",
    "capability.contract.json",
];

/// A parsed capability contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Contract {
    /// Must be [`CONTRACT_API_VERSION`].
    pub api_version: String,
    /// Must be [`CONTRACT_KIND`].
    pub kind: String,
    /// Name, version, description.
    pub metadata: Metadata,
    /// Declared inputs and outputs; informational.
    #[serde(default)]
    pub interface: IoInterface,
    /// The permissions the skill needs at run time.
    pub permissions: Permissions,
    /// Declared side effects; informational.
    #[serde(default)]
    pub side_effects: SideEffects,
    /// Runtime compatibility pins.
    #[serde(default)]
    pub compatibility: Compatibility,
    /// Events/log fields the skill promises to emit; informational.
    #[serde(default)]
    pub observability: Observability,
}

/// Contract metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    /// Skill name.
    pub name: String,
    /// Skill version; compared against the clawfile's pin when present.
    pub version: String,
    /// Human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared input/output fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoInterface {
    /// Input fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<IoField>,
    /// Output fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<IoField>,
}

/// One interface field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoField {
    /// Field name; unique within its section.
    pub name: String,
    /// Field type tag.
    #[serde(rename = "type")]
    pub ty: String,
    /// Whether the field is required.
    #[serde(default)]
    pub required: bool,
    /// Human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Permissions the skill requires from the habitat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permissions {
    /// Required network level; defaults to `none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkMode>,
    /// Required mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountPermission>,
    /// Env names the skill reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Secret env names the skill reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

/// Mount access level requested by a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountAccess {
    /// Read-only access suffices.
    Ro,
    /// The skill writes to the mount.
    Rw,
}

/// One required mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountPermission {
    /// Container path the skill expects.
    pub target: String,
    /// ro or rw.
    pub access: MountAccess,
    /// Human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When true, a missing habitat mount is an error.
    #[serde(default)]
    pub required: bool,
}

/// Declared side effects; informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SideEffects {
    /// Paths the skill writes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<String>,
    /// External APIs the skill calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_apis: Vec<String>,
}

/// Runtime compatibility pins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Compatibility {
    /// Minimum control-plane version; informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_metaclaw_version: Option<String>,
    /// When non-empty, the agent must explicitly target one of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_targets: Vec<RuntimeTarget>,
}

/// Promised observability surface; informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Observability {
    /// Events the skill emits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_events: Vec<String>,
    /// Log fields the skill sets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_fields: Vec<String>,
}

/// Errors produced while loading or enforcing a capability contract.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Failed to stat/read skill or contract files.
    #[error("read capability contract: {0}")]
    Io(#[from] std::io::Error),

    /// No contract file next to the skill.
    #[error("missing capability contract (expected capability.contract.yaml|yml|json)")]
    Missing,

    /// The contract is not valid strict YAML/JSON for the schema.
    #[error("parse capability contract ({file}): {source}")]
    Parse {
        /// Basename of the offending file.
        file: String,
        /// Underlying decode error.
        #[source]
        source: serde_yaml::Error,
    },

    /// Wrong apiVersion.
    #[error("capability contract apiVersion must be {CONTRACT_API_VERSION}")]
    ApiVersion,

    /// Wrong kind.
    #[error("capability contract kind must be {CONTRACT_KIND}")]
    Kind,

    /// metadata.name missing or blank.
    #[error("capability contract metadata.name is required")]
    NameRequired,

    /// metadata.version missing or blank.
    #[error("capability contract metadata.version is required")]
    VersionRequired,

    /// A mount target is not absolute.
    #[error("capability contract mount target must be absolute (got {0:?})")]
    MountTarget(String),

    /// An env or secret name fails the env-name pattern.
    #[error("capability contract {section} contains invalid env name {name:?}")]
    EnvName {
        /// `permissions.env` or `permissions.secrets`.
        section: &'static str,
        /// The offending name.
        name: String,
    },

    /// An interface field is missing its name or type, or duplicates a name.
    #[error("capability contract {section}[{index}] is invalid: {reason}")]
    Interface {
        /// `interface.inputs` or `interface.outputs`.
        section: &'static str,
        /// Index of the offending field.
        index: usize,
        /// What is wrong.
        reason: String,
    },

    /// The skill needs more network than the habitat grants.
    #[error("skill requires network={required} but agent habitat grants network={granted}")]
    NetworkExceedsHabitat {
        /// Level the contract requires.
        required: NetworkMode,
        /// Level the habitat grants.
        granted: NetworkMode,
    },

    /// A required mount target is absent from the habitat.
    #[error("skill requires mount target {0} but it is not present in habitat.mounts")]
    MountMissing(String),

    /// The skill needs rw but the habitat mount is read-only.
    #[error("skill requires rw mount at {0} but habitat mount is read-only")]
    MountReadOnly(String),

    /// A required env name is not declared anywhere.
    #[error("skill requires env {0} but agent does not declare it in habitat.env/llm contract")]
    EnvUnavailable(String),

    /// A required secret name has no binding.
    #[error("skill requires secret {0} but agent does not declare a binding for it")]
    SecretUnavailable(String),

    /// The contract pins runtime targets but the agent leaves its target
    /// implicit.
    #[error("skill declares compatibility.runtimeTargets={0}; set agent.runtime.target explicitly")]
    RuntimeTargetUnpinned(String),

    /// The agent's explicit target is not among the pinned ones.
    #[error("skill supports runtimes {supported} but agent runtime.target={agent}")]
    RuntimeTargetIncompatible {
        /// Comma-joined supported targets.
        supported: String,
        /// The agent's declared target.
        agent: RuntimeTarget,
    },
}

/// Probes for a contract file next to `skill_path`.
///
/// When the skill is a file, its parent directory is searched.
///
/// # Errors
///
/// Returns an I/O error when the skill path cannot be inspected.
pub fn discover_contract_path(skill_path: &Path) -> Result<Option<PathBuf>, CapabilityError> {
    let meta = fs::metadata(skill_path)?;
    let base_dir = if meta.is_dir() {
        skill_path
    } else {
        skill_path.parent().unwrap_or_else(|| Path::new("."))
    };
    for name in CONTRACT_FILE_NAMES {
        let candidate = base_dir.join(name);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Loads and structurally validates the contract next to `skill_path`.
///
/// Returns the contract together with the path it was loaded from.
///
/// # Errors
///
/// [`CapabilityError::Missing`] when no contract file exists; parse and
/// structural errors otherwise.
pub fn load_from_skill_path(skill_path: &Path) -> Result<(Contract, PathBuf), CapabilityError> {
    let Some(contract_path) = discover_contract_path(skill_path)? else {
        return Err(CapabilityError::Missing);
    };
    let bytes = fs::read(&contract_path)?;
    // JSON is a YAML subset, so one strict decoder covers all three
    // contract file extensions.
    let contract: Contract =
        serde_yaml::from_slice(&bytes).map_err(|source| CapabilityError::Parse {
            file: contract_path
                .file_name()
                .map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
            source,
        })?;
    validate(&contract)?;
    Ok((contract, contract_path))
}

/// Structurally validates a contract.
///
/// # Errors
///
/// Returns the first violated rule.
pub fn validate(contract: &Contract) -> Result<(), CapabilityError> {
    if contract.api_version != CONTRACT_API_VERSION {
        return Err(CapabilityError::ApiVersion);
    }
    if contract.kind != CONTRACT_KIND {
        return Err(CapabilityError::Kind);
    }
    if contract.metadata.name.trim().is_empty() {
        return Err(CapabilityError::NameRequired);
    }
    if contract.metadata.version.trim().is_empty() {
        return Err(CapabilityError::VersionRequired);
    }

    for mount in &contract.permissions.mounts {
        let target = mount.target.trim();
        if target.is_empty() || !target.starts_with('/') {
            return Err(CapabilityError::MountTarget(mount.target.clone()));
        }
    }

    validate_env_names(&contract.permissions.env, "permissions.env")?;
    validate_env_names(&contract.permissions.secrets, "permissions.secrets")?;
    validate_io_fields(&contract.interface.inputs, "interface.inputs")?;
    validate_io_fields(&contract.interface.outputs, "interface.outputs")?;
    Ok(())
}

/// Enforces a structurally valid contract against the agent.
///
/// # Errors
///
/// Returns the first habitat/LLM/runtime mismatch.
pub fn validate_against_agent(contract: &Contract, agent: &AgentSpec) -> Result<(), CapabilityError> {
    let required = contract.permissions.network.unwrap_or(NetworkMode::None);
    let granted = agent.network_mode();
    if required.rank() > granted.rank() {
        return Err(CapabilityError::NetworkExceedsHabitat { required, granted });
    }

    for req in &contract.permissions.mounts {
        let habitat_mount = agent
            .habitat
            .mounts
            .iter()
            .find(|m| m.target == req.target);
        match habitat_mount {
            None if req.required => {
                return Err(CapabilityError::MountMissing(req.target.clone()));
            }
            None => {}
            Some(mount) => {
                if req.access == MountAccess::Rw && mount.read_only {
                    return Err(CapabilityError::MountReadOnly(req.target.clone()));
                }
            }
        }
    }

    let mut available: BTreeSet<&str> =
        agent.habitat.env.keys().map(String::as_str).collect();
    let llm_keys = llm::allowed_env_keys(&agent.llm);
    available.extend(llm_keys.iter().map(String::as_str));

    for name in &contract.permissions.env {
        if !available.contains(name.as_str()) {
            return Err(CapabilityError::EnvUnavailable(name.clone()));
        }
    }
    for name in &contract.permissions.secrets {
        if !available.contains(name.as_str()) {
            return Err(CapabilityError::SecretUnavailable(name.clone()));
        }
    }

    if !contract.compatibility.runtime_targets.is_empty() {
        let supported = contract
            .compatibility
            .runtime_targets
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let Some(agent_target) = agent.runtime.target else {
            return Err(CapabilityError::RuntimeTargetUnpinned(supported));
        };
        if !contract.compatibility.runtime_targets.contains(&agent_target) {
            return Err(CapabilityError::RuntimeTargetIncompatible {
                supported,
                agent: agent_target,
            });
        }
    }
    Ok(())
}

fn validate_env_names(values: &[String], section: &'static str) -> Result<(), CapabilityError> {
    for raw in values {
        if !ENV_NAME.is_match(raw.trim()) {
            return Err(CapabilityError::EnvName {
                section,
                name: raw.clone(),
            });
        }
    }
    Ok(())
}

fn validate_io_fields(fields: &[IoField], section: &'static str) -> Result<(), CapabilityError> {
    let mut seen = BTreeSet::new();
    for (index, field) in fields.iter().enumerate() {
        if field.name.trim().is_empty() {
            return Err(CapabilityError::Interface {
                section,
                index,
                reason: "name is required".to_string(),
            });
        }
        if field.ty.trim().is_empty() {
            return Err(CapabilityError::Interface {
                section,
                index,
                reason: "type is required".to_string(),
            });
        }
        if !seen.insert(field.name.trim().to_string()) {
            return Err(CapabilityError::Interface {
                section,
                index,
                reason: format!("duplicate field name {:?}", field.name),
            });
        }
    }
    Ok(())
}
