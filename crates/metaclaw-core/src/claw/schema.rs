//! Typed Clawfile schema (`metaclaw/v1`).
//!
//! Every struct rejects unknown fields so a typo in a clawfile is a parse
//! error rather than silently ignored configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Document apiVersion accepted by this schema.
pub const API_VERSION: &str = "metaclaw/v1";

/// Document kind accepted by this schema.
pub const KIND: &str = "Agent";

/// Resource/profile class supplying image and resource defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Species {
    /// Smallest profile, minimal alpine image.
    Nano,
    /// Default container profile.
    Micro,
    /// Heavyweight profile with a full distribution image.
    Mega,
}

/// How a run terminates and is cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleMode {
    /// One-shot: wait for exit, remove the container.
    Ephemeral,
    /// Detached, long-lived.
    Daemon,
    /// Like ephemeral, but a failing container is preserved for a debug
    /// shell.
    Debug,
}

/// Container backend a capsule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeTarget {
    /// Podman CLI.
    Podman,
    /// Apple `container` CLI.
    AppleContainer,
    /// Docker CLI.
    Docker,
}

impl RuntimeTarget {
    /// Stable string form, matching the clawfile enum values.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::AppleContainer => "apple_container",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "podman" => Ok(Self::Podman),
            "apple_container" => Ok(Self::AppleContainer),
            "docker" => Ok(Self::Docker),
            other => Err(format!(
                "invalid runtime target: {other} (expected podman, apple_container, or docker)"
            )),
        }
    }
}

/// LLM provider contracted by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Any OpenAI-compatible endpoint.
    OpenaiCompatible,
    /// Gemini through its OpenAI-compatible endpoint.
    GeminiOpenai,
    /// Anthropic API.
    Anthropic,
}

impl LlmProvider {
    /// Stable string form, matching the clawfile enum values.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "openai_compatible",
            Self::GeminiOpenai => "gemini_openai",
            Self::Anthropic => "anthropic",
        }
    }
}

/// Habitat network mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network access.
    None,
    /// Outbound connections only (backend bridge network).
    Outbound,
    /// Full host network.
    All,
}

impl NetworkMode {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Outbound => "outbound",
            Self::All => "all",
        }
    }

    /// Privilege rank: none < outbound < all.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Outbound => 1,
            Self::All => 2,
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level clawfile document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Clawfile {
    /// Must be [`API_VERSION`].
    pub api_version: String,
    /// Must be [`KIND`].
    pub kind: String,
    /// The agent specification.
    pub agent: AgentSpec,
}

/// The agent specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentSpec {
    /// Agent name; required.
    pub name: String,
    /// Resource/profile class.
    pub species: Species,
    /// Termination semantics; defaults to `ephemeral`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleMode>,
    /// Execution environment description.
    #[serde(default)]
    pub habitat: HabitatSpec,
    /// Optional LLM contract; no model calls are ever made, this only
    /// declares which env names carry keys.
    #[serde(default)]
    pub llm: LlmSpec,
    /// Optional persona/memory passthrough.
    #[serde(default)]
    pub soul: SoulSpec,
    /// Ordered skill references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<SkillRef>,
    /// Runtime target, image, and resources.
    #[serde(default)]
    pub runtime: RuntimeSpec,
    /// Container command argv; defaulted by normalization when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl AgentSpec {
    /// Effective lifecycle (normalization fills `ephemeral` when unset).
    #[must_use]
    pub fn lifecycle(&self) -> LifecycleMode {
        self.lifecycle.unwrap_or(LifecycleMode::Ephemeral)
    }

    /// Effective network mode (normalization fills `none` when unset).
    #[must_use]
    pub fn network_mode(&self) -> NetworkMode {
        self.habitat.network.mode.unwrap_or(NetworkMode::None)
    }

    /// Effective image reference; empty until normalization.
    #[must_use]
    pub fn image(&self) -> &str {
        self.runtime.image.as_deref().unwrap_or("")
    }
}

/// Execution environment: network, mounts, env, workdir, user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HabitatSpec {
    /// Network mode wrapper.
    #[serde(default)]
    pub network: NetworkSpec,
    /// Bind mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
    /// Environment bindings baked into the capsule. Sorted map so
    /// downstream hashing is stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Container working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Container user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Network block of the habitat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSpec {
    /// Mode; defaults to `none` during normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<NetworkMode>,
}

/// One bind mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MountSpec {
    /// Absolute, normalized host path.
    pub source: String,
    /// Absolute, normalized container path; never `/`.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Persona/memory passthrough recorded in the IR; nothing in the control
/// plane consumes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoulSpec {
    /// Free-text persona description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    /// Free-text memory hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Reference to a skill: either a local path, or an id pinned by version
/// and digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillRef {
    /// Local path relative to the clawfile (or absolute).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Registry identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Version pin; required for id references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Digest pin; required for id references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Runtime block: target backend, image, resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSpec {
    /// Explicit backend; resolver falls back to host defaults when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RuntimeTarget>,
    /// Digest-pinned image reference; defaulted from the species profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// CPU/memory limits.
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// Resource limits passed to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    /// CPU share (backend `--cpus` value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory limit (backend `--memory` value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Optional LLM contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LlmSpec {
    /// Provider; required when any other field is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<LlmProvider>,
    /// Model name; required when the provider is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Endpoint override; defaulted per provider.
    #[serde(default, rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Host env variable carrying the API key; defaulted per provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Static defaults supplied by a species.
#[derive(Debug, Clone, Copy)]
pub struct SpeciesProfile {
    /// Species this profile belongs to.
    pub species: Species,
    /// Default digest-pinned image.
    pub default_image: &'static str,
    /// Default `--cpus` value.
    pub default_cpu: &'static str,
    /// Default `--memory` value.
    pub default_memory: &'static str,
}

/// Returns the default profile for a species.
#[must_use]
pub const fn species_profile(species: Species) -> SpeciesProfile {
    const ALPINE: &str =
        "alpine:3.20@sha256:77726ef25f24bcc9d8e059309a8929574b2f13f0707cde656d2d7b82f83049c4";
    const UBUNTU: &str =
        "ubuntu:24.04@sha256:c35e29c9450151419d9448b0fd75374fec4fff364a27f176fb458d472dfc9e54";
    match species {
        Species::Nano => SpeciesProfile {
            species: Species::Nano,
            default_image: ALPINE,
            default_cpu: "0.25",
            default_memory: "256m",
        },
        Species::Micro => SpeciesProfile {
            species: Species::Micro,
            default_image: ALPINE,
            default_cpu: "1",
            default_memory: "512m",
        },
        Species::Mega => SpeciesProfile {
            species: Species::Mega,
            default_image: UBUNTU,
            default_cpu: "2",
            default_memory: "2g",
        },
    }
}
