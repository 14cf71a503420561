//! Normalization and validation of parsed clawfiles.
//!
//! Normalization fills defaults (lifecycle, network mode, species image and
//! resources, command, provider-specific LLM fields). Validation enforces
//! the document invariants: digest-pinned image, absolute normalized
//! mounts, unique targets, well-formed env names, unambiguous skill
//! references, and per-skill capability contracts.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use thiserror::Error;

use super::schema::{species_profile, Clawfile, LifecycleMode, LlmProvider, LlmSpec, NetworkMode};
use crate::capability::{self, CapabilityError};

/// POSIX-ish environment variable name pattern.
pub static ENV_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("ENV_NAME should compile")
});

static DIGEST_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".+@sha256:[a-fA-F0-9]{64}$").expect("DIGEST_REF should compile")
});

/// Default command injected when a clawfile declares none.
pub const DEFAULT_COMMAND: [&str; 3] = ["sh", "-lc", "echo MetaClaw agent started"];

/// Default baseURL for the `gemini_openai` provider.
pub const GEMINI_OPENAI_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/";

/// Errors produced while normalizing or validating a clawfile.
#[derive(Debug, Error)]
pub enum ValidateError {
    /// apiVersion is not `metaclaw/v1`.
    #[error("apiVersion must be metaclaw/v1")]
    ApiVersion,

    /// kind is not `Agent`.
    #[error("kind must be Agent")]
    Kind,

    /// agent.name is missing or blank.
    #[error("agent.name is required")]
    NameRequired,

    /// llm fields are set without a provider.
    #[error("agent.llm.provider is required when llm fields are set")]
    LlmProviderRequired,

    /// llm.provider is set without a model.
    #[error("agent.llm.model is required when agent.llm.provider is set")]
    LlmModelRequired,

    /// llm.apiKeyEnv does not match the env-name pattern.
    #[error("agent.llm.apiKeyEnv must be a valid environment variable name")]
    LlmApiKeyEnvName,

    /// Image reference is not digest-pinned.
    #[error("agent.runtime.image must be digest-pinned (example: image@sha256:...)")]
    ImageNotPinned,

    /// A mount is missing its source or target.
    #[error("every habitat mount requires source and target")]
    MountIncomplete,

    /// A mount source is not an absolute, normalized host path.
    #[error("habitat mount source must be an absolute normalized path (got {0:?})")]
    MountSourceInvalid(String),

    /// A mount target is not an absolute, normalized container path.
    #[error("habitat mount target must be an absolute normalized container path (got {0:?})")]
    MountTargetInvalid(String),

    /// A mount target is the container root.
    #[error("habitat mount target cannot be root /")]
    MountTargetRoot,

    /// Two mounts share a target.
    #[error("duplicate habitat mount target: {0}")]
    DuplicateMountTarget(String),

    /// A habitat env key is not a valid environment variable name.
    #[error("habitat env name {0:?} is not a valid environment variable name")]
    EnvName(String),

    /// A skill reference carries both or neither of path and id.
    #[error("skill entries must specify exactly one of path or id")]
    SkillRefAmbiguous,

    /// A path skill does not exist on disk.
    #[error("skill path not found: {0}")]
    SkillPathMissing(String),

    /// An id skill lacks its version pin.
    #[error("skill id {0} requires version for reproducible resolution")]
    SkillVersionRequired(String),

    /// An id skill lacks its digest pin.
    #[error("skill id {0} requires digest for reproducible resolution")]
    SkillDigestRequired(String),

    /// The clawfile pins a skill version that disagrees with the contract.
    #[error("skill {path}: version mismatch between clawfile ({clawfile}) and contract ({contract})")]
    SkillVersionMismatch {
        /// Skill path as written in the clawfile.
        path: String,
        /// Version pinned in the clawfile.
        clawfile: String,
        /// Version declared by the contract.
        contract: String,
    },

    /// The skill's capability contract failed to load or validate.
    #[error("skill {path}: {source}")]
    SkillContract {
        /// Skill path as written in the clawfile.
        path: String,
        /// Underlying contract error.
        #[source]
        source: CapabilityError,
    },
}

/// Returns true when `path` is absolute, slash-separated, and normalized:
/// no empty, `.`, or `..` segments and no trailing slash.
#[must_use]
pub fn is_normalized_absolute(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    rest.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && !path.ends_with('/')
}

/// Normalizes a parsed clawfile into IR and validates every invariant.
///
/// `clawfile_path` anchors relative skill paths.
///
/// # Errors
///
/// Returns the first [`ValidateError`] encountered; diagnostics are meant
/// to be actionable without reading this module.
pub fn normalize_and_validate(
    mut cfg: Clawfile,
    clawfile_path: &Path,
) -> Result<Clawfile, ValidateError> {
    validate_basics(&cfg)?;

    if cfg.agent.lifecycle.is_none() {
        cfg.agent.lifecycle = Some(LifecycleMode::Ephemeral);
    }
    if cfg.agent.habitat.network.mode.is_none() {
        cfg.agent.habitat.network.mode = Some(NetworkMode::None);
    }

    let profile = species_profile(cfg.agent.species);
    if cfg.agent.runtime.image.is_none() {
        cfg.agent.runtime.image = Some(profile.default_image.to_string());
    }
    if cfg.agent.runtime.resources.cpu.is_none() {
        cfg.agent.runtime.resources.cpu = Some(profile.default_cpu.to_string());
    }
    if cfg.agent.runtime.resources.memory.is_none() {
        cfg.agent.runtime.resources.memory = Some(profile.default_memory.to_string());
    }
    if cfg.agent.command.is_empty() {
        cfg.agent.command = DEFAULT_COMMAND.iter().map(ToString::to_string).collect();
    }
    normalize_llm(&mut cfg.agent.llm)?;

    if !DIGEST_REF.is_match(cfg.agent.image()) {
        return Err(ValidateError::ImageNotPinned);
    }

    validate_mounts(&cfg)?;
    validate_env_names(&cfg)?;
    validate_skills(&cfg, clawfile_path.parent().unwrap_or_else(|| Path::new(".")))?;

    Ok(cfg)
}

fn validate_basics(cfg: &Clawfile) -> Result<(), ValidateError> {
    if cfg.api_version != super::schema::API_VERSION {
        return Err(ValidateError::ApiVersion);
    }
    if cfg.kind != super::schema::KIND {
        return Err(ValidateError::Kind);
    }
    if cfg.agent.name.trim().is_empty() {
        return Err(ValidateError::NameRequired);
    }
    Ok(())
}

fn normalize_llm(spec: &mut LlmSpec) -> Result<(), ValidateError> {
    let has_other = spec.model.as_deref().is_some_and(|v| !v.trim().is_empty())
        || spec.base_url.as_deref().is_some_and(|v| !v.trim().is_empty())
        || spec.api_key_env.as_deref().is_some_and(|v| !v.trim().is_empty());
    let Some(provider) = spec.provider else {
        if has_other {
            return Err(ValidateError::LlmProviderRequired);
        }
        return Ok(());
    };

    spec.model = spec.model.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(String::from);
    spec.base_url = spec.base_url.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(String::from);
    spec.api_key_env =
        spec.api_key_env.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(String::from);

    if spec.model.is_none() {
        return Err(ValidateError::LlmModelRequired);
    }
    match provider {
        LlmProvider::GeminiOpenai => {
            if spec.base_url.is_none() {
                spec.base_url = Some(GEMINI_OPENAI_BASE_URL.to_string());
            }
            if spec.api_key_env.is_none() {
                spec.api_key_env = Some("GEMINI_API_KEY".to_string());
            }
        }
        LlmProvider::OpenaiCompatible => {
            if spec.api_key_env.is_none() {
                spec.api_key_env = Some("OPENAI_API_KEY".to_string());
            }
        }
        LlmProvider::Anthropic => {}
    }
    match spec.api_key_env.as_deref() {
        Some(name) if ENV_NAME.is_match(name) => Ok(()),
        _ => Err(ValidateError::LlmApiKeyEnvName),
    }
}

fn validate_mounts(cfg: &Clawfile) -> Result<(), ValidateError> {
    let mut seen_targets = HashSet::new();
    for mount in &cfg.agent.habitat.mounts {
        let source = mount.source.trim();
        let target = mount.target.trim();
        if source.is_empty() || target.is_empty() {
            return Err(ValidateError::MountIncomplete);
        }
        if !is_normalized_absolute(source) {
            return Err(ValidateError::MountSourceInvalid(mount.source.clone()));
        }
        if target == "/" {
            return Err(ValidateError::MountTargetRoot);
        }
        if !is_normalized_absolute(target) {
            return Err(ValidateError::MountTargetInvalid(mount.target.clone()));
        }
        if !seen_targets.insert(target.to_string()) {
            return Err(ValidateError::DuplicateMountTarget(target.to_string()));
        }
    }
    Ok(())
}

fn validate_env_names(cfg: &Clawfile) -> Result<(), ValidateError> {
    for key in cfg.agent.habitat.env.keys() {
        if !ENV_NAME.is_match(key) {
            return Err(ValidateError::EnvName(key.clone()));
        }
    }
    Ok(())
}

fn validate_skills(cfg: &Clawfile, base_dir: &Path) -> Result<(), ValidateError> {
    for skill in &cfg.agent.skills {
        let has_path = skill.path.as_deref().is_some_and(|p| !p.is_empty());
        let has_id = skill.id.as_deref().is_some_and(|i| !i.is_empty());
        if has_path == has_id {
            return Err(ValidateError::SkillRefAmbiguous);
        }

        if has_path {
            let raw = skill.path.as_deref().unwrap_or_default();
            let resolved = if Path::new(raw).is_absolute() {
                Path::new(raw).to_path_buf()
            } else {
                base_dir.join(raw)
            };
            if !resolved.exists() {
                return Err(ValidateError::SkillPathMissing(raw.to_string()));
            }
            let (contract, _contract_path) = capability::load_from_skill_path(&resolved)
                .map_err(|source| ValidateError::SkillContract {
                    path: raw.to_string(),
                    source,
                })?;
            if let Some(version) = skill.version.as_deref().map(str::trim).filter(|v| !v.is_empty())
            {
                let declared = contract.metadata.version.trim();
                if version != declared {
                    return Err(ValidateError::SkillVersionMismatch {
                        path: raw.to_string(),
                        clawfile: version.to_string(),
                        contract: declared.to_string(),
                    });
                }
            }
            capability::validate_against_agent(&contract, &cfg.agent).map_err(|source| {
                ValidateError::SkillContract {
                    path: raw.to_string(),
                    source,
                }
            })?;
            continue;
        }

        let id = skill.id.as_deref().unwrap_or_default();
        if skill.version.as_deref().map_or(true, |v| v.trim().is_empty()) {
            return Err(ValidateError::SkillVersionRequired(id.to_string()));
        }
        if skill.digest.as_deref().map_or(true, |d| d.trim().is_empty()) {
            return Err(ValidateError::SkillDigestRequired(id.to_string()));
        }
    }
    Ok(())
}
