//! LLM environment resolution.
//!
//! The control plane never calls a model. It only contracts which env
//! variables carry keys: given an LLM spec and runtime options, this module
//! produces the env bindings to inject into the container, mirroring the
//! key under the provider-conventional names so off-the-shelf SDKs inside
//! the container pick it up.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::claw::schema::{LlmProvider, LlmSpec};

/// Env var announcing the contracted provider inside the container.
pub const PROVIDER_ENV: &str = "METACLAW_LLM_PROVIDER";

/// Env var announcing the contracted model inside the container.
pub const MODEL_ENV: &str = "METACLAW_LLM_MODEL";

/// Env var announcing the endpoint override inside the container.
pub const BASE_URL_ENV: &str = "METACLAW_LLM_BASE_URL";

/// Runtime key material options supplied on the CLI.
#[derive(Debug, Default, Clone)]
pub struct RuntimeOptions {
    /// Inline API key; wins over everything else.
    pub api_key: Option<String>,
    /// Host env variable to read the key from; wins over the contract's
    /// apiKeyEnv.
    pub api_key_env: Option<String>,
}

/// Result of resolution: enabled flag plus the env bindings to inject.
#[derive(Debug, Default, Clone)]
pub struct Resolved {
    /// False when the clawfile declares no LLM contract.
    pub enabled: bool,
    /// Bindings to merge into the container env.
    pub env: BTreeMap<String, String>,
}

/// Errors produced while resolving LLM key material.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The requested host env variable is unset or blank.
    #[error("host env {0} is empty")]
    HostEnvEmpty(String),

    /// No key could be found through any resolution path.
    #[error("missing LLM API key: set --llm-api-key, --llm-api-key-env, or host env {0}")]
    MissingKey(String),
}

/// Resolves the key and builds the container env bindings.
///
/// Resolution order: inline key, then the host env named by
/// `opts.api_key_env`, then the host env named by the contract's
/// `apiKeyEnv`.
///
/// # Errors
///
/// [`LlmError::HostEnvEmpty`] when an explicitly requested host env is
/// blank; [`LlmError::MissingKey`] when every source is empty.
pub fn resolve(spec: &LlmSpec, opts: &RuntimeOptions) -> Result<Resolved, LlmError> {
    let Some(provider) = spec.provider else {
        return Ok(Resolved::default());
    };

    let mut key = opts
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from);
    if key.is_none() {
        if let Some(name) = opts.api_key_env.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            let value = host_env(name);
            if value.is_empty() {
                return Err(LlmError::HostEnvEmpty(name.to_string()));
            }
            key = Some(value);
        }
    }
    let contract_key_env = spec.api_key_env.clone().unwrap_or_default();
    if key.is_none() {
        let value = host_env(&contract_key_env);
        if !value.is_empty() {
            key = Some(value);
        }
    }
    let Some(key) = key else {
        return Err(LlmError::MissingKey(contract_key_env));
    };

    let mut env = BTreeMap::new();
    env.insert(contract_key_env, key.clone());
    env.insert(PROVIDER_ENV.to_string(), provider.as_str().to_string());
    env.insert(
        MODEL_ENV.to_string(),
        spec.model.clone().unwrap_or_default(),
    );
    if let Some(base_url) = spec.base_url.as_deref() {
        env.insert(BASE_URL_ENV.to_string(), base_url.to_string());
    }

    match provider {
        LlmProvider::OpenaiCompatible | LlmProvider::GeminiOpenai => {
            env.insert("OPENAI_API_KEY".to_string(), key.clone());
            if let Some(base_url) = spec.base_url.as_deref() {
                env.insert("OPENAI_BASE_URL".to_string(), base_url.to_string());
            }
        }
        LlmProvider::Anthropic => {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
            if let Some(base_url) = spec.base_url.as_deref() {
                env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.to_string());
            }
        }
    }
    if provider == LlmProvider::GeminiOpenai {
        env.insert("GEMINI_API_KEY".to_string(), key);
    }

    Ok(Resolved { enabled: true, env })
}

/// The env names resolution *would* emit, without touching key material.
///
/// This set is what the capability gate and the policy env allowlist treat
/// as available.
#[must_use]
pub fn allowed_env_keys(spec: &LlmSpec) -> Vec<String> {
    let Some(provider) = spec.provider else {
        return Vec::new();
    };
    let mut keys = BTreeSet::new();
    if let Some(key_env) = spec.api_key_env.as_deref() {
        keys.insert(key_env.to_string());
    }
    keys.insert(PROVIDER_ENV.to_string());
    keys.insert(MODEL_ENV.to_string());
    if spec.base_url.is_some() {
        keys.insert(BASE_URL_ENV.to_string());
    }
    match provider {
        LlmProvider::OpenaiCompatible | LlmProvider::GeminiOpenai => {
            keys.insert("OPENAI_API_KEY".to_string());
            if spec.base_url.is_some() {
                keys.insert("OPENAI_BASE_URL".to_string());
            }
        }
        LlmProvider::Anthropic => {
            keys.insert("ANTHROPIC_API_KEY".to_string());
            if spec.base_url.is_some() {
                keys.insert("ANTHROPIC_BASE_URL".to_string());
            }
        }
    }
    if provider == LlmProvider::GeminiOpenai {
        keys.insert("GEMINI_API_KEY".to_string());
    }
    keys.into_iter().collect()
}

fn host_env(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    std::env::var(name).map(|v| v.trim().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini_spec() -> LlmSpec {
        LlmSpec {
            provider: Some(LlmProvider::GeminiOpenai),
            model: Some("gemini-2.5-pro".to_string()),
            base_url: Some(crate::claw::validate::GEMINI_OPENAI_BASE_URL.to_string()),
            api_key_env: Some("GEMINI_API_KEY".to_string()),
        }
    }

    #[test]
    fn no_provider_resolves_disabled() {
        let resolved = resolve(&LlmSpec::default(), &RuntimeOptions::default()).unwrap();
        assert!(!resolved.enabled);
        assert!(resolved.env.is_empty());
    }

    #[test]
    fn inline_key_wins_and_mirrors_provider_keys() {
        let resolved = resolve(
            &gemini_spec(),
            &RuntimeOptions {
                api_key: Some("sk-inline".to_string()),
                api_key_env: None,
            },
        )
        .unwrap();
        assert!(resolved.enabled);
        assert_eq!(resolved.env["GEMINI_API_KEY"], "sk-inline");
        assert_eq!(resolved.env["OPENAI_API_KEY"], "sk-inline");
        assert_eq!(
            resolved.env["OPENAI_BASE_URL"],
            crate::claw::validate::GEMINI_OPENAI_BASE_URL
        );
        assert_eq!(resolved.env[PROVIDER_ENV], "gemini_openai");
        assert_eq!(resolved.env[MODEL_ENV], "gemini-2.5-pro");
    }

    #[test]
    fn anthropic_mirrors_its_own_key_name() {
        let spec = LlmSpec {
            provider: Some(LlmProvider::Anthropic),
            model: Some("claude-sonnet".to_string()),
            base_url: None,
            api_key_env: Some("MY_ANTHROPIC_KEY".to_string()),
        };
        let resolved = resolve(
            &spec,
            &RuntimeOptions {
                api_key: Some("sk-ant".to_string()),
                api_key_env: None,
            },
        )
        .unwrap();
        assert_eq!(resolved.env["ANTHROPIC_API_KEY"], "sk-ant");
        assert_eq!(resolved.env["MY_ANTHROPIC_KEY"], "sk-ant");
        assert!(!resolved.env.contains_key("OPENAI_API_KEY"));
        assert!(!resolved.env.contains_key("ANTHROPIC_BASE_URL"));
    }

    #[test]
    fn requested_host_env_must_be_non_empty() {
        std::env::remove_var("METACLAW_TEST_EMPTY_KEY");
        let err = resolve(
            &gemini_spec(),
            &RuntimeOptions {
                api_key: None,
                api_key_env: Some("METACLAW_TEST_EMPTY_KEY".to_string()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::HostEnvEmpty(_)));
    }

    #[test]
    fn falls_back_to_contract_env_then_fails() {
        std::env::set_var("METACLAW_TEST_CONTRACT_KEY", "from-host");
        let spec = LlmSpec {
            api_key_env: Some("METACLAW_TEST_CONTRACT_KEY".to_string()),
            ..gemini_spec()
        };
        let resolved = resolve(&spec, &RuntimeOptions::default()).unwrap();
        assert_eq!(resolved.env["METACLAW_TEST_CONTRACT_KEY"], "from-host");
        std::env::remove_var("METACLAW_TEST_CONTRACT_KEY");

        let err = resolve(&spec, &RuntimeOptions::default()).unwrap_err();
        assert!(matches!(err, LlmError::MissingKey(_)));
    }

    #[test]
    fn allowed_keys_for_gemini_cover_mirrored_names() {
        let keys = allowed_env_keys(&gemini_spec());
        for expected in [
            "GEMINI_API_KEY",
            "OPENAI_API_KEY",
            "OPENAI_BASE_URL",
            PROVIDER_ENV,
            MODEL_ENV,
            BASE_URL_ENV,
        ] {
            assert!(keys.iter().any(|k| k == expected), "missing {expected}");
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
