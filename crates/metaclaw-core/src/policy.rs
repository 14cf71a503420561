//! Runtime policy compilation.
//!
//! A pure projection from normalized IR to the deny-by-default policy the
//! runtime adapters translate into backend flags. Identical IR yields
//! byte-identical policy JSON.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::claw::schema::{Clawfile, NetworkMode};
use crate::llm;

/// Version tag written into `policy.json`.
pub const POLICY_VERSION: &str = "metaclaw.policy/v1";

/// Compiled runtime policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// [`POLICY_VERSION`].
    pub version: String,
    /// Network gate.
    pub network: NetworkPolicy,
    /// Mounts sorted by (source, target).
    pub mounts: Vec<MountPolicy>,
    /// Sorted union of habitat env keys and LLM-derived keys.
    pub env_allowlist: Vec<String>,
    /// Container working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Container user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Network portion of the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// The habitat mode.
    pub mode: NetworkMode,
    /// False only for mode `none`.
    pub allowed: bool,
}

/// One mount grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPolicy {
    /// Absolute host path.
    pub source: String,
    /// Absolute container path.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Projects normalized IR into a [`Policy`].
#[must_use]
pub fn compile(cfg: &Clawfile) -> Policy {
    let mode = cfg.agent.network_mode();
    let network = NetworkPolicy {
        mode,
        allowed: mode != NetworkMode::None,
    };

    let mut mounts: Vec<MountPolicy> = cfg
        .agent
        .habitat
        .mounts
        .iter()
        .map(|m| MountPolicy {
            source: m.source.clone(),
            target: m.target.clone(),
            read_only: m.read_only,
        })
        .collect();
    mounts.sort_by(|a, b| a.source.cmp(&b.source).then_with(|| a.target.cmp(&b.target)));

    let mut allowlist: BTreeSet<String> = cfg.agent.habitat.env.keys().cloned().collect();
    allowlist.extend(llm::allowed_env_keys(&cfg.agent.llm));

    Policy {
        version: POLICY_VERSION.to_string(),
        network,
        mounts,
        env_allowlist: allowlist.into_iter().collect(),
        workdir: cfg.agent.habitat.workdir.clone(),
        user: cfg.agent.habitat.user.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::claw::parse::parse_bytes;
    use crate::claw::schema::{LlmProvider, MountSpec};
    use crate::claw::validate::normalize_and_validate;

    fn normalized(extra: impl FnOnce(&mut Clawfile)) -> Clawfile {
        let mut cfg = parse_bytes(
            b"apiVersion: metaclaw/v1\nkind: Agent\nagent:\n  name: p\n  species: nano\n",
            "agent.claw",
        )
        .unwrap();
        extra(&mut cfg);
        normalize_and_validate(cfg, Path::new("agent.claw")).unwrap()
    }

    #[test]
    fn network_none_is_not_allowed() {
        let policy = compile(&normalized(|_| {}));
        assert_eq!(policy.network.mode, NetworkMode::None);
        assert!(!policy.network.allowed);
        assert_eq!(policy.version, POLICY_VERSION);
    }

    #[test]
    fn mounts_are_sorted_by_source_then_target() {
        let policy = compile(&normalized(|cfg| {
            cfg.agent.habitat.mounts = vec![
                MountSpec {
                    source: "/b".to_string(),
                    target: "/two".to_string(),
                    read_only: false,
                },
                MountSpec {
                    source: "/a".to_string(),
                    target: "/zz".to_string(),
                    read_only: true,
                },
                MountSpec {
                    source: "/a".to_string(),
                    target: "/one".to_string(),
                    read_only: false,
                },
            ];
        }));
        let order: Vec<(&str, &str)> = policy
            .mounts
            .iter()
            .map(|m| (m.source.as_str(), m.target.as_str()))
            .collect();
        assert_eq!(order, vec![("/a", "/one"), ("/a", "/zz"), ("/b", "/two")]);
    }

    #[test]
    fn env_allowlist_unions_habitat_and_llm_keys() {
        let policy = compile(&normalized(|cfg| {
            cfg.agent
                .habitat
                .env
                .insert("APP_MODE".to_string(), "test".to_string());
            cfg.agent.llm.provider = Some(LlmProvider::GeminiOpenai);
            cfg.agent.llm.model = Some("gemini-2.5-pro".to_string());
        }));
        for expected in ["APP_MODE", "GEMINI_API_KEY", "OPENAI_API_KEY", "OPENAI_BASE_URL"] {
            assert!(
                policy.env_allowlist.iter().any(|k| k == expected),
                "missing {expected}"
            );
        }
        let mut sorted = policy.env_allowlist.clone();
        sorted.sort();
        assert_eq!(policy.env_allowlist, sorted);
    }

    #[test]
    fn identical_ir_yields_identical_policy_bytes() {
        let a = compile(&normalized(|_| {}));
        let b = compile(&normalized(|_| {}));
        assert_eq!(
            crate::canonical::to_canonical_json(&a).unwrap(),
            crate::canonical::to_canonical_json(&b).unwrap()
        );
    }
}
