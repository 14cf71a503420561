//! `metaclaw init` - write a starter clawfile.

use std::path::Path;

use anyhow::{Context, Result};

const STARTER_CLAWFILE: &str = r#"apiVersion: metaclaw/v1
kind: Agent
agent:
  name: hello-agent
  species: nano
  lifecycle: ephemeral
  habitat:
    network:
      mode: none
    mounts: []
    env: {}
  # Optional LLM contract (secret injected at run time)
  # llm:
  #   provider: gemini_openai
  #   model: gemini-2.5-pro
  #   # defaults to the Google OpenAI-compatible endpoint for gemini_openai
  #   # baseURL: https://generativelanguage.googleapis.com/v1beta/openai/
  #   # defaults to GEMINI_API_KEY for gemini_openai
  #   # apiKeyEnv: GEMINI_API_KEY
  runtime:
    # Optional; resolved by species if omitted
    # image: alpine:3.20@sha256:77726ef25f24bcc9d8e059309a8929574b2f13f0707cde656d2d7b82f83049c4
  command:
    - sh
    - -lc
    - echo "Hello from MetaClaw"
"#;

/// Writes the starter clawfile to `out`.
pub fn execute(out: &Path) -> Result<()> {
    std::fs::write(out, STARTER_CLAWFILE)
        .with_context(|| format!("write template {}", out.display()))?;
    println!("created {}", out.display());
    Ok(())
}
