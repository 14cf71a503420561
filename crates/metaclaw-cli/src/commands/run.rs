//! `metaclaw run` - execute a clawfile or capsule.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use metaclaw_core::claw::schema::RuntimeTarget;
use metaclaw_core::manager::{Manager, RunOptions};
use metaclaw_core::store::RunStatus;

/// Arguments for `metaclaw run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Clawfile (`.claw`) or capsule directory
    pub input: PathBuf,

    /// Run in the background
    #[arg(long)]
    pub detach: bool,

    /// Runtime override (podman|apple_container|docker)
    #[arg(long)]
    pub runtime: Option<String>,

    /// State directory
    #[arg(long, default_value = ".metaclaw")]
    pub state_dir: PathBuf,

    /// LLM API key (prefer --llm-api-key-env for better secret hygiene)
    #[arg(long)]
    pub llm_api_key: Option<String>,

    /// Host env variable name to read the LLM API key from
    #[arg(long)]
    pub llm_api_key_env: Option<String>,

    /// Host env variable to inject securely at runtime (repeatable)
    #[arg(long = "secret-env")]
    pub secret_envs: Vec<String>,

    // Habitat boundaries are clawfile-only; these exist to be rejected
    // with a security diagnostic instead of clap's generic unknown-flag
    // error.
    #[arg(long, hide = true, num_args = 0..=1)]
    mount: Option<Option<String>>,

    #[arg(long, hide = true, num_args = 0..=1)]
    network: Option<Option<String>>,

    #[arg(long, hide = true, num_args = 0..=1)]
    env: Option<Option<String>>,
}

/// Runs the input and reports the outcome; non-successful terminal states
/// exit non-zero.
pub fn execute(args: &RunArgs) -> Result<()> {
    if args.mount.is_some() || args.network.is_some() || args.env.is_some() {
        bail!("run blocked: CLI overrides for habitat security boundaries are not allowed");
    }
    let runtime_override = args
        .runtime
        .as_deref()
        .map(str::parse::<RuntimeTarget>)
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let manager = Manager::open(&args.state_dir)?;
    let record = manager.run(&RunOptions {
        input_path: args.input.clone(),
        detach: args.detach,
        runtime_override,
        llm_api_key: args.llm_api_key.clone(),
        llm_api_key_env: args.llm_api_key_env.clone(),
        secret_envs: args.secret_envs.clone(),
    })?;

    println!("run_id: {}", record.run_id);
    println!("status: {}", record.status);
    println!("runtime: {}", record.runtime_target);
    println!("container: {}", record.container_id);
    if let Some(exit_code) = record.exit_code {
        println!("exit_code: {exit_code}");
    }

    match record.status {
        RunStatus::Succeeded | RunStatus::Running => Ok(()),
        RunStatus::Failed | RunStatus::FailedPaused => {
            if record.last_error.is_empty() {
                bail!("run failed");
            }
            bail!("{}", record.last_error);
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: RunArgs,
    }

    #[test]
    fn habitat_override_flags_are_rejected() {
        for flag in ["--mount", "--network", "--env"] {
            let cli =
                TestCli::try_parse_from(["run", "agent.claw", flag, "anything"]).unwrap();
            let err = execute(&cli.args).unwrap_err();
            assert!(err.to_string().contains("run blocked"), "flag {flag}: {err}");
        }
    }

    #[test]
    fn invalid_runtime_override_is_rejected_before_any_work() {
        let cli =
            TestCli::try_parse_from(["run", "agent.claw", "--runtime", "firecracker"]).unwrap();
        let err = execute(&cli.args).unwrap_err();
        assert!(err.to_string().contains("invalid runtime target"));
    }
}
