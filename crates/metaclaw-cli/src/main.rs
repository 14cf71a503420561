//! metaclaw - local-first control plane for declarative agents.
//!
//! Compiles Clawfiles into content-addressed capsules, runs them under a
//! deny-by-default policy on podman/docker/apple container, and signs
//! release bundles. One short-lived process per command; no daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "metaclaw")]
#[command(version, about = "local-first infrastructure engine for AI agents", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter clawfile
    Init {
        /// Output path
        #[arg(long, default_value = "agent.claw")]
        out: PathBuf,
    },

    /// Normalize and validate a clawfile; print the JSON IR
    Validate {
        /// Clawfile path
        file: PathBuf,
    },

    /// Compile a clawfile into a capsule
    Compile {
        /// Clawfile path
        file: PathBuf,

        /// Output directory
        #[arg(short = 'o', long = "out", default_value = ".")]
        out: PathBuf,
    },

    /// Execute a clawfile or capsule under the container runtime
    Run(commands::run::RunArgs),

    /// List runs (reconciled against the backend)
    Ps {
        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,

        /// Max rows
        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Print run events plus captured stdout/stderr
    Logs {
        /// Run id
        run_id: String,

        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,

        /// Stream backend logs after the captured output
        #[arg(short, long)]
        follow: bool,
    },

    /// Inspect a run or a capsule directory
    Inspect {
        /// Run id or capsule directory
        target: String,

        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,

        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Debugging helpers for preserved containers
    #[command(subcommand)]
    Debug(DebugCommands),

    /// Browse and compare capsules
    #[command(subcommand)]
    Capsule(commands::capsule::CapsuleCommands),

    /// Generate an Ed25519 signing key pair
    Keygen {
        /// Output private key path (PEM PKCS8)
        #[arg(long, default_value = ".metaclaw/keys/release.ed25519.pem")]
        private_key: PathBuf,

        /// Output public key path (PEM SPKI)
        #[arg(long, default_value = ".metaclaw/keys/release.ed25519.pub.pem")]
        public_key: PathBuf,

        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },

    /// Produce a signed release bundle from a clawfile or capsule
    Release {
        /// Clawfile or capsule directory
        input: PathBuf,

        /// Enforce strict release checks
        #[arg(long)]
        strict: bool,

        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,

        /// Release output directory root
        #[arg(long)]
        out: Option<PathBuf>,

        /// Ed25519 private key path (PEM PKCS8); auto-generated if absent
        #[arg(long)]
        sign_key: Option<PathBuf>,

        /// Signing key identifier override
        #[arg(long)]
        key_id: Option<String>,

        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Verify a release or capsule directory
    Verify {
        /// Release or capsule directory
        input: PathBuf,

        /// Public key PEM override
        #[arg(long)]
        public_key: Option<PathBuf>,

        /// Fail if the input is not a release directory
        #[arg(long)]
        require_release: bool,

        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Install or upgrade a project template
    #[command(subcommand)]
    Project(commands::project::ProjectCommands),
}

#[derive(Subcommand, Debug)]
enum DebugCommands {
    /// Exec an interactive shell into a preserved container
    Shell {
        /// Run id
        run_id: String,

        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { out } => commands::init::execute(&out),
        Commands::Validate { file } => commands::validate::execute(&file),
        Commands::Compile { file, out } => commands::compile::execute(&file, &out),
        Commands::Run(args) => commands::run::execute(&args),
        Commands::Ps {
            state_dir,
            limit,
            json,
        } => commands::ps::execute(&state_dir, limit, json),
        Commands::Logs {
            run_id,
            state_dir,
            follow,
        } => commands::logs::execute(&state_dir, &run_id, follow),
        Commands::Inspect {
            target,
            state_dir,
            json,
        } => commands::inspect::execute(&state_dir, &target, json),
        Commands::Debug(DebugCommands::Shell { run_id, state_dir }) => {
            commands::debug::execute(&state_dir, &run_id)
        }
        Commands::Capsule(cmd) => commands::capsule::execute(cmd),
        Commands::Keygen {
            private_key,
            public_key,
            force,
        } => commands::keygen::execute(&private_key, &public_key, force),
        Commands::Release {
            input,
            strict,
            state_dir,
            out,
            sign_key,
            key_id,
            json,
        } => commands::release::execute(&commands::release::ReleaseArgs {
            input,
            strict,
            state_dir,
            out,
            sign_key,
            key_id,
            json,
        }),
        Commands::Verify {
            input,
            public_key,
            require_release,
            json,
        } => commands::verify::execute(&input, public_key.as_deref(), require_release, json),
        Commands::Project(cmd) => commands::project::execute(cmd),
    }
}
