//! `metaclaw project init` and `metaclaw project upgrade`.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use metaclaw_core::project::{
    self, InitOptions, TemplateSource, TemplateSourceKind, UpgradeOptions,
};

/// Project template subcommands.
#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Install a template into a project directory
    Init {
        #[command(flatten)]
        common: TemplateArgs,

        /// Allow using a non-empty project directory
        #[arg(long)]
        force: bool,
    },

    /// Upgrade managed files from the template
    Upgrade {
        #[command(flatten)]
        common: TemplateArgs,

        /// Overwrite locally modified managed files (after backup)
        #[arg(long)]
        force: bool,

        /// Classify only; write nothing
        #[arg(long)]
        dry_run: bool,
    },
}

/// Template selection flags shared by init and upgrade.
#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Project directory
    #[arg(long)]
    pub project_dir: PathBuf,

    /// Host data directory (default <project>/.metaclaw)
    #[arg(long)]
    pub host_data_dir: Option<PathBuf>,

    /// Local template directory (alternative to --template-repo/--template-path)
    #[arg(long)]
    pub template_dir: Option<PathBuf>,

    /// Git template repo URL (e.g. https://github.com/org/repo.git)
    #[arg(long)]
    pub template_repo: Option<String>,

    /// Template subdirectory within the repo
    #[arg(long)]
    pub template_path: Option<String>,

    /// Git ref (branch or tag)
    #[arg(long = "ref", default_value = "main")]
    pub git_ref: String,
}

impl TemplateArgs {
    fn source(&self) -> Result<TemplateSource> {
        if let Some(dir) = &self.template_dir {
            return Ok(TemplateSource {
                kind: TemplateSourceKind::Local,
                dir: Some(dir.display().to_string()),
                repo: None,
                git_ref: None,
                path: None,
            });
        }
        let (Some(repo), Some(path)) = (&self.template_repo, &self.template_path) else {
            bail!("provide --template-dir or (--template-repo and --template-path)");
        };
        Ok(TemplateSource {
            kind: TemplateSourceKind::Git,
            dir: None,
            repo: Some(repo.clone()),
            git_ref: Some(self.git_ref.clone()),
            path: Some(path.clone()),
        })
    }
}

/// Dispatches the project subcommand.
pub fn execute(cmd: ProjectCommands) -> Result<()> {
    match cmd {
        ProjectCommands::Init { common, force } => {
            let result = project::init(&InitOptions {
                project_dir: common.project_dir.clone(),
                host_data_dir: common.host_data_dir.clone(),
                template: common.source()?,
                force,
            })?;
            println!("project ready: {}", common.project_dir.display());
            println!("template: {}", result.template_id);
            if let Some(commit) = result.template_commit {
                println!("template_commit: {commit}");
            }
            println!("files: {}", result.created_files);
            Ok(())
        }
        ProjectCommands::Upgrade {
            common,
            force,
            dry_run,
        } => {
            let result = project::upgrade(&UpgradeOptions {
                project_dir: common.project_dir.clone(),
                host_data_dir: common.host_data_dir.clone(),
                template: common.source()?,
                force,
                dry_run,
            })?;
            println!("template: {}", result.template_id);
            if let Some(commit) = result.template_commit {
                println!("template_commit: {commit}");
            }
            println!(
                "updated={} added={} skipped={} conflicts={}",
                result.updated.len(),
                result.added.len(),
                result.skipped.len(),
                result.conflicts.len()
            );
            for path in &result.conflicts {
                println!("conflict: {path}");
            }
            if dry_run {
                println!("dry-run: no files written");
            }
            Ok(())
        }
    }
}
