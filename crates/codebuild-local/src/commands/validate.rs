//! Validate command implementation
//!
//! Parses a build specification without touching a container runtime and
//! prints the execution plan it describes.

use crate::cli::OutputFormat;
use anyhow::Result;
use codebuild_local_core::buildspec::{
    load_buildspec, BuildSpec, OnFailure, DEFAULT_BUILDSPEC_FILE,
};
use codebuild_local_core::errors::BuildError;
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Validate command arguments
#[derive(Debug, Clone)]
pub struct ValidateArgs {
    pub buildspec: Option<PathBuf>,
    pub source: Option<PathBuf>,
    pub output: OutputFormat,
}

/// Execution plan of a valid build specification
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BuildPlan {
    pub path: PathBuf,
    pub version: String,
    pub shell: &'static str,
    pub variables: usize,
    pub parameter_store: usize,
    pub secrets_manager: usize,
    pub phases: Vec<PlannedPhase>,
    pub artifacts: Vec<PlannedArtifacts>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlannedPhase {
    pub name: &'static str,
    pub commands: usize,
    pub finally: usize,
    pub on_failure: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlannedArtifacts {
    /// `None` for the primary group
    pub identifier: Option<String>,
    pub files: Vec<String>,
    pub base_directory: Option<String>,
    pub discard_paths: bool,
}

impl BuildPlan {
    pub fn from_spec(path: &Path, spec: &BuildSpec) -> Self {
        Self {
            path: path.to_path_buf(),
            version: spec.version.clone(),
            shell: spec.env.shell.program(),
            variables: spec.env.variables.len(),
            parameter_store: spec.env.parameter_store.len(),
            secrets_manager: spec.env.secrets_manager.len(),
            phases: spec
                .phases()
                .map(|phase| PlannedPhase {
                    name: phase.name.as_str(),
                    commands: phase.commands.len(),
                    finally: phase.finally.len(),
                    on_failure: match phase.on_failure {
                        OnFailure::Abort => "ABORT",
                        OnFailure::Continue => "CONTINUE",
                    },
                })
                .collect(),
            artifacts: spec
                .artifacts
                .iter()
                .map(|group| PlannedArtifacts {
                    identifier: group.identifier.clone(),
                    files: group.files.clone(),
                    base_directory: group.base_directory.clone(),
                    discard_paths: group.discard_paths,
                })
                .collect(),
        }
    }

    pub fn render_text(&self) -> String {
        let mut output = format!(
            "{} {} (version {}, shell {})\n",
            style("[OK]").green(),
            self.path.display(),
            self.version,
            self.shell
        );

        if self.phases.is_empty() {
            output.push_str("  no phases declared\n");
        }
        for phase in &self.phases {
            output.push_str(&format!(
                "  {}: {} command{}",
                style(phase.name).bold(),
                phase.commands,
                if phase.commands == 1 { "" } else { "s" }
            ));
            if phase.finally > 0 {
                output.push_str(&format!(", {} finally", phase.finally));
            }
            if phase.on_failure == "CONTINUE" {
                output.push_str(&format!(" {}", style("(on-failure: CONTINUE)").yellow()));
            }
            output.push('\n');
        }

        output.push_str(&format!(
            "  env: {} variables, {} parameter-store, {} secrets-manager\n",
            self.variables, self.parameter_store, self.secrets_manager
        ));

        for group in &self.artifacts {
            let label = match &group.identifier {
                Some(id) => format!("artifacts[{}]", id),
                None => "artifacts".to_string(),
            };
            output.push_str(&format!("  {}: {}", label, group.files.join(", ")));
            if let Some(base) = &group.base_directory {
                output.push_str(&format!(" (base-directory {})", base));
            }
            if group.discard_paths {
                output.push_str(" (discard-paths)");
            }
            output.push('\n');
        }

        output
    }
}

/// Execute the validate command
#[instrument(skip_all)]
pub fn execute_validate(args: ValidateArgs) -> Result<()> {
    let path = args.buildspec.unwrap_or_else(|| {
        args.source
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_BUILDSPEC_FILE)
    });
    debug!("Validating {}", path.display());

    let spec = load_buildspec(&path).map_err(BuildError::from)?;
    let plan = BuildPlan::from_spec(&path, &spec);

    match args.output {
        OutputFormat::Text => print!("{}", plan.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
    }
    Ok(())
}
