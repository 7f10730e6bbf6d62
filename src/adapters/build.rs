use crate::adapters::process::run_command;
use crate::adapters::{render_template, shell_quote, BuildAdapter, BuildOutcome, BuildRequest, BuildStatus};
use crate::project_config::ToolRule;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Builds by running the project's build command template locally.
pub struct ProcessBuildAdapter {
    template: String,
    working_dir: PathBuf,
    optimize_flags: Option<String>,
}

impl ProcessBuildAdapter {
    pub fn new(template: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            working_dir: working_dir.into(),
            optimize_flags: None,
        }
    }

    pub fn from_rule(rule: &ToolRule, working_dir: &Path) -> Self {
        Self {
            template: rule.build_command.clone(),
            working_dir: working_dir.to_path_buf(),
            optimize_flags: rule.optimize_flags.clone(),
        }
    }

    /// The shell command for `request`.
    pub fn command(&self, request: &BuildRequest) -> String {
        let quote = |p: &Path| shell_quote(&p.to_string_lossy());
        let optimize = if request.optimized {
            self.optimize_flags.clone().unwrap_or_default()
        } else {
            String::new()
        };
        render_template(
            &self.template,
            &[
                ("descriptor", quote(&request.descriptor)),
                (
                    "solution",
                    request
                        .solution
                        .as_deref()
                        .map(quote)
                        .unwrap_or_else(|| quote(&request.descriptor)),
                ),
                ("configuration", request.configuration.clone()),
                ("platform", request.platform.clone().unwrap_or_default()),
                ("out_dir", quote(&request.out_dir)),
                ("int_dir", quote(&request.int_dir)),
                ("verbosity", request.verbosity.clone()),
                (
                    "target",
                    if request.rebuild { "Rebuild" } else { "Build" }.to_string(),
                ),
                ("optimize", optimize),
            ],
        )
    }
}

#[async_trait]
impl BuildAdapter for ProcessBuildAdapter {
    async fn build(&self, request: &BuildRequest) -> BuildOutcome {
        let command = self.command(request);
        tracing::debug!("Building: {}", command);

        let result = run_command(&self.working_dir, &command, request.timeout, &[]).await;
        let status = if result.success() {
            BuildStatus::Success
        } else {
            tracing::debug!(
                "Build of {} ended with {:?}",
                request.descriptor.display(),
                result.exit
            );
            BuildStatus::Failed
        };

        BuildOutcome {
            status,
            log: result.output,
            duration_ms: result.duration_ms,
        }
    }
}
