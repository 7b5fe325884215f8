use std::fmt;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::config::{CommandConfig, ToolchainConfig};
use crate::sandbox::{
    Dependency, ExecutionFailure, ExecutionRequest, ExecutionResult, Executor, Workspace,
    WorkspaceManager, WorkspaceSpec,
};

/// A caller's build-and-test submission
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub project_name: Option<String>,
    pub source: String,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    #[serde(rename = "Accepted")]
    Accepted,
    #[serde(rename = "Compilation Error")]
    CompilationError,
    #[serde(rename = "Test Failure")]
    TestFailure,
    #[serde(rename = "Optimization Error")]
    OptimizationError,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "System Error")]
    SystemError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::CompilationError => "Compilation Error",
            Verdict::TestFailure => "Test Failure",
            Verdict::OptimizationError => "Optimization Error",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::SystemError => "System Error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Build,
    Test,
    Optimize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed { result: ExecutionResult },
    SpawnFailed { message: String },
    /// Started, but the executor lost track of it
    Failed { message: String },
    TimedOut { limit_ms: u64 },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: Step,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub verdict: Verdict,
    pub steps: Vec<StepReport>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.verdict == Verdict::Accepted
    }

    pub fn step(&self, step: Step) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| s.step == step)
            .map(|s| &s.outcome)
    }
}

/// Sequences workspace creation, build, test, optional optimize and cleanup
///
/// The workspace is released exactly once whichever step ends the run.
pub struct Orchestrator {
    manager: WorkspaceManager,
    executor: Executor,
    toolchain: ToolchainConfig,
}

impl Orchestrator {
    pub fn new(manager: WorkspaceManager, toolchain: ToolchainConfig) -> Self {
        let executor = Executor::new().with_grace_period(toolchain.grace_period.into());
        Self {
            manager,
            executor,
            toolchain,
        }
    }

    pub fn manager(&self) -> &WorkspaceManager {
        &self.manager
    }

    /// Main entry point for a build request
    pub async fn run(&self, request: &BuildRequest) -> Result<BuildReport> {
        let workspace = self.manager.create_workspace(&WorkspaceSpec {
            base_name: request.project_name.clone(),
            source: request.source.clone(),
            dependencies: request.dependencies.clone(),
        })?;

        // if this future is dropped or panics, the workspace's Drop releases it
        let report = self.run_steps(&workspace).await;
        log::info!(
            "Build in {} finished: {}",
            workspace.root_path().display(),
            report.verdict
        );

        workspace.release()?;
        Ok(report)
    }

    async fn run_steps(&self, workspace: &Workspace) -> BuildReport {
        let mut steps = Vec::new();

        // Step 1: build
        let build = self.run_step(&self.toolchain.build, workspace).await;
        let verdict = match &build {
            StepOutcome::Completed { result } if !result.success() => {
                Some(Verdict::CompilationError)
            }
            other => failure_verdict(other),
        };
        steps.push(StepReport {
            step: Step::Build,
            outcome: build,
        });
        if let Some(verdict) = verdict {
            return BuildReport { verdict, steps };
        }

        // Step 2: unit tests
        let test = self.run_step(&self.toolchain.test, workspace).await;
        let verdict = match &test {
            StepOutcome::Completed { result } if !result.success() => Some(Verdict::TestFailure),
            other => failure_verdict(other),
        };
        steps.push(StepReport {
            step: Step::Test,
            outcome: test,
        });
        if let Some(verdict) = verdict {
            return BuildReport { verdict, steps };
        }

        // Step 3: optimizer, if configured; its absence is not fatal
        let Some(optimize_config) = &self.toolchain.optimize else {
            return BuildReport {
                verdict: Verdict::Accepted,
                steps,
            };
        };

        let verdict = match self.run_step(optimize_config, workspace).await {
            StepOutcome::SpawnFailed { message } => {
                log::warn!("Optimizer unavailable, skipping: {message}");
                steps.push(StepReport {
                    step: Step::Optimize,
                    outcome: StepOutcome::Skipped {
                        reason: format!("optimizer unavailable: {message}"),
                    },
                });
                Verdict::Accepted
            }
            outcome => {
                let verdict = match &outcome {
                    StepOutcome::Completed { result } if !result.success() => {
                        Verdict::OptimizationError
                    }
                    other => failure_verdict(other).unwrap_or(Verdict::Accepted),
                };
                steps.push(StepReport {
                    step: Step::Optimize,
                    outcome,
                });
                verdict
            }
        };

        BuildReport { verdict, steps }
    }

    async fn run_step(&self, config: &CommandConfig, workspace: &Workspace) -> StepOutcome {
        let request = match generate_request(config, workspace) {
            Ok(request) => request,
            Err(e) => {
                return StepOutcome::SpawnFailed {
                    message: e.to_string(),
                };
            }
        };

        step_outcome(self.executor.execute(&request).await)
    }
}

fn step_outcome(outcome: Result<ExecutionResult, ExecutionFailure>) -> StepOutcome {
    match outcome {
        Ok(result) => StepOutcome::Completed { result },
        Err(e @ ExecutionFailure::Spawn { .. }) => StepOutcome::SpawnFailed {
            message: e.to_string(),
        },
        Err(e @ ExecutionFailure::Wait { .. }) => StepOutcome::Failed {
            message: e.to_string(),
        },
        Err(ExecutionFailure::TimeoutExceeded { limit }) => StepOutcome::TimedOut {
            limit_ms: limit.as_millis() as u64,
        },
    }
}

/// Verdict for outcomes that end the run regardless of step
fn failure_verdict(outcome: &StepOutcome) -> Option<Verdict> {
    match outcome {
        StepOutcome::SpawnFailed { .. } | StepOutcome::Failed { .. } => Some(Verdict::SystemError),
        StepOutcome::TimedOut { .. } => Some(Verdict::TimeLimitExceeded),
        StepOutcome::Completed { .. } | StepOutcome::Skipped { .. } => None,
    }
}

/// Builds the execution request by applying template substitutions per argument
fn generate_request(config: &CommandConfig, workspace: &Workspace) -> Result<ExecutionRequest> {
    let root = workspace.root_path().to_string_lossy();
    let source = workspace.source_file_path().to_string_lossy();
    let manifest = workspace.manifest_path().to_string_lossy();

    let substitutions = [
        ("%ROOT%", &*root),
        ("%SOURCE%", &*source),
        ("%MANIFEST%", &*manifest),
    ];

    let command: Vec<String> = config
        .command
        .iter()
        .map(|s| substitute(s, &substitutions))
        .collect();

    let Some((program, args)) = command.split_first() else {
        bail!("Empty command");
    };

    Ok(ExecutionRequest::new(program.as_str(), workspace.root_path())
        .args(args.iter().cloned())
        .envs(&config.env)
        .timeout(config.timeout.into()))
}

/// Single left-to-right pass: substituted values are never rescanned
fn substitute(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while !rest.is_empty() {
        for (key, value) in substitutions {
            if let Some(tail) = rest.strip_prefix(key) {
                out.push_str(value);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}
