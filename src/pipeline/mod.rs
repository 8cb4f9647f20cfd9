//! Tweak → slice → relay orchestration.
//!
//! [`Pipeline::run`] never returns an unhandled error: every failure ends up
//! in [`PipelineOutcome::result`], and the first failing stage stops the run.
//! Relay problems are the exception; they only produce warnings.

pub mod naming;
pub mod options;

use crate::config::Config;
use crate::gcode::{analyze_gcode_async, Analysis};
use crate::jobs::{JobId, JobRegistry, RegistryError};
use crate::process::{CommandSpec, ProcessOutput, ProcessRunner, RunError};
use crate::relay::{deliver, ArtifactRelay, RelayMetadata, RelayReport, RelayTarget};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use options::{Objective, OptionError, Stage, StagePlan, TweakOption, TweakSettings, DEFAULT_TWEAK_OPTION};

const SLICER_RELEASES_HINT: &str =
    "Search an appropriate version for your cpu architecture in https://github.com/prusa3d/PrusaSlicer/releases";
const TWEAKER_HINT: &str = "Make sure the configured tweaker command works on the command line of this host";

/// External tools driven by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tool {
    Tweaker,
    Slicer,
}

impl Tool {
    fn hint(self) -> &'static str {
        match self {
            Tool::Tweaker => TWEAKER_HINT,
            Tool::Slicer => SLICER_RELEASES_HINT,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Tweaker => f.write_str("Tweaker"),
            Tool::Slicer => f.write_str("Slicer"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("{tool} not found: {detail}. Make sure the configured path works on the command line")]
    LaunchFailed { tool: Tool, detail: String },
    #[error("{tool} can't be executed on this host ({detail}). {}", .tool.hint())]
    ToolNotExecutable { tool: Tool, detail: String },
    #[error("{stage} stage failed: {detail}")]
    ToolFailed {
        stage: Stage,
        exit_code: Option<i32>,
        detail: String,
    },
    #[error("{stage} stage was cancelled (job '{job_id}')")]
    Cancelled { stage: Stage, job_id: JobId },
    #[error("Job '{0}' is already running")]
    DuplicateJob(JobId),
    #[error("IO error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Stable identifier for API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::LaunchFailed { .. } => "launch_failed",
            PipelineError::ToolNotExecutable { .. } => "tool_not_executable",
            PipelineError::ToolFailed { .. } => "tool_failed",
            PipelineError::Cancelled { .. } => "cancelled",
            PipelineError::DuplicateJob(_) => "duplicate_job",
            PipelineError::Io(_) => "io",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::ToolFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    fn from_run(error: RunError, tool: Tool, stage: Stage) -> Self {
        match error {
            RunError::LaunchFailed { program, source } => PipelineError::LaunchFailed {
                tool,
                detail: format!("'{program}' ({source})"),
            },
            RunError::ToolNotExecutable { program, detail } => PipelineError::ToolNotExecutable {
                tool,
                detail: format!("'{program}': {detail}"),
            },
            RunError::Cancelled(job_id) => PipelineError::Cancelled { stage, job_id },
            RunError::Registry(RegistryError::DuplicateJob(job_id)) => PipelineError::DuplicateJob(job_id),
            RunError::Registry(e) => PipelineError::Io(e.to_string()),
            RunError::Io { program, source } => PipelineError::Io(format!("{program}: {source}")),
        }
    }
}

impl From<OptionError> for PipelineError {
    fn from(e: OptionError) -> Self {
        PipelineError::Validation(e.to_string())
    }
}

/// Immutable description of one end-to-end invocation.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub model_path: PathBuf,
    /// `None` disables slicing.
    pub profile_path: Option<PathBuf>,
    pub tweak_option: TweakOption,
    pub output_name: Option<String>,
    pub relay_target: Option<RelayTarget>,
    /// Model names from OctoPrint carry a `.tmp.` infix that is cut off.
    pub from_octoprint: bool,
}

impl PipelineRequest {
    /// Parses `tweak_option`; unknown tokens are rejected here, before any work.
    pub fn new(model_path: impl Into<PathBuf>, tweak_option: &str) -> Result<Self, PipelineError> {
        Ok(Self {
            model_path: model_path.into(),
            profile_path: None,
            tweak_option: tweak_option.parse()?,
            output_name: None,
            relay_target: None,
            from_octoprint: false,
        })
    }

    pub fn with_profile(mut self, profile: Option<PathBuf>) -> Self {
        self.profile_path = profile;
        self
    }

    pub fn with_output_name(mut self, name: Option<String>) -> Self {
        self.output_name = name;
        self
    }

    pub fn with_relay(mut self, target: Option<RelayTarget>) -> Self {
        self.relay_target = target;
        self
    }

    pub fn from_octoprint(mut self, from_octoprint: bool) -> Self {
        self.from_octoprint = from_octoprint;
        self
    }

    pub fn plan(&self) -> StagePlan {
        StagePlan::decide(&self.tweak_option, self.profile_path.is_some(), self.relay_target.is_some())
    }
}

/// Outcome of one executed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub ok: bool,
    /// Set iff `ok` for tweak and slice.
    pub output_path: Option<PathBuf>,
    /// Always set on failure.
    pub message: Option<String>,
    pub exit_code: Option<i32>,
}

impl StageResult {
    fn succeeded(stage: Stage, output_path: Option<PathBuf>, exit_code: Option<i32>) -> Self {
        Self {
            stage,
            ok: true,
            output_path,
            message: None,
            exit_code,
        }
    }

    fn failed(stage: Stage, error: &PipelineError) -> Self {
        Self {
            stage,
            ok: false,
            output_path: None,
            message: Some(error.to_string()),
            exit_code: error.exit_code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Mesh,
    Gcode,
}

/// The artifact handed back to the direct caller.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineArtifact {
    pub path: PathBuf,
    pub name: String,
    pub kind: ArtifactKind,
    /// Present for g-code.
    pub analysis: Option<Analysis>,
}

/// Everything a run produced: either an artifact or the first stage failure,
/// plus the stage log and relay warnings.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub plan: StagePlan,
    pub stages: Vec<StageResult>,
    pub relay: Vec<RelayReport>,
    pub result: Result<PipelineArtifact, PipelineError>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Relay messages that need the caller's attention.
    pub fn warnings(&self) -> Vec<String> {
        self.relay.iter().filter(|r| !r.ok).map(|r| r.message.clone()).collect()
    }

    pub fn summary(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "stages": self.stages,
            "relay": self.relay,
        });
        match &self.result {
            Ok(artifact) => {
                value["status"] = "success".into();
                value["artifact"] = serde_json::to_value(artifact).unwrap_or_default();
            }
            Err(e) => {
                value["status"] = "failure".into();
                value["error"] = serde_json::json!({ "kind": e.kind(), "message": e.to_string() });
            }
        }
        value
    }
}

/// Commands used for the external stages.
#[derive(Debug, Clone)]
pub struct ToolSet {
    /// Program followed by leading arguments.
    pub tweaker: Vec<String>,
    /// `None` when no slicer could be located.
    pub slicer: Option<PathBuf>,
    /// Model extensions the tools accept.
    pub allowed_extensions: Vec<String>,
}

impl ToolSet {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tweaker: config.tools.tweaker.clone(),
            slicer: config.tools.resolve_slicer(),
            allowed_extensions: config.tools.allowed_extensions.clone(),
        }
    }

    fn tweak_command(&self, input: &Path, output: &Path, settings: TweakSettings) -> Result<CommandSpec, PipelineError> {
        let (program, prefix) = self.tweaker.split_first().ok_or_else(|| PipelineError::LaunchFailed {
            tool: Tool::Tweaker,
            detail: "no tweaker command configured".to_string(),
        })?;
        let mut spec = CommandSpec::new(program).args(prefix).arg("-i").arg(input);
        if settings.extended {
            spec = spec.arg("--extended");
        }
        if settings.objective == Objective::Surface {
            spec = spec.arg("--minimize").arg("surface");
        }
        Ok(spec.arg("-o").arg(output))
    }

    fn slice_command(&self, input: &Path, profile: &Path, output: &Path) -> Result<CommandSpec, PipelineError> {
        let slicer = self.slicer.as_ref().ok_or_else(|| PipelineError::LaunchFailed {
            tool: Tool::Slicer,
            detail: "no slicer executable configured".to_string(),
        })?;
        Ok(CommandSpec::new(slicer)
            .arg("--export-gcode")
            .arg("--repair")
            .arg(input)
            .arg("--load")
            .arg(profile)
            .arg("--output")
            .arg(output))
    }
}

/// The orchestrator. Cheap to clone and shared by all request handlers.
#[derive(Clone)]
pub struct Pipeline {
    runner: ProcessRunner,
    tools: ToolSet,
    relay: Arc<dyn ArtifactRelay>,
}

impl Pipeline {
    pub fn new(runner: ProcessRunner, tools: ToolSet, relay: Arc<dyn ArtifactRelay>) -> Self {
        Self { runner, tools, relay }
    }

    pub fn from_config(config: &Config, registry: JobRegistry, relay: Arc<dyn ArtifactRelay>) -> Self {
        let runner = ProcessRunner::new(registry, config.runner.poll_interval(), config.runner.terminate_grace());
        Self::new(runner, ToolSet::from_config(config), relay)
    }

    pub fn registry(&self) -> &JobRegistry {
        self.runner.registry()
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn relay(&self) -> &Arc<dyn ArtifactRelay> {
        &self.relay
    }

    pub async fn run(&self, request: &PipelineRequest) -> PipelineOutcome {
        let plan = request.plan();
        tracing::info!(
            model = %request.model_path.display(),
            option = %request.tweak_option,
            stages = ?plan.stages(),
            "Starting pipeline"
        );
        let mut outcome = PipelineOutcome {
            plan,
            stages: Vec::new(),
            relay: Vec::new(),
            result: Err(PipelineError::Io("pipeline did not run".to_string())),
        };
        let result = self.execute(request, &plan, &mut outcome).await;
        outcome.result = result;
        cleanup_temporary_profile(request.profile_path.as_deref()).await;

        match &outcome.result {
            Ok(artifact) => tracing::info!("Pipeline finished, returning '{}'", artifact.name),
            Err(e) if e.is_cancelled() => tracing::info!("Pipeline stopped: {}", e),
            Err(e) => tracing::error!("Pipeline failed: {}", e),
        }
        outcome
    }

    async fn execute(
        &self,
        request: &PipelineRequest,
        plan: &StagePlan,
        outcome: &mut PipelineOutcome,
    ) -> Result<PipelineArtifact, PipelineError> {
        let inputs = validate(request, &self.tools.allowed_extensions)?;
        let work_dir = inputs.work_dir;

        let mut mesh_path = inputs.model_path;
        let mut mesh_name = inputs.model_name;

        if let Some(settings) = plan.tweak {
            let tweaked = naming::tweaked_name(&mesh_name, request.from_octoprint);
            let output = work_dir.join(&tweaked);
            let result = self.tweak(&mesh_path, &output, &work_dir, settings).await;
            record(outcome, Stage::Tweak, &result, Some(output.clone()))?;
            tracing::info!("Tweaking was successful");
            mesh_path = output;
            mesh_name = tweaked;
        } else {
            tracing::info!("Tweaking was skipped as expected.");
        }

        let mut gcode = None;
        if let (true, Some(profile)) = (plan.slice, inputs.profile_path.as_deref()) {
            let gcode_name = naming::sliced_name(&mesh_name, inputs.output_name.as_deref());
            let output = work_dir.join(&gcode_name);
            tracing::info!("Machinecode will have the name '{}'", gcode_name);
            let result = self.slice(&mesh_path, profile, &output, &work_dir).await;
            record(outcome, Stage::Slice, &result, Some(output.clone()))?;
            tracing::info!("Slicing was successful");
            let analysis = analyze_gcode_async(output.clone()).await;
            gcode = Some(PipelineArtifact {
                path: output,
                name: gcode_name,
                kind: ArtifactKind::Gcode,
                analysis: Some(analysis),
            });
        }

        let mesh = PipelineArtifact {
            path: mesh_path,
            name: mesh_name,
            kind: ArtifactKind::Mesh,
            analysis: None,
        };

        if let (true, Some(target)) = (plan.relays(), request.relay_target.as_ref()) {
            let mut to_send = Vec::with_capacity(2);
            if plan.relay_mesh {
                to_send.push(&mesh);
            }
            if let (true, Some(gcode)) = (plan.relay_gcode, gcode.as_ref()) {
                to_send.push(gcode);
            }
            for artifact in to_send {
                let metadata = RelayMetadata {
                    artifact_name: artifact.name.clone(),
                    tweak_option: request.tweak_option.to_string(),
                };
                let report = deliver(self.relay.as_ref(), target, &artifact.path, &metadata).await;
                outcome.relay.push(report);
            }
            let warnings = outcome.warnings();
            outcome.stages.push(StageResult {
                stage: Stage::Relay,
                ok: warnings.is_empty(),
                output_path: None,
                message: (!warnings.is_empty()).then(|| warnings.join("\n")),
                exit_code: None,
            });
        } else {
            tracing::info!("Sending back file was skipped as expected.");
        }

        Ok(gcode.unwrap_or(mesh))
    }

    async fn tweak(
        &self,
        input: &Path,
        output: &Path,
        work_dir: &Path,
        settings: TweakSettings,
    ) -> Result<ProcessOutput, PipelineError> {
        let spec = self.tools.tweak_command(input, output, settings)?.current_dir(work_dir);
        let job_id = JobId::for_artifact(output);
        let result = self
            .runner
            .run(&spec, job_id)
            .await
            .map_err(|e| PipelineError::from_run(e, Tool::Tweaker, Stage::Tweak))?;
        check_output(Tool::Tweaker, Stage::Tweak, &result, output, true)?;
        Ok(result)
    }

    async fn slice(
        &self,
        input: &Path,
        profile: &Path,
        output: &Path,
        work_dir: &Path,
    ) -> Result<ProcessOutput, PipelineError> {
        let spec = self.tools.slice_command(input, profile, output)?.current_dir(work_dir);
        let job_id = JobId::for_artifact(output);
        let result = self
            .runner
            .run(&spec, job_id)
            .await
            .map_err(|e| PipelineError::from_run(e, Tool::Slicer, Stage::Slice))?;
        check_output(Tool::Slicer, Stage::Slice, &result, output, false)?;
        Ok(result)
    }
}

/// Request inputs after validation, with absolute paths.
struct ValidatedInputs {
    model_path: PathBuf,
    model_name: String,
    profile_path: Option<PathBuf>,
    /// Sanitized output name override.
    output_name: Option<String>,
    /// Directory of the model; tools run here and write their artifacts here.
    work_dir: PathBuf,
}

/// Inputs must exist and have usable names before any tool is launched.
fn validate(request: &PipelineRequest, allowed_extensions: &[String]) -> Result<ValidatedInputs, PipelineError> {
    if !request.model_path.is_file() {
        return Err(PipelineError::Validation(format!(
            "Model file '{}' does not exist",
            request.model_path.display()
        )));
    }
    let model_path = absolute(&request.model_path)?;
    let model_name = model_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::Validation("Model file name is not valid UTF-8".to_string()))?;
    if !naming::allowed_file(&model_name, allowed_extensions) {
        return Err(PipelineError::Validation(format!("Invalid model extension: '{model_name}'")));
    }
    let profile_path = match &request.profile_path {
        Some(profile) if !profile.is_file() => {
            return Err(PipelineError::Validation(format!(
                "Profile '{}' does not exist",
                profile.display()
            )));
        }
        Some(profile) => Some(absolute(profile)?),
        None => None,
    };
    let output_name = match request.output_name.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(name) => Some(naming::sanitize_filename(name).ok_or_else(|| {
            PipelineError::Validation(format!("Invalid machinecode name '{name}'"))
        })?),
    };
    let work_dir = model_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| PipelineError::Validation(format!("'{}' has no parent directory", model_path.display())))?;
    Ok(ValidatedInputs {
        model_path,
        model_name,
        profile_path,
        output_name,
        work_dir,
    })
}

fn absolute(path: &Path) -> Result<PathBuf, PipelineError> {
    std::path::absolute(path).map_err(|e| PipelineError::Io(format!("{}: {}", path.display(), e)))
}

fn check_output(
    tool: Tool,
    stage: Stage,
    output: &ProcessOutput,
    artifact: &Path,
    require_quiet: bool,
) -> Result<(), PipelineError> {
    if output.indicates_not_executable() {
        tracing::error!("{} could not be executed: {}", tool, output.stderr_text());
        return Err(PipelineError::ToolNotExecutable {
            tool,
            detail: format!("exit code {:?}", output.exit_code),
        });
    }
    if !output.success() {
        tracing::error!("{} error output: {}", tool, output.stderr_text());
        let detail = match output.exit_code {
            Some(code) => format!("{tool} exited with the nonzero returncode {code}"),
            None => format!("{tool} was terminated by a signal"),
        };
        return Err(PipelineError::ToolFailed {
            stage,
            exit_code: output.exit_code,
            detail,
        });
    }
    if require_quiet && !output.stdout.is_empty() {
        tracing::error!("{} reported: {}", tool, output.stdout_text());
        return Err(PipelineError::ToolFailed {
            stage,
            exit_code: output.exit_code,
            detail: format!("{tool} finished with unexpected diagnostic output"),
        });
    }
    if !artifact.is_file() {
        return Err(PipelineError::ToolFailed {
            stage,
            exit_code: output.exit_code,
            detail: format!("{tool} did not produce '{}'", artifact.display()),
        });
    }
    Ok(())
}

/// Push the stage's result and turn a failure into the pipeline error.
fn record(
    outcome: &mut PipelineOutcome,
    stage: Stage,
    result: &Result<ProcessOutput, PipelineError>,
    output_path: Option<PathBuf>,
) -> Result<(), PipelineError> {
    match result {
        Ok(output) => {
            outcome.stages.push(StageResult::succeeded(stage, output_path, output.exit_code));
            Ok(())
        }
        Err(e) => {
            outcome.stages.push(StageResult::failed(stage, e));
            Err(e.clone())
        }
    }
}

/// Remove a single-use profile once the run is over.
async fn cleanup_temporary_profile(profile: Option<&Path>) {
    let Some(profile) = profile else {
        return;
    };
    let is_temporary = profile
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(naming::is_temporary_profile);
    if !is_temporary {
        return;
    }
    match tokio::fs::remove_file(profile).await {
        Ok(()) => tracing::debug!("Removed temporary profile '{}'", profile.display()),
        Err(e) => tracing::warn!("Could not remove temporary profile '{}': {}", profile.display(), e),
    }
}
