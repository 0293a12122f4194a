//! Solution judge
//!
//! One judge serves one submission: it compiles the source once into shared
//! storage, then runs the artifact against any number of tests. Every test
//! starts from a copy of the compile-time pipeline state, so one test's
//! failure never leaks into the next.
//!
//! A compiled judge can be turned into a [`CompiledSnapshot`] and rebuilt on
//! another worker node with [`SolutionJudge::from_snapshot`]; only the base
//! pipeline state and the shared storage reference travel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::checker::{output_exists, output_retrieved, AnswerEncoding, WhitespaceTokenizedVerifier};
use crate::compiler::Compiler;
use crate::core::utils::digest_path;
use crate::core::{property, JudgeId, Properties};
use crate::error::JudgeError;
use crate::executor::{ConsoleStreams, Executor};
use crate::languages::LanguageConfig;
use crate::pipeline::{settled, CompileOutcome, Pipeline, PipelineState, SolutionResult, Staged};
use crate::sandbox::{ExecutionOutcome, ResourceLimits};
use crate::services::JudgeServices;
use crate::storage::{ScratchSpace, SharedScratchSpace};

/// Compiled artifact name inside shared storage
pub const ARTIFACT: &str = "program";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Per-judge I/O settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeOptions {
    /// Feed the input on stdin and check stdout instead of using files
    pub console_io: bool,
    pub input_file: String,
    pub output_file: String,
    pub encoding: AnswerEncoding,
}

impl Default for JudgeOptions {
    fn default() -> Self {
        Self {
            console_io: false,
            input_file: "input.txt".to_string(),
            output_file: "output.txt".to_string(),
            encoding: AnswerEncoding::Ascii,
        }
    }
}

/// Compiled artifact recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    /// Hex SHA-256 over the artifact tree
    pub digest: String,
}

/// Everything a worker needs to run tests for an already compiled submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledSnapshot {
    pub version: u32,
    pub judge_id: JudgeId,
    pub language: Option<String>,
    pub shared_storage: PathBuf,
    /// Absent when compilation failed
    pub artifact: Option<ArtifactRef>,
    pub base: PipelineState,
    pub options: JudgeOptions,
}

#[derive(Debug, Clone)]
struct CompiledState {
    language: Option<LanguageConfig>,
    artifact: Option<String>,
    base: PipelineState,
}

#[derive(Debug)]
enum JudgePhase {
    Uncompiled,
    Compiled(CompiledState),
    Closed,
}

/// One test as a run sees it. `reference` is set only when the answer is
/// checked.
struct TestCase {
    input: PathBuf,
    reference: Option<PathBuf>,
    limits: ResourceLimits,
    max_score: f64,
}

pub struct SolutionJudge {
    id: JudgeId,
    services: Arc<JudgeServices>,
    options: JudgeOptions,
    local: ScratchSpace,
    shared: SharedScratchSpace,
    phase: Mutex<JudgePhase>,
}

impl SolutionJudge {
    pub fn new(services: Arc<JudgeServices>, options: JudgeOptions) -> Result<Self> {
        let id = JudgeId::new();
        let local = services.create_scratch(id)?;
        let shared = SharedScratchSpace::create(&services.config.shared_storage_root)?;
        info!("Created judge {} (console I/O: {})", id, options.console_io);

        Ok(Self {
            id,
            services,
            options,
            local,
            shared,
            phase: Mutex::new(JudgePhase::Uncompiled),
        })
    }

    /// Rebuild a compiled judge, possibly on another node
    pub async fn from_snapshot(services: Arc<JudgeServices>, snapshot: CompiledSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(JudgeError::SnapshotVersion(snapshot.version).into());
        }

        let shared = SharedScratchSpace::attach(&snapshot.shared_storage)?;
        let language = snapshot
            .language
            .as_deref()
            .map(|name| {
                services
                    .languages
                    .get(name)
                    .cloned()
                    .with_context(|| format!("Snapshot names unsupported language {}", name))
            })
            .transpose()?;

        if let Some(artifact) = &snapshot.artifact {
            let digest = digest_path(&shared.path()?.join(&artifact.name)).await?;
            if digest != artifact.digest {
                warn!(
                    "Artifact digest mismatch for judge {}: expected {}, found {}",
                    snapshot.judge_id, artifact.digest, digest
                );
                return Err(JudgeError::ArtifactMismatch.into());
            }
        }

        let local = services.create_scratch(snapshot.judge_id)?;
        debug!("Rehydrated judge {} from snapshot", snapshot.judge_id);

        Ok(Self {
            id: snapshot.judge_id,
            services,
            options: snapshot.options,
            local,
            shared,
            phase: Mutex::new(JudgePhase::Compiled(CompiledState {
                language,
                artifact: snapshot.artifact.map(|a| a.name),
                base: snapshot.base,
            })),
        })
    }

    pub fn id(&self) -> JudgeId {
        self.id
    }

    /// Compile the submission. Callable once; the outcome (failed or not)
    /// becomes the base state of every later run.
    pub async fn compile(&self, sources: &[PathBuf]) -> Result<SolutionResult> {
        let mut phase = self.phase.lock().await;
        match *phase {
            JudgePhase::Uncompiled => {}
            JudgePhase::Compiled(_) => return Err(JudgeError::AlreadyCompiled.into()),
            JudgePhase::Closed => return Err(JudgeError::Closed.into()),
        }

        let language = match sources {
            [source] => self.services.languages.for_source(source).cloned(),
            _ => None,
        };
        let outcome = self.compile_sources(sources, language.as_ref()).await;
        let base = settled(Pipeline::new().compile_stage(outcome));

        let artifact = (!base.is_failed()).then(|| ARTIFACT.to_string());
        info!(
            "Judge {} compiled: {}",
            self.id,
            base.verdict().map_or("ok".to_string(), |v| v.to_string())
        );

        let result = base.build();
        *phase = JudgePhase::Compiled(CompiledState {
            language,
            artifact,
            base,
        });
        Ok(result)
    }

    async fn compile_sources(
        &self,
        sources: &[PathBuf],
        language: Option<&LanguageConfig>,
    ) -> Result<CompileOutcome> {
        let [source] = sources else {
            anyhow::bail!("Expected exactly one source file, got {}", sources.len());
        };
        let Some(language) = language else {
            let name = source.file_name().unwrap_or_default().to_string_lossy();
            debug!("No language for {:?}", source);
            return Ok(CompileOutcome::CompileError(format!(
                "Unknown file type: {}. Please check the file type.",
                name
            )));
        };

        let shared = self.shared.path()?;
        let staged = shared.join(&language.source_file);
        fs::copy(source, &staged)
            .await
            .with_context(|| format!("Failed to copy {:?} into shared storage", source))?;

        let compiler = Compiler::new(
            language.compiler,
            language.flags.clone(),
            self.services.config.compile_timeout,
        );
        Ok(compiler.compile(&staged, &shared.join(ARTIFACT)).await.into())
    }

    /// Whether a runnable artifact exists. A failed compilation leaves the
    /// judge compiled-but-failed, which is not compiled in this sense.
    pub async fn is_compiled(&self) -> bool {
        match &*self.phase.lock().await {
            JudgePhase::Compiled(state) => !state.base.is_failed(),
            _ => false,
        }
    }

    /// Result as of compilation, before any test
    pub async fn current_status(&self) -> SolutionResult {
        match &*self.phase.lock().await {
            JudgePhase::Compiled(state) => state.base.build(),
            _ => PipelineState::default().build(),
        }
    }

    /// Files a test run produces for checking
    pub fn output_files(&self) -> Vec<String> {
        if self.options.console_io {
            Vec::new()
        } else {
            vec![self.options.output_file.clone()]
        }
    }

    /// Run the compiled program against one test.
    ///
    /// Caller errors (not compiled, missing test files, bad limits) come back
    /// as `Err`; everything that happens to the submission is in the result.
    /// Without `check_answer` the output is never compared and nothing is
    /// awarded.
    pub async fn run(
        &self,
        test_files: &[PathBuf],
        check_answer: bool,
        max_score: f64,
        properties: &Properties,
    ) -> Result<SolutionResult> {
        let state = match &*self.phase.lock().await {
            JudgePhase::Uncompiled => return Err(JudgeError::NotCompiled.into()),
            JudgePhase::Closed => return Err(JudgeError::Closed.into()),
            JudgePhase::Compiled(state) => state.clone(),
        };

        let pipeline = match state.base.resume() {
            Ok(pipeline) => pipeline,
            Err(failed) => {
                debug!("Judge {} did not compile, skipping test", self.id);
                return Ok(failed.state().build());
            }
        };

        let limits = ResourceLimits::from_properties(properties)?;
        let test = self.locate(test_files, check_answer, limits, max_score)?;
        let language = state.language.context("Compiled judge has no language")?;
        let program = self.shared.path()?.join(state.artifact.as_deref().unwrap_or(ARTIFACT));

        let staged = if self.options.console_io {
            self.judge_console(pipeline, &language, &program, &test).await
        } else {
            self.judge_files(pipeline, &language, &program, &test).await
        };

        let result = settled(staged).build();
        info!(
            "Judge {} test finished: {:?} (score {})",
            self.id, result.verdict, result.score
        );
        Ok(result)
    }

    fn locate(
        &self,
        test_files: &[PathBuf],
        check_answer: bool,
        limits: ResourceLimits,
        max_score: f64,
    ) -> Result<TestCase, JudgeError> {
        let find = |name: &str| {
            test_files
                .iter()
                .find(|f| f.file_name().is_some_and(|n| n == name))
                .cloned()
        };

        let input = find(&self.options.input_file)
            .ok_or_else(|| JudgeError::MissingTestFile(self.options.input_file.clone()))?;
        let reference = if check_answer {
            let reference = find(&self.options.output_file)
                .ok_or_else(|| JudgeError::MissingTestFile(self.options.output_file.clone()))?;
            Some(reference)
        } else {
            None
        };
        Ok(TestCase {
            input,
            reference,
            limits,
            max_score,
        })
    }

    async fn judge_console(
        &self,
        pipeline: Pipeline,
        language: &LanguageConfig,
        program: &Path,
        test: &TestCase,
    ) -> Staged {
        let streams = match fs::read(&test.input).await {
            Ok(input) => ConsoleStreams::new()
                .with_stdin(input)
                .capture_stdout()
                .capture_stderr(),
            Err(e) => {
                let e = anyhow::Error::new(e).context(format!("Failed to read {:?}", test.input));
                return pipeline.runtime_stage(Err(e));
            }
        };

        let (mut executor, outcome) = match self
            .launch(language, program, test.limits, Some(streams), None, Vec::new())
            .await
        {
            Ok(launched) => launched,
            Err(e) => return pipeline.runtime_stage(Err(e)),
        };
        let output = executor.take_output().unwrap_or_default();
        self.release(executor);
        if !output.stderr.is_empty() {
            debug!("Program stderr: {}", String::from_utf8_lossy(&output.stderr));
        }

        let pipeline = pipeline.runtime_stage(Ok(outcome))?;
        let Some(reference) = &test.reference else {
            return Ok(pipeline);
        };

        let verifier = WhitespaceTokenizedVerifier::new(reference, self.options.encoding);
        pipeline.checking_stage(verifier.check(&output.stdout).await, test.max_score)
    }

    async fn judge_files(
        &self,
        pipeline: Pipeline,
        language: &LanguageConfig,
        program: &Path,
        test: &TestCase,
    ) -> Staged {
        // each run retrieves into its own directory, removed when the run ends
        let run_dir = match self.run_dir() {
            Ok(dir) => dir,
            Err(e) => return pipeline.runtime_stage(Err(e)),
        };
        let user_output = run_dir
            .path()
            .join(format!("{}.user", self.options.output_file));

        let write_files = self.output_files();
        let (executor, outcome) = match self
            .launch(language, program, test.limits, None, Some(&test.input), write_files)
            .await
        {
            Ok(launched) => launched,
            Err(e) => return pipeline.runtime_stage(Err(e)),
        };
        let pipeline = match pipeline.runtime_stage(Ok(outcome)) {
            Ok(pipeline) => pipeline,
            Err(failed) => {
                self.release(executor);
                return Err(failed);
            }
        };

        let retrieved = executor.get_file(&self.options.output_file, &user_output).await;
        self.release(executor);

        let pipeline = pipeline.output_stage(output_retrieved(retrieved))?;
        let pipeline = pipeline.output_stage(Ok(output_exists(&user_output).await))?;
        let Some(reference) = &test.reference else {
            return Ok(pipeline);
        };

        let verifier = WhitespaceTokenizedVerifier::new(reference, self.options.encoding);
        let check = match fs::read(&user_output).await {
            Ok(actual) => verifier.check(&actual).await,
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to read {:?}", user_output))),
        };
        pipeline.checking_stage(check, test.max_score)
    }

    fn run_dir(&self) -> Result<TempDir> {
        let local = self.local.path()?;
        tempfile::Builder::new()
            .prefix("run")
            .tempdir_in(local)
            .with_context(|| format!("Failed to create run directory under {:?}", local))
    }

    /// Prepare a fresh executor and run the program in it
    async fn launch(
        &self,
        language: &LanguageConfig,
        program: &Path,
        limits: ResourceLimits,
        streams: Option<ConsoleStreams>,
        input: Option<&Path>,
        write_files: Vec<String>,
    ) -> Result<(Executor, ExecutionOutcome)> {
        let mut executor =
            Executor::for_runtime(language.runtime, &self.services, self.id, write_files).await?;
        executor.set_limits(limits)?;
        if let Some(streams) = streams {
            executor.set_streams(streams)?;
        }
        if let Some(input) = input {
            executor.provide_file(input).await?;
        }

        let outcome = executor.execute(program).await?;
        Ok((executor, outcome))
    }

    fn release(&self, executor: Executor) {
        if let Err(e) = executor.close() {
            warn!("Failed to close executor of judge {}: {:#}", self.id, e);
        }
    }

    /// Compiled state for handing to another worker
    pub async fn snapshot(&self) -> Result<CompiledSnapshot> {
        let state = match &*self.phase.lock().await {
            JudgePhase::Compiled(state) => state.clone(),
            JudgePhase::Uncompiled => return Err(JudgeError::NotCompiled.into()),
            JudgePhase::Closed => return Err(JudgeError::Closed.into()),
        };

        let shared = self.shared.path()?.to_path_buf();
        let artifact = match state.artifact {
            Some(name) => Some(ArtifactRef {
                digest: digest_path(&shared.join(&name)).await?,
                name,
            }),
            None => None,
        };

        Ok(CompiledSnapshot {
            version: SNAPSHOT_VERSION,
            judge_id: self.id,
            language: state.language.map(|l| l.name),
            shared_storage: shared,
            artifact,
            base: state.base,
            options: self.options.clone(),
        })
    }

    /// Release node-local scratch. Idempotent.
    pub async fn close_local(&self) -> Result<()> {
        *self.phase.lock().await = JudgePhase::Closed;
        self.local.close()
    }

    /// Release the shared artifact storage. Idempotent.
    pub async fn close_shared(&self) -> Result<()> {
        *self.phase.lock().await = JudgePhase::Closed;
        self.shared.close()
    }
}

/// Builds judges from per-problem properties
pub struct JudgeFactory {
    services: Arc<JudgeServices>,
}

impl JudgeFactory {
    pub fn new(services: Arc<JudgeServices>) -> Self {
        Self { services }
    }

    pub fn create(&self, properties: &Properties) -> Result<SolutionJudge> {
        let console_io = match properties.get("consoleIO") {
            Some(_) => property::<bool>(properties, "consoleIO")?,
            None => false,
        };
        let encoding = match properties.get("charset") {
            Some(charset) => charset.parse()?,
            None => AnswerEncoding::default(),
        };
        let options = JudgeOptions {
            console_io,
            encoding,
            ..JudgeOptions::default()
        };
        SolutionJudge::new(self.services.clone(), options)
    }

    pub async fn restore(&self, snapshot: CompiledSnapshot) -> Result<SolutionJudge> {
        SolutionJudge::from_snapshot(self.services.clone(), snapshot).await
    }

    pub fn maximum_score_for_test(properties: &Properties) -> Result<f64, JudgeError> {
        property(properties, "maximumScorePerTest")
    }
}
