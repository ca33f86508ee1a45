/// Sandbox Session - High-Level Orchestration
///
/// **Responsibility:**
/// Tie one bridge (and through it one host and backend) to the grader for a
/// single learner's attempts at a track's challenges.
///
/// **Architecture:**
/// 1. The bridge runs code in the session's own sandbox (bridge.rs, host.rs)
/// 2. The lifecycle record decides when a challenge needs a new database (lifecycle.rs)
/// 3. The grader turns results into a verdict (grader.rs)
///
/// Sessions are plain values: construct as many as needed, there is no global
/// sandbox. Operations on one session are serialized; separate sessions never
/// share anything.

use crate::backend::{BackendFactory, PythonBackendFactory, SqliteBackendFactory};
use crate::bridge::ExecutionBridge;
use crate::config::{TrackConfig, TrackConfigManager};
use crate::error::{Result, SandboxError};
use crate::grader;
use crate::lifecycle::DatabaseLifecycle;
use mastery_common::protocol::{HostState, SeedReport};
use mastery_common::types::{
    AssertionTest, Challenge, ChallengeKind, ExecutionResult, GradeVerdict, QueryTest,
    TestRunReport, Track,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// What `prepare` did for a challenge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preparation {
    pub challenge_id: String,
    pub track: Track,
    /// True when a new database was seeded or the namespace was cleared
    pub fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<SeedReport>,
}

/// Raw execution plus verdict for one submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub execution: ExecutionResult,
    pub verdict: GradeVerdict,
}

#[derive(Default)]
struct SessionState {
    initialized: bool,
    generation: u64,
    database: DatabaseLifecycle,
    challenge_id: Option<String>,
}

pub struct SandboxSession {
    id: Uuid,
    track: Track,
    bridge: ExecutionBridge,
    state: Mutex<SessionState>,
}

/// Backend factory for a configured track
pub fn factory_for(config: &TrackConfig) -> Arc<dyn BackendFactory> {
    match config.name {
        Track::Sql => Arc::new(SqliteBackendFactory),
        Track::Python => Arc::new(PythonBackendFactory::new(config.interpreter())),
    }
}

impl SandboxSession {
    pub fn new(factory: Arc<dyn BackendFactory>, config: TrackConfig) -> Self {
        let track = factory.track();
        Self {
            id: Uuid::new_v4(),
            track,
            bridge: ExecutionBridge::new(factory, config),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Session for `track` with the configured backend
    pub fn for_track(track: Track, configs: &TrackConfigManager) -> anyhow::Result<Self> {
        let config = configs.get_config(track)?.clone();
        Ok(Self::new(factory_for(&config), config))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn generation(&self) -> u64 {
        self.bridge.generation()
    }

    pub async fn initialize(&self) -> Result<HostState> {
        let mut state = self.state.lock().await;
        self.ensure_ready(&mut state).await
    }

    pub async fn status(&self) -> Result<HostState> {
        self.bridge.status().await
    }

    /// Runs source in the session's sandbox. Before `initialize` this is a
    /// failed result, not an error.
    pub async fn execute(&self, source: &str) -> Result<ExecutionResult> {
        let mut state = self.state.lock().await;
        self.sync(&mut state).await?;
        self.bridge.execute(source).await
    }

    pub async fn run_tests(&self, source: &str, tests: &[AssertionTest]) -> Result<TestRunReport> {
        let mut state = self.state.lock().await;
        self.sync(&mut state).await?;
        self.bridge.run_tests(source, tests).await
    }

    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reset_locked(&mut state).await
    }

    /// Boot the SQL engine if needed, then replace the database with one built from `seed`
    pub async fn initialize_database(&self, seed: &str) -> Result<SeedReport> {
        self.expect_track(Track::Sql)?;
        let mut state = self.state.lock().await;
        self.ensure_ready(&mut state).await?;
        self.load_seed_locked(&mut state, seed).await
    }

    /// Get the sandbox ready for a challenge.
    ///
    /// SQL re-seeds only when the seed differs from the loaded one; Python clears
    /// the namespace when the challenge changes.
    pub async fn prepare(&self, challenge: &Challenge) -> Result<Preparation> {
        let mut state = self.state.lock().await;
        self.prepare_locked(&mut state, challenge).await
    }

    /// Grade a SQL submission, computing the solution's rows on a scratch database
    pub async fn grade(
        &self,
        source: &str,
        execution: &ExecutionResult,
        tests: &[QueryTest],
        solution: &str,
        seed: &str,
    ) -> Result<GradeVerdict> {
        self.expect_track(Track::Sql)?;
        let mut state = self.state.lock().await;
        self.grade_sql_locked(&mut state, source, execution, tests, solution, seed)
            .await
    }

    /// Grade a Python submission: run the source, then every test against its namespace
    pub async fn grade_submission(
        &self,
        source: &str,
        tests: &[AssertionTest],
    ) -> Result<GradeVerdict> {
        self.expect_track(Track::Python)?;
        let mut state = self.state.lock().await;
        self.sync(&mut state).await?;
        let report = self.bridge.run_tests(source, tests).await?;
        Ok(grader::grade_python(&report, tests, state.initialized))
    }

    /// Prepare, run and grade in one go. Every submission is graded against a
    /// clean sandbox.
    pub async fn submit(&self, challenge: &Challenge, source: &str) -> Result<Submission> {
        let mut state = self.state.lock().await;
        let preparation = self.prepare_locked(&mut state, challenge).await?;
        if !preparation.fresh {
            self.reset_locked(&mut state).await?;
        }

        let execution = self.bridge.execute(source).await?;
        let verdict = match &challenge.kind {
            ChallengeKind::Sql { seed_data, tests } => {
                self.grade_sql_locked(
                    &mut state,
                    source,
                    &execution,
                    tests,
                    &challenge.solution,
                    seed_data,
                )
                .await?
            }
            ChallengeKind::Python { tests } => {
                // The source already ran; run the tests alone against its namespace
                let report = if execution.success {
                    self.bridge.run_tests("", tests).await?
                } else {
                    TestRunReport::setup_failed(
                        execution.error.clone().unwrap_or_default(),
                        execution.traceback.clone(),
                    )
                };
                grader::grade_python(&report, tests, state.initialized)
            }
        };

        info!(
            session_id = %self.id,
            challenge_id = %challenge.id,
            passed = verdict.passed,
            score = verdict.score,
            execution_ms = execution.execution_time_ms,
            "Submission graded"
        );
        Ok(Submission { execution, verdict })
    }

    /// Throw the worker away; the next call starts a fresh sandbox
    pub fn close(&self) {
        self.bridge.shutdown();
    }

    fn expect_track(&self, track: Track) -> Result<()> {
        if self.track != track {
            return Err(SandboxError::TrackMismatch {
                session: self.track,
                challenge: track,
            });
        }
        Ok(())
    }

    /// Initialize if never done, or again if the worker was replaced
    async fn ensure_ready(&self, state: &mut SessionState) -> Result<HostState> {
        if state.initialized && state.generation != self.bridge.generation() {
            self.forget_sandbox(state);
        }

        let host_state = self.bridge.initialize().await?;
        if !state.initialized {
            info!(session_id = %self.id, track = %self.track, "Session initialized");
        }
        state.initialized = true;
        state.generation = self.bridge.generation();
        Ok(host_state)
    }

    /// Re-initialize a replaced worker. Never initializes a session that was never initialized.
    async fn sync(&self, state: &mut SessionState) -> Result<()> {
        if state.initialized && state.generation != self.bridge.generation() {
            self.ensure_ready(state).await?;
        }
        Ok(())
    }

    fn forget_sandbox(&self, state: &mut SessionState) {
        warn!(
            session_id = %self.id,
            generation = self.bridge.generation(),
            "Sandbox worker was replaced; its state is gone"
        );
        state.initialized = false;
        state.database.forget();
        state.challenge_id = None;
    }

    async fn reset_locked(&self, state: &mut SessionState) -> Result<()> {
        self.sync(state).await?;
        if !state.initialized {
            return Ok(());
        }
        self.bridge.reset().await
    }

    async fn load_seed_locked(&self, state: &mut SessionState, seed: &str) -> Result<SeedReport> {
        match self.bridge.load_seed(seed).await {
            Ok(report) => {
                state.database.mark_loaded(seed, report.clone());
                Ok(report)
            }
            Err(e) => {
                state.database.forget();
                Err(e)
            }
        }
    }

    async fn prepare_locked(
        &self,
        state: &mut SessionState,
        challenge: &Challenge,
    ) -> Result<Preparation> {
        self.expect_track(challenge.track())?;
        if !state.initialized || state.generation != self.bridge.generation() {
            self.ensure_ready(state).await?;
        }

        let (fresh, seed) = match challenge.seed_data() {
            Some(seed) if state.database.needs_seed(seed) => {
                let report = self.load_seed_locked(state, seed).await?;
                (true, Some(report))
            }
            Some(_) => (false, state.database.last_report().cloned()),
            None => {
                let changed = state.challenge_id.as_deref() != Some(challenge.id.as_str());
                if changed {
                    self.bridge.reset().await?;
                }
                (changed, None)
            }
        };

        state.challenge_id = Some(challenge.id.clone());
        info!(
            session_id = %self.id,
            challenge_id = %challenge.id,
            fresh,
            "Challenge prepared"
        );

        Ok(Preparation {
            challenge_id: challenge.id.clone(),
            track: self.track,
            fresh,
            seed,
        })
    }

    async fn grade_sql_locked(
        &self,
        state: &mut SessionState,
        source: &str,
        execution: &ExecutionResult,
        tests: &[QueryTest],
        solution: &str,
        seed: &str,
    ) -> Result<GradeVerdict> {
        self.sync(state).await?;
        let reference = self.bridge.execute_reference(seed, solution).await?;
        let expected = if reference.success {
            reference.result_set
        } else {
            warn!(
                session_id = %self.id,
                error = reference.error.as_deref().unwrap_or(""),
                "Reference solution failed; grading without it"
            );
            None
        };
        Ok(grader::grade_sql_execution(
            source,
            execution,
            tests,
            expected.as_ref(),
        ))
    }
}
