use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{GateConfig, PollConfig, RestartPolicy};
use crate::policy::{PolicyEngine, RejectReason};
use crate::queue::{JobId, JobSource};
use crate::worker::{EnvironmentBuilder, RunOutcome, RunResult, Supervisor};

/// Everything the loop remembers between cycles. Lost on restart; what that
/// means for the newest job is decided by [`RestartPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopState {
    pub last_processed_job_id: Option<JobId>,
    pub iteration_count: u64,
    /// Set after the first successful fetch
    pub primed: bool,
}

/// What one cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Queue empty, or the same job as last time
    Idle,
    FetchFailed { error: String },
    /// First job after start recorded as seen without running it
    Baseline { id: JobId },
    Rejected { id: JobId, reasons: Vec<RejectReason> },
    Executed { id: JobId, result: RunResult },
    LaunchFailed { id: JobId, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    MaxDuration,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u64,
    pub executed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub fetch_failures: u64,
    pub launch_failures: u64,
    pub stopped_by: StopReason,
}

impl LoopSummary {
    fn new() -> Self {
        Self {
            iterations: 0,
            executed: 0,
            rejected: 0,
            timed_out: 0,
            fetch_failures: 0,
            launch_failures: 0,
            stopped_by: StopReason::MaxIterations,
        }
    }

    fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Idle | CycleOutcome::Baseline { .. } => {}
            CycleOutcome::FetchFailed { .. } => self.fetch_failures += 1,
            CycleOutcome::Rejected { .. } => self.rejected += 1,
            CycleOutcome::Executed { result, .. } => {
                self.executed += 1;
                if result.timed_out {
                    self.timed_out += 1;
                }
            }
            CycleOutcome::LaunchFailed { .. } => self.launch_failures += 1,
        }
    }
}

/// Fetch → decide → (skip | compose + run) → wait, one job at a time.
///
/// A cycle never overlaps another: `step` awaits the supervised run before
/// returning, so at most one job is ever executing.
pub struct PollLoop<S> {
    config: PollConfig,
    source: S,
    policy: PolicyEngine,
    builder: EnvironmentBuilder,
    supervisor: Supervisor,
    state: LoopState,
}

impl<S: JobSource> PollLoop<S> {
    pub fn new(config: &GateConfig, source: S) -> Self {
        Self {
            config: config.poll.clone(),
            source,
            policy: PolicyEngine::new(&config.policy),
            builder: EnvironmentBuilder::new(config),
            supervisor: Supervisor::new(config.sandbox.clone()),
            state: LoopState::default(),
        }
    }

    /// Replace the default rule table, e.g. to add site-specific rules.
    pub fn with_policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run exactly one cycle, without the trailing wait.
    pub async fn step(&mut self) -> CycleOutcome {
        let outcome = self.cycle().await;
        self.state.iteration_count += 1;
        outcome
    }

    async fn cycle(&mut self) -> CycleOutcome {
        let fetched = if self.state.primed {
            self.source
                .fetch_next(self.state.last_processed_job_id.as_ref())
                .await
        } else {
            self.source.fetch_latest().await
        };

        let job = match fetched {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(error = %e, "Fetching job failed, retrying next cycle");
                return CycleOutcome::FetchFailed {
                    error: e.to_string(),
                };
            }
        };

        let first_fetch = !self.state.primed;
        self.state.primed = true;

        if !job.is_pending() || self.state.last_processed_job_id.as_ref() == Some(&job.id) {
            tracing::debug!("No new job");
            return CycleOutcome::Idle;
        }

        if first_fetch && self.config.restart_policy == RestartPolicy::SkipLatest {
            tracing::info!(job_id = %job.id, "Skipping job pending at startup");
            self.state.last_processed_job_id = Some(job.id.clone());
            return CycleOutcome::Baseline { id: job.id };
        }

        // Recorded before anything can fail: a job is attempted at most once.
        self.state.last_processed_job_id = Some(job.id.clone());

        let decision = self.policy.evaluate(&job.source_text);
        if !decision.allowed {
            let reasons = decision.reasons();
            tracing::info!(
                job_id = %job.id,
                reasons = ?reasons,
                violations = ?decision
                    .violations
                    .iter()
                    .map(|v| format!("{}@{}", v.pattern, v.line.unwrap_or(0)))
                    .collect::<Vec<_>>(),
                "Job rejected by admission policy"
            );
            self.announce(&format!(
                "program {} was not run: {}",
                job.id,
                reasons
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .await;
            return CycleOutcome::Rejected { id: job.id, reasons };
        }

        tracing::info!(job_id = %job.id, bytes = job.source_text.len(), "Job admitted");
        let request = self.builder.compose(&job.source_text);
        match self.supervisor.run(request).await {
            Ok(result) => {
                if result.outcome() == RunOutcome::TimedOut {
                    self.announce(&format!("program {} was stopped at its time limit", job.id))
                        .await;
                }
                CycleOutcome::Executed { id: job.id, result }
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job could not be launched");
                self.announce(&format!("program {} could not be started", job.id))
                    .await;
                CycleOutcome::LaunchFailed {
                    id: job.id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn announce(&self, message: &str) {
        if !self.config.announce_outcomes {
            return;
        }
        if let Err(e) = self.source.post_log(message).await {
            tracing::debug!(error = %e, "Observer notice dropped");
        }
    }

    /// How long to wait before the next cycle.
    ///
    /// After a launch the long interval is measured from the start of the
    /// run, so the next poll is never earlier than `long_wait` after launch.
    pub fn wait_after(&self, outcome: &CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Executed { result, .. } => {
                self.config.long_wait().saturating_sub(result.elapsed)
            }
            _ => self.config.short_wait(),
        }
    }

    /// Cycle until the iteration or duration budget is spent, or `shutdown`
    /// is cancelled. An in-flight cycle always completes first.
    pub async fn run(&mut self, shutdown: CancellationToken) -> LoopSummary {
        let started = Instant::now();
        let max_duration = self.config.max_duration();
        let mut summary = LoopSummary::new();

        tracing::info!(
            max_iterations = self.config.max_iterations,
            max_duration_ms = self.config.max_duration_ms,
            restart_policy = ?self.config.restart_policy,
            "Poll loop started"
        );

        summary.stopped_by = loop {
            if self.state.iteration_count >= self.config.max_iterations {
                break StopReason::MaxIterations;
            }
            if started.elapsed() >= max_duration {
                break StopReason::MaxDuration;
            }
            if shutdown.is_cancelled() {
                break StopReason::Shutdown;
            }

            let outcome = self.step().await;
            summary.record(&outcome);

            if self.state.iteration_count >= self.config.max_iterations {
                break StopReason::MaxIterations;
            }

            let wait = self
                .wait_after(&outcome)
                .min(max_duration.saturating_sub(started.elapsed()));
            tokio::select! {
                _ = shutdown.cancelled() => break StopReason::Shutdown,
                _ = tokio::time::sleep(wait) => {}
            }
        };
        summary.iterations = self.state.iteration_count;

        tracing::info!(
            iterations = summary.iterations,
            executed = summary.executed,
            rejected = summary.rejected,
            stopped_by = ?summary.stopped_by,
            "Poll loop stopped"
        );
        summary
    }
}
