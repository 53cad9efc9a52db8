/// Request Executor - one queued submission, end to end
///
/// **Steps:**
/// 1. Load the assessment and its job (missing job → configured default cutoff)
/// 2. Score the answers with the aggregator
/// 3. Persist the result, which marks the assessment completed
/// 4. Refresh the job leaderboard under the distributed ranking lock
///
/// **Failures:**
/// - Before step 3 the request is pushed back onto the queue, up to [`MAX_ATTEMPTS`]
///   attempts in total. After that the assessment is marked failed with the reason.
/// - A failed refresh in step 4 is logged only. The result is already stored and the
///   next completion for the job recomputes the whole leaderboard.
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use skillgrade_common::config::ScoringConfig;
use skillgrade_common::store::{
    AssessmentStore, CohortStore, EvaluationQueue, QuestionStore, RankingLock, ResultSink,
};
use skillgrade_common::types::{Assessment, AssessmentResult, EvaluationRequest, Job};
use skillgrade_engine::{Aggregator, CodeRunner, RankingUpdater};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

pub const MAX_ATTEMPTS: u32 = 3;
const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Everything the worker needs from its backing store
pub trait WorkerStore:
    QuestionStore
    + ResultSink
    + CohortStore
    + AssessmentStore
    + EvaluationQueue
    + RankingLock
    + Clone
    + 'static
{
}

impl<T> WorkerStore for T where
    T: QuestionStore
        + ResultSink
        + CohortStore
        + AssessmentStore
        + EvaluationQueue
        + RankingLock
        + Clone
        + 'static
{
}

pub struct Executor<S, R> {
    store: S,
    aggregator: Aggregator<S, R>,
    ranking: RankingUpdater<S>,
    poll_timeout: Duration,
}

impl<S: WorkerStore, R: CodeRunner> Executor<S, R> {
    pub fn new(store: S, runner: R, config: ScoringConfig) -> Self {
        Self {
            aggregator: Aggregator::new(store.clone(), runner, config),
            ranking: RankingUpdater::new(store.clone()),
            store,
            poll_timeout: POLL_TIMEOUT,
        }
    }

    /// How long one queue poll blocks, which bounds how late shutdown is noticed
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Consume requests until `shutdown` turns true. A request that has been popped
    /// is always handled to the end; shutdown is only checked between requests.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            match self.store.pop_request(self.poll_timeout).await {
                Ok(Some(request)) => self.handle(request).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Queue error");
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                }
            }
        }
        info!("Worker loop stopped");
    }

    pub async fn handle(&self, request: EvaluationRequest) {
        info!(
            request_id = %request.id,
            assessment_id = %request.assessment_id,
            answers = request.answers.len(),
            attempt = request.attempts + 1,
            "Received evaluation request"
        );

        let start = Instant::now();
        match self.process(&request).await {
            Ok(result) => info!(
                request_id = %request.id,
                assessment_id = %request.assessment_id,
                total_score = result.total_score,
                is_passed = result.is_passed,
                execution_ms = start.elapsed().as_millis() as u64,
                "Evaluation completed"
            ),
            Err(e) => self.retry_or_fail(request, e).await,
        }
    }

    async fn retry_or_fail(&self, mut request: EvaluationRequest, failure: anyhow::Error) {
        request.attempts += 1;

        if request.attempts < MAX_ATTEMPTS {
            match self.store.push_request(&request).await {
                Ok(()) => {
                    warn!(
                        request_id = %request.id,
                        assessment_id = %request.assessment_id,
                        attempts = request.attempts,
                        error = ?failure,
                        "Evaluation failed, request requeued"
                    );
                    return;
                }
                Err(e) => error!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to requeue request"
                ),
            }
        }

        error!(
            request_id = %request.id,
            assessment_id = %request.assessment_id,
            attempts = request.attempts,
            error = ?failure,
            "Evaluation failed, assessment marked failed"
        );
        let reason = format!("{:#}", failure);
        if let Err(e) = self.store.mark_failed(&request.assessment_id, &reason).await {
            error!(
                assessment_id = %request.assessment_id,
                error = %e,
                "Failed to record evaluation failure"
            );
        }
    }

    pub async fn process(&self, request: &EvaluationRequest) -> Result<AssessmentResult> {
        let assessment = self
            .store
            .load_assessment(&request.assessment_id)
            .await
            .context("Failed to load assessment")?
            .ok_or_else(|| anyhow!("Assessment {} not found", request.assessment_id))?;

        let job = match self
            .store
            .load_job(&assessment.job_id)
            .await
            .context("Failed to load job")?
        {
            Some(job) => job,
            None => {
                warn!(job_id = %assessment.job_id, "Job record missing, using default cutoff");
                Job::new(assessment.job_id.clone())
            }
        };

        let result = self
            .aggregator
            .evaluate_assessment(&assessment, &job, &request.answers)
            .await?;

        let assessment = with_elapsed_time(assessment, Utc::now());
        self.store
            .store_result(&assessment, &result)
            .await
            .context("Failed to persist result")?;
        info!(assessment_id = %assessment.id, "Result persisted");

        if let Err(e) = self.refresh_leaderboard(&job.id).await {
            error!(job_id = %job.id, error = ?e, "Leaderboard refresh failed");
        }
        Ok(result)
    }

    async fn refresh_leaderboard(&self, job_id: &str) -> Result<()> {
        let lock = self
            .store
            .lock_ranking(job_id)
            .await
            .context("Failed to acquire ranking lock")?;

        let refreshed = self.ranking.refresh(job_id).await;

        match self.store.unlock_ranking(lock).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job_id, "Ranking lock expired before release"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to release ranking lock"),
        }

        let entries = refreshed?;
        info!(job_id = %job_id, entries = entries.len(), "Leaderboard updated");
        Ok(())
    }
}

/// Fill in `time_taken_secs` from the start time when the transport did not record it
fn with_elapsed_time(mut assessment: Assessment, now: DateTime<Utc>) -> Assessment {
    if assessment.time_taken_secs.is_none() {
        if let Some(started) = assessment.started_at {
            let finished = assessment.completed_at.unwrap_or(now);
            let secs = (finished - started).num_seconds();
            if secs > 0 {
                assessment.time_taken_secs = Some(secs as u64);
            }
        }
    }
    assessment
}
