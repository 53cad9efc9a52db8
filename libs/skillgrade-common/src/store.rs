//! Boundaries with the collaborators the engine does not own: the question store,
//! the result sink and the cohort (completed assessments + leaderboard) store,
//! plus the assessment records, request queue and ranking lock the worker uses.

use crate::types::{
    Assessment, AssessmentResult, AssessmentStatus, CohortMember, EvaluationRequest, Job,
    LeaderboardEntry, Question,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),
}

#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// `Ok(None)` means the id is unknown; `Err` means the store could not be read.
    async fn get_question(&self, id: &str) -> Result<Option<Question>, StoreError>;
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist a result and mark its assessment completed for ranking.
    async fn store_result(
        &self,
        assessment: &Assessment,
        result: &AssessmentResult,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CohortStore: Send + Sync {
    /// All completed assessments of a job together with their results
    async fn completed_cohort(&self, job_id: &str) -> Result<Vec<CohortMember>, StoreError>;

    /// Create or update one entry per assessment id
    async fn upsert_leaderboard(
        &self,
        job_id: &str,
        entries: &[LeaderboardEntry],
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AssessmentStore: Send + Sync {
    async fn load_assessment(&self, id: &str) -> Result<Option<Assessment>, StoreError>;

    async fn load_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Record that an assessment could not be evaluated. An already evaluated
    /// assessment keeps its status.
    async fn mark_failed(&self, assessment_id: &str, reason: &str) -> Result<(), StoreError>;
}

/// FIFO of evaluation requests between the submission transport and the worker
#[async_trait]
pub trait EvaluationQueue: Send + Sync {
    async fn push_request(&self, request: &EvaluationRequest) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing arrived within `timeout`
    async fn pop_request(&self, timeout: Duration)
        -> Result<Option<EvaluationRequest>, StoreError>;
}

/// Exclusion for leaderboard refreshes of one job across worker processes
#[async_trait]
pub trait RankingLock: Send + Sync {
    type Guard: Send;

    async fn lock_ranking(&self, job_id: &str) -> Result<Self::Guard, StoreError>;

    /// `Ok(false)` when the lock had already expired
    async fn unlock_ranking(&self, guard: Self::Guard) -> Result<bool, StoreError>;
}

#[async_trait]
impl<T: QuestionStore + ?Sized> QuestionStore for std::sync::Arc<T> {
    async fn get_question(&self, id: &str) -> Result<Option<Question>, StoreError> {
        (**self).get_question(id).await
    }
}

#[async_trait]
impl<T: ResultSink + ?Sized> ResultSink for std::sync::Arc<T> {
    async fn store_result(
        &self,
        assessment: &Assessment,
        result: &AssessmentResult,
    ) -> Result<(), StoreError> {
        (**self).store_result(assessment, result).await
    }
}

#[async_trait]
impl<T: CohortStore + ?Sized> CohortStore for std::sync::Arc<T> {
    async fn completed_cohort(&self, job_id: &str) -> Result<Vec<CohortMember>, StoreError> {
        (**self).completed_cohort(job_id).await
    }

    async fn upsert_leaderboard(
        &self,
        job_id: &str,
        entries: &[LeaderboardEntry],
    ) -> Result<(), StoreError> {
        (**self).upsert_leaderboard(job_id, entries).await
    }
}

#[async_trait]
impl<T: AssessmentStore + ?Sized> AssessmentStore for std::sync::Arc<T> {
    async fn load_assessment(&self, id: &str) -> Result<Option<Assessment>, StoreError> {
        (**self).load_assessment(id).await
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        (**self).load_job(id).await
    }

    async fn mark_failed(&self, assessment_id: &str, reason: &str) -> Result<(), StoreError> {
        (**self).mark_failed(assessment_id, reason).await
    }
}

#[async_trait]
impl<T: EvaluationQueue + ?Sized> EvaluationQueue for std::sync::Arc<T> {
    async fn push_request(&self, request: &EvaluationRequest) -> Result<(), StoreError> {
        (**self).push_request(request).await
    }

    async fn pop_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<EvaluationRequest>, StoreError> {
        (**self).pop_request(timeout).await
    }
}

#[async_trait]
impl<T: RankingLock + ?Sized> RankingLock for std::sync::Arc<T> {
    type Guard = T::Guard;

    async fn lock_ranking(&self, job_id: &str) -> Result<Self::Guard, StoreError> {
        (**self).lock_ranking(job_id).await
    }

    async fn unlock_ranking(&self, guard: Self::Guard) -> Result<bool, StoreError> {
        (**self).unlock_ranking(guard).await
    }
}

#[derive(Default)]
struct MemoryState {
    questions: HashMap<String, Question>,
    jobs: HashMap<String, Job>,
    assessments: HashMap<String, Assessment>,
    results: HashMap<String, AssessmentResult>,
    leaderboards: HashMap<String, BTreeMap<String, LeaderboardEntry>>,
    failures: HashMap<String, String>,
    queue: VecDeque<EvaluationRequest>,
}

/// In-process store used by offline evaluation and tests
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    queue_ready: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_questions(questions: impl IntoIterator<Item = Question>) -> Self {
        let state = MemoryState {
            questions: questions.into_iter().map(|q| (q.id.clone(), q)).collect(),
            ..Default::default()
        };
        Self {
            state: RwLock::new(state),
            queue_ready: Notify::new(),
        }
    }

    pub async fn put_question(&self, question: Question) {
        self.state
            .write()
            .await
            .questions
            .insert(question.id.clone(), question);
    }

    pub async fn put_job(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id.clone(), job);
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(id).cloned()
    }

    pub async fn put_assessment(&self, assessment: Assessment) {
        self.state
            .write()
            .await
            .assessments
            .insert(assessment.id.clone(), assessment);
    }

    pub async fn get_assessment(&self, id: &str) -> Option<Assessment> {
        self.state.read().await.assessments.get(id).cloned()
    }

    pub async fn get_result(&self, assessment_id: &str) -> Option<AssessmentResult> {
        self.state.read().await.results.get(assessment_id).cloned()
    }

    /// Reason recorded by [`AssessmentStore::mark_failed`]
    pub async fn failure(&self, assessment_id: &str) -> Option<String> {
        self.state.read().await.failures.get(assessment_id).cloned()
    }

    pub async fn queue_len(&self) -> usize {
        self.state.read().await.queue.len()
    }

    /// Leaderboard for a job ordered by rank
    pub async fn leaderboard(&self, job_id: &str) -> Vec<LeaderboardEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<LeaderboardEntry> = state
            .leaderboards
            .get(job_id)
            .map(|board| board.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.rank);
        entries
    }
}

#[async_trait]
impl QuestionStore for MemoryStore {
    async fn get_question(&self, id: &str) -> Result<Option<Question>, StoreError> {
        Ok(self.state.read().await.questions.get(id).cloned())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn store_result(
        &self,
        assessment: &Assessment,
        result: &AssessmentResult,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .assessments
            .insert(assessment.id.clone(), mark_completed(assessment, result));
        state
            .results
            .insert(result.assessment_id.clone(), result.clone());
        Ok(())
    }
}

#[async_trait]
impl CohortStore for MemoryStore {
    async fn completed_cohort(&self, job_id: &str) -> Result<Vec<CohortMember>, StoreError> {
        let state = self.state.read().await;
        let members = state
            .assessments
            .values()
            .filter(|a| a.job_id == job_id && is_completed(a.status))
            .filter_map(|a| {
                state.results.get(&a.id).map(|r| CohortMember {
                    assessment: a.clone(),
                    result: r.clone(),
                })
            })
            .collect();
        Ok(members)
    }

    async fn upsert_leaderboard(
        &self,
        job_id: &str,
        entries: &[LeaderboardEntry],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let board = state.leaderboards.entry(job_id.to_string()).or_default();
        for entry in entries {
            board.insert(entry.assessment_id.clone(), entry.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl AssessmentStore for MemoryStore {
    async fn load_assessment(&self, id: &str) -> Result<Option<Assessment>, StoreError> {
        Ok(self.get_assessment(id).await)
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.get_job(id).await)
    }

    async fn mark_failed(&self, assessment_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(assessment) = state.assessments.get_mut(assessment_id) {
            if !is_completed(assessment.status) {
                assessment.status = AssessmentStatus::Failed;
            }
        }
        state
            .failures
            .insert(assessment_id.to_string(), reason.to_string());
        Ok(())
    }
}

#[async_trait]
impl EvaluationQueue for MemoryStore {
    async fn push_request(&self, request: &EvaluationRequest) -> Result<(), StoreError> {
        self.state.write().await.queue.push_back(request.clone());
        self.queue_ready.notify_one();
        Ok(())
    }

    async fn pop_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<EvaluationRequest>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let popped = self.state.write().await.queue.pop_front();
            if popped.is_some() {
                return Ok(popped);
            }
            if tokio::time::timeout_at(deadline, self.queue_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

/// Refreshes in one process are already serialized by the ranking updater
#[async_trait]
impl RankingLock for MemoryStore {
    type Guard = ();

    async fn lock_ranking(&self, _job_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn unlock_ranking(&self, _guard: ()) -> Result<bool, StoreError> {
        Ok(true)
    }
}

pub(crate) fn is_completed(status: AssessmentStatus) -> bool {
    matches!(
        status,
        AssessmentStatus::Completed | AssessmentStatus::Evaluated
    )
}

/// Assessment as stored after its result is written
pub fn mark_completed(assessment: &Assessment, result: &AssessmentResult) -> Assessment {
    let mut completed = assessment.clone();
    completed.status = AssessmentStatus::Evaluated;
    if completed.completed_at.is_none() {
        completed.completed_at = Some(result.evaluated_at);
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuestionKind, Section};
    use chrono::Utc;

    fn question(id: &str) -> Question {
        Question {
            id: id.to_string(),
            skill_category: "SQL".to_string(),
            difficulty: Default::default(),
            prompt: String::new(),
            kind: QuestionKind::MultipleChoice {
                options: vec!["a".into(), "b".into()],
                correct_answer: "a".into(),
            },
        }
    }

    fn assessment(id: &str, job: &str) -> Assessment {
        Assessment {
            id: id.to_string(),
            job_id: job.to_string(),
            candidate_id: format!("cand-{}", id),
            question_set: vec![],
            status: AssessmentStatus::InProgress,
            started_at: None,
            completed_at: None,
            time_taken_secs: None,
        }
    }

    fn result_for(a: &Assessment, total: f64) -> AssessmentResult {
        AssessmentResult {
            assessment_id: a.id.clone(),
            job_id: a.job_id.clone(),
            candidate_id: a.candidate_id.clone(),
            total_score: total,
            section_scores: Section::ALL.iter().map(|s| (*s, 0.0)).collect(),
            section_attempts: BTreeMap::new(),
            skill_scores: BTreeMap::new(),
            plagiarism_score: 0.0,
            anomaly_detected: false,
            is_passed: false,
            questions_scored: 0,
            scores: vec![],
            evaluated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_question_lookup() {
        let store = MemoryStore::with_questions(vec![question("q1")]);
        assert!(store.get_question("q1").await.unwrap().is_some());
        assert!(store.get_question("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_result_joins_cohort() {
        let store = MemoryStore::new();
        let pending = assessment("a1", "job");
        store.put_assessment(pending.clone()).await;
        store.put_assessment(assessment("a2", "job")).await;

        assert!(store.completed_cohort("job").await.unwrap().is_empty());

        store
            .store_result(&pending, &result_for(&pending, 80.0))
            .await
            .unwrap();

        let cohort = store.completed_cohort("job").await.unwrap();
        assert_eq!(cohort.len(), 1);
        assert_eq!(cohort[0].assessment.status, AssessmentStatus::Evaluated);
        assert!(cohort[0].assessment.completed_at.is_some());
        assert!(store.completed_cohort("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed() {
        let store = MemoryStore::new();
        let pending = assessment("a1", "job");
        let done = assessment("a2", "job");
        store.put_assessment(pending.clone()).await;
        store.store_result(&done, &result_for(&done, 80.0)).await.unwrap();

        store.mark_failed("a1", "question store offline").await.unwrap();
        store.mark_failed("a2", "leaderboard refresh failed").await.unwrap();
        store.mark_failed("missing", "assessment not found").await.unwrap();

        let failed = store.get_assessment("a1").await.unwrap();
        assert_eq!(failed.status, AssessmentStatus::Failed);
        assert_eq!(store.failure("a1").await.as_deref(), Some("question store offline"));
        assert_eq!(
            store.get_assessment("a2").await.unwrap().status,
            AssessmentStatus::Evaluated
        );
        assert!(store.failure("missing").await.is_some());
        // A failed assessment never enters the ranking cohort
        assert_eq!(store.completed_cohort("job").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let store = MemoryStore::new();
        let first = EvaluationRequest::new("a1", vec![]);
        let second = EvaluationRequest::new("a2", vec![]);
        store.push_request(&first).await.unwrap();
        store.push_request(&second).await.unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(store.pop_request(timeout).await.unwrap().unwrap().id, first.id);
        assert_eq!(store.pop_request(timeout).await.unwrap().unwrap().id, second.id);
        assert!(store.pop_request(timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.pop_request(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let request = EvaluationRequest::new("a1", vec![]);
        store.push_request(&request).await.unwrap();

        let popped = popper.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.id, request.id);
        assert_eq!(store.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_upsert_leaderboard_replaces_by_assessment() {
        let store = MemoryStore::new();
        let entry = |rank: u32| LeaderboardEntry {
            job_id: "job".into(),
            assessment_id: "a1".into(),
            candidate_id: "c1".into(),
            rank,
            score: 50.0,
            percentile: 0.0,
            time_efficiency: None,
            accuracy_rate: None,
            updated_at: Utc::now(),
        };

        store.upsert_leaderboard("job", &[entry(1)]).await.unwrap();
        store.upsert_leaderboard("job", &[entry(2)]).await.unwrap();

        let board = store.leaderboard("job").await;
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].rank, 2);
    }
}
