use crate::store::{
    is_completed, mark_completed, AssessmentStore, CohortStore, EvaluationQueue, QuestionStore,
    RankingLock, ResultSink, StoreError,
};
use crate::types::{
    Assessment, AssessmentResult, AssessmentStatus, CohortMember, EvaluationRequest, Job,
    LeaderboardEntry, Question,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Redis key semantics - the worker and the CLI must never drift

pub const KEY_PREFIX: &str = "skillgrade";
pub const EVALUATION_QUEUE: &str = "skillgrade:queue:evaluations";

pub fn question_key(question_id: &str) -> String {
    format!("{}:question:{}", KEY_PREFIX, question_id)
}

pub fn job_key(job_id: &str) -> String {
    format!("{}:job:{}", KEY_PREFIX, job_id)
}

pub fn assessment_key(assessment_id: &str) -> String {
    format!("{}:assessment:{}", KEY_PREFIX, assessment_id)
}

/// Reason an assessment could not be evaluated
pub fn failure_key(assessment_id: &str) -> String {
    format!("{}:assessment:{}:failure", KEY_PREFIX, assessment_id)
}

pub fn result_key(assessment_id: &str) -> String {
    format!("{}:result:{}", KEY_PREFIX, assessment_id)
}

/// Set of completed assessment ids for a job (the ranking cohort)
pub fn cohort_key(job_id: &str) -> String {
    format!("{}:job:{}:completed", KEY_PREFIX, job_id)
}

/// Hash of assessment id -> leaderboard entry
pub fn leaderboard_key(job_id: &str) -> String {
    format!("{}:leaderboard:{}", KEY_PREFIX, job_id)
}

/// Set of evaluated assessment ids for a candidate
pub fn candidate_results_key(candidate_id: &str) -> String {
    format!("{}:candidate:{}:results", KEY_PREFIX, candidate_id)
}

pub fn ranking_lock_key(job_id: &str) -> String {
    format!("{}:lock:ranking:{}", KEY_PREFIX, job_id)
}

/// Push an evaluation request onto the queue (RPUSH for FIFO semantics)
pub async fn push_request(
    conn: &mut ConnectionManager,
    request: &EvaluationRequest,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(request)?;
    let _: () = conn.rpush(EVALUATION_QUEUE, payload).await?;
    Ok(())
}

/// Pop an evaluation request. BLPOP with timeout so callers can observe shutdown.
pub async fn pop_request(
    conn: &mut ConnectionManager,
    timeout_seconds: f64,
) -> Result<Option<EvaluationRequest>, StoreError> {
    let popped: Option<(String, String)> = conn.blpop(EVALUATION_QUEUE, timeout_seconds).await?;

    match popped {
        Some((_key, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}

pub const RANKING_LOCK_TTL: Duration = Duration::from_secs(30);
pub const RANKING_LOCK_WAIT: Duration = Duration::from_secs(10);

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Held distributed lock. Must be released explicitly with [`release_lock`].
#[derive(Debug)]
pub struct LockToken {
    key: String,
    token: String,
}

/// Acquire `SET key token NX PX ttl`, retrying until `wait` elapses
pub async fn acquire_lock(
    conn: &mut ConnectionManager,
    key: &str,
    ttl: Duration,
    wait: Duration,
) -> Result<LockToken, StoreError> {
    let token = Uuid::new_v4().to_string();
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(conn)
            .await?;

        if acquired.is_some() {
            return Ok(LockToken {
                key: key.to_string(),
                token,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(StoreError::LockTimeout(key.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Release only if we still own the lock
pub async fn release_lock(conn: &mut ConnectionManager, lock: LockToken) -> RedisResult<bool> {
    let deleted: i32 = redis::Script::new(RELEASE_LOCK_SCRIPT)
        .key(&lock.key)
        .arg(&lock.token)
        .invoke_async(conn)
        .await?;
    Ok(deleted == 1)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    conn: &mut ConnectionManager,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let payload: Option<String> = conn.get(key).await?;
    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

async fn set_json<T: serde::Serialize>(
    conn: &mut ConnectionManager,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(value)?;
    let _: () = conn.set(key, payload).await?;
    Ok(())
}

/// Redis-backed implementation of every store boundary
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn put_question(&self, question: &Question) -> Result<(), StoreError> {
        set_json(&mut self.conn.clone(), &question_key(&question.id), question).await
    }

    pub async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        set_json(&mut self.conn.clone(), &job_key(&job.id), job).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        get_json(&mut self.conn.clone(), &job_key(job_id)).await
    }

    pub async fn put_assessment(&self, assessment: &Assessment) -> Result<(), StoreError> {
        set_json(&mut self.conn.clone(), &assessment_key(&assessment.id), assessment).await
    }

    pub async fn get_assessment(&self, assessment_id: &str) -> Result<Option<Assessment>, StoreError> {
        get_json(&mut self.conn.clone(), &assessment_key(assessment_id)).await
    }

    pub async fn get_result(&self, assessment_id: &str) -> Result<Option<AssessmentResult>, StoreError> {
        get_json(&mut self.conn.clone(), &result_key(assessment_id)).await
    }

    /// Leaderboard for a job ordered by rank
    pub async fn leaderboard(&self, job_id: &str) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(leaderboard_key(job_id)).await?;

        let mut entries = raw
            .values()
            .map(|payload| serde_json::from_str::<LeaderboardEntry>(payload))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.rank);
        Ok(entries)
    }

    /// Every stored result of a candidate, across jobs
    pub async fn candidate_results(
        &self,
        candidate_id: &str,
    ) -> Result<Vec<AssessmentResult>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(candidate_results_key(candidate_id)).await?;

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(result) = get_json::<AssessmentResult>(&mut conn, &result_key(&id)).await? {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.evaluated_at);
        Ok(results)
    }
}

#[async_trait]
impl QuestionStore for RedisStore {
    async fn get_question(&self, id: &str) -> Result<Option<Question>, StoreError> {
        get_json(&mut self.conn.clone(), &question_key(id)).await
    }
}

#[async_trait]
impl ResultSink for RedisStore {
    async fn store_result(
        &self,
        assessment: &Assessment,
        result: &AssessmentResult,
    ) -> Result<(), StoreError> {
        let completed = mark_completed(assessment, result);
        let result_payload = serde_json::to_string(result)?;
        let assessment_payload = serde_json::to_string(&completed)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(result_key(&result.assessment_id), result_payload)
            .ignore()
            .set(assessment_key(&completed.id), assessment_payload)
            .ignore()
            .sadd(cohort_key(&completed.job_id), &completed.id)
            .ignore()
            .sadd(candidate_results_key(&completed.candidate_id), &completed.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CohortStore for RedisStore {
    async fn completed_cohort(&self, job_id: &str) -> Result<Vec<CohortMember>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(cohort_key(job_id)).await?;

        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            let assessment: Option<Assessment> = get_json(&mut conn, &assessment_key(&id)).await?;
            let result: Option<AssessmentResult> = get_json(&mut conn, &result_key(&id)).await?;

            if let (Some(assessment), Some(result)) = (assessment, result) {
                if is_completed(assessment.status) {
                    members.push(CohortMember { assessment, result });
                }
            }
        }
        Ok(members)
    }

    async fn upsert_leaderboard(
        &self,
        job_id: &str,
        entries: &[LeaderboardEntry],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let key = leaderboard_key(job_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.hset(&key, &entry.assessment_id, serde_json::to_string(entry)?)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl AssessmentStore for RedisStore {
    async fn load_assessment(&self, id: &str) -> Result<Option<Assessment>, StoreError> {
        self.get_assessment(id).await
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.get_job(id).await
    }

    async fn mark_failed(&self, assessment_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let assessment: Option<Assessment> =
            get_json(&mut conn, &assessment_key(assessment_id)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(failure_key(assessment_id), reason)
            .ignore();
        if let Some(mut assessment) = assessment {
            if !is_completed(assessment.status) {
                assessment.status = AssessmentStatus::Failed;
                pipe.set(assessment_key(assessment_id), serde_json::to_string(&assessment)?)
                    .ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl EvaluationQueue for RedisStore {
    async fn push_request(&self, request: &EvaluationRequest) -> Result<(), StoreError> {
        push_request(&mut self.conn.clone(), request).await
    }

    async fn pop_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<EvaluationRequest>, StoreError> {
        pop_request(&mut self.conn.clone(), timeout.as_secs_f64()).await
    }
}

#[async_trait]
impl RankingLock for RedisStore {
    type Guard = LockToken;

    async fn lock_ranking(&self, job_id: &str) -> Result<LockToken, StoreError> {
        acquire_lock(
            &mut self.conn.clone(),
            &ranking_lock_key(job_id),
            RANKING_LOCK_TTL,
            RANKING_LOCK_WAIT,
        )
        .await
    }

    async fn unlock_ranking(&self, guard: LockToken) -> Result<bool, StoreError> {
        Ok(release_lock(&mut self.conn.clone(), guard).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(question_key("q1"), "skillgrade:question:q1");
        assert_eq!(job_key("j1"), "skillgrade:job:j1");
        assert_eq!(cohort_key("j1"), "skillgrade:job:j1:completed");
        assert_eq!(leaderboard_key("j1"), "skillgrade:leaderboard:j1");
        assert_eq!(ranking_lock_key("j1"), "skillgrade:lock:ranking:j1");
        assert_eq!(failure_key("a1"), "skillgrade:assessment:a1:failure");
    }

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4().to_string();
        let key1 = result_key(&id);
        let key2 = result_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("skillgrade:result:"));
    }

    #[test]
    fn test_candidate_key_format() {
        let key = candidate_results_key("cand-7");
        assert!(key.starts_with("skillgrade:candidate:"));
        assert!(key.ends_with(":results"));
    }
}
