// Job leaderboard: full recompute over the completed cohort on every completion.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use skillgrade_common::store::CohortStore;
use skillgrade_common::types::{CohortMember, LeaderboardEntry};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Rank a job's cohort.
///
/// Order: total_score descending, then earliest completion first (an unknown
/// completion time sorts last), then assessment id so the order is total.
/// Ranks are 1..N without gaps; percentile = (N - rank) / N × 100.
pub fn compute_leaderboard(
    job_id: &str,
    cohort: &[CohortMember],
    now: DateTime<Utc>,
) -> Vec<LeaderboardEntry> {
    let mut ordered: Vec<&CohortMember> = cohort.iter().collect();
    ordered.sort_by(|a, b| {
        b.result
            .total_score
            .partial_cmp(&a.result.total_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                match (a.assessment.completed_at, b.assessment.completed_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            })
            .then_with(|| a.assessment.id.cmp(&b.assessment.id))
    });

    let n = ordered.len();
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, member)| {
            let rank = idx + 1;
            LeaderboardEntry {
                job_id: job_id.to_string(),
                assessment_id: member.assessment.id.clone(),
                candidate_id: member.assessment.candidate_id.clone(),
                rank: rank as u32,
                score: member.result.total_score,
                percentile: (n - rank) as f64 / n as f64 * 100.0,
                time_efficiency: time_efficiency(member),
                accuracy_rate: member.result.accuracy_rate(),
                updated_at: now,
            }
        })
        .collect()
}

/// Questions per minute, when both the question count and the time taken are known
fn time_efficiency(member: &CohortMember) -> Option<f64> {
    let questions = member.assessment.question_set.len();
    match member.assessment.time_taken_secs {
        Some(secs) if secs > 0 && questions > 0 => Some(questions as f64 / (secs as f64 / 60.0)),
        _ => None,
    }
}

/// Recomputes job leaderboards. Refreshes of the same job are serialized.
pub struct RankingUpdater<S> {
    store: S,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: CohortStore> RankingUpdater<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn job_lock(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the job's entry once no refresh holds or waits on it
    async fn release_job_lock(&self, job_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(job_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(job_id);
        }
    }

    #[cfg(test)]
    async fn tracked_jobs(&self) -> usize {
        self.locks.lock().await.len()
    }

    #[instrument(skip(self))]
    pub async fn refresh(&self, job_id: &str) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let lock = self.job_lock(job_id).await;
        let refreshed = {
            let _guard = lock.lock().await;
            self.recompute(job_id).await
        };
        drop(lock);
        self.release_job_lock(job_id).await;
        refreshed
    }

    async fn recompute(&self, job_id: &str) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let cohort = self
            .store
            .completed_cohort(job_id)
            .await
            .map_err(EngineError::CohortStore)?;
        debug!(job_id = %job_id, cohort = cohort.len(), "Recomputing leaderboard");

        let entries = compute_leaderboard(job_id, &cohort, Utc::now());
        self.store
            .upsert_leaderboard(job_id, &entries)
            .await
            .map_err(EngineError::CohortStore)?;

        info!(job_id = %job_id, entries = entries.len(), "Leaderboard refreshed");
        Ok(entries)
    }
}
