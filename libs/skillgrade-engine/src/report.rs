// Candidate performance report built from stored assessment results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillgrade_common::types::AssessmentResult;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const STRENGTH_THRESHOLD: f64 = 70.0;
const HIGHLIGHTED_SKILLS: usize = 3;
const SIGNIFICANT_GAP: f64 = 0.2;
const HIGH_PRIORITY_GAP: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPriority {
    Medium,
    High,
}

/// Shortfall against a job's required proficiency, all values in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillGap {
    pub required: f64,
    pub current: f64,
    pub gap: f64,
    pub priority: GapPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub assessment_id: String,
    pub job_id: String,
    pub score: f64,
    pub passed: bool,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub candidate_id: String,
    pub total_assessments: usize,
    pub average_score: f64,
    pub skill_performance: BTreeMap<String, f64>,
    /// Best skills first
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub assessment_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub skill_gaps: BTreeMap<String, SkillGap>,
}

/// Summarize a candidate's results.
///
/// `required_skills` (skill -> proficiency in [0, 1]) enables gap analysis; a skill the
/// candidate was never assessed on counts as proficiency 0.
pub fn build_report(
    candidate_id: &str,
    results: &[AssessmentResult],
    required_skills: Option<&BTreeMap<String, f64>>,
) -> CandidateReport {
    let mut per_skill: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for result in results {
        for (skill, score) in &result.skill_scores {
            per_skill.entry(skill.clone()).or_default().push(*score);
        }
    }

    let skill_performance: BTreeMap<String, f64> = per_skill
        .into_iter()
        .map(|(skill, scores)| {
            let avg = scores.iter().sum::<f64>() / scores.len() as f64;
            (skill, avg)
        })
        .collect();

    let mut ranked: Vec<(&String, f64)> = skill_performance.iter().map(|(k, v)| (k, *v)).collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let strengths = ranked
        .iter()
        .take(HIGHLIGHTED_SKILLS)
        .filter(|(_, avg)| *avg >= STRENGTH_THRESHOLD)
        .map(|(skill, _)| (*skill).clone())
        .collect();
    let weaknesses = ranked
        .iter()
        .skip(ranked.len().saturating_sub(HIGHLIGHTED_SKILLS))
        .filter(|(_, avg)| *avg < STRENGTH_THRESHOLD)
        .map(|(skill, _)| (*skill).clone())
        .collect();

    let average_score = if results.is_empty() {
        0.0
    } else {
        results.iter().map(|r| r.total_score).sum::<f64>() / results.len() as f64
    };

    let mut assessment_history: Vec<HistoryEntry> = results
        .iter()
        .map(|r| HistoryEntry {
            assessment_id: r.assessment_id.clone(),
            job_id: r.job_id.clone(),
            score: r.total_score,
            passed: r.is_passed,
            evaluated_at: r.evaluated_at,
        })
        .collect();
    assessment_history.sort_by_key(|h| h.evaluated_at);

    let skill_gaps = required_skills
        .map(|required| skill_gaps(&skill_performance, required))
        .unwrap_or_default();

    CandidateReport {
        candidate_id: candidate_id.to_string(),
        total_assessments: results.len(),
        average_score,
        skill_performance,
        strengths,
        weaknesses,
        assessment_history,
        skill_gaps,
    }
}

pub fn skill_gaps(
    skill_performance: &BTreeMap<String, f64>,
    required_skills: &BTreeMap<String, f64>,
) -> BTreeMap<String, SkillGap> {
    required_skills
        .iter()
        .filter_map(|(skill, required)| {
            let current = skill_performance.get(skill).map(|s| s / 100.0).unwrap_or(0.0);
            let gap = (required - current).max(0.0);
            if gap <= SIGNIFICANT_GAP {
                return None;
            }
            let priority = if gap > HIGH_PRIORITY_GAP {
                GapPriority::High
            } else {
                GapPriority::Medium
            };
            Some((
                skill.clone(),
                SkillGap {
                    required: *required,
                    current,
                    gap,
                    priority,
                },
            ))
        })
        .collect()
}
