use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Score aggregation category. One per question type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    MultipleChoice,
    Coding,
    Subjective,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::MultipleChoice, Section::Coding, Section::Subjective];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::MultipleChoice => "multiple_choice",
            Section::Coding => "coding",
            Section::Subjective => "subjective",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    #[serde(default, alias = "output")]
    pub expected_output: String,
    #[serde(default, alias = "is_hidden")]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricCriterion {
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub description: String,
}

/// Type-specific question payload.
///
/// Missing payload fields deserialize to empty values so a malformed question
/// reaches the evaluators and gets a neutral default instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    #[serde(alias = "mcq")]
    MultipleChoice {
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        correct_answer: String,
    },
    Coding {
        #[serde(default)]
        code_template: String,
        #[serde(default = "default_language")]
        programming_language: String,
        #[serde(default)]
        test_cases: Vec<TestCase>,
    },
    Subjective {
        #[serde(default)]
        model_answer: String,
        #[serde(default)]
        rubric: BTreeMap<String, RubricCriterion>,
    },
}

fn default_language() -> String {
    "python".to_string()
}

/// A generated question, read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(default)]
    pub skill_category: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default, alias = "question_text")]
    pub prompt: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl Question {
    pub fn section(&self) -> Section {
        match self.kind {
            QuestionKind::MultipleChoice { .. } => Section::MultipleChoice,
            QuestionKind::Coding { .. } => Section::Coding,
            QuestionKind::Subjective { .. } => Section::Subjective,
        }
    }
}

/// One submitted answer: selected option, source code or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    #[serde(default, alias = "answer", alias = "code")]
    pub content: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Per-test-case status reported by the code runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    WrongAnswer,
    TimedOut,
    RuntimeError,
    OutputLimitExceeded,
    LaunchFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseReport {
    pub index: usize,
    pub hidden: bool,
    pub status: TestStatus,
    pub execution_time_ms: u64,
    /// Redacted for hidden test cases.
    pub stdout: Option<String>,
    pub error: Option<String>,
}

/// How a score was reached, kept for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreDetail {
    MultipleChoice { correct: bool },
    Coding { passed: usize, total: usize, cases: Vec<TestCaseReport> },
    Subjective { overlap: f64 },
    Neutral { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub question_id: String,
    /// Always within [0, 100].
    pub value: f64,
    pub section: Section,
    pub skill: String,
    pub detail: ScoreDetail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Evaluated,
    /// Evaluation was given up after repeated systemic failures
    Failed,
}

/// One candidate's attempt at a job's question set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: String,
    pub job_id: String,
    pub candidate_id: String,
    #[serde(default)]
    pub question_set: Vec<String>,
    #[serde(default)]
    pub status: AssessmentStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_taken_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// `None` falls back to the configured default cutoff.
    #[serde(default, alias = "cutoff", skip_serializing_if = "Option::is_none")]
    pub cutoff_score: Option<f64>,
    /// Parsed skill map: skill -> required proficiency in [0, 1].
    #[serde(default)]
    pub required_skills: BTreeMap<String, f64>,
}

impl Job {
    /// Job known only by id, judged against the default cutoff
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            cutoff_score: None,
            required_skills: BTreeMap::new(),
        }
    }

    pub fn with_cutoff(id: impl Into<String>, cutoff_score: f64) -> Self {
        Self {
            cutoff_score: Some(cutoff_score),
            ..Self::new(id)
        }
    }

    pub fn cutoff_or(&self, default_cutoff: f64) -> f64 {
        self.cutoff_score.unwrap_or(default_cutoff)
    }
}

/// Score record for one completed assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub assessment_id: String,
    pub job_id: String,
    pub candidate_id: String,
    pub total_score: f64,
    /// Always holds all three sections; unattempted sections are 0.
    pub section_scores: BTreeMap<Section, f64>,
    pub section_attempts: BTreeMap<Section, usize>,
    pub skill_scores: BTreeMap<String, f64>,
    pub plagiarism_score: f64,
    pub anomaly_detected: bool,
    pub is_passed: bool,
    pub questions_scored: usize,
    pub scores: Vec<Score>,
    pub evaluated_at: DateTime<Utc>,
}

impl AssessmentResult {
    /// Mean of the section scores of sections with at least one scored answer.
    pub fn accuracy_rate(&self) -> Option<f64> {
        let attempted: Vec<f64> = Section::ALL
            .iter()
            .filter(|s| self.section_attempts.get(s).copied().unwrap_or(0) > 0)
            .map(|s| self.section_scores.get(s).copied().unwrap_or(0.0))
            .collect();

        if attempted.is_empty() {
            None
        } else {
            Some(attempted.iter().sum::<f64>() / attempted.len() as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub job_id: String,
    pub assessment_id: String,
    pub candidate_id: String,
    pub rank: u32,
    pub score: f64,
    pub percentile: f64,
    /// Questions per minute.
    pub time_efficiency: Option<f64>,
    pub accuracy_rate: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// A completed assessment together with its result, the ranking population unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMember {
    pub assessment: Assessment,
    pub result: AssessmentResult,
}

/// Queue payload handed over by the submission transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub id: Uuid,
    pub assessment_id: String,
    pub answers: Vec<Answer>,
    pub enqueued_at: DateTime<Utc>,
    /// Failed processing attempts so far
    #[serde(default)]
    pub attempts: u32,
}

impl EvaluationRequest {
    pub fn new(assessment_id: impl Into<String>, answers: Vec<Answer>) -> Self {
        Self {
            id: Uuid::new_v4(),
            assessment_id: assessment_id.into(),
            answers,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}
