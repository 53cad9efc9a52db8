/// Per-Question Evaluators
///
/// **Core Responsibility:**
/// Turn one (question, submitted content) pair into a [`Score`] in [0, 100].
///
/// **Dispatch:**
/// [`Evaluator::evaluate`] is the single dispatch point over [`QuestionKind`].
/// Each variant has exactly one strategy:
///
/// - Multiple choice: 100 on an exact, case-sensitive match with the stored
///   correct answer, else 0. Empty submissions score 0. No partial credit.
/// - Coding: one sandbox run per test case, no retries.
///   score = 100 × passed / total. Timeouts, crashes and launch failures of a
///   single case count as a failed case. Zero test cases → configured neutral score.
/// - Subjective: lexical overlap of lowercase word sets,
///   |answer ∩ model| / |model| × 100. Empty submission → 0; no model answer →
///   configured neutral score.
///
/// Pure computation except for the coding strategy, which awaits the [`CodeRunner`].
use crate::error::{EvaluationError, SandboxError};
use crate::runner::{CodeRunner, RunOutcome, RunRequest};
use skillgrade_common::config::ScoringConfig;
use skillgrade_common::types::{
    Question, QuestionKind, Score, ScoreDetail, TestCase, TestCaseReport, TestStatus,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Evaluator<R> {
    runner: R,
    config: ScoringConfig,
}

impl<R: CodeRunner> Evaluator<R> {
    pub fn new(runner: R, config: ScoringConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score one answer against its question
    pub async fn evaluate(&self, question: &Question, content: &str) -> Result<Score, EvaluationError> {
        let (value, detail) = match &question.kind {
            QuestionKind::MultipleChoice { correct_answer, .. } => {
                evaluate_multiple_choice(correct_answer, content)
            }
            QuestionKind::Coding {
                programming_language,
                test_cases,
                ..
            } => {
                self.evaluate_coding(&question.id, programming_language, test_cases, content)
                    .await?
            }
            QuestionKind::Subjective { model_answer, .. } => {
                evaluate_subjective(model_answer, content, self.config.neutral_subjective_score)
            }
        };

        Ok(Score {
            question_id: question.id.clone(),
            value: value.clamp(0.0, 100.0),
            section: question.section(),
            skill: question.skill_category.clone(),
            detail,
        })
    }

    async fn evaluate_coding(
        &self,
        question_id: &str,
        language: &str,
        test_cases: &[TestCase],
        code: &str,
    ) -> Result<(f64, ScoreDetail), EvaluationError> {
        if test_cases.is_empty() {
            return Ok((
                self.config.neutral_coding_score,
                ScoreDetail::Neutral {
                    reason: "coding question has no test cases".to_string(),
                },
            ));
        }

        let total = test_cases.len();
        if code.trim().is_empty() {
            return Ok((
                0.0,
                ScoreDetail::Coding {
                    passed: 0,
                    total,
                    cases: Vec::new(),
                },
            ));
        }

        let timeout = Duration::from_millis(self.config.sandbox_timeout_ms);
        let mut cases = Vec::with_capacity(total);
        let mut passed = 0usize;
        let mut launch_failures = 0usize;
        let mut last_launch_error: Option<SandboxError> = None;

        for (index, test_case) in test_cases.iter().enumerate() {
            let request = RunRequest {
                code,
                input: &test_case.input,
                expected_output: &test_case.expected_output,
                language,
                timeout,
            };

            let outcome = match self.runner.run(request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        question_id = %question_id,
                        test_case = index,
                        error = %e,
                        "Test case could not be launched; counted as failed"
                    );
                    launch_failures += 1;
                    let outcome = RunOutcome {
                        error: Some(e.to_string()),
                        ..RunOutcome::with_status(TestStatus::LaunchFailed)
                    };
                    last_launch_error = Some(e);
                    outcome
                }
            };

            if outcome.passed() {
                passed += 1;
            }
            cases.push(report_for(index, test_case, outcome));
        }

        if launch_failures == total {
            if let Some(last) = last_launch_error {
                return Err(EvaluationError::NoTestCaseAttempted {
                    attempted: total,
                    last,
                });
            }
        }

        debug!(question_id = %question_id, passed, total, "Coding answer evaluated");

        Ok((
            100.0 * passed as f64 / total as f64,
            ScoreDetail::Coding { passed, total, cases },
        ))
    }
}

fn report_for(index: usize, test_case: &TestCase, outcome: RunOutcome) -> TestCaseReport {
    TestCaseReport {
        index,
        hidden: test_case.hidden,
        status: outcome.status,
        execution_time_ms: outcome.execution_time_ms,
        stdout: if test_case.hidden { None } else { Some(outcome.stdout) },
        error: if test_case.hidden { None } else { outcome.error },
    }
}

/// Exact match, no normalisation of either side
pub fn evaluate_multiple_choice(correct_answer: &str, submitted: &str) -> (f64, ScoreDetail) {
    let correct = !submitted.is_empty() && submitted == correct_answer;
    let value = if correct { 100.0 } else { 0.0 };
    (value, ScoreDetail::MultipleChoice { correct })
}

pub fn evaluate_subjective(model_answer: &str, submitted: &str, neutral: f64) -> (f64, ScoreDetail) {
    if submitted.trim().is_empty() {
        return (0.0, ScoreDetail::Subjective { overlap: 0.0 });
    }

    let model_words = word_set(model_answer);
    if model_words.is_empty() {
        return (
            neutral,
            ScoreDetail::Neutral {
                reason: "subjective question has no model answer".to_string(),
            },
        );
    }

    let answer_words = word_set(submitted);
    let common = answer_words.intersection(&model_words).count();
    let overlap = (common as f64 / model_words.len() as f64).clamp(0.0, 1.0);

    (overlap * 100.0, ScoreDetail::Subjective { overlap })
}

/// Lowercase whitespace-separated words, duplicates collapsed. Punctuation stays
/// part of the word, so `reads.` and `reads` differ and `c++`, `c#` and `c` stay apart.
pub fn word_set(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}
