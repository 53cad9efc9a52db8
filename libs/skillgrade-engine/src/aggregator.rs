/// Assessment Aggregator - per-submission orchestration
///
/// **Responsibility:**
/// Turn one assessment's answers into an [`AssessmentResult`].
///
/// **Flow:**
/// 1. Resolve every answer's question through the [`QuestionStore`]
///    (unknown id → answer skipped, store failure → [`EngineError`])
/// 2. Score answers through the [`Evaluator`], at most `max_parallel_answers` at a time,
///    results kept in submission order
/// 3. Reduce the scores into section, skill and total averages
/// 4. Run the similarity analyzer over the batch's subjective answers
/// 5. Compare total_score with the job's cutoff, or the configured default when the
///    job sets none
///
/// A failure scoring one answer is logged and that answer scores 0; the rest of the
/// batch is unaffected.
use crate::error::EngineError;
use crate::evaluator::Evaluator;
use crate::runner::CodeRunner;
use crate::similarity::SimilarityAnalyzer;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use skillgrade_common::config::ScoringConfig;
use skillgrade_common::store::QuestionStore;
use skillgrade_common::types::{
    Answer, Assessment, AssessmentResult, Job, Question, Score, ScoreDetail, Section,
};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

pub struct Aggregator<S, R> {
    questions: S,
    evaluator: Evaluator<R>,
    similarity: SimilarityAnalyzer,
}

impl<S: QuestionStore, R: CodeRunner> Aggregator<S, R> {
    pub fn new(questions: S, runner: R, config: ScoringConfig) -> Self {
        Self {
            questions,
            evaluator: Evaluator::new(runner, config),
            similarity: SimilarityAnalyzer::new(),
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        self.evaluator.config()
    }

    #[instrument(skip_all, fields(assessment_id = %assessment.id, answers = answers.len()))]
    pub async fn evaluate_assessment(
        &self,
        assessment: &Assessment,
        job: &Job,
        answers: &[Answer],
    ) -> Result<AssessmentResult, EngineError> {
        let resolved = self.resolve(answers).await?;

        let parallelism = self.config().max_parallel_answers.max(1);
        let pending: Vec<_> = resolved
            .iter()
            .map(|(question, answer)| self.score_answer(question, answer))
            .collect();
        let scores: Vec<Score> = stream::iter(pending)
            .buffered(parallelism)
            .collect()
            .await;

        let subjective_texts: Vec<&str> = resolved
            .iter()
            .filter(|(question, answer)| {
                question.section() == Section::Subjective && !answer.content.trim().is_empty()
            })
            .map(|(_, answer)| answer.content.as_str())
            .collect();
        let plagiarism_score = self.similarity.analyze(&subjective_texts);

        let result = summarize(assessment, job, scores, plagiarism_score, self.config());

        info!(
            assessment_id = %assessment.id,
            job_id = %job.id,
            total_score = result.total_score,
            questions_scored = result.questions_scored,
            is_passed = result.is_passed,
            anomaly_detected = result.anomaly_detected,
            "Assessment evaluated"
        );

        Ok(result)
    }

    async fn resolve<'a>(
        &self,
        answers: &'a [Answer],
    ) -> Result<Vec<(Question, &'a Answer)>, EngineError> {
        let mut resolved = Vec::with_capacity(answers.len());
        for answer in answers {
            let question = self
                .questions
                .get_question(&answer.question_id)
                .await
                .map_err(EngineError::QuestionStore)?;

            match question {
                Some(question) => resolved.push((question, answer)),
                None => debug!(question_id = %answer.question_id, "Unknown question; answer skipped"),
            }
        }
        Ok(resolved)
    }

    async fn score_answer(&self, question: &Question, answer: &Answer) -> Score {
        match self.evaluator.evaluate(question, &answer.content).await {
            Ok(score) => score,
            Err(e) => {
                warn!(
                    question_id = %question.id,
                    error = %e,
                    "Answer could not be evaluated; scored 0"
                );
                Score {
                    question_id: question.id.clone(),
                    value: 0.0,
                    section: question.section(),
                    skill: question.skill_category.clone(),
                    detail: ScoreDetail::Error {
                        message: e.to_string(),
                    },
                }
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Reduce ordered per-answer scores into a result record
pub fn summarize(
    assessment: &Assessment,
    job: &Job,
    scores: Vec<Score>,
    plagiarism_score: f64,
    config: &ScoringConfig,
) -> AssessmentResult {
    let mut by_section: BTreeMap<Section, Vec<f64>> =
        Section::ALL.iter().map(|s| (*s, Vec::new())).collect();
    let mut by_skill: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for score in &scores {
        by_section.entry(score.section).or_default().push(score.value);
        by_skill.entry(score.skill.clone()).or_default().push(score.value);
    }

    let section_scores = by_section.iter().map(|(s, v)| (*s, mean(v))).collect();
    let section_attempts = by_section.iter().map(|(s, v)| (*s, v.len())).collect();
    let skill_scores = by_skill.iter().map(|(k, v)| (k.clone(), mean(v))).collect();

    let values: Vec<f64> = scores.iter().map(|s| s.value).collect();
    let total_score = mean(&values);

    AssessmentResult {
        assessment_id: assessment.id.clone(),
        job_id: job.id.clone(),
        candidate_id: assessment.candidate_id.clone(),
        total_score,
        section_scores,
        section_attempts,
        skill_scores,
        plagiarism_score,
        anomaly_detected: plagiarism_score > config.plagiarism_threshold,
        is_passed: total_score >= job.cutoff_or(config.default_cutoff_score),
        questions_scored: scores.len(),
        scores,
        evaluated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{Scripted, ScriptedRunner};
    use async_trait::async_trait;
    use skillgrade_common::store::{MemoryStore, StoreError};
    use skillgrade_common::types::{Difficulty, QuestionKind, TestCase, TestStatus};

    fn question(id: &str, skill: &str, kind: QuestionKind) -> Question {
        Question {
            id: id.to_string(),
            skill_category: skill.to_string(),
            difficulty: Difficulty::Medium,
            prompt: format!("Prompt for {}", id),
            kind,
        }
    }

    fn mcq(id: &str, correct: &str) -> Question {
        question(
            id,
            "SQL",
            QuestionKind::MultipleChoice {
                options: vec!["A".into(), "B".into(), "C".into()],
                correct_answer: correct.to_string(),
            },
        )
    }

    fn coding(id: &str, tests: usize) -> Question {
        question(
            id,
            "Python",
            QuestionKind::Coding {
                code_template: String::new(),
                programming_language: "python".to_string(),
                test_cases: (0..tests)
                    .map(|i| TestCase {
                        input: i.to_string(),
                        expected_output: i.to_string(),
                        hidden: false,
                    })
                    .collect(),
            },
        )
    }

    fn subjective(id: &str, model: &str) -> Question {
        question(
            id,
            "Communication",
            QuestionKind::Subjective {
                model_answer: model.to_string(),
                rubric: Default::default(),
            },
        )
    }

    fn answer(question_id: &str, content: &str) -> Answer {
        Answer {
            question_id: question_id.to_string(),
            content: content.to_string(),
            submitted_at: None,
        }
    }

    fn assessment() -> Assessment {
        Assessment {
            id: "assess-1".to_string(),
            job_id: "job-1".to_string(),
            candidate_id: "cand-1".to_string(),
            question_set: Vec::new(),
            status: Default::default(),
            started_at: None,
            completed_at: None,
            time_taken_secs: None,
        }
    }

    fn aggregator(
        questions: Vec<Question>,
        runner: ScriptedRunner,
    ) -> Aggregator<MemoryStore, ScriptedRunner> {
        Aggregator::new(
            MemoryStore::with_questions(questions),
            runner,
            ScoringConfig::default(),
        )
    }

    const MODEL: &str = "An index is a sorted structure that makes lookups faster";
    const CODE: &str = "def solution(x):\n    return x\n";

    #[tokio::test]
    async fn test_mixed_assessment_below_cutoff() {
        let agg = aggregator(
            vec![
                mcq("q1", "A"),
                mcq("q2", "B"),
                coding("q3", 2),
                subjective("q4", MODEL),
            ],
            ScriptedRunner::new(vec![
                Scripted::Outcome(TestStatus::Passed),
                Scripted::Outcome(TestStatus::WrongAnswer),
            ]),
        );
        let answers = vec![
            answer("q1", "A"),
            answer("q2", "C"),
            answer("q3", CODE),
            answer("q4", MODEL),
        ];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &answers)
            .await
            .unwrap();

        let values: Vec<f64> = result.scores.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![100.0, 0.0, 50.0, 100.0]);
        assert_eq!(result.total_score, 62.5);
        assert!(!result.is_passed);
        assert_eq!(result.questions_scored, 4);

        assert_eq!(result.section_scores[&Section::MultipleChoice], 50.0);
        assert_eq!(result.section_scores[&Section::Coding], 50.0);
        assert_eq!(result.section_scores[&Section::Subjective], 100.0);
        assert_eq!(result.section_attempts[&Section::MultipleChoice], 2);

        assert_eq!(result.skill_scores["SQL"], 50.0);
        assert_eq!(result.skill_scores["Python"], 50.0);
        assert_eq!(result.skill_scores["Communication"], 100.0);

        // One subjective answer has no peer to be compared with
        assert_eq!(result.plagiarism_score, 0.0);
        assert!(!result.anomaly_detected);
    }

    #[tokio::test]
    async fn test_score_equal_to_cutoff_passes() {
        let agg = aggregator(
            vec![mcq("q1", "A"), mcq("q2", "A")],
            ScriptedRunner::always(TestStatus::Passed),
        );
        let answers = vec![answer("q1", "A"), answer("q2", "B")];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 50.0), &answers)
            .await
            .unwrap();

        assert_eq!(result.total_score, 50.0);
        assert!(result.is_passed);
    }

    #[tokio::test]
    async fn test_job_without_cutoff_uses_configured_default() {
        let agg = Aggregator::new(
            MemoryStore::with_questions(vec![mcq("q1", "A"), mcq("q2", "A")]),
            ScriptedRunner::always(TestStatus::Passed),
            ScoringConfig {
                default_cutoff_score: 50.0,
                ..ScoringConfig::default()
            },
        );
        let answers = vec![answer("q1", "A"), answer("q2", "B")];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::new("job-1"), &answers)
            .await
            .unwrap();
        assert_eq!(result.total_score, 50.0);
        assert!(result.is_passed);

        // An explicit cutoff still wins over the default
        let strict = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 60.0), &answers)
            .await
            .unwrap();
        assert!(!strict.is_passed);
    }

    #[test]
    fn test_plagiarism_at_threshold_is_not_anomalous() {
        let config = ScoringConfig::default();
        assert_eq!(config.plagiarism_threshold, 0.8);
        let job = Job::with_cutoff("job-1", 70.0);

        let at = summarize(&assessment(), &job, Vec::new(), 0.8, &config);
        assert!(!at.anomaly_detected);

        let above = summarize(&assessment(), &job, Vec::new(), 0.81, &config);
        assert!(above.anomaly_detected);
        assert_eq!(above.plagiarism_score, 0.81);
    }

    #[tokio::test]
    async fn test_unknown_question_is_skipped() {
        let agg = aggregator(vec![mcq("q1", "A")], ScriptedRunner::always(TestStatus::Passed));
        let answers = vec![answer("q1", "A"), answer("missing", "whatever")];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &answers)
            .await
            .unwrap();

        assert_eq!(result.questions_scored, 1);
        assert_eq!(result.total_score, 100.0);
    }

    #[tokio::test]
    async fn test_no_answers_scores_zero() {
        let agg = aggregator(vec![], ScriptedRunner::always(TestStatus::Passed));

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &[])
            .await
            .unwrap();

        assert_eq!(result.total_score, 0.0);
        assert!(!result.is_passed);
        assert_eq!(result.section_scores.len(), 3);
        assert!(result.section_scores.values().all(|v| *v == 0.0));
        assert_eq!(result.accuracy_rate(), None);
    }

    #[tokio::test]
    async fn test_unattempted_sections_reported_as_zero() {
        let agg = aggregator(vec![mcq("q1", "A")], ScriptedRunner::always(TestStatus::Passed));

        let result = agg
            .evaluate_assessment(
                &assessment(),
                &Job::with_cutoff("job-1", 70.0),
                &[answer("q1", "A")],
            )
            .await
            .unwrap();

        assert_eq!(result.section_scores[&Section::Coding], 0.0);
        assert_eq!(result.section_scores[&Section::Subjective], 0.0);
        assert_eq!(result.section_attempts[&Section::Coding], 0);
        assert_eq!(result.accuracy_rate(), Some(100.0));
    }

    #[tokio::test]
    async fn test_all_timeouts_score_zero_and_complete() {
        let agg = aggregator(
            vec![coding("q1", 3), mcq("q2", "A")],
            ScriptedRunner::always(TestStatus::TimedOut),
        );
        let answers = vec![answer("q1", CODE), answer("q2", "A")];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &answers)
            .await
            .unwrap();

        assert_eq!(result.scores[0].value, 0.0);
        assert_eq!(result.scores[1].value, 100.0);
        assert_eq!(result.total_score, 50.0);
    }

    #[tokio::test]
    async fn test_failed_answer_contained_as_zero() {
        let agg = aggregator(
            vec![coding("q1", 2), mcq("q2", "A")],
            ScriptedRunner::new(vec![Scripted::LaunchFailure, Scripted::LaunchFailure]),
        );
        let answers = vec![answer("q1", CODE), answer("q2", "A")];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &answers)
            .await
            .unwrap();

        assert_eq!(result.scores[0].value, 0.0);
        assert!(matches!(result.scores[0].detail, ScoreDetail::Error { .. }));
        assert_eq!(result.scores[1].value, 100.0);
        assert_eq!(result.questions_scored, 2);
    }

    #[tokio::test]
    async fn test_identical_subjective_answers_flag_anomaly() {
        let long_text: String = (0..200)
            .map(|i| format!("term{}", i % 50))
            .collect::<Vec<_>>()
            .join(" ");
        let agg = aggregator(
            vec![subjective("q1", MODEL), subjective("q2", MODEL)],
            ScriptedRunner::always(TestStatus::Passed),
        );
        let answers = vec![answer("q1", &long_text), answer("q2", &long_text)];

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &answers)
            .await
            .unwrap();

        assert!(result.plagiarism_score > 0.99);
        assert!(result.anomaly_detected);
        // Advisory only
        assert_eq!(result.total_score, 0.0);
    }

    #[tokio::test]
    async fn test_order_preserved_under_parallelism() {
        let questions: Vec<Question> = (0..10).map(|i| mcq(&format!("q{}", i), "A")).collect();
        let agg = aggregator(questions, ScriptedRunner::always(TestStatus::Passed));
        let answers: Vec<Answer> = (0..10)
            .map(|i| answer(&format!("q{}", i), if i % 2 == 0 { "A" } else { "B" }))
            .collect();

        let result = agg
            .evaluate_assessment(&assessment(), &Job::with_cutoff("job-1", 70.0), &answers)
            .await
            .unwrap();

        let ids: Vec<&str> = result.scores.iter().map(|s| s.question_id.as_str()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("q{}", i)).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(result.scores[1].value, 0.0);
    }

    struct UnreachableStore;

    #[async_trait]
    impl QuestionStore for UnreachableStore {
        async fn get_question(&self, id: &str) -> Result<Option<Question>, StoreError> {
            Err(StoreError::NotFound(format!("question store offline ({})", id)))
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let agg = Aggregator::new(
            UnreachableStore,
            ScriptedRunner::always(TestStatus::Passed),
            ScoringConfig::default(),
        );

        let err = agg
            .evaluate_assessment(
                &assessment(),
                &Job::with_cutoff("job-1", 70.0),
                &[answer("q1", "A")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::QuestionStore(_)));
    }
}
