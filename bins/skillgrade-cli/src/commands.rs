// CLI commands for operating the scoring engine
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skillgrade_common::config::ScoringConfig;
use skillgrade_common::redis::{self, RedisStore};
use skillgrade_common::store::MemoryStore;
use skillgrade_common::types::{Answer, Assessment, AssessmentStatus, EvaluationRequest, Job, Question};
use skillgrade_engine::report::build_report;
use skillgrade_engine::{Aggregator, DockerSandbox, LanguageRegistry};
use std::fs;
use std::path::Path;

/// Answers of one assessment, optionally with the assessment record itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionFile {
    #[serde(default)]
    pub assessment: Option<Assessment>,
    pub answers: Vec<Answer>,
}

/// Accepts either a bare array or `{ "questions": [...] }`
#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionsFile {
    List(Vec<Question>),
    Wrapped { questions: Vec<Question> },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
    let questions = match read_json::<QuestionsFile>(path)? {
        QuestionsFile::List(questions) => questions,
        QuestionsFile::Wrapped { questions } => questions,
    };
    if questions.is_empty() {
        bail!("No questions found in {}", path.display());
    }
    Ok(questions)
}

pub fn load_submission(path: &Path) -> Result<SubmissionFile> {
    read_json(path)
}

pub fn load_job(path: &Path) -> Result<Job> {
    read_json(path)
}

/// Assessment used when a submission file carries none
fn offline_assessment(job_id: &str, answers: &[Answer]) -> Assessment {
    Assessment {
        id: "offline".to_string(),
        job_id: job_id.to_string(),
        candidate_id: "offline".to_string(),
        question_set: answers.iter().map(|a| a.question_id.clone()).collect(),
        status: AssessmentStatus::Completed,
        started_at: None,
        completed_at: None,
        time_taken_secs: None,
    }
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connect() -> Result<RedisStore> {
    let url = redis_url();
    RedisStore::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))
}

/// Score a submission locally: questions from a file, code in local Docker, nothing persisted
pub async fn evaluate(
    questions_path: &Path,
    submission_path: &Path,
    job_path: Option<&Path>,
    languages_path: Option<&Path>,
) -> Result<()> {
    let config = ScoringConfig::from_env()?;
    let questions = load_questions(questions_path)?;
    let submission = load_submission(submission_path)?;

    let job = match job_path {
        Some(path) => load_job(path)?,
        None => Job::new("offline"),
    };
    let cutoff = job.cutoff_or(config.default_cutoff_score);
    let assessment = submission
        .assessment
        .clone()
        .unwrap_or_else(|| offline_assessment(&job.id, &submission.answers));

    let languages = match languages_path {
        Some(path) => LanguageRegistry::load(path)?,
        None => LanguageRegistry::load_default()?,
    };
    let sandbox = DockerSandbox::connect(languages).context("Failed to connect to Docker")?;

    eprintln!(
        "🔎 Evaluating {} answers against {} questions...",
        submission.answers.len(),
        questions.len()
    );

    let aggregator = Aggregator::new(MemoryStore::with_questions(questions), sandbox, config);
    let result = aggregator
        .evaluate_assessment(&assessment, &job, &submission.answers)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    eprintln!(
        "{} total score {:.1} (cutoff {:.1})",
        if result.is_passed { "✅ PASSED:" } else { "❌ FAILED:" },
        result.total_score,
        cutoff
    );
    Ok(())
}

/// Store questions, a job and assessments in Redis
pub async fn seed(
    questions_path: Option<&Path>,
    job_path: Option<&Path>,
    assessments_path: Option<&Path>,
) -> Result<()> {
    if questions_path.is_none() && job_path.is_none() && assessments_path.is_none() {
        bail!("Nothing to seed: pass --questions, --job or --assessments");
    }
    let store = connect().await?;

    if let Some(path) = questions_path {
        let questions = load_questions(path)?;
        for question in &questions {
            store.put_question(question).await?;
        }
        println!("✓ Seeded {} questions", questions.len());
    }

    if let Some(path) = job_path {
        let job = load_job(path)?;
        store.put_job(&job).await?;
        match job.cutoff_score {
            Some(cutoff) => println!("✓ Seeded job {} (cutoff {})", job.id, cutoff),
            None => println!("✓ Seeded job {} (default cutoff)", job.id),
        }
    }

    if let Some(path) = assessments_path {
        let assessments: Vec<Assessment> = read_json(path)?;
        for assessment in &assessments {
            store.put_assessment(assessment).await?;
        }
        println!("✓ Seeded {} assessments", assessments.len());
    }

    Ok(())
}

/// Queue a submission for the worker
pub async fn enqueue(submission_path: &Path, assessment_id: Option<&str>) -> Result<()> {
    let submission = load_submission(submission_path)?;
    let store = connect().await?;

    let assessment_id = match (&submission.assessment, assessment_id) {
        (_, Some(id)) => id.to_string(),
        (Some(assessment), None) => assessment.id.clone(),
        (None, None) => bail!("Submission has no assessment; pass --assessment-id"),
    };
    if let Some(assessment) = &submission.assessment {
        store.put_assessment(assessment).await?;
    }

    let request = EvaluationRequest::new(assessment_id, submission.answers);
    let mut conn = store.connection();
    redis::push_request(&mut conn, &request).await?;

    println!(
        "✓ Enqueued request {} for assessment {} ({} answers)",
        request.id,
        request.assessment_id,
        request.answers.len()
    );
    Ok(())
}

pub async fn leaderboard(job_id: &str) -> Result<()> {
    let store = connect().await?;
    let entries = store.leaderboard(job_id).await?;

    if entries.is_empty() {
        println!("No leaderboard entries for job {}", job_id);
        return Ok(());
    }

    println!(
        "{:>4}  {:<24} {:<24} {:>7} {:>10} {:>9}",
        "RANK", "CANDIDATE", "ASSESSMENT", "SCORE", "PERCENTILE", "Q/MIN"
    );
    for entry in &entries {
        let efficiency = entry
            .time_efficiency
            .map(|e| format!("{:.1}", e))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "{:>4}  {:<24} {:<24} {:>7.1} {:>9.1}% {:>9}",
            entry.rank,
            entry.candidate_id,
            entry.assessment_id,
            entry.score,
            entry.percentile,
            efficiency
        );
    }
    Ok(())
}

pub async fn report(candidate_id: &str, job_id: Option<&str>) -> Result<()> {
    let store = connect().await?;
    let results = store.candidate_results(candidate_id).await?;
    if results.is_empty() {
        bail!("No results found for candidate {}", candidate_id);
    }

    let required = match job_id {
        Some(id) => {
            let job = store
                .get_job(id)
                .await?
                .with_context(|| format!("Job {} not found", id))?;
            Some(job.required_skills)
        }
        None => None,
    };

    let report = build_report(candidate_id, &results, required.as_ref());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub fn list_languages(languages_path: Option<&Path>) -> Result<()> {
    let languages = match languages_path {
        Some(path) => LanguageRegistry::load(path)?,
        None => LanguageRegistry::load_default()?,
    };

    for name in languages.list_languages() {
        if let Some(config) = languages.get(&name) {
            println!(
                "{:<8} {:<24} {:?} ({} MB, {} CPU)",
                name, config.image, config.comparison, config.memory_limit_mb, config.cpu_limit
            );
        }
    }
    Ok(())
}
