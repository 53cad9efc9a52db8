mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skillgrade-cli")]
#[command(about = "Skillgrade CLI - Evaluate submissions, seed data and inspect rankings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a submission locally without Redis
    Evaluate {
        /// Questions JSON file
        #[arg(short, long)]
        questions: PathBuf,

        /// Submission JSON file (answers, optional assessment)
        #[arg(short, long)]
        submission: PathBuf,

        /// Job JSON file providing the cutoff score
        #[arg(short, long)]
        job: Option<PathBuf>,

        /// Language registry (defaults to SKILLGRADE_LANGUAGES or config/languages.json)
        #[arg(short, long)]
        languages: Option<PathBuf>,
    },

    /// Store questions, a job and assessments in Redis
    Seed {
        #[arg(short, long)]
        questions: Option<PathBuf>,

        #[arg(short, long)]
        job: Option<PathBuf>,

        /// JSON array of assessment records
        #[arg(short, long)]
        assessments: Option<PathBuf>,
    },

    /// Queue a submission for the worker
    Enqueue {
        #[arg(short, long)]
        submission: PathBuf,

        /// Overrides the assessment id carried by the submission
        #[arg(short, long)]
        assessment_id: Option<String>,
    },

    /// Print a job's leaderboard
    Leaderboard {
        #[arg(short, long)]
        job_id: String,
    },

    /// Print a candidate's performance report
    Report {
        #[arg(short, long)]
        candidate_id: String,

        /// Compare against this job's required skills
        #[arg(short, long)]
        job_id: Option<String>,
    },

    /// List configured languages
    Languages {
        #[arg(short, long)]
        languages: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Evaluate {
            questions,
            submission,
            job,
            languages,
        } => {
            commands::evaluate(&questions, &submission, job.as_deref(), languages.as_deref())
                .await?;
        }
        Commands::Seed {
            questions,
            job,
            assessments,
        } => {
            commands::seed(questions.as_deref(), job.as_deref(), assessments.as_deref()).await?;
        }
        Commands::Enqueue {
            submission,
            assessment_id,
        } => {
            commands::enqueue(&submission, assessment_id.as_deref()).await?;
        }
        Commands::Leaderboard { job_id } => {
            commands::leaderboard(&job_id).await?;
        }
        Commands::Report {
            candidate_id,
            job_id,
        } => {
            commands::report(&candidate_id, job_id.as_deref()).await?;
        }
        Commands::Languages { languages } => {
            commands::list_languages(languages.as_deref())?;
        }
    }

    Ok(())
}
