pub mod aggregator;
pub mod error;
pub mod evaluator;
pub mod harness;
pub mod languages;
pub mod ranking;
pub mod report;
pub mod runner;
pub mod sandbox;
pub mod similarity;


pub use aggregator::Aggregator;
pub use error::{EngineError, EvaluationError, SandboxError};
pub use evaluator::Evaluator;
pub use languages::LanguageRegistry;
pub use ranking::RankingUpdater;
pub use runner::{CodeRunner, RunOutcome, RunRequest};
pub use sandbox::DockerSandbox;
