pub mod config;
pub mod config_repository;
pub mod database;
pub mod evaluation_repository;
pub mod extraction_repository;
pub mod queue_repository;

pub use config::DatabaseConfig;
pub use config_repository::ConfigRepository;
pub use database::Database;
pub use evaluation_repository::EvaluationRepository;
pub use extraction_repository::ExtractionRepository;
pub use queue_repository::QueueRepository;
