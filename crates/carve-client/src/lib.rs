pub mod cleaner;
pub mod fetcher;
pub mod llm;

pub use cleaner::PromptCleaner;
pub use fetcher::ReqwestFetcher;
pub use llm::{OpenAiProposer, OpenAiProposerFactory};
