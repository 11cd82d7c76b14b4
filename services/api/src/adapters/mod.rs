pub mod analysis_llm;
pub mod db;
pub mod history;
pub mod memory;
pub mod notifier;

pub use analysis_llm::{OpenAiAnalysisAdapter, UnconfiguredAnalysisAdapter};
pub use db::DbAdapter;
pub use history::CachedHistoryAdapter;
pub use memory::MemoryAdapter;
pub use notifier::TracingNotifier;
