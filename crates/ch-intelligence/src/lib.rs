pub mod analytical;
pub mod batch;
pub mod capability;
pub mod critique;
pub mod fanout;
pub mod fts_index;
pub mod knowledge;
pub mod mock;
pub mod pool;
pub mod providers;
pub mod query_cache;
pub mod tournament;

// Re-export the generation contract and the pool.
pub use capability::{
    Backend, GenerationCapability, GenerationError, GenerationParams, GenerationResult,
    UsageTotals,
};
pub use mock::{MockBackend, MockReply};
pub use pool::{AgentResponse, AgentStats, BackendPool, ParallelResult, PoolError, PoolStats, Targets};
pub use providers::{
    build_backend, credentials_available, AnthropicBackend, LocalBackend, OpenAiBackend,
};

// Re-export orchestration types.
pub use batch::{
    BatchError, BatchInput, BatchItem, BatchItemError, BatchOrchestrator, BatchSummary,
    ExecutionMode, ItemOutcome, ItemProcessor,
};
pub use critique::{CritiqueError, CritiqueReport, CritiqueService, Variant};
pub use fanout::FanOutProcessor;
pub use tournament::{TournamentError, TournamentProcessor, TournamentRunner};

// Re-export knowledge routing types.
pub use analytical::HttpAnalyticalSource;
pub use fts_index::SqliteFtsIndex;
pub use knowledge::{
    classify, AnalyticalSource, FullTextIndex, KnowledgeError, KnowledgeRouter,
    KnowledgeSourceKind, QueryResult, QueryType,
};
pub use query_cache::{CacheStats, QueryCache};
