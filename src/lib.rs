// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod clock;
pub mod config;
pub mod export;
pub mod hot_store;
pub mod metrics;
pub mod pipeline;
pub mod quota;
pub mod record;
pub mod scheduler;
pub mod shutdown;
pub mod sources;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::PipelineConfig;
pub use crate::export::TieredExporter;
pub use crate::hot_store::HotStore;
pub use crate::pipeline::Pipeline;
pub use crate::quota::{LedgerHandle, QuotaLedger};
pub use crate::record::{Record, SourceKind};
pub use crate::worker::{FetchBudget, FetchOutcome, Fetcher, SourceWorker};
