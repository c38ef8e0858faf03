//! # v2t-runtime
//!
//! Orchestration of media workspaces and their generation branches.
//!
//! - **Lifecycle engine**: download → transcribe → ready, one task per workspace
//! - **Branch controller**: per-kind generation tasks with streaming, restart and cancel
//! - **Event channel**: per-target ordered topics with snapshot-then-tail subscription
//! - **Store**: [`ResourceStore`] trait plus the in-memory [`MemoryStore`]
//! - **Adapters**: the async traits external media/model services plug into
//! - **Engine**: the facade wiring all of the above
//!
//! ## Crate Position
//!
//! Top layer. Depends on: v2t-core, v2t-settings.

#![deny(unsafe_code)]

pub mod adapters;
pub mod branches;
pub mod channel;
mod context;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

// Re-export main public API
pub use adapters::{
    Adapters, ChunkStream, DownloadOutput, Downloader, Generator, Synthesizer, Transcriber,
};
pub use branches::BranchController;
pub use channel::{EventHub, Outbox, Subscription};
pub use engine::Engine;
pub use errors::{AdapterError, AdapterStage, EngineError};
pub use lifecycle::{LifecycleEngine, extract_source};
pub use store::{MemoryStore, ResourceStore};
