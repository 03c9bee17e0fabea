//! Orcheo runtime core: graph compilation and execution, run history,
//! credential vault, webhook admission, chat storage, and tracing,
//! composed behind the orchestrator façade.

pub mod chat;
pub mod engine;
pub mod graph;
pub mod logging;
pub mod orchestrator;
pub mod trace;
pub mod vault;
pub mod webhook;

pub use orchestrator::{Orcheo, OrcheoConfig};

/// Current crate version string exposed for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
