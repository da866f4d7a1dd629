//! OpenAI-compatible HTTP front end over an [`OrchestratorClient`].
//!
//! - [`openai_api`]: Request/response types and route handlers
//! - [`streaming`]: SSE chunks for streamed chat completions
//! - [`ws`]: WebSocket bridge for the raw request/output protocol
//!
//! [`OrchestratorClient`]: crate::orchestrator::client::OrchestratorClient

pub mod openai_api;
pub mod streaming;
pub mod ws;

pub use openai_api::{build_router, AppState};
