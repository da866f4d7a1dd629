//! cortex-stem: local-first LLM inference orchestration.
//!
//! One orchestrator task owns one engine backend and serializes every request
//! against it: models are resolved through an asset authority, loaded on
//! demand, streamed token by token with reasoning split from the answer, and
//! hibernated when idle.
//!
//! Also exposes an OpenAI-compatible HTTP API and a WebSocket bridge over the
//! orchestrator.

pub mod asset;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod server;
