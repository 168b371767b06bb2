//! # formlink-cloud: Cloud Polling Engine for Formlink
//!
//! Everything that talks to the Formlabs developer cloud or holds shared
//! mutable state lives here: OAuth2 tokens, the REST client, the per-printer
//! reconciliation store, the thumbnail cache and the polling agent.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Polling Agent Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  PollingAgent (Main Orchestrator)                │  │
//! │  │                                                                  │  │
//! │  │  Spawned as a Tokio task by the bridge binary                    │  │
//! │  │  One tick = one concurrent pass over every printer               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌──────────────────┐      │
//! │  │  CloudClient   │  │ReconciliationStore │  │ ThumbnailCache   │      │
//! │  │                │  │                    │  │                  │      │
//! │  │ Bearer auth    │  │ Per-printer lock   │  │ Last valid image │      │
//! │  │ 401 → refresh  │  │ Seq ordering       │  │ per job, LRU cap │      │
//! │  │ → retry once   │  │ LIVE / STALE       │  │ URL re-resolve   │      │
//! │  └───────┬────────┘  └────────────────────┘  └──────────────────┘      │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  ┌────────────────┐                                                     │
//! │  │  TokenManager  │  One refresh in flight, whoever asks                │
//! │  └────────────────┘                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `PollingAgent` orchestrator, handle and builder
//! - [`client`] - `CloudApi` trait and the reqwest-backed `CloudClient`
//! - [`config`] - TOML + environment configuration
//! - [`error`] - `CloudError` taxonomy (auth vs transient)
//! - [`store`] - `ReconciliationStore`
//! - [`thumbnail`] - `ThumbnailCache`
//! - [`token`] - `TokenManager` and `Credential`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use formlink_cloud::{BridgeConfig, CloudClient, PollingAgentBuilder, TokenManager};
//!
//! let config = BridgeConfig::load(None)?;
//! let http = reqwest::Client::new();
//! let tokens = Arc::new(TokenManager::from_config(http.clone(), &config)?);
//! let client = Arc::new(CloudClient::from_config(http, &config, tokens, config.normalizer())?);
//!
//! let handle = PollingAgentBuilder::from_config(client, &config).build().start().await?;
//! for entities in handle.store().all_entities().await {
//!     println!("{}: {}", entities.printer_id, entities.status.machine_status);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod store;
pub mod thumbnail;
pub mod token;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{
    AgentStatus, NoOpEmitter, PollEventEmitter, PollingAgent, PollingAgentBuilder,
    PollingAgentHandle, TickSummary,
};
pub use client::{CloudApi, CloudClient};
pub use config::BridgeConfig;
pub use error::{CloudError, CloudResult};
pub use store::{FetchedPayload, PollOutcome, PrinterDiagnostics, ReconciliationStore};
pub use thumbnail::{Thumbnail, ThumbnailCache};
pub use token::{AccessToken, Credential, TokenManager};
