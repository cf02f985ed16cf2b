//! Hosted conversational agent
//!
//! This crate wires an Azure OpenAI chat agent to a bot-framework HTTP
//! endpoint:
//!
//! - Environment-driven configuration for the model, credentials and host
//! - Lazily attached remote MCP tool servers declared in `ToolingManifest.json`
//! - JWT or anonymous request authentication
//! - Per-turn tracing baggage (tenant and agent identifiers)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Channel service (Teams, Web Chat, ...)           │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ POST /api/messages (Activity JSON)
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          AgentHost                               │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │ JWT /      │ │ Activity   │ │ Token      │ │ Turn       │   │
//! │  │ anonymous  │ │ routing    │ │ cache      │ │ baggage    │   │
//! │  └────────────┘ └────────────┘ └────────────┘ └────────────┘   │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ AgentInterface
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Agent365Agent                             │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 ▼                                 ▼
//!       ┌───────────────────┐            ┌───────────────────┐
//!       │ Azure OpenAI      │            │ MCP tool servers  │
//!       │ chat completions  │            │ (JSON-RPC / HTTP) │
//!       └───────────────────┘            └───────────────────┘
//! ```
//!
//! # HTTP endpoints
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /api/messages` | Ingest an activity, reply in the response body |
//! | `GET /api/messages` | Liveness no-op |
//! | `GET /api/health` | Agent name and initialization state |

pub mod activity;
pub mod agent;
pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod host;
pub mod mcp;
pub mod protocol;
pub mod telemetry;
pub mod token_cache;
pub mod tools;
pub mod turn;

pub use activity::Activity;
pub use agent::{Agent365Agent, AgentInterface, ChatAgent};
pub use config::{AgentConfig, AuthConfig, HostConfig, ToolingManifest};
pub use error::{Error, Result};
pub use host::AgentHost;
pub use token_cache::AgenticTokenCache;
pub use turn::TurnContext;
