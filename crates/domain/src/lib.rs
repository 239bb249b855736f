//! Shared types for the aegis gateway: provider-agnostic messages, streaming
//! events, configuration, and the audit-event data model. Kept dependency-free
//! of any one crate's concerns so `aegis-transcript`, `aegis-mcp-client`,
//! `aegis-providers`, `aegis-tools`, `aegis-sessions`, and `aegis-gateway` can
//! all build on the same vocabulary.

pub mod audit;
pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;

pub use audit::{AuditActor, AuditCategory, AuditEvent, AuditResource, AuditStatus};
pub use capability::{LlmCapabilities, ToolSupport};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
pub use stream::{BoxStream, StreamEvent, Usage};
