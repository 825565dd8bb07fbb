// ABOUTME: Seams to the outside world: the chat transport and the persistence directory.
// ABOUTME: Implementations live in the binary (stdio, SQLite) and in memory.rs for tests.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Transport
// =============================================================================

/// A message the core asks the transport to post into a scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub scope_id: String,
    pub sender_id: Option<String>,
    pub text: String,
    pub tags: String,
    pub is_whisper: bool,
    pub mentioned_ids: Vec<String>,
}

/// Push-based chat transport. Delivery is at-least-once at best.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

// =============================================================================
// Directory
// =============================================================================

/// Key-value side channel keyed by bot id, holding each bot's default-tags JSON blob.
///
/// Fails with [`crate::retry::StatusError`] when the backing service reports a status,
/// so callers can decide whether to retry.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Raw default-tags JSON, `None` when the bot has none stored
    async fn default_tags(&self, bot_id: &str) -> Result<Option<String>>;

    /// Replace the bot's default-tags JSON wholesale
    async fn set_default_tags(&self, bot_id: &str, tags: &str) -> Result<()>;
}
