// ABOUTME: In-memory Transport and Directory implementations.
// ABOUTME: Record every call and can inject StatusError failures for retry tests.

use crate::retry::StatusError;
use crate::traits::{Directory, OutboundMessage, Transport};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<VecDeque<StatusError>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with `error`; queued failures are consumed in order
    pub fn fail_next(&self, error: StatusError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err.into());
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    tags: Mutex<HashMap<String, String>>,
    failures: Mutex<VecDeque<StatusError>>,
    writes: Mutex<usize>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(self, bot_id: &str, tags: &str) -> Self {
        self.tags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bot_id.to_string(), tags.to_string());
        self
    }

    /// Fail the next read or write with `error`
    pub fn fail_next(&self, error: StatusError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn stored(&self, bot_id: &str) -> Option<String> {
        self.tags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bot_id)
            .cloned()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn injected_failure(&self) -> Result<()> {
        match self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn default_tags(&self, bot_id: &str) -> Result<Option<String>> {
        self.injected_failure()?;
        Ok(self.stored(bot_id))
    }

    async fn set_default_tags(&self, bot_id: &str, tags: &str) -> Result<()> {
        self.injected_failure()?;
        self.tags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bot_id.to_string(), tags.to_string());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
