// ABOUTME: Line-delimited JSON transport: each outbound message is one JSON object per line.
// ABOUTME: Defaults to stdout; any async writer works, which is how tests capture output.

use anyhow::{Context, Result};
use async_trait::async_trait;
use opera_core::traits::{OutboundMessage, Transport};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub struct JsonLineTransport<W> {
    writer: Mutex<W>,
}

impl JsonLineTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLineTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for JsonLineTransport<W> {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.context("writing outbound message")?;
        writer.flush().await?;
        tracing::debug!(scope_id = %message.scope_id, whisper = message.is_whisper, "Message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_json_object_per_line() {
        let transport = JsonLineTransport::new(Vec::new());
        for text in ["first", "second"] {
            transport
                .send(OutboundMessage {
                    scope_id: "op".into(),
                    text: text.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let output = String::from_utf8(transport.into_inner()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: OutboundMessage = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.text, "first");
        assert!(lines[1].contains("\"scopeId\":\"op\""));
    }
}
