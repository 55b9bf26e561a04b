//! Paced frame delivery toward one WebSocket writer.
//!
//! All frames for a connection funnel through a single mpsc channel. Content
//! chunks are paced word by word; eager frames (progress, sources, products,
//! errors) skip the pacing entirely. An async mutex keeps a streamed message
//! atomic on the wire: whoever opens a message holds the gate until its
//! `messageEnd`, so a second streamer cannot interleave chunks.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use cartwheel_agents::TurnSink;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::protocol::EgressFrame;

pub struct EgressStream {
    tx: mpsc::Sender<EgressFrame>,
    word_delay: Duration,
    /// Shared across clones; held from the first chunk to `messageEnd`.
    gate: Arc<AsyncMutex<()>>,
    /// This clone's claim on the gate, if it currently has a message open.
    open: StdMutex<Option<OwnedMutexGuard<()>>>,
}

impl Clone for EgressStream {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            word_delay: self.word_delay,
            gate: self.gate.clone(),
            open: StdMutex::new(None),
        }
    }
}

impl EgressStream {
    pub fn new(tx: mpsc::Sender<EgressFrame>, word_delay: Duration) -> Self {
        Self {
            tx,
            word_delay,
            gate: Arc::new(AsyncMutex::new(())),
            open: StdMutex::new(None),
        }
    }

    async fn deliver(&self, frame: EgressFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| CartwheelError::Session("egress channel closed".to_string()))
    }

    /// Claim the gate unless this clone already holds it.
    async fn open_message(&self) {
        let already_open = self.open.lock().unwrap().is_some();
        if !already_open {
            let guard = self.gate.clone().lock_owned().await;
            *self.open.lock().unwrap() = Some(guard);
        }
    }
}

#[async_trait]
impl TurnSink for EgressStream {
    async fn send(&self, frame: EgressFrame) -> Result<()> {
        self.deliver(frame).await
    }

    async fn stream_text(&self, content: &str) -> Result<()> {
        self.open_message().await;
        let mut first = true;
        for chunk in content.split_inclusive(' ') {
            if !first && !self.word_delay.is_zero() {
                tokio::time::sleep(self.word_delay).await;
            }
            first = false;
            self.deliver(EgressFrame::Message {
                content: chunk.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    async fn message_end(&self) -> Result<()> {
        self.deliver(EgressFrame::MessageEnd).await?;
        // Release only after the terminal frame is in the channel.
        self.open.lock().unwrap().take();
        Ok(())
    }
}
