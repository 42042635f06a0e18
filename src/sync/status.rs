//! Status Channel - Cross-View Status Mirroring
//!
//! Named in-process broadcast channels. Every engine instance publishes its
//! status on the channel named in its config (`ac-sync` by default); other views
//! of the same process subscribe to mirror it. Receivers never see their own
//! messages.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::broadcast;

use super::models::{SyncMode, SyncStatus};

const CHANNEL_CAPACITY: usize = 32;

lazy_static! {
    static ref CHANNELS: StdMutex<HashMap<String, broadcast::Sender<StatusMessage>>> =
        StdMutex::new(HashMap::new());
}

/// Message posted on a status channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Device (or view) that published the status
    pub origin: String,
    pub mode: SyncMode,
    pub detail: String,
}

impl StatusMessage {
    pub fn status(&self) -> SyncStatus {
        SyncStatus::new(self.mode, self.detail.clone())
    }
}

/// Handle on one named channel
#[derive(Clone)]
pub struct StatusChannel {
    name: String,
    origin: String,
    sender: broadcast::Sender<StatusMessage>,
}

impl StatusChannel {
    /// Join (or create) the channel `name` as `origin`
    pub fn join(name: &str, origin: &str) -> Self {
        let mut channels = CHANNELS.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        Self {
            name: name.to_string(),
            origin: origin.to_string(),
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broadcast `status`; having no listeners is not an error
    pub fn publish(&self, status: &SyncStatus) {
        let message = StatusMessage {
            origin: self.origin.clone(),
            mode: status.mode,
            detail: status.detail.clone(),
        };
        if self.sender.send(message).is_err() {
            log::trace!("No listeners on status channel {}", self.name);
        }
    }

    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            origin: self.origin.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving side of a channel, filtering out its own origin
pub struct StatusSubscription {
    origin: String,
    receiver: broadcast::Receiver<StatusMessage>,
}

impl StatusSubscription {
    /// Next foreign message, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<StatusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.origin == self.origin => continue,
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Status subscriber lagged, skipped {} messages", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<StatusMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if message.origin == self.origin => continue,
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
