//! Upload log streaming
//!
//! Servers narrate long uploads through a per-session log. `UploadLogFollower`
//! polls an `UploadLogSource` and forwards new lines over an mpsc channel until it
//! is stopped or the receiver goes away. Nothing in the pipeline depends on it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

#[async_trait]
pub trait UploadLogSource: Send + Sync {
    /// Lines for `session_id` starting at line `cursor`
    async fn read_lines(&self, session_id: &str, cursor: usize) -> Result<Vec<String>>;
}

/// In-process log, appended to by local uploaders
#[derive(Default)]
pub struct MemoryUploadLog {
    sessions: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryUploadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, session_id: &str, line: impl Into<String>) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .push(line.into());
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl UploadLogSource for MemoryUploadLog {
    async fn read_lines(&self, session_id: &str, cursor: usize) -> Result<Vec<String>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions
            .get(session_id)
            .map(|lines| lines.iter().skip(cursor).cloned().collect())
            .unwrap_or_default())
    }
}

pub struct UploadLogFollower {
    source: Arc<dyn UploadLogSource>,
    session_id: String,
    interval: Duration,
}

/// Running follower. `stop` drains one last poll and returns the line count.
pub struct FollowHandle {
    stop: Arc<Notify>,
    task: JoinHandle<usize>,
}

impl FollowHandle {
    pub async fn stop(self) -> usize {
        self.stop.notify_one();
        match self.task.await {
            Ok(forwarded) => forwarded,
            Err(e) => {
                warn!("Upload log follower failed: {}", e);
                0
            }
        }
    }
}

impl UploadLogFollower {
    pub fn new(source: Arc<dyn UploadLogSource>, session_id: impl Into<String>) -> Self {
        Self {
            source,
            session_id: session_id.into(),
            interval: Duration::from_millis(500),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start polling on the current runtime
    pub fn follow(self) -> (mpsc::Receiver<String>, FollowHandle) {
        let (tx, rx) = mpsc::channel(64);
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();
        let task = tokio::spawn(async move { self.run(tx, signal).await });
        (rx, FollowHandle { stop, task })
    }

    async fn run(self, tx: mpsc::Sender<String>, stop: Arc<Notify>) -> usize {
        let mut cursor = 0;
        loop {
            let stopping = tokio::select! {
                _ = stop.notified() => true,
                _ = tokio::time::sleep(self.interval) => false,
            };

            match self.source.read_lines(&self.session_id, cursor).await {
                Ok(lines) => {
                    for line in lines {
                        cursor += 1;
                        if tx.send(line).await.is_err() {
                            debug!(session = %self.session_id, "Upload log receiver closed");
                            return cursor;
                        }
                    }
                }
                Err(e) => warn!(session = %self.session_id, "Upload log poll failed: {}", e),
            }

            if stopping {
                return cursor;
            }
        }
    }
}
