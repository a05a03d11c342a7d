//! Transcript sink for completed command/output pairs.
//!
//! Sessions forward `term/message` payloads here once the client has told
//! them which container they are attached to. Retention is unbounded: entries
//! accumulate per container until the process exits.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// One history entry, e.g. `{"text": "ls -la", "cwd": "/root"}`.
pub type HistoryEntry = BTreeMap<String, String>;

/// Durable destination for session transcripts.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn append(&self, correlation_id: &str, entry: HistoryEntry);
}

/// In-process transcript keyed by correlation (container) ID.
#[derive(Debug, Default)]
pub struct MemoryTranscript {
    entries: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries recorded for `correlation_id`, oldest first.
    pub async fn history(&self, correlation_id: &str) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .get(correlation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TranscriptSink for MemoryTranscript {
    async fn append(&self, correlation_id: &str, entry: HistoryEntry) {
        self.entries
            .write()
            .await
            .entry(correlation_id.to_string())
            .or_default()
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_is_per_container_and_ordered() {
        let sink = MemoryTranscript::new();
        let entry = |text: &str| HistoryEntry::from([("text".to_string(), text.to_string())]);
        sink.append("c1", entry("ls")).await;
        sink.append("c2", entry("pwd")).await;
        sink.append("c1", entry("cd /")).await;

        let c1 = sink.history("c1").await;
        assert_eq!(c1.len(), 2);
        assert_eq!(c1[0]["text"], "ls");
        assert_eq!(c1[1]["text"], "cd /");
        assert!(sink.history("nope").await.is_empty());
    }
}
