//! Append-only JSONL record of everything a run sent to its worker.

use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use runkit_protocol::WorkerNotification;
use serde::Serialize;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;

#[derive(Serialize)]
struct StoredRecord<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a WorkerNotification,
}

/// `None` inside means the mode persists nothing; every call is then a no-op.
pub struct DataStore {
    file: Option<BufWriter<File>>,
    records: u64,
}

impl DataStore {
    pub async fn open(path: &Path, persist: bool) -> std::io::Result<Self> {
        if !persist {
            return Ok(Self::disabled());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            records: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            file: None,
            records: 0,
        }
    }

    pub async fn append(&mut self, record: &WorkerNotification) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(&StoredRecord {
            ts: Utc::now(),
            record,
        })?;
        line.push(b'\n');
        file.write_all(&line).await?;
        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        }
    }

    /// Records appended since the store was opened.
    pub fn records(&self) -> u64 {
        self.records
    }
}
