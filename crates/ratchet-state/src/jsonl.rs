//! Append-only newline-delimited JSON audit sink.
//!
//! One `AuditRecord` per line. Appends are fsynced before returning. The
//! only rewrite is the retention purge, which writes the surviving lines to
//! a temporary file in the same directory and atomically renames it over
//! the log.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage_traits::{AuditRecord, AuditSink, StorageResult};

/// File-backed [`AuditSink`].
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    // Serializes appends and purges; holds the last assigned seq.
    last_seq: Mutex<u64>,
}

impl JsonlAuditSink {
    /// Open (or create) the log at `path`, resuming the sequence counter
    /// from the last entry already present.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let last_seq = read_all(&path)
            .map_err(|e| crate::StateError::SchemaSetup(e.to_string()))?
            .last()
            .map(|r| r.seq)
            .unwrap_or(0);

        info!(path = %path.display(), last_seq, "audit log opened");
        Ok(Self {
            path,
            last_seq: Mutex::new(last_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_all(path: &Path) -> StorageResult<Vec<AuditRecord>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(r) => out.push(r),
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "unreadable audit line");
                return Err(StorageError::Serialization(format!(
                    "{}:{}: {e}",
                    path.display(),
                    lineno + 1
                )));
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, mut record: AuditRecord) -> StorageResult<u64> {
        let mut last = self.last_seq.lock().await;
        record.seq = *last + 1;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()
        })
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))??;

        *last = record.seq;
        debug!(seq = record.seq, "audit entry appended");
        Ok(record.seq)
    }

    async fn entries(&self, since: Option<DateTime<Utc>>) -> StorageResult<Vec<AuditRecord>> {
        let _guard = self.last_seq.lock().await;
        let path = self.path.clone();
        let all = tokio::task::spawn_blocking(move || read_all(&path))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))??;
        Ok(all
            .into_iter()
            .filter(|r| since.map_or(true, |s| r.timestamp >= s))
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let _guard = self.last_seq.lock().await;
        let path = self.path.clone();
        let removed = tokio::task::spawn_blocking(move || -> StorageResult<u64> {
            let all = read_all(&path)?;
            let before = all.len();
            let kept: Vec<_> = all.into_iter().filter(|r| r.timestamp >= cutoff).collect();
            let removed = (before - kept.len()) as u64;
            if removed == 0 {
                return Ok(0);
            }

            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let mut tmp = NamedTempFile::new_in(dir)?;
            for r in &kept {
                serde_json::to_writer(&mut tmp, r)?;
                tmp.write_all(b"\n")?;
            }
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
            Ok(removed)
        })
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))??;

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "audit retention purge");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(ts: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            seq: 0,
            timestamp: ts,
            operation: serde_json::json!({"kind": "apply_patch"}),
            decision: serde_json::json!({"verdict": "allow"}),
            actor: "agent:evolver".to_string(),
            detail: String::new(),
        }
    }

    #[tokio::test]
    async fn seq_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let sink = JsonlAuditSink::open(&path).unwrap();
            assert_eq!(sink.append(entry(Utc::now())).await.unwrap(), 1);
            assert_eq!(sink.append(entry(Utc::now())).await.unwrap(), 2);
        }
        let sink = JsonlAuditSink::open(&path).unwrap();
        assert_eq!(sink.append(entry(Utc::now())).await.unwrap(), 3);
        assert_eq!(sink.entries(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn purge_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();
        let now = Utc::now();
        sink.append(entry(now - Duration::days(400))).await.unwrap();
        sink.append(entry(now)).await.unwrap();

        let removed = sink.purge_before(now - Duration::days(365)).await.unwrap();
        assert_eq!(removed, 1);

        let left = sink.entries(None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].seq, 2);

        // Sequence keeps increasing after a purge.
        assert_eq!(sink.append(entry(now)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn corrupt_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        assert!(JsonlAuditSink::open(&path).is_err());
    }
}
