//! Durable, append-only log primitive.
//!
//! This is the low-level storage engine behind `agent_world`'s event store
//! (spec.md section 4.5): a per-world-root `.jsonl` file, one JSON record per
//! line, each stamped with a SHA-256 digest of its payload so a truncated or
//! half-written line can be detected on reopen. Concurrent writers to the
//! *same* root within one process share a single in-memory lock (mirroring
//! the "in-process lock per world-root" requirement); there is no cross-process
//! file locking, matching the spec's explicit non-goal of distributed
//! coordination.
//!
//! The higher-level seq/chat/metadata semantics (what a "world" or "chat" is)
//! live in `agent_world::store`; this crate only knows about opaque JSON
//! payloads and monotonic sequence numbers.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Corrupt(String),
    Serde(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "durable log io error: {}", e),
            StoreError::Corrupt(msg) => write!(f, "durable log corrupt: {}", msg),
            StoreError::Serde(e) => write!(f, "durable log serde error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

/// One line of the durable log: an opaque payload plus the bookkeeping needed
/// to detect corruption and preserve ordering on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record<T> {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub hash: String,
    pub payload: T,
}

fn hash_payload<T: Serialize>(payload: &T) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

struct Inner<T> {
    path: PathBuf,
    records: Vec<Record<T>>,
    next_seq: u64,
}

impl<T> Inner<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn load(path: &Path) -> Result<Self, StoreError> {
        let records = match Self::load_file(path) {
            Ok(records) => records,
            Err(primary_err) => {
                let bak = bak_path(path);
                if bak.exists() {
                    log::warn!(
                        "durable log {:?} failed to load ({}); recovering from {:?}",
                        path,
                        primary_err,
                        bak
                    );
                    Self::load_file(&bak)?
                } else {
                    return Err(primary_err);
                }
            }
        };
        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            records,
            next_seq,
        })
    }

    fn load_file(path: &Path) -> Result<Vec<Record<T>>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record<T> = serde_json::from_str(&line).map_err(|e| {
                StoreError::Corrupt(format!("line {} in {:?}: {}", lineno, path, e))
            })?;
            let expected = hash_payload(&record.payload)?;
            if expected != record.hash {
                return Err(StoreError::Corrupt(format!(
                    "line {} in {:?} failed hash verification",
                    lineno, path
                )));
            }
            records.push(record);
        }
        Ok(records)
    }

    fn persist(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            let _ = fs::copy(&self.path, bak_path(&self.path));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(&self.path);
        {
            let mut f = fs::File::create(&tmp)?;
            for record in &self.records {
                let line = serde_json::to_string(record)?;
                writeln!(f, "{}", line)?;
            }
            f.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn append(&mut self, payload: T) -> Result<Record<T>, StoreError> {
        let seq = self.next_seq;
        let hash = hash_payload(&payload)?;
        let record = Record {
            seq,
            recorded_at: Utc::now(),
            hash,
            payload,
        };
        self.records.push(record.clone());
        self.next_seq += 1;
        self.persist()?;
        Ok(record)
    }

    fn truncate_from(&mut self, seq: u64) -> Result<Vec<Record<T>>, StoreError> {
        let split_at = self.records.partition_point(|r| r.seq < seq);
        let removed = self.records.split_off(split_at);
        self.persist()?;
        Ok(removed)
    }
}

fn bak_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

type LockRegistry = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

fn lock_registry() -> &'static LockRegistry {
    static REGISTRY: OnceLock<LockRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut registry = lock_registry().lock().expect("lock registry poisoned");
    registry
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Handle to one world-root's durable log. Cheap to clone (shares an `Arc`);
/// all instances pointed at the same path serialize through the same
/// in-process lock.
pub struct DurableLog<T> {
    root_lock: Arc<Mutex<()>>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for DurableLog<T> {
    fn clone(&self) -> Self {
        Self {
            root_lock: self.root_lock.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> DurableLog<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Open (or create) the log file at `path`. Multiple `open` calls against
    /// the same canonical path within this process share state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let root_lock = lock_for(&path);
        let _guard = root_lock.lock().expect("root lock poisoned");
        let inner = Inner::load(&path)?;
        Ok(Self {
            root_lock: root_lock.clone(),
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn append(&self, payload: T) -> Result<Record<T>, StoreError> {
        let _guard = self.root_lock.lock().expect("root lock poisoned");
        let mut inner = self.inner.lock().expect("log inner poisoned");
        inner.append(payload)
    }

    pub fn truncate_from(&self, seq: u64) -> Result<Vec<Record<T>>, StoreError> {
        let _guard = self.root_lock.lock().expect("root lock poisoned");
        let mut inner = self.inner.lock().expect("log inner poisoned");
        inner.truncate_from(seq)
    }

    pub fn read_all(&self) -> Vec<Record<T>> {
        let inner = self.inner.lock().expect("log inner poisoned");
        inner.records.clone()
    }

    pub fn read_from(&self, seq: u64) -> Vec<Record<T>> {
        let inner = self.inner.lock().expect("log inner poisoned");
        inner
            .records
            .iter()
            .filter(|r| r.seq >= seq)
            .cloned()
            .collect()
    }

    pub fn next_seq(&self) -> u64 {
        let inner = self.inner.lock().expect("log inner poisoned");
        inner.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payload {
        text: String,
    }

    #[test]
    fn append_assigns_monotonic_seq() {
        let dir = tempdir().unwrap();
        let log = DurableLog::<Payload>::open(dir.path().join("w1.jsonl")).unwrap();
        let r0 = log
            .append(Payload {
                text: "a".into(),
            })
            .unwrap();
        let r1 = log
            .append(Payload {
                text: "b".into(),
            })
            .unwrap();
        assert_eq!(r0.seq, 0);
        assert_eq!(r1.seq, 1);
        assert_eq!(log.read_all().len(), 2);
    }

    #[test]
    fn reopen_restores_state_and_continues_seq() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w1.jsonl");
        {
            let log = DurableLog::<Payload>::open(&path).unwrap();
            log.append(Payload { text: "a".into() }).unwrap();
        }
        let log2 = DurableLog::<Payload>::open(&path).unwrap();
        assert_eq!(log2.read_all().len(), 1);
        let r = log2.append(Payload { text: "b".into() }).unwrap();
        assert_eq!(r.seq, 1);
    }

    #[test]
    fn truncate_from_removes_suffix() {
        let dir = tempdir().unwrap();
        let log = DurableLog::<Payload>::open(dir.path().join("w1.jsonl")).unwrap();
        for i in 0..5 {
            log.append(Payload {
                text: format!("msg{}", i),
            })
            .unwrap();
        }
        let removed = log.truncate_from(3).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(log.read_all().len(), 3);
        assert_eq!(log.next_seq(), 5, "truncation does not rewind the seq counter");
    }

    #[test]
    fn corrupt_primary_recovers_from_bak() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w1.jsonl");
        {
            let log = DurableLog::<Payload>::open(&path).unwrap();
            log.append(Payload { text: "a".into() }).unwrap();
            log.append(Payload { text: "b".into() }).unwrap();
        }
        // .bak now holds the single-record state written before the second append.
        fs::write(&path, b"{not valid json at all").unwrap();
        let log2 = DurableLog::<Payload>::open(&path).unwrap();
        assert_eq!(log2.read_all().len(), 1);
    }
}
