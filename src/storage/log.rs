//! Durable Log Store
//!
//! Persists the replicated log and consensus metadata in a transactional
//! embedded store (redb). Three tables:
//!
//! - `log`: index -> entry (committed prefix plus uncommitted tail)
//! - `msg_index`: msg_id -> seq, the dedup constraint, written at apply
//! - `meta`: current_term, voted_for, applied_index
//!
//! Every write that changes consensus-visible state is committed durably
//! before the corresponding RPC reply. Truncation and the append that caused
//! it happen in one transaction, as do term/vote updates grouped with an
//! append.

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::storage::{LogEntry, Message};

const LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("log");
const MSG_INDEX: TableDefinition<&str, u64> = TableDefinition::new("msg_index");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_CURRENT_TERM: &str = "current_term";
const META_VOTED_FOR: &str = "voted_for";
const META_APPLIED_INDEX: &str = "applied_index";

/// Persistent consensus metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMeta {
    /// Monotone non-decreasing term
    pub current_term: u64,
    /// Vote cast in `current_term`, if any
    pub voted_for: Option<String>,
}

/// A batch of durable writes applied in one transaction.
///
/// Consensus handlers describe their persistence needs with this; grouping
/// a term/vote change with the truncation and append it caused is what keeps
/// a crash from splitting them.
#[derive(Debug, Clone, Default)]
pub struct PersistOps {
    /// New (term, voted_for) pair, if changed
    pub meta: Option<(u64, Option<String>)>,
    /// Truncate this index and everything after it, before appending
    pub truncate_from: Option<u64>,
    /// Entries to append after any truncation
    pub append: Vec<LogEntry>,
}

impl PersistOps {
    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.meta.is_none() && self.truncate_from.is_none() && self.append.is_empty()
    }
}

/// One page of a filtered, paginated query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPage {
    /// Matching messages in seq order
    pub messages: Vec<Message>,
    /// Cursor for the next page, present when the page filled up
    pub next_after: Option<u64>,
}

/// On-disk representation of a log entry. The index is the table key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    term: u64,
    msg_id: String,
    sender: Option<String>,
    recipient: Option<String>,
    payload: String,
    original_ts: f64,
    corrected_ts: Option<f64>,
    /// Set at apply when a committed entry repeats an already-applied msg_id
    duplicate: bool,
}

impl StoredEntry {
    fn from_entry(entry: &LogEntry) -> Self {
        Self {
            term: entry.term,
            msg_id: entry.message.msg_id.clone(),
            sender: entry.message.sender.clone(),
            recipient: entry.message.recipient.clone(),
            payload: entry.message.payload.clone(),
            original_ts: entry.message.original_ts,
            corrected_ts: entry.message.corrected_ts,
            duplicate: false,
        }
    }

    fn into_entry(self, index: u64) -> LogEntry {
        LogEntry {
            term: self.term,
            index,
            message: Message {
                msg_id: self.msg_id,
                sender: self.sender,
                recipient: self.recipient,
                payload: self.payload,
                original_ts: self.original_ts,
                corrected_ts: self.corrected_ts,
                seq: index,
            },
        }
    }
}

/// Durable store for the replicated log and consensus metadata.
pub struct LogStore {
    db: Database,
}

impl LogStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("relaymq.redb");
        let db = Database::create(&path)?;

        // Make sure all tables exist so reads never race table creation.
        let wtx = db.begin_write()?;
        {
            wtx.open_table(LOG)?;
            wtx.open_table(MSG_INDEX)?;
            wtx.open_table(META)?;
        }
        wtx.commit()?;

        info!(path = %path.display(), "log store opened");
        Ok(Self { db })
    }

    /// Apply a batch of writes in one durable transaction.
    pub fn persist(&self, ops: &PersistOps) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let wtx = self.db.begin_write()?;
        {
            if let Some((term, ref voted_for)) = ops.meta {
                let mut meta = wtx.open_table(META)?;
                meta.insert(META_CURRENT_TERM, bincode::serialize(&term)?.as_slice())?;
                meta.insert(META_VOTED_FOR, bincode::serialize(voted_for)?.as_slice())?;
            }

            let mut log = wtx.open_table(LOG)?;
            if let Some(from) = ops.truncate_from {
                let removed: Vec<u64> = log
                    .range(from..)?
                    .map(|item| item.map(|(k, _)| k.value()))
                    .collect::<Result<_, _>>()?;
                for index in &removed {
                    log.remove(index)?;
                }
                if !removed.is_empty() {
                    debug!(from, count = removed.len(), "truncated log tail");
                }
            }
            for entry in &ops.append {
                let bytes = bincode::serialize(&StoredEntry::from_entry(entry))?;
                log.insert(entry.index, bytes.as_slice())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Append a single entry.
    pub fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.persist(&PersistOps {
            append: vec![entry.clone()],
            ..Default::default()
        })
    }

    /// Remove `index` and everything after it.
    pub fn truncate_from(&self, index: u64) -> Result<(), StoreError> {
        self.persist(&PersistOps {
            truncate_from: Some(index),
            ..Default::default()
        })
    }

    /// Fetch the entry at `index`.
    pub fn get(&self, index: u64) -> Result<Option<LogEntry>, StoreError> {
        let rtx = self.db.begin_read()?;
        let log = rtx.open_table(LOG)?;
        match log.get(index)? {
            Some(guard) => {
                let stored: StoredEntry = bincode::deserialize(guard.value())?;
                Ok(Some(stored.into_entry(index)))
            }
            None => Ok(None),
        }
    }

    /// Highest index in the log, 0 when empty.
    pub fn last_index(&self) -> Result<u64, StoreError> {
        let rtx = self.db.begin_read()?;
        let log = rtx.open_table(LOG)?;
        let result = log.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(result)
    }

    /// Term of the last entry, 0 when empty.
    pub fn last_term(&self) -> Result<u64, StoreError> {
        let rtx = self.db.begin_read()?;
        let log = rtx.open_table(LOG)?;
        let result = match log.last()? {
            Some((_, v)) => {
                let stored: StoredEntry = bincode::deserialize(v.value())?;
                Ok(stored.term)
            }
            None => Ok(0),
        };
        result
    }

    /// Term of the entry at `index`, if present.
    pub fn term_at(&self, index: u64) -> Result<Option<u64>, StoreError> {
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Load the entire log in index order; used for startup recovery.
    pub fn load_log(&self) -> Result<Vec<LogEntry>, StoreError> {
        let rtx = self.db.begin_read()?;
        let log = rtx.open_table(LOG)?;
        let mut entries = Vec::new();
        for item in log.range(1u64..)? {
            let (k, v) = item?;
            let stored: StoredEntry = bincode::deserialize(v.value())?;
            entries.push(stored.into_entry(k.value()));
        }
        Ok(entries)
    }

    /// Read consensus metadata; defaults when never written.
    pub fn get_meta(&self) -> Result<ConsensusMeta, StoreError> {
        let rtx = self.db.begin_read()?;
        let meta = rtx.open_table(META)?;

        let current_term = match meta.get(META_CURRENT_TERM)? {
            Some(v) => bincode::deserialize(v.value())?,
            None => 0,
        };
        let voted_for = match meta.get(META_VOTED_FOR)? {
            Some(v) => bincode::deserialize(v.value())?,
            None => None,
        };
        Ok(ConsensusMeta { current_term, voted_for })
    }

    /// Durably record the current term and vote.
    pub fn set_meta(&self, term: u64, voted_for: Option<&str>) -> Result<(), StoreError> {
        self.persist(&PersistOps {
            meta: Some((term, voted_for.map(str::to_owned))),
            ..Default::default()
        })
    }

    /// Highest applied (committed-and-processed) index, 0 when none.
    pub fn applied_index(&self) -> Result<u64, StoreError> {
        let rtx = self.db.begin_read()?;
        let meta = rtx.open_table(META)?;
        match meta.get(META_APPLIED_INDEX)? {
            Some(v) => Ok(bincode::deserialize(v.value())?),
            None => Ok(0),
        }
    }

    /// Apply the committed entry at `index`: fill its corrected timestamp,
    /// claim its msg_id in the dedup index, and advance `applied_index` -
    /// all in one transaction. Returns false when the msg_id was already
    /// claimed by an earlier seq (the entry is marked duplicate and hidden
    /// from queries).
    pub fn apply(&self, index: u64, corrected_ts: f64) -> Result<bool, StoreError> {
        let wtx = self.db.begin_write()?;
        let first = {
            let mut log = wtx.open_table(LOG)?;
            let mut stored: StoredEntry = match log.get(index)? {
                Some(guard) => bincode::deserialize(guard.value())?,
                None => return Err(StoreError::Missing(index)),
            };

            let mut msg_index = wtx.open_table(MSG_INDEX)?;
            let claimed = msg_index.get(stored.msg_id.as_str())?.map(|g| g.value());
            let first = match claimed {
                None => {
                    msg_index.insert(stored.msg_id.as_str(), index)?;
                    true
                }
                Some(seq) => seq == index,
            };

            stored.corrected_ts = Some(corrected_ts);
            stored.duplicate = !first;
            log.insert(index, bincode::serialize(&stored)?.as_slice())?;

            let mut meta = wtx.open_table(META)?;
            meta.insert(META_APPLIED_INDEX, bincode::serialize(&index)?.as_slice())?;
            first
        };
        wtx.commit()?;
        Ok(first)
    }

    /// Committed seq for `msg_id`, if it was ever applied.
    pub fn lookup_msg_id(&self, msg_id: &str) -> Result<Option<u64>, StoreError> {
        let rtx = self.db.begin_read()?;
        let msg_index = rtx.open_table(MSG_INDEX)?;
        Ok(msg_index.get(msg_id)?.map(|g| g.value()))
    }

    /// Filtered, paginated read over the applied prefix.
    ///
    /// Returns messages with `seq > after` and `seq <= up_to`, skipping
    /// duplicate-marked entries, at most `limit` of them, with a `next_after`
    /// cursor when the page filled.
    pub fn range(
        &self,
        after: u64,
        up_to: u64,
        limit: usize,
        sender: Option<&str>,
        recipient: Option<&str>,
    ) -> Result<QueryPage, StoreError> {
        if up_to <= after || limit == 0 {
            return Ok(QueryPage { messages: Vec::new(), next_after: None });
        }
        let rtx = self.db.begin_read()?;
        let log = rtx.open_table(LOG)?;

        let mut messages = Vec::new();
        for item in log.range(after + 1..=up_to)? {
            let (k, v) = item?;
            let stored: StoredEntry = bincode::deserialize(v.value())?;
            if stored.duplicate {
                continue;
            }
            if let Some(s) = sender {
                if stored.sender.as_deref() != Some(s) {
                    continue;
                }
            }
            if let Some(r) = recipient {
                if stored.recipient.as_deref() != Some(r) {
                    continue;
                }
            }
            messages.push(stored.into_entry(k.value()).message);
            if messages.len() >= limit {
                break;
            }
        }

        let next_after = if messages.len() >= limit {
            messages.last().map(|m| m.seq)
        } else {
            None
        };
        Ok(QueryPage { messages, next_after })
    }

    /// Applied entries with `index > after`, for catch-up serving.
    pub fn entries_after(
        &self,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        if up_to <= after || limit == 0 {
            return Ok(Vec::new());
        }
        let rtx = self.db.begin_read()?;
        let log = rtx.open_table(LOG)?;
        let mut entries = Vec::new();
        for item in log.range(after + 1..=up_to)? {
            let (k, v) = item?;
            let stored: StoredEntry = bincode::deserialize(v.value())?;
            entries.push(stored.into_entry(k.value()));
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(term: u64, index: u64, msg_id: &str, sender: Option<&str>) -> LogEntry {
        let mut msg = Message::new(format!("payload-{index}")).with_msg_id(msg_id);
        if let Some(s) = sender {
            msg = msg.with_sender(s);
        }
        LogEntry::new(term, index, msg)
    }

    #[test]
    fn test_append_and_get() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::open(temp.path()).unwrap();

        store.append(&entry(1, 1, "a", None)).unwrap();
        store.append(&entry(1, 2, "b", None)).unwrap();

        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.last_term().unwrap(), 1);

        let got = store.get(1).unwrap().unwrap();
        assert_eq!(got.message.msg_id, "a");
        assert_eq!(got.message.seq, 1);
        assert!(store.get(3).unwrap().is_none());
    }

    #[test]
    fn test_truncate_with_append_is_atomic() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::open(temp.path()).unwrap();

        store.append(&entry(1, 1, "a", None)).unwrap();
        store.append(&entry(1, 2, "b", None)).unwrap();
        store.append(&entry(1, 3, "c", None)).unwrap();

        // Conflict at index 2: truncate and replace in one transaction.
        store
            .persist(&PersistOps {
                meta: Some((2, None)),
                truncate_from: Some(2),
                append: vec![entry(2, 2, "b2", None)],
            })
            .unwrap();

        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.get(2).unwrap().unwrap().message.msg_id, "b2");
        assert!(store.get(3).unwrap().is_none());
        assert_eq!(store.get_meta().unwrap().current_term, 2);
    }

    #[test]
    fn test_meta_roundtrip_and_recovery() {
        let temp = TempDir::new().unwrap();
        {
            let store = LogStore::open(temp.path()).unwrap();
            store.set_meta(5, Some("node-b")).unwrap();
            store.append(&entry(5, 1, "a", None)).unwrap();
        }
        // Reopen: term, vote, and log must survive exactly.
        let store = LogStore::open(temp.path()).unwrap();
        let meta = store.get_meta().unwrap();
        assert_eq!(meta.current_term, 5);
        assert_eq!(meta.voted_for.as_deref(), Some("node-b"));
        assert_eq!(store.load_log().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_fills_corrected_and_dedups() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::open(temp.path()).unwrap();

        store.append(&entry(1, 1, "dup", None)).unwrap();
        store.append(&entry(1, 2, "dup", None)).unwrap();

        assert!(store.apply(1, 100.5).unwrap());
        assert!(!store.apply(2, 101.0).unwrap());

        assert_eq!(store.applied_index().unwrap(), 2);
        assert_eq!(store.lookup_msg_id("dup").unwrap(), Some(1));
        assert_eq!(store.get(1).unwrap().unwrap().message.corrected_ts, Some(100.5));

        // Queries hide the duplicate.
        let page = store.range(0, 2, 10, None, None).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].seq, 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::open(temp.path()).unwrap();
        store.append(&entry(1, 1, "a", None)).unwrap();

        assert!(store.apply(1, 100.0).unwrap());
        assert!(store.apply(1, 100.0).unwrap());
        assert_eq!(store.lookup_msg_id("a").unwrap(), Some(1));
    }

    #[test]
    fn test_range_filters_and_pagination() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::open(temp.path()).unwrap();

        for i in 1..=10u64 {
            let sender = if i % 2 == 0 { Some("even") } else { Some("odd") };
            store.append(&entry(1, i, &format!("m{i}"), sender)).unwrap();
            store.apply(i, 100.0 + i as f64).unwrap();
        }

        // Paginate through everything, 3 at a time.
        let page = store.range(0, 10, 3, None, None).unwrap();
        assert_eq!(page.messages.len(), 3);
        assert_eq!(page.next_after, Some(3));

        let page = store.range(3, 10, 3, None, None).unwrap();
        assert_eq!(page.messages[0].seq, 4);

        // Sender filter.
        let page = store.range(0, 10, 100, Some("even"), None).unwrap();
        assert_eq!(page.messages.len(), 5);
        assert!(page.messages.iter().all(|m| m.sender.as_deref() == Some("even")));
        assert!(page.next_after.is_none());

        // The uncommitted tail is invisible when up_to bounds the scan.
        store.append(&entry(1, 11, "tail", None)).unwrap();
        let page = store.range(0, 10, 100, None, None).unwrap();
        assert_eq!(page.messages.len(), 10);
    }

    #[test]
    fn test_entries_after_for_catchup() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::open(temp.path()).unwrap();
        for i in 1..=5u64 {
            store.append(&entry(1, i, &format!("m{i}"), None)).unwrap();
            store.apply(i, 100.0).unwrap();
        }

        let entries = store.entries_after(2, 5, 100).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, 3);
        assert_eq!(entries[2].index, 5);
    }
}
