//! Convergent document store.
//!
//! A single shared text buffer backed by a `yrs` document. Every writer goes
//! through [`DocumentStore::apply_local`] or [`DocumentStore::apply_remote`];
//! both serialize on one internal mutex so no two merges interleave.
//!
//! Offsets are UTF-8 byte offsets into the current text.
//!
//! ```text
//! editor keystroke ──► apply_local ──► LocalUpdate (seq, bytes) ──► transport
//!                                                     │
//!                                       pending until acknowledge(seq)
//!
//! transport delta  ──► apply_remote ──► DocChange { edit, Remote } ──► listeners
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::update_check::{check_state_vector, check_update};

/// Name of the text root shared by every replica.
pub const TEXT_ROOT: &str = "content";

// ───────────────────────────────────────────────────────────────────
// Edits and origins
// ───────────────────────────────────────────────────────────────────

/// Range edit: delete `delete_len` bytes at `offset`, then insert `insert`
/// there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub offset: usize,
    pub delete_len: usize,
    pub insert: String,
}

/// A local edit request. Same shape as the edits handed to listeners.
pub type TextChange = TextEdit;

impl TextEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            delete_len: 0,
            insert: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            delete_len: len,
            insert: String::new(),
        }
    }

    pub fn replace(offset: usize, len: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            delete_len: len,
            insert: text.into(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.delete_len == 0 && self.insert.is_empty()
    }

    /// Check the edit against `text`: in range and on char boundaries.
    pub fn validate(&self, text: &str) -> Result<(), DocumentError> {
        let end = self
            .offset
            .checked_add(self.delete_len)
            .ok_or_else(|| DocumentError::InvalidEdit("range overflows".into()))?;
        if end > text.len() {
            return Err(DocumentError::InvalidEdit(format!(
                "range {}..{} past end of {} bytes",
                self.offset,
                end,
                text.len()
            )));
        }
        if !text.is_char_boundary(self.offset) || !text.is_char_boundary(end) {
            return Err(DocumentError::InvalidEdit(format!(
                "range {}..{} splits a character",
                self.offset, end
            )));
        }
        Ok(())
    }

    /// Apply to a plain string. The edit must already be valid for `text`.
    pub fn apply_to(&self, text: &mut String) {
        text.replace_range(self.offset..self.offset + self.delete_len, &self.insert);
    }

    /// Smallest range edit turning `before` into `after`, or `None` if equal.
    pub fn between(before: &str, after: &str) -> Option<Self> {
        if before == after {
            return None;
        }

        let mut prefix = before
            .bytes()
            .zip(after.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        while !before.is_char_boundary(prefix) || !after.is_char_boundary(prefix) {
            prefix -= 1;
        }

        let max_suffix = (before.len() - prefix).min(after.len() - prefix);
        let mut suffix = before
            .bytes()
            .rev()
            .zip(after.bytes().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        while !before.is_char_boundary(before.len() - suffix)
            || !after.is_char_boundary(after.len() - suffix)
        {
            suffix -= 1;
        }

        Some(Self {
            offset: prefix,
            delete_len: before.len() - prefix - suffix,
            insert: after[prefix..after.len() - suffix].to_string(),
        })
    }
}

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(1);

/// Marks who produced a local edit, so a writer can recognise its own edits
/// when they come back around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginTag {
    /// Process-unique writer id.
    pub source: u64,
    /// Monotonic per-writer counter.
    pub seq: u64,
}

impl OriginTag {
    /// A writer id no other writer in this process has.
    pub fn fresh_source() -> u64 {
        NEXT_SOURCE.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new(source: u64, seq: u64) -> Self {
        Self { source, seq }
    }

    /// One-off tag for writers that never need to recognise their echoes.
    pub fn anonymous() -> Self {
        Self::new(Self::fresh_source(), 0)
    }
}

/// Encoded local update awaiting relay acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUpdate {
    /// Local sequence number, also the wire clock.
    pub seq: u64,
    pub update: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local { tag: OriginTag, update: LocalUpdate },
    Remote,
}

/// A visible change to the document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub edit: TextEdit,
    pub origin: ChangeOrigin,
    /// Document version after the change.
    pub version: u64,
}

impl DocChange {
    pub fn is_local(&self) -> bool {
        matches!(self.origin, ChangeOrigin::Local { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed remote update rejected: {0}")]
    MergeRejected(String),
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
    #[error("document lock poisoned")]
    Poisoned,
}

// ───────────────────────────────────────────────────────────────────
// Listeners
// ───────────────────────────────────────────────────────────────────

pub type ChangeListener = Arc<dyn Fn(&DocChange) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, ChangeListener)>,
}

/// Keeps a change listener registered. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Same as dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut listeners) = listeners.lock() {
                listeners.entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

struct Inner {
    doc: Doc,
    text: TextRef,
    version: u64,
    next_seq: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

/// The shared text buffer of one editing session.
pub struct DocumentStore {
    doc_id: Uuid,
    inner: Mutex<Inner>,
    listeners: Arc<Mutex<Listeners>>,
}

impl DocumentStore {
    pub fn new(doc_id: Uuid) -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self {
            doc_id,
            inner: Mutex::new(Inner {
                doc,
                text,
                version: 0,
                next_seq: 1,
                pending: BTreeMap::new(),
            }),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DocumentError> {
        self.inner.lock().map_err(|_| DocumentError::Poisoned)
    }

    /// Record a local edit and produce its encoded update.
    ///
    /// The update is kept as pending until [`DocumentStore::acknowledge`]
    /// covers its sequence number.
    pub fn apply_local(&self, change: TextChange, origin: OriginTag) -> Result<LocalUpdate, DocumentError> {
        if change.is_noop() {
            return Err(DocumentError::InvalidEdit("empty edit".into()));
        }
        let offset = to_index(change.offset)?;
        let delete_len = to_index(change.delete_len)?;

        let (local, notice) = {
            let mut inner = self.lock()?;
            let current = inner.text.get_string(&inner.doc.transact());
            change.validate(&current)?;

            let update = {
                let mut txn = inner.doc.transact_mut();
                if delete_len > 0 {
                    inner.text.remove_range(&mut txn, offset, delete_len);
                }
                if !change.insert.is_empty() {
                    inner.text.insert(&mut txn, offset, &change.insert);
                }
                txn.encode_update_v1()
            };

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.version += 1;
            inner.pending.insert(seq, update.clone());

            let local = LocalUpdate { seq, update };
            let notice = DocChange {
                edit: change,
                origin: ChangeOrigin::Local {
                    tag: origin,
                    update: local.clone(),
                },
                version: inner.version,
            };
            (local, notice)
        };

        self.notify(&notice);
        Ok(local)
    }

    /// Merge an update from any replica.
    ///
    /// Returns the visible edit, or `None` when the text did not change (the
    /// update was already applied, or touched nothing visible). The version
    /// only advances with the text. Malformed updates leave the document
    /// untouched.
    pub fn apply_remote(&self, update: &[u8]) -> Result<Option<DocChange>, DocumentError> {
        check_update(update).map_err(|e| {
            log::warn!("doc {}: rejecting malformed update: {}", self.doc_id, e);
            DocumentError::MergeRejected(e.to_string())
        })?;
        let decoded = Update::decode_v1(update).map_err(|e| {
            log::warn!("doc {}: rejecting undecodable update: {}", self.doc_id, e);
            DocumentError::MergeRejected(e.to_string())
        })?;

        let notice = {
            let mut inner = self.lock()?;
            let before = inner.text.get_string(&inner.doc.transact());

            {
                let mut txn = inner.doc.transact_mut();
                txn.apply_update(decoded).map_err(|e| {
                    log::warn!("doc {}: rejecting update: {:?}", self.doc_id, e);
                    DocumentError::MergeRejected(format!("{:?}", e))
                })?;
            }

            let after = inner.text.get_string(&inner.doc.transact());
            let Some(edit) = TextEdit::between(&before, &after) else {
                log::trace!("doc {}: update left the text unchanged", self.doc_id);
                return Ok(None);
            };
            inner.version += 1;
            DocChange {
                edit,
                origin: ChangeOrigin::Remote,
                version: inner.version,
            }
        };

        self.notify(&notice);
        Ok(Some(notice))
    }

    /// Register a listener for every visible change, local or remote.
    ///
    /// Listeners run after the store's lock is released and may call back
    /// into the store.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DocChange) + Send + Sync + 'static,
    {
        let id = match self.listeners.lock() {
            Ok(mut listeners) => {
                listeners.next_id += 1;
                let id = listeners.next_id;
                listeners.entries.push((id, Arc::new(listener)));
                id
            }
            Err(_) => 0,
        };
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.entries.len()).unwrap_or(0)
    }

    fn notify(&self, change: &DocChange) {
        let snapshot: Vec<ChangeListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.entries.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(change);
        }
    }

    /// Current text. Empty if the lock is poisoned.
    pub fn snapshot(&self) -> String {
        match self.lock() {
            Ok(inner) => inner.text.get_string(&inner.doc.transact()),
            Err(_) => String::new(),
        }
    }

    /// Logical version; advances on every visible change.
    pub fn version(&self) -> u64 {
        self.lock().map(|inner| inner.version).unwrap_or(0)
    }

    /// Encoded state vector, for a SyncStep1.
    pub fn state_vector(&self) -> Result<Vec<u8>, DocumentError> {
        let inner = self.lock()?;
        let sv = inner.doc.transact().state_vector().encode_v1();
        Ok(sv)
    }

    /// Everything the holder of `state_vector` is missing, for a SyncStep2.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        check_state_vector(state_vector)
            .map_err(|e| DocumentError::MergeRejected(format!("bad state vector: {}", e)))?;
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MergeRejected(format!("bad state vector: {}", e)))?;
        let inner = self.lock()?;
        let diff = inner.doc.transact().encode_state_as_update_v1(&sv);
        Ok(diff)
    }

    /// Local updates not yet acknowledged, in sequence order.
    pub fn pending_updates(&self) -> Vec<LocalUpdate> {
        match self.lock() {
            Ok(inner) => inner
                .pending
                .iter()
                .map(|(seq, update)| LocalUpdate {
                    seq: *seq,
                    update: update.clone(),
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Drop pending updates with `seq <= up_to`.
    pub fn acknowledge(&self, up_to: u64) {
        if let Ok(mut inner) = self.lock() {
            match up_to.checked_add(1) {
                Some(first_kept) => {
                    let keep = inner.pending.split_off(&first_kept);
                    inner.pending = keep;
                }
                None => inner.pending.clear(),
            }
        }
    }

    /// Sequence number the next local edit will get.
    pub fn next_local_seq(&self) -> u64 {
        self.lock().map(|inner| inner.next_seq).unwrap_or(1)
    }
}

fn to_index(n: usize) -> Result<u32, DocumentError> {
    u32::try_from(n).map_err(|_| DocumentError::InvalidEdit(format!("offset {} too large", n)))
}
