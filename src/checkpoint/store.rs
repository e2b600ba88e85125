//! Abstract storage backend for checkpoint buffers.
//!
//! The engine only ever reads and writes whole byte blobs keyed by the
//! checkpoint sequence id and the kind of buffer. Anything able to honor that
//! contract (filesystem, Redis, RocksDB, ...) can serve as a backend;
//! [`MemoryStore`] is the in-process implementation used by default and in
//! tests.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::CheckpointError;
use crate::SequenceId;

/// The three buffers a checkpoint may persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Full (non-incremental) checkpoint data.
    Data,
    /// Incremental checkpoint data: base images and delta records.
    Delta,
    /// Index records locating incremental data inside the delta buffers.
    Index,
}

/// Backend contract: blob storage keyed by `(sequence id, buffer kind)`.
///
/// Implementations must make a committed blob readable by any later
/// [`get`](StateStore::get) until it is removed; partial writes must never be
/// observable.
pub trait StateStore: Send + Sync + 'static {
    fn put(
        &self,
        seq_id: SequenceId,
        kind: BufferKind,
        bytes: Vec<u8>,
    ) -> Result<(), CheckpointError>;

    fn get(&self, seq_id: SequenceId, kind: BufferKind)
        -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Drop all buffers of one checkpoint.
    fn remove(&self, seq_id: SequenceId) -> Result<(), CheckpointError>;
}

/// In-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<FxHashMap<(SequenceId, BufferKind), Arc<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl StateStore for MemoryStore {
    fn put(
        &self,
        seq_id: SequenceId,
        kind: BufferKind,
        bytes: Vec<u8>,
    ) -> Result<(), CheckpointError> {
        self.blobs.lock().insert((seq_id, kind), Arc::new(bytes));
        Ok(())
    }

    fn get(
        &self,
        seq_id: SequenceId,
        kind: BufferKind,
    ) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(self
            .blobs
            .lock()
            .get(&(seq_id, kind))
            .map(|blob| blob.as_ref().clone()))
    }

    fn remove(&self, seq_id: SequenceId) -> Result<(), CheckpointError> {
        let mut blobs = self.blobs.lock();
        blobs.retain(|(id, _), _| *id != seq_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = MemoryStore::new();
        store.put(1, BufferKind::Data, vec![1, 2, 3]).unwrap();
        store.put(1, BufferKind::Index, vec![9]).unwrap();
        store.put(2, BufferKind::Data, vec![4]).unwrap();

        assert_eq!(store.get(1, BufferKind::Data).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.get(1, BufferKind::Delta).unwrap(), None);
        assert_eq!(store.len(), 3);

        store.remove(1).unwrap();
        assert_eq!(store.get(1, BufferKind::Data).unwrap(), None);
        assert_eq!(store.get(1, BufferKind::Index).unwrap(), None);
        assert_eq!(store.get(2, BufferKind::Data).unwrap(), Some(vec![4]));
    }
}
