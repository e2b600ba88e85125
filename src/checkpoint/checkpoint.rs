//! A single checkpoint take/restore session.

use std::sync::Arc;

use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{BufferKind, ByteBuffer, CheckpointError, StateStore};
use crate::SequenceId;

/// Whether a [`Checkpoint`] is being written or read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Take,
    Restore,
}

/// Sizes of the buffers committed by one checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub data_bytes: u64,
    pub delta_bytes: u64,
    pub index_bytes: u64,
}

/// One snapshot (or restore) of an operator's state.
///
/// State serializes itself into the *data* buffer, or, while
/// [incremental mode](Checkpoint::set_incremental_mode) is active, into the
/// *delta* buffer with a matching record in the *index* buffer. On
/// [`finish`](Checkpoint::finish) all written buffers are committed to the
/// backing [`StateStore`].
///
/// In restore mode the same object hands out positioned views of this and
/// earlier checkpoints' buffers so that delta chains can be replayed; fetched
/// buffers are cached per sequence id for the duration of the session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Checkpoint {
    #[derivative(Debug = "ignore")]
    store: Arc<dyn StateStore>,
    seq_id: SequenceId,
    mode: CheckpointMode,
    /// Sequence id of the base of the current interval (own id for a base).
    base_id: SequenceId,
    incremental_interval: u32,
    /// Whether this checkpoint is the base of its interval (take mode only).
    is_base: bool,
    /// Lookahead from the interval controller: whether update logging should
    /// stay active once this checkpoint completes.
    enable_logging: bool,
    incremental_mode: bool,
    data: ByteBuffer,
    delta: ByteBuffer,
    index: ByteBuffer,
    /// Positioned views of other checkpoints' buffers, restore mode only.
    #[derivative(Debug = "ignore")]
    fetched: FxHashMap<(SequenceId, BufferKind), ByteBuffer>,
    finished: bool,
}

impl Checkpoint {
    pub(crate) fn for_take(
        store: Arc<dyn StateStore>,
        seq_id: SequenceId,
        base_id: SequenceId,
        incremental_interval: u32,
        is_base: bool,
        enable_logging: bool,
    ) -> Self {
        Self {
            store,
            seq_id,
            mode: CheckpointMode::Take,
            base_id,
            incremental_interval,
            is_base,
            enable_logging,
            incremental_mode: false,
            data: ByteBuffer::new(),
            delta: ByteBuffer::new(),
            index: ByteBuffer::new(),
            fetched: FxHashMap::default(),
            finished: false,
        }
    }

    pub(crate) fn for_restore(
        store: Arc<dyn StateStore>,
        seq_id: SequenceId,
        incremental_interval: u32,
    ) -> Result<Self, CheckpointError> {
        let data = store
            .get(seq_id, BufferKind::Data)?
            .map(ByteBuffer::from_vec)
            .unwrap_or_default();
        let delta = store
            .get(seq_id, BufferKind::Delta)?
            .map(ByteBuffer::from_vec)
            .unwrap_or_default();
        let index = store
            .get(seq_id, BufferKind::Index)?
            .map(ByteBuffer::from_vec)
            .unwrap_or_default();
        Ok(Self {
            store,
            seq_id,
            mode: CheckpointMode::Restore,
            base_id: 0,
            incremental_interval,
            is_base: false,
            enable_logging: false,
            incremental_mode: false,
            data,
            delta,
            index,
            fetched: FxHashMap::default(),
            finished: false,
        })
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn mode(&self) -> CheckpointMode {
        self.mode
    }

    /// Whether this checkpoint is the base of its interval. Meaningful only
    /// while taking a checkpoint.
    pub fn is_base(&self) -> bool {
        self.is_base
    }

    /// Whether update logging should be active after this checkpoint.
    pub fn should_enable_logging(&self) -> bool {
        self.enable_logging
    }

    pub fn incremental_interval(&self) -> u32 {
        self.incremental_interval
    }

    pub fn base_id(&self) -> SequenceId {
        self.base_id
    }

    pub fn is_incremental_mode(&self) -> bool {
        self.incremental_mode
    }

    /// Route subsequent writes (or reads) to the delta buffer.
    pub fn set_incremental_mode(&mut self) {
        self.incremental_mode = true;
    }

    pub fn unset_incremental_mode(&mut self) {
        self.incremental_mode = false;
    }

    /// Current write offset in the delta buffer.
    pub(crate) fn delta_offset(&self) -> u64 {
        self.delta.content_size()
    }

    /// Current write offset in the index buffer.
    pub(crate) fn index_offset(&self) -> u64 {
        self.index.content_size()
    }

    /// The index buffer of this checkpoint.
    pub(crate) fn index_mut(&mut self) -> &mut ByteBuffer {
        &mut self.index
    }

    fn active(&mut self) -> &mut ByteBuffer {
        if self.incremental_mode {
            &mut self.delta
        } else {
            &mut self.data
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.active().write_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.active().write_u64(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.active().write_i64(value);
    }

    pub fn write_vu64(&mut self, value: u64) {
        self.active().write_vu64(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.active().write_bool(value);
    }

    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<(), CheckpointError> {
        self.active().write_value(value)
    }

    pub fn write_marker(&mut self, marker: &str) {
        self.active().write_marker(marker);
    }

    pub fn read_u32(&mut self) -> Result<u32, CheckpointError> {
        self.active().read_u32()
    }

    pub fn read_u64(&mut self) -> Result<u64, CheckpointError> {
        self.active().read_u64()
    }

    pub fn read_i64(&mut self) -> Result<i64, CheckpointError> {
        self.active().read_i64()
    }

    pub fn read_vu64(&mut self) -> Result<u64, CheckpointError> {
        self.active().read_vu64()
    }

    pub fn read_bool(&mut self) -> Result<bool, CheckpointError> {
        self.active().read_bool()
    }

    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T, CheckpointError> {
        self.active().read_value()
    }

    pub fn verify_marker(&mut self, marker: &str) -> Result<(), CheckpointError> {
        self.active().verify_marker(marker)
    }

    /// The index buffer of this checkpoint, for reading records back in the
    /// order they were written. Restore mode only.
    pub(crate) fn own_index_buffer(&mut self) -> Result<&mut ByteBuffer, CheckpointError> {
        if self.mode != CheckpointMode::Restore {
            return Err(CheckpointError::WrongMode("taking a checkpoint"));
        }
        Ok(&mut self.index)
    }

    fn fetched_buffer(
        &mut self,
        seq_id: SequenceId,
        kind: BufferKind,
        offset: u64,
    ) -> Result<&mut ByteBuffer, CheckpointError> {
        if self.mode != CheckpointMode::Restore {
            return Err(CheckpointError::WrongMode("taking a checkpoint"));
        }
        if !self.fetched.contains_key(&(seq_id, kind)) {
            let bytes = self
                .store
                .get(seq_id, kind)?
                .ok_or(CheckpointError::MissingBuffer { seq_id, kind })?;
            self.fetched
                .insert((seq_id, kind), ByteBuffer::from_vec(bytes));
        }
        let buf = self.fetched.get_mut(&(seq_id, kind)).unwrap();
        buf.seek(offset)?;
        Ok(buf)
    }

    /// A view of the index buffer of checkpoint `seq_id` positioned at
    /// `offset`, for walking a delta chain. Restore mode only.
    pub(crate) fn index_buffer(
        &mut self,
        seq_id: SequenceId,
        offset: u64,
    ) -> Result<&mut ByteBuffer, CheckpointError> {
        if seq_id == self.seq_id {
            self.index.seek(offset)?;
            Ok(&mut self.index)
        } else {
            self.fetched_buffer(seq_id, BufferKind::Index, offset)
        }
    }

    /// A view of the delta buffer of checkpoint `seq_id` positioned at
    /// `offset`, for replaying base images and delta records. Restore mode
    /// only.
    pub(crate) fn delta_buffer(
        &mut self,
        seq_id: SequenceId,
        offset: u64,
    ) -> Result<&mut ByteBuffer, CheckpointError> {
        if seq_id == self.seq_id {
            self.delta.seek(offset)?;
            Ok(&mut self.delta)
        } else {
            self.fetched_buffer(seq_id, BufferKind::Delta, offset)
        }
    }

    /// Commit all written buffers to the store.
    pub fn finish(&mut self) -> Result<CheckpointStats, CheckpointError> {
        if self.mode != CheckpointMode::Restore && !self.finished {
            if self.data.content_size() > 0 {
                self.store
                    .put(self.seq_id, BufferKind::Data, self.data.as_slice().to_vec())?;
            }
            if self.delta.content_size() > 0 {
                self.store.put(
                    self.seq_id,
                    BufferKind::Delta,
                    self.delta.as_slice().to_vec(),
                )?;
            }
            if self.index.content_size() > 0 {
                self.store.put(
                    self.seq_id,
                    BufferKind::Index,
                    self.index.as_slice().to_vec(),
                )?;
            }
            self.finished = true;
            tracing::trace!(
                seq_id = self.seq_id,
                data = self.data.content_size(),
                delta = self.delta.content_size(),
                index = self.index.content_size(),
                "checkpoint committed"
            );
        }
        Ok(CheckpointStats {
            data_bytes: self.data.content_size(),
            delta_bytes: self.delta.content_size(),
            index_bytes: self.index.content_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryStore;

    #[test]
    fn take_and_restore_plain_data() {
        let store = Arc::new(MemoryStore::new());
        let mut ckpt = Checkpoint::for_take(store.clone(), 1, 1, 1, true, false);
        ckpt.write_marker("op");
        ckpt.write_value(&vec![1u64, 2, 3]).unwrap();
        ckpt.finish().unwrap();

        let mut back = Checkpoint::for_restore(store, 1, 1).unwrap();
        back.verify_marker("op").unwrap();
        let data: Vec<u64> = back.read_value().unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn incremental_mode_routes_to_delta_buffer() {
        let store = Arc::new(MemoryStore::new());
        let mut ckpt = Checkpoint::for_take(store.clone(), 3, 3, 2, true, true);
        ckpt.write_u64(10);
        ckpt.set_incremental_mode();
        ckpt.write_u64(20);
        ckpt.unset_incremental_mode();
        let stats = ckpt.finish().unwrap();
        assert_eq!(stats.data_bytes, 8);
        assert_eq!(stats.delta_bytes, 8);

        let mut back = Checkpoint::for_restore(store, 3, 2).unwrap();
        assert_eq!(back.read_u64().unwrap(), 10);
        let delta = back.delta_buffer(3, 0).unwrap();
        assert_eq!(delta.read_u64().unwrap(), 20);
    }

    #[test]
    fn fetched_buffers_are_cached() {
        let store = Arc::new(MemoryStore::new());
        let mut old = Checkpoint::for_take(store.clone(), 1, 1, 2, true, true);
        old.set_incremental_mode();
        old.write_u64(99);
        old.finish().unwrap();

        let mut cur = Checkpoint::for_restore(store, 2, 2).unwrap();
        assert_eq!(cur.delta_buffer(1, 0).unwrap().read_u64().unwrap(), 99);
        // second access re-seeks the cached view
        assert_eq!(cur.delta_buffer(1, 0).unwrap().read_u64().unwrap(), 99);
    }

    #[test]
    fn missing_buffer_is_typed() {
        let store = Arc::new(MemoryStore::new());
        let mut cur = Checkpoint::for_restore(store, 5, 2).unwrap();
        assert!(matches!(
            cur.delta_buffer(4, 0),
            Err(CheckpointError::MissingBuffer { seq_id: 4, .. })
        ));
    }
}
