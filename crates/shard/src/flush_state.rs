//! Per-block-start flush state machine (§3 "FlushState", §4.9).
//!
//! Guarded by its own reader/writer lock (§5), separate from the shard
//! lock, to avoid a lock-ordering cycle: Tick snapshots block state while
//! already holding the shard lock, taking the `FlushState` lock only for
//! the duration of the copy.

use std::collections::BTreeMap;

use crate::{
    collaborators::{
        BlockStateEntry,
        BlockStateSnapshot,
    },
    types::{
        BlockStart,
        Volume,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlushStatus {
    #[default]
    NotStarted,
    InProgress,
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WarmStatus {
    pub data_flushed: FlushStatus,
    pub index_flushed: FlushStatus,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlockFlushState {
    pub warm_status: WarmStatus,
    pub cold_version_retrievable: Volume,
    pub cold_version_flushed: Volume,
    pub num_failures: u32,
}

impl BlockFlushState {
    fn warm_retrievable(&self, index_enabled: bool) -> bool {
        self.warm_status.data_flushed == FlushStatus::Success
            && (!index_enabled || self.warm_status.index_flushed == FlushStatus::Success)
    }
}

#[derive(Default)]
pub struct FlushState {
    states_by_time: BTreeMap<BlockStart, BlockFlushState>,
    initialized: bool,
}

impl FlushState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn get(&self, block_start: BlockStart) -> BlockFlushState {
        self.states_by_time.get(&block_start).copied().unwrap_or_default()
    }

    fn entry_mut(&mut self, block_start: BlockStart) -> &mut BlockFlushState {
        self.states_by_time.entry(block_start).or_default()
    }

    pub fn block_starts(&self) -> Vec<BlockStart> {
        self.states_by_time.keys().copied().collect()
    }

    /// Bootstrap (§4.10): an info file was found at `block_start` with
    /// `volume_index`; mark the warm data flush Success and raise both cold
    /// versions to at least `volume_index`.
    pub fn record_info_file(&mut self, block_start: BlockStart, volume_index: Volume) {
        let state = self.entry_mut(block_start);
        state.warm_status.data_flushed = FlushStatus::Success;
        state.cold_version_flushed = state.cold_version_flushed.max(volume_index);
        state.cold_version_retrievable = state.cold_version_retrievable.max(volume_index);
    }

    /// Bootstrap (§4.10): `block_start` falls inside an index-flushed
    /// index-block boundary; mark its index flush Success.
    pub fn mark_index_flushed(&mut self, block_start: BlockStart) {
        self.entry_mut(block_start).warm_status.index_flushed = FlushStatus::Success;
    }

    pub fn set_warm_data_status(&mut self, block_start: BlockStart, status: FlushStatus) {
        let state = self.entry_mut(block_start);
        state.warm_status.data_flushed = status;
        if status == FlushStatus::Failed {
            state.num_failures += 1;
        }
    }

    /// §4.9 `finishWriting` steps 1-2 (the parts that only touch state; the
    /// lease notification and step-4 advance happen in the shard runtime,
    /// which calls `advance_cold_retrievable` after the lease manager call
    /// succeeds).
    pub fn mark_warm_success(&mut self, block_start: BlockStart) {
        let state = self.entry_mut(block_start);
        state.warm_status.data_flushed = FlushStatus::Success;
        state.warm_status.index_flushed = FlushStatus::Success;
    }

    pub fn advance_cold_flushed(&mut self, block_start: BlockStart, next_version: Volume) {
        let state = self.entry_mut(block_start);
        state.cold_version_flushed = state.cold_version_flushed.max(next_version);
    }

    pub fn advance_cold_retrievable(&mut self, block_start: BlockStart, next_version: Volume) {
        let state = self.entry_mut(block_start);
        state.cold_version_retrievable = state.cold_version_retrievable.max(next_version);
    }

    /// Entries older than the retention horizon (less `retention_blocks`
    /// blocks of slack) are pruned on each Tick.
    pub fn prune(&mut self, retention_horizon: BlockStart, block_size: i64, retention_blocks: usize) {
        let floor = retention_horizon.saturating_sub(block_size.saturating_mul(retention_blocks as i64));
        self.states_by_time.retain(|&block_start, _| block_start >= floor);
    }

    pub fn snapshot(&self, index_enabled: bool) -> BlockStateSnapshot {
        BlockStateSnapshot {
            bootstrapped: self.initialized,
            blocks: self
                .states_by_time
                .iter()
                .map(|(&block_start, state)| {
                    (
                        block_start,
                        BlockStateEntry {
                            warm_retrievable: state.warm_retrievable(index_enabled),
                            cold_version: state.cold_version_retrievable,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_versions_are_monotonic_under_repeated_advance() {
        let mut state = FlushState::new();
        state.advance_cold_flushed(0, 3);
        state.advance_cold_flushed(0, 1);
        assert_eq!(state.get(0).cold_version_flushed, 3);
        state.advance_cold_retrievable(0, 2);
        state.advance_cold_retrievable(0, 5);
        assert_eq!(state.get(0).cold_version_retrievable, 5);
    }

    #[test]
    fn prune_drops_entries_before_floor() {
        let mut state = FlushState::new();
        state.record_info_file(0, 1);
        state.record_info_file(1000, 1);
        state.prune(1000, 100, 2);
        assert_eq!(state.block_starts(), vec![1000]);
    }

    #[test]
    fn warm_retrievable_requires_index_flush_when_index_enabled() {
        let mut state = FlushState::new();
        state.set_warm_data_status(0, FlushStatus::Success);
        let snap = state.snapshot(true);
        assert!(!snap.blocks[&0].warm_retrievable);
        state.mark_index_flushed(0);
        let snap = state.snapshot(true);
        assert!(snap.blocks[&0].warm_retrievable);
    }
}
