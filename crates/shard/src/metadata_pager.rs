//! Paginated two-phase scan over in-memory entries then on-disk filesets
//! (§4.11). The active phase is driven directly by the shard (it needs the
//! map/list); this module owns the page token shape and the flushed-phase
//! walk, which only needs the namespace reader manager and flush state.

use std::sync::Arc;

use crate::{
    collaborators::{
        BlockMetadataEntry,
        FilesetReader,
        NamespaceReaderManager,
    },
    types::{
        BlockStart,
        UniqueIndex,
        Volume,
    },
};

/// Two-phase page token (§6). Presence of `Flushed` implies the active
/// phase is complete; there is no combined representation because a
/// request is always either mid-active or mid-flushed, never both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageToken {
    Active {
        index_cursor: UniqueIndex,
    },
    Flushed {
        curr_block_start: BlockStart,
        curr_block_entry_idx: u64,
        volume: Volume,
    },
}

pub struct MetadataPage {
    pub results: Vec<BlockMetadataEntry>,
    pub next_token: Option<PageToken>,
}

/// Walk backward one block-size at a time from `start_block_start` (or
/// `end - block_size` if this is the first flushed-phase call), reading
/// fileset metadata until `limit` results are collected or the walk passes
/// before `start`/the retention horizon.
pub async fn flushed_phase(
    reader_manager: &dyn NamespaceReaderManager,
    start: i64,
    end: i64,
    block_size: i64,
    retention_horizon: i64,
    limit: usize,
    resume: Option<(BlockStart, u64, Volume)>,
) -> anyhow::Result<MetadataPage> {
    let mut results = Vec::new();
    let floor = start.max(retention_horizon);

    let mut block_start = match resume {
        Some((bs, _, _)) => bs,
        None => end - block_size,
    };
    let mut resume_entry_idx = resume.map(|(_, idx, _)| idx).unwrap_or(0);
    let mut resume_volume = resume.map(|(_, _, v)| v);

    while block_start >= floor {
        let volume = match resume_volume {
            Some(v) => Some(v),
            None => reader_manager.latest_volume(block_start),
        };
        if let Some(volume) = volume {
            if let Some(reader_lock) = reader_manager.get(block_start, volume).await? {
                let mut reader = reader_lock.lock().await;
                // Skip entries already returned by a prior page for this
                // block-start/volume.
                while reader.metadata_read() < resume_entry_idx {
                    if reader.read_metadata_entry().await?.is_none() {
                        break;
                    }
                }
                while results.len() < limit {
                    match reader.read_metadata_entry().await? {
                        Some(entry) => results.push(entry),
                        None => break,
                    }
                }
                let actual_volume = reader.volume();
                let read_so_far = reader.metadata_read();
                drop(reader);
                reader_manager.put(block_start, volume, reader_lock).await;

                if results.len() >= limit {
                    return Ok(MetadataPage {
                        results,
                        next_token: Some(PageToken::Flushed {
                            curr_block_start: block_start,
                            curr_block_entry_idx: read_so_far,
                            // Reflect the reader's actual volume, not the
                            // token's incoming volume: a cold flush may
                            // have advanced it mid-scan (§4.11).
                            volume: actual_volume,
                        }),
                    });
                }
            }
        }
        block_start -= block_size;
        resume_entry_idx = 0;
        resume_volume = None;
    }

    Ok(MetadataPage {
        results,
        next_token: None,
    })
}

pub fn new_reader_handle<R: FilesetReader>(reader: R) -> Arc<tokio::sync::Mutex<dyn FilesetReader>> {
    Arc::new(tokio::sync::Mutex::new(reader))
}
