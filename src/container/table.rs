//! The set of mounted containers in insertion and priority order.

use std::sync::Arc;

use crate::container::reader::ContainerReader;
use crate::types::{ChunkId, ContainerId};

/// Readers keyed two ways.
///
/// `by_insertion[i]` has id `i`, so ids double as stable cache-key
/// components. `by_priority` is sorted by mount order descending, then id
/// descending, and is what resolution walks.
#[derive(Debug, Default)]
pub struct ReaderTable {
    by_insertion: Vec<Arc<ContainerReader>>,
    by_priority: Vec<Arc<ContainerReader>>,
}

/// A chunk located in a specific container.
#[derive(Debug, Clone)]
pub struct ChunkLocation {
    pub reader: Arc<ContainerReader>,
    pub offset: u64,
    pub length: u64,
}

impl ReaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next inserted reader must carry.
    pub fn next_id(&self) -> ContainerId {
        ContainerId(self.by_insertion.len() as u32)
    }

    pub fn insert(&mut self, reader: Arc<ContainerReader>) {
        debug_assert_eq!(reader.id(), self.next_id());
        // Upper bound: newest reader goes ahead of older ones of equal order.
        let at = self.by_priority.partition_point(|r| {
            r.order() > reader.order() || (r.order() == reader.order() && r.id() > reader.id())
        });
        self.by_priority.insert(at, Arc::clone(&reader));
        self.by_insertion.push(reader);
    }

    /// First container in priority order holding `chunk_id`.
    pub fn resolve(&self, chunk_id: &ChunkId) -> Option<ChunkLocation> {
        self.by_priority.iter().find_map(|reader| {
            reader.resolve(chunk_id).map(|(offset, length)| ChunkLocation {
                reader: Arc::clone(reader),
                offset,
                length,
            })
        })
    }

    pub fn get(&self, id: ContainerId) -> Option<&Arc<ContainerReader>> {
        self.by_insertion.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.by_insertion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_insertion.is_empty()
    }

    pub fn iter_by_priority(&self) -> impl Iterator<Item = &Arc<ContainerReader>> {
        self.by_priority.iter()
    }

    pub fn iter_by_insertion(&self) -> impl Iterator<Item = &Arc<ContainerReader>> {
        self.by_insertion.iter()
    }
}
