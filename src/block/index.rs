// Copyright 2018 Kodebox, Inc.
// This file is part of CodeChain.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Process-wide registry of committed blocks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::H256;

use super::committed::CommittedBlock;
use crate::mem::lease::Lease;
use crate::BlockNumber;

/// Structure providing fast access to the in-memory committed blocks,
/// by state root and by number. All mutation happens under one mutex.
pub struct BlockIndex {
    inner: Mutex<Inner>,
}

struct Inner {
    by_hash: HashMap<H256, Arc<CommittedBlock>>,
    by_number: HashMap<BlockNumber, Vec<Arc<CommittedBlock>>>,
    last_finalized: BlockNumber,
}

pub(crate) enum AddOutcome {
    /// The block's leased ancestor chain (the block itself first) and
    /// its store anchor. The leases must only be dropped after the
    /// index mutex is released.
    Registered {
        chain: Vec<Lease<CommittedBlock>>,
        anchor: H256,
    },
    /// A block with the same hash is already registered; the duplicate
    /// must be released by the caller.
    Coalesced(Arc<CommittedBlock>),
}

impl BlockIndex {
    pub fn new(last_finalized: BlockNumber) -> Arc<BlockIndex> {
        Arc::new(BlockIndex {
            inner: Mutex::new(Inner {
                by_hash: HashMap::new(),
                by_number: HashMap::new(),
                last_finalized,
            }),
        })
    }

    /// Register a committed block. Same-hash registrations coalesce:
    /// the duplicate is handed back marked discardable.
    pub(crate) fn add(self: &Arc<Self>, block: Arc<CommittedBlock>) -> AddOutcome {
        let mut inner = self.inner.lock();
        if inner.by_hash.contains_key(block.hash()) {
            cdebug!(BLOCKCHAIN, "Coalescing duplicate commit of {:?}", block.hash());
            block.mark_discarded();
            return AddOutcome::Coalesced(block)
        }
        block.attach_index(self);
        let hash = *block.hash();
        inner.by_hash.insert(hash, Arc::clone(&block));
        inner.by_number.entry(block.number()).or_insert_with(Vec::new).push(block);

        let (chain, anchor) = chain_from(&inner, &hash);
        AddOutcome::Registered {
            chain,
            anchor,
        }
    }

    pub fn get(&self, hash: &H256) -> Option<Arc<CommittedBlock>> {
        self.inner.lock().by_hash.get(hash).cloned()
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.lock().by_hash.contains_key(hash)
    }

    /// The leased ancestor chain starting at `start` (inclusive), and
    /// the hash the chain bottoms out at, i.e. the root the store batch
    /// must be anchored to.
    pub(crate) fn ancestors_of(&self, start: &H256) -> (Vec<Lease<CommittedBlock>>, H256) {
        chain_from(&self.inner.lock(), start)
    }

    /// Walk parent links from `hash` down to the last finalized block
    /// and mark its number finalized. Returns the walked blocks in
    /// ascending number order; their creation leases transfer to the
    /// caller (the finalization channel).
    pub(crate) fn finalize(&self, hash: &H256) -> Vec<Arc<CommittedBlock>> {
        let mut inner = self.inner.lock();
        let block = match inner.by_hash.get(hash) {
            Some(block) => Arc::clone(block),
            None => panic!("finalize of unknown block {:?}", hash),
        };
        assert!(
            block.number() > inner.last_finalized,
            "finalize of block #{} behind the finalized #{}",
            block.number(),
            inner.last_finalized
        );

        let mut stack = Vec::new();
        let mut cursor = block;
        loop {
            stack.push(Arc::clone(&cursor));
            if cursor.number() <= inner.last_finalized + 1 {
                break
            }
            let parent = match inner.by_hash.get(cursor.parent_hash()) {
                Some(parent) => Arc::clone(parent),
                None => panic!("broken chain: missing parent {:?} while finalizing", cursor.parent_hash()),
            };
            assert!(parent.number() < cursor.number(), "parent of #{} is not older", cursor.number());
            cursor = parent;
        }
        inner.last_finalized = stack[0].number();
        stack.reverse();
        stack
    }

    /// All registered blocks carrying the given number: the canonical
    /// one plus any fork siblings.
    pub(crate) fn siblings_of(&self, number: BlockNumber) -> Vec<Arc<CommittedBlock>> {
        self.inner.lock().by_number.get(&number).cloned().unwrap_or_default()
    }

    /// Deregister, called from block cleanup once flushed and released.
    pub(crate) fn remove(&self, block: &CommittedBlock) {
        let mut inner = self.inner.lock();
        let same = |entry: &Arc<CommittedBlock>| std::ptr::eq(Arc::as_ptr(entry), block);
        if inner.by_hash.get(block.hash()).map_or(false, same) {
            inner.by_hash.remove(block.hash());
        }
        if let Some(peers) = inner.by_number.get_mut(&block.number()) {
            peers.retain(|entry| !same(entry));
            if peers.is_empty() {
                inner.by_number.remove(&block.number());
            }
        }
    }

    /// Empty the index, handing every remaining block to the caller for
    /// release. Used during shutdown.
    pub(crate) fn drain(&self) -> Vec<Arc<CommittedBlock>> {
        let mut inner = self.inner.lock();
        inner.by_number.clear();
        inner.by_hash.drain().map(|(_, block)| block).collect()
    }

    pub fn last_finalized(&self) -> BlockNumber {
        self.inner.lock().last_finalized
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn chain_from(inner: &Inner, start: &H256) -> (Vec<Lease<CommittedBlock>>, H256) {
    let mut ancestors = Vec::new();
    let mut cursor = *start;
    while let Some(block) = inner.by_hash.get(&cursor) {
        // A block mid-cleanup is as good as absent: its state already
        // reached the store.
        match Lease::try_acquire(block) {
            Some(lease) => {
                cursor = *lease.parent_hash();
                ancestors.push(lease);
            }
            None => break,
        }
    }
    (ancestors, cursor)
}
