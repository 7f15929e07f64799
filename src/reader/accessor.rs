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

//! Shared registry of read-only views keyed by state root.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::H256;

use super::view::ReadOnlyView;
use crate::backend::{Backend, ReadBatch, SharedBatch};
use crate::block::CommittedBlock;
use crate::item::account::Account;
use crate::mem::lease::Lease;
use crate::mem::pool::PagePool;

/// Views by root, plus a FIFO of store-backed views bounded by the
/// store's history depth. Reads share the lock; structural updates take
/// it exclusively and dispose replaced views outside of it.
pub struct Accessor {
    depth: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    readers: HashMap<H256, Lease<ReadOnlyView>>,
    queue: VecDeque<Lease<ReadOnlyView>>,
}

impl Accessor {
    /// Registers one view per root currently persisted in the store.
    pub(crate) fn new(db: &dyn Backend, pool: &Arc<PagePool>) -> Arc<Accessor> {
        let depth = db.history_depth() as usize;
        let mut inner = Inner {
            readers: HashMap::new(),
            queue: VecDeque::new(),
        };
        for batch in db.snapshot_all() {
            let hash = batch.metadata().state_hash;
            if hash.is_zero() {
                continue
            }
            let view = ReadOnlyView::new(hash, Vec::new(), SharedBatch::new(batch), pool);
            inner.readers.insert(hash, view.clone());
            inner.queue.push_back(view);
        }
        ctrace!(READER, "Accessor over {} persisted roots, history depth {}", inner.readers.len(), depth);
        Arc::new(Accessor {
            depth,
            inner: RwLock::new(inner),
        })
    }

    /// A leased view of the given root, while the accessor still holds
    /// one.
    pub fn view(&self, root: &H256) -> Option<Lease<ReadOnlyView>> {
        self.inner.read().readers.get(root).cloned()
    }

    pub fn get_account(&self, root: &H256, address: &H256) -> Option<Account> {
        let view = self.view(root)?;
        Some(view.get_account(address))
    }

    pub fn get_storage(&self, root: &H256, address: &H256, slot: &H256, out: &mut [u8]) -> Option<usize> {
        let view = self.view(root)?;
        Some(view.get_storage(address, slot, out))
    }

    pub fn len(&self) -> usize {
        self.inner.read().readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A block was registered in the index: serve its root from memory
    /// until it reaches the store. Returns the replaced view, which the
    /// caller disposes outside of any lock.
    pub(crate) fn on_commit_to_blockchain(&self, view: Lease<ReadOnlyView>) -> Option<Lease<ReadOnlyView>> {
        let mut inner = self.inner.write();
        inner.readers.insert(*view.hash(), view)
    }

    /// A block reached the store: swap its root over to a store-backed
    /// view, evict beyond the history depth and drop fork siblings.
    pub(crate) fn on_commit_to_database(
        &self,
        committed: &CommittedBlock,
        siblings: &[Arc<CommittedBlock>],
        db: &dyn Backend,
        pool: &Arc<PagePool>,
    ) {
        let batch = SharedBatch::new(db.begin_read_only_batch_or_latest(committed.hash(), "accessor"));
        let view = ReadOnlyView::new(*committed.hash(), Vec::new(), batch, pool);

        let mut scheduled = Vec::new();
        {
            let mut inner = self.inner.write();
            if let Some(replaced) = inner.readers.insert(*committed.hash(), view.clone()) {
                scheduled.push(replaced);
            }
            inner.queue.push_back(view);

            while inner.queue.len() > self.depth {
                let oldest = inner.queue.pop_front().expect("checked non-empty; qed");
                let still_current = inner
                    .readers
                    .get(oldest.hash())
                    .map_or(false, |current| Arc::ptr_eq(current.arc(), oldest.arc()));
                if still_current {
                    if let Some(removed) = inner.readers.remove(oldest.hash()) {
                        scheduled.push(removed);
                    }
                }
                ctrace!(READER, "Evicting view over {:?}", oldest.hash());
                scheduled.push(oldest);
            }

            for sibling in siblings {
                if sibling.hash() == committed.hash() {
                    continue
                }
                if let Some(removed) = inner.readers.remove(sibling.hash()) {
                    scheduled.push(removed);
                }
            }
        }
        // Dispose outside the lock.
        drop(scheduled);
    }

    /// Drop every held view.
    pub(crate) fn dispose(&self) {
        let views = {
            let mut inner = self.inner.write();
            let mut views: Vec<_> = inner.readers.drain().map(|(_, view)| view).collect();
            views.extend(inner.queue.drain(..));
            views
        };
        drop(views);
    }
}
