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

//! The versioned block-state store: lifecycle, forking, finalization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use parking_lot::RwLock;
use primitive_types::H256;

use crate::backend::{Backend, ReadBatch, SharedBatch};
use crate::block::{BlockIndex, CommittedBlock, LiveBlock};
use crate::error::Error;
use crate::flusher::Flusher;
use crate::key::normalize_root;
use crate::mem::lease::{release_raw, Lease};
use crate::mem::pool::{PagePool, PAGE_SIZE};
use crate::precommit::{CacheBudget, PreCommit};
use crate::raw::RawState;
use crate::reader::{Accessor, ReadOnlyView};
use crate::BlockNumber;

/// Tuning knobs of the block-state store.
#[derive(Clone)]
pub struct BlockstateConfig {
    /// How long one flusher drain keeps accepting further blocks before
    /// fsyncing.
    pub min_flush_delay: Duration,
    pub cache_budget_state_and_storage: CacheBudget,
    pub cache_budget_pre_commit: CacheBudget,
    /// Bound of the finalization queue; unbounded when absent. A full
    /// bounded queue makes `finalize` wait.
    pub finalization_queue_limit: Option<u32>,
}

impl Default for BlockstateConfig {
    fn default() -> Self {
        Self {
            min_flush_delay: Duration::from_secs(1),
            cache_budget_state_and_storage: CacheBudget::entries(1000),
            cache_budget_pre_commit: CacheBudget::entries(2000),
            finalization_queue_limit: None,
        }
    }
}

/// Represents what has to be handled by an actor listening to store
/// events.
pub trait ChainNotify: Send + Sync {
    /// fires when the flusher made a run of blocks durable.
    fn flushed(&self, _number: BlockNumber, _hash: H256) {
        // does nothing by default
    }

    /// fires when the flusher died; no further progress will be made.
    fn flusher_failure(&self, _error: &Error) {
        // does nothing by default
    }
}

/// State shared between the facade, live blocks, the flusher and the
/// accessor.
pub(crate) struct ChainShared {
    pub db: Arc<dyn Backend>,
    pub behavior: Arc<dyn PreCommit>,
    pub pool: Arc<PagePool>,
    pub index: Arc<BlockIndex>,
    pub accessor: RwLock<Option<Arc<Accessor>>>,
    pub notify: RwLock<Vec<Weak<dyn ChainNotify>>>,
    pub config: BlockstateConfig,
    pub verify_on_commit: AtomicBool,
}

impl ChainShared {
    /// Register a freshly committed block, coalescing same-hash
    /// duplicates, and keep the accessor serving the new root.
    pub fn register(self: &Arc<Self>, block: Arc<CommittedBlock>) {
        use crate::block::AddOutcome;

        match self.index.add(block) {
            AddOutcome::Registered {
                chain,
                anchor,
            } => {
                let replaced = {
                    let accessor = self.accessor.read();
                    match accessor.as_ref() {
                        Some(accessor) => {
                            let hash = *chain[0].hash();
                            let batch =
                                SharedBatch::new(self.db.begin_read_only_batch_or_latest(&anchor, "accessor"));
                            let view = ReadOnlyView::new(hash, chain, batch, &self.pool);
                            accessor.on_commit_to_blockchain(view)
                        }
                        None => None,
                    }
                };
                // Lease drops run their cleanup here, with no lock held.
                drop(replaced);
            }
            AddOutcome::Coalesced(duplicate) => release_raw(&*duplicate),
        }
    }

    /// Post-flush bookkeeping for one block: retire fork siblings and
    /// hand the root over to store-backed reads.
    pub fn after_flush(&self, block: &Arc<CommittedBlock>) {
        let siblings = self.index.siblings_of(block.number());
        {
            let accessor = self.accessor.read();
            if let Some(accessor) = accessor.as_ref() {
                accessor.on_commit_to_database(block, &siblings, &*self.db, &self.pool);
            }
        }
        // Release the commit-time lease of the flushed block and of
        // every sibling that lost the fork; cleanup may take the index
        // mutex, so this happens outside of it.
        for sibling in siblings {
            release_raw(&*sibling);
        }
    }

    pub fn notify<F: Fn(&dyn ChainNotify)>(&self, f: F) {
        for listener in self.notify.read().iter() {
            if let Some(listener) = listener.upgrade() {
                f(&*listener);
            }
        }
    }
}

/// The in-memory, versioned state layer between execution and the paged
/// store.
pub struct Blockchain {
    shared: Arc<ChainShared>,
    sender: Option<Sender<Arc<CommittedBlock>>>,
    flusher: Option<Flusher>,
}

impl Blockchain {
    pub fn new(db: Arc<dyn Backend>, behavior: Arc<dyn PreCommit>, config: BlockstateConfig) -> Blockchain {
        let pool = Arc::new(PagePool::new());
        let last_finalized = db.begin_read_only_batch("init").metadata().block_number;
        let index = BlockIndex::new(last_finalized);

        let (sender, receiver) = match config.finalization_queue_limit {
            Some(limit) => bounded(limit as usize),
            None => unbounded(),
        };

        let shared = Arc::new(ChainShared {
            db,
            behavior,
            pool,
            index,
            accessor: RwLock::new(None),
            notify: RwLock::new(Vec::new()),
            config,
            verify_on_commit: AtomicBool::new(false),
        });
        let flusher = Flusher::spawn(Arc::clone(&shared), receiver);

        cinfo!(BLOCKCHAIN, "Block-state store opened, last finalized #{}", last_finalized);
        Blockchain {
            shared,
            sender: Some(sender),
            flusher: Some(flusher),
        }
    }

    /// Fork a new live block on top of `parent_hash`.
    pub fn start_new(&self, parent_hash: &H256) -> Result<LiveBlock, Error> {
        let parent = normalize_root(*parent_hash);
        let (ancestors, anchor) = self.shared.index.ancestors_of(&parent);
        if ancestors.is_empty() && !parent.is_zero() && !self.shared.db.has_state(&parent) {
            return Err(Error::MissingParent(parent))
        }
        let batch = SharedBatch::new(self.shared.db.begin_read_only_batch_or_latest(&anchor, "live block"));
        Ok(LiveBlock::new(Arc::clone(&self.shared), parent, ancestors, batch))
    }

    /// A stable read handle over the given state root.
    pub fn start_read_only(&self, hash: &H256) -> Result<Lease<ReadOnlyView>, Error> {
        let root = normalize_root(*hash);
        let (ancestors, anchor) = self.shared.index.ancestors_of(&root);
        if ancestors.is_empty() && !root.is_zero() && !self.shared.db.has_state(&root) {
            return Err(Error::MissingParent(root))
        }
        let batch = SharedBatch::new(self.shared.db.begin_read_only_batch_or_latest(&anchor, "read only"));
        Ok(ReadOnlyView::new(root, ancestors, batch, &self.shared.pool))
    }

    /// A read handle over whatever root the store currently reports.
    pub fn start_read_only_latest_from_db(&self) -> Lease<ReadOnlyView> {
        let batch = SharedBatch::new(self.shared.db.begin_read_only_batch("latest"));
        let hash = batch.metadata().state_hash;
        ReadOnlyView::new(hash, Vec::new(), batch, &self.shared.pool)
    }

    /// The bulk-import path writing straight into store batches.
    pub fn start_raw(&self) -> RawState {
        RawState::new(Arc::clone(&self.shared))
    }

    /// Finalize the chain ending at `hash`: every in-memory block from
    /// the last finalized one up is queued for flushing, in ascending
    /// number order. Waits when the bounded queue is full.
    pub fn finalize(&self, hash: &H256) {
        let sender = self.sender.as_ref().expect("finalize after shutdown");
        let blocks = self.shared.index.finalize(&normalize_root(*hash));
        for block in blocks {
            let mut item = block;
            loop {
                match sender.try_send(item) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        item = back;
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(TrySendError::Disconnected(back)) => {
                        cwarn!(BLOCKCHAIN, "Finalization channel closed; dropping block #{}", back.number());
                        release_raw(&*back);
                        break
                    }
                }
            }
        }
    }

    /// Whether the root is readable, in memory or from the store.
    pub fn has_state(&self, hash: &H256) -> bool {
        let root = normalize_root(*hash);
        self.shared.index.contains(&root) || self.shared.db.has_state(&root)
    }

    pub fn build_read_only_accessor(&self) -> Arc<Accessor> {
        let accessor = Accessor::new(&*self.shared.db, &self.shared.pool);
        *self.shared.accessor.write() = Some(Arc::clone(&accessor));
        accessor
    }

    /// Make the flusher verify store pages before every batch commit.
    pub fn verify_db_integrity_on_commit(&self) {
        self.shared.verify_on_commit.store(true, Ordering::Relaxed);
    }

    pub fn add_notify(&self, listener: Weak<dyn ChainNotify>) {
        self.shared.notify.write().push(listener);
    }

    pub fn last_finalized(&self) -> BlockNumber {
        self.shared.index.last_finalized()
    }

    /// Heap held in pool pages.
    pub fn mem_used(&self) -> usize {
        self.shared.pool.outstanding() * PAGE_SIZE
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ChainShared> {
        &self.shared
    }

    /// Drain the flusher, dispose the accessor, release every remaining
    /// committed block. Panics when read leases are still outstanding.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        ctrace!(SHUTDOWN, "Closing block-state store");
        drop(self.sender.take());
        if let Some(flusher) = self.flusher.take() {
            flusher.join();
        }
        if let Some(accessor) = self.shared.accessor.write().take() {
            accessor.dispose();
        }
        for block in self.shared.index.drain() {
            block.mark_discarded();
            release_raw(&*block);
        }
        if !thread::panicking() {
            assert_eq!(
                0,
                self.shared.pool.outstanding(),
                "dispose with outstanding leases: pool pages still rented"
            );
        }
        ctrace!(SHUTDOWN, "Block-state store closed");
    }
}

impl Drop for Blockchain {
    fn drop(&mut self) {
        if self.sender.is_some() || self.flusher.is_some() {
            self.shutdown_impl();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    use super::*;
    use crate::item::account::Account;
    use crate::key::EMPTY_TREE_HASH;
    use crate::tests::{flush_watcher, open_chain_with, random_hash};
    use crossbeam_channel::Receiver;
    use primitive_types::U256;
    use rlp::Encodable;

    fn account(balance: u64, nonce: u64) -> Account {
        Account::new(balance.into(), nonce, H256::zero(), EMPTY_TREE_HASH)
    }

    /// The flusher may cover one finalize in several drain runs; wait
    /// until the given height is durable.
    fn wait_for_flush(flushed: &Receiver<(BlockNumber, H256)>, number: BlockNumber) -> H256 {
        loop {
            let (flushed_number, hash) = flushed.recv_timeout(Duration::from_secs(5)).unwrap();
            if flushed_number >= number {
                return hash
            }
        }
    }

    fn quick_config() -> BlockstateConfig {
        BlockstateConfig {
            min_flush_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn storage_of(view: &ReadOnlyView, address: &H256, slot: &H256) -> Vec<u8> {
        let mut out = [0u8; 64];
        let written = view.get_storage(address, slot, &mut out);
        out[..written].to_vec()
    }

    #[test]
    fn single_block() {
        let (chain, db) = open_chain_with(quick_config(), 4, false);
        let (watcher, flushed) = flush_watcher();
        chain.add_notify(Arc::downgrade(&watcher) as Weak<dyn ChainNotify>);

        let address = random_hash();
        let mut block = chain.start_new(&H256::zero()).unwrap();
        block.set_account(&address, &account(100, 1), true);
        let h1 = block.commit(1);
        assert_ne!(EMPTY_TREE_HASH, h1);
        assert!(chain.has_state(&h1));

        chain.finalize(&h1);
        let (number, hash) = flushed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((1, h1), (number, hash));
        assert!(db.has_state(&h1));
        assert!(db.flush_count() > 0);

        let view = chain.start_read_only(&h1).unwrap();
        let read = view.get_account(&address);
        assert_eq!(U256::from(100), *read.balance());
        assert_eq!(1, read.nonce());
        assert_eq!(H256::zero(), *read.code_hash());
        drop(view);

        chain.shutdown();
    }

    #[test]
    fn two_block_chain_shadows_parent() {
        let (chain, _db) = open_chain_with(quick_config(), 1, false);
        let accessor = chain.build_read_only_accessor();
        let (watcher, flushed) = flush_watcher();
        chain.add_notify(Arc::downgrade(&watcher) as Weak<dyn ChainNotify>);

        let address = random_hash();
        let slot = random_hash();

        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(100, 1), true);
        let h1 = b1.commit(1);

        let mut b2 = chain.start_new(&h1).unwrap();
        let seen = b2.get_account(&address);
        assert_eq!(U256::from(100), *seen.balance());
        b2.set_account(&address, &account(200, 2), false);
        b2.set_storage(&address, &slot, &[0xAA]);
        let h2 = b2.commit(2);
        assert_ne!(h1, h2);

        // Both roots are readable in memory, each seeing its own era.
        let v2 = chain.start_read_only(&h2).unwrap();
        assert_eq!(U256::from(200), *v2.get_account(&address).balance());
        assert_eq!(vec![0xAA], storage_of(&v2, &address, &slot));
        let v1 = chain.start_read_only(&h1).unwrap();
        assert_eq!(U256::from(100), *v1.get_account(&address).balance());
        assert_eq!(0, storage_of(&v1, &address, &slot).len());
        drop(v1);
        drop(v2);

        assert_eq!(U256::from(100), *accessor.get_account(&h1, &address).unwrap().balance());

        chain.finalize(&h2);
        wait_for_flush(&flushed, 2);

        // History depth is 1: the older root fell out of the accessor.
        assert!(accessor.get_account(&h1, &address).is_none());
        let fresh = accessor.view(&h2).unwrap();
        assert!(fresh.is_db_backed());
        assert_eq!(U256::from(200), *fresh.get_account(&address).balance());
        drop(fresh);
        drop(accessor);

        chain.shutdown();
    }

    #[test]
    fn destroy_account_wins_over_ancestors() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();
        let slot = random_hash();
        let slot2 = random_hash();

        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(100, 1), true);
        b1.set_storage(&address, &slot, &[0xAA]);
        let h1 = b1.commit(1);

        let mut b2 = chain.start_new(&h1).unwrap();
        b2.set_storage(&address, &slot2, &[0xBB]);
        b2.destroy_account(&address);
        let h2 = b2.commit(2);

        let view = chain.start_read_only(&h2).unwrap();
        assert!(view.get_account(&address).is_null());
        assert_eq!(0, storage_of(&view, &address, &slot).len());
        assert_eq!(0, storage_of(&view, &address, &slot2).len());
        drop(view);

        // Descendants observe the destruction too.
        let mut b3 = chain.start_new(&h2).unwrap();
        assert!(b3.get_account(&address).is_null());
        let mut out = [0u8; 64];
        assert_eq!(0, b3.get_storage(&address, &slot, &mut out));

        // Re-creation revives the subtree from scratch.
        b3.set_account(&address, &account(5, 1), true);
        b3.set_storage(&address, &slot, &[0xCC]);
        let h3 = b3.commit(3);
        let view = chain.start_read_only(&h3).unwrap();
        assert_eq!(U256::from(5), *view.get_account(&address).balance());
        assert_eq!(vec![0xCC], storage_of(&view, &address, &slot));
        assert_eq!(0, storage_of(&view, &address, &slot2).len());
        drop(view);

        chain.shutdown();
    }

    #[test]
    fn fork_loser_is_dropped() {
        let (chain, db) = open_chain_with(quick_config(), 4, false);
        let accessor = chain.build_read_only_accessor();
        let (watcher, flushed) = flush_watcher();
        chain.add_notify(Arc::downgrade(&watcher) as Weak<dyn ChainNotify>);

        let address = random_hash();
        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(1, 1), true);
        let h1 = b1.commit(1);

        let mut fork_a = chain.start_new(&h1).unwrap();
        fork_a.set_account(&address, &account(10, 2), false);
        let ha = fork_a.commit(2);

        let mut fork_b = chain.start_new(&h1).unwrap();
        fork_b.set_account(&address, &account(20, 2), false);
        let hb = fork_b.commit(2);
        assert_ne!(ha, hb);
        assert!(chain.has_state(&hb));

        chain.finalize(&ha);
        wait_for_flush(&flushed, 2);

        assert!(db.has_state(&ha));
        assert!(!db.has_state(&hb));
        assert!(!chain.has_state(&hb));
        assert!(accessor.view(&hb).is_none());
        assert!(accessor.view(&ha).is_some());
        drop(accessor);

        chain.shutdown();
    }

    #[test]
    fn prefetched_reads_match_plain_reads() {
        let address = random_hash();
        let slot = random_hash();
        let other = random_hash();

        let run = |prefetch: bool| -> (H256, Vec<u8>, Vec<u8>) {
            let (chain, _db) = open_chain_with(quick_config(), 4, prefetch);
            let mut b1 = chain.start_new(&H256::zero()).unwrap();
            b1.set_account(&address, &account(7, 1), true);
            b1.set_storage(&address, &slot, &[0xAB, 0xCD]);
            let h1 = b1.commit(1);

            let mut b2 = chain.start_new(&h1).unwrap();
            if let Some(prefetcher) = b2.open_prefetcher() {
                assert!(prefetch);
                prefetcher.prefetch_storage(&address, &slot);
                prefetcher.prefetch_account(&other);
                // Repeated hints deduplicate silently.
                prefetcher.prefetch_storage(&address, &slot);
            } else {
                assert!(!prefetch);
            }
            b2.set_storage(&address, &slot, &[0xEE]);
            let h2 = b2.commit(2);

            let view = chain.start_read_only(&h2).unwrap();
            let value = storage_of(&view, &address, &slot);
            let raw_account = view.get_account(&address).rlp_bytes().to_vec();
            drop(view);
            chain.shutdown();
            (h2, value, raw_account)
        };

        let plain = run(false);
        let prefetched = run(true);
        assert_eq!(plain, prefetched);
    }

    #[test]
    fn empty_first_block_is_swallowed() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let block = chain.start_new(&H256::zero()).unwrap();
        let hash = block.commit(1);
        assert_eq!(EMPTY_TREE_HASH, hash);
        assert_eq!(0, chain.shared().index.len());
        chain.shutdown();
    }

    #[test]
    #[should_panic(expected = "without a state change")]
    fn unchanged_commit_is_a_programming_error() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();
        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(1, 1), true);
        let h1 = b1.commit(1);

        let b2 = chain.start_new(&h1).unwrap();
        let _ = b2.commit(2);
    }

    #[test]
    fn read_through_a_longer_chain() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();
        let slot = random_hash();

        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(1, 1), true);
        b1.set_storage(&address, &slot, &[0x01]);
        let h1 = b1.commit(1);

        let mut b2 = chain.start_new(&h1).unwrap();
        b2.set_account(&address, &account(2, 2), false);
        let h2 = b2.commit(2);

        let mut b3 = chain.start_new(&h2).unwrap();
        // An empty write deletes the cell.
        b3.set_storage(&address, &slot, &[]);
        b3.set_account(&address, &account(3, 3), false);
        let h3 = b3.commit(3);

        let view = chain.start_read_only(&h3).unwrap();
        assert_eq!(U256::from(3), *view.get_account(&address).balance());
        assert_eq!(0, storage_of(&view, &address, &slot).len());
        let view2 = chain.start_read_only(&h2).unwrap();
        assert_eq!(vec![0x01], storage_of(&view2, &address, &slot));
        drop(view);
        drop(view2);

        chain.shutdown();
    }

    #[test]
    fn untouched_keys_skip_ancestor_probes() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();
        let stranger = random_hash();

        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(1, 1), true);
        let h1 = b1.commit(1);

        let committed = chain.shared().index.get(&h1).unwrap();
        let mut b2 = chain.start_new(&h1).unwrap();

        let probes_before = committed.dict().probe_count();
        let read = b2.get_account(&stranger);
        assert!(read.is_null());
        assert_eq!(probes_before, committed.dict().probe_count());

        let seen = b2.get_account(&address);
        assert_eq!(U256::from(1), *seen.balance());
        assert!(committed.dict().probe_count() > probes_before);

        drop(committed);
        drop(b2);
        chain.shutdown();
    }

    #[test]
    fn same_hash_commits_coalesce() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();

        let mut first = chain.start_new(&H256::zero()).unwrap();
        first.set_account(&address, &account(9, 1), true);
        let h_first = first.commit(1);

        let mut second = chain.start_new(&H256::zero()).unwrap();
        second.set_account(&address, &account(9, 1), true);
        let h_second = second.commit(1);

        assert_eq!(h_first, h_second);
        assert_eq!(1, chain.shared().index.len());
        chain.shutdown();
    }

    #[test]
    fn flusher_applies_in_ascending_order() {
        let (chain, db) = open_chain_with(quick_config(), 8, false);
        let (watcher, flushed) = flush_watcher();
        chain.add_notify(Arc::downgrade(&watcher) as Weak<dyn ChainNotify>);

        let address = random_hash();
        let mut parent = H256::zero();
        let mut roots = Vec::new();
        for number in 1..=4u64 {
            let mut block = chain.start_new(&parent).unwrap();
            block.set_account(&address, &account(number, number), number == 1);
            parent = block.commit(number);
            roots.push(parent);
        }

        chain.finalize(&parent);
        let hash = wait_for_flush(&flushed, 4);
        assert_eq!(parent, hash);

        let log = db.commit_log();
        assert_eq!(4, log.len());
        for (expected, (got_number, got_root)) in (1..=4u64).zip(log.iter()) {
            assert_eq!(expected, *got_number);
            assert_eq!(roots[(expected - 1) as usize], *got_root);
        }
        assert_eq!(4, chain.last_finalized());

        chain.shutdown();
    }

    #[test]
    fn bounded_queue_applies_backpressure() {
        let config = BlockstateConfig {
            min_flush_delay: Duration::from_millis(1),
            finalization_queue_limit: Some(1),
            ..Default::default()
        };
        let (chain, db) = open_chain_with(config, 8, false);
        let chain = Arc::new(chain);

        let address = random_hash();
        let mut parent = H256::zero();
        for number in 1..=3u64 {
            let mut block = chain.start_new(&parent).unwrap();
            block.set_account(&address, &account(number, number), number == 1);
            parent = block.commit(number);
        }

        let gate = db.hold_commits();
        let done = Arc::new(AtomicBool::new(false));
        let finalizer = {
            let chain = Arc::clone(&chain);
            let done = Arc::clone(&done);
            let head = parent;
            thread::spawn(move || {
                chain.finalize(&head);
                done.store(true, Ordering::SeqCst);
            })
        };

        // One block sits in the stalled flusher, one fills the queue;
        // the third keeps finalize waiting.
        thread::sleep(Duration::from_millis(200));
        assert!(!done.load(Ordering::SeqCst));

        drop(gate);
        finalizer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));

        let started = Instant::now();
        while db.commit_log().len() < 3 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(3, db.commit_log().len());

        Arc::try_unwrap(chain).ok().expect("all clones joined; qed").shutdown();
    }

    #[test]
    fn shutdown_releases_everything() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let (watcher, flushed) = flush_watcher();
        chain.add_notify(Arc::downgrade(&watcher) as Weak<dyn ChainNotify>);
        let accessor = chain.build_read_only_accessor();

        let address = random_hash();
        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(1, 1), true);
        let h1 = b1.commit(1);

        // A block above the finalized height that never finalizes must
        // be released by shutdown.
        let mut fork = chain.start_new(&h1).unwrap();
        fork.set_account(&address, &account(2, 2), false);
        let _orphan = fork.commit(2);

        chain.finalize(&h1);
        flushed.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(chain.mem_used() > 0);
        drop(accessor);
        // Shutdown asserts that no pool page stays rented.
        chain.shutdown();
    }

    #[test]
    fn accessor_follows_flushes() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let accessor = chain.build_read_only_accessor();
        let (watcher, flushed) = flush_watcher();
        chain.add_notify(Arc::downgrade(&watcher) as Weak<dyn ChainNotify>);

        let address = random_hash();
        let mut block = chain.start_new(&H256::zero()).unwrap();
        block.set_account(&address, &account(42, 1), true);
        let h1 = block.commit(1);

        let speculative = accessor.view(&h1).unwrap();
        assert!(!speculative.is_db_backed());
        drop(speculative);

        chain.finalize(&h1);
        let (_, hash) = flushed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(h1, hash);

        let durable = accessor.view(&h1).unwrap();
        assert!(durable.is_db_backed());
        assert_eq!(U256::from(42), *durable.get_account(&address).balance());
        drop(durable);
        drop(accessor);

        chain.shutdown();
    }

    #[test]
    fn raw_state_reaches_the_store() {
        let (chain, db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();
        let slot = random_hash();

        let mut raw = chain.start_raw();
        raw.set_account(&address, &account(77, 1));
        raw.set_storage(&address, &slot, &[0x01, 0x02]);
        raw.commit();
        let root = *raw.root();
        raw.finalize(9).unwrap();
        drop(raw);

        assert!(db.has_state(&root));
        assert!(chain.has_state(&root));

        let view = chain.start_read_only(&root).unwrap();
        assert!(view.is_db_backed());
        assert_eq!(U256::from(77), *view.get_account(&address).balance());
        assert_eq!(vec![0x01, 0x02], storage_of(&view, &address, &slot));
        drop(view);

        chain.shutdown();
    }

    #[test]
    fn missing_parent_is_reported() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let unknown = random_hash();
        match chain.start_new(&unknown) {
            Err(Error::MissingParent(hash)) => assert_eq!(unknown, hash),
            other => panic!("expected MissingParent, got {:?}", other.map(|_| ())),
        }
        match chain.start_read_only(&unknown) {
            Err(Error::MissingParent(hash)) => assert_eq!(unknown, hash),
            other => panic!("expected MissingParent, got {:?}", other.err()),
        }
        chain.shutdown();
    }

    #[test]
    fn reset_forgets_buffered_writes() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();

        let mut b1 = chain.start_new(&H256::zero()).unwrap();
        b1.set_account(&address, &account(1, 1), true);
        let h1 = b1.commit(1);

        let mut b2 = chain.start_new(&h1).unwrap();
        b2.set_account(&address, &account(100, 9), false);
        b2.destroy_account(&address);
        b2.reset();

        assert_eq!(U256::from(1), *b2.get_account(&address).balance());
        b2.set_account(&address, &account(2, 2), false);
        let h2 = b2.commit(2);
        let view = chain.start_read_only(&h2).unwrap();
        assert_eq!(U256::from(2), *view.get_account(&address).balance());
        drop(view);

        chain.shutdown();
    }

    #[test]
    fn touched_sets_are_tracked() {
        let (chain, _db) = open_chain_with(quick_config(), 4, false);
        let address = random_hash();
        let slot = random_hash();

        let mut block = chain.start_new(&H256::zero()).unwrap();
        block.set_account(&address, &account(1, 1), true);
        block.set_storage(&address, &slot, &[0x0F]);
        assert_eq!(vec![address], block.touched_accounts());
        assert_eq!(vec![(address, slot)], block.touched_storage_slots());
        assert_eq!(0, block.db_reads());
        let _ = block.get_account(&random_hash());
        assert!(block.db_reads() > 0);

        block.destroy_account(&address);
        assert!(block.touched_storage_slots().is_empty());

        drop(block);
        chain.shutdown();
    }
}
