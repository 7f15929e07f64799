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

//! Mutable working state for one block under execution.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::H256;
use rlp::Encodable;

use super::committed::CommittedBlock;
use super::prefetch::{PrefetchHandle, Prefetcher};
use super::{merge_ancestor_filters, read_ancestors_and_db, ReadOutcome};
use crate::backend::{BatchRef, WriteBatch};
use crate::blockchain::ChainShared;
use crate::item::account::Account;
use crate::key::{destroyed_hash, key_hash, normalize_root, Key, KeyKind, NibblePath, EMPTY_TREE_HASH};
use crate::mem::dict::{Concurrency, SpanDict};
use crate::mem::filter::BitFilter;
use crate::mem::lease::Lease;
use crate::precommit::{BudgetTracker, Commit, EntryTag, PreCommit};
use crate::BlockNumber;

pub(crate) struct PreCommitDict {
    pub dict: SpanDict,
    /// Cleared under this lock when the block seals; every prefetch
    /// action checks it under the same lock, so no work starts after.
    pub prefetch_possible: bool,
}

/// The parts of a live block shared with its prefetch worker: the
/// scratch dictionary behind its lock, the atomically updated own
/// filter, and the read-only ancestor chain and store batch.
pub(crate) struct BlockCore {
    pub parent_hash: H256,
    pub batch: BatchRef,
    pub ancestors: Vec<Lease<CommittedBlock>>,
    pub ancestors_filter: Option<BitFilter>,
    pub own_filter: BitFilter,
    pub pre_commit: Mutex<PreCommitDict>,
    pub pre_commit_budget: BudgetTracker,
    pub db_reads: AtomicU64,
}

impl BlockCore {
    /// The ancestor-and-store tail of the read protocol, without the
    /// own layer.
    pub fn read_deep(&self, encoded: &[u8], hash: u64, destroyed: u64, owner: Option<&H256>) -> ReadOutcome {
        read_ancestors_and_db(
            &self.ancestors,
            self.ancestors_filter.as_ref(),
            &self.batch,
            &self.db_reads,
            encoded,
            hash,
            destroyed,
            owner,
        )
    }
}

/// Mutable working state for one block: account and storage write
/// buffers, the pre-commit scratch dictionary, the filters guarding
/// reads, and the leased ancestor chain down to the store.
///
/// One logical writer mutates a live block; the only concurrent actor
/// is its own prefetch worker.
pub struct LiveBlock {
    chain: Arc<ChainShared>,
    core: Arc<BlockCore>,
    state: SpanDict,
    storage: SpanDict,
    destroyed: Option<HashSet<H256>>,
    root_hash: Option<H256>,
    touched_accounts: HashSet<H256>,
    touched_storage: HashMap<H256, HashSet<H256>>,
    cache_remaining: u32,
    prefetch: Option<PrefetchHandle>,
    prefetcher_opened: bool,
}

impl LiveBlock {
    pub(crate) fn new(
        chain: Arc<ChainShared>,
        parent_hash: H256,
        ancestors: Vec<Lease<CommittedBlock>>,
        batch: BatchRef,
    ) -> LiveBlock {
        let pool = &chain.pool;
        let ancestors_filter = merge_ancestor_filters(pool, &ancestors);
        let core = Arc::new(BlockCore {
            parent_hash,
            batch,
            ancestors,
            ancestors_filter,
            own_filter: BitFilter::new(pool),
            pre_commit: Mutex::new(PreCommitDict {
                dict: SpanDict::new(Arc::clone(pool), Concurrency::PreserveOnceWritten),
                prefetch_possible: true,
            }),
            pre_commit_budget: BudgetTracker::new(chain.config.cache_budget_pre_commit),
            db_reads: AtomicU64::new(0),
        });
        let state = SpanDict::new(Arc::clone(pool), Concurrency::SingleWriter);
        let storage = SpanDict::new(Arc::clone(pool), Concurrency::SingleWriter);
        let cache_remaining = chain.config.cache_budget_state_and_storage.entries_per_block;
        LiveBlock {
            chain,
            core,
            state,
            storage,
            destroyed: None,
            root_hash: None,
            touched_accounts: HashSet::new(),
            touched_storage: HashMap::new(),
            cache_remaining,
            prefetch: None,
            prefetcher_opened: false,
        }
    }

    pub fn parent_hash(&self) -> &H256 {
        &self.core.parent_hash
    }

    /// The derived state root, once computed by a commit.
    pub fn hash(&self) -> Option<H256> {
        self.root_hash
    }

    /// Hashes of the in-memory ancestor chain, newest first.
    pub fn ancestors(&self) -> Vec<H256> {
        self.core.ancestors.iter().map(|ancestor| *ancestor.hash()).collect()
    }

    /// Store reads this block caused so far.
    pub fn db_reads(&self) -> u64 {
        self.core.db_reads.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn touched_accounts(&self) -> Vec<H256> {
        self.touched_accounts.iter().cloned().collect()
    }

    pub fn touched_storage_slots(&self) -> Vec<(H256, H256)> {
        let mut slots = Vec::new();
        for (address, cells) in &self.touched_storage {
            for slot in cells {
                slots.push((*address, *slot));
            }
        }
        slots
    }

    pub fn get_account(&mut self, address: &H256) -> Account {
        let key = Key::account(address);
        match self.read(&key) {
            ReadOutcome::Value(bytes, depth) => {
                let account = Account::from_payload(&bytes);
                if depth > 0 {
                    self.cache_local(&key, &bytes);
                }
                account
            }
            ReadOutcome::Empty => Account::default(),
        }
    }

    /// Copies the storage value into `out`, returning the written
    /// length; zero means the cell is empty.
    pub fn get_storage(&mut self, address: &H256, slot: &H256, out: &mut [u8]) -> usize {
        let key = Key::storage(address, slot);
        match self.read(&key) {
            ReadOutcome::Value(bytes, depth) => {
                assert!(out.len() >= bytes.len(), "storage value of {} bytes exceeds the out buffer", bytes.len());
                out[..bytes.len()].copy_from_slice(&bytes);
                if depth > 0 {
                    self.cache_local(&key, &bytes);
                }
                bytes.len()
            }
            ReadOutcome::Empty => 0,
        }
    }

    pub fn set_account(&mut self, address: &H256, account: &Account, newly_created: bool) {
        self.root_hash = None;
        let key = Key::account(address);
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        self.core.own_filter.add_atomic(hash);
        self.state.set(encoded, hash, &account.rlp_bytes(), EntryTag::Persistent as u8);
        self.touched_accounts.insert(*address);
        if newly_created {
            let behavior = Arc::clone(&self.chain.behavior);
            behavior.on_new_account_created(address, &mut LiveCommit {
                block: self,
            });
        }
    }

    /// An empty value deletes the cell.
    pub fn set_storage(&mut self, address: &H256, slot: &H256, value: &[u8]) {
        self.root_hash = None;
        let key = Key::storage(address, slot);
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        self.core.own_filter.add_atomic(hash);
        self.storage.set(encoded, hash, value, EntryTag::Persistent as u8);
        self.touched_storage.entry(*address).or_insert_with(HashSet::new).insert(*slot);
    }

    /// Delete the account and its whole storage subtree. Reads under
    /// this address answer empty until a later re-creation.
    pub fn destroy_account(&mut self, address: &H256) {
        self.root_hash = None;
        let key = Key::account(address);
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        self.core.own_filter.add_atomic(hash);
        self.state.set(encoded, hash, &[], EntryTag::Persistent as u8);

        let path = NibblePath::full(address);
        for entry in self.storage.iter() {
            if let Some((parsed, _)) = Key::read_from(entry.key()) {
                if parsed.path() == &path {
                    entry.destroy();
                }
            }
        }
        {
            let guard = self.core.pre_commit.lock();
            for entry in guard.dict.iter() {
                if let Some((parsed, _)) = Key::read_from(entry.key()) {
                    if parsed.path() == &path {
                        entry.destroy();
                    }
                }
            }
        }

        self.touched_storage.remove(address);
        self.touched_accounts.insert(*address);
        self.destroyed.get_or_insert_with(HashSet::new).insert(*address);

        let behavior = Arc::clone(&self.chain.behavior);
        behavior.on_account_destroyed(address, &mut LiveCommit {
            block: self,
        });
    }

    /// At most one per block; `None` when the pre-commit behavior
    /// declines prefetching.
    pub fn open_prefetcher(&mut self) -> Option<Prefetcher> {
        assert!(!self.prefetcher_opened, "a prefetcher was already opened for this block");
        self.prefetcher_opened = true;
        if !self.chain.behavior.can_prefetch() {
            return None
        }
        let (prefetcher, handle) =
            PrefetchHandle::spawn(Arc::clone(&self.core), Arc::clone(&self.chain.behavior), Arc::clone(&self.chain.pool));
        self.prefetch = Some(handle);
        Some(prefetcher)
    }

    /// Seal the block: derive the state root, repackage the write
    /// buffers into a committed block and register it. An empty block
    /// on an empty parent is swallowed and reports the empty tree.
    pub fn commit(mut self, number: BlockNumber) -> H256 {
        match self.prefetch.take() {
            Some(handle) => handle.stop(&self.core),
            None => self.core.pre_commit.lock().prefetch_possible = false,
        }

        let behavior = Arc::clone(&self.chain.behavior);
        let budget = self.chain.config.cache_budget_pre_commit;
        let root = behavior.before_commit(
            &mut LiveCommit {
                block: &mut self,
            },
            budget,
        );
        self.root_hash = Some(root);

        if normalize_root(root) == normalize_root(self.core.parent_hash) {
            if normalize_root(root).is_zero() {
                cdebug!(BLOCK, "Swallowing empty block #{} over an empty parent", number);
                return EMPTY_TREE_HASH
            }
            panic!("commit of block #{} without a state change", number);
        }

        let pool = &self.chain.pool;
        let filter = BitFilter::new(pool);
        let mut merged = SpanDict::new(Arc::clone(pool), Concurrency::SingleWriter);
        let keep = |meta: u8| EntryTag::from_u8(meta) != EntryTag::UseOnce;
        // Account and storage keys are disjoint, so both copy in append
        // mode; pre-commit entries may shadow either and overwrite.
        self.state.copy_to(&mut merged, &keep, &filter, true);
        self.storage.copy_to(&mut merged, &keep, &filter, true);
        self.core.pre_commit.lock().dict.copy_to(&mut merged, &keep, &filter, false);

        let destroyed = self.destroyed.take().unwrap_or_default();
        for address in &destroyed {
            filter.add(destroyed_hash(address));
        }

        let block = CommittedBlock::new(root, self.core.parent_hash, number, false, filter, destroyed, merged);
        self.chain.register(block);
        ctrace!(BLOCK, "Committed block #{} ({:?})", number, root);
        root
    }

    /// Write the buffered dictionaries straight into a store batch,
    /// bypassing the committed-block machinery. Raw-import path.
    pub(crate) fn apply_raw(&mut self, batch: &mut dyn WriteBatch) {
        if let Some(destroyed) = &self.destroyed {
            for address in destroyed {
                batch.destroy(&NibblePath::full(address));
            }
        }
        let apply = |dict: &SpanDict, batch: &mut dyn WriteBatch| {
            for entry in dict.iter() {
                if EntryTag::from_u8(entry.meta()) == EntryTag::Persistent {
                    batch.set_raw(entry.key(), entry.value());
                }
            }
        };
        apply(&self.state, batch);
        apply(&self.storage, batch);
        apply(&self.core.pre_commit.lock().dict, batch);
    }

    /// Drop every buffered write so the block can be re-executed in
    /// place. The ancestor chain and store batch are kept.
    pub fn reset(&mut self) {
        assert!(self.prefetch.is_none(), "reset with an open prefetcher");
        self.state.clear();
        self.storage.clear();
        self.core.pre_commit.lock().dict.clear();
        self.core.own_filter.clear();
        self.destroyed = None;
        self.root_hash = None;
        self.touched_accounts.clear();
        self.touched_storage.clear();
        self.cache_remaining = self.chain.config.cache_budget_state_and_storage.entries_per_block;
    }

    fn read(&self, key: &Key) -> ReadOutcome {
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        let destroyed = key.destroyed_hash();
        let owner = key.address();
        self.read_encoded(key.kind(), encoded, hash, destroyed, owner.as_ref())
    }

    fn read_encoded(
        &self,
        kind: KeyKind,
        encoded: &[u8],
        hash: u64,
        destroyed: u64,
        owner: Option<&H256>,
    ) -> ReadOutcome {
        if self.core.own_filter.may_contain(hash) {
            if kind != KeyKind::StorageCell {
                // Pre-commit entries shadow state.
                let guard = self.core.pre_commit.lock();
                if let Some((value, _)) = guard.dict.try_get(encoded, hash) {
                    return ReadOutcome::Value(value.to_vec(), 0)
                }
            }
            let primary = match kind {
                KeyKind::Account => Some(&self.state),
                KeyKind::StorageCell => Some(&self.storage),
                KeyKind::Merkle => None,
            };
            if let Some(dict) = primary {
                if let Some((value, _)) = dict.try_get(encoded, hash) {
                    return ReadOutcome::Value(value.to_vec(), 0)
                }
            }
        }

        // A live local hit wins above; from here a local destruction is
        // authoritative even when the filter produced a false positive.
        if destroyed != 0 {
            if let (Some(owner), Some(gone)) = (owner, self.destroyed.as_ref()) {
                if gone.contains(owner) {
                    return ReadOutcome::Empty
                }
            }
        }

        self.core.read_deep(encoded, hash, destroyed, owner)
    }

    /// Write a value fetched from deeper layers back into the local
    /// dictionaries, within the configured budget.
    fn cache_local(&mut self, key: &Key, bytes: &[u8]) {
        if self.cache_remaining == 0 {
            return
        }
        let dict = match key.kind() {
            KeyKind::Account => &mut self.state,
            KeyKind::StorageCell => &mut self.storage,
            KeyKind::Merkle => return,
        };
        self.cache_remaining -= 1;
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        self.core.own_filter.add_atomic(hash);
        dict.set(encoded, hash, bytes, EntryTag::Cached as u8);
    }
}

/// The live block viewed as a pre-commit target.
pub(crate) struct LiveCommit<'a> {
    pub block: &'a mut LiveBlock,
}

impl<'a> Commit for LiveCommit<'a> {
    fn get(&mut self, key: &Key) -> Option<Vec<u8>> {
        match self.block.read(key) {
            ReadOutcome::Value(bytes, depth) => {
                if depth > 0 && key.kind() != KeyKind::StorageCell && self.block.core.pre_commit_budget.take() {
                    let mut buf = [0u8; Key::MAX_ENCODED];
                    let encoded = key.write_to(&mut buf);
                    let hash = key_hash(encoded);
                    self.block.core.own_filter.add_atomic(hash);
                    self.block.core.pre_commit.lock().dict.set(encoded, hash, &bytes, EntryTag::Cached as u8);
                }
                Some(bytes)
            }
            ReadOutcome::Empty => None,
        }
    }

    fn set(&mut self, key: &Key, value: &[u8], tag: EntryTag) {
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        self.block.core.own_filter.add_atomic(hash);
        self.block.core.pre_commit.lock().dict.set(encoded, hash, value, tag as u8);
    }

    fn for_each_change(&mut self, f: &mut dyn FnMut(&Key, &[u8])) {
        let mut visit = |dict: &SpanDict| {
            for entry in dict.iter() {
                if EntryTag::from_u8(entry.meta()) != EntryTag::Persistent {
                    continue
                }
                let (key, _) = Key::read_from(entry.key()).expect("dictionary keys are canonically encoded; qed");
                f(&key, entry.value());
            }
        };
        visit(&self.block.state);
        visit(&self.block.storage);
    }

    fn parent_root(&self) -> H256 {
        self.block.core.parent_hash
    }
}
