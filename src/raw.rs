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

//! Direct-to-batch state import, bypassing committed blocks.

use std::sync::Arc;
use std::thread;

use primitive_types::H256;

use crate::backend::{Backend, CommitOptions, SharedBatch, WriteBatch};
use crate::block::{LiveBlock, LiveCommit};
use crate::blockchain::ChainShared;
use crate::error::Error;
use crate::item::account::Account;
use crate::key::Key;
use crate::precommit::PreCommit;

/// Bulk writer used by importers: buffered writes are applied straight
/// to the store's writable batch by `commit`, and `finalize` stamps the
/// metadata and makes everything durable. Dropping an unfinalized
/// `RawState` is a programming error.
pub struct RawState {
    shared: Arc<ChainShared>,
    block: LiveBlock,
    batch: Option<Box<dyn WriteBatch>>,
    deletes: Vec<Key>,
    root: H256,
    boundary: Option<H256>,
    finalized: bool,
}

impl RawState {
    pub(crate) fn new(shared: Arc<ChainShared>) -> RawState {
        let read_batch =
            SharedBatch::new(shared.db.begin_read_only_batch_or_latest(&H256::zero(), "raw state"));
        let block = LiveBlock::new(Arc::clone(&shared), H256::zero(), Vec::new(), read_batch);
        let batch = shared.db.begin_next_batch();
        RawState {
            shared,
            block,
            batch: Some(batch),
            deletes: Vec::new(),
            root: H256::zero(),
            boundary: None,
            finalized: false,
        }
    }

    /// Importers must write the storage root as `EMPTY_TREE_HASH`; the
    /// pre-commit behavior recomputes it.
    pub fn set_account(&mut self, address: &H256, account: &Account) {
        self.block.set_account(address, account, false);
    }

    pub fn set_storage(&mut self, address: &H256, slot: &H256, value: &[u8]) {
        self.block.set_storage(address, slot, value);
    }

    /// Declare the state root of the imported data, skipping root
    /// derivation at the next `commit`.
    pub fn set_boundary(&mut self, root: &H256) {
        self.boundary = Some(*root);
    }

    /// Queue a prefix deletion applied by the next `commit`.
    pub fn register_delete_by_prefix(&mut self, key: &Key) {
        self.deletes.push(*key);
    }

    /// The root the imported state currently corresponds to.
    pub fn root(&self) -> &H256 {
        &self.root
    }

    /// Apply everything buffered so far to the writable batch and start
    /// a fresh buffer.
    pub fn commit(&mut self) {
        self.root = match self.boundary.take() {
            Some(root) => root,
            None => {
                let budget = self.shared.config.cache_budget_pre_commit;
                self.shared.behavior.before_commit(
                    &mut LiveCommit {
                        block: &mut self.block,
                    },
                    budget,
                )
            }
        };
        let batch = self.batch.as_mut().expect("the batch stays open until finalize; qed");
        for key in self.deletes.drain(..) {
            batch.delete_by_prefix(&key);
        }
        self.block.apply_raw(&mut **batch);
        self.block.reset();
    }

    /// Stamp the batch with `(number, root)` and make it durable.
    pub fn finalize(&mut self, number: crate::BlockNumber) -> Result<(), Error> {
        assert!(!self.finalized, "raw state finalized twice");
        let mut batch = self.batch.take().expect("finalize runs once; qed");
        let root = self.root;
        batch.set_metadata(number, &root);
        batch.commit(CommitOptions::FlushDataOnly)?;
        self.shared.db.flush()?;
        self.finalized = true;
        cinfo!(BLOCKCHAIN, "Raw state finalized at #{} ({:?})", number, root);
        Ok(())
    }
}

impl Drop for RawState {
    fn drop(&mut self) {
        if !self.finalized && !thread::panicking() {
            panic!("RawState disposed before finalize");
        }
    }
}
