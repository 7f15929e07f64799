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

//! Point-in-time read handle over one state root.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use primitive_types::H256;

use crate::backend::BatchRef;
use crate::block::{self, CommittedBlock};
use crate::item::account::Account;
use crate::key::{key_hash, Key};
use crate::mem::filter::BitFilter;
use crate::mem::lease::{Lease, LeaseCount, RefCounted};
use crate::mem::pool::PagePool;

/// Reads like a live block, minus the own layer and minus caching:
/// ancestor chain first, store batch last. Stable against the ongoing
/// write path; safe to share between threads.
pub struct ReadOnlyView {
    hash: H256,
    batch: BatchRef,
    ancestors: Vec<Lease<CommittedBlock>>,
    ancestors_filter: Option<BitFilter>,
    db_reads: AtomicU64,
    leases: LeaseCount,
}

impl ReadOnlyView {
    pub(crate) fn new(
        hash: H256,
        ancestors: Vec<Lease<CommittedBlock>>,
        batch: BatchRef,
        pool: &Arc<PagePool>,
    ) -> Lease<ReadOnlyView> {
        let ancestors_filter = block::merge_ancestor_filters(pool, &ancestors);
        Lease::adopt(Arc::new(ReadOnlyView {
            hash,
            batch,
            ancestors,
            ancestors_filter,
            db_reads: AtomicU64::new(0),
            leases: LeaseCount::new(),
        }))
    }

    pub fn hash(&self) -> &H256 {
        &self.hash
    }

    /// True when the view reads the store directly, with no in-memory
    /// ancestors left.
    pub fn is_db_backed(&self) -> bool {
        self.ancestors.is_empty()
    }

    pub fn db_reads(&self) -> u64 {
        self.db_reads.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_account(&self, address: &H256) -> Account {
        match self.read(&Key::account(address)) {
            block::ReadOutcome::Value(bytes, _) => Account::from_payload(&bytes),
            block::ReadOutcome::Empty => Account::default(),
        }
    }

    pub fn get_storage(&self, address: &H256, slot: &H256, out: &mut [u8]) -> usize {
        match self.read(&Key::storage(address, slot)) {
            block::ReadOutcome::Value(bytes, _) => {
                assert!(out.len() >= bytes.len(), "storage value of {} bytes exceeds the out buffer", bytes.len());
                out[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
            block::ReadOutcome::Empty => 0,
        }
    }

    fn read(&self, key: &Key) -> block::ReadOutcome {
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let owner = key.address();
        block::read_ancestors_and_db(
            &self.ancestors,
            self.ancestors_filter.as_ref(),
            &self.batch,
            &self.db_reads,
            encoded,
            key_hash(encoded),
            key.destroyed_hash(),
            owner.as_ref(),
        )
    }
}

impl RefCounted for ReadOnlyView {
    fn leases(&self) -> &LeaseCount {
        &self.leases
    }

    fn clean_up(&self) {
        ctrace!(READER, "Read-only view over {:?} released", self.hash);
    }
}
