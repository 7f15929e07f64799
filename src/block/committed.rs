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

//! Immutable snapshot of a committed block.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use primitive_types::H256;

use super::index::BlockIndex;
use crate::mem::dict::SpanDict;
use crate::mem::filter::BitFilter;
use crate::mem::lease::{LeaseCount, RefCounted};
use crate::BlockNumber;

pub(crate) enum Probe<'a> {
    Hit(&'a [u8]),
    /// The owning account was destroyed in this block; the walk stops
    /// here with an authoritative empty.
    Destroyed,
    Miss,
}

/// A committed block: merged dictionary, filter covering its live keys
/// and destroyed accounts, and the parent link used to build ancestor
/// chains. Mutable only while under construction; read-only once
/// registered.
pub struct CommittedBlock {
    hash: H256,
    parent_hash: H256,
    number: BlockNumber,
    raw: bool,
    filter: BitFilter,
    destroyed: HashSet<H256>,
    dict: SpanDict,
    leases: LeaseCount,
    /// Not registered in the index (coalesced duplicate, or drained at
    /// shutdown); cleanup skips deregistration.
    discarded: AtomicBool,
    flushed: AtomicBool,
    index: Mutex<Weak<BlockIndex>>,
}

impl CommittedBlock {
    pub(crate) fn new(
        hash: H256,
        parent_hash: H256,
        number: BlockNumber,
        raw: bool,
        filter: BitFilter,
        destroyed: HashSet<H256>,
        dict: SpanDict,
    ) -> Arc<CommittedBlock> {
        Arc::new(CommittedBlock {
            hash,
            parent_hash,
            number,
            raw,
            filter,
            destroyed,
            dict,
            leases: LeaseCount::new(),
            discarded: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
            index: Mutex::new(Weak::new()),
        })
    }

    pub fn hash(&self) -> &H256 {
        &self.hash
    }

    pub fn parent_hash(&self) -> &H256 {
        &self.parent_hash
    }

    pub fn number(&self) -> BlockNumber {
        self.number
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    pub(crate) fn filter(&self) -> &BitFilter {
        &self.filter
    }

    pub(crate) fn dict(&self) -> &SpanDict {
        &self.dict
    }

    pub(crate) fn destroyed(&self) -> &HashSet<H256> {
        &self.destroyed
    }

    /// Local lookup on this block. A live dictionary hit wins over the
    /// destroyed set so accounts re-created after destruction read back.
    pub(crate) fn probe(&self, encoded: &[u8], hash: u64, destroyed: u64, owner: Option<&H256>) -> Probe<'_> {
        if !self.filter.may_contain_any(hash, destroyed) {
            return Probe::Miss
        }
        if let Some((value, _meta)) = self.dict.try_get(encoded, hash) {
            return Probe::Hit(value)
        }
        if destroyed != 0 {
            if let Some(owner) = owner {
                if self.destroyed.contains(owner) {
                    return Probe::Destroyed
                }
            }
        }
        Probe::Miss
    }

    pub(crate) fn attach_index(&self, index: &Arc<BlockIndex>) {
        *self.index.lock() = Arc::downgrade(index);
    }

    pub(crate) fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    pub(crate) fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
    }
}

impl RefCounted for CommittedBlock {
    fn leases(&self) -> &LeaseCount {
        &self.leases
    }

    fn clean_up(&self) {
        ctrace!(BLOCK, "Cleaning up committed block #{} ({:?})", self.number, self.hash);
        if self.discarded.load(Ordering::Acquire) {
            return
        }
        let index = self.index.lock().upgrade();
        if let Some(index) = index {
            index.remove(self);
        }
    }
}
