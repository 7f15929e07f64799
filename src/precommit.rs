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

//! Seam to the behavior that derives the state root. It reads a block
//! through the regular protocol and writes derived merkle entries into
//! the block's scratch dictionary.

use std::sync::atomic::{AtomicU32, Ordering};

use primitive_types::H256;

use crate::key::Key;

/// Tag stored with every dictionary entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EntryTag {
    /// Written by execution or the behavior; flushed to the store.
    Persistent = 0,
    /// Local copy of an ancestor or store value; kept in committed
    /// blocks but never flushed.
    Cached = 1,
    /// Scratch value discarded when the block is sealed.
    UseOnce = 2,
}

impl EntryTag {
    pub fn from_u8(tag: u8) -> EntryTag {
        match tag {
            0 => EntryTag::Persistent,
            1 => EntryTag::Cached,
            2 => EntryTag::UseOnce,
            other => unreachable!("unknown entry tag {}", other),
        }
    }
}

/// How many values a block may cache locally on behalf of one consumer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CacheBudget {
    /// Zero disables caching.
    pub entries_per_block: u32,
}

impl CacheBudget {
    pub fn entries(entries_per_block: u32) -> CacheBudget {
        CacheBudget {
            entries_per_block,
        }
    }

    pub fn disabled() -> CacheBudget {
        Self::entries(0)
    }
}

/// Running remainder of a cache budget, shared with the prefetch worker.
pub struct BudgetTracker {
    remaining: AtomicU32,
}

impl BudgetTracker {
    pub fn new(budget: CacheBudget) -> BudgetTracker {
        BudgetTracker {
            remaining: AtomicU32::new(budget.entries_per_block),
        }
    }

    /// Take one cacheable entry from the budget.
    pub fn take(&self) -> bool {
        let mut current = self.remaining.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false
            }
            match self.remaining.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }
}

/// The view of a live block handed to `before_commit` and the
/// account-lifecycle notices.
pub trait Commit {
    /// Read through the block, its ancestors and the store.
    fn get(&mut self, key: &Key) -> Option<Vec<u8>>;
    /// Write a derived entry into the block's scratch dictionary.
    fn set(&mut self, key: &Key, value: &[u8], tag: EntryTag);
    /// Visit every value execution wrote in this block, in unspecified
    /// order. Cached copies are not visited.
    fn for_each_change(&mut self, f: &mut dyn FnMut(&Key, &[u8]));
    fn parent_root(&self) -> H256;
}

/// The view handed to the prefetch entry points. `get` probes the
/// scratch dictionary first; on a miss it walks ancestors and the store,
/// pushes the raw value through `transform` into a borrowed scratch
/// page, and caches the transformed bytes under the returned tag.
pub trait PrefetchContext {
    fn get(
        &mut self,
        key: &Key,
        transform: &mut dyn FnMut(&[u8], &mut [u8]) -> (usize, EntryTag),
    ) -> Option<Vec<u8>>;
}

pub trait PreCommit: Send + Sync {
    /// Derive and return the new state root, writing merkle entries
    /// back through `commit`.
    fn before_commit(&self, commit: &mut dyn Commit, budget: CacheBudget) -> H256;

    /// Optional value rewrite at flush time. Returning `Some(n)` makes
    /// the flusher write `scratch[..n]` instead of `value`.
    fn inspect_before_apply(&self, _key: &Key, _value: &[u8], _scratch: &mut [u8]) -> Option<usize> {
        None
    }

    fn on_account_destroyed(&self, _address: &H256, _commit: &mut dyn Commit) {}

    fn on_new_account_created(&self, _address: &H256, _commit: &mut dyn Commit) {}

    fn can_prefetch(&self) -> bool {
        false
    }

    fn prefetch_account(&self, _address: &H256, _ctx: &mut dyn PrefetchContext) {}

    fn prefetch_storage(&self, _address: &H256, _slot: &H256, _ctx: &mut dyn PrefetchContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_runs_dry() {
        let tracker = BudgetTracker::new(CacheBudget::entries(2));
        assert!(tracker.take());
        assert!(tracker.take());
        assert!(!tracker.take());
        assert!(!tracker.take());
    }

    #[test]
    fn disabled_budget_takes_nothing() {
        let tracker = BudgetTracker::new(CacheBudget::disabled());
        assert!(!tracker.take());
    }
}
