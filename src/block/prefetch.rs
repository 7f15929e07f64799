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

//! Background worker speculatively pulling keys the pre-commit behavior
//! will need into a live block's scratch dictionary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use primitive_types::H256;

use super::live::BlockCore;
use super::ReadOutcome;
use crate::key::{key_hash, Key};
use crate::mem::dict::SpanDict;
use crate::mem::filter::BitFilter;
use crate::mem::pool::PagePool;
use crate::precommit::{BudgetTracker, EntryTag, PreCommit, PrefetchContext};

enum Hint {
    Account(H256),
    Storage(H256, H256),
    Stop,
}

struct PrefetchShared {
    /// Deduplicates speculative work across producer threads.
    seen: BitFilter,
    accepting: AtomicBool,
}

/// Handle the caller pumps with hints during transaction execution.
pub struct Prefetcher {
    shared: Arc<PrefetchShared>,
    tx: Sender<Hint>,
}

impl Prefetcher {
    pub fn prefetch_account(&self, address: &H256) {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return
        }
        let account_hash = key_hash(address.as_bytes());
        if self.shared.seen.add_atomic(account_hash) {
            let _ = self.tx.send(Hint::Account(*address));
        }
    }

    pub fn prefetch_storage(&self, address: &H256, slot: &H256) {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return
        }
        let account_hash = key_hash(address.as_bytes());
        if self.shared.seen.add_atomic(account_hash) {
            let _ = self.tx.send(Hint::Account(*address));
        }
        let slot_hash = account_hash ^ key_hash(slot.as_bytes());
        if self.shared.seen.add_atomic(slot_hash) {
            let _ = self.tx.send(Hint::Storage(*address, *slot));
        }
    }
}

/// The block-owned end: stops the worker when the block seals.
pub(crate) struct PrefetchHandle {
    shared: Arc<PrefetchShared>,
    tx: Sender<Hint>,
    thread: JoinHandle<()>,
}

impl PrefetchHandle {
    pub fn spawn(
        core: Arc<BlockCore>,
        behavior: Arc<dyn PreCommit>,
        pool: Arc<PagePool>,
    ) -> (Prefetcher, PrefetchHandle) {
        let shared = Arc::new(PrefetchShared {
            seen: BitFilter::new(&pool),
            accepting: AtomicBool::new(true),
        });
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("prefetch".to_string())
            .spawn(move || work_loop(&rx, &core, &*behavior, &pool))
            .expect("Error creating prefetch worker thread");
        (
            Prefetcher {
                shared: Arc::clone(&shared),
                tx: tx.clone(),
            },
            PrefetchHandle {
                shared,
                tx,
                thread,
            },
        )
    }

    /// Stop accepting hints, forbid further work under the pre-commit
    /// lock and drain the worker.
    pub fn stop(self, core: &BlockCore) {
        self.shared.accepting.store(false, Ordering::Release);
        core.pre_commit.lock().prefetch_possible = false;
        let _ = self.tx.send(Hint::Stop);
        if self.thread.join().is_err() {
            cerror!(PREFETCH, "Prefetch worker panicked");
        }
    }
}

fn work_loop(rx: &Receiver<Hint>, core: &Arc<BlockCore>, behavior: &dyn PreCommit, pool: &Arc<PagePool>) {
    while let Ok(hint) = rx.recv() {
        match hint {
            Hint::Stop => break,
            Hint::Account(address) => run_item(core, behavior, pool, &address, None),
            Hint::Storage(address, slot) => run_item(core, behavior, pool, &address, Some(slot)),
        }
    }
    ctrace!(PREFETCH, "Prefetch worker stopped");
}

fn run_item(core: &BlockCore, behavior: &dyn PreCommit, pool: &Arc<PagePool>, address: &H256, slot: Option<H256>) {
    let scratch = pool.scratch();
    let mut guard = core.pre_commit.lock();
    let dict_state = &mut *guard;
    if !dict_state.prefetch_possible {
        return
    }
    let mut ctx = WorkerContext {
        core,
        dict: &mut dict_state.dict,
        scratch: &*scratch,
        budget: &core.pre_commit_budget,
    };
    match slot {
        None => behavior.prefetch_account(address, &mut ctx),
        Some(slot) => behavior.prefetch_storage(address, &slot, &mut ctx),
    }
}

struct WorkerContext<'a> {
    core: &'a BlockCore,
    dict: &'a mut SpanDict,
    scratch: &'a crate::mem::pool::Page,
    budget: &'a BudgetTracker,
}

impl<'a> PrefetchContext for WorkerContext<'a> {
    fn get(
        &mut self,
        key: &Key,
        transform: &mut dyn FnMut(&[u8], &mut [u8]) -> (usize, EntryTag),
    ) -> Option<Vec<u8>> {
        let mut buf = [0u8; Key::MAX_ENCODED];
        let encoded = key.write_to(&mut buf);
        let hash = key_hash(encoded);
        if let Some((value, _)) = self.dict.try_get(encoded, hash) {
            return Some(value.to_vec())
        }

        let owner = key.address();
        match self.core.read_deep(encoded, hash, key.destroyed_hash(), owner.as_ref()) {
            ReadOutcome::Value(raw, _depth) => {
                let scratch = unsafe { self.scratch.bytes_mut() };
                let (written, tag) = transform(&raw, &mut scratch[..]);
                if self.budget.take() {
                    self.dict.set(encoded, hash, &scratch[..written], tag as u8);
                    self.core.own_filter.add_atomic(hash);
                }
                Some(scratch[..written].to_vec())
            }
            ReadOutcome::Empty => None,
        }
    }
}
