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

//! The single background task draining finalized blocks into the store.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Receiver;
use primitive_types::H256;

use crate::backend::{Backend, CommitOptions, WriteBatch};
use crate::block::CommittedBlock;
use crate::blockchain::ChainShared;
use crate::error::Error;
use crate::key::{Key, NibblePath};
use crate::precommit::{EntryTag, PreCommit};
use crate::BlockNumber;

pub(crate) struct Flusher {
    thread: JoinHandle<()>,
}

impl Flusher {
    pub fn spawn(shared: Arc<ChainShared>, rx: Receiver<Arc<CommittedBlock>>) -> Flusher {
        let thread = thread::Builder::new()
            .name("flusher".to_string())
            .spawn(move || {
                if let Err(err) = run(&shared, &rx) {
                    cerror!(FLUSH, "Flusher failed: {}", err);
                    shared.notify(|listener| listener.flusher_failure(&err));
                }
            })
            .expect("Error creating flusher thread");
        Flusher {
            thread,
        }
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            cerror!(SHUTDOWN, "Flusher thread panicked");
        }
    }
}

fn run(shared: &Arc<ChainShared>, rx: &Receiver<Arc<CommittedBlock>>) -> Result<(), Error> {
    // A disconnect with an empty queue is the shutdown signal.
    while let Ok(first) = rx.recv() {
        let started = Instant::now();
        let budget = shared.config.min_flush_delay;
        let mut last: Option<(BlockNumber, H256)> = None;

        let mut next = Some(first);
        while let Some(block) = next.take() {
            apply_block(shared, rx, &block)?;
            last = Some((block.number(), *block.hash()));
            shared.after_flush(&block);

            if started.elapsed() < budget {
                next = rx.try_recv().ok();
            }
        }

        if let Some((number, hash)) = last {
            shared.db.flush()?;
            cinfo!(FLUSH, "Flushed up to block #{} ({:?})", number, hash);
            shared.notify(|listener| listener.flushed(number, hash));
        }
    }
    ctrace!(SHUTDOWN, "Flusher drained and stopped");
    Ok(())
}

fn apply_block(
    shared: &Arc<ChainShared>,
    rx: &Receiver<Arc<CommittedBlock>>,
    block: &Arc<CommittedBlock>,
) -> Result<(), Error> {
    ctrace!(FLUSH, "Applying block #{} ({:?})", block.number(), block.hash());
    let mut batch = shared.db.begin_next_batch();
    batch.set_metadata(block.number(), block.hash());

    for address in block.destroyed() {
        batch.destroy(&NibblePath::full(address));
    }

    let scratch = shared.pool.scratch();
    let scratch_bytes = unsafe { scratch.bytes_mut() };
    for entry in block.dict().iter() {
        if EntryTag::from_u8(entry.meta()) != EntryTag::Persistent {
            continue
        }
        let (key, _) = Key::read_from(entry.key()).expect("dictionary keys are canonically encoded; qed");
        match shared.behavior.inspect_before_apply(&key, entry.value(), &mut scratch_bytes[..]) {
            Some(written) => batch.set_raw(entry.key(), &scratch_bytes[..written]),
            None => batch.set_raw(entry.key(), entry.value()),
        }
    }

    if shared.verify_on_commit.load(Ordering::Relaxed) {
        batch.verify_pages_on_commit();
    }

    // Let one outer fsync cover the whole drained run.
    let options = if rx.is_empty() {
        CommitOptions::FlushDataOnly
    } else {
        CommitOptions::DangerNoFlush
    };
    batch.commit(options)?;
    block.mark_flushed();
    Ok(())
}
