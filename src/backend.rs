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

//! Seam to the paged on-disk store. The store itself lives behind these
//! traits; this crate only adds `(block_number, state_hash)` metadata
//! per committed batch.

use std::io;
use std::sync::Arc;

use primitive_types::H256;

use crate::key::{Key, NibblePath};
use crate::mem::lease::{Lease, LeaseCount, RefCounted};
use crate::BlockNumber;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BatchMetadata {
    pub block_number: BlockNumber,
    pub state_hash: H256,
}

/// Durability of a write-batch commit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitOptions {
    /// Force data durability before returning.
    FlushDataOnly,
    /// Leave durability to a later explicit `flush`.
    DangerNoFlush,
    /// Discard the batch.
    DangerNoWrite,
}

/// A read-only snapshot of one persisted state root.
pub trait ReadBatch: Send + Sync {
    fn metadata(&self) -> BatchMetadata;
    fn try_get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// The single writable batch. Only the flusher and raw import hold one.
pub trait WriteBatch: Send {
    fn metadata(&self) -> BatchMetadata;
    fn try_get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set_raw(&mut self, key: &[u8], value: &[u8]);
    /// Drop the whole subtree rooted at a full-length account path.
    fn destroy(&mut self, path: &NibblePath);
    fn delete_by_prefix(&mut self, key: &Key);
    fn set_metadata(&mut self, number: BlockNumber, hash: &H256);
    fn verify_pages_on_commit(&mut self);
    fn commit(self: Box<Self>, options: CommitOptions) -> io::Result<()>;
}

pub trait Backend: Send + Sync {
    fn begin_read_only_batch(&self, label: &str) -> Box<dyn ReadBatch>;
    /// A batch rooted exactly at `hash` when that root is still
    /// persisted, otherwise the most recent batch.
    fn begin_read_only_batch_or_latest(&self, hash: &H256, label: &str) -> Box<dyn ReadBatch>;
    fn begin_next_batch(&self) -> Box<dyn WriteBatch>;
    fn has_state(&self, hash: &H256) -> bool;
    /// One read batch per currently persisted root.
    fn snapshot_all(&self) -> Vec<Box<dyn ReadBatch>>;
    /// Number of distinct state roots kept readable on disk.
    fn history_depth(&self) -> u32;
    /// Full fsync.
    fn flush(&self) -> io::Result<()>;
}

/// A leased read batch shared between a block and its readers.
pub struct SharedBatch {
    batch: Box<dyn ReadBatch>,
    leases: LeaseCount,
}

impl SharedBatch {
    pub fn new(batch: Box<dyn ReadBatch>) -> Lease<SharedBatch> {
        Lease::adopt(Arc::new(SharedBatch {
            batch,
            leases: LeaseCount::new(),
        }))
    }

    pub fn metadata(&self) -> BatchMetadata {
        self.batch.metadata()
    }

    pub fn try_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.batch.try_get(key)
    }
}

impl RefCounted for SharedBatch {
    fn leases(&self) -> &LeaseCount {
        &self.leases
    }

    fn clean_up(&self) {
        ctrace!(STATE, "Read batch over {:?} released", self.metadata().state_hash);
    }
}

pub type BatchRef = Lease<SharedBatch>;
