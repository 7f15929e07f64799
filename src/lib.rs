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

//! In-memory versioned block-state layer over a paged state store.
//!
//! Execution forks a [`LiveBlock`] from any recent head, mutates accounts
//! and storage, and commits it into an immutable [`CommittedBlock`] that
//! is registered in the process-wide block index. `finalize` streams the
//! chain of committed blocks to a single background flusher which applies
//! them to the paged store and fsyncs once per drained queue. Reads walk
//! own buffers, then the in-memory ancestor chain guided by bit filters,
//! then the store.

extern crate crc32fast;
extern crate crossbeam_channel;
#[macro_use]
extern crate codechain_logger as clogger;
#[macro_use]
extern crate log;
extern crate parking_lot;
extern crate primitive_types;
extern crate rlp;
extern crate siphasher;

mod backend;
mod block;
mod blockchain;
mod error;
mod flusher;
mod item;
mod key;
mod mem;
mod precommit;
mod raw;
mod reader;


/// Height of a block within a chain.
pub type BlockNumber = u64;

pub use primitive_types::{H256, U256};

pub use crate::backend::{Backend, BatchMetadata, CommitOptions, ReadBatch, SharedBatch, WriteBatch};
pub use crate::block::{BlockIndex, CommittedBlock, LiveBlock, Prefetcher};
pub use crate::blockchain::{Blockchain, BlockstateConfig, ChainNotify};
pub use crate::error::Error;
pub use crate::item::account::Account;
pub use crate::key::{key_hash, normalize_root, EMPTY_TREE_HASH};
pub use crate::key::{Key, KeyKind, NibblePath};
pub use crate::mem::dict::{Concurrency, SpanDict};
pub use crate::mem::filter::BitFilter;
pub use crate::mem::lease::{Lease, LeaseCount, RefCounted};
pub use crate::mem::pool::{PagePool, PAGE_SIZE};
pub use crate::precommit::{CacheBudget, Commit, EntryTag, PreCommit, PrefetchContext};
pub use crate::raw::RawState;
pub use crate::reader::{Accessor, ReadOnlyView};
