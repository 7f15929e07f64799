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

mod committed;
mod index;
mod live;
mod prefetch;

pub use self::committed::CommittedBlock;
pub use self::index::BlockIndex;
pub use self::live::LiveBlock;
pub use self::prefetch::Prefetcher;

pub(crate) use self::committed::Probe;
pub(crate) use self::index::AddOutcome;
pub(crate) use self::live::LiveCommit;

use std::sync::atomic::{AtomicU64, Ordering};

use primitive_types::H256;

use crate::backend::SharedBatch;
use crate::mem::filter::BitFilter;
use crate::mem::lease::Lease;

/// Depth a database hit is reported with; ancestors report their
/// position in the chain, starting at 1.
pub(crate) const DEPTH_DB: u32 = u32::max_value();

pub(crate) enum ReadOutcome {
    /// A value and the depth it was found at (0 = own block).
    Value(Vec<u8>, u32),
    /// Authoritative empty: the tree holds no such entry.
    Empty,
}

/// The shared tail of the read protocol: walk the ancestor chain guided
/// by the merged filter, then fall through to the store batch.
pub(crate) fn read_ancestors_and_db(
    ancestors: &[Lease<CommittedBlock>],
    ancestors_filter: Option<&BitFilter>,
    batch: &SharedBatch,
    db_reads: &AtomicU64,
    encoded: &[u8],
    hash: u64,
    destroyed: u64,
    owner: Option<&H256>,
) -> ReadOutcome {
    let may_have_ancestor_entry = match ancestors_filter {
        Some(filter) => filter.may_contain_any(hash, destroyed),
        None => false,
    };
    if may_have_ancestor_entry {
        for (position, ancestor) in ancestors.iter().enumerate() {
            match ancestor.probe(encoded, hash, destroyed, owner) {
                Probe::Hit(value) => return ReadOutcome::Value(value.to_vec(), position as u32 + 1),
                Probe::Destroyed => return ReadOutcome::Empty,
                Probe::Miss => {}
            }
        }
    }

    db_reads.fetch_add(1, Ordering::Relaxed);
    match batch.try_get(encoded) {
        Some(value) => ReadOutcome::Value(value, DEPTH_DB),
        None => ReadOutcome::Empty,
    }
}

/// OR the filters of an ancestor chain into one fresh filter; none when
/// the chain is empty.
pub(crate) fn merge_ancestor_filters(
    pool: &std::sync::Arc<crate::mem::pool::PagePool>,
    ancestors: &[Lease<CommittedBlock>],
) -> Option<BitFilter> {
    if ancestors.is_empty() {
        return None
    }
    let mut merged = BitFilter::new(pool);
    let peers: Vec<&BitFilter> = ancestors.iter().map(|ancestor| ancestor.filter()).collect();
    merged.or_with(&peers);
    Some(merged)
}
