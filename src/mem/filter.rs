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

//! Fixed-width probabilistic membership filter backed by pool pages.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::pool::{Page, PagePool, PAGE_SIZE, PAGE_WORDS};

/// Default filter width: 128 * PAGE_SIZE bits.
pub const FILTER_PAGES: usize = 16;

/// A bit-array approximate set keyed by 64-bit hashes. `add` followed by
/// `may_contain` of the same hash is always true; a `may_contain` hit for
/// a hash never added is possible and every call site tolerates it.
pub struct BitFilter {
    pool: Arc<PagePool>,
    pages: Vec<Box<Page>>,
    bit_mask: u64,
}

impl BitFilter {
    pub fn new(pool: &Arc<PagePool>) -> Self {
        Self::with_pages(pool, FILTER_PAGES)
    }

    pub fn with_pages(pool: &Arc<PagePool>, page_count: usize) -> Self {
        assert!(page_count.is_power_of_two());
        let pages = (0..page_count).map(|_| pool.rent()).collect();
        BitFilter {
            pool: Arc::clone(pool),
            pages,
            bit_mask: (page_count * PAGE_SIZE * 8) as u64 - 1,
        }
    }

    fn slot(&self, hash: u64) -> (&Page, usize, u64) {
        let bit = (hash & self.bit_mask) as usize;
        let word = bit / 64;
        (&self.pages[word / PAGE_WORDS], word % PAGE_WORDS, 1u64 << (bit % 64))
    }

    /// Set the bit for `hash`; returns true iff it was previously unset.
    /// Single-writer variant.
    pub fn add(&self, hash: u64) -> bool {
        let (page, word, bit) = self.slot(hash);
        let slot = page.word(word);
        let current = slot.load(Ordering::Relaxed);
        if current & bit != 0 {
            return false
        }
        slot.store(current | bit, Ordering::Relaxed);
        true
    }

    /// Like `add`, safe against concurrent writers. Used to deduplicate
    /// speculative prefetch work.
    pub fn add_atomic(&self, hash: u64) -> bool {
        let (page, word, bit) = self.slot(hash);
        page.word(word).fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    pub fn may_contain(&self, hash: u64) -> bool {
        let (page, word, bit) = self.slot(hash);
        page.word(word).load(Ordering::Relaxed) & bit != 0
    }

    /// Short-circuit disjunction on the same instance. A zero `second`
    /// hash means "not applicable" and is skipped.
    pub fn may_contain_any(&self, first: u64, second: u64) -> bool {
        self.may_contain(first) || (second != 0 && self.may_contain(second))
    }

    /// Destructively OR the given peers into this filter. All filters
    /// must share the same geometry.
    pub fn or_with(&mut self, others: &[&BitFilter]) {
        for other in others {
            assert_eq!(self.pages.len(), other.pages.len(), "filter width mismatch");
            for (dst, src) in self.pages.iter().zip(&other.pages) {
                for word in 0..PAGE_WORDS {
                    let bits = src.word(word).load(Ordering::Relaxed);
                    if bits != 0 {
                        dst.word(word).fetch_or(bits, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        for page in &self.pages {
            page.zero();
        }
    }
}

impl Drop for BitFilter {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            self.pool.give_back(page);
        }
    }
}
