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

//! Fixed-size page allocator shared by the dictionaries and filters.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_WORDS: usize = PAGE_SIZE / 8;

/// One pooled page. Access goes either through the atomic word view
/// (filters) or through the raw byte view (dictionaries), never both on
/// the same rented page.
#[repr(C, align(4096))]
pub struct Page(UnsafeCell<[u8; PAGE_SIZE]>);

// All mutation of page bytes happens before the referencing index entry
// is published with a release store, or through the atomic views below.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn zeroed() -> Box<Page> {
        Box::new(Page(UnsafeCell::new([0u8; PAGE_SIZE])))
    }

    pub fn zero(&self) {
        unsafe {
            *self.0.get() = [0u8; PAGE_SIZE];
        }
    }

    /// Raw byte view. The caller must not race this with writers.
    pub unsafe fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &*self.0.get()
    }

    /// Mutable byte view. The caller guarantees exclusive access to the
    /// touched range until the bytes are published.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8; PAGE_SIZE] {
        &mut *self.0.get()
    }

    /// The page interpreted as 64-bit atomic words.
    pub fn word(&self, index: usize) -> &AtomicU64 {
        assert!(index < PAGE_WORDS);
        // The page is 4096-aligned, so every 8-byte word within it is
        // well aligned for AtomicU64.
        unsafe { &*(self.0.get() as *const AtomicU64).add(index) }
    }

    /// A single byte interpreted atomically, for flags that mutate after
    /// the surrounding entry was published.
    pub fn byte(&self, offset: usize) -> &AtomicU8 {
        assert!(offset < PAGE_SIZE);
        unsafe { &*(self.0.get() as *const AtomicU8).add(offset) }
    }
}

/// Page allocator returning fixed-size aligned buffers and tracking how
/// many are rented out.
pub struct PagePool {
    free: Mutex<Vec<Box<Page>>>,
    outstanding: AtomicUsize,
}

impl PagePool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Rent a zeroed page.
    pub fn rent(&self) -> Box<Page> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        match self.free.lock().pop() {
            Some(page) => {
                page.zero();
                page
            }
            None => Page::zeroed(),
        }
    }

    pub fn give_back(&self, page: Box<Page>) {
        let before = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        assert_ne!(0, before, "more pages returned than rented");
        self.free.lock().push(page);
    }

    /// Number of pages currently rented out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Rent a page that returns itself when the guard is dropped.
    pub fn scratch(&self) -> ScratchPage<'_> {
        ScratchPage {
            pool: self,
            page: Some(self.rent()),
        }
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped page rental, used for per-item scratch buffers.
pub struct ScratchPage<'a> {
    pool: &'a PagePool,
    page: Option<Box<Page>>,
}

impl<'a> Deref for ScratchPage<'a> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.page.as_ref().expect("page present until drop; qed")
    }
}

impl<'a> Drop for ScratchPage<'a> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pool.give_back(page);
        }
    }
}
