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

//! Pooled byte-key/byte-value dictionary.
//!
//! Keys carry a caller-supplied 64-bit hash and a one-byte metadata tag.
//! Entries live in pool pages chained per bucket; an entry is published
//! by a release store of the bucket head after its bytes are written, so
//! a reader that observes the head observes complete entries. Arena
//! pages are never moved or freed while the dictionary lives.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::filter::BitFilter;
use super::pool::{Page, PagePool, PAGE_SIZE};

const BUCKETS: usize = 2048;

// Entry layout, little endian, unaligned:
// next u32 | hash u64 | key_len u16 | val_cap u16 | val_len u16 | meta u8 | flags u8 | key | value
const OFF_NEXT: usize = 0;
const OFF_HASH: usize = 4;
const OFF_KLEN: usize = 12;
const OFF_VCAP: usize = 14;
const OFF_VLEN: usize = 16;
const OFF_META: usize = 18;
const OFF_FLAGS: usize = 19;
const HEADER: usize = 20;

const FLAG_DEAD: u8 = 0b1;

/// How a dictionary may be shared.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Concurrency {
    /// One writer, no readers during writes. Values may be overwritten
    /// in place when the replacement fits.
    SingleWriter,
    /// Once a key is written, a reader racing an update observes either
    /// the old or the new value, never torn bytes: updates always append
    /// a fresh entry and republish the bucket head.
    PreserveOnceWritten,
}

pub struct SpanDict {
    pool: Arc<PagePool>,
    buckets: Box<[AtomicU32]>,
    pages: Vec<Box<Page>>,
    write_page: usize,
    write_pos: usize,
    mode: Concurrency,
    len: AtomicUsize,
    probes: AtomicU64,
}

impl SpanDict {
    pub fn new(pool: Arc<PagePool>, mode: Concurrency) -> Self {
        let buckets = (0..BUCKETS).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice();
        SpanDict {
            pool,
            buckets,
            pages: Vec::new(),
            write_page: 0,
            write_pos: PAGE_SIZE,
            mode,
            len: AtomicUsize::new(0),
            probes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `try_get` probes served so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    fn bucket(&self, hash: u64) -> &AtomicU32 {
        &self.buckets[(hash as usize) & (BUCKETS - 1)]
    }

    fn page_bytes(&self, page: usize) -> &[u8; PAGE_SIZE] {
        unsafe { self.pages[page].bytes() }
    }

    fn view(&self, addr: u32) -> EntryView<'_> {
        debug_assert_ne!(0, addr);
        EntryView {
            dict: self,
            page: (addr >> 12) as usize,
            off: (addr & 0xFFF) as usize,
        }
    }

    /// Insert or overwrite. The hash must be the same for every call
    /// with the same logical key.
    pub fn set(&mut self, key: &[u8], hash: u64, value: &[u8], meta: u8) {
        self.set_concat(key, hash, value, &[], meta)
    }

    /// Concatenation write: stores `value0 ++ value1` without the caller
    /// having to allocate the joined buffer.
    pub fn set_concat(&mut self, key: &[u8], hash: u64, value0: &[u8], value1: &[u8], meta: u8) {
        let total = value0.len() + value1.len();
        if let Some(addr) = self.find(hash, key) {
            let view = self.view(addr);
            if !view.is_dead() {
                if self.mode == Concurrency::SingleWriter && total <= view.val_cap() {
                    let (page, off) = (view.page, view.off);
                    let klen = view.key_len();
                    self.overwrite(page, off, klen, value0, value1, meta);
                    return
                }
                // Shadow the live entry with a fresh one at the head.
                view.kill();
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.append(key, hash, value0, value1, meta);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Append without probing for an existing entry. The caller asserts
    /// the key is not present.
    pub fn insert_new(&mut self, key: &[u8], hash: u64, value: &[u8], meta: u8) {
        self.append(key, hash, value, &[], meta);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn try_get(&self, key: &[u8], hash: u64) -> Option<(&[u8], u8)> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let mut addr = self.bucket(hash).load(Ordering::Acquire);
        while addr != 0 {
            let view = self.view(addr);
            if view.hash() == hash && view.key() == key {
                // The newest entry for a key decides; a tombstone
                // shadows anything older in the chain.
                if view.is_dead() {
                    return None
                }
                let (value, meta) = view.value_meta();
                return Some((value, meta))
            }
            addr = view.next();
        }
        None
    }

    pub fn iter(&self) -> Entries<'_> {
        Entries {
            dict: self,
            bucket: 0,
            addr: 0,
        }
    }

    /// Copy every live entry whose meta passes `keep` into `dest`,
    /// recording each copied hash in `filter`. `append_only` skips the
    /// existing-key probe and is only sound when the key sets are
    /// disjoint.
    pub fn copy_to(&self, dest: &mut SpanDict, keep: &dyn Fn(u8) -> bool, filter: &BitFilter, append_only: bool) {
        for entry in self.iter() {
            if !keep(entry.meta()) {
                continue
            }
            filter.add(entry.hash());
            if append_only {
                dest.insert_new(entry.key(), entry.hash(), entry.value(), entry.meta());
            } else {
                dest.set(entry.key(), entry.hash(), entry.value(), entry.meta());
            }
        }
    }

    /// Drop every entry and return the arena to the pool.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
        for page in self.pages.drain(..) {
            self.pool.give_back(page);
        }
        self.write_page = 0;
        self.write_pos = PAGE_SIZE;
        self.len.store(0, Ordering::Relaxed);
    }

    fn find(&self, hash: u64, key: &[u8]) -> Option<u32> {
        let mut addr = self.bucket(hash).load(Ordering::Relaxed);
        while addr != 0 {
            let view = self.view(addr);
            if view.hash() == hash && view.key() == key {
                return Some(addr)
            }
            addr = view.next();
        }
        None
    }

    fn overwrite(&mut self, page: usize, off: usize, key_len: usize, value0: &[u8], value1: &[u8], meta: u8) {
        let bytes = unsafe { self.pages[page].bytes_mut() };
        let total = value0.len() + value1.len();
        let value_off = off + HEADER + key_len;
        bytes[value_off..value_off + value0.len()].copy_from_slice(value0);
        bytes[value_off + value0.len()..value_off + total].copy_from_slice(value1);
        write_u16(bytes, off + OFF_VLEN, total as u16);
        bytes[off + OFF_META] = meta;
    }

    fn append(&mut self, key: &[u8], hash: u64, value0: &[u8], value1: &[u8], meta: u8) {
        let value_len = value0.len() + value1.len();
        let size = HEADER + key.len() + value_len;
        assert!(size <= PAGE_SIZE - 4, "entry of {} bytes exceeds a page", size);

        if self.pages.is_empty() || self.write_pos + size > PAGE_SIZE {
            self.pages.push(self.pool.rent());
            self.write_page = self.pages.len() - 1;
            // Address 0 is the null link, so page 0 never starts at 0.
            self.write_pos = if self.write_page == 0 {
                4
            } else {
                0
            };
        }

        let off = self.write_pos;
        self.write_pos += size;
        let addr = ((self.write_page as u32) << 12) | off as u32;

        let head = self.bucket(hash).load(Ordering::Relaxed);
        {
            let bytes = unsafe { self.pages[self.write_page].bytes_mut() };
            write_u32(bytes, off + OFF_NEXT, head);
            write_u64(bytes, off + OFF_HASH, hash);
            write_u16(bytes, off + OFF_KLEN, key.len() as u16);
            write_u16(bytes, off + OFF_VCAP, value_len as u16);
            write_u16(bytes, off + OFF_VLEN, value_len as u16);
            bytes[off + OFF_META] = meta;
            bytes[off + OFF_FLAGS] = 0;
            bytes[off + HEADER..off + HEADER + key.len()].copy_from_slice(key);
            let value_off = off + HEADER + key.len();
            bytes[value_off..value_off + value0.len()].copy_from_slice(value0);
            bytes[value_off + value0.len()..value_off + value_len].copy_from_slice(value1);
        }
        self.bucket(hash).store(addr, Ordering::Release);
    }
}

impl Drop for SpanDict {
    fn drop(&mut self) {
        self.clear();
    }
}

struct EntryView<'a> {
    dict: &'a SpanDict,
    page: usize,
    off: usize,
}

impl<'a> EntryView<'a> {
    fn bytes(&self) -> &'a [u8; PAGE_SIZE] {
        self.dict.page_bytes(self.page)
    }

    fn next(&self) -> u32 {
        read_u32(self.bytes(), self.off + OFF_NEXT)
    }

    fn hash(&self) -> u64 {
        read_u64(self.bytes(), self.off + OFF_HASH)
    }

    fn key_len(&self) -> usize {
        read_u16(self.bytes(), self.off + OFF_KLEN) as usize
    }

    fn val_cap(&self) -> usize {
        read_u16(self.bytes(), self.off + OFF_VCAP) as usize
    }

    fn val_len(&self) -> usize {
        read_u16(self.bytes(), self.off + OFF_VLEN) as usize
    }

    fn key(&self) -> &'a [u8] {
        let start = self.off + HEADER;
        &self.bytes()[start..start + self.key_len()]
    }

    fn value_meta(&self) -> (&'a [u8], u8) {
        let start = self.off + HEADER + self.key_len();
        (&self.bytes()[start..start + self.val_len()], self.bytes()[self.off + OFF_META])
    }

    fn meta(&self) -> u8 {
        self.bytes()[self.off + OFF_META]
    }

    fn is_dead(&self) -> bool {
        self.dict.pages[self.page].byte(self.off + OFF_FLAGS).load(Ordering::Relaxed) & FLAG_DEAD != 0
    }

    fn kill(&self) {
        self.dict.pages[self.page].byte(self.off + OFF_FLAGS).fetch_or(FLAG_DEAD, Ordering::Relaxed);
    }
}

/// Iterator over live entries, with in-place deletion.
pub struct Entries<'a> {
    dict: &'a SpanDict,
    bucket: usize,
    addr: u32,
}

impl<'a> Iterator for Entries<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<EntryRef<'a>> {
        loop {
            while self.addr == 0 {
                if self.bucket == BUCKETS {
                    return None
                }
                self.addr = self.dict.buckets[self.bucket].load(Ordering::Acquire);
                self.bucket += 1;
            }
            let addr = self.addr;
            let view = self.dict.view(addr);
            self.addr = view.next();
            if !view.is_dead() {
                return Some(EntryRef {
                    dict: self.dict,
                    addr,
                })
            }
        }
    }
}

/// A live entry yielded during iteration.
pub struct EntryRef<'a> {
    dict: &'a SpanDict,
    addr: u32,
}

impl<'a> EntryRef<'a> {
    pub fn key(&self) -> &'a [u8] {
        self.dict.view(self.addr).key()
    }

    pub fn hash(&self) -> u64 {
        self.dict.view(self.addr).hash()
    }

    pub fn value(&self) -> &'a [u8] {
        self.dict.view(self.addr).value_meta().0
    }

    pub fn meta(&self) -> u8 {
        self.dict.view(self.addr).meta()
    }

    /// Delete the entry in place. Subsequent lookups of its key miss.
    pub fn destroy(&self) {
        let view = self.dict.view(self.addr);
        if !view.is_dead() {
            view.kill();
            self.dict.len.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn write_u16(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(bytes: &mut [u8], off: usize, value: u64) {
    bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key_hash;

    fn dict(mode: Concurrency) -> SpanDict {
        SpanDict::new(Arc::new(PagePool::new()), mode)
    }

    fn h(key: &[u8]) -> u64 {
        key_hash(key)
    }

    #[test]
    fn set_and_get() {
        let mut dict = dict(Concurrency::SingleWriter);
        dict.set(b"alpha", h(b"alpha"), b"one", 3);

        assert_eq!(Some((&b"one"[..], 3)), dict.try_get(b"alpha", h(b"alpha")));
        assert_eq!(None, dict.try_get(b"beta", h(b"beta")));
        assert_eq!(1, dict.len());
    }

    #[test]
    fn overwrite_in_place_and_grow() {
        let mut dict = dict(Concurrency::SingleWriter);
        dict.set(b"k", h(b"k"), b"abcdef", 0);
        dict.set(b"k", h(b"k"), b"xy", 1);
        assert_eq!(Some((&b"xy"[..], 1)), dict.try_get(b"k", h(b"k")));

        dict.set(b"k", h(b"k"), b"a much longer value than before", 2);
        assert_eq!(Some((&b"a much longer value than before"[..], 2)), dict.try_get(b"k", h(b"k")));
        assert_eq!(1, dict.len());
    }

    #[test]
    fn preserve_mode_always_appends() {
        let mut dict = dict(Concurrency::PreserveOnceWritten);
        dict.set(b"k", h(b"k"), b"old", 0);
        dict.set(b"k", h(b"k"), b"new", 0);
        assert_eq!(Some((&b"new"[..], 0)), dict.try_get(b"k", h(b"k")));
        assert_eq!(1, dict.len());
        assert_eq!(1, dict.iter().count());
    }

    #[test]
    fn concat_write() {
        let mut dict = dict(Concurrency::SingleWriter);
        dict.set_concat(b"k", h(b"k"), b"head-", b"tail", 0);
        assert_eq!(Some((&b"head-tail"[..], 0)), dict.try_get(b"k", h(b"k")));
    }

    #[test]
    fn destroy_during_iteration() {
        let mut dict = dict(Concurrency::SingleWriter);
        dict.set(b"keep", h(b"keep"), b"1", 0);
        dict.set(b"drop", h(b"drop"), b"2", 0);

        for entry in dict.iter() {
            if entry.key() == b"drop" {
                entry.destroy();
            }
        }

        assert_eq!(None, dict.try_get(b"drop", h(b"drop")));
        assert!(dict.try_get(b"keep", h(b"keep")).is_some());
        assert_eq!(1, dict.len());
        assert_eq!(1, dict.iter().count());
    }

    #[test]
    fn set_after_destroy_revives_key() {
        let mut dict = dict(Concurrency::SingleWriter);
        dict.set(b"k", h(b"k"), b"old", 0);
        for entry in dict.iter() {
            entry.destroy();
        }
        assert_eq!(None, dict.try_get(b"k", h(b"k")));

        dict.set(b"k", h(b"k"), b"new", 0);
        assert_eq!(Some((&b"new"[..], 0)), dict.try_get(b"k", h(b"k")));
        assert_eq!(1, dict.len());
    }

    #[test]
    fn copy_to_filters_meta_and_populates_filter() {
        let pool = Arc::new(PagePool::new());
        let mut src = SpanDict::new(Arc::clone(&pool), Concurrency::SingleWriter);
        let mut dest = SpanDict::new(Arc::clone(&pool), Concurrency::SingleWriter);
        let filter = BitFilter::new(&pool);

        src.set(b"keep1", h(b"keep1"), b"a", 0);
        src.set(b"skip", h(b"skip"), b"b", 9);
        src.set(b"keep2", h(b"keep2"), b"c", 1);

        src.copy_to(&mut dest, &|meta| meta != 9, &filter, true);

        assert_eq!(2, dest.len());
        assert!(dest.try_get(b"keep1", h(b"keep1")).is_some());
        assert!(dest.try_get(b"keep2", h(b"keep2")).is_some());
        assert_eq!(None, dest.try_get(b"skip", h(b"skip")));
        assert!(filter.may_contain(h(b"keep1")));
        assert!(filter.may_contain(h(b"keep2")));
    }

    #[test]
    fn many_entries_span_pages() {
        let pool = Arc::new(PagePool::new());
        let mut dict = SpanDict::new(Arc::clone(&pool), Concurrency::SingleWriter);
        let value = [0x5Au8; 100];

        for i in 0..500u32 {
            let key = i.to_le_bytes();
            dict.set(&key, h(&key), &value, 0);
        }
        assert!(pool.outstanding() > 1);
        assert_eq!(500, dict.len());

        for i in 0..500u32 {
            let key = i.to_le_bytes();
            let (got, _) = dict.try_get(&key, h(&key)).unwrap();
            assert_eq!(&value[..], got);
        }

        drop(dict);
        assert_eq!(0, pool.outstanding());
    }

    #[test]
    fn probe_counter_counts_lookups() {
        let mut dict = dict(Concurrency::SingleWriter);
        dict.set(b"k", h(b"k"), b"v", 0);
        assert_eq!(0, dict.probe_count());
        dict.try_get(b"k", h(b"k"));
        dict.try_get(b"missing", h(b"missing"));
        assert_eq!(2, dict.probe_count());
    }

    #[test]
    fn colliding_hashes_resolved_by_key_compare() {
        let mut dict = dict(Concurrency::SingleWriter);
        // Same artificial hash for two distinct keys.
        dict.set(b"first", 42, b"1", 0);
        dict.set(b"second", 42, b"2", 0);

        assert_eq!(Some((&b"1"[..], 0)), dict.try_get(b"first", 42));
        assert_eq!(Some((&b"2"[..], 0)), dict.try_get(b"second", 42));
        assert_eq!(None, dict.try_get(b"third", 42));
    }

    #[test]
    fn clear_resets_and_returns_pages() {
        let pool = Arc::new(PagePool::new());
        let mut dict = SpanDict::new(Arc::clone(&pool), Concurrency::SingleWriter);
        dict.set(b"k", h(b"k"), b"v", 0);
        dict.clear();

        assert_eq!(0, pool.outstanding());
        assert_eq!(0, dict.len());
        assert_eq!(None, dict.try_get(b"k", h(b"k")));

        dict.set(b"k", h(b"k"), b"v2", 0);
        assert_eq!(Some((&b"v2"[..], 0)), dict.try_get(b"k", h(b"k")));
    }
}
