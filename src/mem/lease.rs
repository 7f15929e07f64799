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

//! Lease-based lifetime tracking for shared, long-lived entities.
//!
//! Unlike a plain `Arc` count, a lease count is decoupled from memory
//! ownership: when the last lease is released the entity runs its
//! `clean_up` (returning pooled pages, deregistering from indexes) even
//! though `Arc`s may still point at it, and acquiring a lease on an
//! already cleaned-up entity is a programming error.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct LeaseCount(AtomicU32);

impl LeaseCount {
    /// A new count starts with the creation lease already taken.
    pub fn new() -> Self {
        LeaseCount(AtomicU32::new(1))
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        assert!(self.try_acquire(), "lease acquired on a released entity");
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false
            }
            match self.0.compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Returns true when this release dropped the last lease.
    fn release(&self) -> bool {
        let before = self.0.fetch_sub(1, Ordering::Release);
        assert_ne!(0, before, "lease released twice");
        if before == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

impl Default for LeaseCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by entities whose lifetime is governed by leases.
pub trait RefCounted {
    fn leases(&self) -> &LeaseCount;
    /// Runs exactly once, when the last lease is released.
    fn clean_up(&self);
}

/// An outstanding lease. Cloning acquires another lease; dropping
/// releases one, running `clean_up` on the last.
pub struct Lease<T: RefCounted> {
    target: Arc<T>,
}

impl<T: RefCounted> Lease<T> {
    /// Adopt the creation lease of a freshly constructed entity.
    pub fn adopt(target: Arc<T>) -> Self {
        debug_assert!(target.leases().count() > 0);
        Lease {
            target,
        }
    }

    /// Acquire a further lease. Panics if the entity was cleaned up.
    pub fn acquire(target: &Arc<T>) -> Self {
        target.leases().acquire();
        Lease {
            target: Arc::clone(target),
        }
    }

    /// Acquire a lease unless the entity is already being cleaned up.
    pub fn try_acquire(target: &Arc<T>) -> Option<Self> {
        if target.leases().try_acquire() {
            Some(Lease {
                target: Arc::clone(target),
            })
        } else {
            None
        }
    }

    pub fn arc(&self) -> &Arc<T> {
        &self.target
    }
}

impl<T: RefCounted> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.target
    }
}

impl<T: RefCounted> Clone for Lease<T> {
    fn clone(&self) -> Self {
        Lease::acquire(&self.target)
    }
}

impl<T: RefCounted> Drop for Lease<T> {
    fn drop(&mut self) {
        if self.target.leases().release() {
            self.target.clean_up();
        }
    }
}

/// Release a creation lease held outside a `Lease` wrapper, running
/// `clean_up` if it was the last one.
pub fn release_raw<T: RefCounted>(target: &T) {
    if target.leases().release() {
        target.clean_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        leases: LeaseCount,
        cleaned: AtomicUsize,
    }

    impl Tracked {
        fn new() -> Arc<Self> {
            Arc::new(Tracked {
                leases: LeaseCount::new(),
                cleaned: AtomicUsize::new(0),
            })
        }
    }

    impl RefCounted for Tracked {
        fn leases(&self) -> &LeaseCount {
            &self.leases
        }

        fn clean_up(&self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn clean_up_runs_on_last_release() {
        let entity = Tracked::new();
        let first = Lease::adopt(Arc::clone(&entity));
        let second = Lease::acquire(&entity);

        drop(first);
        assert_eq!(0, entity.cleaned.load(Ordering::SeqCst));
        drop(second);
        assert_eq!(1, entity.cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn try_acquire_fails_after_clean_up() {
        let entity = Tracked::new();
        let lease = Lease::adopt(Arc::clone(&entity));
        drop(lease);

        assert!(Lease::try_acquire(&entity).is_none());
    }

    #[test]
    #[should_panic(expected = "released entity")]
    fn acquire_after_clean_up_panics() {
        let entity = Tracked::new();
        drop(Lease::adopt(Arc::clone(&entity)));
        let _ = Lease::acquire(&entity);
    }

    #[test]
    fn clone_extends_lifetime() {
        let entity = Tracked::new();
        let lease = Lease::adopt(Arc::clone(&entity));
        let cloned = lease.clone();
        drop(lease);
        assert_eq!(0, entity.cleaned.load(Ordering::SeqCst));
        drop(cloned);
        assert_eq!(1, entity.cleaned.load(Ordering::SeqCst));
    }
}
