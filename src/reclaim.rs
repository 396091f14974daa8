//! Thin typed wrappers over `seize` for the heap tables.
//!
//! Generations and lock-free resize targets are the only objects reclaimed through these; the
//! overflow buckets of a generation are owned by it and go away with it.

pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::{fmt, ptr};

/// An atomic pointer to a collector-linked heap object.
pub(crate) struct Atomic<T>(AtomicPtr<Linked<T>>);

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        guard.protect(&self.0, ordering).into()
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ordering: Ordering) {
        self.0.store(new.ptr, ordering);
    }

    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        ord: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        self.0.swap(new.ptr, ord).into()
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic(shared.ptr.into())
    }
}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0.load(Ordering::SeqCst))
    }
}

/// A pointer loaded under a guard, valid for as long as the guard is.
pub(crate) struct Shared<'g, T> {
    ptr: *mut Linked<T>,
    _g: PhantomData<&'g ()>,
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    /// Takes back ownership of an object that was never published, or that has been unlinked
    /// by the last thread able to reach it.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, and no other thread may hold on to it.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.ptr) }
    }

    /// Dereference the shared pointer if it is not null.
    ///
    /// # Safety
    ///
    /// All concerns of calling `as_ref` on a shared, raw pointer apply.
    pub(crate) unsafe fn as_ref(&self) -> Option<&'g Linked<T>> {
        unsafe { self.ptr.as_ref() }
    }

    /// Dereference the shared pointer.
    ///
    /// # Safety
    ///
    /// All concerns of dereferencing a shared, raw pointer apply.
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.ptr }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Whether this points at the object `other` refers to.
    pub(crate) fn is(&self, other: &T) -> bool {
        if self.ptr.is_null() {
            return false;
        }
        // safety: non-null pointers loaded under a guard are valid for the guard's lifetime.
        let this: &T = unsafe { &*self.ptr };
        ptr::eq(this, other)
    }
}

impl<'g, T> PartialEq<Shared<'g, T>> for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        Shared::from(self.ptr)
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(ptr: *mut Linked<T>) -> Self {
        Shared {
            ptr,
            _g: PhantomData,
        }
    }
}

pub(crate) trait RetireShared {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);
}

impl RetireShared for Guard<'_> {
    /// Hands an unlinked object to the collector, which frees it once every guard that may have
    /// loaded it is gone.
    ///
    /// # Safety
    ///
    /// The object must be non-null and unreachable from any shared location.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.defer_retire(shared.ptr, seize::reclaim::boxed::<Linked<T>>) }
    }
}
