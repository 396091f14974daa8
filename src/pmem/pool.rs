//! A file-backed memory pool.
//!
//! The pool file is mapped in full. It starts with a header page holding the allocator state and
//! the offset of the table root; everything after it is handed out in blocks of `64 << class`
//! bytes. Objects in the pool refer to each other by offset, never by address, so a pool can be
//! mapped anywhere when it is reopened.

use super::durable::{FlushPoint, Persister, Region};
use crate::error::{Error, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicIsize, AtomicU64, AtomicU8, AtomicUsize, Ordering};

const MAGIC: u64 = u64::from_le_bytes(*b"CLHTPOOL");
const LAYOUT_VERSION: u64 = 1;

/// Size of the header page; the first block starts right after it.
pub(crate) const HEADER_SIZE: u64 = 4096;

const BLOCK: u64 = 64;
const CLASSES: usize = 40;

/// Types that may live inside the pool.
///
/// # Safety
///
/// Implementors must have a fixed layout (`repr(C)` or `repr(transparent)`), consist only of
/// atomics and other `PoolSafe` types, and be valid when every byte is zero. Their alignment
/// must not exceed 64.
pub(crate) unsafe trait PoolSafe: Sync {}

unsafe impl PoolSafe for AtomicU8 {}
unsafe impl PoolSafe for AtomicBool {}
unsafe impl PoolSafe for AtomicU64 {}
unsafe impl PoolSafe for AtomicI64 {}
unsafe impl PoolSafe for AtomicUsize {}
unsafe impl PoolSafe for AtomicIsize {}
unsafe impl<T: PoolSafe, const N: usize> PoolSafe for [T; N] {}

/// Offset of a `T` inside the pool. `0` is null, since the header occupies that spot.
#[repr(transparent)]
pub(crate) struct POff<T>(u64, PhantomData<fn() -> T>);

impl<T> POff<T> {
    pub(crate) const NULL: Self = POff(0, PhantomData);

    pub(crate) const fn new(offset: u64) -> Self {
        POff(offset, PhantomData)
    }

    pub(crate) const fn get(self) -> u64 {
        self.0
    }

    pub(crate) const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl<T> Clone for POff<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for POff<T> {}

impl<T> PartialEq for POff<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for POff<T> {}

impl<T> fmt::Debug for POff<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "POff({:#x})", self.0)
    }
}

/// An offset that can be changed concurrently.
#[repr(transparent)]
pub(crate) struct AtomicOff<T>(AtomicU64, PhantomData<fn() -> T>);

unsafe impl<T> PoolSafe for AtomicOff<T> {}

impl<T> AtomicOff<T> {
    pub(crate) fn load(&self, ordering: Ordering) -> POff<T> {
        POff::new(self.0.load(ordering))
    }

    pub(crate) fn store(&self, off: POff<T>, ordering: Ordering) {
        self.0.store(off.get(), ordering)
    }

    pub(crate) fn swap(&self, off: POff<T>, ordering: Ordering) -> POff<T> {
        POff::new(self.0.swap(off.get(), ordering))
    }
}

impl<T> fmt::Debug for AtomicOff<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

#[repr(C)]
struct Header {
    magic: AtomicU64,
    layout: AtomicU64,
    size: AtomicU64,
    bump: AtomicU64,
    root: AtomicU64,
    free: [AtomicU64; CLASSES],
}

unsafe impl PoolSafe for Header {}

const _: () = assert!(mem::size_of::<Header>() as u64 <= HEADER_SIZE);

/// Rounds an allocation up to its size class.
fn class_of(bytes: u64) -> usize {
    let blocks = ((bytes + BLOCK - 1) / BLOCK).max(1);
    blocks.next_power_of_two().trailing_zeros() as usize
}

fn class_size(class: usize) -> u64 {
    BLOCK << class
}

pub(crate) struct Pool {
    map: MmapMut,
    base: NonNull<u8>,
    len: u64,
    alloc_lock: Mutex<()>,
    persister: Box<dyn Persister>,
}

// safety: all shared state in the mapping is accessed through atomics, and the allocator state is
// only changed under `alloc_lock`.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Formats `file` as an empty pool of `size` bytes.
    pub(crate) fn create(file: &File, size: u64, persister: Box<dyn Persister>) -> Result<Self> {
        if size < HEADER_SIZE + BLOCK {
            return Err(Error::InvalidConfig("pool size must leave room for at least one block"));
        }
        let size = size & !(BLOCK - 1);
        file.set_len(size)?;
        let pool = Self::map(file, size, persister)?;

        let h = pool.header();
        h.layout.store(LAYOUT_VERSION, Ordering::Relaxed);
        h.size.store(size, Ordering::Relaxed);
        h.bump.store(HEADER_SIZE, Ordering::Relaxed);
        h.root.store(0, Ordering::Relaxed);
        for head in &h.free {
            head.store(0, Ordering::Relaxed);
        }
        pool.persist(FlushPoint::Init, h)?;
        // the magic goes last; a pool without it is not a pool
        h.magic.store(MAGIC, Ordering::Release);
        pool.persist(FlushPoint::Init, &h.magic)?;
        log::debug!("formatted a pool of {} bytes", size);
        Ok(pool)
    }

    /// Maps an existing pool and checks its header.
    pub(crate) fn open(file: &File, persister: Box<dyn Persister>) -> Result<Self> {
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(Error::Corrupt(format!("pool file of {} bytes has no header", len)));
        }
        let pool = Self::map(file, len, persister)?;
        let h = pool.header();
        if h.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::Corrupt("not a pool file".into()));
        }
        let layout = h.layout.load(Ordering::Relaxed);
        if layout != LAYOUT_VERSION {
            return Err(Error::Corrupt(format!(
                "pool layout {} is not supported (expected {})",
                layout, LAYOUT_VERSION
            )));
        }
        let size = h.size.load(Ordering::Relaxed);
        if size != len {
            return Err(Error::Corrupt(format!(
                "pool header claims {} bytes, file has {}",
                size, len
            )));
        }
        let bump = h.bump.load(Ordering::Relaxed);
        if bump < HEADER_SIZE || bump > size || bump % BLOCK != 0 {
            return Err(Error::Corrupt(format!("allocator watermark {:#x} out of range", bump)));
        }
        Ok(pool)
    }

    fn map(file: &File, len: u64, persister: Box<dyn Persister>) -> Result<Self> {
        // safety: the pool file is owned by this process for as long as the mapping lives; other
        // processes sharing the file are not supported.
        let mut map = unsafe { MmapMut::map_mut(file)? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::Corrupt("empty mapping".into()))?;
        Ok(Pool {
            map,
            base,
            len,
            alloc_lock: Mutex::new(()),
            persister,
        })
    }

    fn header(&self) -> &Header {
        // safety: the header page is always mapped, and page alignment covers `Header`.
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Bytes never handed out yet. Freed blocks are not counted.
    pub(crate) fn available(&self) -> u64 {
        self.len - self.header().bump.load(Ordering::Relaxed)
    }

    fn check<T>(&self, offset: u64, n: usize) -> Result<()> {
        let bytes = (mem::size_of::<T>() as u64).checked_mul(n as u64);
        let end = bytes.and_then(|b| offset.checked_add(b));
        if offset < HEADER_SIZE
            || offset % mem::align_of::<T>() as u64 != 0
            || end.map_or(true, |end| end > self.len)
        {
            return Err(Error::Corrupt(format!(
                "offset {:#x} does not point at {} {} in the pool",
                offset,
                n,
                std::any::type_name::<T>()
            )));
        }
        Ok(())
    }

    /// Resolves an offset that is known to be valid.
    ///
    /// # Panics
    ///
    /// Panics if the offset is null or points outside the pool.
    #[inline]
    pub(crate) fn get<T: PoolSafe>(&self, off: POff<T>) -> &T {
        match self.try_get(off) {
            Ok(t) => t,
            Err(e) => panic!("{}", e),
        }
    }

    /// Resolves an offset read from a pool that may be damaged.
    pub(crate) fn try_get<T: PoolSafe>(&self, off: POff<T>) -> Result<&T> {
        self.check::<T>(off.get(), 1)?;
        // safety: in bounds and aligned, and any bit pattern of a `PoolSafe` type is valid.
        Ok(unsafe { &*(self.base.as_ptr().add(off.get() as usize) as *const T) })
    }

    pub(crate) fn slice<T: PoolSafe>(&self, off: POff<T>, n: usize) -> Result<&[T]> {
        self.check::<T>(off.get(), n)?;
        // safety: as in `try_get`.
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(off.get() as usize) as *const T, n)
        })
    }

    /// Offset of something that lives in the pool.
    #[cfg(test)]
    pub(crate) fn offset_of<T: PoolSafe>(&self, r: &T) -> POff<T> {
        let addr = r as *const T as usize;
        let base = self.base.as_ptr() as usize;
        debug_assert!(addr >= base && addr < base + self.len as usize);
        POff::new((addr - base) as u64)
    }

    /// Writes the bytes of `value` back and fences.
    pub(crate) fn persist<T: ?Sized>(&self, point: FlushPoint, value: &T) -> Result<()> {
        let ptr = value as *const T as *const u8;
        let offset = ptr as usize - self.base.as_ptr() as usize;
        self.persist_range(point, ptr, offset, mem::size_of_val(value))
    }

    fn persist_range(&self, point: FlushPoint, ptr: *const u8, offset: usize, len: usize) -> Result<()> {
        debug_assert!(offset + len <= self.len as usize);
        self.persister
            .flush(point, Region::new(&self.map, ptr, offset, len))?;
        self.persister.fence(point);
        Ok(())
    }

    pub(crate) fn root<T>(&self) -> POff<T> {
        POff::new(self.header().root.load(Ordering::Acquire))
    }

    pub(crate) fn set_root<T>(&self, root: POff<T>) -> Result<()> {
        let h = self.header();
        h.root.store(root.get(), Ordering::Release);
        self.persist(FlushPoint::Init, &h.root)
    }

    /// Allocates room for `n` zeroed `T`s.
    pub(crate) fn alloc<T: PoolSafe>(&self, n: usize) -> Result<POff<T>> {
        let bytes = (mem::size_of::<T>() as u64).saturating_mul(n as u64);
        let class = class_of(bytes);
        if class >= CLASSES {
            return Err(Error::PoolExhausted {
                requested: bytes as usize,
                available: self.available() as usize,
            });
        }
        let size = class_size(class);

        let h = self.header();
        let offset = {
            let _lock = self.alloc_lock.lock();
            let head = h.free[class].load(Ordering::Relaxed);
            if head != 0 {
                self.check::<AtomicU64>(head, 1)?;
                // safety: freed blocks start with the offset of the next free block.
                let next = unsafe { &*(self.base.as_ptr().add(head as usize) as *const AtomicU64) }
                    .load(Ordering::Relaxed);
                h.free[class].store(next, Ordering::Relaxed);
                self.persist(FlushPoint::Allocator, &h.free[class])?;
                head
            } else {
                let bump = h.bump.load(Ordering::Relaxed);
                if bump + size > self.len {
                    return Err(Error::PoolExhausted {
                        requested: size as usize,
                        available: (self.len - bump) as usize,
                    });
                }
                h.bump.store(bump + size, Ordering::Relaxed);
                self.persist(FlushPoint::Allocator, &h.bump)?;
                bump
            }
        };

        // safety: the block was just taken off the allocator, nobody else can see it.
        unsafe {
            let ptr = self.base.as_ptr().add(offset as usize);
            ptr::write_bytes(ptr, 0, size as usize);
            self.persist_range(FlushPoint::Allocator, ptr, offset as usize, size as usize)?;
        }
        Ok(POff::new(offset))
    }

    /// Returns the block of `n` `T`s at `off` to the allocator.
    ///
    /// # Safety
    ///
    /// The block must have come from `alloc::<T>(n)`, and no thread may use it anymore.
    pub(crate) unsafe fn free<T: PoolSafe>(&self, off: POff<T>, n: usize) -> Result<()> {
        let bytes = mem::size_of::<T>() as u64 * n as u64;
        let class = class_of(bytes);
        self.check::<T>(off.get(), n)?;
        let h = self.header();
        let _lock = self.alloc_lock.lock();
        // safety: the block is ours again, and at least 64 bytes long.
        let link = &*(self.base.as_ptr().add(off.get() as usize) as *const AtomicU64);
        link.store(h.free[class].load(Ordering::Relaxed), Ordering::Relaxed);
        self.persist(FlushPoint::Reclaim, link)?;
        h.free[class].store(off.get(), Ordering::Relaxed);
        self.persist(FlushPoint::Reclaim, &h.free[class])
    }

    /// Synchronously writes the whole pool back to its file.
    pub(crate) fn sync_all(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.len)
            .field("available", &self.available())
            .field("persister", &self.persister)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::durable::NoFlush;

    fn pool(size: u64) -> (File, Pool) {
        let file = tempfile::tempfile().unwrap();
        let pool = Pool::create(&file, size, Box::new(NoFlush)).unwrap();
        (file, pool)
    }

    #[test]
    fn classes() {
        assert_eq!(class_of(0), 0);
        assert_eq!(class_of(64), 0);
        assert_eq!(class_of(65), 1);
        assert_eq!(class_of(64 * 8), 3);
        assert_eq!(class_of(64 * 9), 4);
        assert_eq!(class_size(4), 1024);
    }

    #[test]
    fn alloc_and_reuse() {
        let (_f, p) = pool(64 * 1024);
        let a = p.alloc::<AtomicU64>(1).unwrap();
        let b = p.alloc::<AtomicU64>(1).unwrap();
        assert_eq!(a.get(), HEADER_SIZE);
        assert_eq!(b.get(), HEADER_SIZE + 64);
        p.get(a).store(99, Ordering::Relaxed);
        unsafe { p.free(a, 1).unwrap() };
        // the freed block comes back, zeroed
        let c = p.alloc::<AtomicU64>(1).unwrap();
        assert_eq!(c, a);
        assert_eq!(p.get(c).load(Ordering::Relaxed), 0);
        assert_eq!(p.offset_of(p.get(b)), b);
    }

    #[test]
    fn exhaustion() {
        let (_f, p) = pool(HEADER_SIZE + 256);
        assert!(p.alloc::<[AtomicU64; 8]>(4).is_ok());
        assert_eq!(p.available(), 0);
        match p.alloc::<AtomicU64>(1) {
            Err(Error::PoolExhausted { requested, available }) => {
                assert_eq!(requested, 64);
                assert_eq!(available, 0);
            }
            r => panic!("unexpected {:?}", r.map(|o| o.get())),
        }
    }

    #[test]
    fn bad_offsets() {
        let (_f, p) = pool(64 * 1024);
        assert!(p.try_get(POff::<AtomicU64>::NULL).is_err());
        assert!(p.try_get(POff::<AtomicU64>::new(HEADER_SIZE + 3)).is_err());
        assert!(p.try_get(POff::<AtomicU64>::new(64 * 1024)).is_err());
        assert!(p.slice(POff::<AtomicU64>::new(HEADER_SIZE), 1 << 20).is_err());
    }

    #[test]
    fn reopen() {
        let (f, p) = pool(64 * 1024);
        let a = p.alloc::<AtomicU64>(1).unwrap();
        p.get(a).store(7, Ordering::Relaxed);
        p.set_root(a).unwrap();
        drop(p);
        let p = Pool::open(&f, Box::new(NoFlush)).unwrap();
        let root = p.root::<AtomicU64>();
        assert_eq!(root, a);
        assert_eq!(p.get(root).load(Ordering::Relaxed), 7);
        assert_eq!(p.alloc::<AtomicU64>(1).unwrap().get(), HEADER_SIZE + 64);
    }

    #[test]
    fn rejects_garbage() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(64 * 1024).unwrap();
        assert!(matches!(
            Pool::open(&file, Box::new(NoFlush)),
            Err(Error::Corrupt(_))
        ));
        let small = tempfile::tempfile().unwrap();
        small.set_len(100).unwrap();
        assert!(matches!(
            Pool::open(&small, Box::new(NoFlush)),
            Err(Error::Corrupt(_))
        ));
    }
}
