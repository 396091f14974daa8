use memmap2::MmapMut;
use std::fmt;
use std::io;
use std::sync::atomic::{self, Ordering};
use std::sync::Arc;

pub(crate) const CACHE_LINE: usize = 64;

/// The places where the persistent table writes data back to the pool.
///
/// Every flush names its point, which lets a [`Persister`] single out one step of the protocol,
/// for instance to simulate a crash right there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FlushPoint {
    /// The value of a new entry, before its key is written.
    SlotValue,
    /// The key of a new entry; once this is durable the entry exists.
    SlotKey,
    /// The cleared key of a removed entry.
    SlotRemove,
    /// The replaced value of an updated entry.
    SlotUpdate,
    /// A new overflow bucket, before it is linked into its chain.
    BucketCreate,
    /// The link to a new overflow bucket.
    BucketLink,
    /// A resize target: its header when it is allocated, then all of it once migrated, before
    /// it replaces the current one.
    Generation,
    /// The root's pointer to the current generation, right after the swap.
    RootSwap,
    /// The replaced generation, after the swap.
    Retire,
    /// Unlinking and freeing old generations.
    Reclaim,
    /// Allocator metadata and freshly zeroed blocks.
    Allocator,
    /// Pool and table creation, and recovery.
    Init,
}

/// A range of the mapped pool that is about to be written back.
pub struct Region<'a> {
    map: &'a MmapMut,
    ptr: *const u8,
    offset: usize,
    len: usize,
}

impl<'a> Region<'a> {
    pub(crate) fn new(map: &'a MmapMut, ptr: *const u8, offset: usize, len: usize) -> Self {
        Region {
            map,
            ptr,
            offset,
            len,
        }
    }

    /// Address of the first byte of the range.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Offset of the range from the start of the pool.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Synchronously writes the pages covering the range back to the pool file.
    pub fn sync(&self) -> io::Result<()> {
        self.map.flush_range(self.offset, self.len)
    }
}

impl fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// How data written to the pool is made durable.
///
/// The table calls [`Persister::flush`] on every range whose contents must survive a crash, and
/// [`Persister::fence`] after it to order the flush before any later store.
pub trait Persister: Send + Sync + fmt::Debug {
    fn flush(&self, point: FlushPoint, region: Region<'_>) -> io::Result<()>;

    fn fence(&self, point: FlushPoint);
}

impl<P> Persister for Arc<P>
where
    P: Persister + ?Sized,
{
    fn flush(&self, point: FlushPoint, region: Region<'_>) -> io::Result<()> {
        (**self).flush(point, region)
    }

    fn fence(&self, point: FlushPoint) {
        (**self).fence(point)
    }
}

impl<P> Persister for Box<P>
where
    P: Persister + ?Sized,
{
    fn flush(&self, point: FlushPoint, region: Region<'_>) -> io::Result<()> {
        (**self).flush(point, region)
    }

    fn fence(&self, point: FlushPoint) {
        (**self).fence(point)
    }
}

/// Cache-line write-back for pools mapped from persistent memory.
///
/// On x86-64 each line is flushed with `clflush` and fences use `sfence`. Elsewhere only the
/// fence is issued, as a sequentially consistent memory fence.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clflush;

impl Persister for Clflush {
    #[allow(unused_unsafe)]
    fn flush(&self, _: FlushPoint, region: Region<'_>) -> io::Result<()> {
        #[cfg(target_arch = "x86_64")]
        {
            let start = region.as_ptr() as usize & !(CACHE_LINE - 1);
            let end = region.as_ptr() as usize + region.len();
            for line in (start..end).step_by(CACHE_LINE) {
                // safety: the mapping is page aligned, so every line overlapping the region lies
                // within it.
                unsafe { std::arch::x86_64::_mm_clflush(line as *const u8) };
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = region;
        Ok(())
    }

    #[allow(unused_unsafe)]
    fn fence(&self, _: FlushPoint) {
        #[cfg(target_arch = "x86_64")]
        // safety: sse is part of the x86-64 baseline.
        unsafe {
            std::arch::x86_64::_mm_sfence()
        };
        #[cfg(not(target_arch = "x86_64"))]
        atomic::fence(Ordering::SeqCst);
    }
}

/// `msync` of the touched pages, for pools kept in ordinary files.
#[derive(Clone, Copy, Debug, Default)]
pub struct Msync;

impl Persister for Msync {
    fn flush(&self, _: FlushPoint, region: Region<'_>) -> io::Result<()> {
        region.sync()
    }

    fn fence(&self, _: FlushPoint) {
        atomic::fence(Ordering::SeqCst);
    }
}

/// No write-back at all. Stores still become visible in the pool file eventually, but nothing is
/// guaranteed after a power failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFlush;

impl Persister for NoFlush {
    fn flush(&self, _: FlushPoint, _: Region<'_>) -> io::Result<()> {
        Ok(())
    }

    fn fence(&self, _: FlushPoint) {
        atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clflush_over_anonymous_map() {
        let mut map = MmapMut::map_anon(4096).unwrap();
        map[100] = 7;
        let ptr = map.as_ptr();
        // safety: within the mapping
        let region = Region::new(&map, unsafe { ptr.add(100) }, 100, 200);
        Clflush.flush(FlushPoint::SlotValue, region).unwrap();
        Clflush.fence(FlushPoint::SlotValue);
        assert_eq!(map[100], 7);
    }

    #[test]
    fn msync_file_map() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(8192).unwrap();
        // safety: the file is private to this test
        let mut map = unsafe { MmapMut::map_mut(&file) }.unwrap();
        map[5000] = 1;
        let ptr = map.as_ptr();
        let region = Region::new(&map, unsafe { ptr.add(5000) }, 5000, 8);
        assert_eq!(region.len(), 8);
        Msync.flush(FlushPoint::SlotKey, region).unwrap();
        let shared: Arc<dyn Persister> = Arc::new(NoFlush);
        let region = Region::new(&map, ptr, 0, 64);
        shared.flush(FlushPoint::Init, region).unwrap();
    }
}
