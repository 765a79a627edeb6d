// Pooled memory for decoded video frames
// Fixed-capacity page arenas grouped by page byte size
//
// Decoded frames of the same resolution recycle the same pages, so the
// decode hot path never hits the system allocator once a map exists.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Number of pages reserved per map, in one block.
pub const PICTURE_MAP_PAGES: usize = 32;

/// Delay between retries when the OS refuses a map allocation.
const ALLOC_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to reserve picture map of {0} bytes")]
    AllocationFailed(usize),
    #[error("Released page does not belong to any picture map")]
    UnknownPage,
}

/// One fixed-capacity arena of equally-sized pages.
///
/// Pages live in a single heap block; a page is handed out at most once
/// until it is given back. The map is destroyed by the pool when its last
/// page is released.
struct PictureMap {
    id: u64,
    page_size: usize,
    block: Box<[u8]>,
    used: [bool; PICTURE_MAP_PAGES],
}

impl PictureMap {
    fn try_new(id: u64, page_size: usize) -> Result<Self, MemoryError> {
        let total = page_size
            .checked_mul(PICTURE_MAP_PAGES)
            .ok_or(MemoryError::AllocationFailed(usize::MAX))?;
        let mut storage: Vec<u8> = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| MemoryError::AllocationFailed(total))?;
        storage.resize(total, 0);
        Ok(Self {
            id,
            page_size,
            block: storage.into_boxed_slice(),
            used: [false; PICTURE_MAP_PAGES],
        })
    }

    fn checkout(&mut self) -> Option<(usize, *mut u8)> {
        for (index, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                // Safety: index < PICTURE_MAP_PAGES, block holds PAGES * page_size bytes.
                let ptr = unsafe { self.block.as_mut_ptr().add(index * self.page_size) };
                return Some((index, ptr));
            }
        }
        None
    }

    fn give_back(&mut self, index: usize) {
        debug_assert!(self.used[index], "page released twice");
        self.used[index] = false;
    }

    fn is_full(&self) -> bool {
        self.used.iter().all(|u| *u)
    }

    fn is_empty(&self) -> bool {
        self.used.iter().all(|u| !*u)
    }
}

#[derive(Default)]
struct PoolDirectory {
    maps: Vec<PictureMap>,
    next_map_id: u64,
    total_bytes: usize,
}

/// Thread-safe directory of picture maps, keyed by page size.
///
/// `acquire` finds a non-full map whose page size matches the requested
/// frame byte length, or reserves a new map. `release` (driven by
/// [`PageHandle`] drop) returns the page and deallocates the map once it
/// becomes empty again.
pub struct PicturePool {
    directory: Mutex<PoolDirectory>,
}

impl PicturePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            directory: Mutex::new(PoolDirectory::default()),
        })
    }

    /// Hand out one page of at least `page_size` bytes.
    ///
    /// Never returns a null page: if the OS refuses the reservation for a
    /// new map, the call retries until memory is available, since the
    /// producer cannot proceed with a frame it has nowhere to place.
    pub fn acquire(self: &Arc<Self>, page_size: usize) -> PageHandle {
        assert!(page_size > 0, "zero-sized picture page");
        loop {
            let mut dir = self.directory.lock();

            if let Some(map) = dir
                .maps
                .iter_mut()
                .find(|m| m.page_size == page_size && !m.is_full())
            {
                let (index, ptr) = map.checkout().expect("non-full map has a free page");
                return PageHandle {
                    pool: Arc::clone(self),
                    map_id: map.id,
                    page_index: index,
                    len: page_size,
                    ptr,
                };
            }

            let id = dir.next_map_id;
            match PictureMap::try_new(id, page_size) {
                Ok(mut map) => {
                    dir.next_map_id += 1;
                    dir.total_bytes += page_size * PICTURE_MAP_PAGES;
                    log::debug!(
                        "picture map created: page size {} bytes, pool total {} bytes",
                        page_size,
                        dir.total_bytes
                    );
                    let (index, ptr) = map.checkout().expect("fresh map has a free page");
                    dir.maps.push(map);
                    return PageHandle {
                        pool: Arc::clone(self),
                        map_id: id,
                        page_index: index,
                        len: page_size,
                        ptr,
                    };
                }
                Err(e) => {
                    drop(dir);
                    log::warn!("{}, retrying", e);
                    std::thread::sleep(ALLOC_RETRY_DELAY);
                }
            }
        }
    }

    fn release(&self, map_id: u64, page_index: usize) {
        let mut dir = self.directory.lock();
        let Some(pos) = dir.maps.iter().position(|m| m.id == map_id) else {
            // Invariant violation; degrade to a no-op in release builds.
            debug_assert!(false, "release for unknown picture map");
            log::error!("{}", MemoryError::UnknownPage);
            return;
        };
        dir.maps[pos].give_back(page_index);
        if dir.maps[pos].is_empty() {
            let map = dir.maps.remove(pos);
            dir.total_bytes -= map.page_size * PICTURE_MAP_PAGES;
            log::debug!(
                "picture map dropped: page size {} bytes, pool total {} bytes",
                map.page_size,
                dir.total_bytes
            );
        }
    }

    /// Number of live maps, across all page sizes.
    pub fn map_count(&self) -> usize {
        self.directory.lock().maps.len()
    }

    /// Bytes currently reserved by all maps.
    pub fn reserved_bytes(&self) -> usize {
        self.directory.lock().total_bytes
    }
}

/// Exclusive ownership of one pooled page.
///
/// The page returns to its map when the handle drops; the map itself is
/// deallocated when its last page comes back.
pub struct PageHandle {
    pool: Arc<PicturePool>,
    map_id: u64,
    page_index: usize,
    len: usize,
    ptr: *mut u8,
}

// Safety: the handle has exclusive access to its page until drop, and the
// backing block outlives the handle (a map is only destroyed when empty).
unsafe impl Send for PageHandle {}
unsafe impl Sync for PageHandle {}

impl PageHandle {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: exclusive page ownership, see type invariant.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: exclusive page ownership, see type invariant.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pool.release(self.map_id, self.page_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_leaves_directory_unchanged() {
        let pool = PicturePool::new();
        let before = pool.map_count();
        let page = pool.acquire(640 * 480 * 4);
        assert_eq!(pool.map_count(), before + 1);
        drop(page);
        assert_eq!(pool.map_count(), before);
    }

    #[test]
    fn test_pages_are_distinct() {
        let pool = PicturePool::new();
        let pages: Vec<_> = (0..PICTURE_MAP_PAGES).map(|_| pool.acquire(1024)).collect();
        let mut ptrs: Vec<_> = pages.iter().map(|p| p.as_slice().as_ptr()).collect();
        ptrs.sort();
        ptrs.dedup();
        assert_eq!(ptrs.len(), PICTURE_MAP_PAGES);
        // All pages in one map
        assert_eq!(pool.map_count(), 1);
    }

    #[test]
    fn test_overflow_allocates_second_map() {
        let pool = PicturePool::new();
        let mut pages: Vec<_> = (0..PICTURE_MAP_PAGES).map(|_| pool.acquire(256)).collect();
        assert_eq!(pool.map_count(), 1);
        pages.push(pool.acquire(256));
        assert_eq!(pool.map_count(), 2);
        pages.clear();
        assert_eq!(pool.map_count(), 0);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn test_page_sizes_use_separate_maps() {
        let pool = PicturePool::new();
        let a = pool.acquire(720 * 576 * 3);
        let b = pool.acquire(1920 * 1080 * 4);
        assert_eq!(pool.map_count(), 2);
        drop(a);
        assert_eq!(pool.map_count(), 1);
        drop(b);
        assert_eq!(pool.map_count(), 0);
    }

    #[test]
    fn test_page_is_writable_and_reusable() {
        let pool = PicturePool::new();
        let keep_alive = pool.acquire(64);
        let mut page = pool.acquire(64);
        page.as_mut_slice().fill(0xAB);
        assert!(page.as_slice().iter().all(|b| *b == 0xAB));
        let first_ptr = page.as_slice().as_ptr();
        drop(page);
        // Freed page is recycled for the next same-size acquire
        let page = pool.acquire(64);
        assert_eq!(page.as_slice().as_ptr(), first_ptr);
        drop(keep_alive);
    }
}
