//! Buffer pool.
//!
//! The first [`PAGE_HEADER_SIZE`] bytes of every page hold the LSN of the last log record
//! applied to it; offsets passed to [`BufferManager`] are relative to the rest of the page.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};

use crate::disk::{DiskSpaceManager, EFFECTIVE_PAGE_SIZE, PAGE_HEADER_SIZE, PageNum, PartNum, part_num};
use crate::error::{DiskError, DiskResult, RecoveryResult};
use crate::record::Lsn;

/// Page cache operations used by logging and recovery.
pub trait BufferManager: Send + Sync {
    /// Usable bytes per page.
    fn effective_page_size(&self) -> usize;

    /// LSN of the last change applied to the page.
    fn page_lsn(&self, page_num: PageNum) -> DiskResult<Lsn>;

    /// Overwrite `bytes.len()` bytes at `offset` and stamp the page with `lsn`. The page
    /// becomes dirty.
    fn write_page(&self, page_num: PageNum, offset: usize, bytes: &[u8], lsn: Lsn)
    -> DiskResult<()>;

    /// Drop the page from the cache and free it on disk.
    fn free_page(&self, page_num: PageNum) -> DiskResult<()>;

    /// Drop every page of the partition from the cache and free it on disk.
    fn free_part(&self, part_num: PartNum) -> DiskResult<()>;

    /// Visit every cached page with its dirty flag.
    fn iter_page_nums(&self, visit: &mut dyn FnMut(PageNum, bool));
}

/// Callbacks the buffer pool runs around writing a page to disk.
pub trait FlushListener: Send + Sync {
    /// Runs before a page stamped with `page_lsn` is written. The page is not written if
    /// this fails.
    fn page_flush_hook(&self, page_lsn: Lsn) -> RecoveryResult<()>;

    /// Runs after the page has been written.
    fn disk_io_hook(&self, page_num: PageNum);
}

#[derive(Debug)]
struct Frame {
    bytes: Vec<u8>,
    dirty: bool,
}

impl Frame {
    fn page_lsn(&self) -> Lsn {
        let mut lsn = [0u8; PAGE_HEADER_SIZE];
        lsn.copy_from_slice(&self.bytes[..PAGE_HEADER_SIZE]);
        Lsn::from_le_bytes(lsn)
    }

    fn set_page_lsn(&mut self, lsn: Lsn) {
        self.bytes[..PAGE_HEADER_SIZE].copy_from_slice(&lsn.to_le_bytes());
    }
}

/// Unbounded in-memory page cache over a [`DiskSpaceManager`].
///
/// Pages stay cached until they are flushed and evicted explicitly; [`Self::crash`]
/// discards every cached change that has not been flushed.
pub struct MemoryBufferManager {
    disk: Arc<dyn DiskSpaceManager>,
    frames: Mutex<HashMap<PageNum, Frame>>,
    listener: RwLock<Option<Weak<dyn FlushListener>>>,
}

impl MemoryBufferManager {
    pub fn new(disk: Arc<dyn DiskSpaceManager>) -> Self {
        Self {
            disk,
            frames: Mutex::new(HashMap::new()),
            listener: RwLock::new(None),
        }
    }

    /// Register the callbacks run on every page flush.
    pub fn set_flush_listener(&self, listener: Weak<dyn FlushListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Read `len` bytes at `offset` of the page's usable area.
    pub fn read(&self, page_num: PageNum, offset: usize, len: usize) -> DiskResult<Vec<u8>> {
        check_bounds(page_num, offset, len)?;
        let frame = self.fetch(page_num)?;
        let start = PAGE_HEADER_SIZE + offset;
        Ok(frame.bytes[start..start + len].to_vec())
    }

    pub fn is_dirty(&self, page_num: PageNum) -> bool {
        self.frames
            .lock()
            .get(&page_num)
            .is_some_and(|frame| frame.dirty)
    }

    /// Write the page to disk if it is dirty, honouring the flush listener.
    pub fn flush_page(&self, page_num: PageNum) -> RecoveryResult<()> {
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        let mut frames = self.frames.lock();
        let Some(frame) = frames.get_mut(&page_num) else {
            return Ok(());
        };
        if !frame.dirty {
            return Ok(());
        }
        if let Some(listener) = &listener {
            listener.page_flush_hook(frame.page_lsn())?;
        }
        self.disk.write_page(page_num, &frame.bytes)?;
        frame.dirty = false;
        drop(frames);
        if let Some(listener) = &listener {
            listener.disk_io_hook(page_num);
        }
        Ok(())
    }

    pub fn flush_all(&self) -> RecoveryResult<()> {
        let mut page_nums: Vec<PageNum> = self.frames.lock().keys().copied().collect();
        page_nums.sort_unstable();
        for page_num in page_nums {
            self.flush_page(page_num)?;
        }
        Ok(())
    }

    /// Flush every page and empty the cache.
    pub fn evict_all(&self) -> RecoveryResult<()> {
        self.flush_all()?;
        self.frames.lock().clear();
        Ok(())
    }

    /// Lose every cached page without writing it back.
    pub fn crash(&self) {
        self.frames.lock().clear();
    }

    /// Cached frame of `page_num`, loaded from disk on a miss. The frame stays locked
    /// until the guard is dropped.
    fn fetch(&self, page_num: PageNum) -> DiskResult<MappedMutexGuard<'_, Frame>> {
        let mut frames = self.frames.lock();
        if !frames.contains_key(&page_num) {
            let bytes = self.disk.read_page(page_num)?;
            frames.insert(page_num, Frame {
                bytes,
                dirty: false,
            });
        }
        MutexGuard::try_map(frames, |frames| frames.get_mut(&page_num))
            .map_err(|_| DiskError::PageNotAllocated(page_num))
    }
}

fn check_bounds(page_num: PageNum, offset: usize, len: usize) -> DiskResult<()> {
    if offset + len > EFFECTIVE_PAGE_SIZE {
        return Err(DiskError::OutOfBounds {
            page_num,
            offset,
            len,
        });
    }
    Ok(())
}

impl BufferManager for MemoryBufferManager {
    fn effective_page_size(&self) -> usize {
        EFFECTIVE_PAGE_SIZE
    }

    fn page_lsn(&self, page_num: PageNum) -> DiskResult<Lsn> {
        Ok(self.fetch(page_num)?.page_lsn())
    }

    fn write_page(
        &self,
        page_num: PageNum,
        offset: usize,
        bytes: &[u8],
        lsn: Lsn,
    ) -> DiskResult<()> {
        check_bounds(page_num, offset, bytes.len())?;
        let mut frame = self.fetch(page_num)?;
        let start = PAGE_HEADER_SIZE + offset;
        frame.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        frame.set_page_lsn(lsn);
        frame.dirty = true;
        Ok(())
    }

    fn free_page(&self, page_num: PageNum) -> DiskResult<()> {
        self.frames.lock().remove(&page_num);
        self.disk.free_page(page_num)
    }

    fn free_part(&self, part: PartNum) -> DiskResult<()> {
        self.frames
            .lock()
            .retain(|&page_num, _| part_num(page_num) != part);
        self.disk.free_part(part)
    }

    fn iter_page_nums(&self, visit: &mut dyn FnMut(PageNum, bool)) {
        let mut pages: Vec<(PageNum, bool)> = self
            .frames
            .lock()
            .iter()
            .map(|(&page_num, frame)| (page_num, frame.dirty))
            .collect();
        pages.sort_unstable();
        for (page_num, dirty) in pages {
            visit(page_num, dirty);
        }
    }
}
