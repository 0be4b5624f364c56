//! Disk space management.
//!
//! Pages are identified by a single number that encodes the partition they belong to:
//! `page_num = part_num * PAGES_PER_PART + index`. Partition 0 holds the log and is
//! never logged or locked.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::{DiskError, DiskResult};

pub type PageNum = u64;
pub type PartNum = u32;

/// Size of a page on disk.
pub const PAGE_SIZE: usize = 4096;
/// Bytes at the start of every page reserved for the page LSN.
pub const PAGE_HEADER_SIZE: usize = 8;
/// Bytes of a page available to its user.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
/// Maximum number of pages per partition.
pub const PAGES_PER_PART: u64 = 10_000_000_000;
/// Partition reserved for the log.
pub const LOG_PARTITION: PartNum = 0;

/// Partition of `page_num`.
pub fn part_num(page_num: PageNum) -> PartNum {
    (page_num / PAGES_PER_PART) as PartNum
}

/// Number of the `index`-th page of partition `part_num`.
pub fn page_num(part_num: PartNum, index: u64) -> PageNum {
    part_num as u64 * PAGES_PER_PART + index
}

/// Allocation and raw page I/O.
///
/// Allocation changes are durable as soon as the call returns.
pub trait DiskSpaceManager: Send + Sync {
    fn alloc_part(&self, part_num: PartNum) -> DiskResult<PartNum>;

    fn free_part(&self, part_num: PartNum) -> DiskResult<()>;

    /// Allocate the page `page_num`, zero-filled, in an allocated partition.
    fn alloc_page(&self, page_num: PageNum) -> DiskResult<PageNum>;

    fn free_page(&self, page_num: PageNum) -> DiskResult<()>;

    fn is_page_allocated(&self, page_num: PageNum) -> bool;

    /// Read the full `PAGE_SIZE` bytes of a page.
    fn read_page(&self, page_num: PageNum) -> DiskResult<Vec<u8>>;

    /// Overwrite a page with `bytes`, which must be `PAGE_SIZE` long.
    fn write_page(&self, page_num: PageNum, bytes: &[u8]) -> DiskResult<()>;
}

/// Disk kept entirely in memory. Survives a simulated crash of the buffer pool and
/// the log tail.
#[derive(Debug, Default)]
pub struct MemoryDiskSpaceManager {
    parts: Mutex<HashMap<PartNum, BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryDiskSpaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated pages in `part_num`, if the partition exists.
    pub fn num_pages(&self, part_num: PartNum) -> Option<usize> {
        self.parts.lock().get(&part_num).map(BTreeMap::len)
    }
}

impl DiskSpaceManager for MemoryDiskSpaceManager {
    fn alloc_part(&self, part_num: PartNum) -> DiskResult<PartNum> {
        let mut parts = self.parts.lock();
        if parts.contains_key(&part_num) {
            return Err(DiskError::PartitionAlreadyAllocated(part_num));
        }
        parts.insert(part_num, BTreeMap::new());
        Ok(part_num)
    }

    fn free_part(&self, part_num: PartNum) -> DiskResult<()> {
        self.parts
            .lock()
            .remove(&part_num)
            .map(|_| ())
            .ok_or(DiskError::PartitionNotAllocated(part_num))
    }

    fn alloc_page(&self, page_num: PageNum) -> DiskResult<PageNum> {
        let mut parts = self.parts.lock();
        let part = part_num(page_num);
        let pages = parts
            .get_mut(&part)
            .ok_or(DiskError::PartitionNotAllocated(part))?;
        let index = page_num % PAGES_PER_PART;
        if pages.contains_key(&index) {
            return Err(DiskError::PageAlreadyAllocated(page_num));
        }
        pages.insert(index, vec![0; PAGE_SIZE]);
        Ok(page_num)
    }

    fn free_page(&self, page_num: PageNum) -> DiskResult<()> {
        self.parts
            .lock()
            .get_mut(&part_num(page_num))
            .and_then(|pages| pages.remove(&(page_num % PAGES_PER_PART)))
            .map(|_| ())
            .ok_or(DiskError::PageNotAllocated(page_num))
    }

    fn is_page_allocated(&self, page_num: PageNum) -> bool {
        self.parts
            .lock()
            .get(&part_num(page_num))
            .is_some_and(|pages| pages.contains_key(&(page_num % PAGES_PER_PART)))
    }

    fn read_page(&self, page_num: PageNum) -> DiskResult<Vec<u8>> {
        self.parts
            .lock()
            .get(&part_num(page_num))
            .and_then(|pages| pages.get(&(page_num % PAGES_PER_PART)))
            .cloned()
            .ok_or(DiskError::PageNotAllocated(page_num))
    }

    fn write_page(&self, page_num: PageNum, bytes: &[u8]) -> DiskResult<()> {
        if bytes.len() != PAGE_SIZE {
            return Err(DiskError::OutOfBounds {
                page_num,
                offset: 0,
                len: bytes.len(),
            });
        }
        let mut parts = self.parts.lock();
        let page = parts
            .get_mut(&part_num(page_num))
            .and_then(|pages| pages.get_mut(&(page_num % PAGES_PER_PART)))
            .ok_or(DiskError::PageNotAllocated(page_num))?;
        page.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_numbering() {
        let page = page_num(3, 17);
        assert_eq!(part_num(page), 3);
        assert_eq!(page % PAGES_PER_PART, 17);
        assert_eq!(part_num(page_num(LOG_PARTITION, 5)), LOG_PARTITION);
    }

    #[test]
    fn test_alloc_and_free() {
        let disk = MemoryDiskSpaceManager::new();
        let page = page_num(1, 0);
        assert_eq!(disk.alloc_page(page), Err(DiskError::PartitionNotAllocated(1)));

        disk.alloc_part(1).unwrap();
        assert_eq!(disk.alloc_part(1), Err(DiskError::PartitionAlreadyAllocated(1)));
        disk.alloc_page(page).unwrap();
        assert!(disk.is_page_allocated(page));
        assert_eq!(disk.alloc_page(page), Err(DiskError::PageAlreadyAllocated(page)));
        assert_eq!(disk.read_page(page).unwrap(), vec![0; PAGE_SIZE]);

        disk.free_page(page).unwrap();
        assert!(!disk.is_page_allocated(page));
        assert_eq!(disk.free_page(page), Err(DiskError::PageNotAllocated(page)));
        disk.free_part(1).unwrap();
        assert_eq!(disk.num_pages(1), None);
    }

    #[test]
    fn test_write_requires_full_page() {
        let disk = MemoryDiskSpaceManager::new();
        disk.alloc_part(1).unwrap();
        let page = disk.alloc_page(page_num(1, 2)).unwrap();
        assert!(matches!(
            disk.write_page(page, &[1, 2, 3]),
            Err(DiskError::OutOfBounds { len: 3, .. })
        ));
        let mut bytes = vec![0; PAGE_SIZE];
        bytes[100] = 7;
        disk.write_page(page, &bytes).unwrap();
        assert_eq!(disk.read_page(page).unwrap()[100], 7);
    }
}
