//! Paged file access and a small buffer pool
//!
//! Column chunks live in a single page file. Pages are pinned through
//! [`BufferManager::pin`], which hands back a [`PageGuard`]; dropping the guard
//! unpins the frame. Pages are never reused: rewritten chunks always get
//! freshly allocated pages.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StorageError};

pub type PageIdx = u32;

pub const INVALID_PAGE_IDX: PageIdx = u32::MAX;

/// Raw page storage underneath the buffer pool.
pub trait PageFile: Send {
    fn page_size(&self) -> usize;

    fn num_pages(&self) -> u32;

    /// Reads a page; pages past the end of the file read as zeroes.
    fn read_page(&mut self, page_idx: PageIdx, buf: &mut [u8]) -> io::Result<()>;

    fn write_page(&mut self, page_idx: PageIdx, buf: &[u8]) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

pub struct DiskPageFile {
    file: File,
    page_size: usize,
    num_pages: u32,
}

impl DiskPageFile {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(StorageError::InvalidFormat(format!(
                "page file size {} is not a multiple of page size {}",
                len, page_size
            )));
        }
        Ok(Self {
            file,
            page_size,
            num_pages: (len / page_size as u64) as u32,
        })
    }
}

impl PageFile for DiskPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u32 {
        self.num_pages
    }

    fn read_page(&mut self, page_idx: PageIdx, buf: &mut [u8]) -> io::Result<()> {
        if page_idx >= self.num_pages {
            buf.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(page_idx as u64 * self.page_size as u64))?;
        self.file.read_exact(buf)
    }

    fn write_page(&mut self, page_idx: PageIdx, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(page_idx as u64 * self.page_size as u64))?;
        self.file.write_all(buf)?;
        self.num_pages = self.num_pages.max(page_idx + 1);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Page file kept entirely in memory.
pub struct MemoryPageFile {
    pages: Vec<Box<[u8]>>,
    page_size: usize,
}

impl MemoryPageFile {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size,
        }
    }
}

impl PageFile for MemoryPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> u32 {
        self.pages.len() as u32
    }

    fn read_page(&mut self, page_idx: PageIdx, buf: &mut [u8]) -> io::Result<()> {
        match self.pages.get(page_idx as usize) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&mut self, page_idx: PageIdx, buf: &[u8]) -> io::Result<()> {
        let idx = page_idx as usize;
        if idx >= self.pages.len() {
            self.pages
                .resize_with(idx + 1, || vec![0u8; self.page_size].into_boxed_slice());
        }
        self.pages[idx].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Frame {
    data: RwLock<Box<[u8]>>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
}

/// Pinned page. The frame stays resident until the guard is dropped.
pub struct PageGuard {
    page_idx: PageIdx,
    frame: Arc<Frame>,
}

impl PageGuard {
    pub fn page_idx(&self) -> PageIdx {
        self.page_idx
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.frame.data.read();
        f(&data)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.frame.data.write();
        self.frame.dirty.store(true, Ordering::Release);
        f(&mut data)
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub cached_pages: usize,
    pub dirty_pages: usize,
    pub file_pages: u32,
}

pub struct BufferManager {
    file: Mutex<Box<dyn PageFile>>,
    frames: Mutex<HashMap<PageIdx, Arc<Frame>>>,
    page_size: usize,
    capacity: usize,
    next_page: AtomicU32,
}

impl BufferManager {
    pub fn new(file: Box<dyn PageFile>, capacity: usize) -> Self {
        let page_size = file.page_size();
        let next_page = file.num_pages();
        Self {
            file: Mutex::new(file),
            frames: Mutex::new(HashMap::new()),
            page_size,
            capacity,
            next_page: AtomicU32::new(next_page),
        }
    }

    pub fn in_memory(page_size: usize, capacity: usize) -> Self {
        Self::new(Box::new(MemoryPageFile::new(page_size)), capacity)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages allocated so far, including those not yet written back.
    pub fn num_pages(&self) -> u32 {
        self.next_page.load(Ordering::Acquire)
    }

    /// Reserves `num_pages` contiguous pages at the end of the file.
    pub fn allocate_pages(&self, num_pages: u32) -> PageIdx {
        if num_pages == 0 {
            return INVALID_PAGE_IDX;
        }
        self.next_page.fetch_add(num_pages, Ordering::AcqRel)
    }

    pub fn pin(&self, page_idx: PageIdx) -> Result<PageGuard> {
        assert!(
            page_idx < self.num_pages(),
            "pinning unallocated page {}",
            page_idx
        );
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&page_idx) {
            frame.pin_count.fetch_add(1, Ordering::AcqRel);
            return Ok(PageGuard {
                page_idx,
                frame: Arc::clone(frame),
            });
        }

        if frames.len() >= self.capacity {
            self.evict_one(&mut frames)?;
        }

        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        self.file.lock().read_page(page_idx, &mut buf)?;
        let frame = Arc::new(Frame {
            data: RwLock::new(buf),
            pin_count: AtomicU32::new(1),
            dirty: AtomicBool::new(false),
        });
        frames.insert(page_idx, Arc::clone(&frame));
        Ok(PageGuard { page_idx, frame })
    }

    fn evict_one(&self, frames: &mut HashMap<PageIdx, Arc<Frame>>) -> Result<()> {
        let victim = frames
            .iter()
            .find(|(_, frame)| frame.pin_count.load(Ordering::Acquire) == 0)
            .map(|(idx, _)| *idx);
        let Some(victim) = victim else {
            tracing::warn!(
                "Buffer pool exhausted: all {} frames pinned, growing past capacity",
                frames.len()
            );
            return Ok(());
        };
        if let Some(frame) = frames.remove(&victim) {
            if frame.dirty.load(Ordering::Acquire) {
                let data = frame.data.read();
                self.file.lock().write_page(victim, &data)?;
            }
        }
        Ok(())
    }

    /// Writes every dirty frame back and syncs the file.
    pub fn flush_all(&self) -> Result<()> {
        let frames = self.frames.lock();
        let mut file = self.file.lock();
        let mut dirty: Vec<_> = frames
            .iter()
            .filter(|(_, frame)| frame.dirty.load(Ordering::Acquire))
            .collect();
        dirty.sort_by_key(|(idx, _)| **idx);
        for (idx, frame) in &dirty {
            let data = frame.data.read();
            file.write_page(**idx, &data)?;
            frame.dirty.store(false, Ordering::Release);
        }
        // Allocated but never touched pages still have to exist on disk
        let allocated = self.num_pages();
        if allocated > file.num_pages() {
            let zeroes = vec![0u8; self.page_size];
            for idx in file.num_pages()..allocated {
                if !frames.contains_key(&idx) {
                    file.write_page(idx, &zeroes)?;
                }
            }
        }
        file.sync()?;
        tracing::debug!("Flushed {} dirty pages", dirty.len());
        Ok(())
    }

    pub fn stats(&self) -> BufferPoolStats {
        let frames = self.frames.lock();
        BufferPoolStats {
            cached_pages: frames.len(),
            dirty_pages: frames
                .values()
                .filter(|f| f.dirty.load(Ordering::Acquire))
                .count(),
            file_pages: self.file.lock().num_pages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pin_write_read_back() {
        let bm = BufferManager::in_memory(512, 16);
        let first = bm.allocate_pages(2);
        assert_eq!(first, 0);

        {
            let page = bm.pin(1).unwrap();
            page.write(|data| data[..4].copy_from_slice(b"ngdb"));
        }
        let page = bm.pin(1).unwrap();
        assert_eq!(page.read(|data| data[..4].to_vec()), b"ngdb".to_vec());
        assert_eq!(bm.stats().dirty_pages, 1);
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let bm = BufferManager::in_memory(512, 2);
        bm.allocate_pages(4);
        for idx in 0..4u32 {
            let page = bm.pin(idx).unwrap();
            page.write(|data| data[0] = idx as u8 + 1);
        }
        assert!(bm.stats().cached_pages <= 2);
        for idx in 0..4u32 {
            let page = bm.pin(idx).unwrap();
            assert_eq!(page.read(|data| data[0]), idx as u8 + 1);
        }
    }

    #[test]
    fn test_pinned_frames_are_not_evicted() {
        let bm = BufferManager::in_memory(512, 1);
        bm.allocate_pages(2);
        let a = bm.pin(0).unwrap();
        a.write(|data| data[0] = 7);
        let b = bm.pin(1).unwrap();
        assert_eq!(a.read(|data| data[0]), 7);
        drop(b);
        assert_eq!(bm.stats().cached_pages, 2);
    }

    #[test]
    fn test_flush_persists_to_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.pages");
        {
            let bm = BufferManager::new(Box::new(DiskPageFile::open(&path, 512).unwrap()), 8);
            bm.allocate_pages(3);
            bm.pin(2).unwrap().write(|data| data[10] = 42);
            bm.flush_all().unwrap();
        }
        let bm = BufferManager::new(Box::new(DiskPageFile::open(&path, 512).unwrap()), 8);
        assert_eq!(bm.num_pages(), 3);
        assert_eq!(bm.pin(2).unwrap().read(|data| data[10]), 42);
    }

    #[test]
    fn test_rejects_truncated_page_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.pages");
        std::fs::write(&path, vec![0u8; 700]).unwrap();
        assert!(matches!(
            DiskPageFile::open(&path, 512),
            Err(StorageError::InvalidFormat(_))
        ));
    }
}
