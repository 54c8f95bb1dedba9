//! Weight accessor (spec component A): a uniform `fetch` across the three
//! model access modes (mmap, in-memory image, read-through malloc cache).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;

use crate::error::{KernelError, Result};

/// How the model's weight bytes are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAccess {
    /// Map the checkpoint file read-only and address weights directly.
    Mmap,
    /// Open the checkpoint file and serve weights through a bounded
    /// read-through cache, never mapping the whole file.
    MallocCache,
    /// The caller already holds the checkpoint bytes in memory.
    AbsoluteAddress,
}

impl std::fmt::Display for ModelAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelAccess::Mmap => "MMAP",
            ModelAccess::MallocCache => "AllocCache",
            ModelAccess::AbsoluteAddress => "Address",
        };
        write!(f, "{name}")
    }
}

/// A handle to a fetched weight region.
///
/// Cheap to clone: mmap/in-memory regions are views into a shared `Arc`,
/// and cache hits clone the cached buffer's `Arc`.
#[derive(Clone)]
pub enum WeightRef {
    Mapped(Arc<Mmap>, usize, usize),
    Memory(Arc<Vec<u8>>, usize, usize),
    Cached(Arc<Vec<u8>>),
}

impl WeightRef {
    pub fn bytes(&self) -> &[u8] {
        match self {
            WeightRef::Mapped(m, start, len) => &m[*start..*start + *len],
            WeightRef::Memory(v, start, len) => &v[*start..*start + *len],
            WeightRef::Cached(v) => &v[..],
        }
    }

    /// Reinterpret the region as little-endian `f32`s.
    ///
    /// Sound because every f32 tensor in the checkpoint layout begins at an
    /// offset that is a multiple of 4 bytes (all preceding fields are
    /// themselves 4-byte-aligned in size), and both mmap pages and `Vec<u8>`
    /// allocations start at an alignment far stricter than that.
    pub fn as_f32(&self) -> &[f32] {
        let bytes = self.bytes();
        debug_assert_eq!(bytes.len() % 4, 0);
        debug_assert_eq!((bytes.as_ptr() as usize) % std::mem::align_of::<f32>(), 0);
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
    }

    /// Reinterpret the region as `i8`s (same size and alignment as `u8`).
    pub fn as_i8(&self) -> &[i8] {
        let bytes = self.bytes();
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i8, bytes.len()) }
    }
}

/// Uniform fetch interface used by the matmul kernels and the forward engine.
pub trait WeightSource: Send + Sync {
    /// Fetch `len` bytes starting at `offset`, relative to the start of the
    /// weight data region (i.e. past the checkpoint header).
    fn fetch(&self, offset: u64, len: usize) -> Result<WeightRef>;

    fn data_len(&self) -> u64;

    /// Running cache totals, for backends that cache. `None` for sources
    /// that hold the whole checkpoint resident (mmap, in-memory image).
    fn cache_stats(&self) -> Option<CacheStats> {
        None
    }
}

/// `ModelAccess::Mmap` backend.
pub struct MmapSource {
    map: Arc<Mmap>,
    data_offset: usize,
}

impl MmapSource {
    pub fn open(path: &Path, data_offset: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| KernelError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| KernelError::Mmap {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            map: Arc::new(map),
            data_offset,
        })
    }
}

impl WeightSource for MmapSource {
    fn fetch(&self, offset: u64, len: usize) -> Result<WeightRef> {
        let start = self.data_offset + offset as usize;
        if (start + len) as u64 > self.map.len() as u64 {
            return Err(KernelError::OutOfBounds {
                offset,
                len,
                size: self.map.len() as u64,
            });
        }
        Ok(WeightRef::Mapped(self.map.clone(), start, len))
    }

    fn data_len(&self) -> u64 {
        (self.map.len() - self.data_offset) as u64
    }
}

/// `ModelAccess::AbsoluteAddress` backend: caller-supplied in-memory image.
pub struct MemorySource {
    image: Arc<Vec<u8>>,
    data_offset: usize,
}

impl MemorySource {
    pub fn new(image: Arc<Vec<u8>>, data_offset: usize) -> Self {
        Self { image, data_offset }
    }
}

impl WeightSource for MemorySource {
    fn fetch(&self, offset: u64, len: usize) -> Result<WeightRef> {
        let start = self.data_offset + offset as usize;
        if (start + len) as u64 > self.image.len() as u64 {
            return Err(KernelError::OutOfBounds {
                offset,
                len,
                size: self.image.len() as u64,
            });
        }
        Ok(WeightRef::Memory(self.image.clone(), start, len))
    }

    fn data_len(&self) -> u64 {
        (self.image.len() - self.data_offset) as u64
    }
}

struct CacheEntry {
    offset: u64,
    len: usize,
    touched: u64,
    buffer: Arc<Vec<u8>>,
}

/// Running totals for a `CacheSource`, queryable for host observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub created: u64,
    pub fetched: u64,
    pub touched: u64,
    pub alloced: u64,
}

struct CacheInner {
    entries: VecDeque<CacheEntry>,
    stats: CacheStats,
}

/// `ModelAccess::MallocCache` backend: reads weight regions from the
/// checkpoint file on demand and pins them in a bounded in-memory list.
///
/// New entries are pushed to the front of the list; when `cache_limit` is
/// exceeded, entries are evicted from the front (the most recently inserted
/// side) until the budget is restored again. This mirrors the original
/// single-linked-list cache exactly rather than approximating it with LRU.
pub struct CacheSource {
    file: Mutex<File>,
    data_offset: u64,
    file_len: u64,
    cache_limit: Option<u64>,
    inner: Mutex<CacheInner>,
}

impl CacheSource {
    pub fn open(path: &Path, data_offset: u64, cache_limit: Option<u64>) -> Result<Self> {
        let file = File::open(path).map_err(|e| KernelError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| KernelError::Open {
                path: path.display().to_string(),
                source: e,
            })?
            .len();
        Ok(Self {
            file: Mutex::new(file),
            data_offset,
            file_len,
            cache_limit,
            inner: Mutex::new(CacheInner {
                entries: VecDeque::new(),
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }
}

impl WeightSource for CacheSource {
    fn fetch(&self, offset: u64, len: usize) -> Result<WeightRef> {
        if self.data_offset + offset + len as u64 > self.file_len {
            return Err(KernelError::OutOfBounds {
                offset,
                len,
                size: self.file_len,
            });
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(pos) = inner
            .entries
            .iter()
            .position(|e| e.offset == offset && e.len == len)
        {
            inner.stats.touched += len as u64;
            inner.entries[pos].touched += 1;
            let buffer = inner.entries[pos].buffer.clone();
            return Ok(WeightRef::Cached(buffer));
        }

        if let Some(limit) = self.cache_limit {
            while inner.stats.alloced > limit {
                match inner.entries.pop_front() {
                    Some(evicted) => inner.stats.alloced -= evicted.len as u64,
                    None => break,
                }
            }
        }

        let mut buffer = vec![0u8; len];
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(self.data_offset + offset))
                .map_err(|e| KernelError::Open {
                    path: "<cache>".to_string(),
                    source: e,
                })?;
            let got = file.read(&mut buffer).unwrap_or(0);
            if got != len {
                return Err(KernelError::ShortRead {
                    offset,
                    wanted: len,
                    got,
                });
            }
        }

        let buffer = Arc::new(buffer);
        inner.entries.push_front(CacheEntry {
            offset,
            len,
            touched: 1,
            buffer: buffer.clone(),
        });
        inner.stats.created += 1;
        inner.stats.alloced += len as u64;
        inner.stats.fetched += len as u64;
        inner.stats.touched += len as u64;

        Ok(WeightRef::Cached(buffer))
    }

    fn data_len(&self) -> u64 {
        self.file_len - self.data_offset
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        Some(self.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn mmap_source_fetches_region() {
        let data: Vec<u8> = (0u8..64).collect();
        let f = write_fixture(&data);
        let src = MmapSource::open(f.path(), 8).unwrap();
        let r = src.fetch(0, 16).unwrap();
        assert_eq!(r.bytes(), &data[8..24]);
    }

    #[test]
    fn cache_source_hits_are_served_without_rereading() {
        let data: Vec<u8> = (0u8..64).collect();
        let f = write_fixture(&data);
        let src = CacheSource::open(f.path(), 0, None).unwrap();
        let a = src.fetch(4, 8).unwrap();
        let b = src.fetch(4, 8).unwrap();
        assert_eq!(a.bytes(), b.bytes());
        let stats = src.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.touched, 16);
    }

    #[test]
    fn cache_source_evicts_under_tight_budget() {
        let data: Vec<u8> = (0u8..64).collect();
        let f = write_fixture(&data);
        let src = CacheSource::open(f.path(), 0, Some(10)).unwrap();
        let a = src.fetch(0, 8).unwrap();
        let b = src.fetch(8, 8).unwrap();
        assert_eq!(a.bytes(), &data[0..8]);
        assert_eq!(b.bytes(), &data[8..16]);
        // second fetch pushed alloced over budget and evicted the first entry,
        // but re-fetching region a still succeeds by reading from the file again.
        let a_again = src.fetch(0, 8).unwrap();
        assert_eq!(a_again.bytes(), &data[0..8]);
    }

    #[test]
    fn as_f32_reinterprets_little_endian() {
        let mut data = Vec::new();
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.extend_from_slice(&-2.25f32.to_le_bytes());
        let f = write_fixture(&data);
        let src = MmapSource::open(f.path(), 0).unwrap();
        let r = src.fetch(0, 8).unwrap();
        assert_eq!(r.as_f32(), &[1.5f32, -2.25f32]);
    }
}
