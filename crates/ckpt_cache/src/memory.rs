//! memfd-backed shared-memory regions and fleet-wide memory accounting.
//!
//! Every resident checkpoint lives in an anonymous file created with
//! `memfd_create`, truncated to the payload size and mapped shared. Clients
//! reach the bytes through `/proc/<pid>/fd/<memfd>`, so the fd must stay
//! stable for the life of the record; resizing re-truncates the same fd and
//! only remaps when the region grows.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use memmap2::MmapMut;

use crate::config::MEM_WATCH_PERIOD;
use crate::types::{CacheError, CacheResult, DataEntry, Metadata};

const MEM_CGROUP_DIR: &str = "/sys/fs/cgroup/memory";

/// A mapped shared-memory region holding one checkpoint payload.
pub struct Region {
    filename: String,
    file: Arc<File>,
    map: Option<MmapMut>,
    ptr: *mut u8,
    len: AtomicUsize,
}

// The raw pointer refers to a shared mapping that outlives every reader and
// writer holding an `Arc<Region>`; access goes through the bounds-checked
// methods below. Single-writer-per-transfer is a protocol invariant.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn map_file(filename: &str, file: Arc<File>, len: u64) -> Result<Self> {
        let map = unsafe { MmapMut::map_mut(&*file) }
            .with_context(|| format!("mmap {len} bytes for {filename}"))?;
        let ptr = map.as_ptr() as *mut u8;
        Ok(Region {
            filename: filename.to_string(),
            file,
            map: Some(map),
            ptr,
            len: AtomicUsize::new(len as usize),
        })
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire-visible handle of this region.
    pub fn entry(&self) -> DataEntry {
        DataEntry {
            address: self.ptr as u64,
            pid: std::process::id() as i32,
            memfd: self.file.as_raw_fd(),
        }
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| anyhow!("offset overflow"))?;
        if end > self.len() {
            return Err(anyhow!(
                "range [{offset}, {end}) outside region of {} bytes",
                self.len()
            ));
        }
        Ok(())
    }

    /// Shared view of a byte range, for sends and persistence.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_bounds(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) })
    }

    /// Mutable view of a byte range for transfer I/O.
    ///
    /// Soundness rests on the replication protocol: at most one writer per
    /// region while a transfer is in flight, and the `Arc` keeps the mapping
    /// alive across await points.
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_bounds(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) })
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let dst = self.bytes_mut(offset, src.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let src = self.bytes(offset, dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Shrink in place. The mapping stays as large as it was; `len` caps all
    /// later access, so pages past EOF are never touched.
    fn shrink(&self, new_len: u64) -> Result<()> {
        self.file
            .set_len(new_len)
            .with_context(|| format!("ftruncate {} to {new_len}", self.filename))?;
        self.len.store(new_len as usize, Ordering::Release);
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Unmapping tens of GiB can stall the caller for milliseconds, so the
        // mapping is dropped on a detached thread. The fd closes with the
        // last `Arc<File>`.
        if let Some(map) = self.map.take() {
            std::thread::spawn(move || drop(map));
        }
    }
}

fn memfd_create(name: &str) -> Result<File> {
    let cname = CString::new(name.as_bytes().to_vec()).context("memfd name contains NUL")?;
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), 0) };
    if fd < 0 {
        return Err(anyhow!(
            "memfd_create: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Point-in-time memory statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStat {
    /// Host memory limit intersected with the user ceiling and physical RAM.
    pub total_capacity: u64,
    /// cgroup current usage.
    pub total_usage: u64,
    /// cgroup max usage watermark.
    pub total_max_usage: u64,
    /// Sum of live checkpoint region sizes on this node.
    pub self_total_usage: u64,
    /// Budget remaining for new allocations.
    pub total_idle: u64,
}

impl std::fmt::Display for MemoryStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "capacity {} usage {} max_usage {} self_usage {} idle {}",
            self.total_capacity,
            self.total_usage,
            self.total_max_usage,
            self.self_total_usage,
            self.total_idle
        )
    }
}

/// Singleton-by-composition allocator and accountant for checkpoint memory.
///
/// With a user ceiling configured, admission is judged against this node's
/// own checkpoint usage; otherwise against the cgroup's total usage.
pub struct MemoryMonitor {
    user_limit: Option<u64>,
    cgroup_dir: PathBuf,
    stat: Mutex<MemoryStat>,
}

impl MemoryMonitor {
    pub fn new(user_limit: Option<u64>) -> Arc<Self> {
        let monitor = Arc::new(MemoryMonitor {
            user_limit,
            cgroup_dir: PathBuf::from(MEM_CGROUP_DIR),
            stat: Mutex::new(MemoryStat::default()),
        });
        monitor.collect(true);
        tracing::info!(stat = %monitor.stat(), "memory monitor initialized");
        monitor
    }

    /// Periodically refresh usage counters from the cgroup.
    pub fn spawn_refresh(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MEM_WATCH_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.collect(false);
                tracing::info!(stat = %monitor.stat(), "memory monitor statistics");
            }
        });
    }

    fn read_cgroup(&self, file: &str) -> Option<u64> {
        let raw = std::fs::read_to_string(self.cgroup_dir.join(file)).ok()?;
        raw.trim().parse().ok()
    }

    fn physical_memory() -> u64 {
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        if pages <= 0 || page_size <= 0 {
            return u64::MAX;
        }
        pages as u64 * page_size as u64
    }

    fn collect(&self, collect_capacity: bool) {
        let usage = self.read_cgroup("memory.usage_in_bytes").unwrap_or(0);
        let max_usage = self.read_cgroup("memory.max_usage_in_bytes").unwrap_or(0);

        let mut stat = self.stat.lock().expect("memory stat lock");
        stat.total_usage = usage;
        stat.total_max_usage = max_usage;
        if collect_capacity {
            // A cgroup with no limit reports a sentinel far above physical
            // memory, so the capacity is clamped to what the host can hold.
            let cgroup_limit = self
                .read_cgroup("memory.limit_in_bytes")
                .unwrap_or(u64::MAX);
            let mut capacity = cgroup_limit.min(Self::physical_memory());
            if let Some(user_limit) = self.user_limit {
                capacity = capacity.min(user_limit);
            }
            stat.total_capacity = capacity;
        }
        let consumed = if self.user_limit.is_some() {
            stat.self_total_usage
        } else {
            stat.total_usage.max(stat.self_total_usage)
        };
        stat.total_idle = stat.total_capacity.saturating_sub(consumed);
    }

    pub fn stat(&self) -> MemoryStat {
        *self.stat.lock().expect("memory stat lock")
    }

    /// Whether an allocation of `size` bytes fits the budget right now.
    pub fn has_room(&self, size: u64) -> bool {
        self.collect(false);
        self.stat().total_idle >= size
    }

    fn charge(&self, size: u64) {
        let mut stat = self.stat.lock().expect("memory stat lock");
        stat.self_total_usage += size;
        stat.total_idle = stat.total_idle.saturating_sub(size);
    }

    /// Release accounting for a freed or failed region.
    pub fn free(&self, size: u64) {
        let mut stat = self.stat.lock().expect("memory stat lock");
        stat.self_total_usage = stat.self_total_usage.saturating_sub(size);
        stat.total_idle = stat.total_idle.saturating_add(size);
    }

    /// Allocate a fresh region for the checkpoint described by `metadata`.
    ///
    /// OOM is a recoverable refusal surfaced to the caller, never fatal.
    pub fn try_allocate(&self, metadata: &Metadata) -> CacheResult<Arc<Region>> {
        if metadata.size == 0 {
            return Err(CacheError::Unknown(anyhow!(
                "refuse to allocate zero bytes for {}",
                metadata.filename
            )));
        }
        if !self.has_room(metadata.size) {
            tracing::warn!(
                file = %metadata.filename,
                require = metadata.size,
                idle = self.stat().total_idle,
                "memory insufficient"
            );
            return Err(CacheError::OutOfMemory);
        }
        self.charge(metadata.size);
        match self.map_new(metadata) {
            Ok(region) => Ok(region),
            Err(err) => {
                self.free(metadata.size);
                Err(CacheError::Unknown(err))
            }
        }
    }

    fn map_new(&self, metadata: &Metadata) -> Result<Arc<Region>> {
        let file = memfd_create(&metadata.filename)?;
        file.set_len(metadata.size)
            .with_context(|| format!("ftruncate {} to {}", metadata.filename, metadata.size))?;
        let region = Region::map_file(&metadata.filename, Arc::new(file), metadata.size)?;
        tracing::debug!(
            file = %metadata.filename,
            entry = %region.entry(),
            size = metadata.size,
            "mapped shared-memory region"
        );
        Ok(Arc::new(region))
    }

    /// Re-truncate an already-resident region to `metadata.size`.
    ///
    /// Returns `None` when the existing mapping still serves (equal size or a
    /// reduction), or the replacement region after an enlargement. The memfd
    /// is reused either way so client handles stay valid.
    pub fn try_resize(
        &self,
        metadata: &Metadata,
        region: &Arc<Region>,
    ) -> CacheResult<Option<Arc<Region>>> {
        if metadata.size == 0 {
            return Err(CacheError::Unknown(anyhow!(
                "refuse to resize {} to zero bytes",
                metadata.filename
            )));
        }
        let old = region.len() as u64;
        let new = metadata.size;
        if new == old {
            return Ok(None);
        }
        if new < old {
            region.shrink(new).map_err(CacheError::Unknown)?;
            self.free(old - new);
            tracing::debug!(file = %metadata.filename, old, new, "shrunk region");
            return Ok(None);
        }

        let grow = new - old;
        if !self.has_room(grow) {
            return Err(CacheError::OutOfMemory);
        }
        self.charge(grow);
        let remap = || -> Result<Arc<Region>> {
            region
                .file
                .set_len(new)
                .with_context(|| format!("ftruncate {} to {new}", metadata.filename))?;
            let replacement =
                Region::map_file(&metadata.filename, region.file.clone(), new)?;
            Ok(Arc::new(replacement))
        };
        match remap() {
            Ok(replacement) => {
                tracing::debug!(file = %metadata.filename, old, new, "remapped grown region");
                Ok(Some(replacement))
            }
            Err(err) => {
                self.free(grow);
                Err(CacheError::Unknown(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckpointState;

    fn metadata(filename: &str, size: u64) -> Metadata {
        Metadata {
            job: "j".into(),
            filename: filename.into(),
            node_rank: 0,
            iteration: "1".into(),
            state: CheckpointState::Cached,
            size,
        }
    }

    fn monitor(limit: u64) -> Arc<MemoryMonitor> {
        // With a user ceiling the capacity clamps to it and admission is
        // judged against this node's own usage, so tests are deterministic.
        MemoryMonitor::new(Some(limit))
    }

    #[test]
    fn zero_size_is_rejected() {
        let monitor = monitor(1 << 20);
        assert!(matches!(
            monitor.try_allocate(&metadata("f", 0)),
            Err(CacheError::Unknown(_))
        ));
    }

    #[test]
    fn regions_hold_their_bytes() {
        let monitor = monitor(1 << 20);
        let region = monitor.try_allocate(&metadata("f", 64)).unwrap();
        region.write_at(0, &[7u8; 64]).unwrap();
        let mut out = [0u8; 64];
        region.read_at(0, &mut out).unwrap();
        assert_eq!(out, [7u8; 64]);
        assert!(region.write_at(60, &[0u8; 8]).is_err());

        let entry = region.entry();
        assert_ne!(entry.address, 0);
        assert_eq!(entry.pid, std::process::id() as i32);
    }

    #[test]
    fn accounting_never_exceeds_capacity() {
        let monitor = monitor(4096);
        let a = monitor.try_allocate(&metadata("a", 2048)).unwrap();
        let b = monitor.try_allocate(&metadata("b", 2048)).unwrap();
        assert_eq!(monitor.stat().self_total_usage, 4096);
        assert!(matches!(
            monitor.try_allocate(&metadata("c", 1)),
            Err(CacheError::OutOfMemory)
        ));

        monitor.free(a.len() as u64);
        drop(a);
        assert!(monitor.try_allocate(&metadata("c", 1024)).is_ok());
        assert!(monitor.stat().self_total_usage <= monitor.stat().total_capacity);
        drop(b);
    }

    #[test]
    fn resize_shrinks_in_place_and_grows_by_remap() {
        let monitor = monitor(1 << 20);
        let region = monitor.try_allocate(&metadata("f", 4096)).unwrap();
        let fd = region.entry().memfd;

        assert!(monitor
            .try_resize(&metadata("f", 1024), &region)
            .unwrap()
            .is_none());
        assert_eq!(region.len(), 1024);
        assert_eq!(monitor.stat().self_total_usage, 1024);

        let grown = monitor
            .try_resize(&metadata("f", 8192), &region)
            .unwrap()
            .expect("growth must remap");
        assert_eq!(grown.len(), 8192);
        assert_eq!(grown.entry().memfd, fd);
        assert_eq!(monitor.stat().self_total_usage, 8192);
    }
}
