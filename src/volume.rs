//! The storage collaborator consumed by the attribute engine.
//!
//! Cluster-granularity I/O and allocation live behind this trait; the engine
//! itself never touches sectors directly.

use crate::error::{NtfsError, Result};

/// Cluster-level view of the underlying volume.
///
/// `allocate_clusters` is best-effort: the volume tries to satisfy the
/// allocation starting at `desired_start_lcn` so newly allocated clusters can
/// be merged into an attribute's last data run, but it may return any number
/// of extents adding up to `count`.
pub trait Volume {
    fn bytes_per_sector(&self) -> u32;
    fn bytes_per_cluster(&self) -> u32;
    fn is_read_only(&self) -> bool;
    fn read_clusters(&mut self, lcn: i64, count: i64) -> Result<Vec<u8>>;
    fn write_clusters(&mut self, lcn: i64, data: &[u8]) -> Result<()>;
    fn allocate_clusters(
        &mut self,
        desired_start_lcn: i64,
        count: i64,
    ) -> Result<Vec<(i64, i64)>>;
}

/// In-memory volume backed by a flat buffer, growing on demand.
///
/// Allocation is a bump allocator honouring the start hint whenever the hint
/// points at or past the high-water mark, which is enough to exercise both
/// the contiguous-merge and the append path of `extend`.
#[derive(Debug, Clone)]
pub struct MemoryVolume {
    bytes_per_sector: u32,
    bytes_per_cluster: u32,
    read_only: bool,
    data: Vec<u8>,
    next_free_lcn: i64,
}

impl MemoryVolume {
    pub fn new(bytes_per_sector: u32, bytes_per_cluster: u32) -> Self {
        Self {
            bytes_per_sector,
            bytes_per_cluster,
            read_only: false,
            data: Vec::new(),
            next_free_lcn: 0,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Move the allocator's high-water mark, e.g. to force fragmentation.
    pub fn set_next_free_lcn(&mut self, lcn: i64) {
        self.next_free_lcn = lcn;
    }

    fn ensure_capacity(&mut self, end_lcn: i64) {
        let needed = end_lcn as usize * self.bytes_per_cluster as usize;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }
}

impl Volume for MemoryVolume {
    fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_clusters(&mut self, lcn: i64, count: i64) -> Result<Vec<u8>> {
        if lcn < 0 || count < 0 {
            return Err(NtfsError::InvalidArgument(format!(
                "negative cluster range: lcn {}, count {}",
                lcn, count
            )));
        }
        self.ensure_capacity(lcn + count);
        let cluster_size = self.bytes_per_cluster as usize;
        let start = lcn as usize * cluster_size;
        let end = start + count as usize * cluster_size;
        Ok(self.data[start..end].to_vec())
    }

    fn write_clusters(&mut self, lcn: i64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(NtfsError::ReadOnly);
        }
        let cluster_size = self.bytes_per_cluster as usize;
        if lcn < 0 || data.len() % cluster_size != 0 {
            return Err(NtfsError::InvalidArgument(format!(
                "write of {} bytes at LCN {} is not cluster aligned",
                data.len(),
                lcn
            )));
        }
        let count = (data.len() / cluster_size) as i64;
        self.ensure_capacity(lcn + count);
        let start = lcn as usize * cluster_size;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn allocate_clusters(
        &mut self,
        desired_start_lcn: i64,
        count: i64,
    ) -> Result<Vec<(i64, i64)>> {
        if self.read_only {
            return Err(NtfsError::ReadOnly);
        }
        if count <= 0 {
            return Err(NtfsError::InvalidArgument(format!(
                "cannot allocate {} clusters",
                count
            )));
        }
        let start = if desired_start_lcn >= self.next_free_lcn {
            desired_start_lcn
        } else {
            self.next_free_lcn
        };
        self.next_free_lcn = start + count;
        self.ensure_capacity(self.next_free_lcn);
        Ok(vec![(start, count)])
    }
}
