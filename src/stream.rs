//! Cluster-level access to attribute data, uniform over the resident and
//! non-resident forms.
//!
//! Resident records emulate a cluster range over their in-memory value so
//! callers can use one code path; non-resident records translate VCNs through
//! the run list and delegate the actual I/O to the [`Volume`] collaborator.

use log::debug;

use crate::attribute::{AttributeRecord, NonResidentAttributeRecord};
use crate::error::{NtfsError, Result};
use crate::runs::DataRun;
use crate::volume::Volume;

/// Read/write/extend facade over one attribute record.
pub struct AttributeData<'a> {
    record: &'a mut AttributeRecord,
}

impl<'a> AttributeData<'a> {
    pub fn new(record: &'a mut AttributeRecord) -> Self {
        Self { record }
    }

    /// Logical data length in bytes.
    pub fn length(&self) -> u64 {
        match &*self.record {
            AttributeRecord::Resident(r) => r.value.len() as u64,
            AttributeRecord::NonResident(r) => r.real_size,
        }
    }

    fn cluster_bounds(&self, bytes_per_cluster: i64) -> (i64, i64) {
        match &*self.record {
            AttributeRecord::Resident(r) => {
                let clusters = (r.value.len() as i64).div_ceil(bytes_per_cluster);
                (0, clusters - 1)
            }
            AttributeRecord::NonResident(r) => (r.lowest_vcn, r.highest_vcn),
        }
    }

    fn check_cluster_range(&self, bytes_per_cluster: i64, first_vcn: i64, count: i64) -> Result<()> {
        let (lowest, highest) = self.cluster_bounds(bytes_per_cluster);
        if count <= 0 || first_vcn < lowest || first_vcn + count - 1 > highest {
            return Err(NtfsError::InvalidArgument(format!(
                "cluster range [{}, {}) outside the attribute's [{}, {}]",
                first_vcn,
                first_vcn + count,
                lowest,
                highest
            )));
        }
        Ok(())
    }

    /// Read `count` clusters starting at `first_vcn`. Holes read as zeros;
    /// when the read reaches the final cluster the result is trimmed to the
    /// logical data length.
    pub fn read_clusters(
        &mut self,
        volume: &mut dyn Volume,
        first_vcn: i64,
        count: i64,
    ) -> Result<Vec<u8>> {
        let bytes_per_cluster = volume.bytes_per_cluster() as i64;
        self.check_cluster_range(bytes_per_cluster, first_vcn, count)?;
        let (_, highest) = self.cluster_bounds(bytes_per_cluster);
        let reaches_end = first_vcn + count - 1 == highest;

        let mut out = match &*self.record {
            AttributeRecord::Resident(r) => {
                let start = (first_vcn * bytes_per_cluster) as usize;
                let end = std::cmp::min(
                    ((first_vcn + count) * bytes_per_cluster) as usize,
                    r.value.len(),
                );
                let mut out = r.value[start..end].to_vec();
                out.resize((count * bytes_per_cluster) as usize, 0);
                out
            }
            AttributeRecord::NonResident(r) => {
                let ranges = r
                    .run_list
                    .translate_to_lcn(first_vcn - r.lowest_vcn, count)?;
                let mut out = Vec::with_capacity((count * bytes_per_cluster) as usize);
                for range in ranges {
                    let byte_count = (range.cluster_count * bytes_per_cluster) as usize;
                    match range.lcn {
                        Some(lcn) => {
                            out.extend_from_slice(&volume.read_clusters(lcn, range.cluster_count)?)
                        }
                        None => out.resize(out.len() + byte_count, 0), // sparse
                    }
                }
                out
            }
        };

        if reaches_end {
            let limit = self.length().saturating_sub((first_vcn * bytes_per_cluster) as u64);
            if (out.len() as u64) > limit {
                out.truncate(limit as usize);
            }
        }
        Ok(out)
    }

    /// Write `data` starting at cluster `first_vcn`. Every cluster must be
    /// complete, except a final partial cluster that lands exactly on the
    /// attribute's last cluster, which is zero-padded before writing.
    pub fn write_clusters(
        &mut self,
        volume: &mut dyn Volume,
        first_vcn: i64,
        data: &[u8],
    ) -> Result<()> {
        if volume.is_read_only() {
            return Err(NtfsError::ReadOnly);
        }
        let bytes_per_cluster = volume.bytes_per_cluster() as i64;
        let count = (data.len() as i64).div_ceil(bytes_per_cluster);
        self.check_cluster_range(bytes_per_cluster, first_vcn, count)?;

        let (_, highest) = self.cluster_bounds(bytes_per_cluster);
        let has_partial = data.len() as i64 % bytes_per_cluster != 0;
        if has_partial && first_vcn + count - 1 != highest {
            return Err(NtfsError::InvalidArgument(format!(
                "partial cluster write of {} bytes does not end at the final cluster {}",
                data.len(),
                highest
            )));
        }

        match &mut *self.record {
            AttributeRecord::Resident(r) => {
                let start = (first_vcn * bytes_per_cluster) as usize;
                let end = std::cmp::min(start + data.len(), r.value.len());
                r.value[start..end].copy_from_slice(&data[..end - start]);
            }
            AttributeRecord::NonResident(r) => {
                let mut padded = data.to_vec();
                padded.resize((count * bytes_per_cluster) as usize, 0);

                let ranges = r
                    .run_list
                    .translate_to_lcn(first_vcn - r.lowest_vcn, count)?;
                let mut offset = 0usize;
                for range in &ranges {
                    if range.lcn.is_none() {
                        return Err(NtfsError::InvalidArgument(format!(
                            "cannot write through a sparse extent of {} clusters",
                            range.cluster_count
                        )));
                    }
                }
                for range in ranges {
                    let byte_count = (range.cluster_count * bytes_per_cluster) as usize;
                    volume.write_clusters(
                        range.lcn.unwrap(),
                        &padded[offset..offset + byte_count],
                    )?;
                    offset += byte_count;
                }
            }
        }
        Ok(())
    }

    /// Grow the attribute by `additional_bytes`, allocating clusters from
    /// the volume when the slack of the last allocated cluster runs out.
    ///
    /// Resident records only grow their buffer here; converting one that has
    /// become too large for its segment is the caller's concern at save time.
    pub fn extend(&mut self, volume: &mut dyn Volume, additional_bytes: u64) -> Result<()> {
        if volume.is_read_only() {
            return Err(NtfsError::ReadOnly);
        }
        match &mut *self.record {
            AttributeRecord::Resident(r) => {
                let new_length = r.value.len() + additional_bytes as usize;
                r.value.resize(new_length, 0);
                Ok(())
            }
            AttributeRecord::NonResident(r) => {
                let bytes_per_cluster = volume.bytes_per_cluster() as u64;
                let slack = r.allocated_size - r.real_size;
                if additional_bytes > slack {
                    let clusters_needed =
                        (additional_bytes - slack).div_ceil(bytes_per_cluster) as i64;
                    allocate_additional_clusters(r, volume, clusters_needed)?;
                }
                r.real_size += additional_bytes;
                Ok(())
            }
        }
    }
}

/// Ask the volume for `cluster_count` more clusters, hinting at the cluster
/// right after the attribute's last allocated one so a contiguous grant can
/// be merged into the final run instead of appending a new one.
fn allocate_additional_clusters(
    record: &mut NonResidentAttributeRecord,
    volume: &mut dyn Volume,
    cluster_count: i64,
) -> Result<()> {
    let bytes_per_cluster = volume.bytes_per_cluster() as u64;
    let hint = record.run_list.data_last_lcn().map_or(0, |lcn| lcn + 1);
    let granted = volume.allocate_clusters(hint, cluster_count)?;

    for (start_lcn, length) in granted {
        let mergeable = record
            .run_list
            .data_last_lcn()
            .is_some_and(|last| start_lcn == last + 1);
        if mergeable {
            // the grant continues the last run
            let last = record.run_list.runs.last_mut().unwrap();
            last.run_length += length;
        } else {
            let previous_start = record.run_list.last_run_start_lcn().unwrap_or(0);
            record
                .run_list
                .runs
                .push(DataRun::new(length, start_lcn - previous_start));
        }
        record.highest_vcn += length;
        record.allocated_size += length as u64 * bytes_per_cluster;
        debug!(
            "Extended attribute run list by {} clusters at LCN {}.",
            length, start_lcn
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeType, ResidentAttributeRecord};
    use crate::runs::DataRunSequence;
    use crate::volume::MemoryVolume;

    const CLUSTER: usize = 512;

    fn test_volume() -> MemoryVolume {
        MemoryVolume::new(512, CLUSTER as u32)
    }

    fn non_resident_record(runs: Vec<DataRun>, real_size: u64) -> AttributeRecord {
        let mut record = NonResidentAttributeRecord::new(AttributeType::Data, "");
        let total: i64 = runs.iter().map(|r| r.run_length).sum();
        record.run_list = DataRunSequence { runs };
        record.highest_vcn = total - 1;
        record.allocated_size = total as u64 * CLUSTER as u64;
        record.real_size = real_size;
        record.initialized_size = real_size;
        AttributeRecord::NonResident(record)
    }

    #[test]
    fn non_resident_read_concatenates_runs_and_trims() {
        let mut volume = test_volume();
        volume.write_clusters(100, &vec![0xAAu8; 2 * CLUSTER]).unwrap();
        volume.write_clusters(200, &vec![0xBBu8; 2 * CLUSTER]).unwrap();

        let real_size = 4 * CLUSTER as u64 - 100;
        let mut record =
            non_resident_record(vec![DataRun::new(2, 100), DataRun::new(2, 100)], real_size);
        let mut data = AttributeData::new(&mut record);

        let all = data.read_clusters(&mut volume, 0, 4).unwrap();
        assert_eq!(all.len(), real_size as usize); // trimmed at the end
        assert!(all[..2 * CLUSTER].iter().all(|&b| b == 0xAA));
        assert!(all[2 * CLUSTER..].iter().all(|&b| b == 0xBB));

        // a read not reaching the last cluster is not trimmed
        let middle = data.read_clusters(&mut volume, 1, 2).unwrap();
        assert_eq!(middle.len(), 2 * CLUSTER);
    }

    #[test]
    fn sparse_extent_reads_as_zeros() {
        let mut volume = test_volume();
        volume.write_clusters(50, &vec![0x11u8; CLUSTER]).unwrap();
        let mut record = non_resident_record(
            vec![DataRun::new(1, 50), DataRun::sparse(2), DataRun::new(1, 1)],
            4 * CLUSTER as u64,
        );
        let mut data = AttributeData::new(&mut record);
        let out = data.read_clusters(&mut volume, 0, 4).unwrap();
        assert!(out[..CLUSTER].iter().all(|&b| b == 0x11));
        assert!(out[CLUSTER..3 * CLUSTER].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_read_fails() {
        let mut volume = test_volume();
        let mut record = non_resident_record(vec![DataRun::new(2, 10)], 2 * CLUSTER as u64);
        let mut data = AttributeData::new(&mut record);
        assert!(matches!(
            data.read_clusters(&mut volume, 1, 2),
            Err(NtfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn partial_write_must_end_at_final_cluster() {
        let mut volume = test_volume();
        let mut record = non_resident_record(vec![DataRun::new(4, 10)], 4 * CLUSTER as u64);
        let mut data = AttributeData::new(&mut record);

        // partial cluster in the middle of the range
        let err = data
            .write_clusters(&mut volume, 0, &vec![1u8; CLUSTER + 10])
            .unwrap_err();
        assert!(matches!(err, NtfsError::InvalidArgument(_)));

        // partial final cluster is zero-padded and accepted
        data.write_clusters(&mut volume, 3, &vec![2u8; 10]).unwrap();
        let back = volume.read_clusters(13, 1).unwrap();
        assert!(back[..10].iter().all(|&b| b == 2));
        assert!(back[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_through_sparse_extents_are_refused() {
        let mut volume = test_volume();
        let mut record = non_resident_record(
            vec![DataRun::new(1, 10), DataRun::sparse(1)],
            2 * CLUSTER as u64,
        );
        let mut data = AttributeData::new(&mut record);
        assert!(data
            .write_clusters(&mut volume, 0, &vec![0u8; 2 * CLUSTER])
            .is_err());
        // the non-sparse prefix alone is fine
        data.write_clusters(&mut volume, 0, &vec![3u8; CLUSTER]).unwrap();
    }

    #[test]
    fn read_only_volume_fails_fast() {
        let mut volume = test_volume();
        volume.set_read_only(true);
        let mut record = non_resident_record(vec![DataRun::new(1, 10)], CLUSTER as u64);
        let mut data = AttributeData::new(&mut record);
        assert!(matches!(
            data.write_clusters(&mut volume, 0, &vec![0u8; CLUSTER]),
            Err(NtfsError::ReadOnly)
        ));
        assert!(matches!(
            data.extend(&mut volume, 10),
            Err(NtfsError::ReadOnly)
        ));
    }

    #[test]
    fn resident_emulates_clusters() {
        let mut volume = test_volume();
        let mut inner = ResidentAttributeRecord::new(AttributeType::Data, "");
        inner.value = vec![7u8; CLUSTER + 100];
        let mut record = AttributeRecord::Resident(inner);
        let mut data = AttributeData::new(&mut record);

        let all = data.read_clusters(&mut volume, 0, 2).unwrap();
        assert_eq!(all.len(), CLUSTER + 100); // trimmed to the value length
        let first = data.read_clusters(&mut volume, 0, 1).unwrap();
        assert_eq!(first.len(), CLUSTER);
        assert!(data.read_clusters(&mut volume, 2, 1).is_err());

        data.write_clusters(&mut volume, 1, &vec![9u8; 100]).unwrap();
        if let AttributeRecord::Resident(r) = &record {
            assert!(r.value[CLUSTER..].iter().all(|&b| b == 9));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn resident_extend_grows_buffer() {
        let mut volume = test_volume();
        let mut inner = ResidentAttributeRecord::new(AttributeType::Data, "");
        inner.value = vec![1u8; 16];
        let mut record = AttributeRecord::Resident(inner);
        AttributeData::new(&mut record)
            .extend(&mut volume, 24)
            .unwrap();
        if let AttributeRecord::Resident(r) = &record {
            assert_eq!(r.value.len(), 40);
            assert!(r.value[16..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn extend_within_slack_allocates_nothing() {
        let mut volume = test_volume();
        let mut record =
            non_resident_record(vec![DataRun::new(2, 10)], 2 * CLUSTER as u64 - 200);
        let mut data = AttributeData::new(&mut record);
        data.extend(&mut volume, 150).unwrap();
        if let AttributeRecord::NonResident(r) = &record {
            assert_eq!(r.run_list.runs.len(), 1);
            assert_eq!(r.highest_vcn, 1);
            assert_eq!(r.real_size, 2 * CLUSTER as u64 - 50);
        }
    }

    #[test]
    fn extend_merges_contiguous_allocation() {
        let mut volume = test_volume();
        volume.set_next_free_lcn(0); // hint 12 is honoured
        let mut record = non_resident_record(vec![DataRun::new(2, 10)], 2 * CLUSTER as u64);
        let mut data = AttributeData::new(&mut record);
        data.extend(&mut volume, CLUSTER as u64).unwrap();
        if let AttributeRecord::NonResident(r) = &record {
            // allocation at LCN 12 merged into the existing run
            assert_eq!(r.run_list.runs, vec![DataRun::new(3, 10)]);
            assert_eq!(r.highest_vcn, 2);
            assert_eq!(r.allocated_size, 3 * CLUSTER as u64);
        }
    }

    #[test]
    fn extend_appends_fragmented_allocation() {
        let mut volume = test_volume();
        volume.set_next_free_lcn(500); // hint 12 cannot be honoured
        let mut record = non_resident_record(vec![DataRun::new(2, 10)], 2 * CLUSTER as u64);
        let mut data = AttributeData::new(&mut record);
        data.extend(&mut volume, 3 * CLUSTER as u64).unwrap();
        if let AttributeRecord::NonResident(r) = &record {
            assert_eq!(
                r.run_list.runs,
                vec![DataRun::new(2, 10), DataRun::new(3, 490)]
            );
            assert_eq!(r.highest_vcn, 4);
            assert_eq!(r.real_size, 5 * CLUSTER as u64);
        }
    }
}
