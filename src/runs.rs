// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! Mapping-pairs (data run) encoding: run-length-encoded cluster extents
//! addressing the data of a non-resident attribute.

use crate::error::{NtfsError, Result};
use serde::{Deserialize, Serialize};

/// Minimal number of little-endian bytes whose two's-complement truncation
/// still represents `value`, sign included. `var_long_size(0) == 1`.
pub fn var_long_size(value: i64) -> usize {
    for size in 1..8 {
        let shift = 64 - 8 * size;
        if (value << shift) >> shift == value {
            return size;
        }
    }
    8
}

/// Decode a little-endian signed integer, sign-extending from the high bit
/// of the last byte.
pub fn read_var_long(buf: &[u8]) -> i64 {
    let mut value = 0i64;
    for (i, &byte) in buf.iter().enumerate() {
        value |= (byte as i64) << (8 * i);
    }
    let bits = buf.len() * 8;
    if bits > 0 && bits < 64 && buf[buf.len() - 1] & 0x80 != 0 {
        value |= !0i64 << bits;
    }
    value
}

fn write_var_long(out: &mut Vec<u8>, value: i64, size: usize) {
    for i in 0..size {
        out.push((value >> (8 * i)) as u8);
    }
}

/// One contiguous cluster extent of a non-resident attribute.
///
/// `run_offset` is relative to the previous run's start LCN, not to LCN 0.
/// Sparse runs have no physical backing and encode an offset field of size 0.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataRun {
    pub run_length: i64,
    pub run_offset: i64,
    pub is_sparse: bool,
}

impl DataRun {
    pub fn new(run_length: i64, run_offset: i64) -> Self {
        Self {
            run_length,
            run_offset,
            is_sparse: false,
        }
    }

    pub fn sparse(run_length: i64) -> Self {
        Self {
            run_length,
            run_offset: 0,
            is_sparse: true,
        }
    }

    /// Decode one run at `buf[offset]`. Returns the run and the number of
    /// bytes consumed, which may exceed [`DataRun::record_length`] when the
    /// writer used a non-minimal field width.
    pub fn read(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let header = *buf
            .get(offset)
            .ok_or_else(|| NtfsError::corrupt(offset, "data run header outside buffer"))?;
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(NtfsError::corrupt(
                offset,
                format!("invalid data run header byte 0x{:02X}", header),
            ));
        }
        if offset + 1 + length_size + offset_size > buf.len() {
            return Err(NtfsError::corrupt(
                offset,
                "data run extends beyond buffer",
            ));
        }

        let length_field = &buf[offset + 1..offset + 1 + length_size];
        let run_length = read_var_long(length_field);
        if run_length <= 0 {
            return Err(NtfsError::corrupt(
                offset,
                format!("non-positive run length {}", run_length),
            ));
        }

        let run = if offset_size == 0 {
            DataRun::sparse(run_length)
        } else {
            let offset_field =
                &buf[offset + 1 + length_size..offset + 1 + length_size + offset_size];
            DataRun::new(run_length, read_var_long(offset_field))
        };
        Ok((run, 1 + length_size + offset_size))
    }

    /// Minimal encoded size: header byte plus both fields. Writers always
    /// emit this form, whatever width the run was read with.
    pub fn record_length(&self) -> usize {
        let offset_size = if self.is_sparse {
            0
        } else {
            var_long_size(self.run_offset)
        };
        1 + var_long_size(self.run_length) + offset_size
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let length_size = var_long_size(self.run_length);
        let offset_size = if self.is_sparse {
            0
        } else {
            var_long_size(self.run_offset)
        };
        out.push(((offset_size << 4) | length_size) as u8);
        write_var_long(out, self.run_length, length_size);
        if !self.is_sparse {
            write_var_long(out, self.run_offset, offset_size);
        }
    }
}

/// One translated extent: `lcn` is `None` for a hole in a sparse attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterRange {
    pub lcn: Option<i64>,
    pub cluster_count: i64,
}

/// The ordered run list of one attribute (or attribute fragment).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataRunSequence {
    pub runs: Vec<DataRun>,
}

impl DataRunSequence {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    /// Decode mapping-pairs bytes up to the zero terminator (or the end of
    /// the buffer, for writers that omit it).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut runs = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() && buf[pos] != 0 {
            let (run, consumed) = DataRun::read(buf, pos)?;
            runs.push(run);
            pos += consumed;
        }
        Ok(Self { runs })
    }

    /// Minimal encoding, zero terminator included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.record_length());
        for run in &self.runs {
            run.write(&mut out);
        }
        out.push(0);
        out
    }

    pub fn record_length(&self) -> usize {
        self.runs.iter().map(|r| r.record_length()).sum::<usize>() + 1
    }

    pub fn total_clusters(&self) -> i64 {
        self.runs.iter().map(|r| r.run_length).sum()
    }

    /// Absolute start LCN of every run: the cumulative sum of offsets.
    /// Sparse runs contribute nothing and inherit the running value.
    pub fn run_start_lcns(&self) -> Vec<i64> {
        let mut lcn = 0i64;
        self.runs
            .iter()
            .map(|r| {
                if !r.is_sparse {
                    lcn += r.run_offset;
                }
                lcn
            })
            .collect()
    }

    /// Start LCN of the last run, i.e. the running LCN after every offset
    /// has been applied. `None` for an empty sequence.
    pub fn last_run_start_lcn(&self) -> Option<i64> {
        self.run_start_lcns().last().copied()
    }

    pub fn first_run_start_lcn(&self) -> Option<i64> {
        self.run_start_lcns().first().copied()
    }

    /// Last allocated LCN of the sequence, used as the allocation hint when
    /// extending an attribute. `None` when the last run is a hole.
    pub fn data_last_lcn(&self) -> Option<i64> {
        let starts = self.run_start_lcns();
        let last = self.runs.last()?;
        if last.is_sparse {
            None
        } else {
            Some(starts[starts.len() - 1] + last.run_length - 1)
        }
    }

    /// Map `count` virtual clusters starting at `first_vcn` onto physical
    /// extents, one entry per run touched.
    pub fn translate_to_lcn(&self, first_vcn: i64, count: i64) -> Result<Vec<ClusterRange>> {
        if first_vcn < 0 || count < 0 || first_vcn + count > self.total_clusters() {
            return Err(NtfsError::InvalidArgument(format!(
                "VCN range [{}, {}) outside the {} clusters of the run list",
                first_vcn,
                first_vcn + count,
                self.total_clusters()
            )));
        }

        let mut result = Vec::new();
        let mut remaining = count;
        let mut next_vcn = first_vcn;
        let mut run_start_vcn = 0i64;
        let mut run_start_lcn = 0i64;
        for run in &self.runs {
            if !run.is_sparse {
                run_start_lcn += run.run_offset;
            }
            let run_end_vcn = run_start_vcn + run.run_length;
            if remaining > 0 && next_vcn < run_end_vcn {
                let skip = next_vcn - run_start_vcn;
                let take = std::cmp::min(run.run_length - skip, remaining);
                result.push(ClusterRange {
                    lcn: (!run.is_sparse).then_some(run_start_lcn + skip),
                    cluster_count: take,
                });
                remaining -= take;
                next_vcn += take;
            }
            run_start_vcn = run_end_vcn;
            if remaining == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Single-cluster lookup. `None` when `vcn` falls in a hole.
    pub fn data_cluster_lcn(&self, vcn: i64) -> Result<Option<i64>> {
        let ranges = self.translate_to_lcn(vcn, 1)?;
        Ok(ranges[0].lcn)
    }

    /// Drop whole runs beyond `new_cluster_count` and shorten the run that
    /// straddles the boundary.
    pub fn truncate(&mut self, new_cluster_count: i64) {
        let mut total = 0i64;
        let mut keep = self.runs.len();
        for (index, run) in self.runs.iter_mut().enumerate() {
            if total + run.run_length >= new_cluster_count {
                run.run_length = new_cluster_count - total;
                keep = if run.run_length > 0 { index + 1 } else { index };
                break;
            }
            total += run.run_length;
        }
        self.runs.truncate(keep);
    }
}
