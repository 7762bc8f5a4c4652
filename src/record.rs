// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf

//! Logical file records: one base segment plus extension segments, the
//! assembly of attribute fragments into one logical attribute list, and the
//! inverse slicing of that list back across segments when it outgrows one.

use std::collections::VecDeque;

use log::debug;
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::attribute::{
    AttributeListEntry, AttributeRecord, AttributeType, FileNameAttr,
    NonResidentAttributeRecord, ResidentAttributeRecord, StandardInformation, align8,
    write_attribute_list,
};
use crate::error::{NtfsError, Result};
use crate::runs::{DataRunSequence, var_long_size};
use crate::segment::{FileRecordSegment, SegmentReference};

/// Segment number carried by extension segments created during slicing until
/// the MFT layer assigns them a real location.
pub const UNASSIGNED_SEGMENT: i64 = -1;

const END_MARKER_LENGTH: usize = 4;

/// A logical file: the base segment and any extension segments, plus the
/// lazily assembled view of the logical attribute list.
///
/// The assembled list is a derived cache over segment state; every operation
/// that rewrites segment content refreshes or drops it explicitly.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecord {
    segments: Vec<FileRecordSegment>,
    #[serde(skip)]
    attributes: Option<Vec<AttributeRecord>>,
}

impl FileRecord {
    /// Wrap parsed segments. Segment 0 must be the base segment and every
    /// extension segment must point back at it.
    pub fn new(segments: Vec<FileRecordSegment>) -> Result<Self> {
        let base = segments.first().ok_or_else(|| {
            NtfsError::InvalidArgument("a file record needs at least one segment".to_string())
        })?;
        if !base.is_base() {
            return Err(NtfsError::InvalidArgument(
                "segment 0 must be the base segment".to_string(),
            ));
        }
        let base_number = base.segment_number;
        for segment in &segments[1..] {
            if segment.base_segment_reference.segment_number != base_number {
                return Err(NtfsError::InvalidArgument(format!(
                    "extension segment {} does not reference base segment {}",
                    segment.segment_number, base_number
                )));
            }
        }
        Ok(Self {
            segments,
            attributes: None,
        })
    }

    pub fn segments(&self) -> &[FileRecordSegment] {
        &self.segments
    }

    /// Mutable segment access for the MFT layer, e.g. to assign real numbers
    /// to freshly sliced extension segments before rebuilding the attribute
    /// list. Changing attribute content through this requires
    /// [`FileRecord::invalidate_attribute_cache`].
    pub fn segments_mut(&mut self) -> &mut Vec<FileRecordSegment> {
        &mut self.segments
    }

    pub fn base_segment(&self) -> &FileRecordSegment {
        &self.segments[0]
    }

    pub fn is_in_use(&self) -> bool {
        self.base_segment().is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.base_segment().is_directory()
    }

    /// Drop the assembled view. Required after mutating segment content
    /// directly; the accessors below recompute it on demand.
    pub fn invalidate_attribute_cache(&mut self) {
        self.attributes = None;
    }

    fn ensure_attributes(&mut self) -> Result<()> {
        if self.attributes.is_none() {
            let assembled = if self.segments.len() == 1 {
                self.segments[0].attributes().to_vec()
            } else {
                debug!(
                    "Assembling attributes of record {} from {} segments.",
                    self.segments[0].segment_number,
                    self.segments.len()
                );
                assemble_attributes(&self.segments)?
            };
            self.attributes = Some(assembled);
        }
        Ok(())
    }

    /// The logical attribute list: the base segment's immediate attributes
    /// for a single-segment record, the assembled fragments otherwise.
    pub fn attributes(&mut self) -> Result<&[AttributeRecord]> {
        self.ensure_attributes()?;
        Ok(self.attributes.as_deref().unwrap())
    }

    /// Mutable access to the logical attribute list. Changes become durable
    /// once [`FileRecord::update_segments`] redistributes them.
    pub fn attributes_mut(&mut self) -> Result<&mut Vec<AttributeRecord>> {
        self.ensure_attributes()?;
        Ok(self.attributes.as_mut().unwrap())
    }

    pub fn find_attribute(
        &mut self,
        attr_type: AttributeType,
        name: &str,
    ) -> Result<Option<&AttributeRecord>> {
        Ok(self
            .attributes()?
            .iter()
            .find(|a| a.attr_type() == attr_type && a.name() == name))
    }

    /// Every $FILE_NAME attribute (there may be two: long and DOS name).
    pub fn file_names(&mut self) -> Result<Vec<FileNameAttr>> {
        let mut names = Vec::new();
        for attribute in self.attributes()? {
            if let AttributeRecord::Resident(r) = attribute {
                if r.attr_type == AttributeType::FileName {
                    names.push(FileNameAttr::from_bytes(&r.value)?);
                }
            }
        }
        Ok(names)
    }

    pub fn primary_name(&mut self) -> Result<Option<String>> {
        Ok(self.file_names()?.into_iter().next().map(|f| f.name))
    }

    pub fn standard_information(&mut self) -> Result<Option<StandardInformation>> {
        match self.find_attribute(AttributeType::StandardInformation, "")? {
            Some(AttributeRecord::Resident(r)) => {
                Ok(Some(StandardInformation::from_bytes(&r.value)?))
            }
            _ => Ok(None),
        }
    }

    /// Redistribute the logical attribute list across segments: back into the
    /// base segment alone when it fits, sliced across extension segments
    /// (with a rebuilt $ATTRIBUTE_LIST) otherwise.
    pub fn update_segments(
        &mut self,
        segment_length: usize,
        minor_ntfs_version: u8,
    ) -> Result<()> {
        self.ensure_attributes()?;
        let mut attributes = self.attributes.clone().unwrap();
        // the list is derived from the final placement, never an input
        attributes.retain(|a| a.attr_type() != AttributeType::AttributeList);
        attributes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let capacity = empty_segment_capacity(segment_length, minor_ntfs_version);
        let total: usize = attributes.iter().map(|a| a.record_length()).sum();

        if total <= capacity {
            let base = &mut self.segments[0];
            base.clear_attributes();
            for attribute in &attributes {
                base.insert_attribute(attribute.clone());
            }
            self.segments.truncate(1);
        } else {
            debug!(
                "Attributes need {} bytes, segment holds {}: slicing.",
                total, capacity
            );
            let snapshot = self.segments.clone();
            let sliced = self
                .slice_attributes(&attributes, segment_length, minor_ntfs_version)
                .and_then(|()| self.rebuild_attribute_list(segment_length, minor_ntfs_version));
            if let Err(error) = sliced {
                self.segments = snapshot;
                return Err(error);
            }
        }
        // instance numbers were reassigned during insertion; recompute the
        // logical view on demand
        self.attributes = None;
        Ok(())
    }

    /// Serialize every segment, fixups applied.
    pub fn to_segment_bytes(
        &self,
        segment_length: usize,
        minor_ntfs_version: u8,
    ) -> Result<Vec<Vec<u8>>> {
        self.segments
            .iter()
            .map(|s| s.to_bytes(segment_length, minor_ntfs_version))
            .collect()
    }

    /// Rebuild the base segment's $ATTRIBUTE_LIST from the current placement
    /// of attributes across segments. Called by `update_segments`, and again
    /// by the MFT layer once it has assigned real numbers to fresh segments.
    pub fn rebuild_attribute_list(
        &mut self,
        segment_length: usize,
        minor_ntfs_version: u8,
    ) -> Result<()> {
        if self.segments.len() < 2 {
            self.segments[0].remove_attribute(AttributeType::AttributeList, "");
            return Ok(());
        }

        let mut entries = Vec::new();
        for segment in &self.segments {
            let reference = segment.reference();
            for attribute in segment.attributes() {
                if attribute.attr_type() == AttributeType::AttributeList {
                    continue;
                }
                entries.push(AttributeListEntry {
                    attr_type: attribute.attr_type(),
                    lowest_vcn: attribute.lowest_vcn(),
                    segment_reference: reference,
                    id: attribute.id(),
                    name: attribute.name().to_string(),
                });
            }
        }
        entries.sort_by(|a, b| {
            (a.attr_type, a.name.as_str(), a.lowest_vcn)
                .cmp(&(b.attr_type, b.name.as_str(), b.lowest_vcn))
        });

        let mut list = ResidentAttributeRecord::new(AttributeType::AttributeList, "");
        list.value = write_attribute_list(&entries)?;
        let record = AttributeRecord::Resident(list);

        let base = &mut self.segments[0];
        // free space as if the old list were already gone, so a capacity
        // error leaves it in place
        let reclaimed = base
            .find_attribute(AttributeType::AttributeList, "")
            .map_or(0, |old| old.record_length());
        if record.record_length() > base.bytes_free(segment_length, minor_ntfs_version) + reclaimed
        {
            return Err(NtfsError::CapacityExhausted(format!(
                "base segment cannot hold the {} byte attribute list",
                record.record_length()
            )));
        }
        base.remove_attribute(AttributeType::AttributeList, "");
        base.insert_attribute(record);
        Ok(())
    }

    fn slice_attributes(
        &mut self,
        attributes: &[AttributeRecord],
        segment_length: usize,
        minor_ntfs_version: u8,
    ) -> Result<()> {
        let capacity = empty_segment_capacity(segment_length, minor_ntfs_version);

        // work on copies so a capacity error leaves the record untouched
        let mut spare: VecDeque<FileRecordSegment> = self.segments[1..].iter().cloned().collect();
        let mut base = self.segments[0].clone();
        base.clear_attributes();
        let base_flags = base.flags;
        let base_reference = base.reference();

        // StandardInformation and FileName always live in the base segment
        let mut others = Vec::new();
        for attribute in attributes {
            match attribute.attr_type() {
                AttributeType::StandardInformation | AttributeType::FileName => {
                    if attribute.record_length()
                        > base.bytes_free(segment_length, minor_ntfs_version)
                    {
                        return Err(NtfsError::CapacityExhausted(format!(
                            "base segment cannot hold the mandatory {:?} attribute",
                            attribute.attr_type()
                        )));
                    }
                    base.insert_attribute(attribute.clone());
                }
                _ => others.push(attribute),
            }
        }

        let mut extensions: Vec<FileRecordSegment> = Vec::new();
        let mut current: Option<usize> = None;
        for attribute in others {
            let record_length = attribute.record_length();
            let fits_current = current.is_some_and(|i| {
                record_length <= extensions[i].bytes_free(segment_length, minor_ntfs_version)
            });
            if fits_current {
                extensions[current.unwrap()].insert_attribute(attribute.clone());
            } else if record_length <= capacity {
                let index =
                    open_extension(&mut spare, &mut extensions, base_flags, base_reference);
                extensions[index].insert_attribute(attribute.clone());
                current = Some(index);
            } else if let AttributeRecord::NonResident(record) = attribute {
                current = Some(slice_non_resident(
                    record,
                    &mut extensions,
                    &mut spare,
                    current,
                    segment_length,
                    minor_ntfs_version,
                    base_flags,
                    base_reference,
                )?);
            } else {
                return Err(NtfsError::CapacityExhausted(format!(
                    "resident attribute of {} bytes cannot fit an empty segment",
                    record_length
                )));
            }
        }

        self.segments = Vec::with_capacity(1 + extensions.len());
        self.segments.push(base);
        self.segments.extend(extensions);
        Ok(())
    }

    /// Human-readable summary table.
    pub fn describe(&mut self) -> Result<String> {
        self.ensure_attributes()?;
        let mut out = String::new();

        let mut header = Table::new();
        header.add_row(row!["File Record"]);
        header.add_row(row![b -> "Base Segment", self.base_segment().segment_number]);
        header.add_row(row![b -> "Segments", self.segments.len()]);
        header.add_row(row![b -> "Sequence", self.base_segment().sequence_number]);
        header.add_row(row![b -> "Flags", record_flags_to_string(self.base_segment().flags)]);
        header.add_row(row![b -> "Links", self.base_segment().hard_link_count]);
        out.push_str(&header.to_string());
        out.push('\n');

        let mut table = Table::new();
        table.add_row(row!["Attribute", "Name", "Status", "Size"]);
        for attribute in self.attributes.as_ref().unwrap() {
            let (status, size) = match attribute {
                AttributeRecord::Resident(r) => ("Resident", r.value.len() as u64),
                AttributeRecord::NonResident(r) => ("Non-resident", r.real_size),
            };
            table.add_row(row![
                format!(
                    "{:?} (0x{:X}-#{})",
                    attribute.attr_type(),
                    attribute.attr_type() as u32,
                    attribute.id()
                ),
                if attribute.name().is_empty() { "N/A" } else { attribute.name() },
                status,
                size
            ]);
        }
        out.push_str(&table.to_string());
        Ok(out)
    }

    /// Serialize to JSON (uses `serde`).
    pub fn to_json(&mut self) -> Result<Value> {
        self.ensure_attributes()?;
        Ok(json!({
            "segments": &self.segments,
            "attributes": self.attributes.as_ref().unwrap(),
        }))
    }
}

fn empty_segment_capacity(segment_length: usize, minor_ntfs_version: u8) -> usize {
    segment_length
        - FileRecordSegment::first_attribute_offset(segment_length, minor_ntfs_version)
        - END_MARKER_LENGTH
}

fn open_extension(
    spare: &mut VecDeque<FileRecordSegment>,
    extensions: &mut Vec<FileRecordSegment>,
    flags: u16,
    base_reference: SegmentReference,
) -> usize {
    let mut segment = spare
        .pop_front()
        .unwrap_or_else(|| FileRecordSegment::new(UNASSIGNED_SEGMENT, 0));
    segment.clear_attributes();
    segment.flags = flags;
    segment.base_segment_reference = base_reference;
    extensions.push(segment);
    extensions.len() - 1
}

/// Assemble the logical attribute list of a multi-segment record.
///
/// Resident attributes are cloned through; non-resident fragments sharing
/// (type, name) are merged into one record after a defensive sort, since some
/// driver versions scatter fragments out of order across segments.
pub fn assemble_attributes(segments: &[FileRecordSegment]) -> Result<Vec<AttributeRecord>> {
    let mut result: Vec<AttributeRecord> = Vec::new();
    let mut fragments: Vec<&NonResidentAttributeRecord> = Vec::new();
    for segment in segments {
        for attribute in segment.attributes() {
            match attribute {
                AttributeRecord::Resident(r) => {
                    if r.attr_type != AttributeType::AttributeList {
                        result.push(attribute.clone());
                    }
                }
                AttributeRecord::NonResident(fragment) => {
                    if fragment.attr_type != AttributeType::AttributeList {
                        fragments.push(fragment);
                    }
                }
            }
        }
    }
    fragments.sort_by(|a, b| {
        (a.attr_type, a.name.as_str(), a.lowest_vcn)
            .cmp(&(b.attr_type, b.name.as_str(), b.lowest_vcn))
    });

    let mut assembled: Option<NonResidentAttributeRecord> = None;
    for fragment in fragments {
        match assembled.as_mut() {
            Some(current)
                if current.attr_type == fragment.attr_type
                    && current.name == fragment.name =>
            {
                if fragment.lowest_vcn != current.highest_vcn + 1 {
                    return Err(NtfsError::corrupt(
                        0,
                        format!(
                            "attribute fragments must be contiguous and ordered: \
                             {:?} '{}' fragment starts at VCN {}, expected {}",
                            fragment.attr_type,
                            fragment.name,
                            fragment.lowest_vcn,
                            current.highest_vcn + 1
                        ),
                    ));
                }
                append_fragment_runs(current, fragment);
                current.highest_vcn = fragment.highest_vcn;
            }
            _ => {
                if let Some(done) = assembled.take() {
                    result.push(AttributeRecord::NonResident(done));
                }
                if fragment.lowest_vcn != 0 {
                    return Err(NtfsError::corrupt(
                        0,
                        format!(
                            "first fragment of {:?} '{}' starts at VCN {}, expected 0",
                            fragment.attr_type, fragment.name, fragment.lowest_vcn
                        ),
                    ));
                }
                assembled = Some(fragment.clone());
            }
        }
    }
    if let Some(done) = assembled.take() {
        result.push(AttributeRecord::NonResident(done));
    }

    result.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(result)
}

/// Append a fragment's runs to the record assembled so far, converting the
/// fragment's leading extent from an absolute LCN back into an offset
/// relative to the assembled sequence's last run.
fn append_fragment_runs(
    current: &mut NonResidentAttributeRecord,
    fragment: &NonResidentAttributeRecord,
) {
    let previous_lcn = current.run_list.last_run_start_lcn().unwrap_or(0);
    let mut runs = fragment.run_list.runs.clone();
    if let Some(first) = runs.iter_mut().find(|r| !r.is_sparse) {
        first.run_offset -= previous_lcn;
    }
    current.run_list.runs.extend(runs);
}

/// Greedily count how many whole runs, starting at `start_run`, fit a
/// fragment record of `available` bytes. The first physical run of a slice is
/// re-encoded with its absolute LCN, which may need a wider offset field.
fn fit_max_number_of_runs(
    record: &NonResidentAttributeRecord,
    run_start_lcns: &[i64],
    start_run: usize,
    available: usize,
) -> usize {
    let mapping_pairs_offset = record.mapping_pairs_offset();
    let mut bytes = 0usize;
    let mut count = 0usize;
    let mut leading_extent = true;
    for (index, run) in record.run_list.runs[start_run..].iter().enumerate() {
        let encoded = if leading_extent && !run.is_sparse {
            leading_extent = false;
            1 + var_long_size(run.run_length) + var_long_size(run_start_lcns[start_run + index])
        } else {
            run.record_length()
        };
        // +1 for the mapping pairs terminator
        if align8(mapping_pairs_offset + bytes + encoded + 1) > available {
            break;
        }
        bytes += encoded;
        count += 1;
    }
    count
}

#[allow(clippy::too_many_arguments)]
fn slice_non_resident(
    record: &NonResidentAttributeRecord,
    extensions: &mut Vec<FileRecordSegment>,
    spare: &mut VecDeque<FileRecordSegment>,
    mut current: Option<usize>,
    segment_length: usize,
    minor_ntfs_version: u8,
    base_flags: u16,
    base_reference: SegmentReference,
) -> Result<usize> {
    let run_start_lcns = record.run_list.run_start_lcns();
    let runs = &record.run_list.runs;
    let mut run_index = 0usize;
    let mut vcn = record.lowest_vcn;
    let mut slice_count = 0usize;

    while run_index < runs.len() {
        let index = match current {
            Some(index) => index,
            None => open_extension(spare, extensions, base_flags, base_reference),
        };
        current = Some(index);

        let available = extensions[index].bytes_free(segment_length, minor_ntfs_version);
        let fit = fit_max_number_of_runs(record, &run_start_lcns, run_index, available);
        if fit == 0 {
            if extensions[index].attributes().is_empty() {
                return Err(NtfsError::CapacityExhausted(format!(
                    "run {} of {:?} '{}' cannot fit an empty segment",
                    run_index,
                    record.attr_type,
                    record.name
                )));
            }
            current = Some(open_extension(spare, extensions, base_flags, base_reference));
            continue;
        }

        let mut slice_runs = runs[run_index..run_index + fit].to_vec();
        for (offset, run) in slice_runs.iter_mut().enumerate() {
            if !run.is_sparse {
                // leading extent of the fragment carries an absolute LCN
                run.run_offset = run_start_lcns[run_index + offset];
                break;
            }
        }
        let clusters: i64 = slice_runs.iter().map(|r| r.run_length).sum();
        let first_slice = slice_count == 0;
        let fragment = NonResidentAttributeRecord {
            attr_type: record.attr_type,
            name: record.name.clone(),
            flags: record.flags,
            id: 0, // assigned by the segment on insert
            lowest_vcn: vcn,
            highest_vcn: vcn + clusters - 1,
            compression_unit: record.compression_unit,
            allocated_size: if first_slice { record.allocated_size } else { 0 },
            real_size: if first_slice { record.real_size } else { 0 },
            initialized_size: if first_slice { record.initialized_size } else { 0 },
            run_list: DataRunSequence { runs: slice_runs },
        };
        extensions[index].insert_attribute(AttributeRecord::NonResident(fragment));

        vcn += clusters;
        run_index += fit;
        slice_count += 1;
    }
    debug!(
        "Sliced {:?} '{}' into {} fragments.",
        record.attr_type, record.name, slice_count
    );
    Ok(current.unwrap())
}

/// Decode MFT record flags.
fn record_flags_to_string(flags: u16) -> String {
    let mut v = Vec::new();
    if flags & 0x0001 != 0 {
        v.push("Allocated")
    }
    if flags & 0x0002 != 0 {
        v.push("Directory")
    }
    if flags & 0x0004 != 0 {
        v.push("System")
    }
    if flags & 0x0008 != 0 {
        v.push("Bad")
    }
    if v.is_empty() { "None".into() } else { v.join(" | ") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::datetime_to_filetime;
    use crate::runs::DataRun;
    use chrono::{TimeZone, Utc};

    const SEGMENT_LENGTH: usize = 1024;
    const V31: u8 = 1;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn standard_information_record() -> AttributeRecord {
        let info = StandardInformation {
            created: Utc.timestamp_opt(1_600_000_000, 0).single().unwrap(),
            modified: Utc.timestamp_opt(1_600_000_001, 0).single().unwrap(),
            mft_modified: Utc.timestamp_opt(1_600_000_002, 0).single().unwrap(),
            accessed: Utc.timestamp_opt(1_600_000_003, 0).single().unwrap(),
            file_attributes: 0x20,
            maximum_versions: 0,
            version_number: 0,
            class_id: 0,
            owner_id: 0,
            security_id: 0x100,
            quota_charged: 0,
            usn: 0,
        };
        let mut record =
            ResidentAttributeRecord::new(AttributeType::StandardInformation, "");
        record.value = info.to_bytes().unwrap();
        AttributeRecord::Resident(record)
    }

    fn file_name_record(name: &str) -> AttributeRecord {
        let attr = FileNameAttr {
            parent_reference: SegmentReference::new(5, 1),
            created: Utc.timestamp_opt(1_650_000_000, 0).single().unwrap(),
            modified: Utc.timestamp_opt(1_650_000_000, 0).single().unwrap(),
            mft_modified: Utc.timestamp_opt(1_650_000_000, 0).single().unwrap(),
            accessed: Utc.timestamp_opt(1_650_000_000, 0).single().unwrap(),
            allocated_size: 0,
            real_size: 0,
            flags: 0x20,
            reparse_value: 0,
            namespace: 3,
            name: name.to_string(),
        };
        let mut record = ResidentAttributeRecord::new(AttributeType::FileName, "");
        record.value = attr.to_bytes().unwrap();
        AttributeRecord::Resident(record)
    }

    fn data_fragment(lowest_vcn: i64, runs: Vec<DataRun>, sizes: Option<u64>) -> AttributeRecord {
        let total: i64 = runs.iter().map(|r| r.run_length).sum();
        let mut record = NonResidentAttributeRecord::new(AttributeType::Data, "");
        record.lowest_vcn = lowest_vcn;
        record.highest_vcn = lowest_vcn + total - 1;
        record.run_list = DataRunSequence { runs };
        if let Some(real_size) = sizes {
            record.allocated_size = real_size.next_multiple_of(4096);
            record.real_size = real_size;
            record.initialized_size = real_size;
        }
        AttributeRecord::NonResident(record)
    }

    fn two_segment_record(extension_lowest_vcn: i64) -> FileRecord {
        let mut base = FileRecordSegment::new(30, 1);
        base.set_in_use(true);
        base.insert_attribute(standard_information_record());
        base.insert_attribute(data_fragment(
            0,
            vec![DataRun::new(10, 1000)],
            Some(15 * 4096),
        ));

        let mut extension = FileRecordSegment::new(41, 1);
        extension.base_segment_reference = base.reference();
        extension.flags = base.flags;
        extension.insert_attribute(data_fragment(
            extension_lowest_vcn,
            vec![DataRun::new(5, 2000)],
            None,
        ));

        FileRecord::new(vec![base, extension]).unwrap()
    }

    #[test]
    fn single_segment_attributes_are_the_immediate_list() {
        let mut segment = FileRecordSegment::new(7, 1);
        segment.insert_attribute(standard_information_record());
        segment.insert_attribute(file_name_record("a.txt"));
        let mut record = FileRecord::new(vec![segment.clone()]).unwrap();
        assert_eq!(record.attributes().unwrap(), segment.attributes());
        assert_eq!(record.primary_name().unwrap().unwrap(), "a.txt");
    }

    #[test]
    fn assembly_merges_contiguous_fragments() {
        let mut record = two_segment_record(10);
        let attributes = record.attributes().unwrap().to_vec();
        // StandardInformation + one merged Data attribute
        assert_eq!(attributes.len(), 2);
        let AttributeRecord::NonResident(data) = &attributes[1] else {
            panic!("expected the merged non-resident attribute");
        };
        assert_eq!(data.lowest_vcn, 0);
        assert_eq!(data.highest_vcn, 14);
        assert_eq!(data.real_size, 15 * 4096);
        // 2000 absolute became +1000 relative to the first run
        assert_eq!(
            data.run_list.runs,
            vec![DataRun::new(10, 1000), DataRun::new(5, 1000)]
        );
        assert_eq!(data.run_list.run_start_lcns(), vec![1000, 2000]);
    }

    #[test]
    fn assembly_rejects_vcn_gap() {
        let mut record = two_segment_record(11); // gap: VCN 10 missing
        let err = record.attributes().unwrap_err();
        assert!(matches!(err, NtfsError::CorruptStructure { .. }));
    }

    #[test]
    fn assembly_rejects_overlap() {
        let mut record = two_segment_record(9);
        assert!(record.attributes().is_err());
    }

    #[test]
    fn assembly_rejects_missing_first_fragment() {
        let mut base = FileRecordSegment::new(30, 1);
        base.insert_attribute(standard_information_record());
        let mut extension = FileRecordSegment::new(41, 1);
        extension.base_segment_reference = base.reference();
        extension.insert_attribute(data_fragment(10, vec![DataRun::new(5, 2000)], None));
        let mut record = FileRecord::new(vec![base, extension]).unwrap();
        assert!(record.attributes().is_err());
    }

    #[test]
    fn assembly_sorts_out_of_order_fragments() {
        // tail fragment stored in the base segment, head in the extension
        let mut base = FileRecordSegment::new(30, 1);
        base.insert_attribute(standard_information_record());
        base.insert_attribute(data_fragment(10, vec![DataRun::new(5, 2000)], None));
        let mut extension = FileRecordSegment::new(41, 1);
        extension.base_segment_reference = base.reference();
        extension.insert_attribute(data_fragment(
            0,
            vec![DataRun::new(10, 1000)],
            Some(15 * 4096),
        ));
        let mut record = FileRecord::new(vec![base, extension]).unwrap();
        let attributes = record.attributes().unwrap();
        let AttributeRecord::NonResident(data) = &attributes[1] else {
            panic!("expected the merged non-resident attribute");
        };
        assert_eq!(data.highest_vcn, 14);
        assert_eq!(data.run_list.run_start_lcns(), vec![1000, 2000]);
    }

    #[test]
    fn attribute_list_is_skipped_during_assembly() {
        let mut record = two_segment_record(10);
        {
            let base = &mut record.segments[0];
            let mut list = ResidentAttributeRecord::new(AttributeType::AttributeList, "");
            list.value = vec![0u8; 0];
            base.insert_attribute(AttributeRecord::Resident(list));
        }
        record.invalidate_attribute_cache();
        assert!(
            record
                .attributes()
                .unwrap()
                .iter()
                .all(|a| a.attr_type() != AttributeType::AttributeList)
        );

        // a list grown non-resident is skipped too
        let mut record = two_segment_record(10);
        {
            let base = &mut record.segments[0];
            let mut list = NonResidentAttributeRecord::new(AttributeType::AttributeList, "");
            list.highest_vcn = 0;
            list.run_list = DataRunSequence { runs: vec![DataRun::new(1, 3000)] };
            base.insert_attribute(AttributeRecord::NonResident(list));
        }
        record.invalidate_attribute_cache();
        assert!(
            record
                .attributes()
                .unwrap()
                .iter()
                .all(|a| a.attr_type() != AttributeType::AttributeList)
        );
    }

    #[test]
    fn update_segments_collapses_into_base_when_it_fits() {
        let mut record = two_segment_record(10);
        // shrink the data attribute so everything fits one segment
        {
            let attributes = record.attributes_mut().unwrap();
            attributes.retain(|a| a.attr_type() != AttributeType::Data);
            attributes.push(data_fragment(0, vec![DataRun::new(3, 500)], Some(3 * 4096)));
        }
        record.update_segments(SEGMENT_LENGTH, V31).unwrap();
        assert_eq!(record.segments().len(), 1);
        assert!(
            record.base_segment().find_attribute(AttributeType::AttributeList, "").is_none()
        );
        let keys: Vec<_> = record.base_segment().attributes().iter().map(|a| a.sort_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    fn fragmented_runs(count: usize) -> Vec<DataRun> {
        // alternating offsets keep every run unmergeable
        (0..count)
            .map(|i| DataRun::new(1 + (i % 3) as i64, if i == 0 { 5000 } else if i % 2 == 0 { 7 } else { -3 }))
            .collect()
    }

    fn semantic(mut attributes: Vec<AttributeRecord>) -> Vec<AttributeRecord> {
        for attribute in &mut attributes {
            attribute.set_id(0);
        }
        attributes
    }

    #[test]
    fn slice_assemble_inverse_law() {
        init_logging();
        let runs = fragmented_runs(400);
        let total: i64 = runs.iter().map(|r| r.run_length).sum();
        let mut base = FileRecordSegment::new(30, 1);
        base.set_in_use(true);
        let mut record = FileRecord::new(vec![base]).unwrap();
        {
            let attributes = record.attributes_mut().unwrap();
            attributes.push(standard_information_record());
            attributes.push(file_name_record("fragmented.bin"));
            attributes.push(data_fragment(0, runs, Some(total as u64 * 4096 - 77)));
        }
        let original = semantic(record.attributes().unwrap().to_vec());

        record.update_segments(SEGMENT_LENGTH, V31).unwrap();
        assert!(record.segments().len() > 1, "record must have been sliced");

        // every segment still serializes within the segment length
        for bytes in record.to_segment_bytes(SEGMENT_LENGTH, V31).unwrap() {
            assert_eq!(bytes.len(), SEGMENT_LENGTH);
        }

        // mandatory attributes stayed in the base segment
        let base = record.base_segment();
        assert!(base.find_attribute(AttributeType::StandardInformation, "").is_some());
        assert!(base.find_attribute(AttributeType::FileName, "").is_some());
        assert!(base.find_attribute(AttributeType::AttributeList, "").is_some());

        // fragments partition the VCN range without gaps
        let mut expected_vcn = 0i64;
        for segment in &record.segments()[1..] {
            assert_eq!(segment.base_segment_reference, record.segments()[0].reference());
            for attribute in segment.attributes() {
                let AttributeRecord::NonResident(fragment) = attribute else {
                    panic!("extension segments hold only data fragments here");
                };
                assert_eq!(fragment.lowest_vcn, expected_vcn);
                expected_vcn = fragment.highest_vcn + 1;
            }
        }
        assert_eq!(expected_vcn, total);

        // the inverse law: assembling the sliced segments yields the input
        let reassembled = semantic(assemble_attributes(record.segments()).unwrap());
        assert_eq!(reassembled, original);

        // and the cached logical view agrees
        record.invalidate_attribute_cache();
        assert_eq!(semantic(record.attributes().unwrap().to_vec()), original);
    }

    #[test]
    fn sliced_record_survives_serialization() {
        init_logging();
        let runs = fragmented_runs(300);
        let total: i64 = runs.iter().map(|r| r.run_length).sum();
        let mut record = FileRecord::new(vec![FileRecordSegment::new(30, 1)]).unwrap();
        {
            let attributes = record.attributes_mut().unwrap();
            attributes.push(standard_information_record());
            attributes.push(file_name_record("persisted.bin"));
            attributes.push(data_fragment(0, runs, Some(total as u64 * 4096)));
        }
        let original = semantic(record.attributes().unwrap().to_vec());
        record.update_segments(SEGMENT_LENGTH, V31).unwrap();

        let parsed_segments: Vec<FileRecordSegment> = record
            .to_segment_bytes(SEGMENT_LENGTH, V31)
            .unwrap()
            .iter()
            .zip(record.segments())
            .map(|(bytes, segment)| {
                FileRecordSegment::from_bytes(bytes, segment.segment_number).unwrap()
            })
            .collect();
        let mut reparsed = FileRecord::new(parsed_segments).unwrap();
        assert_eq!(semantic(reparsed.attributes().unwrap().to_vec()), original);
    }

    #[test]
    fn attribute_list_points_at_every_fragment() {
        let runs = fragmented_runs(300);
        let total: i64 = runs.iter().map(|r| r.run_length).sum();
        let mut record = FileRecord::new(vec![FileRecordSegment::new(30, 1)]).unwrap();
        {
            let attributes = record.attributes_mut().unwrap();
            attributes.push(standard_information_record());
            attributes.push(file_name_record("listed.bin"));
            attributes.push(data_fragment(0, runs, Some(total as u64 * 4096)));
        }
        record.update_segments(SEGMENT_LENGTH, V31).unwrap();

        // the MFT layer assigns real numbers to fresh segments, then refreshes
        // the attribute list so its references stay valid
        for (index, segment) in record.segments_mut().iter_mut().enumerate() {
            if segment.segment_number == UNASSIGNED_SEGMENT {
                segment.segment_number = 100 + index as i64;
            }
        }
        record.rebuild_attribute_list(SEGMENT_LENGTH, V31).unwrap();

        let Some(AttributeRecord::Resident(list)) = record
            .base_segment()
            .find_attribute(AttributeType::AttributeList, "")
        else {
            panic!("base segment must carry $ATTRIBUTE_LIST");
        };
        let entries = crate::attribute::read_attribute_list(&list.value).unwrap();

        let expected: usize = record
            .segments()
            .iter()
            .map(|s| {
                s.attributes()
                    .iter()
                    .filter(|a| a.attr_type() != AttributeType::AttributeList)
                    .count()
            })
            .sum();
        assert_eq!(entries.len(), expected);

        // data entries are ordered by lowest VCN and reference real fragments
        let data_entries: Vec<_> = entries
            .iter()
            .filter(|e| e.attr_type == AttributeType::Data)
            .collect();
        assert!(data_entries.windows(2).all(|w| w[0].lowest_vcn < w[1].lowest_vcn));
        for entry in data_entries {
            let segment = record
                .segments()
                .iter()
                .find(|s| s.segment_number == entry.segment_reference.segment_number)
                .expect("entry references a segment of this record");
            assert!(segment.attributes().iter().any(|a| {
                a.attr_type() == AttributeType::Data && a.lowest_vcn() == entry.lowest_vcn
            }));
        }
    }

    #[test]
    fn oversized_resident_attribute_is_a_capacity_error() {
        let mut record = FileRecord::new(vec![FileRecordSegment::new(30, 1)]).unwrap();
        {
            let attributes = record.attributes_mut().unwrap();
            attributes.push(standard_information_record());
            let mut huge = ResidentAttributeRecord::new(AttributeType::SecurityDescriptor, "");
            huge.value = vec![0u8; 2 * SEGMENT_LENGTH];
            attributes.push(AttributeRecord::Resident(huge));
        }
        assert!(matches!(
            record.update_segments(SEGMENT_LENGTH, V31),
            Err(NtfsError::CapacityExhausted(_))
        ));
    }

    #[test]
    fn extension_segments_are_reused_before_new_ones() {
        let mut record = two_segment_record(10);
        {
            let attributes = record.attributes_mut().unwrap();
            attributes.push(file_name_record("reuse.bin"));
            // grow the data attribute so slicing is required again
            for attribute in attributes.iter_mut() {
                if let AttributeRecord::NonResident(data) = attribute {
                    let extra = fragmented_runs(300);
                    let added: i64 = extra.iter().map(|r| r.run_length).sum();
                    // keep the leading extent absolute and append relative runs
                    data.run_list.runs.extend(extra.into_iter().map(|mut r| {
                        r.run_offset = if r.run_offset == 5000 { 7 } else { r.run_offset };
                        r
                    }));
                    data.highest_vcn += added;
                }
            }
        }
        record.update_segments(SEGMENT_LENGTH, V31).unwrap();
        // the pre-existing extension segment 41 was reused first
        assert_eq!(record.segments()[1].segment_number, 41);
        // freshly appended segments carry the unassigned marker
        for segment in &record.segments()[2..] {
            assert_eq!(segment.segment_number, UNASSIGNED_SEGMENT);
        }
    }

    #[test]
    fn filetime_survives_standard_information_round_trip() {
        let mut record = FileRecord::new(vec![FileRecordSegment::new(30, 1)]).unwrap();
        record.attributes_mut().unwrap().push(standard_information_record());
        let info = record.standard_information().unwrap().unwrap();
        assert_eq!(
            datetime_to_filetime(&info.created),
            datetime_to_filetime(&Utc.timestamp_opt(1_600_000_000, 0).single().unwrap())
        );
    }
}
