//! One fixed-size MFT file record segment: "FILE" header, sorted attribute
//! records, update-sequence protection.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::attribute::{AttributeRecord, AttributeType, align8};
use crate::error::{NtfsError, Result};
use crate::fixup::{
    apply_update_sequence_fixups, insert_update_sequence_fixups, update_sequence_array_length,
};

pub const FILE_SIGNATURE: [u8; 4] = *b"FILE";
const ATTRIBUTE_END_MARKER: u32 = 0xFFFF_FFFF;
const END_MARKER_LENGTH: usize = 4;

pub const FLAG_IN_USE: u16 = 0x0001;
pub const FLAG_IS_DIRECTORY: u16 = 0x0002;

/// Packed (segment number, sequence number) reference to a file record
/// segment: 48 bits of segment number, 16 bits of sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SegmentReference {
    pub segment_number: i64,
    pub sequence_number: u16,
}

impl SegmentReference {
    pub const NULL: SegmentReference = SegmentReference {
        segment_number: 0,
        sequence_number: 0,
    };

    pub fn new(segment_number: i64, sequence_number: u16) -> Self {
        Self {
            segment_number,
            sequence_number,
        }
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            segment_number: (raw & 0x0000_FFFF_FFFF_FFFF) as i64,
            sequence_number: (raw >> 48) as u16,
        }
    }

    pub fn to_u64(&self) -> u64 {
        ((self.sequence_number as u64) << 48)
            | (self.segment_number as u64 & 0x0000_FFFF_FFFF_FFFF)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

/// A parsed (or under-construction) file record segment.
///
/// `attributes` is kept sorted by (type, name); every insertion goes through
/// the sorted-insert path and allocates the next attribute instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRecordSegment {
    pub segment_number: i64,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub flags: u16,
    pub base_segment_reference: SegmentReference,
    pub next_attribute_id: u16,
    pub update_sequence_number: u16,
    attributes: Vec<AttributeRecord>,
}

impl FileRecordSegment {
    pub fn new(segment_number: i64, sequence_number: u16) -> Self {
        Self {
            segment_number,
            lsn: 0,
            sequence_number,
            hard_link_count: 0,
            flags: 0,
            base_segment_reference: SegmentReference::NULL,
            next_attribute_id: 0,
            update_sequence_number: 1,
            attributes: Vec::new(),
        }
    }

    /// Parse a raw segment buffer. `segment_number` is supplied by the
    /// caller, the way the MFT layer knows which record it read.
    pub fn from_bytes(raw: &[u8], segment_number: i64) -> Result<Self> {
        if raw.len() < 0x30 {
            return Err(NtfsError::corrupt(0, "file record segment too short"));
        }
        if raw[0..4] != FILE_SIGNATURE {
            return Err(NtfsError::corrupt(
                0,
                format!(
                    "record signature is not 'FILE', found: {}",
                    String::from_utf8_lossy(&raw[0..4])
                ),
            ));
        }

        let mut c = Cursor::new(&raw[4..]);
        let usa_offset = c.read_u16::<LittleEndian>()? as usize;
        let usa_count = c.read_u16::<LittleEndian>()? as usize;
        let lsn = c.read_u64::<LittleEndian>()?;
        let sequence_number = c.read_u16::<LittleEndian>()?;
        let hard_link_count = c.read_u16::<LittleEndian>()?;
        let attrs_offset = c.read_u16::<LittleEndian>()? as usize;
        let flags = c.read_u16::<LittleEndian>()?;
        let bytes_in_use = c.read_u32::<LittleEndian>()? as usize;
        let _bytes_allocated = c.read_u32::<LittleEndian>()?;
        let base_segment_reference =
            SegmentReference::from_u64(c.read_u64::<LittleEndian>()?);
        let next_attribute_id = c.read_u16::<LittleEndian>()?;

        if usa_offset + 2 > raw.len() {
            return Err(NtfsError::corrupt(4, "update sequence array outside record"));
        }
        let update_sequence_number =
            u16::from_le_bytes([raw[usa_offset], raw[usa_offset + 1]]);

        // patch the stride-end bytes back in before touching any attribute
        let mut buf = raw.to_vec();
        apply_update_sequence_fixups(&mut buf, usa_offset, usa_count)?;

        if bytes_in_use > buf.len() || attrs_offset > bytes_in_use {
            return Err(NtfsError::corrupt(
                0x18,
                format!("bytes in use {} exceeds the record", bytes_in_use),
            ));
        }

        let mut attributes = Vec::new();
        let mut pos = attrs_offset;
        loop {
            if pos + 4 > bytes_in_use {
                return Err(NtfsError::corrupt(pos, "attribute list is not terminated"));
            }
            let type_num = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            if type_num == ATTRIBUTE_END_MARKER {
                break;
            }
            let (attribute, length_on_disk) =
                AttributeRecord::from_bytes(&buf[..bytes_in_use], pos)?;
            attributes.push(attribute);
            pos += length_on_disk;
        }
        debug!(
            "Parsed segment {}: {} attributes, {} bytes in use.",
            segment_number,
            attributes.len(),
            bytes_in_use
        );

        Ok(Self {
            segment_number,
            lsn,
            sequence_number,
            hard_link_count,
            flags,
            base_segment_reference,
            next_attribute_id,
            update_sequence_number,
            attributes,
        })
    }

    /// Serialize into a `segment_length` buffer with fixups applied.
    pub fn to_bytes(&self, segment_length: usize, minor_ntfs_version: u8) -> Result<Vec<u8>> {
        let usa_offset = Self::update_sequence_array_offset(minor_ntfs_version);
        let usa_count = update_sequence_array_length(segment_length);
        let first_attribute_offset =
            Self::first_attribute_offset(segment_length, minor_ntfs_version);

        let mut buf = vec![0u8; segment_length];
        {
            let mut c = Cursor::new(&mut buf[..]);
            std::io::Write::write_all(&mut c, &FILE_SIGNATURE)?;
            c.write_u16::<LittleEndian>(usa_offset as u16)?;
            c.write_u16::<LittleEndian>(usa_count as u16)?;
            c.write_u64::<LittleEndian>(self.lsn)?;
            c.write_u16::<LittleEndian>(self.sequence_number)?;
            c.write_u16::<LittleEndian>(self.hard_link_count)?;
            c.write_u16::<LittleEndian>(first_attribute_offset as u16)?;
            c.write_u16::<LittleEndian>(self.flags)?;
            c.write_u32::<LittleEndian>(0)?; // bytes in use, patched below
            c.write_u32::<LittleEndian>(segment_length as u32)?;
            c.write_u64::<LittleEndian>(self.base_segment_reference.to_u64())?;
            c.write_u16::<LittleEndian>(self.next_attribute_id)?;
            if minor_ntfs_version >= 1 {
                c.write_u16::<LittleEndian>(0)?; // reserved
                c.write_u32::<LittleEndian>(self.segment_number as u32)?;
            }
        }

        let mut pos = first_attribute_offset;
        for attribute in &self.attributes {
            let bytes = attribute.to_bytes()?;
            if pos + bytes.len() + END_MARKER_LENGTH > segment_length {
                return Err(NtfsError::CapacityExhausted(format!(
                    "attributes of segment {} do not fit {} bytes",
                    self.segment_number, segment_length
                )));
            }
            buf[pos..pos + bytes.len()].copy_from_slice(&bytes);
            pos += bytes.len();
        }
        buf[pos..pos + 4].copy_from_slice(&ATTRIBUTE_END_MARKER.to_le_bytes());
        pos += 4;
        buf[0x18..0x1C].copy_from_slice(&(pos as u32).to_le_bytes());

        insert_update_sequence_fixups(&mut buf, usa_offset, self.update_sequence_number)?;
        Ok(buf)
    }

    fn update_sequence_array_offset(minor_ntfs_version: u8) -> usize {
        if minor_ntfs_version == 0 { 0x2A } else { 0x30 }
    }

    /// Header bytes reserved before the first attribute: the version-specific
    /// fixed header plus the update sequence array, rounded up to 8 bytes.
    pub fn first_attribute_offset(segment_length: usize, minor_ntfs_version: u8) -> usize {
        let usa_end = Self::update_sequence_array_offset(minor_ntfs_version)
            + 2 * update_sequence_array_length(segment_length);
        align8(usa_end)
    }

    /// Free bytes left for attribute records, end marker accounted for.
    pub fn bytes_free(&self, segment_length: usize, minor_ntfs_version: u8) -> usize {
        let used: usize = self.attributes.iter().map(|a| a.record_length()).sum();
        segment_length
            .saturating_sub(Self::first_attribute_offset(segment_length, minor_ntfs_version))
            .saturating_sub(END_MARKER_LENGTH)
            .saturating_sub(used)
    }

    pub fn attributes(&self) -> &[AttributeRecord] {
        &self.attributes
    }

    /// Create a fresh attribute of `attr_type`, allocate the next instance
    /// number and insert it keeping (type, name) order.
    pub fn create_attribute(
        &mut self,
        attr_type: AttributeType,
        name: &str,
    ) -> &mut AttributeRecord {
        let record = AttributeRecord::create(attr_type, name);
        self.insert_attribute(record)
    }

    /// Sorted insert of a prepared record; the instance number is assigned
    /// here, not by the caller.
    pub fn insert_attribute(&mut self, mut record: AttributeRecord) -> &mut AttributeRecord {
        record.set_id(self.next_attribute_id);
        self.next_attribute_id += 1;

        let key = record.sort_key();
        // equal keys (e.g. both $FILE_NAME attributes, or fragments of one
        // attribute) stay in insertion order
        let index = self
            .attributes
            .iter()
            .position(|a| a.sort_key() > key)
            .unwrap_or(self.attributes.len());
        self.attributes.insert(index, record);
        &mut self.attributes[index]
    }

    pub fn remove_attribute(&mut self, attr_type: AttributeType, name: &str) {
        self.attributes
            .retain(|a| !(a.attr_type() == attr_type && a.name() == name));
    }

    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }

    pub fn find_attribute(
        &self,
        attr_type: AttributeType,
        name: &str,
    ) -> Option<&AttributeRecord> {
        self.attributes
            .iter()
            .find(|a| a.attr_type() == attr_type && a.name() == name)
    }

    pub fn is_base(&self) -> bool {
        self.base_segment_reference.is_null()
    }

    pub fn reference(&self) -> SegmentReference {
        SegmentReference::new(self.segment_number, self.sequence_number)
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.flags |= FLAG_IN_USE;
        } else {
            self.flags &= !FLAG_IN_USE;
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_IS_DIRECTORY != 0
    }

    pub fn set_directory(&mut self, directory: bool) {
        if directory {
            self.flags |= FLAG_IS_DIRECTORY;
        } else {
            self.flags &= !FLAG_IS_DIRECTORY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeRecord, ResidentAttributeRecord};
    use crate::runs::DataRun;

    const SEGMENT_LENGTH: usize = 1024;
    const V31: u8 = 1;

    #[test]
    fn segment_reference_packing() {
        let reference = SegmentReference::new(0x1234_5678_9ABC, 0x0102);
        assert_eq!(
            SegmentReference::from_u64(reference.to_u64()),
            reference
        );
        assert!(SegmentReference::NULL.is_null());
        assert!(!reference.is_null());
    }

    #[test]
    fn first_attribute_offset_by_version() {
        // v3.1: 0x30 + 3 entries * 2 = 0x36, rounded to 0x38
        assert_eq!(FileRecordSegment::first_attribute_offset(1024, 1), 0x38);
        // v3.0: 0x2A + 6 = 0x30, already aligned
        assert_eq!(FileRecordSegment::first_attribute_offset(1024, 0), 0x30);
        // 4 KiB record: 0x30 + 9 * 2 = 0x42, rounded to 0x48
        assert_eq!(FileRecordSegment::first_attribute_offset(4096, 1), 0x48);
    }

    fn sample_segment() -> FileRecordSegment {
        let mut segment = FileRecordSegment::new(30, 2);
        segment.set_in_use(true);
        segment.hard_link_count = 1;
        segment.lsn = 0xDEAD_BEEF;

        let mut info = ResidentAttributeRecord::new(AttributeType::StandardInformation, "");
        info.value = vec![0u8; 0x48];
        segment.insert_attribute(AttributeRecord::Resident(info));

        let mut data = ResidentAttributeRecord::new(AttributeType::Data, "");
        data.value = b"hello clusters".to_vec();
        segment.insert_attribute(AttributeRecord::Resident(data));
        segment
    }

    #[test]
    fn serialize_parse_round_trip() {
        let segment = sample_segment();
        let bytes = segment.to_bytes(SEGMENT_LENGTH, V31).unwrap();
        assert_eq!(bytes.len(), SEGMENT_LENGTH);
        assert_eq!(&bytes[0..4], b"FILE");

        let parsed = FileRecordSegment::from_bytes(&bytes, 30).unwrap();
        assert_eq!(parsed.segment_number, 30);
        assert_eq!(parsed.sequence_number, 2);
        assert_eq!(parsed.lsn, 0xDEAD_BEEF);
        assert!(parsed.is_in_use());
        assert!(!parsed.is_directory());
        assert_eq!(parsed.base_segment_reference, SegmentReference::NULL);
        assert_eq!(parsed.attributes(), segment.attributes());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let segment = sample_segment();
        let mut bytes = segment.to_bytes(SEGMENT_LENGTH, V31).unwrap();
        bytes[0] = b'B';
        assert!(matches!(
            FileRecordSegment::from_bytes(&bytes, 30),
            Err(NtfsError::CorruptStructure { offset: 0, .. })
        ));
    }

    #[test]
    fn torn_write_is_rejected() {
        let segment = sample_segment();
        let mut bytes = segment.to_bytes(SEGMENT_LENGTH, V31).unwrap();
        bytes[510] ^= 0x5A; // stride 1 end no longer matches the USN
        assert!(matches!(
            FileRecordSegment::from_bytes(&bytes, 30),
            Err(NtfsError::CorruptStructure { .. })
        ));
    }

    #[test]
    fn attribute_overrun_is_rejected() {
        let segment = sample_segment();
        let mut bytes = segment.to_bytes(SEGMENT_LENGTH, V31).unwrap();
        // inflate the first attribute's record length past bytes-in-use
        bytes[0x38 + 4..0x38 + 8].copy_from_slice(&0x400u32.to_le_bytes());
        assert!(FileRecordSegment::from_bytes(&bytes, 30).is_err());
    }

    #[test]
    fn missing_end_marker_is_rejected() {
        let segment = sample_segment();
        let mut bytes = segment.to_bytes(SEGMENT_LENGTH, V31).unwrap();
        // shrink bytes-in-use so the scan runs out before the marker
        bytes[0x18..0x1C].copy_from_slice(&0x3Au32.to_le_bytes());
        let err = FileRecordSegment::from_bytes(&bytes, 30).unwrap_err();
        assert!(matches!(err, NtfsError::CorruptStructure { .. }));
    }

    #[test]
    fn sorted_insert_invariant() {
        let mut segment = FileRecordSegment::new(5, 1);
        for (attr_type, name) in [
            (AttributeType::Data, "zeta"),
            (AttributeType::FileName, ""),
            (AttributeType::Data, ""),
            (AttributeType::StandardInformation, ""),
            (AttributeType::Data, "alpha"),
            (AttributeType::Bitmap, ""),
            (AttributeType::FileName, ""),
        ] {
            segment.create_attribute(attr_type, name);
        }
        let keys: Vec<_> = segment.attributes().iter().map(|a| a.sort_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        // instances are unique and allocated in creation order
        assert_eq!(segment.next_attribute_id, 7);
        let mut ids: Vec<_> = segment.attributes().iter().map(|a| a.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn bytes_free_accounting() {
        let mut segment = FileRecordSegment::new(7, 1);
        let empty = segment.bytes_free(SEGMENT_LENGTH, V31);
        assert_eq!(empty, SEGMENT_LENGTH - 0x38 - 4);

        let mut data = ResidentAttributeRecord::new(AttributeType::Data, "");
        data.value = vec![1u8; 100];
        let record = AttributeRecord::Resident(data);
        let record_length = record.record_length();
        segment.insert_attribute(record);
        assert_eq!(
            segment.bytes_free(SEGMENT_LENGTH, V31),
            empty - record_length
        );
    }

    #[test]
    fn non_resident_attribute_survives_segment_round_trip() {
        let mut segment = FileRecordSegment::new(12, 1);
        segment.set_in_use(true);
        let mut data = crate::attribute::NonResidentAttributeRecord::new(AttributeType::Data, "");
        data.run_list.runs = vec![DataRun::new(8, 2000), DataRun::new(8, -100)];
        data.lowest_vcn = 0;
        data.highest_vcn = 15;
        data.allocated_size = 16 * 4096;
        data.real_size = 16 * 4096;
        data.initialized_size = 16 * 4096;
        segment.insert_attribute(AttributeRecord::NonResident(data));

        let bytes = segment.to_bytes(SEGMENT_LENGTH, V31).unwrap();
        let parsed = FileRecordSegment::from_bytes(&bytes, 12).unwrap();
        assert_eq!(parsed.attributes(), segment.attributes());
    }
}
