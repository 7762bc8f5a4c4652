// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! Attribute records: the common header, the resident and non-resident forms,
//! and the typed views layered over well-known resident value layouts.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{NtfsError, Result};
use crate::runs::DataRunSequence;
use crate::segment::SegmentReference;

pub const COMMON_HEADER_LENGTH: usize = 0x10;
pub const RESIDENT_HEADER_LENGTH: usize = 0x18;
pub const NON_RESIDENT_HEADER_LENGTH: usize = 0x40;

/// Attribute records and their value offsets are padded to 8 bytes on disk.
pub(crate) fn align8(length: usize) -> usize {
    (length + 7) & !7
}

#[repr(u32)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    PropertySet = 0xF0,
    LoggedUtilityStream = 0x100,
}

impl AttributeType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use AttributeType::*;
        Some(match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            _ => return None,
        })
    }

    /// Types whose value never fits the resident form.
    pub fn is_always_non_resident(self) -> bool {
        matches!(self, AttributeType::IndexAllocation)
    }
}

fn read_utf16(raw: &[u8]) -> Result<String> {
    String::from_utf16(
        &raw.chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect::<Vec<_>>(),
    )
    .map_err(|_| NtfsError::corrupt(0, "invalid UTF-16 string"))
}

fn utf16_bytes(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn utf16_length(name: &str) -> Result<u8> {
    let chars = name.encode_utf16().count();
    u8::try_from(chars).map_err(|_| {
        NtfsError::InvalidArgument(format!("name of {} UTF-16 units exceeds 255", chars))
    })
}

/// Attribute whose value is stored inline in the file record segment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResidentAttributeRecord {
    pub attr_type: AttributeType,
    pub name: String,
    pub flags: u16,
    pub id: u16,
    pub resident_flags: u8, // 1 = indexed ($I30)
    pub value: Vec<u8>,
}

impl ResidentAttributeRecord {
    pub fn new(attr_type: AttributeType, name: &str) -> Self {
        Self {
            attr_type,
            name: name.to_string(),
            flags: 0,
            id: 0,
            resident_flags: 0,
            value: Vec::new(),
        }
    }

    fn value_offset(&self) -> usize {
        align8(RESIDENT_HEADER_LENGTH + utf16_bytes(&self.name).len())
    }

    pub fn record_length(&self) -> usize {
        align8(self.value_offset() + self.value.len())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let name_bytes = utf16_bytes(&self.name);
        let name_length = utf16_length(&self.name)?;
        let value_offset = self.value_offset();
        let record_length = self.record_length();

        let mut out = Vec::with_capacity(record_length);
        out.write_u32::<LittleEndian>(self.attr_type as u32)?;
        out.write_u32::<LittleEndian>(record_length as u32)?;
        out.write_u8(0)?; // resident form
        out.write_u8(name_length)?;
        out.write_u16::<LittleEndian>(RESIDENT_HEADER_LENGTH as u16)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(self.value.len() as u32)?;
        out.write_u16::<LittleEndian>(value_offset as u16)?;
        out.write_u8(self.resident_flags)?;
        out.write_u8(0)?;
        out.extend_from_slice(&name_bytes);
        out.resize(value_offset, 0);
        out.extend_from_slice(&self.value);
        out.resize(record_length, 0);
        Ok(out)
    }
}

/// Attribute whose value lives in clusters addressed by a run list. May be
/// one fragment of a larger attribute, in which case `lowest_vcn > 0`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NonResidentAttributeRecord {
    pub attr_type: AttributeType,
    pub name: String,
    pub flags: u16,
    pub id: u16,
    pub lowest_vcn: i64,
    pub highest_vcn: i64,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
    pub run_list: DataRunSequence,
}

impl NonResidentAttributeRecord {
    pub fn new(attr_type: AttributeType, name: &str) -> Self {
        Self {
            attr_type,
            name: name.to_string(),
            flags: 0,
            id: 0,
            lowest_vcn: 0,
            highest_vcn: -1,
            compression_unit: 0,
            allocated_size: 0,
            real_size: 0,
            initialized_size: 0,
            run_list: DataRunSequence::new(),
        }
    }

    /// The run list must cover the declared VCN range exactly.
    pub fn check_vcn_coverage(&self) -> Result<()> {
        let declared = self.highest_vcn - self.lowest_vcn + 1;
        let covered = self.run_list.total_clusters();
        if declared != covered {
            return Err(NtfsError::corrupt(
                0,
                format!(
                    "run list covers {} clusters but VCN range [{}..{}] declares {}",
                    covered, self.lowest_vcn, self.highest_vcn, declared
                ),
            ));
        }
        Ok(())
    }

    pub fn mapping_pairs_offset(&self) -> usize {
        align8(NON_RESIDENT_HEADER_LENGTH + utf16_bytes(&self.name).len())
    }

    /// Minimal record length: the mapping pairs rounded up to 8 bytes. The
    /// on-disk length of a parsed record may be larger (driver padding).
    pub fn record_length(&self) -> usize {
        align8(self.mapping_pairs_offset() + self.run_list.record_length())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.check_vcn_coverage()?;
        let name_bytes = utf16_bytes(&self.name);
        let name_length = utf16_length(&self.name)?;
        let mapping_pairs_offset = self.mapping_pairs_offset();
        let record_length = self.record_length();

        let mut out = Vec::with_capacity(record_length);
        out.write_u32::<LittleEndian>(self.attr_type as u32)?;
        out.write_u32::<LittleEndian>(record_length as u32)?;
        out.write_u8(1)?; // non-resident form
        out.write_u8(name_length)?;
        out.write_u16::<LittleEndian>(NON_RESIDENT_HEADER_LENGTH as u16)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.id)?;
        out.write_i64::<LittleEndian>(self.lowest_vcn)?;
        out.write_i64::<LittleEndian>(self.highest_vcn)?;
        out.write_u16::<LittleEndian>(mapping_pairs_offset as u16)?;
        out.write_u16::<LittleEndian>(self.compression_unit)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(self.allocated_size)?;
        out.write_u64::<LittleEndian>(self.real_size)?;
        out.write_u64::<LittleEndian>(self.initialized_size)?;
        out.extend_from_slice(&name_bytes);
        out.resize(mapping_pairs_offset, 0);
        out.extend_from_slice(&self.run_list.to_bytes());
        out.resize(record_length, 0);
        Ok(out)
    }
}

/// One attribute record, resident or non-resident.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AttributeRecord {
    Resident(ResidentAttributeRecord),
    NonResident(NonResidentAttributeRecord),
}

impl AttributeRecord {
    /// Factory used when adding a fresh attribute to a segment: well-known
    /// non-resident-only types start non-resident, everything else starts
    /// resident and is converted by the caller if it outgrows the segment.
    pub fn create(attr_type: AttributeType, name: &str) -> Self {
        if attr_type.is_always_non_resident() {
            AttributeRecord::NonResident(NonResidentAttributeRecord::new(attr_type, name))
        } else {
            AttributeRecord::Resident(ResidentAttributeRecord::new(attr_type, name))
        }
    }

    /// Parse one record at `buf[offset]`. Returns the record and its length
    /// on disk; callers must advance by the on-disk value, which may exceed
    /// the recomputed [`AttributeRecord::record_length`].
    pub fn from_bytes(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        if offset + COMMON_HEADER_LENGTH > buf.len() {
            return Err(NtfsError::corrupt(offset, "attribute header outside buffer"));
        }
        let mut c = Cursor::new(&buf[offset..]);
        let type_num = c.read_u32::<LittleEndian>()?;
        let record_length_on_disk = c.read_u32::<LittleEndian>()? as usize;
        let form_code = c.read_u8()?;
        let name_length = c.read_u8()? as usize;
        let name_offset = c.read_u16::<LittleEndian>()? as usize;
        let flags = c.read_u16::<LittleEndian>()?;
        let id = c.read_u16::<LittleEndian>()?;

        let attr_type = AttributeType::from_u32(type_num).ok_or_else(|| {
            NtfsError::corrupt(offset, format!("unknown attribute type 0x{:X}", type_num))
        })?;
        if record_length_on_disk < COMMON_HEADER_LENGTH || record_length_on_disk % 8 != 0 {
            return Err(NtfsError::corrupt(
                offset,
                format!("bad attribute record length {}", record_length_on_disk),
            ));
        }
        if offset + record_length_on_disk > buf.len() {
            return Err(NtfsError::corrupt(
                offset,
                "attribute record overruns buffer",
            ));
        }
        let record = &buf[offset..offset + record_length_on_disk];

        let name = if name_length > 0 {
            if name_offset + name_length * 2 > record.len() {
                return Err(NtfsError::corrupt(offset, "attribute name outside record"));
            }
            read_utf16(&record[name_offset..name_offset + name_length * 2])?
        } else {
            String::new()
        };

        let parsed = if form_code == 0 {
            if record.len() < RESIDENT_HEADER_LENGTH {
                return Err(NtfsError::corrupt(offset, "resident header truncated"));
            }
            let mut c = Cursor::new(&record[COMMON_HEADER_LENGTH..]);
            let value_length = c.read_u32::<LittleEndian>()? as usize;
            let value_offset = c.read_u16::<LittleEndian>()? as usize;
            let resident_flags = c.read_u8()?;
            if value_offset % 8 != 0 {
                return Err(NtfsError::corrupt(
                    offset,
                    format!("resident data offset 0x{:X} is not 8-byte aligned", value_offset),
                ));
            }
            if value_offset + value_length > record.len() {
                return Err(NtfsError::corrupt(
                    offset,
                    format!(
                        "resident data [0x{:X}..0x{:X}] exceeds the {} byte record",
                        value_offset,
                        value_offset + value_length,
                        record.len()
                    ),
                ));
            }
            AttributeRecord::Resident(ResidentAttributeRecord {
                attr_type,
                name,
                flags,
                id,
                resident_flags,
                value: record[value_offset..value_offset + value_length].to_vec(),
            })
        } else {
            if record.len() < NON_RESIDENT_HEADER_LENGTH {
                return Err(NtfsError::corrupt(offset, "non-resident header truncated"));
            }
            let mut c = Cursor::new(&record[COMMON_HEADER_LENGTH..]);
            let lowest_vcn = c.read_i64::<LittleEndian>()?;
            let highest_vcn = c.read_i64::<LittleEndian>()?;
            let mapping_pairs_offset = c.read_u16::<LittleEndian>()? as usize;
            let compression_unit = c.read_u16::<LittleEndian>()?;
            c.read_u32::<LittleEndian>()?; // reserved
            let allocated_size = c.read_u64::<LittleEndian>()?;
            let real_size = c.read_u64::<LittleEndian>()?;
            let initialized_size = c.read_u64::<LittleEndian>()?;
            if mapping_pairs_offset < NON_RESIDENT_HEADER_LENGTH
                || mapping_pairs_offset > record.len()
            {
                return Err(NtfsError::corrupt(
                    offset,
                    format!("bad mapping pairs offset 0x{:X}", mapping_pairs_offset),
                ));
            }
            let run_list = DataRunSequence::from_bytes(&record[mapping_pairs_offset..])?;
            let parsed = NonResidentAttributeRecord {
                attr_type,
                name,
                flags,
                id,
                lowest_vcn,
                highest_vcn,
                compression_unit,
                allocated_size,
                real_size,
                initialized_size,
                run_list,
            };
            parsed.check_vcn_coverage().map_err(|e| match e {
                NtfsError::CorruptStructure { reason, .. } => NtfsError::corrupt(offset, reason),
                other => other,
            })?;
            AttributeRecord::NonResident(parsed)
        };
        Ok((parsed, record_length_on_disk))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            AttributeRecord::Resident(r) => r.to_bytes(),
            AttributeRecord::NonResident(r) => r.to_bytes(),
        }
    }

    pub fn attr_type(&self) -> AttributeType {
        match self {
            AttributeRecord::Resident(r) => r.attr_type,
            AttributeRecord::NonResident(r) => r.attr_type,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AttributeRecord::Resident(r) => &r.name,
            AttributeRecord::NonResident(r) => &r.name,
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            AttributeRecord::Resident(r) => r.id,
            AttributeRecord::NonResident(r) => r.id,
        }
    }

    pub fn set_id(&mut self, id: u16) {
        match self {
            AttributeRecord::Resident(r) => r.id = id,
            AttributeRecord::NonResident(r) => r.id = id,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, AttributeRecord::Resident(_))
    }

    /// Minimal serialized length, always a multiple of 8.
    pub fn record_length(&self) -> usize {
        match self {
            AttributeRecord::Resident(r) => r.record_length(),
            AttributeRecord::NonResident(r) => r.record_length(),
        }
    }

    /// Attributes within a segment are ordered by (type, name).
    pub fn sort_key(&self) -> (u32, String) {
        (self.attr_type() as u32, self.name().to_string())
    }

    /// Starting VCN of this record's fragment; 0 for resident records.
    pub fn lowest_vcn(&self) -> i64 {
        match self {
            AttributeRecord::Resident(_) => 0,
            AttributeRecord::NonResident(r) => r.lowest_vcn,
        }
    }
}

/*  FILETIME conversion  */

const EPOCH_DIFFERENCE_SECS: i64 = 11_644_473_600;

/// 100ns ticks since 1601-01-01 to a UTC timestamp. Exact: chrono keeps
/// nanosecond precision.
pub fn filetime_to_datetime(filetime: u64) -> DateTime<Utc> {
    let secs = (filetime / 10_000_000) as i64 - EPOCH_DIFFERENCE_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

pub fn datetime_to_filetime(datetime: &DateTime<Utc>) -> u64 {
    let secs = datetime.timestamp() + EPOCH_DIFFERENCE_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * 10_000_000 + (datetime.timestamp_subsec_nanos() / 100) as u64
}

/*  Typed views over well-known resident value layouts  */

/// $STANDARD_INFORMATION, NTFS 3.x form (0x48 bytes).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StandardInformation {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub mft_modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub file_attributes: u32,
    pub maximum_versions: u32,
    pub version_number: u32,
    pub class_id: u32,
    pub owner_id: u32,
    pub security_id: u32,
    pub quota_charged: u64,
    pub usn: u64,
}

impl StandardInformation {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 0x30 {
            return Err(NtfsError::corrupt(
                raw.len(),
                "$STANDARD_INFORMATION value shorter than 0x30 bytes",
            ));
        }
        let mut c = Cursor::new(raw);
        let created = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let modified = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let mft_modified = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let accessed = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let file_attributes = c.read_u32::<LittleEndian>()?;
        let maximum_versions = c.read_u32::<LittleEndian>()?;
        let version_number = c.read_u32::<LittleEndian>()?;
        let class_id = c.read_u32::<LittleEndian>()?;
        // v3.x tail; absent in the v1.2 0x30-byte form
        let owner_id = if raw.len() >= 0x34 { c.read_u32::<LittleEndian>()? } else { 0 };
        let security_id = if raw.len() >= 0x38 { c.read_u32::<LittleEndian>()? } else { 0 };
        let quota_charged = if raw.len() >= 0x40 { c.read_u64::<LittleEndian>()? } else { 0 };
        let usn = if raw.len() >= 0x48 { c.read_u64::<LittleEndian>()? } else { 0 };
        Ok(Self {
            created,
            modified,
            mft_modified,
            accessed,
            file_attributes,
            maximum_versions,
            version_number,
            class_id,
            owner_id,
            security_id,
            quota_charged,
            usn,
        })
    }

    /// Always emits the 0x48-byte v3.x form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(0x48);
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.created))?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.modified))?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.mft_modified))?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.accessed))?;
        out.write_u32::<LittleEndian>(self.file_attributes)?;
        out.write_u32::<LittleEndian>(self.maximum_versions)?;
        out.write_u32::<LittleEndian>(self.version_number)?;
        out.write_u32::<LittleEndian>(self.class_id)?;
        out.write_u32::<LittleEndian>(self.owner_id)?;
        out.write_u32::<LittleEndian>(self.security_id)?;
        out.write_u64::<LittleEndian>(self.quota_charged)?;
        out.write_u64::<LittleEndian>(self.usn)?;
        Ok(out)
    }
}

/// $FILE_NAME (0x42 bytes + name).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileNameAttr {
    pub parent_reference: SegmentReference,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub mft_modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub reparse_value: u32,
    pub namespace: u8, // 0 POSIX, 1 Win32, 2 DOS, 3 Win32 & DOS
    pub name: String,
}

impl FileNameAttr {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 0x42 {
            return Err(NtfsError::corrupt(
                raw.len(),
                "$FILE_NAME value shorter than 0x42 bytes",
            ));
        }
        let mut c = Cursor::new(raw);
        let parent_reference = SegmentReference::from_u64(c.read_u64::<LittleEndian>()?);
        let created = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let modified = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let mft_modified = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let accessed = filetime_to_datetime(c.read_u64::<LittleEndian>()?);
        let allocated_size = c.read_u64::<LittleEndian>()?;
        let real_size = c.read_u64::<LittleEndian>()?;
        let flags = c.read_u32::<LittleEndian>()?;
        let reparse_value = c.read_u32::<LittleEndian>()?;
        let name_length = c.read_u8()? as usize;
        let namespace = c.read_u8()?;
        if raw.len() < 0x42 + name_length * 2 {
            return Err(NtfsError::corrupt(0x42, "$FILE_NAME name outside value"));
        }
        let name = read_utf16(&raw[0x42..0x42 + name_length * 2])?;
        Ok(Self {
            parent_reference,
            created,
            modified,
            mft_modified,
            accessed,
            allocated_size,
            real_size,
            flags,
            reparse_value,
            namespace,
            name,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let name_bytes = utf16_bytes(&self.name);
        let name_length = utf16_length(&self.name)?;
        let mut out = Vec::with_capacity(0x42 + name_bytes.len());
        out.write_u64::<LittleEndian>(self.parent_reference.to_u64())?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.created))?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.modified))?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.mft_modified))?;
        out.write_u64::<LittleEndian>(datetime_to_filetime(&self.accessed))?;
        out.write_u64::<LittleEndian>(self.allocated_size)?;
        out.write_u64::<LittleEndian>(self.real_size)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(self.reparse_value)?;
        out.write_u8(name_length)?;
        out.write_u8(self.namespace)?;
        out.extend_from_slice(&name_bytes);
        Ok(out)
    }
}

/// $VOLUME_NAME: a bare UTF-16 string.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VolumeName {
    pub name: String,
}

impl VolumeName {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() % 2 != 0 {
            return Err(NtfsError::corrupt(
                raw.len(),
                "$VOLUME_NAME value has odd length",
            ));
        }
        Ok(Self { name: read_utf16(raw)? })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        utf16_bytes(&self.name)
    }
}

/// $VOLUME_INFORMATION (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeInformation {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16, // 0x0001 = dirty
}

impl VolumeInformation {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 12 {
            return Err(NtfsError::corrupt(
                raw.len(),
                "$VOLUME_INFORMATION value shorter than 12 bytes",
            ));
        }
        let mut c = Cursor::new(raw);
        c.read_u64::<LittleEndian>()?; // reserved
        let major_version = c.read_u8()?;
        let minor_version = c.read_u8()?;
        let flags = c.read_u16::<LittleEndian>()?;
        Ok(Self {
            major_version,
            minor_version,
            flags,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(12);
        out.write_u64::<LittleEndian>(0)?;
        out.write_u8(self.major_version)?;
        out.write_u8(self.minor_version)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        Ok(out)
    }
}

/// $INDEX_ROOT: 0x10-byte root header, 0x10-byte index header, raw entries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IndexRoot {
    pub indexed_attribute_type: u32,
    pub collation_rule: u32,
    pub bytes_per_index_record: u32,
    pub clusters_per_index_record: u8,
    pub index_flags: u8, // 0x01 = large index ($INDEX_ALLOCATION present)
    pub entries: Vec<u8>,
}

impl IndexRoot {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 0x20 {
            return Err(NtfsError::corrupt(
                raw.len(),
                "$INDEX_ROOT value shorter than 0x20 bytes",
            ));
        }
        let mut c = Cursor::new(raw);
        let indexed_attribute_type = c.read_u32::<LittleEndian>()?;
        let collation_rule = c.read_u32::<LittleEndian>()?;
        let bytes_per_index_record = c.read_u32::<LittleEndian>()?;
        let clusters_per_index_record = c.read_u8()?;
        c.read_u8()?;
        c.read_u16::<LittleEndian>()?;
        // index header, offsets relative to its own start at 0x10
        let entries_offset = c.read_u32::<LittleEndian>()? as usize;
        let total_length = c.read_u32::<LittleEndian>()? as usize;
        c.read_u32::<LittleEndian>()?; // allocated length
        let index_flags = c.read_u8()?;
        let start = 0x10 + entries_offset;
        let end = 0x10 + total_length;
        if entries_offset < 0x10 || end < start || end > raw.len() {
            return Err(NtfsError::corrupt(0x10, "index header range outside value"));
        }
        Ok(Self {
            indexed_attribute_type,
            collation_rule,
            bytes_per_index_record,
            clusters_per_index_record,
            index_flags,
            entries: raw[start..end].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total_length = 0x10 + self.entries.len();
        let mut out = Vec::with_capacity(0x10 + total_length);
        out.write_u32::<LittleEndian>(self.indexed_attribute_type)?;
        out.write_u32::<LittleEndian>(self.collation_rule)?;
        out.write_u32::<LittleEndian>(self.bytes_per_index_record)?;
        out.write_u8(self.clusters_per_index_record)?;
        out.write_u8(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0x10)?; // entries offset
        out.write_u32::<LittleEndian>(total_length as u32)?;
        out.write_u32::<LittleEndian>(total_length as u32)?;
        out.write_u8(self.index_flags)?;
        out.write_u8(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.extend_from_slice(&self.entries);
        Ok(out)
    }
}

/// One row of $ATTRIBUTE_LIST: where a single attribute fragment lives.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AttributeListEntry {
    pub attr_type: AttributeType,
    pub lowest_vcn: i64,
    pub segment_reference: SegmentReference,
    pub id: u16,
    pub name: String,
}

const ATTRIBUTE_LIST_ENTRY_HEADER_LENGTH: usize = 0x1A;

impl AttributeListEntry {
    pub fn record_length(&self) -> usize {
        align8(ATTRIBUTE_LIST_ENTRY_HEADER_LENGTH + utf16_bytes(&self.name).len())
    }

    pub fn from_bytes(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        if offset + ATTRIBUTE_LIST_ENTRY_HEADER_LENGTH > buf.len() {
            return Err(NtfsError::corrupt(
                offset,
                "attribute list entry outside buffer",
            ));
        }
        let mut c = Cursor::new(&buf[offset..]);
        let type_num = c.read_u32::<LittleEndian>()?;
        let entry_length = c.read_u16::<LittleEndian>()? as usize;
        let name_length = c.read_u8()? as usize;
        let name_offset = c.read_u8()? as usize;
        let lowest_vcn = c.read_i64::<LittleEndian>()?;
        let segment_reference = SegmentReference::from_u64(c.read_u64::<LittleEndian>()?);
        let id = c.read_u16::<LittleEndian>()?;

        let attr_type = AttributeType::from_u32(type_num).ok_or_else(|| {
            NtfsError::corrupt(offset, format!("unknown attribute type 0x{:X}", type_num))
        })?;
        if entry_length < ATTRIBUTE_LIST_ENTRY_HEADER_LENGTH
            || offset + entry_length > buf.len()
        {
            return Err(NtfsError::corrupt(
                offset,
                format!("bad attribute list entry length {}", entry_length),
            ));
        }
        let name = if name_length > 0 {
            if name_offset + name_length * 2 > entry_length {
                return Err(NtfsError::corrupt(offset, "entry name outside entry"));
            }
            read_utf16(&buf[offset + name_offset..offset + name_offset + name_length * 2])?
        } else {
            String::new()
        };
        Ok((
            Self {
                attr_type,
                lowest_vcn,
                segment_reference,
                id,
                name,
            },
            entry_length,
        ))
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let name_bytes = utf16_bytes(&self.name);
        let name_length = utf16_length(&self.name)?;
        let record_length = self.record_length();
        let start = out.len();
        out.write_u32::<LittleEndian>(self.attr_type as u32)?;
        out.write_u16::<LittleEndian>(record_length as u16)?;
        out.write_u8(name_length)?;
        out.write_u8(ATTRIBUTE_LIST_ENTRY_HEADER_LENGTH as u8)?;
        out.write_i64::<LittleEndian>(self.lowest_vcn)?;
        out.write_u64::<LittleEndian>(self.segment_reference.to_u64())?;
        out.write_u16::<LittleEndian>(self.id)?;
        out.extend_from_slice(&name_bytes);
        out.resize(start + record_length, 0);
        Ok(())
    }
}

/// Decode a whole $ATTRIBUTE_LIST value.
pub fn read_attribute_list(value: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + ATTRIBUTE_LIST_ENTRY_HEADER_LENGTH <= value.len() {
        let (entry, consumed) = AttributeListEntry::from_bytes(value, pos)?;
        entries.push(entry);
        pos += consumed;
    }
    Ok(entries)
}

/// Encode an $ATTRIBUTE_LIST value.
pub fn write_attribute_list(entries: &[AttributeListEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        entry.write(&mut out)?;
    }
    Ok(out)
}
