//! NTFS partition boot sector: the 512-byte structure carrying the geometry
//! constants (cluster size, file record segment length, MFT location) that
//! every other structure in the crate is sized against.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{Cursor, Read, Write};

use crate::error::{NtfsError, Result};

pub const BOOT_SECTOR_LENGTH: usize = 512;
pub const END_OF_SECTOR_MARKER: u16 = 0xAA55;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BootSector {
    /* -- 0x00-0x0A ------------------------------------------ */
    pub jump_instruction: [u8; 3], // x86 JMP + NOP
    pub oem_id: [u8; 8],           // "NTFS    "

    /* -- BIOS Parameter Block (BPB) - 0x0B-0x23 ------------- */
    pub bytes_per_sector: u16,   // 0x0B
    pub sectors_per_cluster: u8, // 0x0D
    pub reserved_sectors: u16,   // 0x0E
    pub unused1: [u8; 5],        // 0x10
    pub media_descriptor: u8,    // 0x15 (0xF8 = hard disk)
    pub unused2: u16,            // 0x16
    pub sectors_per_track: u16,  // 0x18
    pub number_of_heads: u16,    // 0x1A
    pub hidden_sectors: u32,     // 0x1C
    pub unused3: u32,            // 0x20
    pub unused4: u32,            // 0x24

    /* -- Extended BPB - 0x28-0x53 ---------------------------- */
    pub total_sectors: u64,            // 0x28
    pub mft_cluster: u64,              // 0x30
    pub mft_mirror_cluster: u64,       // 0x38
    pub clusters_per_file_record: i8,  // 0x40  (negative = 2^-n bytes)
    pub unused5: [u8; 3],
    pub clusters_per_index_record: i8, // 0x44
    pub unused6: [u8; 3],
    pub volume_serial_number: u64, // 0x48
    pub checksum: u32,             // 0x50

    /* -- Bootstrap code - 0x54-0x1FD ------------------------ */
    pub bootstrap_code: Vec<u8>,
}

impl BootSector {
    pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";

    /// Parse the 512-byte sector.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < BOOT_SECTOR_LENGTH {
            return Err(NtfsError::corrupt(
                buf.len(),
                "boot sector must be at least 512 bytes",
            ));
        }
        let mut c = Cursor::new(buf);

        let mut jump_instruction = [0u8; 3];
        c.read_exact(&mut jump_instruction)?;
        let mut oem_id = [0u8; 8];
        c.read_exact(&mut oem_id)?;

        let bytes_per_sector = c.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = c.read_u8()?;
        let reserved_sectors = c.read_u16::<LittleEndian>()?;
        let mut unused1 = [0u8; 5];
        c.read_exact(&mut unused1)?;
        let media_descriptor = c.read_u8()?;
        let unused2 = c.read_u16::<LittleEndian>()?;
        let sectors_per_track = c.read_u16::<LittleEndian>()?;
        let number_of_heads = c.read_u16::<LittleEndian>()?;
        let hidden_sectors = c.read_u32::<LittleEndian>()?;
        let unused3 = c.read_u32::<LittleEndian>()?;
        let unused4 = c.read_u32::<LittleEndian>()?;

        let total_sectors = c.read_u64::<LittleEndian>()?;
        let mft_cluster = c.read_u64::<LittleEndian>()?;
        let mft_mirror_cluster = c.read_u64::<LittleEndian>()?;
        let clusters_per_file_record = c.read_i8()?;
        let mut unused5 = [0u8; 3];
        c.read_exact(&mut unused5)?;
        let clusters_per_index_record = c.read_i8()?;
        let mut unused6 = [0u8; 3];
        c.read_exact(&mut unused6)?;
        let volume_serial_number = c.read_u64::<LittleEndian>()?;
        let checksum = c.read_u32::<LittleEndian>()?;

        let mut bootstrap_code = vec![0u8; 426];
        c.read_exact(&mut bootstrap_code)?;
        let end_of_sector_marker = c.read_u16::<LittleEndian>()?;
        if end_of_sector_marker != END_OF_SECTOR_MARKER {
            return Err(NtfsError::corrupt(
                0x1FE,
                format!(
                    "bad end-of-sector marker: expected 0x{:04X}, found 0x{:04X}",
                    END_OF_SECTOR_MARKER, end_of_sector_marker
                ),
            ));
        }

        Ok(Self {
            jump_instruction,
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            unused1,
            media_descriptor,
            unused2,
            sectors_per_track,
            number_of_heads,
            hidden_sectors,
            unused3,
            unused4,
            total_sectors,
            mft_cluster,
            mft_mirror_cluster,
            clusters_per_file_record,
            unused5,
            clusters_per_index_record,
            unused6,
            volume_serial_number,
            checksum,
            bootstrap_code,
        })
    }

    /// Serialize back into a 512-byte sector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.bootstrap_code.len() != 426 {
            return Err(NtfsError::InvalidArgument(format!(
                "bootstrap code must be 426 bytes, got {}",
                self.bootstrap_code.len()
            )));
        }
        let mut out = Vec::with_capacity(BOOT_SECTOR_LENGTH);
        out.write_all(&self.jump_instruction)?;
        out.write_all(&self.oem_id)?;
        out.write_u16::<LittleEndian>(self.bytes_per_sector)?;
        out.write_u8(self.sectors_per_cluster)?;
        out.write_u16::<LittleEndian>(self.reserved_sectors)?;
        out.write_all(&self.unused1)?;
        out.write_u8(self.media_descriptor)?;
        out.write_u16::<LittleEndian>(self.unused2)?;
        out.write_u16::<LittleEndian>(self.sectors_per_track)?;
        out.write_u16::<LittleEndian>(self.number_of_heads)?;
        out.write_u32::<LittleEndian>(self.hidden_sectors)?;
        out.write_u32::<LittleEndian>(self.unused3)?;
        out.write_u32::<LittleEndian>(self.unused4)?;
        out.write_u64::<LittleEndian>(self.total_sectors)?;
        out.write_u64::<LittleEndian>(self.mft_cluster)?;
        out.write_u64::<LittleEndian>(self.mft_mirror_cluster)?;
        out.write_i8(self.clusters_per_file_record)?;
        out.write_all(&self.unused5)?;
        out.write_i8(self.clusters_per_index_record)?;
        out.write_all(&self.unused6)?;
        out.write_u64::<LittleEndian>(self.volume_serial_number)?;
        out.write_u32::<LittleEndian>(self.checksum)?;
        out.write_all(&self.bootstrap_code)?;
        out.write_u16::<LittleEndian>(END_OF_SECTOR_MARKER)?;
        Ok(out)
    }

    pub fn oem_id_is_valid(&self) -> bool {
        self.oem_id == Self::NTFS_OEM_ID
    }

    pub fn cluster_size(&self) -> u32 {
        self.sectors_per_cluster as u32 * self.bytes_per_sector as u32
    }

    /// Bytes per file record segment. A positive raw value counts clusters,
    /// a negative one encodes 2^-n bytes.
    pub fn file_record_segment_length(&self) -> u32 {
        if self.clusters_per_file_record > 0 {
            self.clusters_per_file_record as u32 * self.cluster_size()
        } else {
            1u32 << (-self.clusters_per_file_record as u32)
        }
    }

    pub fn index_record_length(&self) -> u32 {
        if self.clusters_per_index_record > 0 {
            self.clusters_per_index_record as u32 * self.cluster_size()
        } else {
            1u32 << (-self.clusters_per_index_record as u32)
        }
    }

    /// Byte offset of the first MFT file record segment.
    pub fn mft_offset(&self) -> u64 {
        self.mft_cluster * self.cluster_size() as u64
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BootSector {
        BootSector {
            jump_instruction: [0xEB, 0x52, 0x90],
            oem_id: BootSector::NTFS_OEM_ID,
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 0,
            unused1: [0; 5],
            media_descriptor: 0xF8,
            unused2: 0,
            sectors_per_track: 63,
            number_of_heads: 255,
            hidden_sectors: 2048,
            unused3: 0,
            unused4: 0x80_0080,
            total_sectors: 204_800,
            mft_cluster: 8533,
            mft_mirror_cluster: 2,
            clusters_per_file_record: -10,
            unused5: [0; 3],
            clusters_per_index_record: 1,
            unused6: [0; 3],
            volume_serial_number: 0xDEAD_BEEF_CAFE_F00D,
            checksum: 0,
            bootstrap_code: vec![0; 426],
        }
    }

    #[test]
    fn round_trip() {
        let sector = sample();
        let bytes = sector.to_bytes().unwrap();
        assert_eq!(bytes.len(), BOOT_SECTOR_LENGTH);
        let parsed = BootSector::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sector);
        assert!(parsed.oem_id_is_valid());
    }

    #[test]
    fn geometry_helpers() {
        let sector = sample();
        assert_eq!(sector.cluster_size(), 4096);
        // negative exponent form: 2^10 bytes
        assert_eq!(sector.file_record_segment_length(), 1024);
        assert_eq!(sector.index_record_length(), 4096);
        assert_eq!(sector.mft_offset(), 8533 * 4096);
    }

    #[test]
    fn positive_clusters_per_file_record() {
        let mut sector = sample();
        sector.clusters_per_file_record = 2;
        assert_eq!(sector.file_record_segment_length(), 8192);
    }

    #[test]
    fn bad_marker_is_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0x1FF] = 0;
        assert!(matches!(
            BootSector::from_bytes(&bytes),
            Err(NtfsError::CorruptStructure { offset: 0x1FE, .. })
        ));
    }
}
