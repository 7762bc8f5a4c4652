//! Update-sequence-array (fixup) protection.
//!
//! NTFS structures larger than one sector carry a 2-byte update sequence
//! number at the end of every 512-byte stride; the displaced data bytes are
//! relocated into an array in the structure's header. A stride whose trailing
//! USN does not match the header signals a torn write.

use crate::error::{NtfsError, Result};
use log::{debug, warn};

pub const BYTES_PER_STRIDE: usize = 512;

/// Number of 2-byte entries in the update sequence array of a buffer:
/// the USN itself plus one entry per stride.
pub fn update_sequence_array_length(buffer_length: usize) -> usize {
    1 + buffer_length / BYTES_PER_STRIDE
}

/// Capture the last two bytes of every stride into the update sequence array
/// and overwrite each stride end with `usn`. The inverse of
/// [`apply_update_sequence_fixups`].
pub fn insert_update_sequence_fixups(
    buf: &mut [u8],
    usa_offset: usize,
    usn: u16,
) -> Result<()> {
    let usa_count = update_sequence_array_length(buf.len());
    if usa_offset + 2 * usa_count > buf.len() {
        return Err(NtfsError::InvalidArgument(format!(
            "update sequence array at 0x{:X} does not fit a {} byte buffer",
            usa_offset,
            buf.len()
        )));
    }
    let usn_bytes = usn.to_le_bytes();
    buf[usa_offset] = usn_bytes[0];
    buf[usa_offset + 1] = usn_bytes[1];

    for i in 1..usa_count {
        let stride_end = i * BYTES_PER_STRIDE - 2;
        let slot = usa_offset + 2 * i;
        buf[slot] = buf[stride_end];
        buf[slot + 1] = buf[stride_end + 1];
        buf[stride_end] = usn_bytes[0];
        buf[stride_end + 1] = usn_bytes[1];
    }
    Ok(())
}

/// Validate the USN at the end of every stride and patch the displaced data
/// bytes back in place. A mismatch means a torn or corrupted write and is
/// reported, never accepted.
pub fn apply_update_sequence_fixups(
    buf: &mut [u8],
    usa_offset: usize,
    usa_count: usize,
) -> Result<()> {
    if usa_offset + 2 * usa_count > buf.len() {
        warn!("Incomplete multi-sector transfer, corrupted record.");
        return Err(NtfsError::corrupt(
            usa_offset,
            "update sequence array outside record",
        ));
    }
    if usa_count < 2 {
        debug!("Record fits one stride, nothing to patch.");
        return Ok(());
    }

    // Copy of the USN, not a slice: the loop below mutates the buffer.
    let usn = [buf[usa_offset], buf[usa_offset + 1]];

    for i in 1..usa_count {
        let stride_end = i * BYTES_PER_STRIDE - 2;
        if stride_end + 2 > buf.len() {
            return Err(NtfsError::corrupt(
                stride_end,
                format!("stride {} ends after the record", i),
            ));
        }
        if buf[stride_end] != usn[0] || buf[stride_end + 1] != usn[1] {
            return Err(NtfsError::corrupt(
                stride_end,
                format!(
                    "bad update sequence number at stride {}: expected {:02X}{:02X}, found {:02X}{:02X}",
                    i, usn[0], usn[1], buf[stride_end], buf[stride_end + 1]
                ),
            ));
        }

        let slot = usa_offset + 2 * i;
        buf[stride_end] = buf[slot];
        buf[stride_end + 1] = buf[slot + 1];
    }
    Ok(())
}
