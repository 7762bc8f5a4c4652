// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

//! Parse, construct and mutate on-disk NTFS metadata structures directly
//! from raw sectors, without an operating system filesystem driver.
//!
//! The core is the attribute and file-record engine: resident and
//! non-resident attribute records, the run-length-encoded cluster mapping of
//! non-resident data ([`runs::DataRunSequence`]), fixed-size MFT file record
//! segments with update-sequence protection ([`segment::FileRecordSegment`]),
//! and the logic splitting or reassembling an attribute list across several
//! segments ([`record::FileRecord`]). Actual cluster I/O is delegated to the
//! [`volume::Volume`] collaborator.

pub mod attribute;
pub mod boot;
pub mod error;
pub mod fixup;
pub mod record;
pub mod runs;
pub mod segment;
pub mod stream;
pub mod volume;

pub use attribute::{AttributeRecord, AttributeType};
pub use boot::BootSector;
pub use error::{NtfsError, Result};
pub use record::FileRecord;
pub use runs::{DataRun, DataRunSequence};
pub use segment::{FileRecordSegment, SegmentReference};
pub use stream::AttributeData;
pub use volume::Volume;
