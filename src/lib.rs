#![warn(missing_docs)]
#![warn(unsafe_code)]
//! cbmfs is a library crate to read and write Commodore disk images
//! (1541 "D64", 1571 "D71" and 1581 "D81"), exposing them as a small
//! virtual file system: list, look up, read ranges, write ranges,
//! delete, rename, and - on the 1581 - create and remove partitions
//! presented as subdirectories.
//!
//! The disk_format module contains the format engines; the crate root
//! re-exports the operation surface.  Every error carries a stable
//! numeric status code (see [`error::ErrorKind`]) for hosts that
//! forward them over a wire protocol.
//!
//! Write semantics are append-only unless truncating, matching what
//! the on-disk formats can update in place.  D64/D71 writes patch the
//! image file directly; D81 writes rebuild a whole-image buffer and
//! replace the file atomically.
use log::error;

pub mod cache;
pub mod config;
pub mod disk_format;
pub mod error;
pub mod file;

pub use disk_format::d64::{
    delete_file_d64, delete_file_d71, format_blank, rename_file_d64, rename_file_d71,
    write_range_d64, write_range_d71,
};
pub use disk_format::d81::{
    delete_file_d81, format_blank_d81, rename_file_d81, write_range_d81,
};
pub use disk_format::image::{
    load_auto, load_d64, load_d71, load_d81, read_record_range as read_range, D64Image, D71Image,
    D81Image, DiskImage, DiskInfo, FileRecord,
};
pub use disk_format::partition::{mkdir_d81, rename_dir_d81, rmdir_d81};
pub use error::{Error, ErrorKind};

/// Initialize the module.
/// This should be called before any parsing is performed.
/// Panics on failure or if there are any incompatibilities.
pub fn init() {
    // The engines index whole-image buffers with usize; a target
    // narrower than 32 bits cannot address even a D64.
    if usize::BITS < 32 {
        error!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
        panic!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
    }
}
