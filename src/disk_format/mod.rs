//! The disk_format module contains everything to read and write the
//! supported Commodore disk image families.
//!
//! The layering runs leaves-first: geometry and the name codec at the
//! bottom, then sector I/O and chain walking, the BAM and directory
//! layers on top of those, and the per-family engines at the surface.

/// Block Availability Map views and allocation policies
pub mod bam;
/// Sector I/O handles and chain traversal
pub mod chain;
/// The D64/D71 file engine
pub mod d64;
/// The D81 file engine
pub mod d81;
/// Directory sectors and entries
pub mod directory;
/// Size detection and track/sector arithmetic
pub mod geometry;
/// Parsed images and the loading surface
pub mod image;
/// The D81 partition tree engine and re-pack
pub mod partition;
/// The CBM DOS name codec
pub mod petscii;
