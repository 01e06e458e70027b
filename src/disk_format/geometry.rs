//! Disk geometry for the Commodore 1541/1571/1581 image families
//!
//! Detection is by raw file size only; none of the formats carry a
//! magic number.  All track numbers are 1-based and all sector numbers
//! are 0-based, matching the CBM DOS convention.
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::error::{Error, ErrorKind};

/// Every CBM sector is 256 bytes, two of which are the chain link.
pub const SECTOR_SIZE: usize = 256;

/// Sector count of a standard 35-track 1541 side.
pub const D64_BASE_SECTORS: usize = 683;

/// Sector count of a double-sided 1571 image.
pub const D71_SECTORS: usize = 2 * D64_BASE_SECTORS;

/// Sector count of a 1581 image (80 tracks of 40 sectors).
pub const D81_SECTORS: usize = 3200;

/// A track/sector address.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Ts {
    /// The track number, 1-based.
    pub track: u8,
    /// The sector number, 0-based.
    pub sector: u8,
}

impl Ts {
    /// Create a new track/sector address.
    pub fn new(track: u8, sector: u8) -> Ts {
        Ts { track, sector }
    }
}

impl Display for Ts {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", self.track, self.sector)
    }
}

/// The supported image families.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Variant {
    /// 1541 single-sided image, 35 to 42 tracks.
    D64,
    /// 1571 double-sided image, 70 logical tracks.
    D71,
    /// 1581 image, 80 tracks of 40 sectors.
    D81,
}

impl Display for Variant {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Variant::D64 => write!(f, "D64"),
            Variant::D71 => write!(f, "D71"),
            Variant::D81 => write!(f, "D81"),
        }
    }
}

/// Sectors per track in the 1541 zone layout.  The same table covers
/// each side of a 1571 and the extended tracks of 40/42-track images.
fn sectors_per_track_1541(track: u8) -> u8 {
    match track {
        1..=17 => 21,
        18..=24 => 19,
        25..=30 => 18,
        _ => 17,
    }
}

/// The geometry of a detected image: variant, track count, and the
/// split between sector data and the optional trailing error-info
/// region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// The image family.
    pub variant: Variant,
    /// Number of logical tracks.
    pub tracks: u8,
    /// Length in bytes of the sector data region.
    pub data_len: usize,
    /// Length in bytes of the trailing per-sector error-info region,
    /// zero when absent.  The region is preserved byte-for-byte on
    /// writes but otherwise opaque.
    pub error_info_len: usize,
}

impl Geometry {
    /// Detect the image family from a raw file size.
    ///
    /// Accepted sizes:
    /// - D64: `s * 256` or `s * 257` for `s = 683 + 17k`, `k` in `0..=7`
    ///   (35 to 42 tracks)
    /// - D71: `1366 * 256` or `1366 * 257`
    /// - D81: exactly 819,200 or 822,400 bytes
    ///
    /// Anything else is rejected as a bad request.
    pub fn detect(raw_size: usize) -> Result<Geometry, Error> {
        if raw_size == D81_SECTORS * SECTOR_SIZE {
            return Ok(Geometry {
                variant: Variant::D81,
                tracks: 80,
                data_len: raw_size,
                error_info_len: 0,
            });
        }
        if raw_size == D81_SECTORS * SECTOR_SIZE + D81_SECTORS {
            return Ok(Geometry {
                variant: Variant::D81,
                tracks: 80,
                data_len: D81_SECTORS * SECTOR_SIZE,
                error_info_len: D81_SECTORS,
            });
        }

        if raw_size == D71_SECTORS * SECTOR_SIZE {
            return Ok(Geometry {
                variant: Variant::D71,
                tracks: 70,
                data_len: raw_size,
                error_info_len: 0,
            });
        }
        if raw_size == D71_SECTORS * (SECTOR_SIZE + 1) {
            return Ok(Geometry {
                variant: Variant::D71,
                tracks: 70,
                data_len: D71_SECTORS * SECTOR_SIZE,
                error_info_len: D71_SECTORS,
            });
        }

        for extra_tracks in 0..=7 {
            let sectors = D64_BASE_SECTORS + 17 * extra_tracks;
            let tracks = 35 + extra_tracks as u8;
            if raw_size == sectors * SECTOR_SIZE {
                return Ok(Geometry {
                    variant: Variant::D64,
                    tracks,
                    data_len: raw_size,
                    error_info_len: 0,
                });
            }
            if raw_size == sectors * (SECTOR_SIZE + 1) {
                return Ok(Geometry {
                    variant: Variant::D64,
                    tracks,
                    data_len: sectors * SECTOR_SIZE,
                    error_info_len: sectors,
                });
            }
        }

        Err(Error::new(ErrorKind::BadRequest(format!(
            "unrecognized image size: {} bytes",
            raw_size
        ))))
    }

    /// The track that holds the BAM and the first directory sector.
    pub fn system_track(&self) -> u8 {
        match self.variant {
            Variant::D64 | Variant::D71 => 18,
            Variant::D81 => 40,
        }
    }

    /// The first directory sector of the root directory.
    pub fn directory_start(&self) -> Ts {
        match self.variant {
            Variant::D64 | Variant::D71 => Ts::new(18, 1),
            Variant::D81 => Ts::new(40, 3),
        }
    }

    /// Number of sectors on the given track.
    pub fn sectors_on_track(&self, track: u8) -> Result<u8, Error> {
        if track == 0 || track > self.tracks {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "track {} out of range (1..={})",
                track, self.tracks
            ))));
        }
        Ok(match self.variant {
            Variant::D81 => 40,
            Variant::D64 => sectors_per_track_1541(track),
            Variant::D71 => {
                if track > 35 {
                    sectors_per_track_1541(track - 35)
                } else {
                    sectors_per_track_1541(track)
                }
            }
        })
    }

    /// Byte offset of the given track/sector within the data region.
    ///
    /// Out-of-range addresses are an error; offsets never wrap.
    pub fn sector_offset(&self, ts: Ts) -> Result<usize, Error> {
        let sectors = self.sectors_on_track(ts.track)?;
        if ts.sector >= sectors {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "sector {} out of range on track {} (max {})",
                ts.sector,
                ts.track,
                sectors - 1
            ))));
        }

        match self.variant {
            Variant::D81 => {
                Ok(((ts.track as usize - 1) * 40 + ts.sector as usize) * SECTOR_SIZE)
            }
            Variant::D64 => Ok(d64_side_offset(ts.track, ts.sector)),
            Variant::D71 => {
                if ts.track > 35 {
                    Ok(D64_BASE_SECTORS * SECTOR_SIZE
                        + d64_side_offset(ts.track - 35, ts.sector))
                } else {
                    Ok(d64_side_offset(ts.track, ts.sector))
                }
            }
        }
    }

    /// Total sector count in the data region.
    pub fn total_sectors(&self) -> usize {
        self.data_len / SECTOR_SIZE
    }
}

/// Offset within one 1541-layout side, tracks 1-based.
fn d64_side_offset(track: u8, sector: u8) -> usize {
    let mut sectors_before = 0usize;
    for t in 1..track {
        sectors_before += sectors_per_track_1541(t) as usize;
    }
    (sectors_before + sector as usize) * SECTOR_SIZE
}
