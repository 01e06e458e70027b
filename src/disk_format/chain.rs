//! Sector I/O handles and link-byte chain traversal
//!
//! Every CBM DOS structure is a singly linked list of 256-byte
//! sectors: bytes 0-1 hold the (track, sector) of the next block, and
//! a terminal block carries track 0 with the sector byte reinterpreted
//! as the count of payload bytes used.  Directories and files share
//! this layout, so the walker here is shared too.
//!
//! Two handles provide sector access: [`SectorFile`] reads and writes
//! positionally against an open image file (the D64/D71 engines), and
//! [`ImageBuf`] operates on a whole-image buffer (the D81 engine,
//! whose writes are swapped in atomically).

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::disk_format::geometry::{Geometry, Ts, SECTOR_SIZE};
use crate::error::{Error, ErrorKind};

/// Payload bytes per sector: everything after the two link bytes.
pub const PAYLOAD_LEN: usize = 254;

/// Safety cap on chain length; any walk beyond this is treated as a
/// corrupt image.
pub const WALK_CAP: usize = 2000;

/// Sector-granular read access to an image.
pub trait SectorRead {
    /// The geometry the addresses are resolved against.
    fn geometry(&self) -> &Geometry;

    /// Read one 256-byte sector.
    fn read_sector(&mut self, ts: Ts) -> Result<[u8; SECTOR_SIZE], Error>;
}

/// Sector-granular write access to an image.
pub trait SectorWrite: SectorRead {
    /// Write one 256-byte sector.
    fn write_sector(&mut self, ts: Ts, data: &[u8; SECTOR_SIZE]) -> Result<(), Error>;

    /// Write a byte range starting inside a sector.  The range must
    /// not cross the sector boundary.
    fn write_in_sector(&mut self, ts: Ts, offset: usize, data: &[u8]) -> Result<(), Error>;
}

/// Positional sector access to an image file on the host file system.
///
/// Updates through this handle modify sectors in place; they are not
/// transactional.  The D64/D71 engines accept that (per the on-disk
/// family's own semantics), the D81 engine uses [`ImageBuf`] plus an
/// atomic replace instead.
pub struct SectorFile {
    file: File,
    geometry: Geometry,
}

impl SectorFile {
    /// Open an image read-only, detecting the geometry from its size.
    pub fn open_read(path: &Path) -> Result<SectorFile, Error> {
        let file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        let geometry = Geometry::detect(size)?;
        Ok(SectorFile { file, geometry })
    }

    /// Open an image for reading and writing, detecting the geometry
    /// from its size.
    pub fn open_rw(path: &Path) -> Result<SectorFile, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        let geometry = Geometry::detect(size)?;
        Ok(SectorFile { file, geometry })
    }

    /// Read `buf.len()` bytes at an absolute image offset.
    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write bytes at an absolute image offset.
    pub fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Flush file contents to stable storage.  An fsync failure after
    /// a complete write is tolerated: the underlying file system may
    /// not support it.
    pub fn sync(&self) {
        if let Err(e) = self.file.sync_all() {
            debug!("fsync failed, continuing: {}", e);
        }
    }
}

impl SectorRead for SectorFile {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_sector(&mut self, ts: Ts) -> Result<[u8; SECTOR_SIZE], Error> {
        let offset = self.geometry.sector_offset(ts)?;
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl SectorWrite for SectorFile {
    fn write_sector(&mut self, ts: Ts, data: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        let offset = self.geometry.sector_offset(ts)?;
        self.write_at(offset, data)
    }

    fn write_in_sector(&mut self, ts: Ts, offset: usize, data: &[u8]) -> Result<(), Error> {
        debug_assert!(offset + data.len() <= SECTOR_SIZE);
        let base = self.geometry.sector_offset(ts)?;
        self.write_at(base + offset, data)
    }
}

/// A whole disk image held in memory.
pub struct ImageBuf {
    data: Vec<u8>,
    geometry: Geometry,
}

impl ImageBuf {
    /// Wrap raw image bytes, detecting the geometry from their length.
    pub fn new(data: Vec<u8>) -> Result<ImageBuf, Error> {
        let geometry = Geometry::detect(data.len())?;
        Ok(ImageBuf { data, geometry })
    }

    /// Borrow one sector.
    pub fn sector(&self, ts: Ts) -> Result<&[u8], Error> {
        let offset = self.geometry.sector_offset(ts)?;
        Ok(&self.data[offset..offset + SECTOR_SIZE])
    }

    /// Mutably borrow one sector.
    pub fn sector_mut(&mut self, ts: Ts) -> Result<&mut [u8], Error> {
        let offset = self.geometry.sector_offset(ts)?;
        Ok(&mut self.data[offset..offset + SECTOR_SIZE])
    }

    /// The raw image bytes, data region and any trailing error-info
    /// region included.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the handle, returning the raw image bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl SectorRead for ImageBuf {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_sector(&mut self, ts: Ts) -> Result<[u8; SECTOR_SIZE], Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(self.sector(ts)?);
        Ok(buf)
    }
}

impl SectorWrite for ImageBuf {
    fn write_sector(&mut self, ts: Ts, data: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        self.sector_mut(ts)?.copy_from_slice(data);
        Ok(())
    }

    fn write_in_sector(&mut self, ts: Ts, offset: usize, data: &[u8]) -> Result<(), Error> {
        debug_assert!(offset + data.len() <= SECTOR_SIZE);
        let sector = self.sector_mut(ts)?;
        sector[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// One sector of a file chain, with the number of payload bytes it
/// holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainSector {
    /// Where the sector lives.
    pub ts: Ts,
    /// Payload bytes used: 254 on every sector but the last, where
    /// the terminal length byte decides (0 meaning a full 254).
    pub data_len: usize,
}

/// A fully walked file chain.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    /// The sectors in chain order.
    pub sectors: Vec<ChainSector>,
    /// `offsets[i]` is the byte offset within the file at which sector
    /// `i`'s payload starts; enables O(log n) offset-to-sector lookup.
    pub offsets: Vec<usize>,
    /// Total payload size in bytes.
    pub size: usize,
}

impl Chain {
    /// Index of the sector containing the given byte offset.
    ///
    /// The offset must be inside the file.
    pub fn sector_for_offset(&self, offset: usize) -> usize {
        match self.offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }
}

/// Interpret a terminal length byte: 0 means a full payload, and
/// anything past the payload size is coerced down to it.
pub fn terminal_data_len(length_byte: u8) -> usize {
    match length_byte as usize {
        0 => PAYLOAD_LEN,
        n if n > PAYLOAD_LEN => PAYLOAD_LEN,
        n => n,
    }
}

/// Walk a file chain from its first sector, collecting sector
/// addresses, payload lengths and cumulative offsets.
///
/// A start track of 0 denotes an empty chain (a file that was created
/// with no data).  Out-of-range links, revisited sectors and walks
/// longer than [`WALK_CAP`] are all reported as a corrupt path.
pub fn walk_file_chain<R: SectorRead + ?Sized>(io: &mut R, start: Ts) -> Result<Chain, Error> {
    let mut chain = Chain::default();
    if start.track == 0 {
        return Ok(chain);
    }

    let mut visited: HashSet<Ts> = HashSet::new();
    let mut current = start;

    loop {
        if !visited.insert(current) {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "sector chain loops back to {}",
                current
            ))));
        }
        if visited.len() > WALK_CAP {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "sector chain exceeds {} blocks",
                WALK_CAP
            ))));
        }

        let sector = io.read_sector(current)?;
        let next_track = sector[0];
        let next_sector = sector[1];

        let data_len = if next_track == 0 {
            terminal_data_len(next_sector)
        } else {
            PAYLOAD_LEN
        };

        chain.offsets.push(chain.size);
        chain.sectors.push(ChainSector {
            ts: current,
            data_len,
        });
        chain.size += data_len;

        if next_track == 0 {
            return Ok(chain);
        }
        current = Ts::new(next_track, next_sector);
    }
}

/// Walk a directory-style chain, returning each sector's address and
/// contents in order.  The same loop and range protections as
/// [`walk_file_chain`] apply.
pub fn collect_chain_sectors<R: SectorRead + ?Sized>(
    io: &mut R,
    start: Ts,
) -> Result<Vec<(Ts, [u8; SECTOR_SIZE])>, Error> {
    let mut visited: HashSet<Ts> = HashSet::new();
    let mut out = Vec::new();
    let mut current = start;

    loop {
        if !visited.insert(current) {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "directory chain loops back to {}",
                current
            ))));
        }
        if visited.len() > WALK_CAP {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "directory chain exceeds {} blocks",
                WALK_CAP
            ))));
        }

        let sector = io.read_sector(current)?;
        let next_track = sector[0];
        let next_sector = sector[1];
        out.push((current, sector));

        if next_track == 0 {
            return Ok(out);
        }
        current = Ts::new(next_track, next_sector);
    }
}
