//! The parsed-image surface shared by the three families
//!
//! Loading an image produces a [`ParsedImage`]: the disk header info
//! plus one [`FileRecord`] per directory entry, with each file's chain
//! pre-walked so byte ranges can be served with positional reads.
//! Parses are memoized in the process-wide cache and invalidated by
//! every write path.

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::cache;
use crate::disk_format::bam::{BlockMap, D64Bam, D71Bam, D81Bam};
use crate::disk_format::chain::{walk_file_chain, Chain, SectorFile, SectorRead};
use crate::disk_format::directory::{self, DirEntry, DirSlot, FileKind};
use crate::disk_format::geometry::{Geometry, Ts, Variant};
use crate::disk_format::petscii::decode_name;
use crate::error::{Error, ErrorKind};
use crate::file::fingerprint;

/// Disk-level header information.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskInfo {
    /// The image family.
    pub variant: Variant,
    /// The decoded disk name.
    pub name: String,
    /// The two-character disk id.
    pub disk_id: String,
    /// The DOS type tag ("2A" for 1541/1571, "3D" for 1581).
    pub dos_type: String,
    /// Free blocks outside the system track(s).
    pub blocks_free: u32,
}

impl DiskInfo {
    /// The header line of a C64-style directory listing.
    pub fn format_header(&self) -> String {
        format!("0 \"{}\" {} {}", self.name, self.disk_id, self.dos_type)
    }

    /// The footer line of a C64-style directory listing.
    pub fn format_footer(&self) -> String {
        format!("{} BLOCKS FREE.", self.blocks_free)
    }
}

impl Display for DiskInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.format_header())
    }
}

/// One directory entry with its chain pre-walked.
#[derive(Clone, Debug)]
pub struct FileRecord {
    /// The decoded lookup name.  When two on-disk entries decode to
    /// the same name the later ones are disambiguated as `NAME~2`,
    /// `NAME~3`, ...; the on-disk bytes are untouched.
    pub name: String,
    /// The entry type.
    pub kind: FileKind,
    /// File size in bytes (0 for partitions).
    pub size: usize,
    /// Block count from the directory entry.
    pub blocks: u16,
    /// First sector: the data chain for files, the header sector for
    /// partitions.  Track 0 means a file with no data.
    pub start: Ts,
    /// The walked chain (empty for partitions).
    pub chain: Chain,
    /// Where the entry lives, for write-back.
    pub slot: DirSlot,
}

impl FileRecord {
    /// True for partition entries.
    pub fn is_partition(&self) -> bool {
        self.kind.is_partition()
    }

    /// One line of a C64-style directory listing.
    pub fn format_line(&self) -> String {
        format!("{:>4}  \"{:<16}\" {}", self.blocks, self.name, self.kind.tag())
    }
}

impl Display for FileRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.format_line())
    }
}

/// A fully parsed image: header info plus the root directory.
pub struct ParsedImage {
    /// The detected geometry.
    pub geometry: Geometry,
    /// Disk header information.
    pub info: DiskInfo,
    /// Root directory records in on-disk order.
    pub files: Vec<FileRecord>,
    by_key: HashMap<String, usize>,
}

impl ParsedImage {
    /// Records sorted by name.
    pub fn sorted(&self) -> Vec<&FileRecord> {
        let mut records: Vec<&FileRecord> = self.files.iter().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Case-insensitive lookup on the normalized name.
    pub fn lookup(&self, key: &str) -> Option<&FileRecord> {
        self.by_key.get(key).map(|&i| &self.files[i])
    }
}

/// Build the records of one directory, walking each file's chain.
///
/// Entries whose chain turns out corrupt are skipped with a debug log
/// so a partially damaged image still lists its remaining files.
pub fn build_records<R: SectorRead + ?Sized>(
    io: &mut R,
    dir_start: Ts,
) -> Result<Vec<FileRecord>, Error> {
    let scanned = directory::scan(io, dir_start)?;
    let mut records: Vec<FileRecord> = Vec::new();
    let mut taken: HashMap<String, u32> = HashMap::new();

    for (slot, entry) in scanned.slots {
        let mut record = match entry {
            DirEntry::File {
                kind,
                start,
                name,
                blocks,
                ..
            } => {
                let chain = match walk_file_chain(io, start) {
                    Ok(chain) => chain,
                    Err(e) => {
                        debug!(
                            "skipping entry {} with broken chain: {}",
                            decode_name(&name),
                            e
                        );
                        continue;
                    }
                };
                FileRecord {
                    name: decode_name(&name),
                    kind,
                    size: chain.size,
                    blocks,
                    start,
                    chain,
                    slot,
                }
            }
            DirEntry::Partition {
                kind,
                start,
                name,
                blocks,
            } => FileRecord {
                name: decode_name(&name),
                kind,
                size: 0,
                blocks,
                start,
                chain: Chain::default(),
                slot,
            },
            _ => continue,
        };

        // Read-side disambiguation keeps lookups unique; on-disk
        // names stay as they are.
        let count = taken.entry(record.name.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            let alias = format!("{}~{}", record.name, count);
            debug!("duplicate name {}, listed as {}", record.name, alias);
            record.name = alias;
            taken.insert(record.name.clone(), 1);
        }
        records.push(record);
    }

    Ok(records)
}

/// Read the disk header info for any variant.
pub fn read_disk_info<R: SectorRead + ?Sized>(io: &mut R) -> Result<DiskInfo, Error> {
    let geometry = *io.geometry();
    match geometry.variant {
        Variant::D64 => {
            let header = io.read_sector(Ts::new(18, 0))?;
            let bam = D64Bam::load(io)?;
            let mut blocks_free = 0u32;
            for track in 1..=geometry.tracks {
                if track == 18 {
                    continue;
                }
                blocks_free += bam.track_free_count(track)? as u32;
            }
            Ok(DiskInfo {
                variant: geometry.variant,
                name: decode_name(&header[0x90..0xA0]),
                disk_id: decode_name(&header[0xA2..0xA4]),
                dos_type: decode_name(&header[0xA5..0xA7]),
                blocks_free,
            })
        }
        Variant::D71 => {
            let header = io.read_sector(Ts::new(18, 0))?;
            let bam = D71Bam::load(io)?;
            let mut blocks_free = 0u32;
            for track in 1..=geometry.tracks {
                if track == 18 || track == 53 {
                    continue;
                }
                blocks_free += bam.track_free_count(track)? as u32;
            }
            Ok(DiskInfo {
                variant: geometry.variant,
                name: decode_name(&header[0x90..0xA0]),
                disk_id: decode_name(&header[0xA2..0xA4]),
                dos_type: decode_name(&header[0xA5..0xA7]),
                blocks_free,
            })
        }
        Variant::D81 => {
            let header = io.read_sector(Ts::new(40, 0))?;
            let bam = D81Bam::load_root(io)?;
            let mut blocks_free = 0u32;
            for track in 1..=geometry.tracks {
                if track == 40 {
                    continue;
                }
                blocks_free += bam.track_free_count(track)? as u32;
            }
            Ok(DiskInfo {
                variant: geometry.variant,
                name: decode_name(&header[0x04..0x14]),
                disk_id: decode_name(&header[0x16..0x18]),
                dos_type: decode_name(&header[0x19..0x1B]),
                blocks_free,
            })
        }
    }
}

/// Parse an image file's root directory, going through the cache.
pub fn load_parsed(path: &Path) -> Result<Arc<ParsedImage>, Error> {
    let canonical = path.canonicalize()?;
    let print = fingerprint(&canonical)?;

    if let Some(parsed) = cache::lookup(&canonical, print) {
        return Ok(parsed);
    }

    let mut io = SectorFile::open_read(&canonical)?;
    let geometry = *io.geometry();
    let info = read_disk_info(&mut io)?;
    let files = build_records(&mut io, geometry.directory_start())?;

    let by_key = files
        .iter()
        .enumerate()
        .map(|(i, record)| (record.name.clone(), i))
        .collect();

    let parsed = Arc::new(ParsedImage {
        geometry,
        info,
        files,
        by_key,
    });
    cache::install(&canonical, print, Arc::clone(&parsed));
    Ok(parsed)
}

/// Read a byte range out of a file record with positional reads.
pub fn read_record_range(
    path: &Path,
    record: &FileRecord,
    offset: usize,
    length: usize,
) -> Result<Vec<u8>, Error> {
    if offset + length > record.size {
        return Err(Error::new(ErrorKind::RangeInvalid(format!(
            "range {}+{} exceeds file size {}",
            offset, length, record.size
        ))));
    }
    if length == 0 {
        return Ok(Vec::new());
    }

    let mut io = SectorFile::open_read(path)?;
    let geometry = *io.geometry();
    let chain = &record.chain;

    let mut out = Vec::with_capacity(length);
    let mut index = chain.sector_for_offset(offset);
    let mut within = offset - chain.offsets[index];

    while out.len() < length {
        let sector = chain.sectors[index];
        let take = (sector.data_len - within).min(length - out.len());
        let base = geometry.sector_offset(sector.ts)?;

        let mut buf = vec![0u8; take];
        io.read_at(base + 2 + within, &mut buf)?;
        out.extend_from_slice(&buf);

        index += 1;
        within = 0;
    }

    Ok(out)
}

fn expect_variant(parsed: &ParsedImage, wanted: Variant) -> Result<(), Error> {
    if parsed.geometry.variant != wanted {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "image is {}, not {}",
            parsed.geometry.variant, wanted
        ))));
    }
    Ok(())
}

macro_rules! flat_image_type {
    ($name:ident, $variant:expr, $doc:literal) => {
        #[doc = $doc]
        pub struct $name {
            path: PathBuf,
            parsed: Arc<ParsedImage>,
        }

        impl $name {
            /// Load and parse the image, going through the cache.
            pub fn load(path: &Path) -> Result<$name, Error> {
                let parsed = load_parsed(path)?;
                expect_variant(&parsed, $variant)?;
                Ok($name {
                    path: path.to_path_buf(),
                    parsed,
                })
            }

            /// The host path the image was loaded from.
            pub fn path(&self) -> &Path {
                &self.path
            }

            /// Disk header information.
            pub fn info(&self) -> &DiskInfo {
                &self.parsed.info
            }

            /// Directory records sorted by name.
            pub fn list(&self) -> Vec<&FileRecord> {
                self.parsed.sorted()
            }

            /// Look up one entry by its normalized name.
            pub fn lookup(&self, name: &str) -> Result<&FileRecord, Error> {
                let key = crate::disk_format::petscii::normalize_key(name);
                self.parsed.lookup(&key).ok_or_else(|| {
                    Error::new(ErrorKind::NotFound(format!("no such file: {}", key)))
                })
            }

            /// Read a byte range from an entry.
            pub fn read_range(
                &self,
                record: &FileRecord,
                offset: usize,
                length: usize,
            ) -> Result<Vec<u8>, Error> {
                read_record_range(&self.path, record, offset, length)
            }
        }
    };
}

flat_image_type!(D64Image, Variant::D64, "A parsed 1541 image.");
flat_image_type!(D71Image, Variant::D71, "A parsed 1571 image.");
flat_image_type!(D81Image, Variant::D81, "A parsed 1581 image (root directory).");

impl D81Image {
    /// List a directory given its first directory sector, for walking
    /// into partitions.  The result is built fresh from the image and
    /// sorted by name.
    pub fn dir(&self, start: Ts) -> Result<Vec<FileRecord>, Error> {
        let mut io = SectorFile::open_read(&self.path)?;
        let mut records = build_records(&mut io, start)?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Resolve a partition entry to its first directory sector by
    /// following the header sector's link bytes.
    pub fn partition_directory(&self, record: &FileRecord) -> Result<Ts, Error> {
        if !record.is_partition() {
            return Err(Error::new(ErrorKind::NotADirectory(format!(
                "not a directory: {}",
                record.name
            ))));
        }
        let mut io = SectorFile::open_read(&self.path)?;
        let header = io.read_sector(record.start)?;
        if header[2] != b'D' {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "partition {} has no header at {}",
                record.name, record.start
            ))));
        }
        Ok(Ts::new(header[0], header[1]))
    }
}

/// An image of any supported family.
pub enum DiskImage {
    /// A 1541 image.
    D64(D64Image),
    /// A 1571 image.
    D71(D71Image),
    /// A 1581 image.
    D81(D81Image),
}

impl Display for DiskImage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DiskImage::D64(image) => write!(f, "D64 disk: {}", image.info()),
            DiskImage::D71(image) => write!(f, "D71 disk: {}", image.info()),
            DiskImage::D81(image) => write!(f, "D81 disk: {}", image.info()),
        }
    }
}

/// Load an image, detecting its family from the file size.
pub fn load_auto(path: &Path) -> Result<DiskImage, Error> {
    let parsed = load_parsed(path)?;
    Ok(match parsed.geometry.variant {
        Variant::D64 => DiskImage::D64(D64Image::load(path)?),
        Variant::D71 => DiskImage::D71(D71Image::load(path)?),
        Variant::D81 => DiskImage::D81(D81Image::load(path)?),
    })
}

/// Load a D64 image.
pub fn load_d64(path: &Path) -> Result<D64Image, Error> {
    D64Image::load(path)
}

/// Load a D71 image.
pub fn load_d71(path: &Path) -> Result<D71Image, Error> {
    D71Image::load(path)
}

/// Load a D81 image.
pub fn load_d81(path: &Path) -> Result<D81Image, Error> {
    D81Image::load(path)
}
