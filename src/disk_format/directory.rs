//! Directory sectors and their 32-byte entries
//!
//! A directory sector holds eight 32-byte slots; the sector's own
//! link bytes double as bytes 0-1 of slot 0, so entry fields live at
//! slot-relative offsets 2 and up.  Entries are parsed into a tagged
//! [`DirEntry`] so the engines never branch on raw type bytes.

use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u8};
use nom::IResult;

use log::debug;

use crate::disk_format::chain::{collect_chain_sectors, SectorRead, SectorWrite};
use crate::disk_format::geometry::{Ts, SECTOR_SIZE};
use crate::disk_format::petscii::{decode_name, NAME_LEN};
use crate::error::Error;

/// Size of one directory slot.
pub const ENTRY_SIZE: usize = 32;

/// Slots per directory sector.
pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_SIZE;

/// The low-3-bit file type codes of CBM DOS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    /// Sequential data file.
    Seq,
    /// Program file.
    Prg,
    /// User file.
    Usr,
    /// Relative-record file.  Readable; side-sector writes are out of
    /// scope.
    Rel,
    /// 1581 partition.
    Cbm,
    /// 1581 partition flagged as a directory.
    Dir,
}

impl FileKind {
    /// Map a low-3-bits type code, if it is one we know.
    pub fn from_code(code: u8) -> Option<FileKind> {
        match code & 0x07 {
            1 => Some(FileKind::Seq),
            2 => Some(FileKind::Prg),
            3 => Some(FileKind::Usr),
            4 => Some(FileKind::Rel),
            5 => Some(FileKind::Cbm),
            6 => Some(FileKind::Dir),
            _ => None,
        }
    }

    /// The on-disk type code.
    pub fn code(&self) -> u8 {
        match self {
            FileKind::Seq => 1,
            FileKind::Prg => 2,
            FileKind::Usr => 3,
            FileKind::Rel => 4,
            FileKind::Cbm => 5,
            FileKind::Dir => 6,
        }
    }

    /// True for the partition kinds that present as directories.
    pub fn is_partition(&self) -> bool {
        matches!(self, FileKind::Cbm | FileKind::Dir)
    }

    /// The three-letter listing tag.
    pub fn tag(&self) -> &'static str {
        match self {
            FileKind::Seq => "SEQ",
            FileKind::Prg => "PRG",
            FileKind::Usr => "USR",
            FileKind::Rel => "REL",
            FileKind::Cbm => "CBM",
            FileKind::Dir => "DIR",
        }
    }
}

/// The address of one directory slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirSlot {
    /// The directory sector.
    pub ts: Ts,
    /// Slot index within the sector, 0-7.
    pub index: usize,
}

impl DirSlot {
    /// Byte offset of the slot within its sector.
    pub fn byte_offset(&self) -> usize {
        self.index * ENTRY_SIZE
    }
}

/// A parsed directory slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirEntry {
    /// A never-used slot (all entry bytes zero).
    Empty,
    /// A scratched or unrecognizable entry; reusable like
    /// [`DirEntry::Empty`] but not pristine.
    Deleted,
    /// A regular file.
    File {
        /// The file type.
        kind: FileKind,
        /// First sector of the data chain; track 0 means the file has
        /// no data.
        start: Ts,
        /// The padded on-disk name.
        name: [u8; NAME_LEN],
        /// Chain length as recorded in the entry.
        blocks: u16,
        /// Whether the closed bit was set.
        closed: bool,
    },
    /// A 1581 partition presenting as a subdirectory.
    Partition {
        /// `Cbm` or `Dir`.
        kind: FileKind,
        /// The partition's header sector.
        start: Ts,
        /// The padded on-disk name.
        name: [u8; NAME_LEN],
        /// Sector count of the partition's track range.
        blocks: u16,
    },
}

impl DirEntry {
    /// True if the slot can hold a new entry.
    pub fn is_vacant(&self) -> bool {
        matches!(self, DirEntry::Empty | DirEntry::Deleted)
    }

    /// The decoded lookup name, for occupied slots.
    pub fn decoded_name(&self) -> Option<String> {
        match self {
            DirEntry::File { name, .. } | DirEntry::Partition { name, .. } => {
                Some(decode_name(name))
            }
            _ => None,
        }
    }
}

/// Parse one 32-byte directory slot.
pub fn dir_entry_parser(i: &[u8]) -> IResult<&[u8], DirEntry> {
    let (i, _link) = take(2_usize)(i)?;
    let (i, type_byte) = le_u8(i)?;
    let (i, start_track) = le_u8(i)?;
    let (i, start_sector) = le_u8(i)?;
    let (i, name_bytes) = take(NAME_LEN)(i)?;
    // REL side-sector pointer and record size, the unused run, and the
    // save-and-replace scratch bytes.
    let (i, _rel_and_unused) = take(9_usize)(i)?;
    let (i, blocks) = le_u16(i)?;

    let mut name = [0u8; NAME_LEN];
    name.copy_from_slice(name_bytes);

    if type_byte == 0 {
        let pristine = start_track == 0
            && start_sector == 0
            && blocks == 0
            && name.iter().all(|&b| b == 0);
        return Ok((i, if pristine { DirEntry::Empty } else { DirEntry::Deleted }));
    }

    let start = Ts::new(start_track, start_sector);
    let closed = type_byte & 0x80 != 0;
    match FileKind::from_code(type_byte) {
        Some(kind) if kind.is_partition() => Ok((
            i,
            DirEntry::Partition {
                kind,
                start,
                name,
                blocks,
            },
        )),
        Some(kind) => Ok((
            i,
            DirEntry::File {
                kind,
                start,
                name,
                blocks,
                closed,
            },
        )),
        None => {
            debug!("skipping entry with unknown type byte 0x{:02X}", type_byte);
            Ok((i, DirEntry::Deleted))
        }
    }
}

/// Serialize the entry fields (slot-relative bytes 2-31) for a live
/// entry.  The closed bit is always set on write.
pub fn encode_entry(kind: FileKind, start: Ts, name: &[u8; NAME_LEN], blocks: u16) -> [u8; 30] {
    let mut bytes = [0u8; 30];
    bytes[0] = 0x80 | kind.code();
    bytes[1] = start.track;
    bytes[2] = start.sector;
    bytes[3..3 + NAME_LEN].copy_from_slice(name);
    bytes[28..30].copy_from_slice(&blocks.to_le_bytes());
    bytes
}

/// A scan of one directory chain.
pub struct DirScan {
    /// Every slot in chain order.
    pub slots: Vec<(DirSlot, DirEntry)>,
    /// The last sector of the chain, where an extension would link in.
    pub last: Ts,
}

/// Walk a directory chain and parse every slot.
pub fn scan<R: SectorRead + ?Sized>(io: &mut R, start: Ts) -> Result<DirScan, Error> {
    let sectors = collect_chain_sectors(io, start)?;
    let last = sectors.last().map(|(ts, _)| *ts).unwrap_or(start);

    let mut slots = Vec::with_capacity(sectors.len() * ENTRIES_PER_SECTOR);
    for (ts, data) in &sectors {
        for index in 0..ENTRIES_PER_SECTOR {
            let slot = DirSlot { ts: *ts, index };
            let bytes = &data[slot.byte_offset()..slot.byte_offset() + ENTRY_SIZE];
            match dir_entry_parser(bytes) {
                Ok((_, entry)) => slots.push((slot, entry)),
                Err(e) => {
                    // A corrupt slot must not hide the rest of the
                    // directory.
                    debug!("skipping unparsable entry at {} slot {}: {}", ts, index, e);
                }
            }
        }
    }

    Ok(DirScan { slots, last })
}

/// The result of a single-walk lookup: the matching entry if any, the
/// first vacant slot if any, and the last directory sector.
pub struct FindResult {
    /// The first slot whose decoded name equals the key.
    pub matched: Option<(DirSlot, DirEntry)>,
    /// The first vacant slot, usable for a new entry.
    pub vacant: Option<DirSlot>,
    /// The last directory sector, the link point for an extension.
    pub last: Ts,
}

/// Look a name up in one walk, also recording where a new entry could
/// go.
pub fn find<R: SectorRead + ?Sized>(
    io: &mut R,
    start: Ts,
    key: &str,
) -> Result<FindResult, Error> {
    let scanned = scan(io, start)?;
    let mut matched = None;
    let mut vacant = None;

    for (slot, entry) in scanned.slots {
        if entry.is_vacant() {
            if vacant.is_none() {
                vacant = Some(slot);
            }
            continue;
        }
        if matched.is_none() && entry.decoded_name().as_deref() == Some(key) {
            matched = Some((slot, entry));
        }
    }

    Ok(FindResult {
        matched,
        vacant,
        last: scanned.last,
    })
}

/// Link a freshly allocated sector onto the end of a directory chain
/// and format it as an empty terminal directory sector (link 0x00/0xFF,
/// all slots zero).
pub fn append_sector<W: SectorWrite + ?Sized>(
    io: &mut W,
    last: Ts,
    new_ts: Ts,
) -> Result<(), Error> {
    let mut fresh = [0u8; SECTOR_SIZE];
    fresh[0] = 0;
    fresh[1] = 0xFF;
    io.write_sector(new_ts, &fresh)?;
    io.write_in_sector(last, 0, &[new_ts.track, new_ts.sector])
}

/// Clear a directory slot.  Slot 0 shares its first two bytes with the
/// sector's chain link, which must survive.
pub fn clear_slot<W: SectorWrite + ?Sized>(io: &mut W, slot: DirSlot) -> Result<(), Error> {
    let zeros = [0u8; ENTRY_SIZE];
    if slot.index == 0 {
        io.write_in_sector(slot.ts, 2, &zeros[..ENTRY_SIZE - 2])
    } else {
        io.write_in_sector(slot.ts, slot.byte_offset(), &zeros)
    }
}

/// Write a live entry into a slot.
pub fn write_entry<W: SectorWrite + ?Sized>(
    io: &mut W,
    slot: DirSlot,
    kind: FileKind,
    start: Ts,
    name: &[u8; NAME_LEN],
    blocks: u16,
) -> Result<(), Error> {
    let bytes = encode_entry(kind, start, name, blocks);
    io.write_in_sector(slot.ts, slot.byte_offset() + 2, &bytes)
}

/// Overwrite only the 16-byte name field of an entry.
pub fn write_entry_name<W: SectorWrite + ?Sized>(
    io: &mut W,
    slot: DirSlot,
    name: &[u8; NAME_LEN],
) -> Result<(), Error> {
    io.write_in_sector(slot.ts, slot.byte_offset() + 5, name)
}
