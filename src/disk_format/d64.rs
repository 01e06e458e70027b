//! The D64/D71 file engine
//!
//! Mutations here work in place against the image file: BAM first,
//! then the data chain, then the directory entry, then fsync.  That
//! ordering bounds the damage of an interrupted write (a torn update
//! can leak sectors but never cross-link live files); full snapshot
//! atomicity is a property of the D81 engine only.
//!
//! Writes are append-only unless truncating: an existing file can
//! grow at its exact end or be replaced wholesale, nothing else.

use std::path::Path;

use crate::cache;
use crate::disk_format::bam::{BlockMap, D64Bam, D71Bam};
use crate::disk_format::chain::{
    walk_file_chain, Chain, SectorFile, SectorRead, SectorWrite, PAYLOAD_LEN,
};
use crate::disk_format::directory::{self, DirEntry, DirSlot, FileKind};
use crate::disk_format::geometry::{Geometry, Ts, Variant, SECTOR_SIZE};
use crate::disk_format::petscii::{encode_name, encode_name_d81, has_wildcard, normalize_key};
use crate::error::{Error, ErrorKind};

/// The BAM of a flat-root image, D64 or D71.
enum FlatBam {
    D64(D64Bam),
    D71(D71Bam),
}

impl FlatBam {
    fn load(io: &mut SectorFile) -> Result<FlatBam, Error> {
        match io.geometry().variant {
            Variant::D64 => Ok(FlatBam::D64(D64Bam::load(io)?)),
            Variant::D71 => Ok(FlatBam::D71(D71Bam::load(io)?)),
            Variant::D81 => Err(Error::new(ErrorKind::Internal(String::from(
                "D81 images use the buffer engine",
            )))),
        }
    }

    fn flush(&self, io: &mut SectorFile) -> Result<(), Error> {
        match self {
            FlatBam::D64(bam) => bam.flush(io),
            FlatBam::D71(bam) => bam.flush(io),
        }
    }

    fn alloc_data_sector(&mut self) -> Result<Option<Ts>, Error> {
        match self {
            FlatBam::D64(bam) => bam.alloc_data_sector(),
            FlatBam::D71(bam) => bam.alloc_data_sector(),
        }
    }

    fn alloc_directory_sector(&mut self) -> Result<Option<Ts>, Error> {
        match self {
            FlatBam::D64(bam) => bam.alloc_directory_sector(),
            FlatBam::D71(bam) => bam.alloc_directory_sector(),
        }
    }

    fn mark_free(&mut self, ts: Ts) -> Result<(), Error> {
        match self {
            FlatBam::D64(bam) => bam.mark_free(ts),
            FlatBam::D71(bam) => bam.mark_free(ts),
        }
    }
}

/// Reject inner names that cannot name a flat-root file: wildcards are
/// malformed in any write path, and path separators would imply
/// subdirectories these images do not have.
fn validate_flat_name(name: &str) -> Result<(), Error> {
    if has_wildcard(name) {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "wildcard in write path: {}",
            name
        ))));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::new(ErrorKind::Unsupported(format!(
            "subdirectories are not supported on this image: {}",
            name
        ))));
    }
    Ok(())
}

fn open_rw_expecting(path: &Path, variant: Variant) -> Result<SectorFile, Error> {
    let io = SectorFile::open_rw(path)?;
    if io.geometry().variant != variant {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "image is {}, not {}",
            io.geometry().variant,
            variant
        ))));
    }
    Ok(io)
}

fn invalidate(path: &Path) {
    if let Ok(canonical) = path.canonicalize() {
        cache::invalidate(&canonical);
    }
}

struct Existing {
    slot: DirSlot,
    kind: FileKind,
    name: [u8; 16],
    chain: Chain,
}

/// Apply the write-range rule table.  `exists`/`cur_size` describe the
/// current entry; errors carry the caller-facing status.  The D81
/// engines apply the same table.
pub(crate) fn check_write_rules(
    offset: usize,
    data_len: usize,
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
    exists: bool,
    cur_size: usize,
) -> Result<(), Error> {
    if truncate {
        if offset != 0 {
            return Err(Error::new(ErrorKind::RangeInvalid(String::from(
                "truncate requires offset 0",
            ))));
        }
        if exists && !allow_overwrite {
            return Err(Error::new(ErrorKind::AccessDenied(String::from(
                "overwrite requires allow_overwrite",
            ))));
        }
        if !exists && !create {
            return Err(Error::new(ErrorKind::NotFound(String::from(
                "no such file and create not requested",
            ))));
        }
        return Ok(());
    }

    if !exists {
        if !create {
            return Err(Error::new(ErrorKind::NotFound(String::from(
                "no such file and create not requested",
            ))));
        }
        if offset != 0 {
            return Err(Error::new(ErrorKind::RangeInvalid(String::from(
                "a new file starts at offset 0",
            ))));
        }
        return Ok(());
    }

    if offset == 0 && cur_size > 0 && data_len > 0 {
        return Err(Error::new(ErrorKind::AlreadyExists(String::from(
            "overwrite requires truncate",
        ))));
    }
    if offset != cur_size {
        return Err(Error::new(ErrorKind::RangeInvalid(format!(
            "append-only: offset {} does not match size {}",
            offset, cur_size
        ))));
    }
    Ok(())
}

/// Shared flat-root write-range implementation; see the per-variant
/// wrappers.
fn write_range_flat(
    path: &Path,
    name: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
    variant: Variant,
) -> Result<usize, Error> {
    validate_flat_name(name)?;
    let key = normalize_key(name);

    let mut io = open_rw_expecting(path, variant)?;
    let dir_start = io.geometry().directory_start();
    let mut bam = FlatBam::load(&mut io)?;

    let found = directory::find(&mut io, dir_start, &key)?;
    let existing = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "cannot write to a partition: {}",
                key
            ))));
        }
        Some((slot, DirEntry::File {
            kind, start, name, ..
        })) => {
            if kind == FileKind::Rel {
                return Err(Error::new(ErrorKind::Unsupported(format!(
                    "REL files are read-only: {}",
                    key
                ))));
            }
            let chain = walk_file_chain(&mut io, start)?;
            Some(Existing {
                slot,
                kind,
                name,
                chain,
            })
        }
        _ => None,
    };

    let exists = existing.is_some();
    let cur_size = existing.as_ref().map(|e| e.chain.size).unwrap_or(0);
    check_write_rules(
        offset,
        data.len(),
        truncate,
        create,
        allow_overwrite,
        exists,
        cur_size,
    )?;

    // Resolve the slot and on-disk name before any mutation so a bad
    // name cannot strand a half-done update.
    let mut pending_extension: Option<(Ts, Ts)> = None;
    let (slot, kind, entry_name, mut chain) = match existing {
        Some(e) => (e.slot, e.kind, e.name, e.chain),
        None => {
            let encoded = encode_name(&key)?;
            let slot = match found.vacant {
                Some(slot) => slot,
                None => {
                    let new_ts = bam.alloc_directory_sector()?.ok_or_else(|| {
                        Error::new(ErrorKind::TooLarge(String::from("directory full")))
                    })?;
                    pending_extension = Some((found.last, new_ts));
                    DirSlot {
                        ts: new_ts,
                        index: 0,
                    }
                }
            };
            // New files are always written closed PRG.
            (slot, FileKind::Prg, encoded, Chain::default())
        }
    };

    if truncate && !chain.sectors.is_empty() {
        for sector in &chain.sectors {
            bam.mark_free(sector.ts)?;
        }
        chain = Chain::default();
    }

    // How much of the data tops up the current last sector, and how
    // many fresh sectors carry the rest.
    let last_used = chain.sectors.last().map(|s| s.data_len).unwrap_or(0);
    let fill_len = if chain.sectors.is_empty() {
        0
    } else {
        (PAYLOAD_LEN - last_used).min(data.len())
    };
    let rest = &data[fill_len..];

    let mut new_sectors: Vec<Ts> = Vec::new();
    for _ in 0..rest.len().div_ceil(PAYLOAD_LEN) {
        let ts = bam
            .alloc_data_sector()?
            .ok_or_else(|| Error::new(ErrorKind::TooLarge(String::from("disk full"))))?;
        new_sectors.push(ts);
    }

    // BAM lands first, then the chain, then the directory.
    bam.flush(&mut io)?;

    if let Some((last, new_ts)) = pending_extension {
        directory::append_sector(&mut io, last, new_ts)?;
    }

    for (i, ts) in new_sectors.iter().enumerate() {
        let chunk = &rest[i * PAYLOAD_LEN..((i + 1) * PAYLOAD_LEN).min(rest.len())];
        let mut sector = [0u8; SECTOR_SIZE];
        if let Some(next) = new_sectors.get(i + 1) {
            sector[0] = next.track;
            sector[1] = next.sector;
        } else {
            sector[0] = 0;
            sector[1] = if chunk.len() == PAYLOAD_LEN {
                0
            } else {
                chunk.len() as u8
            };
        }
        sector[2..2 + chunk.len()].copy_from_slice(chunk);
        io.write_sector(*ts, &sector)?;
    }

    if let Some(last) = chain.sectors.last() {
        if fill_len > 0 {
            io.write_in_sector(last.ts, 2 + last_used, &data[..fill_len])?;
        }
        let link = match new_sectors.first() {
            Some(first) => [first.track, first.sector],
            None => {
                let used = last_used + fill_len;
                [0, if used == PAYLOAD_LEN { 0 } else { used as u8 }]
            }
        };
        io.write_in_sector(last.ts, 0, &link)?;
    }

    let start = chain
        .sectors
        .first()
        .map(|s| s.ts)
        .or_else(|| new_sectors.first().copied())
        .unwrap_or_else(|| Ts::new(0, 0));
    let blocks = (chain.sectors.len() + new_sectors.len()) as u16;
    directory::write_entry(&mut io, slot, kind, start, &entry_name, blocks)?;

    io.sync();
    invalidate(path);
    Ok(data.len())
}

/// Write a byte range into a D64 image; see the crate docs for the
/// append-only contract.
pub fn write_range_d64(
    path: &Path,
    name: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
) -> Result<usize, Error> {
    write_range_flat(
        path,
        name,
        offset,
        data,
        truncate,
        create,
        allow_overwrite,
        Variant::D64,
    )
}

/// Write a byte range into a D71 image.  On a single-sided image the
/// second side never allocates, so large writes run out of room at the
/// 35-track boundary.
pub fn write_range_d71(
    path: &Path,
    name: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
) -> Result<usize, Error> {
    write_range_flat(
        path,
        name,
        offset,
        data,
        truncate,
        create,
        allow_overwrite,
        Variant::D71,
    )
}

fn delete_file_flat(path: &Path, name: &str, variant: Variant) -> Result<(), Error> {
    validate_flat_name(name)?;
    let key = normalize_key(name);

    let mut io = open_rw_expecting(path, variant)?;
    let dir_start = io.geometry().directory_start();
    let mut bam = FlatBam::load(&mut io)?;

    let found = directory::find(&mut io, dir_start, &key)?;
    let (slot, start) = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "cannot delete a partition as a file: {}",
                key
            ))));
        }
        Some((slot, DirEntry::File { start, .. })) => (slot, start),
        _ => {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such file: {}",
                key
            ))));
        }
    };

    let chain = walk_file_chain(&mut io, start)?;
    for sector in &chain.sectors {
        bam.mark_free(sector.ts)?;
    }

    bam.flush(&mut io)?;
    directory::clear_slot(&mut io, slot)?;
    io.sync();
    invalidate(path);
    Ok(())
}

/// Delete a file from a D64 image.
pub fn delete_file_d64(path: &Path, name: &str) -> Result<(), Error> {
    delete_file_flat(path, name, Variant::D64)
}

/// Delete a file from a D71 image.
pub fn delete_file_d71(path: &Path, name: &str) -> Result<(), Error> {
    delete_file_flat(path, name, Variant::D71)
}

fn rename_file_flat(
    path: &Path,
    old: &str,
    new: &str,
    allow_overwrite: bool,
    variant: Variant,
) -> Result<(), Error> {
    validate_flat_name(old)?;
    validate_flat_name(new)?;
    let old_key = normalize_key(old);
    let new_key = normalize_key(new);

    let mut io = open_rw_expecting(path, variant)?;
    let dir_start = io.geometry().directory_start();

    let found = directory::find(&mut io, dir_start, &old_key)?;
    let slot = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "cannot rename a partition as a file: {}",
                old_key
            ))));
        }
        Some((slot, DirEntry::File { .. })) => slot,
        _ => {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such file: {}",
                old_key
            ))));
        }
    };

    if old_key == new_key {
        return Ok(());
    }

    let dest = directory::find(&mut io, dir_start, &new_key)?;
    match dest.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "destination is a partition: {}",
                new_key
            ))));
        }
        Some((dest_slot, DirEntry::File { start, .. })) => {
            if !allow_overwrite {
                return Err(Error::new(ErrorKind::AlreadyExists(format!(
                    "destination exists: {}",
                    new_key
                ))));
            }
            let mut bam = FlatBam::load(&mut io)?;
            let chain = walk_file_chain(&mut io, start)?;
            for sector in &chain.sectors {
                bam.mark_free(sector.ts)?;
            }
            bam.flush(&mut io)?;
            directory::clear_slot(&mut io, dest_slot)?;
        }
        _ => {}
    }

    let encoded = encode_name(&new_key)?;
    directory::write_entry_name(&mut io, slot, &encoded)?;
    io.sync();
    invalidate(path);
    Ok(())
}

/// Rename a file on a D64 image, using the strict name encoding.
pub fn rename_file_d64(
    path: &Path,
    old: &str,
    new: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    rename_file_flat(path, old, new, allow_overwrite, Variant::D64)
}

/// Rename a file on a D71 image.
pub fn rename_file_d71(
    path: &Path,
    old: &str,
    new: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    rename_file_flat(path, old, new, allow_overwrite, Variant::D71)
}

/// Build the bytes of a freshly formatted, empty image of the given
/// family (standard sizes, no error-info region).
///
/// D81 images are formatted by the buffer engine; this covers the flat
/// 1541/1571 families.
pub fn format_blank(variant: Variant, disk_name: &str, disk_id: &str) -> Result<Vec<u8>, Error> {
    let size = match variant {
        Variant::D64 => 174_848,
        Variant::D71 => 349_696,
        Variant::D81 => {
            return Err(Error::new(ErrorKind::BadRequest(String::from(
                "use the D81 engine to format a D81 image",
            ))));
        }
    };
    let geometry = Geometry::detect(size)?;

    let mut buf = vec![0u8; size];
    let header = build_flat_header(variant, geometry, disk_name, disk_id)?;

    let header_offset = geometry.sector_offset(Ts::new(18, 0))?;
    buf[header_offset..header_offset + SECTOR_SIZE].copy_from_slice(&header.0);
    if let Some(secondary) = header.1 {
        let secondary_offset = geometry.sector_offset(Ts::new(53, 0))?;
        buf[secondary_offset..secondary_offset + SECTOR_SIZE].copy_from_slice(&secondary);
    }

    let dir_offset = geometry.sector_offset(Ts::new(18, 1))?;
    buf[dir_offset] = 0;
    buf[dir_offset + 1] = 0xFF;

    Ok(buf)
}

/// The formatted 18/0 sector (and 53/0 for a D71): BAM plus the disk
/// name, id and DOS type fields that share it.
fn build_flat_header(
    variant: Variant,
    geometry: Geometry,
    disk_name: &str,
    disk_id: &str,
) -> Result<([u8; SECTOR_SIZE], Option<[u8; SECTOR_SIZE]>), Error> {
    let name = encode_name_d81(disk_name)?;
    let id: Vec<u8> = disk_id.bytes().take(2).collect();
    if id.len() != 2 {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "disk id must be two characters: {}",
            disk_id
        ))));
    }

    let mut primary;
    let mut secondary = None;
    match variant {
        Variant::D64 => {
            let bam = D64Bam::new_blank(geometry)?;
            primary = *bam.bytes();
        }
        Variant::D71 => {
            let mut bam = D71Bam::new_blank(geometry)?;
            // The whole second BAM track stays reserved, as DOS 3.0
            // formats it.
            bam.set_track_all_used(53)?;
            primary = *bam.primary_bytes();
            secondary = Some(*bam.secondary_bytes());
        }
        Variant::D81 => unreachable!(),
    }

    primary[0x90..0xA0].copy_from_slice(&name);
    primary[0xA0] = 0xA0;
    primary[0xA1] = 0xA0;
    primary[0xA2] = id[0];
    primary[0xA3] = id[1];
    primary[0xA4] = 0xA0;
    primary[0xA5] = b'2';
    primary[0xA6] = b'A';
    primary[0xA7..0xAB].fill(0xA0);

    Ok((primary, secondary))
}

#[cfg(test)]
mod tests {
    use super::{
        delete_file_d64, delete_file_d71, format_blank, rename_file_d64, write_range_d64,
        write_range_d71,
    };
    use crate::disk_format::bam::{BlockMap, D64Bam};
    use crate::disk_format::chain::{ImageBuf, SectorRead};
    use crate::disk_format::geometry::{Ts, Variant};
    use crate::disk_format::image::{load_d64, load_parsed};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn temp_image(variant: Variant) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("Error creating temp dir");
        let name = match variant {
            Variant::D64 => "test.d64",
            Variant::D71 => "test.d71",
            Variant::D81 => unreachable!(),
        };
        let path = dir.path().join(name);
        let bytes = format_blank(variant, "TEST DISK", "CB").expect("Error formatting image");
        std::fs::write(&path, bytes).expect("Error writing image");
        (dir, path)
    }

    /// Assert that every track's free count equals the popcount of its
    /// bitmap.
    fn assert_bam_consistent(path: &std::path::Path) {
        let data = std::fs::read(path).unwrap();
        let mut buf = ImageBuf::new(data).unwrap();
        let tracks = buf.geometry().tracks;
        let variant = buf.geometry().variant;
        let bam = buf.read_sector(Ts::new(18, 0)).unwrap();
        let secondary = if variant == Variant::D71 {
            Some(buf.read_sector(Ts::new(53, 0)).unwrap())
        } else {
            None
        };

        for track in 1..=tracks.min(35) {
            let entry = 0x04 + (track as usize - 1) * 4;
            let bits: u32 = bam[entry + 1..entry + 4].iter().map(|b| b.count_ones()).sum();
            assert_eq!(bam[entry] as u32, bits, "track {}", track);
        }
        if let Some(secondary) = secondary {
            for track in 36..=70u8 {
                let base = (track as usize - 36) * 3;
                let bits: u32 = secondary[base..base + 3].iter().map(|b| b.count_ones()).sum();
                let count = bam[0xDD + track as usize - 36] as u32;
                assert_eq!(count, bits, "track {}", track);
            }
        }
    }

    /// Assert that the set of sectors reachable from the directory
    /// (its own chain plus every file chain, plus the system sectors)
    /// is exactly the set marked used in the BAM.
    fn assert_no_leaks(path: &std::path::Path) {
        let data = std::fs::read(path).unwrap();
        let mut buf = ImageBuf::new(data).unwrap();
        let geometry = *buf.geometry();

        let mut referenced: HashSet<Ts> = HashSet::new();
        referenced.insert(Ts::new(18, 0));
        if geometry.variant == Variant::D71 {
            for sector in 0..geometry.sectors_on_track(53).unwrap() {
                referenced.insert(Ts::new(53, sector));
            }
        }
        let dir_sectors =
            crate::disk_format::chain::collect_chain_sectors(&mut buf, Ts::new(18, 1)).unwrap();
        for (ts, _) in &dir_sectors {
            referenced.insert(*ts);
        }
        let records = crate::disk_format::image::build_records(&mut buf, Ts::new(18, 1)).unwrap();
        for record in &records {
            for sector in &record.chain.sectors {
                assert!(
                    referenced.insert(sector.ts),
                    "sector {} referenced twice",
                    sector.ts
                );
            }
        }

        let bam = match geometry.variant {
            Variant::D64 => D64Bam::load(&mut buf).unwrap(),
            _ => panic!("leak check is for D64 images"),
        };
        for track in 1..=geometry.tracks {
            for sector in 0..geometry.sectors_on_track(track).unwrap() {
                let ts = Ts::new(track, sector);
                let used = !bam.is_free(ts).unwrap();
                assert_eq!(
                    used,
                    referenced.contains(&ts),
                    "BAM/reference mismatch at {}",
                    ts
                );
            }
        }
    }

    /// A fresh zeroed image with a valid empty layout accepts a new
    /// PRG and serves it back.
    #[test]
    fn create_prg_and_read_back() {
        let (_dir, path) = temp_image(Variant::D64);
        let payload = [
            0x01, 0x08, 0x0B, 0x08, 0x0A, 0x00, 0x9E, 0x32, 0x30, 0x36, 0x31, 0x00, 0x00, 0x00,
        ];

        let written = write_range_d64(&path, "HELLO", 0, &payload, true, true, true).unwrap();
        assert_eq!(written, 14);

        let image = load_d64(&path).unwrap();
        let record = image.lookup("HELLO").unwrap();
        assert_eq!(record.kind.tag(), "PRG");
        assert_eq!(record.size, 14);
        assert_eq!(record.blocks, 1);
        assert_eq!(image.read_range(record, 0, 14).unwrap(), payload);

        assert_bam_consistent(&path);
        assert_no_leaks(&path);
    }

    #[test]
    fn delete_returns_blocks_to_the_bam() {
        let (_dir, path) = temp_image(Variant::D64);
        write_range_d64(&path, "HELLO", 0, &[1, 2, 3], true, true, true).unwrap();

        let before = load_parsed(&path).unwrap().info.blocks_free;
        delete_file_d64(&path, "HELLO").unwrap();

        let parsed = load_parsed(&path).unwrap();
        assert!(parsed.lookup("HELLO").is_none());
        assert_eq!(parsed.info.blocks_free, before + 1);
        assert_bam_consistent(&path);
        assert_no_leaks(&path);
    }

    /// Property: write-then-read round trips across the sector-size
    /// boundaries.
    #[test]
    fn round_trip_boundary_sizes() {
        for n in [0usize, 1, 253, 254, 255, 508, 100_000] {
            let (_dir, path) = temp_image(Variant::D64);
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();

            write_range_d64(&path, "DATA", 0, &payload, true, true, true).unwrap();

            let image = load_d64(&path).unwrap();
            let record = image.lookup("DATA").unwrap();
            assert_eq!(record.size, n, "size for n={}", n);
            assert_eq!(image.read_range(record, 0, n).unwrap(), payload, "n={}", n);
            assert_bam_consistent(&path);
        }
    }

    /// Property: writing a whole buffer equals writing a prefix and
    /// appending the rest, in content and block count.
    #[test]
    fn append_associativity() {
        let a: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let b: Vec<u8> = (0..500).map(|i| ((i * 7) % 256) as u8).collect();

        let (_dir1, split_path) = temp_image(Variant::D64);
        write_range_d64(&split_path, "LOG", 0, &a, true, true, true).unwrap();
        write_range_d64(&split_path, "LOG", a.len(), &b, false, false, false).unwrap();

        let (_dir2, whole_path) = temp_image(Variant::D64);
        let joined: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        write_range_d64(&whole_path, "LOG", 0, &joined, true, true, true).unwrap();

        let split = load_d64(&split_path).unwrap();
        let whole = load_d64(&whole_path).unwrap();
        let split_record = split.lookup("LOG").unwrap();
        let whole_record = whole.lookup("LOG").unwrap();

        assert_eq!(split_record.size, whole_record.size);
        assert_eq!(split_record.blocks, whole_record.blocks);
        assert_eq!(
            split.read_range(split_record, 0, split_record.size).unwrap(),
            whole.read_range(whole_record, 0, whole_record.size).unwrap()
        );
    }

    /// A truncating write followed by an exact-end append: one full
    /// block of 'A', ten bytes of 'B'.
    #[test]
    fn append_after_truncate() {
        let (_dir, path) = temp_image(Variant::D64);

        write_range_d64(&path, "LOG", 0, &[b'A'; 254], true, true, true).unwrap();
        let image = load_d64(&path).unwrap();
        assert_eq!(image.lookup("LOG").unwrap().blocks, 1);

        write_range_d64(&path, "LOG", 254, &[b'B'; 10], false, false, false).unwrap();

        let image = load_d64(&path).unwrap();
        let record = image.lookup("LOG").unwrap();
        assert_eq!(record.size, 264);
        assert_eq!(record.blocks, 2);

        let contents = image.read_range(record, 0, 264).unwrap();
        assert!(contents[..254].iter().all(|&b| b == b'A'));
        assert!(contents[254..].iter().all(|&b| b == b'B'));
        assert_bam_consistent(&path);
        assert_no_leaks(&path);
    }

    #[test]
    fn write_rule_table_boundaries() {
        let (_dir, path) = temp_image(Variant::D64);
        write_range_d64(&path, "LOG", 0, b"payload", true, true, true).unwrap();

        // Overwrite refusal without truncate.
        let err = write_range_d64(&path, "LOG", 0, b"X", false, false, false).unwrap_err();
        assert_eq!(err.status(), 4);

        // Truncating away from offset 0.
        let err = write_range_d64(&path, "LOG", 1, b"X", true, true, true).unwrap_err();
        assert_eq!(err.status(), 8);

        // Truncate of an existing file needs the overwrite permission.
        let err = write_range_d64(&path, "LOG", 0, b"X", true, true, false).unwrap_err();
        assert_eq!(err.status(), 6);

        // Append at the wrong offset.
        let err = write_range_d64(&path, "LOG", 3, b"X", false, false, false).unwrap_err();
        assert_eq!(err.status(), 8);

        // Missing file without create.
        let err = write_range_d64(&path, "NOPE", 0, b"X", false, false, false).unwrap_err();
        assert_eq!(err.status(), 1);

        // Creating at a nonzero offset.
        let err = write_range_d64(&path, "NEW", 5, b"X", false, true, false).unwrap_err();
        assert_eq!(err.status(), 8);

        // Wildcards never reach the directory.
        let err = write_range_d64(&path, "BAD*", 0, b"X", true, true, true).unwrap_err();
        assert_eq!(err.status(), 12);

        // Path separators mean subdirectories, which do not exist here.
        let err = write_range_d64(&path, "A/B", 0, b"X", true, true, true).unwrap_err();
        assert_eq!(err.status(), 10);
    }

    #[test]
    fn rename_in_place() {
        let (_dir, path) = temp_image(Variant::D64);
        write_range_d64(&path, "OLD", 0, b"data", true, true, true).unwrap();
        write_range_d64(&path, "OTHER", 0, b"other", true, true, true).unwrap();

        // Destination collision without permission.
        let err = rename_file_d64(&path, "OLD", "OTHER", false).unwrap_err();
        assert_eq!(err.status(), 4);

        // Renaming onto itself is a no-op.
        rename_file_d64(&path, "OLD", "old", false).unwrap();

        rename_file_d64(&path, "OLD", "NEW", false).unwrap();
        let image = load_d64(&path).unwrap();
        assert!(image.lookup("OLD").is_err());
        assert_eq!(image.lookup("NEW").unwrap().size, 4);

        // Overwriting rename frees the destination's chain.
        rename_file_d64(&path, "NEW", "OTHER", true).unwrap();
        let image = load_d64(&path).unwrap();
        let record = image.lookup("OTHER").unwrap();
        assert_eq!(image.read_range(record, 0, 4).unwrap(), b"data");
        assert_bam_consistent(&path);
        assert_no_leaks(&path);
    }

    #[test]
    fn missing_delete_is_not_found() {
        let (_dir, path) = temp_image(Variant::D64);
        let err = delete_file_d64(&path, "GHOST").unwrap_err();
        assert_eq!(err.status(), 1);
    }

    /// Writes on a single-sided D71 stay below track 36 and run out of
    /// room at the side boundary.
    #[test]
    fn single_sided_d71_confines_allocation() {
        let (_dir, path) = temp_image(Variant::D71);

        // Clear the double-sided flag the formatter set.
        let mut data = std::fs::read(&path).unwrap();
        let buf = ImageBuf::new(data.clone()).unwrap();
        let offset = buf.geometry().sector_offset(Ts::new(18, 0)).unwrap();
        data[offset + 3] = 0;
        std::fs::write(&path, &data).unwrap();

        // One side minus the directory track holds well under 200 KB.
        let payload = vec![0x55u8; 200_000];
        let err = write_range_d71(&path, "BIG", 0, &payload, true, true, true).unwrap_err();
        assert_eq!(err.status(), 9);

        // A small write works and lands on the first side.
        write_range_d71(&path, "SMALL", 0, b"fits", true, true, true).unwrap();
        let parsed = load_parsed(&path).unwrap();
        let record = parsed.lookup("SMALL").unwrap();
        assert!(record.start.track <= 35);
        assert_bam_consistent(&path);
    }

    #[test]
    fn double_sided_d71_uses_both_sides() {
        let (_dir, path) = temp_image(Variant::D71);

        let payload = vec![0x55u8; 200_000];
        write_range_d71(&path, "BIG", 0, &payload, true, true, true).unwrap();

        let parsed = load_parsed(&path).unwrap();
        let record = parsed.lookup("BIG").unwrap();
        assert_eq!(record.size, 200_000);
        assert!(record.chain.sectors.iter().any(|s| s.ts.track > 35));
        assert_bam_consistent(&path);

        delete_file_d71(&path, "BIG").unwrap();
        assert_bam_consistent(&path);
    }

    /// The directory chain grows onto track 18 once all eight slots of
    /// 18/1 are taken, at sector 2 first.
    #[test]
    fn directory_extension_uses_the_system_track() {
        let (_dir, path) = temp_image(Variant::D64);

        for i in 0..9 {
            let name = format!("FILE{}", i);
            write_range_d64(&path, &name, 0, b"x", true, true, true).unwrap();
        }

        let data = std::fs::read(&path).unwrap();
        let mut buf = ImageBuf::new(data).unwrap();
        let first = buf.read_sector(Ts::new(18, 1)).unwrap();
        assert_eq!((first[0], first[1]), (18, 2));

        let parsed = load_parsed(&path).unwrap();
        assert_eq!(parsed.files.len(), 9);
        assert_bam_consistent(&path);
        assert_no_leaks(&path);
    }

    /// An empty write creates a zero-byte file: no chain, no blocks.
    #[test]
    fn empty_file_has_no_chain() {
        let (_dir, path) = temp_image(Variant::D64);
        write_range_d64(&path, "EMPTY", 0, &[], true, true, true).unwrap();

        let image = load_d64(&path).unwrap();
        let record = image.lookup("EMPTY").unwrap();
        assert_eq!(record.size, 0);
        assert_eq!(record.blocks, 0);
        assert_eq!(record.start.track, 0);
        assert_eq!(image.read_range(record, 0, 0).unwrap(), Vec::<u8>::new());

        // And it can be appended to from offset 0.
        write_range_d64(&path, "EMPTY", 0, b"grown", false, false, false).unwrap();
        let image = load_d64(&path).unwrap();
        assert_eq!(image.lookup("EMPTY").unwrap().size, 5);
        assert_no_leaks(&path);
    }
}
