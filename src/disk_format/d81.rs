//! The D81 file engine
//!
//! Unlike the in-place D64/D71 engine, every D81 mutation is staged in
//! a whole-image buffer and swapped onto disk with an atomic rename,
//! so interrupted writes leave either the old image or the new one.
//!
//! The same machinery serves the flat root and the interior of any
//! partition: a [`DirCtx`] names the directory chain to operate on and
//! the track range its BAM may allocate from.  A write that runs out
//! of room surfaces "disk full" (status 9), which the public entry
//! points escalate to a whole-image re-pack.

use std::path::Path;

use crate::cache;
use crate::disk_format::bam::{BlockMap, D81Bam};
use crate::disk_format::chain::{
    walk_file_chain, Chain, ImageBuf, SectorRead, SectorWrite, PAYLOAD_LEN,
};
use crate::disk_format::d64::check_write_rules;
use crate::disk_format::directory::{self, DirEntry, DirSlot, FileKind};
use crate::disk_format::geometry::{Ts, Variant, SECTOR_SIZE};
use crate::disk_format::partition;
use crate::disk_format::petscii::{encode_name_d81, has_wildcard, normalize_key, NAME_LEN, PAD};
use crate::error::{Error, ErrorKind};
use crate::file::{atomic_write, read_file};

/// A directory to operate on: its first directory sector, the track
/// that holds its header/BAM, and the track range its BAM allocates
/// from.  The root is `40/3` over tracks 1-80; a partition is
/// `first/3` over its own contiguous range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DirCtx {
    /// First directory sector.
    pub dir_start: Ts,
    /// Track holding the header, BAM and first directory sector.
    pub base: u8,
    /// First track of the allocation range.
    pub lo: u8,
    /// Last track of the allocation range.
    pub hi: u8,
}

impl DirCtx {
    /// The root directory context.
    pub fn root() -> DirCtx {
        DirCtx {
            dir_start: Ts::new(40, 3),
            base: 40,
            lo: 1,
            hi: 80,
        }
    }

    pub fn bam(&self, buf: &mut ImageBuf) -> Result<D81Bam, Error> {
        D81Bam::load(buf, self.base, self.lo, self.hi)
    }
}

/// Split an inner path into normalized segments, rejecting wildcards.
pub(crate) fn split_inner_path(inner: &str) -> Result<Vec<String>, Error> {
    if has_wildcard(inner) {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "wildcard in write path: {}",
            inner
        ))));
    }
    let segments: Vec<String> = inner
        .split('/')
        .filter(|s| !s.is_empty())
        .map(normalize_key)
        .collect();
    Ok(segments)
}

/// Split an inner path into (directory segments, file name).
pub(crate) fn split_file_path(inner: &str) -> Result<(Vec<String>, String), Error> {
    let mut segments = split_inner_path(inner)?;
    let name = segments.pop().ok_or_else(|| {
        Error::new(ErrorKind::BadRequest(format!("empty inner path: {}", inner)))
    })?;
    Ok((segments, name))
}

pub(crate) fn open_buffer(path: &Path) -> Result<(Vec<u8>, ImageBuf), Error> {
    let original = read_file(path)?;
    let buf = ImageBuf::new(original.clone())?;
    if buf.geometry().variant != Variant::D81 {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "image is {}, not D81",
            buf.geometry().variant
        ))));
    }
    Ok((original, buf))
}

pub(crate) fn commit(path: &Path, buf: &ImageBuf) -> Result<(), Error> {
    atomic_write(path, buf.bytes())?;
    if let Ok(canonical) = path.canonicalize() {
        cache::invalidate(&canonical);
    }
    Ok(())
}

/// Collect a walked chain's payload out of the buffer.
pub(crate) fn read_chain_data(buf: &mut ImageBuf, chain: &Chain) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(chain.size);
    for sector in &chain.sectors {
        let data = buf.sector(sector.ts)?;
        out.extend_from_slice(&data[2..2 + sector.data_len]);
    }
    Ok(out)
}

/// Write a file's payload as a fresh chain, allocating through the
/// context's BAM.  Returns the first sector and the block count.
///
/// An empty payload still claims one sector, written with link bytes
/// `00 00`: the single-sector empty-file convention of this format
/// family (which readers see as a full 254-byte block).
pub(crate) fn write_new_chain(
    buf: &mut ImageBuf,
    bam: &mut D81Bam,
    data: &[u8],
) -> Result<(Ts, u16), Error> {
    let count = data.len().div_ceil(PAYLOAD_LEN).max(1);
    let mut sectors = Vec::with_capacity(count);
    for _ in 0..count {
        let ts = bam
            .alloc_data_sector()?
            .ok_or_else(|| Error::new(ErrorKind::TooLarge(String::from("disk full"))))?;
        sectors.push(ts);
    }

    for (i, ts) in sectors.iter().enumerate() {
        let chunk = &data[(i * PAYLOAD_LEN).min(data.len())..((i + 1) * PAYLOAD_LEN).min(data.len())];
        let mut sector = [0u8; SECTOR_SIZE];
        if let Some(next) = sectors.get(i + 1) {
            sector[0] = next.track;
            sector[1] = next.sector;
        } else {
            sector[0] = 0;
            sector[1] = if chunk.len() == PAYLOAD_LEN || chunk.is_empty() {
                0
            } else {
                chunk.len() as u8
            };
        }
        sector[2..2 + chunk.len()].copy_from_slice(chunk);
        buf.write_sector(*ts, &sector)?;
    }

    Ok((sectors[0], sectors.len() as u16))
}

/// Find a vacant slot in the context's directory, extending the chain
/// on the system track if every slot is taken.
pub(crate) fn claim_slot(
    buf: &mut ImageBuf,
    bam: &mut D81Bam,
    vacant: Option<DirSlot>,
    last: Ts,
) -> Result<DirSlot, Error> {
    match vacant {
        Some(slot) => Ok(slot),
        None => {
            let new_ts = bam
                .alloc_directory_sector()?
                .ok_or_else(|| Error::new(ErrorKind::TooLarge(String::from("directory full"))))?;
            directory::append_sector(buf, last, new_ts)?;
            Ok(DirSlot {
                ts: new_ts,
                index: 0,
            })
        }
    }
}

/// The write-range operation against one directory context.  Errors
/// with status 9 mean the context is out of room and a re-pack may
/// still satisfy the write.
pub(crate) fn write_in_ctx(
    buf: &mut ImageBuf,
    ctx: &DirCtx,
    name: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
) -> Result<usize, Error> {
    let key = normalize_key(name);
    let mut bam = ctx.bam(buf)?;

    let found = directory::find(buf, ctx.dir_start, &key)?;
    let existing = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "cannot write to a directory: {}",
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
            let chain = walk_file_chain(buf, start)?;
            Some((slot, kind, name, chain))
        }
        _ => None,
    };

    let exists = existing.is_some();
    let cur_size = existing.as_ref().map(|e| e.3.size).unwrap_or(0);
    check_write_rules(
        offset,
        data.len(),
        truncate,
        create,
        allow_overwrite,
        exists,
        cur_size,
    )?;

    let (slot, kind, entry_name, mut chain) = match existing {
        Some((slot, kind, name, chain)) => (slot, kind, name, chain),
        None => {
            let encoded = encode_name_d81(&key)?;
            let slot = claim_slot(buf, &mut bam, found.vacant, found.last)?;
            (slot, FileKind::Prg, encoded, Chain::default())
        }
    };

    if truncate && !chain.sectors.is_empty() {
        for sector in &chain.sectors {
            bam.mark_free(sector.ts)?;
        }
        chain = Chain::default();
    }

    let (start, blocks) = if chain.sectors.is_empty() {
        write_new_chain(buf, &mut bam, data)?
    } else {
        // Append: top up the last sector, then hang fresh sectors off
        // it.
        let last = chain.sectors[chain.sectors.len() - 1];
        let last_used = last.data_len;
        let fill_len = (PAYLOAD_LEN - last_used).min(data.len());
        let rest = &data[fill_len..];

        let mut new_sectors = Vec::new();
        for _ in 0..rest.len().div_ceil(PAYLOAD_LEN) {
            let ts = bam
                .alloc_data_sector()?
                .ok_or_else(|| Error::new(ErrorKind::TooLarge(String::from("disk full"))))?;
            new_sectors.push(ts);
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
            buf.write_sector(*ts, &sector)?;
        }

        if fill_len > 0 {
            buf.write_in_sector(last.ts, 2 + last_used, &data[..fill_len])?;
        }
        let link = match new_sectors.first() {
            Some(first) => [first.track, first.sector],
            None => {
                let used = last_used + fill_len;
                [0, if used == PAYLOAD_LEN { 0 } else { used as u8 }]
            }
        };
        buf.write_in_sector(last.ts, 0, &link)?;

        (
            chain.sectors[0].ts,
            (chain.sectors.len() + new_sectors.len()) as u16,
        )
    };

    bam.flush(buf)?;
    directory::write_entry(buf, slot, kind, start, &entry_name, blocks)?;
    Ok(data.len())
}

/// Delete a file inside one directory context.
pub(crate) fn delete_in_ctx(buf: &mut ImageBuf, ctx: &DirCtx, name: &str) -> Result<(), Error> {
    let key = normalize_key(name);
    let mut bam = ctx.bam(buf)?;

    let found = directory::find(buf, ctx.dir_start, &key)?;
    let (slot, start) = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "cannot delete a directory as a file: {}",
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

    let chain = walk_file_chain(buf, start)?;
    for sector in &chain.sectors {
        bam.mark_free(sector.ts)?;
    }
    bam.flush(buf)?;
    directory::clear_slot(buf, slot)
}

/// Rename a file within one directory context, permissive encoding.
pub(crate) fn rename_in_ctx(
    buf: &mut ImageBuf,
    ctx: &DirCtx,
    old: &str,
    new: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    let old_key = normalize_key(old);
    let new_key = normalize_key(new);

    let found = directory::find(buf, ctx.dir_start, &old_key)?;
    let slot = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "use the directory rename for: {}",
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

    let dest = directory::find(buf, ctx.dir_start, &new_key)?;
    match dest.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "destination is a directory: {}",
                new_key
            ))));
        }
        Some((_, DirEntry::File { .. })) => {
            if !allow_overwrite {
                return Err(Error::new(ErrorKind::AlreadyExists(format!(
                    "destination exists: {}",
                    new_key
                ))));
            }
            delete_in_ctx(buf, ctx, &new_key)?;
        }
        _ => {}
    }

    let encoded = encode_name_d81(&new_key)?;
    directory::write_entry_name(buf, slot, &encoded)
}

/// Write a byte range into a D81 image.  `inner_path` may descend into
/// partitions with `/`; a write that does not fit in place triggers a
/// whole-image re-pack.
pub fn write_range_d81(
    path: &Path,
    inner_path: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
) -> Result<usize, Error> {
    let (dirs, name) = split_file_path(inner_path)?;
    let (original, mut buf) = open_buffer(path)?;

    let ctx = partition::resolve_ctx(&mut buf, &dirs)?;
    match write_in_ctx(
        &mut buf,
        &ctx,
        &name,
        offset,
        data,
        truncate,
        create,
        allow_overwrite,
    ) {
        Ok(written) => {
            commit(path, &buf)?;
            Ok(written)
        }
        Err(e) if e.status() == 9 => {
            // Out of room in place: rebuild the tree with enough track
            // budget and try again.
            let rebuilt = partition::repack_write(
                &original,
                &dirs,
                &name,
                offset,
                data,
                truncate,
                create,
                allow_overwrite,
            )?;
            commit(path, &rebuilt)?;
            Ok(data.len())
        }
        Err(e) => Err(e),
    }
}

/// Delete a file from a D81 image.
pub fn delete_file_d81(path: &Path, inner_path: &str) -> Result<(), Error> {
    let (dirs, name) = split_file_path(inner_path)?;
    let (_original, mut buf) = open_buffer(path)?;

    let ctx = partition::resolve_ctx(&mut buf, &dirs)?;
    delete_in_ctx(&mut buf, &ctx, &name)?;
    commit(path, &buf)
}

/// Rename or move a file on a D81 image.  A destination in a different
/// directory is a cross-partition move; when the destination is out of
/// room the move is replayed through a re-pack of the original image.
pub fn rename_file_d81(
    path: &Path,
    old: &str,
    new: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    let (old_dirs, old_name) = split_file_path(old)?;
    let (new_dirs, new_name) = split_file_path(new)?;
    let (original, mut buf) = open_buffer(path)?;

    if old_dirs == new_dirs {
        let ctx = partition::resolve_ctx(&mut buf, &old_dirs)?;
        rename_in_ctx(&mut buf, &ctx, &old_name, &new_name, allow_overwrite)?;
        return commit(path, &buf);
    }

    match move_across(
        &mut buf,
        &old_dirs,
        &old_name,
        &new_dirs,
        &new_name,
        allow_overwrite,
    ) {
        Ok(()) => commit(path, &buf),
        Err(e) if e.status() == 9 => {
            // The destination partition is full in place; a re-pack of
            // the original image can grow it.
            let rebuilt = partition::repack_move(
                &original,
                &old_dirs,
                &old_name,
                &new_dirs,
                &new_name,
                allow_overwrite,
            )?;
            commit(path, &rebuilt)
        }
        Err(e) => Err(e),
    }
}

/// In-place cross-directory move: copy the payload into the
/// destination, then drop the source entry.
fn move_across(
    buf: &mut ImageBuf,
    old_dirs: &[String],
    old_name: &str,
    new_dirs: &[String],
    new_name: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    let old_ctx = partition::resolve_ctx(buf, old_dirs)?;
    let new_ctx = partition::resolve_ctx(buf, new_dirs)?;

    let old_key = normalize_key(old_name);
    let found = directory::find(buf, old_ctx.dir_start, &old_key)?;
    let (src_slot, src_kind, start) = match found.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::Unsupported(format!(
                "moving a partition is not supported: {}",
                old_key
            ))));
        }
        Some((slot, DirEntry::File { kind, start, .. })) => (slot, kind, start),
        _ => {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such file: {}",
                old_key
            ))));
        }
    };
    let src_chain = walk_file_chain(buf, start)?;
    let payload = read_chain_data(buf, &src_chain)?;

    let new_key = normalize_key(new_name);
    let dest = directory::find(buf, new_ctx.dir_start, &new_key)?;
    match dest.matched {
        Some((_, DirEntry::Partition { .. })) => {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "destination is a directory: {}",
                new_key
            ))));
        }
        Some((_, DirEntry::File { .. })) => {
            if !allow_overwrite {
                return Err(Error::new(ErrorKind::AlreadyExists(format!(
                    "destination exists: {}",
                    new_key
                ))));
            }
            delete_in_ctx(buf, &new_ctx, &new_key)?;
        }
        _ => {}
    }

    // Destination first: if it cannot fit, the source must survive.
    let mut dest_bam = new_ctx.bam(buf)?;
    let (dest_start, blocks) = write_new_chain(buf, &mut dest_bam, &payload)?;
    let dest_found = directory::find(buf, new_ctx.dir_start, &new_key)?;
    let dest_slot = claim_slot(buf, &mut dest_bam, dest_found.vacant, dest_found.last)?;
    dest_bam.flush(buf)?;
    let encoded = encode_name_d81(&new_key)?;
    directory::write_entry(buf, dest_slot, src_kind, dest_start, &encoded, blocks)?;

    let mut src_bam = old_ctx.bam(buf)?;
    for sector in &src_chain.sectors {
        src_bam.mark_free(sector.ts)?;
    }
    src_bam.flush(buf)?;
    directory::clear_slot(buf, src_slot)
}

/// Build the bytes of a freshly formatted, empty D81 image.
pub fn format_blank_d81(disk_name: &str, disk_id: &str) -> Result<Vec<u8>, Error> {
    let name = encode_name_d81(disk_name)?;
    let id: Vec<u8> = disk_id.bytes().take(2).collect();
    if id.len() != 2 {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "disk id must be two characters: {}",
            disk_id
        ))));
    }

    let mut buf = ImageBuf::new(vec![0u8; 819_200])?;
    write_root_header(&mut buf, &name, [id[0], id[1]])?;

    let mut bam = D81Bam::new_blank(40, 1, 80, [id[0], id[1]]);
    for track in 1..=80u8 {
        if track != 40 {
            bam.set_track_all_free(track)?;
        }
    }
    // Track 40: header, both BAM sectors and the first directory
    // sector used, the rest available for directory growth.
    bam.set_track_all_free(40)?;
    for sector in 0..4u8 {
        bam.mark_used(Ts::new(40, sector))?;
    }
    bam.flush(&mut buf)?;

    let dir = buf.sector_mut(Ts::new(40, 3))?;
    dir[0] = 0;
    dir[1] = 0xFF;

    Ok(buf.into_bytes())
}

/// Write a 1581 directory header sector: link to the first directory
/// sector, the 'D' format marker, and the name/id/DOS fields.
pub(crate) fn write_header_sector(
    buf: &mut ImageBuf,
    at: Ts,
    first_dir: Ts,
    name: &[u8; NAME_LEN],
    disk_id: [u8; 2],
) -> Result<(), Error> {
    let mut header = [0u8; SECTOR_SIZE];
    header[0] = first_dir.track;
    header[1] = first_dir.sector;
    header[2] = b'D';
    header[4..4 + NAME_LEN].copy_from_slice(name);
    header[0x14] = PAD;
    header[0x15] = PAD;
    header[0x16] = disk_id[0];
    header[0x17] = disk_id[1];
    header[0x18] = PAD;
    header[0x19] = b'3';
    header[0x1A] = b'D';
    header[0x1B] = PAD;
    header[0x1C] = PAD;
    buf.write_sector(at, &header)
}

fn write_root_header(buf: &mut ImageBuf, name: &[u8; NAME_LEN], disk_id: [u8; 2]) -> Result<(), Error> {
    write_header_sector(buf, Ts::new(40, 0), Ts::new(40, 3), name, disk_id)
}

#[cfg(test)]
mod tests {
    use super::{delete_file_d81, format_blank_d81, rename_file_d81, write_range_d81};
    use crate::disk_format::geometry::Variant;
    use crate::disk_format::image::{load_d81, load_parsed};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn temp_d81() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("Error creating temp dir");
        let path = dir.path().join("test.d81");
        let bytes = format_blank_d81("TEST 1581", "CB").expect("Error formatting image");
        std::fs::write(&path, bytes).expect("Error writing image");
        (dir, path)
    }

    #[test]
    fn formatted_image_parses_as_empty() {
        let (_dir, path) = temp_d81();
        let parsed = load_parsed(&path).unwrap();
        assert_eq!(parsed.geometry.variant, Variant::D81);
        assert_eq!(parsed.info.name, "TEST 1581");
        assert_eq!(parsed.info.disk_id, "CB");
        assert_eq!(parsed.info.dos_type, "3D");
        assert_eq!(parsed.info.blocks_free, 79 * 40);
        assert!(parsed.files.is_empty());
    }

    #[test]
    fn root_write_and_read_back() {
        let (_dir, path) = temp_d81();
        let payload: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();

        let written = write_range_d81(&path, "DATA", 0, &payload, true, true, true).unwrap();
        assert_eq!(written, 5000);

        let image = load_d81(&path).unwrap();
        let record = image.lookup("DATA").unwrap();
        assert_eq!(record.size, 5000);
        assert_eq!(image.read_range(record, 0, 5000).unwrap(), payload);

        // File data never lands on the system track.
        assert!(record.chain.sectors.iter().all(|s| s.ts.track != 40));
    }

    #[test]
    fn root_append_only_contract_holds() {
        let (_dir, path) = temp_d81();
        write_range_d81(&path, "LOG", 0, &[b'A'; 254], true, true, true).unwrap();
        write_range_d81(&path, "LOG", 254, &[b'B'; 10], false, false, false).unwrap();

        let image = load_d81(&path).unwrap();
        let record = image.lookup("LOG").unwrap();
        assert_eq!(record.size, 264);
        assert_eq!(record.blocks, 2);

        let err = write_range_d81(&path, "LOG", 0, b"X", false, false, false).unwrap_err();
        assert_eq!(err.status(), 4);
        let err = write_range_d81(&path, "LOG", 100, b"X", false, false, false).unwrap_err();
        assert_eq!(err.status(), 8);
    }

    /// The single-sector empty-file convention: link bytes 00 00,
    /// which readers see as a full 254-byte block.
    #[test]
    fn empty_file_writes_the_sentinel_sector() {
        let (_dir, path) = temp_d81();
        write_range_d81(&path, "EMPTY", 0, &[], true, true, true).unwrap();

        let image = load_d81(&path).unwrap();
        let record = image.lookup("EMPTY").unwrap();
        assert_eq!(record.blocks, 1);
        assert_eq!(record.size, 254);

        let data = std::fs::read(&path).unwrap();
        let buf = super::ImageBuf::new(data).unwrap();
        let sector = buf.sector(record.start).unwrap();
        assert_eq!((sector[0], sector[1]), (0, 0));
        assert!(sector[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn delete_and_rename_in_root() {
        let (_dir, path) = temp_d81();
        write_range_d81(&path, "ONE", 0, b"one", true, true, true).unwrap();
        write_range_d81(&path, "TWO", 0, b"two", true, true, true).unwrap();

        rename_file_d81(&path, "ONE", "FIRST", false).unwrap();
        let image = load_d81(&path).unwrap();
        assert!(image.lookup("ONE").is_err());
        assert_eq!(image.lookup("FIRST").unwrap().size, 3);

        let err = rename_file_d81(&path, "FIRST", "TWO", false).unwrap_err();
        assert_eq!(err.status(), 4);
        rename_file_d81(&path, "FIRST", "TWO", true).unwrap();

        let image = load_d81(&path).unwrap();
        let record = image.lookup("TWO").unwrap();
        assert_eq!(image.read_range(record, 0, 3).unwrap(), b"one");

        delete_file_d81(&path, "TWO").unwrap();
        let image = load_d81(&path).unwrap();
        assert!(image.lookup("TWO").is_err());
    }

    #[test]
    fn wildcards_are_rejected_in_write_paths() {
        let (_dir, path) = temp_d81();
        let err = write_range_d81(&path, "BAD*", 0, b"X", true, true, true).unwrap_err();
        assert_eq!(err.status(), 12);
        let err = delete_file_d81(&path, "WHAT?").unwrap_err();
        assert_eq!(err.status(), 12);
    }

    /// Writing below an image of the wrong family is a bad request.
    #[test]
    fn wrong_variant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.d81");
        let bytes =
            crate::disk_format::d64::format_blank(Variant::D64, "WRONG", "XX").unwrap();
        std::fs::write(&path, bytes).unwrap();

        let err = write_range_d81(&path, "X", 0, b"x", true, true, true).unwrap_err();
        assert_eq!(err.status(), 12);
    }

    #[test]
    fn error_info_region_is_preserved() {
        let (_dir, path) = temp_d81();

        // Graft a recognizable error-info region onto the image.
        let mut data = std::fs::read(&path).unwrap();
        data.extend(std::iter::repeat(0xEE).take(3200));
        std::fs::write(&path, &data).unwrap();

        write_range_d81(&path, "DATA", 0, b"payload", true, true, true).unwrap();

        let after = std::fs::read(&path).unwrap();
        assert_eq!(after.len(), 822_400);
        assert!(after[819_200..].iter().all(|&b| b == 0xEE));

        // The trailing region also survives further mutations.
        crate::disk_format::partition::mkdir_d81(&path, "SUB", false).unwrap();
        let after = std::fs::read(&path).unwrap();
        assert!(after[819_200..].iter().all(|&b| b == 0xEE));
        assert_eq!(
            load_parsed(&path).unwrap().geometry.error_info_len,
            3200
        );
    }
}
