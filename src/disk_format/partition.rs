//! The D81 partition tree engine
//!
//! 1581 "subdirectories" are CBM partitions: a directory entry of type
//! CBM or DIR pointing at a header sector (byte 2 = `'D'`) whose link
//! bytes lead to the partition's first directory sector.  Every
//! partition owns a contiguous track range; nested partitions live
//! inside their parent's range.
//!
//! Operations are attempted in place first.  When a partition is out
//! of room, the whole image is rebuilt: the directory tree is read
//! into memory, mutated, given a fresh track budget per node, and laid
//! back out from scratch (a re-pack), then swapped onto disk
//! atomically.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;

use log::debug;

use crate::disk_format::bam::{BlockMap, D81Bam};
use crate::disk_format::chain::{
    walk_file_chain, ImageBuf, SectorRead, SectorWrite, PAYLOAD_LEN,
};
use crate::disk_format::d64::check_write_rules;
use crate::disk_format::d81::{
    claim_slot, commit, open_buffer, read_chain_data, split_inner_path, write_header_sector,
    write_new_chain, DirCtx,
};
use crate::disk_format::directory::{self, DirEntry, FileKind};
use crate::disk_format::geometry::{Ts, SECTOR_SIZE};
use crate::disk_format::petscii::{decode_name, encode_name_d81, normalize_key};
use crate::error::{Error, ErrorKind};

/// Spare tracks budgeted per partition beyond its current contents,
/// absorbing directory growth without an immediate re-pack.
const TRACK_BUFFER: usize = 1;

/// Minimum tracks a partition occupies.
const MIN_PARTITION_TRACKS: usize = 3;

/// Maximum tracks a partition can occupy (it must stay contiguous and
/// a contiguous run can never cross track 40).
const MAX_PARTITION_TRACKS: usize = 40;

/// A file held in the in-memory tree.
#[derive(Clone, Debug)]
pub struct TreeFile {
    /// The normalized name.
    pub name: String,
    /// The file type (new files are PRG).
    pub kind: FileKind,
    /// The full payload.
    pub data: Vec<u8>,
}

impl TreeFile {
    fn sectors(&self) -> usize {
        self.data.len().div_ceil(PAYLOAD_LEN).max(1)
    }
}

/// A directory (the root or a partition) held in the in-memory tree.
#[derive(Clone, Debug, Default)]
pub struct TreeDir {
    /// The normalized name (empty for the root).
    pub name: String,
    /// Entry type used when the directory is written back.
    pub kind: Option<FileKind>,
    /// Files by normalized name.
    pub files: BTreeMap<String, TreeFile>,
    /// Child partitions by normalized name.
    pub dirs: BTreeMap<String, TreeDir>,
    /// Track budget assigned by [`assign_track_budgets`].
    pub required_tracks: u8,
}

impl TreeDir {
    fn new(name: &str, kind: FileKind) -> TreeDir {
        TreeDir {
            name: String::from(name),
            kind: Some(kind),
            ..TreeDir::default()
        }
    }

    fn file_sectors(&self) -> usize {
        self.files.values().map(TreeFile::sectors).sum()
    }
}

/// Read a partition entry's header sector and derive its directory
/// context.  The entry's block count records the partition's sector
/// count, which fixes its track range.
pub(crate) fn partition_ctx(buf: &mut ImageBuf, start: Ts, blocks: u16) -> Result<DirCtx, Error> {
    let header = buf.read_sector(start)?;
    if header[2] != b'D' {
        return Err(Error::new(ErrorKind::InvalidPath(format!(
            "no partition header at {}",
            start
        ))));
    }
    let dir_start = Ts::new(header[0], header[1]);

    if blocks == 0 || blocks % 40 != 0 || blocks / 40 > MAX_PARTITION_TRACKS as u16 {
        return Err(Error::new(ErrorKind::InvalidPath(format!(
            "implausible partition extent of {} blocks at {}",
            blocks, start
        ))));
    }
    let tracks = (blocks / 40) as u8;
    if start.track as usize + tracks as usize - 1 > 80 {
        return Err(Error::new(ErrorKind::InvalidPath(format!(
            "partition at {} runs off the disk",
            start
        ))));
    }

    Ok(DirCtx {
        dir_start,
        base: start.track,
        lo: start.track,
        hi: start.track + tracks - 1,
    })
}

/// Resolve a directory path (already split and normalized) to its
/// context, starting at the root.  A path segment that is a regular
/// file reports "not a directory" with a not-found status, matching
/// the host protocol's expectations.
pub(crate) fn resolve_ctx(buf: &mut ImageBuf, dirs: &[String]) -> Result<DirCtx, Error> {
    let mut ctx = DirCtx::root();
    for segment in dirs {
        let found = directory::find(buf, ctx.dir_start, segment)?;
        ctx = match found.matched {
            Some((_, DirEntry::Partition { start, blocks, .. })) => {
                partition_ctx(buf, start, blocks)?
            }
            Some((_, DirEntry::File { .. })) => {
                return Err(Error::new(ErrorKind::NotFound(format!(
                    "not a directory: {}",
                    segment
                ))));
            }
            _ => {
                return Err(Error::new(ErrorKind::NotFound(format!(
                    "no such directory: {}",
                    segment
                ))));
            }
        };
    }
    Ok(ctx)
}

/// Read the whole image into a pure in-memory tree: partitions are
/// recursed into, files are pulled in as byte strings.
pub fn build_tree(buf: &mut ImageBuf) -> Result<TreeDir, Error> {
    let mut root = TreeDir::default();
    build_dir_into(buf, DirCtx::root().dir_start, &mut root)?;
    Ok(root)
}

fn build_dir_into(buf: &mut ImageBuf, dir_start: Ts, node: &mut TreeDir) -> Result<(), Error> {
    let scanned = directory::scan(buf, dir_start)?;

    for (_, entry) in scanned.slots {
        match entry {
            DirEntry::File {
                kind, start, name, ..
            } => {
                let decoded = decode_name(&name);
                let chain = match walk_file_chain(buf, start) {
                    Ok(chain) => chain,
                    Err(e) => {
                        debug!("skipping file {} with broken chain: {}", decoded, e);
                        continue;
                    }
                };
                let data = read_chain_data(buf, &chain)?;
                let key = claim_key(node, decoded);
                node.files.insert(
                    key.clone(),
                    TreeFile {
                        name: key,
                        kind,
                        data,
                    },
                );
            }
            DirEntry::Partition {
                kind,
                start,
                name,
                blocks,
            } => {
                let decoded = decode_name(&name);
                let ctx = match partition_ctx(buf, start, blocks) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        debug!("skipping partition {} without header: {}", decoded, e);
                        continue;
                    }
                };
                let key = claim_key(node, decoded);
                let mut child = TreeDir::new(&key, kind);
                build_dir_into(buf, ctx.dir_start, &mut child)?;
                node.dirs.insert(key, child);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Pick a unique map key, aliasing duplicates as `NAME~2`, `NAME~3`...
fn claim_key(node: &TreeDir, name: String) -> String {
    if !node.files.contains_key(&name) && !node.dirs.contains_key(&name) {
        return name;
    }
    let mut n = 2;
    loop {
        let alias = format!("{}~{}", name, n);
        if !node.files.contains_key(&alias) && !node.dirs.contains_key(&alias) {
            debug!("duplicate name {}, keyed as {}", name, alias);
            return alias;
        }
        n += 1;
    }
}

/// Bottom-up track budget: one system track, the children's budgets,
/// the file payload rounded up to tracks, and a spare; floored at
/// three tracks and capped at forty.
fn assign_track_budgets(node: &mut TreeDir) -> Result<u8, Error> {
    let mut children = 0usize;
    for child in node.dirs.values_mut() {
        children += assign_track_budgets(child)? as usize;
    }
    let raw = 1 + children + node.file_sectors().div_ceil(40) + TRACK_BUFFER;
    let required = raw.max(MIN_PARTITION_TRACKS);
    if required > MAX_PARTITION_TRACKS {
        return Err(Error::new(ErrorKind::TooLarge(format!(
            "disk full: partition {} needs {} tracks",
            node.name, required
        ))));
    }
    node.required_tracks = required as u8;
    Ok(node.required_tracks)
}

/// The root's capacity check: partitions plus root file tracks must
/// fit in the 79 tracks outside the system track.
fn check_root_capacity(root: &TreeDir) -> Result<(), Error> {
    let partitions: usize = root.dirs.values().map(|d| d.required_tracks as usize).sum();
    let file_tracks = root.file_sectors().div_ceil(40);
    if partitions + file_tracks > 79 {
        return Err(Error::new(ErrorKind::TooLarge(format!(
            "disk full: {} partition tracks and {} file tracks exceed 79",
            partitions, file_tracks
        ))));
    }
    Ok(())
}

/// First-fit scan for `n` contiguous fully-free tracks inside the
/// BAM's range.  Root placement never uses a run containing the system
/// track 40; nested placement is bounded by the parent's range, which
/// already lies on one side of it.
fn find_free_run(bam: &D81Bam, n: u8) -> Result<Option<u8>, Error> {
    let (lo, hi) = bam.track_range();
    let is_root = bam.base_track() == 40;
    if n == 0 || hi - lo + 1 < n {
        return Ok(None);
    }

    'candidate: for start in lo..=hi - n + 1 {
        let end = start + n - 1;
        if is_root && start <= 40 && end >= 40 {
            continue;
        }
        for track in start..=end {
            if !bam.track_fully_free(track)? {
                continue 'candidate;
            }
        }
        return Ok(Some(start));
    }
    Ok(None)
}

/// Carve a child partition out of a parent: claim the run in the
/// parent's BAM and format the child's header, BAM and first directory
/// sector.  Returns the child's context.
fn format_partition(
    buf: &mut ImageBuf,
    parent_bam: &mut D81Bam,
    name: &str,
    start_track: u8,
    tracks: u8,
    disk_id: [u8; 2],
) -> Result<DirCtx, Error> {
    for track in start_track..start_track + tracks {
        parent_bam.set_track_all_used(track)?;
    }

    let mut child_bam = D81Bam::new_blank(
        start_track,
        start_track,
        start_track + tracks - 1,
        disk_id,
    );
    for track in start_track..start_track + tracks {
        child_bam.set_track_all_free(track)?;
    }
    for sector in 0..4u8 {
        child_bam.mark_used(Ts::new(start_track, sector))?;
    }

    let encoded = encode_name_d81(name)?;
    write_header_sector(
        buf,
        Ts::new(start_track, 0),
        Ts::new(start_track, 3),
        &encoded,
        disk_id,
    )?;
    child_bam.flush(buf)?;

    let mut dir = [0u8; SECTOR_SIZE];
    dir[1] = 0xFF;
    buf.write_sector(Ts::new(start_track, 3), &dir)?;

    Ok(DirCtx {
        dir_start: Ts::new(start_track, 3),
        base: start_track,
        lo: start_track,
        hi: start_track + tracks - 1,
    })
}

fn root_disk_id(buf: &mut ImageBuf) -> Result<[u8; 2], Error> {
    let header = buf.read_sector(Ts::new(40, 0))?;
    Ok([header[0x16], header[0x17]])
}

/// Create a directory (and, with `parents`, its missing ancestors) in
/// place.  Out-of-room errors carry status 9 so the caller can fall
/// back to a re-pack.
fn mkdir_in_place(buf: &mut ImageBuf, segments: &[String], parents: bool) -> Result<(), Error> {
    let disk_id = root_disk_id(buf)?;
    let mut ctx = DirCtx::root();

    // Walk the prefix that already exists.
    let mut index = 0;
    while index < segments.len() {
        let segment = &segments[index];
        let last = index + 1 == segments.len();
        let found = directory::find(buf, ctx.dir_start, segment)?;
        match found.matched {
            Some((_, DirEntry::Partition { start, blocks, .. })) => {
                if last {
                    if parents {
                        return Ok(());
                    }
                    return Err(Error::new(ErrorKind::AlreadyExists(format!(
                        "directory exists: {}",
                        segment
                    ))));
                }
                ctx = partition_ctx(buf, start, blocks)?;
                index += 1;
            }
            Some((_, DirEntry::File { .. })) => {
                if last {
                    return Err(Error::new(ErrorKind::AlreadyExists(format!(
                        "a file blocks the name: {}",
                        segment
                    ))));
                }
                return Err(Error::new(ErrorKind::NotFound(format!(
                    "not a directory: {}",
                    segment
                ))));
            }
            _ => break,
        }
    }

    let missing = &segments[index..];
    if missing.len() > 1 && !parents {
        return Err(Error::new(ErrorKind::NotFound(format!(
            "no such directory: {}",
            missing[0]
        ))));
    }

    // Size the chain of new partitions from the leaf up: each
    // intermediate must hold the one below it.
    let mut sizes = vec![0u8; missing.len()];
    let mut below = 0usize;
    for j in (0..missing.len()).rev() {
        let raw = 1 + below + TRACK_BUFFER;
        let tracks = raw.max(MIN_PARTITION_TRACKS);
        if tracks > MAX_PARTITION_TRACKS {
            return Err(Error::new(ErrorKind::TooLarge(format!(
                "disk full: directory {} needs {} tracks",
                missing[j], tracks
            ))));
        }
        sizes[j] = tracks as u8;
        below = tracks;
    }

    for (j, segment) in missing.iter().enumerate() {
        let tracks = sizes[j];
        let mut bam = ctx.bam(buf)?;
        let run = find_free_run(&bam, tracks)?.ok_or_else(|| {
            Error::new(ErrorKind::TooLarge(String::from("disk full")))
        })?;

        let found = directory::find(buf, ctx.dir_start, segment)?;
        let slot = claim_slot(buf, &mut bam, found.vacant, found.last)?;

        let child_ctx = format_partition(buf, &mut bam, segment, run, tracks, disk_id)?;
        bam.flush(buf)?;
        directory::write_entry(
            buf,
            slot,
            FileKind::Cbm,
            Ts::new(run, 0),
            &encode_name_d81(segment)?,
            tracks as u16 * 40,
        )?;
        ctx = child_ctx;
    }
    Ok(())
}

/// Create a directory on a D81 image.  With `parents`, missing
/// intermediate directories are created and an existing final
/// directory is not an error.
pub fn mkdir_d81(path: &Path, inner_dir: &str, parents: bool) -> Result<(), Error> {
    let segments = split_inner_path(inner_dir)?;
    if segments.is_empty() {
        return Err(Error::new(ErrorKind::BadRequest(String::from(
            "empty directory path",
        ))));
    }

    let (original, mut buf) = open_buffer(path)?;
    match mkdir_in_place(&mut buf, &segments, parents) {
        Ok(()) => commit(path, &buf),
        Err(e) if e.status() == 9 => {
            // No contiguous room in place; a re-pack may compact the
            // disk enough.
            let mut template = ImageBuf::new(original)?;
            let mut tree = build_tree(&mut template)?;
            tree_mkdir(&mut tree, &segments, parents)?;
            let rebuilt = emit_image(&mut template, tree)?;
            commit(path, &rebuilt)
        }
        Err(e) => Err(e),
    }
}

/// Remove a directory from a D81 image.  Without `recursive` the
/// directory must be empty.  The partition's whole track range returns
/// to its parent.
pub fn rmdir_d81(path: &Path, inner_dir: &str, recursive: bool) -> Result<(), Error> {
    let mut segments = split_inner_path(inner_dir)?;
    let name = segments.pop().ok_or_else(|| {
        Error::new(ErrorKind::BadRequest(String::from("empty directory path")))
    })?;

    let (_original, mut buf) = open_buffer(path)?;
    let parent_ctx = resolve_ctx(&mut buf, &segments)?;

    let found = directory::find(&mut buf, parent_ctx.dir_start, &name)?;
    let (slot, start, blocks) = match found.matched {
        Some((_, DirEntry::File { .. })) => {
            return Err(Error::new(ErrorKind::NotADirectory(format!(
                "not a directory: {}",
                name
            ))));
        }
        Some((slot, DirEntry::Partition { start, blocks, .. })) => (slot, start, blocks),
        _ => {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such directory: {}",
                name
            ))));
        }
    };

    let child_ctx = partition_ctx(&mut buf, start, blocks)?;
    if !recursive {
        let scanned = directory::scan(&mut buf, child_ctx.dir_start)?;
        if scanned.slots.iter().any(|(_, entry)| !entry.is_vacant()) {
            return Err(Error::new(ErrorKind::DirectoryNotEmpty(format!(
                "directory not empty: {}",
                name
            ))));
        }
    }

    // Nested partitions live inside this range, so releasing it
    // releases them too.
    let mut bam = parent_ctx.bam(&mut buf)?;
    for track in child_ctx.lo..=child_ctx.hi {
        bam.set_track_all_free(track)?;
    }
    bam.flush(&mut buf)?;
    directory::clear_slot(&mut buf, slot)?;
    commit(path, &buf)
}

/// Rename a directory in place.  The old and new paths must share a
/// parent; moving a whole partition elsewhere is not supported.
pub fn rename_dir_d81(
    path: &Path,
    old: &str,
    new: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    let mut old_segments = split_inner_path(old)?;
    let mut new_segments = split_inner_path(new)?;
    let old_name = old_segments.pop().ok_or_else(|| {
        Error::new(ErrorKind::BadRequest(String::from("empty directory path")))
    })?;
    let new_name = new_segments.pop().ok_or_else(|| {
        Error::new(ErrorKind::BadRequest(String::from("empty directory path")))
    })?;
    if old_segments != new_segments {
        return Err(Error::new(ErrorKind::Unsupported(String::from(
            "moving a partition is not supported",
        ))));
    }

    let (_original, mut buf) = open_buffer(path)?;
    let ctx = resolve_ctx(&mut buf, &old_segments)?;

    let found = directory::find(&mut buf, ctx.dir_start, &old_name)?;
    let (slot, start) = match found.matched {
        Some((_, DirEntry::File { .. })) => {
            return Err(Error::new(ErrorKind::NotADirectory(format!(
                "not a directory: {}",
                old_name
            ))));
        }
        Some((slot, DirEntry::Partition { start, .. })) => (slot, start),
        _ => {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such directory: {}",
                old_name
            ))));
        }
    };

    if normalize_key(&old_name) == normalize_key(&new_name) {
        return Ok(());
    }

    match directory::find(&mut buf, ctx.dir_start, &new_name)?.matched {
        Some((dest_slot, DirEntry::Partition { start, blocks, .. })) => {
            if !allow_overwrite {
                return Err(Error::new(ErrorKind::AlreadyExists(format!(
                    "destination exists: {}",
                    new_name
                ))));
            }
            let dest_ctx = partition_ctx(&mut buf, start, blocks)?;
            let mut bam = ctx.bam(&mut buf)?;
            for track in dest_ctx.lo..=dest_ctx.hi {
                bam.set_track_all_free(track)?;
            }
            bam.flush(&mut buf)?;
            directory::clear_slot(&mut buf, dest_slot)?;
        }
        Some((_, DirEntry::File { .. })) => {
            if !allow_overwrite {
                return Err(Error::new(ErrorKind::AlreadyExists(format!(
                    "destination exists: {}",
                    new_name
                ))));
            }
            crate::disk_format::d81::delete_in_ctx(&mut buf, &ctx, &new_name)?;
        }
        _ => {}
    }

    let encoded = encode_name_d81(&new_name)?;
    directory::write_entry_name(&mut buf, slot, &encoded)?;
    // The partition's own header carries the name too.
    buf.write_in_sector(start, 4, &encoded)?;
    commit(path, &buf)
}

// ---------------------------------------------------------------------------
// Tree mutations (applied between build_tree and emit_image)
// ---------------------------------------------------------------------------

fn tree_dir<'a>(root: &'a TreeDir, dirs: &[String]) -> Result<&'a TreeDir, Error> {
    let mut current = root;
    for segment in dirs {
        if current.files.contains_key(segment) {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "not a directory: {}",
                segment
            ))));
        }
        current = current.dirs.get(segment).ok_or_else(|| {
            Error::new(ErrorKind::NotFound(format!("no such directory: {}", segment)))
        })?;
    }
    Ok(current)
}

fn tree_dir_mut<'a>(root: &'a mut TreeDir, dirs: &[String]) -> Result<&'a mut TreeDir, Error> {
    let mut current = root;
    for segment in dirs {
        if current.files.contains_key(segment) {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "not a directory: {}",
                segment
            ))));
        }
        current = current.dirs.get_mut(segment).ok_or_else(|| {
            Error::new(ErrorKind::NotFound(format!("no such directory: {}", segment)))
        })?;
    }
    Ok(current)
}

/// The write-range rules applied to the in-memory tree.
fn tree_write(
    root: &mut TreeDir,
    dirs: &[String],
    name: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
) -> Result<(), Error> {
    let node = tree_dir_mut(root, dirs)?;
    let key = normalize_key(name);
    if node.dirs.contains_key(&key) {
        return Err(Error::new(ErrorKind::IsADirectory(format!(
            "cannot write to a directory: {}",
            key
        ))));
    }

    let exists = node.files.contains_key(&key);
    let cur_size = node.files.get(&key).map(|f| f.data.len()).unwrap_or(0);
    check_write_rules(
        offset,
        data.len(),
        truncate,
        create,
        allow_overwrite,
        exists,
        cur_size,
    )?;

    match node.files.entry(key) {
        Entry::Occupied(mut occupied) => {
            let file = occupied.get_mut();
            if truncate {
                file.data = data.to_vec();
            } else {
                file.data.extend_from_slice(data);
            }
        }
        Entry::Vacant(vacant) => {
            let name = vacant.key().clone();
            vacant.insert(TreeFile {
                name,
                kind: FileKind::Prg,
                data: data.to_vec(),
            });
        }
    }
    Ok(())
}

/// Move a file between tree directories.
fn tree_move(
    root: &mut TreeDir,
    old_dirs: &[String],
    old_name: &str,
    new_dirs: &[String],
    new_name: &str,
    allow_overwrite: bool,
) -> Result<(), Error> {
    let old_key = normalize_key(old_name);
    let new_key = normalize_key(new_name);

    // Validate both ends before detaching anything.
    {
        let src = tree_dir(root, old_dirs)?;
        if src.dirs.contains_key(&old_key) {
            return Err(Error::new(ErrorKind::Unsupported(format!(
                "moving a partition is not supported: {}",
                old_key
            ))));
        }
        if !src.files.contains_key(&old_key) {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such file: {}",
                old_key
            ))));
        }
        let dest = tree_dir(root, new_dirs)?;
        if dest.dirs.contains_key(&new_key) {
            return Err(Error::new(ErrorKind::IsADirectory(format!(
                "destination is a directory: {}",
                new_key
            ))));
        }
        if dest.files.contains_key(&new_key) && !allow_overwrite {
            return Err(Error::new(ErrorKind::AlreadyExists(format!(
                "destination exists: {}",
                new_key
            ))));
        }
    }

    let mut file = {
        let src = tree_dir_mut(root, old_dirs)?;
        match src.files.remove(&old_key) {
            Some(file) => file,
            None => {
                return Err(Error::new(ErrorKind::NotFound(format!(
                    "no such file: {}",
                    old_key
                ))));
            }
        }
    };
    file.name = new_key.clone();

    let dest = tree_dir_mut(root, new_dirs)?;
    dest.files.insert(new_key, file);
    Ok(())
}

/// Insert a directory (and, with `parents`, its missing ancestors).
fn tree_mkdir(root: &mut TreeDir, segments: &[String], parents: bool) -> Result<(), Error> {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if current.files.contains_key(segment) {
            if last {
                return Err(Error::new(ErrorKind::AlreadyExists(format!(
                    "a file blocks the name: {}",
                    segment
                ))));
            }
            return Err(Error::new(ErrorKind::NotFound(format!(
                "not a directory: {}",
                segment
            ))));
        }
        let exists = current.dirs.contains_key(segment);
        if exists && last && !parents {
            return Err(Error::new(ErrorKind::AlreadyExists(format!(
                "directory exists: {}",
                segment
            ))));
        }
        if !exists && !last && !parents {
            return Err(Error::new(ErrorKind::NotFound(format!(
                "no such directory: {}",
                segment
            ))));
        }
        current = current
            .dirs
            .entry(segment.clone())
            .or_insert_with(|| TreeDir::new(segment, FileKind::Cbm));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Re-pack: lay the tree back out into a fresh image
// ---------------------------------------------------------------------------

/// Rebuild the image bytes from a mutated tree.  The root header
/// sector and any trailing error-info region are carried over from the
/// template byte-for-byte; everything else is laid out fresh.
pub(crate) fn emit_image(template: &mut ImageBuf, mut tree: TreeDir) -> Result<ImageBuf, Error> {
    for child in tree.dirs.values_mut() {
        assign_track_budgets(child)?;
    }
    check_root_capacity(&tree)?;

    let geometry = *template.geometry();
    let mut fresh = vec![0u8; template.bytes().len()];
    fresh[geometry.data_len..].copy_from_slice(&template.bytes()[geometry.data_len..]);
    let mut buf = ImageBuf::new(fresh)?;

    let header = template.read_sector(Ts::new(40, 0))?;
    buf.write_sector(Ts::new(40, 0), &header)?;
    let disk_id = [header[0x16], header[0x17]];

    // The root directory chain spans the whole system track up front,
    // so track 40 is all-used in the fresh BAM.
    for sector in 3..40u8 {
        let mut dir = [0u8; SECTOR_SIZE];
        if sector < 39 {
            dir[0] = 40;
            dir[1] = sector + 1;
        } else {
            dir[0] = 0;
            dir[1] = 0xFF;
        }
        buf.write_sector(Ts::new(40, sector), &dir)?;
    }

    let mut bam = D81Bam::new_blank(40, 1, 80, disk_id);
    for track in 1..=80u8 {
        if track != 40 {
            bam.set_track_all_free(track)?;
        }
    }

    emit_children(&mut buf, &mut bam, Ts::new(40, 3), &tree, disk_id)?;
    bam.flush(&mut buf)?;
    Ok(buf)
}

/// Depth-first emission of one directory's partitions and files.
fn emit_children(
    buf: &mut ImageBuf,
    bam: &mut D81Bam,
    dir_start: Ts,
    node: &TreeDir,
    disk_id: [u8; 2],
) -> Result<(), Error> {
    let mut cursor = EntryCursor::new(dir_start);

    for (key, child) in &node.dirs {
        let tracks = child.required_tracks;
        let run = find_free_run(bam, tracks)?.ok_or_else(|| {
            Error::new(ErrorKind::TooLarge(String::from("disk full")))
        })?;

        let child_ctx = format_partition(buf, bam, key, run, tracks, disk_id)?;
        let slot = cursor.next_slot(buf, bam)?;
        directory::write_entry(
            buf,
            slot,
            child.kind.unwrap_or(FileKind::Cbm),
            Ts::new(run, 0),
            &encode_name_d81(key)?,
            tracks as u16 * 40,
        )?;

        let mut child_bam = child_ctx.bam(buf)?;
        emit_children(buf, &mut child_bam, child_ctx.dir_start, child, disk_id)?;
        child_bam.flush(buf)?;
    }

    for (key, file) in &node.files {
        let (start, blocks) = write_new_chain(buf, bam, &file.data)?;
        let slot = cursor.next_slot(buf, bam)?;
        directory::write_entry(
            buf,
            slot,
            file.kind,
            start,
            &encode_name_d81(key)?,
            blocks,
        )?;
    }
    Ok(())
}

/// Walks a directory chain slot by slot, extending it when a sector
/// fills up.
struct EntryCursor {
    current: Ts,
    slot: usize,
}

impl EntryCursor {
    fn new(start: Ts) -> EntryCursor {
        EntryCursor { current: start, slot: 0 }
    }

    fn next_slot(
        &mut self,
        buf: &mut ImageBuf,
        bam: &mut D81Bam,
    ) -> Result<directory::DirSlot, Error> {
        loop {
            if self.slot < directory::ENTRIES_PER_SECTOR {
                let slot = directory::DirSlot {
                    ts: self.current,
                    index: self.slot,
                };
                self.slot += 1;
                return Ok(slot);
            }

            let sector = buf.read_sector(self.current)?;
            if sector[0] != 0 {
                self.current = Ts::new(sector[0], sector[1]);
                self.slot = 0;
                continue;
            }
            let new_ts = bam.alloc_directory_sector()?.ok_or_else(|| {
                Error::new(ErrorKind::TooLarge(String::from("directory full")))
            })?;
            directory::append_sector(buf, self.current, new_ts)?;
            self.current = new_ts;
            self.slot = 0;
        }
    }
}

/// Re-pack with a write applied; used when an in-place write runs out
/// of room.
#[allow(clippy::too_many_arguments)]
pub(crate) fn repack_write(
    original: &[u8],
    dirs: &[String],
    name: &str,
    offset: usize,
    data: &[u8],
    truncate: bool,
    create: bool,
    allow_overwrite: bool,
) -> Result<ImageBuf, Error> {
    let mut template = ImageBuf::new(original.to_vec())?;
    let mut tree = build_tree(&mut template)?;
    tree_write(
        &mut tree,
        dirs,
        name,
        offset,
        data,
        truncate,
        create,
        allow_overwrite,
    )?;
    emit_image(&mut template, tree)
}

/// Re-pack with a cross-directory move applied, built from the
/// original (pre-attempt) bytes.
pub(crate) fn repack_move(
    original: &[u8],
    old_dirs: &[String],
    old_name: &str,
    new_dirs: &[String],
    new_name: &str,
    allow_overwrite: bool,
) -> Result<ImageBuf, Error> {
    let mut template = ImageBuf::new(original.to_vec())?;
    let mut tree = build_tree(&mut template)?;
    tree_move(
        &mut tree,
        old_dirs,
        old_name,
        new_dirs,
        new_name,
        allow_overwrite,
    )?;
    emit_image(&mut template, tree)
}

/// Re-pack without a mutation; rebuilds the image from its own tree.
#[cfg(test)]
pub(crate) fn repack_identity(original: &[u8]) -> Result<ImageBuf, Error> {
    let mut template = ImageBuf::new(original.to_vec())?;
    let tree = build_tree(&mut template)?;
    emit_image(&mut template, tree)
}

#[cfg(test)]
mod tests {
    use super::{build_tree, mkdir_d81, rename_dir_d81, repack_identity, rmdir_d81};
    use crate::disk_format::bam::D81Bam;
    use crate::disk_format::chain::ImageBuf;
    use crate::disk_format::d81::{format_blank_d81, rename_file_d81, write_range_d81};
    use crate::disk_format::directory::FileKind;
    use crate::disk_format::image::load_d81;
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};

    fn temp_d81() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("Error creating temp dir");
        let path = dir.path().join("test.d81");
        let bytes = format_blank_d81("TEST 1581", "CB").expect("Error formatting image");
        std::fs::write(&path, bytes).expect("Error writing image");
        (dir, path)
    }

    /// Count tracks with all 40 sectors free in the root BAM.
    fn fully_free_tracks(path: &Path) -> u32 {
        let data = std::fs::read(path).unwrap();
        let mut buf = ImageBuf::new(data).unwrap();
        let bam = D81Bam::load_root(&mut buf).unwrap();
        (1..=80u8)
            .filter(|&t| bam.track_fully_free(t).unwrap())
            .count() as u32
    }

    /// mkdir -p creates both levels, nested and budgeted: the outer
    /// partition holds the inner one plus a spare track.
    #[test]
    fn mkdir_parents_creates_nested_partitions() {
        let (_dir, path) = temp_d81();
        assert_eq!(fully_free_tracks(&path), 79);

        mkdir_d81(&path, "GAMES/ARCADE", true).unwrap();

        let image = load_d81(&path).unwrap();
        let games = image.lookup("GAMES").unwrap();
        assert_eq!(games.kind, FileKind::Cbm);

        let games_dir = image.partition_directory(games).unwrap();
        let inside = image.dir(games_dir).unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].name, "ARCADE");
        assert_eq!(inside[0].kind, FileKind::Cbm);

        // GAMES takes 5 tracks (its own, ARCADE's 3, one spare) out of
        // the root; ARCADE's run nests inside it.
        assert_eq!(fully_free_tracks(&path), 79 - 5);
    }

    #[test]
    fn mkdir_boundaries() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "GAMES", false).unwrap();

        // Existing directory.
        let err = mkdir_d81(&path, "GAMES", false).unwrap_err();
        assert_eq!(err.status(), 4);
        // ...is fine with parents.
        mkdir_d81(&path, "GAMES", true).unwrap();

        // Missing intermediate without parents.
        let err = mkdir_d81(&path, "A/B", false).unwrap_err();
        assert_eq!(err.status(), 1);

        // A file blocking the final name.
        write_range_d81(&path, "BLOCKED", 0, b"x", true, true, true).unwrap();
        let err = mkdir_d81(&path, "BLOCKED", false).unwrap_err();
        assert_eq!(err.status(), 4);

        // A file as an intermediate segment.
        let err = mkdir_d81(&path, "BLOCKED/SUB", true).unwrap_err();
        assert_eq!(err.status(), 1);
    }

    /// A write path through a regular file reports not-found.
    #[test]
    fn write_through_a_file_segment_is_not_found() {
        let (_dir, path) = temp_d81();
        write_range_d81(&path, "PLAIN", 0, b"x", true, true, true).unwrap();

        let err = write_range_d81(&path, "PLAIN/CHILD", 0, b"x", true, true, true).unwrap_err();
        assert_eq!(err.status(), 1);
    }

    #[test]
    fn write_into_partition_and_read_back() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "DOCS", false).unwrap();

        let payload: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        write_range_d81(&path, "DOCS/README", 0, &payload, true, true, true).unwrap();

        let image = load_d81(&path).unwrap();
        let docs = image.lookup("DOCS").unwrap();
        let dir_start = image.partition_directory(docs).unwrap();
        let inside = image.dir(dir_start).unwrap();
        let readme = inside.iter().find(|r| r.name == "README").unwrap();
        assert_eq!(readme.size, 1000);
        assert_eq!(image.read_range(readme, 0, 1000).unwrap(), payload);

        // Partition data stays inside the partition's track range and
        // off the reserved sectors of its first track.
        let lo = docs.start.track;
        let hi = lo + (docs.blocks / 40) as u8 - 1;
        for sector in &readme.chain.sectors {
            assert!(sector.ts.track >= lo && sector.ts.track <= hi);
            if sector.ts.track == lo {
                assert!(sector.ts.sector >= 4);
            }
        }
    }

    /// A 200 KB write into a 3-track partition cannot fit in place and
    /// must come back via re-pack, growing the partition.
    #[test]
    fn oversized_partition_write_triggers_repack() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "GAMES", false).unwrap();

        let payload: Vec<u8> = (0..200_000).map(|i| ((i * 13) % 256) as u8).collect();
        let written = write_range_d81(&path, "GAMES/BIG", 0, &payload, true, true, true).unwrap();
        assert_eq!(written, 200_000);

        let image = load_d81(&path).unwrap();
        let games = image.lookup("GAMES").unwrap();
        // 788 sectors of payload: 20 data tracks + system + spare.
        assert_eq!((games.blocks / 40) as usize, 22);

        let dir_start = image.partition_directory(games).unwrap();
        let inside = image.dir(dir_start).unwrap();
        let big = inside.iter().find(|r| r.name == "BIG").unwrap();
        assert_eq!(big.size, 200_000);
        assert_eq!(image.read_range(big, 0, 200_000).unwrap(), payload);
    }

    /// Cross-partition move of a file too large for the destination:
    /// the in-place attempt fails and the re-pack move takes over.
    #[test]
    fn cross_partition_move_with_repack() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "GAMES", false).unwrap();
        let payload: Vec<u8> = (0..200_000).map(|i| ((i * 7) % 256) as u8).collect();
        write_range_d81(&path, "GAMES/BIG", 0, &payload, true, true, true).unwrap();
        mkdir_d81(&path, "ARCHIVE", false).unwrap();

        rename_file_d81(&path, "GAMES/BIG", "ARCHIVE/BIG", false).unwrap();

        let image = load_d81(&path).unwrap();
        let games = image.lookup("GAMES").unwrap();
        let games_dir = image.partition_directory(games).unwrap();
        assert!(image.dir(games_dir).unwrap().is_empty());

        let archive = image.lookup("ARCHIVE").unwrap();
        let archive_dir = image.partition_directory(archive).unwrap();
        let inside = image.dir(archive_dir).unwrap();
        let big = inside.iter().find(|r| r.name == "BIG").unwrap();
        assert_eq!(big.size, 200_000);
        assert_eq!(image.read_range(big, 0, 200_000).unwrap(), payload);
    }

    #[test]
    fn small_cross_partition_move_stays_in_place() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "SRC", false).unwrap();
        mkdir_d81(&path, "DST", false).unwrap();
        write_range_d81(&path, "SRC/NOTE", 0, b"note body", true, true, true).unwrap();

        rename_file_d81(&path, "SRC/NOTE", "DST/NOTE", false).unwrap();

        let image = load_d81(&path).unwrap();
        let dst = image.lookup("DST").unwrap();
        let dst_dir = image.partition_directory(dst).unwrap();
        let inside = image.dir(dst_dir).unwrap();
        let note = inside.iter().find(|r| r.name == "NOTE").unwrap();
        assert_eq!(image.read_range(note, 0, 9).unwrap(), b"note body");

        let src = image.lookup("SRC").unwrap();
        let src_dir = image.partition_directory(src).unwrap();
        assert!(image.dir(src_dir).unwrap().is_empty());
    }

    #[test]
    fn rmdir_requires_empty_and_frees_tracks() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "KEEP", false).unwrap();
        write_range_d81(&path, "KEEP/FILE", 0, b"x", true, true, true).unwrap();

        let err = rmdir_d81(&path, "KEEP", false).unwrap_err();
        assert_eq!(err.status(), 5);

        let before = fully_free_tracks(&path);
        rmdir_d81(&path, "KEEP", true).unwrap();
        assert_eq!(fully_free_tracks(&path), before + 3);

        let image = load_d81(&path).unwrap();
        assert!(image.lookup("KEEP").is_err());

        let err = rmdir_d81(&path, "KEEP", false).unwrap_err();
        assert_eq!(err.status(), 1);
    }

    #[test]
    fn rmdir_of_a_file_is_not_a_directory() {
        let (_dir, path) = temp_d81();
        write_range_d81(&path, "PLAIN", 0, b"x", true, true, true).unwrap();
        let err = rmdir_d81(&path, "PLAIN", false).unwrap_err();
        assert_eq!(err.status(), 2);
    }

    #[test]
    fn rename_dir_updates_entry_and_header() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "OLD", false).unwrap();
        write_range_d81(&path, "OLD/FILE", 0, b"kept", true, true, true).unwrap();

        rename_dir_d81(&path, "OLD", "NEW", false).unwrap();

        let image = load_d81(&path).unwrap();
        assert!(image.lookup("OLD").is_err());
        let new = image.lookup("NEW").unwrap();

        // The partition header carries the new name too.
        let data = std::fs::read(&path).unwrap();
        let buf = ImageBuf::new(data).unwrap();
        let header = buf.sector(new.start).unwrap();
        assert_eq!(&header[4..7], b"NEW");

        let dir_start = image.partition_directory(new).unwrap();
        let inside = image.dir(dir_start).unwrap();
        assert_eq!(inside[0].name, "FILE");

        // Moving to another parent is not supported.
        mkdir_d81(&path, "ELSEWHERE", false).unwrap();
        let err = rename_dir_d81(&path, "NEW", "ELSEWHERE/NEW", false).unwrap_err();
        assert_eq!(err.status(), 10);
    }

    /// Property: re-packing a re-packed image reproduces it
    /// byte-for-byte.
    #[test]
    fn repack_is_idempotent() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "GAMES/ARCADE", true).unwrap();
        write_range_d81(&path, "GAMES/ARCADE/PACMAN", 0, &[0xAB; 9000], true, true, true)
            .unwrap();
        write_range_d81(&path, "ROOTFILE", 0, b"root data", true, true, true).unwrap();

        let original = std::fs::read(&path).unwrap();
        let once = repack_identity(&original).unwrap();
        let twice = repack_identity(once.bytes()).unwrap();
        assert_eq!(once.bytes(), twice.bytes());
    }

    /// The tree build reads back exactly what was written.
    #[test]
    fn build_tree_reflects_the_image() {
        let (_dir, path) = temp_d81();
        mkdir_d81(&path, "A/B", true).unwrap();
        write_range_d81(&path, "A/B/LEAF", 0, b"leaf", true, true, true).unwrap();
        write_range_d81(&path, "TOP", 0, b"top", true, true, true).unwrap();

        let data = std::fs::read(&path).unwrap();
        let mut buf = ImageBuf::new(data).unwrap();
        let tree = build_tree(&mut buf).unwrap();

        assert_eq!(tree.files["TOP"].data, b"top");
        let a = &tree.dirs["A"];
        let b = &a.dirs["B"];
        assert_eq!(b.files["LEAF"].data, b"leaf");
        assert!(a.files.is_empty());
    }

    /// Partition budgets that cannot be placed contiguously fail with
    /// "disk full" even when enough scattered tracks remain.
    #[test]
    fn unplaceable_mkdir_is_too_large() {
        let (_dir, path) = temp_d81();

        // 25 three-track partitions consume 75 of the 79 free tracks;
        // the next five-track request cannot fit even after a re-pack.
        for i in 0..25 {
            mkdir_d81(&path, &format!("P{:02}", i), false).unwrap();
        }
        let err = mkdir_d81(&path, "P99/DEEP", true).unwrap_err();
        assert_eq!(err.status(), 9);
    }
}
