//! Block Availability Map views for the three image families
//!
//! The BAM is the authoritative free/used state: a per-track free
//! count plus a bitmap in which a set bit means the sector is free.
//! Each view is loaded from its system sector(s) into memory, mutated
//! there, and flushed back, so the on-disk update ordering stays under
//! the engines' control.
//!
//! Mark operations are idempotent: marking a used sector used again
//! (or a free one free) changes neither the bitmap nor the count, so
//! the count always equals the popcount of its bitmap.

use crate::disk_format::chain::{SectorRead, SectorWrite};
use crate::disk_format::geometry::{Geometry, Ts, SECTOR_SIZE};
use crate::error::{Error, ErrorKind};

/// Offset of the first per-track BAM entry in a D64 BAM sector.
const D64_ENTRIES: usize = 0x04;

/// Offset of the tracks 36-70 free counts in the D71 primary BAM.
const D71_FREE_COUNTS: usize = 0xDD;

/// Offset of the first per-track entry in a D81 BAM sector.
const D81_ENTRIES: usize = 0x10;

/// Byte within a D64 BAM sector where track `track`'s entry starts.
fn d64_entry_offset(track: u8) -> usize {
    D64_ENTRIES + (track as usize - 1) * 4
}

/// The free/used bitmap surface shared by all three variants.
pub trait BlockMap {
    /// True if the sector is free.
    fn is_free(&self, ts: Ts) -> Result<bool, Error>;

    /// Mark a sector used, decrementing the track free count iff the
    /// sector was free.
    fn mark_used(&mut self, ts: Ts) -> Result<(), Error>;

    /// Mark a sector free, incrementing the track free count iff the
    /// sector was used.
    fn mark_free(&mut self, ts: Ts) -> Result<(), Error>;

    /// The track's free-sector count.
    fn track_free_count(&self, track: u8) -> Result<u8, Error>;

    /// Mark every sector on the track free.
    fn set_track_all_free(&mut self, track: u8) -> Result<(), Error>;

    /// Mark every sector on the track used.
    fn set_track_all_used(&mut self, track: u8) -> Result<(), Error>;
}

/// Flip helpers over a (count byte, bitmap bytes) pair.  `bit` indexes
/// the sector within the bitmap.
fn bitmap_is_free(bitmap: &[u8], sector: u8) -> bool {
    bitmap[sector as usize / 8] & (1 << (sector % 8)) != 0
}

fn bitmap_set(bitmap: &mut [u8], sector: u8) {
    bitmap[sector as usize / 8] |= 1 << (sector % 8);
}

fn bitmap_clear(bitmap: &mut [u8], sector: u8) {
    bitmap[sector as usize / 8] &= !(1 << (sector % 8));
}

/// The D64 BAM: one sector at 18/0, four bytes per track starting at
/// offset 0x04 (free count, then a 24-bit bitmap).
pub struct D64Bam {
    sector: [u8; SECTOR_SIZE],
    geometry: Geometry,
}

impl D64Bam {
    /// The BAM's home sector.
    pub const LOCATION: Ts = Ts { track: 18, sector: 0 };

    /// Load the BAM from its system sector.
    pub fn load<R: SectorRead + ?Sized>(io: &mut R) -> Result<D64Bam, Error> {
        let geometry = *io.geometry();
        let sector = io.read_sector(Self::LOCATION)?;
        Ok(D64Bam { sector, geometry })
    }

    /// Build the BAM of a freshly formatted image: header bytes set,
    /// every track free, then 18/0 and 18/1 reserved.
    pub fn new_blank(geometry: Geometry) -> Result<D64Bam, Error> {
        let mut bam = D64Bam {
            sector: [0u8; SECTOR_SIZE],
            geometry,
        };
        bam.sector[0] = 18;
        bam.sector[1] = 1;
        bam.sector[2] = 0x41;
        for track in 1..=geometry.tracks {
            bam.set_track_all_free(track)?;
        }
        bam.mark_used(Ts::new(18, 0))?;
        bam.mark_used(Ts::new(18, 1))?;
        Ok(bam)
    }

    /// Write the BAM back to its system sector.
    pub fn flush<W: SectorWrite + ?Sized>(&self, io: &mut W) -> Result<(), Error> {
        io.write_sector(Self::LOCATION, &self.sector)
    }

    /// The raw BAM sector, for header fields (disk name, id) that
    /// share the sector with the map.
    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.sector
    }

    /// The raw BAM sector.
    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.sector
    }

    /// Allocate the first free data sector, scanning from track 1
    /// upward.
    pub fn alloc_data_sector(&mut self) -> Result<Option<Ts>, Error> {
        for track in 1..=self.geometry.tracks {
            if self.track_free_count(track)? == 0 {
                continue;
            }
            let sectors = self.geometry.sectors_on_track(track)?;
            for sector in 0..sectors {
                let ts = Ts::new(track, sector);
                if self.is_free(ts)? {
                    self.mark_used(ts)?;
                    return Ok(Some(ts));
                }
            }
        }
        Ok(None)
    }

    /// Allocate a sector on the directory track for chain extension,
    /// preferring sectors 2 and up.
    pub fn alloc_directory_sector(&mut self) -> Result<Option<Ts>, Error> {
        let track = 18;
        let sectors = self.geometry.sectors_on_track(track)?;
        for sector in (2..sectors).chain(0..2) {
            let ts = Ts::new(track, sector);
            if self.is_free(ts)? {
                self.mark_used(ts)?;
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    fn check_track(&self, track: u8) -> Result<(), Error> {
        if track == 0 || track > self.geometry.tracks {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "BAM track {} out of range",
                track
            ))));
        }
        Ok(())
    }
}

impl BlockMap for D64Bam {
    fn is_free(&self, ts: Ts) -> Result<bool, Error> {
        self.check_track(ts.track)?;
        let entry = d64_entry_offset(ts.track);
        Ok(bitmap_is_free(&self.sector[entry + 1..entry + 4], ts.sector))
    }

    fn mark_used(&mut self, ts: Ts) -> Result<(), Error> {
        self.check_track(ts.track)?;
        let entry = d64_entry_offset(ts.track);
        if bitmap_is_free(&self.sector[entry + 1..entry + 4], ts.sector) {
            bitmap_clear(&mut self.sector[entry + 1..entry + 4], ts.sector);
            self.sector[entry] -= 1;
        }
        Ok(())
    }

    fn mark_free(&mut self, ts: Ts) -> Result<(), Error> {
        self.check_track(ts.track)?;
        let entry = d64_entry_offset(ts.track);
        if !bitmap_is_free(&self.sector[entry + 1..entry + 4], ts.sector) {
            bitmap_set(&mut self.sector[entry + 1..entry + 4], ts.sector);
            self.sector[entry] += 1;
        }
        Ok(())
    }

    fn track_free_count(&self, track: u8) -> Result<u8, Error> {
        self.check_track(track)?;
        Ok(self.sector[d64_entry_offset(track)])
    }

    fn set_track_all_free(&mut self, track: u8) -> Result<(), Error> {
        self.check_track(track)?;
        let sectors = self.geometry.sectors_on_track(track)?;
        let entry = d64_entry_offset(track);
        self.sector[entry] = sectors;
        self.sector[entry + 1..entry + 4].fill(0);
        for sector in 0..sectors {
            bitmap_set(&mut self.sector[entry + 1..entry + 4], sector);
        }
        Ok(())
    }

    fn set_track_all_used(&mut self, track: u8) -> Result<(), Error> {
        self.check_track(track)?;
        let entry = d64_entry_offset(track);
        self.sector[entry] = 0;
        self.sector[entry + 1..entry + 4].fill(0);
        Ok(())
    }
}

/// The D71 BAM: the D64 layout in 18/0 for the first side, and for
/// tracks 36-70 a free-count table at 18/0 offset 0xDD plus 3-byte
/// bitmaps in 53/0.
///
/// When the double-sided flag (18/0 byte 3, bit 0x80) is clear, the
/// second side does not exist: operations on tracks 36-70 are no-ops
/// and those tracks never report free.
pub struct D71Bam {
    primary: [u8; SECTOR_SIZE],
    secondary: [u8; SECTOR_SIZE],
    geometry: Geometry,
}

impl D71Bam {
    /// The primary BAM's home sector.
    pub const PRIMARY: Ts = Ts { track: 18, sector: 0 };
    /// The second-side bitmap sector.
    pub const SECONDARY: Ts = Ts { track: 53, sector: 0 };

    /// Load both BAM sectors.
    pub fn load<R: SectorRead + ?Sized>(io: &mut R) -> Result<D71Bam, Error> {
        let geometry = *io.geometry();
        let primary = io.read_sector(Self::PRIMARY)?;
        let secondary = io.read_sector(Self::SECONDARY)?;
        Ok(D71Bam {
            primary,
            secondary,
            geometry,
        })
    }

    /// Build the BAM of a freshly formatted double-sided image.
    pub fn new_blank(geometry: Geometry) -> Result<D71Bam, Error> {
        let mut bam = D71Bam {
            primary: [0u8; SECTOR_SIZE],
            secondary: [0u8; SECTOR_SIZE],
            geometry,
        };
        bam.primary[0] = 18;
        bam.primary[1] = 1;
        bam.primary[2] = 0x41;
        bam.primary[3] = 0x80;
        for track in 1..=geometry.tracks {
            bam.set_track_all_free(track)?;
        }
        bam.mark_used(Ts::new(18, 0))?;
        bam.mark_used(Ts::new(18, 1))?;
        bam.mark_used(Ts::new(53, 0))?;
        Ok(bam)
    }

    /// Write both BAM sectors back.
    pub fn flush<W: SectorWrite + ?Sized>(&self, io: &mut W) -> Result<(), Error> {
        io.write_sector(Self::PRIMARY, &self.primary)?;
        io.write_sector(Self::SECONDARY, &self.secondary)
    }

    /// The raw primary BAM sector, for the header fields that share it.
    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.primary
    }

    /// The raw primary BAM sector (18/0).
    pub fn primary_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.primary
    }

    /// The raw second-side bitmap sector (53/0).
    pub fn secondary_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.secondary
    }

    /// True when the image is flagged double-sided.
    pub fn double_sided(&self) -> bool {
        self.primary[3] & 0x80 != 0
    }

    /// Allocate the first free data sector, scanning from track 1
    /// upward.  On a single-sided image tracks 36-70 never report
    /// free, so allocation stays confined to the first side.
    pub fn alloc_data_sector(&mut self) -> Result<Option<Ts>, Error> {
        for track in 1..=self.geometry.tracks {
            if self.track_free_count(track)? == 0 {
                continue;
            }
            let sectors = self.geometry.sectors_on_track(track)?;
            for sector in 0..sectors {
                let ts = Ts::new(track, sector);
                if self.is_free(ts)? {
                    self.mark_used(ts)?;
                    return Ok(Some(ts));
                }
            }
        }
        Ok(None)
    }

    /// Allocate a directory-track sector, preferring sectors 2 and up.
    pub fn alloc_directory_sector(&mut self) -> Result<Option<Ts>, Error> {
        let sectors = self.geometry.sectors_on_track(18)?;
        for sector in (2..sectors).chain(0..2) {
            let ts = Ts::new(18, sector);
            if self.is_free(ts)? {
                self.mark_used(ts)?;
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    fn check_track(&self, track: u8) -> Result<(), Error> {
        if track == 0 || track > self.geometry.tracks {
            return Err(Error::new(ErrorKind::InvalidPath(format!(
                "BAM track {} out of range",
                track
            ))));
        }
        Ok(())
    }

    fn upper_bitmap_range(track: u8) -> std::ops::Range<usize> {
        let base = (track as usize - 36) * 3;
        base..base + 3
    }
}

impl BlockMap for D71Bam {
    fn is_free(&self, ts: Ts) -> Result<bool, Error> {
        self.check_track(ts.track)?;
        if ts.track <= 35 {
            let entry = d64_entry_offset(ts.track);
            return Ok(bitmap_is_free(&self.primary[entry + 1..entry + 4], ts.sector));
        }
        if !self.double_sided() {
            return Ok(false);
        }
        let range = Self::upper_bitmap_range(ts.track);
        Ok(bitmap_is_free(&self.secondary[range], ts.sector))
    }

    fn mark_used(&mut self, ts: Ts) -> Result<(), Error> {
        self.check_track(ts.track)?;
        if ts.track <= 35 {
            let entry = d64_entry_offset(ts.track);
            if bitmap_is_free(&self.primary[entry + 1..entry + 4], ts.sector) {
                bitmap_clear(&mut self.primary[entry + 1..entry + 4], ts.sector);
                self.primary[entry] -= 1;
            }
            return Ok(());
        }
        if !self.double_sided() {
            return Ok(());
        }
        let range = Self::upper_bitmap_range(ts.track);
        let count = D71_FREE_COUNTS + ts.track as usize - 36;
        if bitmap_is_free(&self.secondary[range.clone()], ts.sector) {
            bitmap_clear(&mut self.secondary[range], ts.sector);
            self.primary[count] -= 1;
        }
        Ok(())
    }

    fn mark_free(&mut self, ts: Ts) -> Result<(), Error> {
        self.check_track(ts.track)?;
        if ts.track <= 35 {
            let entry = d64_entry_offset(ts.track);
            if !bitmap_is_free(&self.primary[entry + 1..entry + 4], ts.sector) {
                bitmap_set(&mut self.primary[entry + 1..entry + 4], ts.sector);
                self.primary[entry] += 1;
            }
            return Ok(());
        }
        if !self.double_sided() {
            return Ok(());
        }
        let range = Self::upper_bitmap_range(ts.track);
        let count = D71_FREE_COUNTS + ts.track as usize - 36;
        if !bitmap_is_free(&self.secondary[range.clone()], ts.sector) {
            bitmap_set(&mut self.secondary[range], ts.sector);
            self.primary[count] += 1;
        }
        Ok(())
    }

    fn track_free_count(&self, track: u8) -> Result<u8, Error> {
        self.check_track(track)?;
        if track <= 35 {
            return Ok(self.primary[d64_entry_offset(track)]);
        }
        if !self.double_sided() {
            return Ok(0);
        }
        Ok(self.primary[D71_FREE_COUNTS + track as usize - 36])
    }

    fn set_track_all_free(&mut self, track: u8) -> Result<(), Error> {
        self.check_track(track)?;
        let sectors = self.geometry.sectors_on_track(track)?;
        if track <= 35 {
            let entry = d64_entry_offset(track);
            self.primary[entry] = sectors;
            self.primary[entry + 1..entry + 4].fill(0);
            for sector in 0..sectors {
                bitmap_set(&mut self.primary[entry + 1..entry + 4], sector);
            }
            return Ok(());
        }
        if !self.double_sided() {
            return Ok(());
        }
        let range = Self::upper_bitmap_range(track);
        self.primary[D71_FREE_COUNTS + track as usize - 36] = sectors;
        self.secondary[range.clone()].fill(0);
        for sector in 0..sectors {
            bitmap_set(&mut self.secondary[range.clone()], sector);
        }
        Ok(())
    }

    fn set_track_all_used(&mut self, track: u8) -> Result<(), Error> {
        self.check_track(track)?;
        if track <= 35 {
            let entry = d64_entry_offset(track);
            self.primary[entry] = 0;
            self.primary[entry + 1..entry + 4].fill(0);
            return Ok(());
        }
        if !self.double_sided() {
            return Ok(());
        }
        let range = Self::upper_bitmap_range(track);
        self.primary[D71_FREE_COUNTS + track as usize - 36] = 0;
        self.secondary[range].fill(0);
        Ok(())
    }
}

/// A D81 BAM: 6-byte per-track entries (free count + 40-bit bitmap,
/// little-endian) starting at offset 0x10, tracks 1-40 in the first
/// BAM sector and 41-80 in the second.
///
/// The same layout serves the root (BAM at 40/1 and 40/2) and every
/// partition (BAM at `first_track`/1 and /2, with only the partition's
/// own track range marked free).  `lo..=hi` bounds allocation; mark
/// and query operations always address the full 80 tracks.
pub struct D81Bam {
    first: [u8; SECTOR_SIZE],
    second: [u8; SECTOR_SIZE],
    /// Track holding the BAM sectors: 40 for the root, the partition's
    /// first track otherwise.
    base: u8,
    lo: u8,
    hi: u8,
}

impl D81Bam {
    /// Load the two BAM sectors at `base/1` and `base/2`, scoping
    /// allocation to `lo..=hi`.
    pub fn load<R: SectorRead + ?Sized>(
        io: &mut R,
        base: u8,
        lo: u8,
        hi: u8,
    ) -> Result<D81Bam, Error> {
        let first = io.read_sector(Ts::new(base, 1))?;
        let second = io.read_sector(Ts::new(base, 2))?;
        Ok(D81Bam {
            first,
            second,
            base,
            lo,
            hi,
        })
    }

    /// Load the root BAM at 40/1 and 40/2.
    pub fn load_root<R: SectorRead + ?Sized>(io: &mut R) -> Result<D81Bam, Error> {
        Self::load(io, 40, 1, 80)
    }

    /// Build a blank BAM pair for `base`, with every track marked used
    /// and the standard header bytes (link chain, 'D' marker and its
    /// complement, disk id) filled in.  Callers free the track range
    /// they own afterwards.
    pub fn new_blank(base: u8, lo: u8, hi: u8, disk_id: [u8; 2]) -> D81Bam {
        let mut first = [0u8; SECTOR_SIZE];
        let mut second = [0u8; SECTOR_SIZE];

        first[0] = base;
        first[1] = 2;
        second[0] = 0;
        second[1] = 0xFF;
        for sector in [&mut first, &mut second] {
            sector[2] = b'D';
            sector[3] = !b'D';
            sector[4] = disk_id[0];
            sector[5] = disk_id[1];
            sector[6] = 0xC0;
        }

        D81Bam {
            first,
            second,
            base,
            lo,
            hi,
        }
    }

    /// Write both BAM sectors back to `base/1` and `base/2`.
    pub fn flush<W: SectorWrite + ?Sized>(&self, io: &mut W) -> Result<(), Error> {
        io.write_sector(Ts::new(self.base, 1), &self.first)?;
        io.write_sector(Ts::new(self.base, 2), &self.second)
    }

    /// The track that holds this BAM (and the owning directory's
    /// header and first directory sector).
    pub fn base_track(&self) -> u8 {
        self.base
    }

    /// The allocation range.
    pub fn track_range(&self) -> (u8, u8) {
        (self.lo, self.hi)
    }

    fn entry_mut(&mut self, track: u8) -> Result<&mut [u8], Error> {
        check_d81_track(track)?;
        let (sector, index) = if track <= 40 {
            (&mut self.first, track as usize - 1)
        } else {
            (&mut self.second, track as usize - 41)
        };
        let offset = D81_ENTRIES + index * 6;
        Ok(&mut sector[offset..offset + 6])
    }

    fn entry(&self, track: u8) -> Result<&[u8], Error> {
        check_d81_track(track)?;
        let (sector, index) = if track <= 40 {
            (&self.first, track as usize - 1)
        } else {
            (&self.second, track as usize - 41)
        };
        let offset = D81_ENTRIES + index * 6;
        Ok(&sector[offset..offset + 6])
    }

    /// Allocate a data sector under this view's placement policy.
    ///
    /// Root: scan tracks 1-80 excluding the system track 40.
    /// Partition: prefer the partition's non-system tracks, then fall
    /// back to the system track's sectors 4-39; sectors 0-3 there hold
    /// the header, BAM and first directory sector and are never handed
    /// out for data.
    pub fn alloc_data_sector(&mut self) -> Result<Option<Ts>, Error> {
        if self.base == 40 {
            for track in self.lo..=self.hi {
                if track == 40 {
                    continue;
                }
                if let Some(ts) = self.first_free_on(track, 0)? {
                    self.mark_used(ts)?;
                    return Ok(Some(ts));
                }
            }
            return Ok(None);
        }

        for track in self.lo..=self.hi {
            if track == self.base {
                continue;
            }
            if let Some(ts) = self.first_free_on(track, 0)? {
                self.mark_used(ts)?;
                return Ok(Some(ts));
            }
        }
        if let Some(ts) = self.first_free_on(self.base, 4)? {
            self.mark_used(ts)?;
            return Ok(Some(ts));
        }
        Ok(None)
    }

    /// Allocate a directory-chain sector on the system track (sectors
    /// 4-39; 0-3 are reserved).
    pub fn alloc_directory_sector(&mut self) -> Result<Option<Ts>, Error> {
        if let Some(ts) = self.first_free_on(self.base, 4)? {
            self.mark_used(ts)?;
            return Ok(Some(ts));
        }
        Ok(None)
    }

    fn first_free_on(&self, track: u8, from_sector: u8) -> Result<Option<Ts>, Error> {
        if self.track_free_count(track)? == 0 {
            return Ok(None);
        }
        for sector in from_sector..40 {
            let ts = Ts::new(track, sector);
            if self.is_free(ts)? {
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    /// True when every sector of the track is free.
    pub fn track_fully_free(&self, track: u8) -> Result<bool, Error> {
        Ok(self.track_free_count(track)? == 40)
    }
}

fn check_d81_track(track: u8) -> Result<(), Error> {
    if track == 0 || track > 80 {
        return Err(Error::new(ErrorKind::InvalidPath(format!(
            "BAM track {} out of range",
            track
        ))));
    }
    Ok(())
}

impl BlockMap for D81Bam {
    fn is_free(&self, ts: Ts) -> Result<bool, Error> {
        let entry = self.entry(ts.track)?;
        Ok(bitmap_is_free(&entry[1..6], ts.sector))
    }

    fn mark_used(&mut self, ts: Ts) -> Result<(), Error> {
        let entry = self.entry_mut(ts.track)?;
        if bitmap_is_free(&entry[1..6], ts.sector) {
            bitmap_clear(&mut entry[1..6], ts.sector);
            entry[0] -= 1;
        }
        Ok(())
    }

    fn mark_free(&mut self, ts: Ts) -> Result<(), Error> {
        let entry = self.entry_mut(ts.track)?;
        if !bitmap_is_free(&entry[1..6], ts.sector) {
            bitmap_set(&mut entry[1..6], ts.sector);
            entry[0] += 1;
        }
        Ok(())
    }

    fn track_free_count(&self, track: u8) -> Result<u8, Error> {
        Ok(self.entry(track)?[0])
    }

    fn set_track_all_free(&mut self, track: u8) -> Result<(), Error> {
        let entry = self.entry_mut(track)?;
        entry[0] = 40;
        entry[1..6].fill(0xFF);
        Ok(())
    }

    fn set_track_all_used(&mut self, track: u8) -> Result<(), Error> {
        let entry = self.entry_mut(track)?;
        entry[0] = 0;
        entry[1..6].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockMap, D64Bam, D71Bam, D81Bam};
    use crate::disk_format::geometry::{Geometry, Ts};
    use pretty_assertions::assert_eq;

    fn popcount(bits: &[u8]) -> u32 {
        bits.iter().map(|b| b.count_ones()).sum()
    }

    #[test]
    fn d64_mark_is_idempotent_and_counted() {
        let geometry = Geometry::detect(174_848).unwrap();
        let mut bam = D64Bam::new_blank(geometry).unwrap();

        let ts = Ts::new(1, 5);
        assert!(bam.is_free(ts).unwrap());
        assert_eq!(bam.track_free_count(1).unwrap(), 21);

        bam.mark_used(ts).unwrap();
        bam.mark_used(ts).unwrap();
        assert!(!bam.is_free(ts).unwrap());
        assert_eq!(bam.track_free_count(1).unwrap(), 20);

        bam.mark_free(ts).unwrap();
        bam.mark_free(ts).unwrap();
        assert!(bam.is_free(ts).unwrap());
        assert_eq!(bam.track_free_count(1).unwrap(), 21);
    }

    /// The free count must always equal the bitmap popcount.
    #[test]
    fn d64_free_count_matches_popcount() {
        let geometry = Geometry::detect(174_848).unwrap();
        let mut bam = D64Bam::new_blank(geometry).unwrap();

        for _ in 0..30 {
            bam.alloc_data_sector().unwrap().unwrap();
        }
        bam.mark_free(Ts::new(1, 3)).unwrap();

        for track in 1..=35u8 {
            let entry = 0x04 + (track as usize - 1) * 4;
            let sector = bam.bytes_mut();
            let count = sector[entry] as u32;
            let bits = popcount(&sector[entry + 1..entry + 4]);
            assert_eq!(count, bits, "track {}", track);
        }
    }

    #[test]
    fn d64_allocation_is_first_free_from_track_one() {
        let geometry = Geometry::detect(174_848).unwrap();
        let mut bam = D64Bam::new_blank(geometry).unwrap();

        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(1, 0)));
        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(1, 1)));

        bam.set_track_all_used(1).unwrap();
        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(2, 0)));
    }

    #[test]
    fn d64_directory_extension_prefers_sector_two() {
        let geometry = Geometry::detect(174_848).unwrap();
        let mut bam = D64Bam::new_blank(geometry).unwrap();

        assert_eq!(bam.alloc_directory_sector().unwrap(), Some(Ts::new(18, 2)));
        assert_eq!(bam.alloc_directory_sector().unwrap(), Some(Ts::new(18, 3)));
    }

    #[test]
    fn d71_single_sided_upper_tracks_are_inert() {
        let geometry = Geometry::detect(349_696).unwrap();
        let mut bam = D71Bam::new_blank(geometry).unwrap();
        bam.bytes_mut()[3] = 0; // clear the double-sided flag

        let ts = Ts::new(40, 0);
        assert!(!bam.is_free(ts).unwrap());
        bam.mark_free(ts).unwrap();
        assert!(!bam.is_free(ts).unwrap());
        assert_eq!(bam.track_free_count(40).unwrap(), 0);
    }

    #[test]
    fn d71_double_sided_upper_tracks_allocate() {
        let geometry = Geometry::detect(349_696).unwrap();
        let mut bam = D71Bam::new_blank(geometry).unwrap();
        assert!(bam.double_sided());

        for track in 1..=35u8 {
            bam.set_track_all_used(track).unwrap();
        }
        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(36, 0)));
        assert_eq!(bam.track_free_count(36).unwrap(), 20);
    }

    #[test]
    fn d81_root_allocation_skips_track_forty() {
        let mut bam = D81Bam::new_blank(40, 1, 80, *b"CB");
        for track in 1..=80u8 {
            if track != 40 {
                bam.set_track_all_free(track).unwrap();
            }
        }

        for track in 1..=39u8 {
            bam.set_track_all_used(track).unwrap();
        }
        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(41, 0)));
    }

    #[test]
    fn d81_partition_policy_reserves_system_sectors() {
        // A three-track partition at tracks 10-12.
        let mut bam = D81Bam::new_blank(10, 10, 12, *b"CB");
        for track in 10..=12u8 {
            bam.set_track_all_free(track).unwrap();
        }
        for sector in 0..4u8 {
            bam.mark_used(Ts::new(10, sector)).unwrap();
        }

        // Data prefers the non-system tracks.
        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(11, 0)));

        bam.set_track_all_used(11).unwrap();
        bam.set_track_all_used(12).unwrap();

        // Fallback lands after the reserved sectors of the first track.
        assert_eq!(bam.alloc_data_sector().unwrap(), Some(Ts::new(10, 4)));
    }

    #[test]
    fn d81_track_fully_free() {
        let mut bam = D81Bam::new_blank(40, 1, 80, *b"CB");
        bam.set_track_all_free(7).unwrap();
        assert!(bam.track_fully_free(7).unwrap());
        bam.mark_used(Ts::new(7, 0)).unwrap();
        assert!(!bam.track_fully_free(7).unwrap());
    }
}
