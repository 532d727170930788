// The mounted volume and the operations the kernel bridge invokes on
// it.
//
// The image is one flat byte region; the superblock, the two bitmaps,
// the inode table and every data block are views into it at block-
// aligned offsets. Inodes are read out as copies and written back whole
// so that bitmap and block views never alias an inode borrow; short-
// lived in-place views cover the read paths.
//
// Every operation runs to completion with exclusive access to the
// mapping; the bridge delivers one call at a time.

use std::cmp::min;
use std::collections::HashSet;
use std::mem;

use log::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::bitmap::{self, Bitmap};
use crate::error::{FsError, Result};
use crate::image::Image;
use crate::layout::{
    itable_blocks, DInode, Dirent, SuperBlock, TimeSpec, BSIZE, DBITMAP_BLK, FSMAGIC, IBITMAP_BLK,
    INO_MAX, ITABLE_BLK, MAXFILE, NAMEMAX, NDIRECT, ROOTINO,
};

/// A mounted volume: the mapped image plus the views derived from it.
pub struct Vsfs {
    image: Image,
}

/// What getattr reports for one file.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    /// Occupancy in 512-byte units, the way stat(2) counts.
    pub blocks512: u64,
    pub mtime: TimeSpec,
}

/// What statfs reports for the volume.
#[derive(Debug, Clone, Copy)]
pub struct VolStat {
    pub bsize: u32,
    pub blocks: u32,
    pub bfree: u32,
    pub files: u32,
    pub ffree: u32,
    pub namemax: u32,
}

/// The three shapes of a utimens request.
#[derive(Debug, Clone, Copy)]
pub enum SetTime {
    Omit,
    Now,
    At(TimeSpec),
}

impl Vsfs {
    /// Map the image file at `path` and mount it.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Vsfs> {
        Vsfs::mount(Image::map(path)?)
    }

    /// Mount an image. Rejects anything that is not a plausible volume
    /// before the first operation can touch it.
    pub fn mount(image: Image) -> Result<Vsfs> {
        let fs = Vsfs { image };
        let sb = fs.sb();
        if sb.magic != FSMAGIC {
            return Err(FsError::BadImage("bad magic"));
        }
        if sb.size != fs.image.len() as u64 || sb.num_blocks as usize * BSIZE != fs.image.len() {
            return Err(FsError::BadImage("size fields disagree with the mapping"));
        }
        if sb.num_inodes == 0 || sb.num_inodes as usize > 8 * BSIZE {
            return Err(FsError::BadImage("inode count out of range"));
        }
        if sb.data_region <= ITABLE_BLK || sb.data_region >= sb.num_blocks {
            return Err(FsError::BadImage("data region out of range"));
        }
        // every inode slot must land before the data region
        if ITABLE_BLK + itable_blocks(sb.num_inodes) > sb.data_region {
            return Err(FsError::BadImage("inode table overruns the data region"));
        }
        debug!(
            "mount: {} blocks ({} free), {} inodes ({} free)",
            sb.num_blocks, sb.free_blocks, sb.num_inodes, sb.free_inodes
        );
        Ok(fs)
    }

    /// Release the volume, handing the mapping back. Dropping the image
    /// unmaps it and the page cache settles the file.
    pub fn unmount(self) -> Image {
        self.image
    }

    /// Raw view of the whole image.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_slice()
    }

    // Views into the mapping.

    fn sb(&self) -> &SuperBlock {
        SuperBlock::ref_from_prefix(self.image.as_slice())
            .expect("superblock view")
            .0
    }

    fn sb_mut(&mut self) -> &mut SuperBlock {
        SuperBlock::mut_from_prefix(self.image.as_mut_slice())
            .expect("superblock view")
            .0
    }

    fn block(&self, bno: u32) -> &[u8] {
        &self.image.as_slice()[bno as usize * BSIZE..][..BSIZE]
    }

    fn block_mut(&mut self, bno: u32) -> &mut [u8] {
        &mut self.image.as_mut_slice()[bno as usize * BSIZE..][..BSIZE]
    }

    fn ibitmap(&mut self) -> Bitmap<'_> {
        let n = self.sb().num_inodes;
        Bitmap::new(self.block_mut(IBITMAP_BLK), n)
    }

    fn dbitmap(&mut self) -> Bitmap<'_> {
        let n = self.sb().num_blocks;
        Bitmap::new(self.block_mut(DBITMAP_BLK), n)
    }

    fn inode_off(ino: u32) -> usize {
        ITABLE_BLK as usize * BSIZE + ino as usize * mem::size_of::<DInode>()
    }

    /// Borrow inode `ino` in place.
    fn dinode(&self, ino: u32) -> &DInode {
        let off = Self::inode_off(ino);
        DInode::ref_from_bytes(&self.image.as_slice()[off..off + mem::size_of::<DInode>()])
            .expect("inode view")
    }

    /// Copy inode `ino` out of the table.
    fn rinode(&self, ino: u32) -> DInode {
        DInode::read_from_bytes(
            &self.image.as_slice()[Self::inode_off(ino)..][..mem::size_of::<DInode>()],
        )
        .expect("inode copy")
    }

    /// Write `din` back into the table.
    fn winode(&mut self, ino: u32, din: &DInode) {
        let off = Self::inode_off(ino);
        din.write_to(&mut self.image.as_mut_slice()[off..off + mem::size_of::<DInode>()])
            .expect("inode writeback")
    }

    fn dirents(&self, bno: u32) -> &[Dirent] {
        <[Dirent]>::ref_from_bytes(self.block(bno)).expect("dirent view")
    }

    fn dirents_mut(&mut self, bno: u32) -> &mut [Dirent] {
        <[Dirent]>::mut_from_bytes(self.block_mut(bno)).expect("dirent view")
    }

    // Allocation. The superblock counters shadow the bitmap populations
    // and move in the same step.

    fn balloc(&mut self) -> Result<u32> {
        let Some(bno) = self.dbitmap().alloc() else {
            warn!("balloc: out of data blocks");
            return Err(FsError::NoSpace);
        };
        self.sb_mut().free_blocks -= 1;
        self.block_mut(bno).fill(0);
        Ok(bno)
    }

    fn bfree(&mut self, bno: u32) {
        self.dbitmap().free(bno);
        self.sb_mut().free_blocks += 1;
    }

    fn ialloc(&mut self) -> Result<u32> {
        let Some(ino) = self.ibitmap().alloc() else {
            warn!("ialloc: out of inodes");
            return Err(FsError::NoSpace);
        };
        self.sb_mut().free_inodes -= 1;
        self.winode(ino, &DInode::new_zeroed());
        Ok(ino)
    }

    fn ifree(&mut self, ino: u32) {
        // Scrub the record so a create/unlink pair leaves no residue.
        self.winode(ino, &DInode::new_zeroed());
        self.ibitmap().free(ino);
        self.sb_mut().free_inodes += 1;
    }

    // Block addressing.

    /// Block number holding file block `bn` of `din`.
    fn bmap(&self, din: &DInode, bn: u32) -> u32 {
        let bn = bn as usize;
        debug_assert!(bn < din.blocks as usize);
        if bn < NDIRECT {
            din.direct[bn]
        } else {
            let tbl = <[u32]>::ref_from_bytes(self.block(din.indirect)).expect("indirect view");
            tbl[bn - NDIRECT]
        }
    }

    /// Record `bno` as file block `bn` of `din`. For indirect slots the
    /// entry goes straight into the indirect block; the caller commits
    /// the inode copy itself.
    fn set_bmap(&mut self, din: &mut DInode, bn: u32, bno: u32) {
        let bn = bn as usize;
        if bn < NDIRECT {
            din.direct[bn] = bno;
        } else {
            let tbl =
                <[u32]>::mut_from_bytes(self.block_mut(din.indirect)).expect("indirect view");
            tbl[bn - NDIRECT] = bno;
        }
    }

    // Path resolution. The namespace is one root directory, so a path
    // is "/" or "/" followed by a single entry name.

    /// Resolve an absolute path to an inode number.
    pub fn namei(&self, path: &[u8]) -> Result<u32> {
        if path == b"/" {
            return Ok(ROOTINO);
        }
        let name = final_name(path)?;
        self.dirlookup(name)
            .map(|(_, ino)| ino)
            .ok_or(FsError::NotFound)
    }

    /// Scan the root directory for `name`. Returns the slot index and
    /// the stored inode number.
    fn dirlookup(&self, name: &[u8]) -> Option<(usize, u32)> {
        let rootblk = self.dinode(ROOTINO).direct[0];
        self.dirents(rootblk)
            .iter()
            .enumerate()
            .find(|(_, de)| de.ino != INO_MAX && de.name_bytes() == name)
            .map(|(slot, de)| (slot, de.ino))
    }

    fn touch_root(&mut self) {
        let mut root = self.rinode(ROOTINO);
        root.mtime = TimeSpec::now();
        self.winode(ROOTINO, &root);
    }

    // The operation surface.

    /// Volume-wide numbers. Never fails; the path argument of the
    /// bridge call carries no information here.
    pub fn statfs(&self) -> VolStat {
        let sb = self.sb();
        VolStat {
            bsize: BSIZE as u32,
            blocks: sb.num_blocks,
            bfree: sb.free_blocks,
            files: sb.num_inodes,
            ffree: sb.free_inodes,
            namemax: NAMEMAX as u32,
        }
    }

    pub fn getattr(&self, path: &[u8]) -> Result<FileStat> {
        let ino = self.namei(path)?;
        Ok(self.stat_of(ino))
    }

    pub(crate) fn stat_of(&self, ino: u32) -> FileStat {
        let din = self.dinode(ino);
        FileStat {
            ino,
            mode: din.mode,
            nlink: din.nlink,
            size: din.size,
            blocks512: din.size.div_ceil(512),
            mtime: din.mtime,
        }
    }

    /// Stream the live entry names of the root directory into `fill`,
    /// together with their inode numbers. `fill` returns false once it
    /// cannot take another name. The "." and ".." entries the formatter
    /// stores are implementation furniture and are not streamed.
    pub fn readdir<F>(&self, path: &[u8], mut fill: F) -> Result<()>
    where
        F: FnMut(&[u8], u32) -> bool,
    {
        let ino = self.namei(path)?;
        let din = self.dinode(ino);
        debug_assert!(din.is_dir());
        for de in self.dirents(din.direct[0]) {
            if de.ino == INO_MAX {
                continue;
            }
            let name = de.name_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            if !fill(name, de.ino) {
                return Err(FsError::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Create an empty regular file. The bridge guarantees the name is
    /// fresh; claiming the directory slot before the inode means a full
    /// directory never strands a half-made inode.
    pub fn create(&mut self, path: &[u8], mode: u32) -> Result<u32> {
        let name = final_name(path)?;
        if self.sb().free_inodes == 0 {
            warn!("create: out of inodes");
            return Err(FsError::NoSpace);
        }
        let rootblk = self.dinode(ROOTINO).direct[0];
        let Some(slot) = self
            .dirents(rootblk)
            .iter()
            .position(|de| de.ino == INO_MAX)
        else {
            warn!("create: root directory is full");
            return Err(FsError::NoSpace);
        };

        let ino = self.ialloc()?;
        let mut din = DInode::new_zeroed();
        din.mode = mode;
        din.nlink = 1;
        din.mtime = TimeSpec::now();
        self.winode(ino, &din);

        let de = &mut self.dirents_mut(rootblk)[slot];
        de.ino = ino;
        de.set_name(name);
        self.touch_root();
        debug!("create: {:?} -> inode {}", String::from_utf8_lossy(name), ino);
        Ok(ino)
    }

    /// Drop a name. When the last link goes, every owned data block,
    /// the indirect block included, returns to the free map and the
    /// inode is released.
    pub fn unlink(&mut self, path: &[u8]) -> Result<()> {
        let name = final_name(path)?;
        let (slot, ino) = self.dirlookup(name).ok_or(FsError::NotFound)?;
        let mut din = self.rinode(ino);
        din.nlink -= 1;
        if din.nlink == 0 {
            self.free_owned_blocks(&din);
            self.ifree(ino);
        } else {
            self.winode(ino, &din);
        }

        let rootblk = self.dinode(ROOTINO).direct[0];
        let de = &mut self.dirents_mut(rootblk)[slot];
        de.ino = INO_MAX;
        de.name.fill(0);
        self.touch_root();
        debug!("unlink: {:?} (inode {})", String::from_utf8_lossy(name), ino);
        Ok(())
    }

    fn free_owned_blocks(&mut self, din: &DInode) {
        for i in 0..min(din.blocks as usize, NDIRECT) {
            self.bfree(din.direct[i]);
        }
        if din.blocks as usize > NDIRECT {
            let n = din.blocks as usize - NDIRECT;
            let tbl = <[u32]>::ref_from_bytes(self.block(din.indirect)).expect("indirect view");
            let owned: Vec<u32> = tbl[..n].to_vec();
            for bno in owned {
                self.bfree(bno);
            }
            self.bfree(din.indirect);
        }
    }

    pub fn truncate(&mut self, path: &[u8], new_size: u64) -> Result<()> {
        let ino = self.namei(path)?;
        self.itrunc(ino, new_size)
    }

    /// Grow or shrink a file to `new_size`. Newly exposed bytes read as
    /// zero. Nothing is committed to the inode until every allocation
    /// has succeeded; a failed grow returns its blocks to the free map.
    fn itrunc(&mut self, ino: u32, new_size: u64) -> Result<()> {
        let new_blocks = new_size.div_ceil(BSIZE as u64) as usize;
        if new_blocks > MAXFILE {
            return Err(FsError::TooLarge);
        }
        let new_blocks = new_blocks as u32;
        let mut din = self.rinode(ino);
        if new_size == din.size {
            return Ok(());
        }
        let old_size = din.size;

        if new_blocks > din.blocks {
            self.grow(&mut din, new_blocks)?;
        } else if new_blocks < din.blocks {
            self.shrink(&mut din, new_blocks);
        }

        // A grow past EOF must not expose stale bytes in the old tail
        // block; fresh blocks come zeroed off the allocator already.
        if new_size > old_size && old_size % BSIZE as u64 != 0 {
            let last = self.bmap(&din, (old_size / BSIZE as u64) as u32);
            self.block_mut(last)[old_size as usize % BSIZE..].fill(0);
        }

        din.size = new_size;
        din.blocks = new_blocks;
        din.mtime = TimeSpec::now();
        self.winode(ino, &din);
        debug!("truncate: inode {} to {} bytes", ino, new_size);
        Ok(())
    }

    fn grow(&mut self, din: &mut DInode, new_blocks: u32) -> Result<()> {
        let mut added: Vec<u32> = Vec::new();
        let mut new_indirect = false;
        for bn in din.blocks..new_blocks {
            if bn as usize >= NDIRECT && din.indirect == 0 {
                match self.balloc() {
                    Ok(bno) => {
                        din.indirect = bno;
                        new_indirect = true;
                    }
                    Err(e) => {
                        self.ungrow(din, &added, new_indirect);
                        return Err(e);
                    }
                }
            }
            match self.balloc() {
                Ok(bno) => {
                    self.set_bmap(din, bn, bno);
                    added.push(bno);
                }
                Err(e) => {
                    self.ungrow(din, &added, new_indirect);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Undo a partial grow. The inode copy is discarded by the caller,
    /// so only the free map and counters need repair.
    fn ungrow(&mut self, din: &mut DInode, added: &[u32], new_indirect: bool) {
        for &bno in added.iter().rev() {
            self.bfree(bno);
        }
        if new_indirect {
            self.bfree(din.indirect);
            din.indirect = 0;
        }
    }

    fn shrink(&mut self, din: &mut DInode, new_blocks: u32) {
        for bn in (new_blocks..din.blocks).rev() {
            let bno = self.bmap(din, bn);
            self.bfree(bno);
            if (bn as usize) < NDIRECT {
                din.direct[bn as usize] = 0;
            }
        }
        if din.blocks as usize > NDIRECT && new_blocks as usize <= NDIRECT {
            self.bfree(din.indirect);
            din.indirect = 0;
        }
    }

    /// Read up to `buf.len()` bytes at `off`. Returns 0 at or past EOF.
    /// The bridge splits requests at block boundaries; a stray longer
    /// range comes back short rather than stitched.
    pub fn read(&self, path: &[u8], off: u64, buf: &mut [u8]) -> Result<usize> {
        let ino = self.namei(path)?;
        let din = self.dinode(ino);
        if off >= din.size {
            return Ok(0);
        }
        let mut n = min(buf.len() as u64, din.size - off) as usize;
        n = min(n, BSIZE - off as usize % BSIZE);
        let bno = self.bmap(din, (off / BSIZE as u64) as u32);
        buf[..n].copy_from_slice(&self.block(bno)[off as usize % BSIZE..][..n]);
        Ok(n)
    }

    /// Write `buf` at `off`, extending the file through the truncate
    /// path when the range reaches past EOF. Writes must land at or
    /// before EOF; the volume has no sparse holes.
    pub fn write(&mut self, path: &[u8], buf: &[u8], off: u64) -> Result<usize> {
        let ino = self.namei(path)?;
        let mut din = self.rinode(ino);
        if off > din.size {
            return Err(FsError::TooLarge);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = min(buf.len(), BSIZE - off as usize % BSIZE);
        let end = off + n as u64;
        if end > din.size {
            self.itrunc(ino, end)?;
            din = self.rinode(ino);
        }
        let bno = self.bmap(&din, (off / BSIZE as u64) as u32);
        self.block_mut(bno)[off as usize % BSIZE..][..n].copy_from_slice(&buf[..n]);
        din.mtime = TimeSpec::now();
        self.winode(ino, &din);
        Ok(n)
    }

    pub fn utimens(&mut self, path: &[u8], t: SetTime) -> Result<()> {
        let ino = self.namei(path)?;
        let mtime = match t {
            SetTime::Omit => return Ok(()),
            SetTime::Now => TimeSpec::now(),
            SetTime::At(ts) => ts,
        };
        let mut din = self.rinode(ino);
        din.mtime = mtime;
        self.winode(ino, &din);
        Ok(())
    }

    /// Consistency pass over the whole volume: counters against bitmap
    /// populations, per-inode block accounting and exclusive ownership,
    /// and the shape of the root directory. Cheap enough for tests to
    /// run between operations.
    pub fn check(&self) -> std::result::Result<(), String> {
        let sb = *self.sb();
        let ibits = self.block(IBITMAP_BLK);
        let dbits = self.block(DBITMAP_BLK);

        if sb.free_inodes != bitmap::count_clear(ibits, sb.num_inodes) {
            return Err(format!(
                "free_inodes {} disagrees with the inode bitmap",
                sb.free_inodes
            ));
        }
        if sb.free_blocks != bitmap::count_clear(dbits, sb.num_blocks) {
            return Err(format!(
                "free_blocks {} disagrees with the data bitmap",
                sb.free_blocks
            ));
        }
        for bno in 0..sb.data_region {
            if !bitmap::isset(dbits, bno) {
                return Err(format!("metadata block {} is marked free", bno));
            }
        }

        let mut owned = HashSet::new();
        for ino in 0..sb.num_inodes {
            if !bitmap::isset(ibits, ino) {
                continue;
            }
            let din = self.dinode(ino);
            if din.nlink == 0 {
                return Err(format!("allocated inode {} has nlink 0", ino));
            }
            if din.blocks as usize > MAXFILE
                || din.size.div_ceil(BSIZE as u64) > din.blocks as u64
            {
                return Err(format!(
                    "inode {}: size {} does not fit in {} blocks",
                    ino, din.size, din.blocks
                ));
            }
            let mut claim = |bno: u32| -> std::result::Result<(), String> {
                if bno < sb.data_region || bno >= sb.num_blocks {
                    return Err(format!("inode {} points at block {}", ino, bno));
                }
                if !bitmap::isset(dbits, bno) {
                    return Err(format!("inode {} owns free block {}", ino, bno));
                }
                if !owned.insert(bno) {
                    return Err(format!("block {} is owned twice", bno));
                }
                Ok(())
            };
            for bn in 0..min(din.blocks as usize, NDIRECT) {
                claim(din.direct[bn])?;
            }
            if din.blocks as usize > NDIRECT {
                claim(din.indirect)?;
                let tbl =
                    <[u32]>::ref_from_bytes(self.block(din.indirect)).expect("indirect view");
                for &bno in &tbl[..din.blocks as usize - NDIRECT] {
                    claim(bno)?;
                }
            }
        }

        if !bitmap::isset(ibits, ROOTINO) {
            return Err("root inode is not allocated".into());
        }
        let root = self.dinode(ROOTINO);
        if !root.is_dir() || root.blocks != 1 || root.size != BSIZE as u64 {
            return Err("root inode is not a one-block directory".into());
        }
        let mut names = HashSet::new();
        let mut dots = 0;
        for de in self.dirents(root.direct[0]) {
            if de.ino == INO_MAX {
                continue;
            }
            if de.name_bytes() == b"." || de.name_bytes() == b".." {
                if de.ino != ROOTINO {
                    return Err("dot entry does not refer to the root".into());
                }
                dots += 1;
                continue;
            }
            if !names.insert(de.name_bytes().to_vec()) {
                return Err(format!(
                    "duplicate directory entry {:?}",
                    String::from_utf8_lossy(de.name_bytes())
                ));
            }
            if !bitmap::isset(ibits, de.ino) {
                return Err(format!("entry refers to free inode {}", de.ino));
            }
        }
        if dots != 2 {
            return Err("root directory is missing its dot entries".into());
        }
        Ok(())
    }
}

/// Validate a path of the form "/NAME" and return NAME. Anything with
/// more structure cannot exist on this volume.
fn final_name(path: &[u8]) -> Result<&[u8]> {
    if path.len() > NAMEMAX + 1 {
        return Err(FsError::NameTooLong);
    }
    if path.first() != Some(&b'/') {
        return Err(FsError::NotFound);
    }
    let name = &path[1..];
    if name.is_empty() || name.contains(&b'/') {
        return Err(FsError::NotFound);
    }
    if name.len() >= NAMEMAX {
        // no room left for the terminating NUL
        return Err(FsError::NameTooLong);
    }
    Ok(name)
}
