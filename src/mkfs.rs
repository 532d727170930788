// Turn a pre-sized blank image into a valid empty volume. The caller
// supplies the backing bytes (a mapped file or a staging buffer); all
// reads and writes here go through the copy forms, so the buffer needs
// no particular alignment.
//
// Everything is validated before the first byte changes, and the
// superblock goes in last: a format that fails leaves any prior volume
// untouched.

use log::debug;
use zerocopy::{FromZeros, IntoBytes};

use crate::bitmap::Bitmap;
use crate::error::{FsError, Result};
use crate::layout::{
    itable_blocks, DInode, Dirent, SuperBlock, TimeSpec, BLK_MAX, BLK_MIN, BSIZE, DBITMAP_BLK,
    DPB, FSMAGIC, IBITMAP_BLK, INO_MAX, ITABLE_BLK, ROOTINO,
};

pub struct FormatOpts {
    /// How many inodes the volume will hold.
    pub ninodes: u32,
    /// Overwrite an image that already holds a volume.
    pub force: bool,
    /// Zero the whole image before laying the volume down.
    pub zero: bool,
}

/// Format `img` as an empty volume.
pub fn format(img: &mut [u8], opts: &FormatOpts) -> Result<()> {
    if img.is_empty() || img.len() % BSIZE != 0 {
        return Err(FsError::BadImage("not a whole number of blocks"));
    }
    let nblocks = (img.len() / BSIZE) as u64;
    if !(BLK_MIN..=BLK_MAX).contains(&nblocks) {
        return Err(FsError::BadImage("block count out of range"));
    }
    let nblocks = nblocks as u32;
    let n = opts.ninodes;
    if n == 0 || n >= INO_MAX || n as usize > 8 * BSIZE {
        return Err(FsError::BadImage("inode count out of range"));
    }
    let itable = itable_blocks(n);
    let data_region = ITABLE_BLK + itable;
    // the data region must fit at least the root directory block
    if data_region >= nblocks {
        return Err(FsError::BadImage("inode table leaves no data region"));
    }

    let magic = u64::from_ne_bytes(img[..8].try_into().expect("magic field"));
    if magic == FSMAGIC && !opts.force {
        return Err(FsError::VolumePresent);
    }

    if opts.zero {
        img.fill(0);
    }

    // Inode bitmap: everything allocated, then the real range cleared,
    // then the root inode claimed.
    let iblk = block_mut(img, IBITMAP_BLK);
    iblk.fill(0xff);
    let mut ibm = Bitmap::new(iblk, n);
    ibm.init();
    ibm.set(ROOTINO, true);

    // Data bitmap: same fill, then the metadata blocks claimed and the
    // root directory block taken as the first free one.
    let dblk = block_mut(img, DBITMAP_BLK);
    dblk.fill(0xff);
    let mut dbm = Bitmap::new(dblk, nblocks);
    dbm.init();
    for bno in 0..data_region {
        dbm.set(bno, true);
    }
    let rootblk = dbm.alloc().expect("room for the root directory");
    debug_assert_eq!(rootblk, data_region);

    // Root inode.
    let mut root = DInode::new_zeroed();
    root.mode = libc::S_IFDIR | 0o777;
    root.nlink = 2;
    root.size = BSIZE as u64;
    root.blocks = 1;
    root.mtime = TimeSpec::now();
    root.direct[0] = rootblk;
    let itable_off = ITABLE_BLK as usize * BSIZE;
    root.write_to(&mut img[itable_off..itable_off + std::mem::size_of::<DInode>()])
        .expect("root inode");

    // Root directory block: ".", "..", and free slots after them.
    let blk = block_mut(img, rootblk);
    blk.fill(0);
    let mut de = Dirent::new_zeroed();
    for (slot, name) in [(0usize, b".".as_ref()), (1, b"..".as_ref())] {
        de.ino = ROOTINO;
        de.set_name(name);
        de.write_to(&mut blk[slot * 256..][..256]).expect("dot entry");
    }
    de = Dirent::new_zeroed();
    de.ino = INO_MAX;
    for slot in 2..DPB {
        de.write_to(&mut blk[slot * 256..][..256]).expect("free entry");
    }

    // Superblock last, once every other structure is in place.
    let sb = SuperBlock::new(
        img.len() as u64,
        n,
        n - 1,
        nblocks,
        nblocks - (data_region + 1),
        data_region,
    );
    block_mut(img, 0).fill(0);
    sb.write_to_prefix(img).expect("superblock");

    debug!(
        "format: {} blocks ({} inode table, {} data), {} inodes",
        nblocks,
        itable,
        nblocks - data_region,
        n
    );
    Ok(())
}

fn block_mut(img: &mut [u8], bno: u32) -> &mut [u8] {
    &mut img[bno as usize * BSIZE..][..BSIZE]
}
