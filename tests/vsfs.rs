// End-to-end pass over a real image file: format it, mount the mapping
// and drive the operation surface the way the kernel bridge would,
// verifying the volume after every step.

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use vsfs::layout::BSIZE;
use vsfs::mkfs::{format, FormatOpts};
use vsfs::{Image, Vsfs};

const MIB: usize = 1 << 20;

fn blank_image(dir: &TempDir, len: usize) -> PathBuf {
    let path = dir.path().join("disk.img");
    fs::write(&path, vec![0u8; len]).unwrap();
    path
}

fn format_file(path: &PathBuf, ninodes: u32) {
    let mut image = Image::map(path).unwrap();
    format(
        image.as_mut_slice(),
        &FormatOpts {
            ninodes,
            force: false,
            zero: false,
        },
    )
    .unwrap();
}

#[test]
fn full_lifecycle_on_a_mapped_file() {
    let dir = TempDir::new().unwrap();
    let path = blank_image(&dir, MIB);

    // format: a 1 MiB image with 64 inodes
    format_file(&path, 64);
    let fs = Vsfs::mount(Image::map(&path).unwrap()).unwrap();
    fs.check().unwrap();

    let vs = fs.statfs();
    assert_eq!(vs.blocks, 256);
    assert_eq!(vs.files, 64);
    assert_eq!(vs.ffree, 63);
    assert_eq!(vs.bfree, 249);
    assert_eq!(vs.bsize, BSIZE as u32);

    // a fresh volume lists nothing and the root is a one-block directory
    let mut names: Vec<Vec<u8>> = Vec::new();
    fs.readdir(b"/", |name, _| {
        names.push(name.to_vec());
        true
    })
    .unwrap();
    assert!(names.is_empty());
    let root = fs.getattr(b"/").unwrap();
    assert_eq!(root.size, BSIZE as u64);
    assert_eq!(root.nlink, 2);

    let baseline = fs.statfs();
    let mut fs = fs;

    // create
    fs.create(b"/hello", libc::S_IFREG | 0o644).unwrap();
    fs.check().unwrap();
    let st = fs.getattr(b"/hello").unwrap();
    assert_eq!((st.size, st.nlink, st.blocks512), (0, 1, 0));
    assert_eq!(fs.statfs().ffree, baseline.ffree - 1);

    // write, then read back through the same mapping
    assert_eq!(fs.write(b"/hello", b"abcdef", 0).unwrap(), 6);
    fs.check().unwrap();
    let st = fs.getattr(b"/hello").unwrap();
    assert_eq!((st.size, st.blocks512), (6, 1));
    assert_eq!(fs.statfs().bfree, baseline.bfree - 1);
    let mut buf = [0u8; 10];
    assert_eq!(fs.read(b"/hello", 0, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"abcdef");

    // grow past the first block; the exposed range reads as zeros
    fs.truncate(b"/hello", 5000).unwrap();
    fs.check().unwrap();
    assert_eq!(fs.getattr(b"/hello").unwrap().size, 5000);
    assert_eq!(fs.statfs().bfree, baseline.bfree - 2);
    let mut block = vec![0xffu8; BSIZE];
    let n = fs.read(b"/hello", 6, &mut block).unwrap();
    assert_eq!(n, BSIZE - 6);
    assert!(block[..n].iter().all(|&b| b == 0));
    let n = fs.read(b"/hello", BSIZE as u64, &mut block).unwrap();
    assert_eq!(n, 5000 - BSIZE);
    assert!(block[..n].iter().all(|&b| b == 0));

    // shrink away and unlink; the counters land exactly where they began
    fs.truncate(b"/hello", 0).unwrap();
    fs.check().unwrap();
    fs.unlink(b"/hello").unwrap();
    fs.check().unwrap();
    let vs = fs.statfs();
    assert_eq!(vs.ffree, baseline.ffree);
    assert_eq!(vs.bfree, baseline.bfree);
}

#[test]
fn contents_survive_a_remount() {
    let dir = TempDir::new().unwrap();
    let path = blank_image(&dir, MIB);
    format_file(&path, 64);

    {
        let mut fs = Vsfs::mount(Image::map(&path).unwrap()).unwrap();
        fs.create(b"/note", libc::S_IFREG | 0o600).unwrap();
        fs.write(b"/note", b"persisted", 0).unwrap();
        drop(fs.unmount());
    }

    let fs = Vsfs::mount(Image::map(&path).unwrap()).unwrap();
    fs.check().unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(b"/note", 0, &mut buf).unwrap(), 9);
    assert_eq!(&buf[..9], b"persisted");

    let mut names = Vec::new();
    fs.readdir(b"/", |name, _| {
        names.push(name.to_vec());
        true
    })
    .unwrap();
    assert_eq!(names, vec![b"note".to_vec()]);
}

#[test]
fn mount_refuses_an_unformatted_image() {
    let dir = TempDir::new().unwrap();
    let path = blank_image(&dir, 8 * BSIZE);
    assert!(Vsfs::mount(Image::map(&path).unwrap()).is_err());
}

#[test]
fn format_respects_an_existing_volume() {
    let dir = TempDir::new().unwrap();
    let path = blank_image(&dir, MIB);
    format_file(&path, 64);

    let mut image = Image::map(&path).unwrap();
    let again = format(
        image.as_mut_slice(),
        &FormatOpts {
            ninodes: 64,
            force: false,
            zero: false,
        },
    );
    assert!(again.is_err());

    // forcing reformats in place
    format(
        image.as_mut_slice(),
        &FormatOpts {
            ninodes: 32,
            force: true,
            zero: true,
        },
    )
    .unwrap();
    drop(image);
    let fs = Vsfs::mount(Image::map(&path).unwrap()).unwrap();
    fs.check().unwrap();
    assert_eq!(fs.statfs().files, 32);
}
