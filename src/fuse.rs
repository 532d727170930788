// The kernel bridge: adapts fuser's inode-oriented callbacks onto the
// path-oriented core operations.
//
// fuser numbers the root 1 while the volume numbers it 0, so bridge
// inode numbers are shifted by one. The bridge also owns the two
// conventions the core does not: requests are split at block
// boundaries before they reach read/write, and the "." and ".."
// entries a directory listing is expected to open with are synthesized
// here rather than streamed from disk.

use std::cmp::min;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use log::debug;

use crate::fs::{FileStat, SetTime, Vsfs};
use crate::layout::{TimeSpec, BSIZE};

const TTL: Duration = Duration::from_secs(1);

pub struct VsfsFuse {
    fs: Vsfs,
    uid: u32,
    gid: u32,
}

fn fuse_ino(ino: u32) -> u64 {
    ino as u64 + 1
}

fn system_time(ts: TimeSpec) -> SystemTime {
    if ts.sec >= 0 {
        UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs())
    }
}

fn timespec(t: SystemTime) -> TimeSpec {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => TimeSpec {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        },
        Err(e) => TimeSpec {
            sec: -(e.duration().as_secs() as i64),
            nsec: 0,
        },
    }
}

impl VsfsFuse {
    pub fn new(fs: Vsfs) -> VsfsFuse {
        VsfsFuse {
            fs,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr(&self, st: &FileStat) -> FileAttr {
        let kind = if st.mode & libc::S_IFMT == libc::S_IFDIR {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = system_time(st.mtime);
        FileAttr {
            ino: fuse_ino(st.ino),
            size: st.size,
            blocks: st.blocks512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: (st.mode & 0o7777) as u16,
            nlink: st.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BSIZE as u32,
            flags: 0,
        }
    }

    /// Recover the path behind a bridge inode number. The namespace is
    /// one directory, so a scan of the root block settles it.
    fn path_of(&self, ino: u64) -> Option<Vec<u8>> {
        if ino == FUSE_ROOT_ID {
            return Some(b"/".to_vec());
        }
        let target = (ino - 1) as u32;
        let mut path = None;
        let _ = self.fs.readdir(b"/", |name, entry_ino| {
            if entry_ino == target {
                let mut p = vec![b'/'];
                p.extend_from_slice(name);
                path = Some(p);
                false
            } else {
                true
            }
        });
        path
    }

    fn child_path(parent: u64, name: &OsStr) -> Option<Vec<u8>> {
        if parent != FUSE_ROOT_ID {
            return None;
        }
        let mut p = vec![b'/'];
        p.extend_from_slice(name.as_bytes());
        Some(p)
    }
}

impl Filesystem for VsfsFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = Self::child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.getattr(&path) {
            Ok(st) => reply.entry(&TTL, &self.attr(&st), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &self.attr(&st)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&path, size) {
                return reply.error(e.errno());
            }
        }
        let when = match mtime {
            None => SetTime::Omit,
            Some(TimeOrNow::Now) => SetTime::Now,
            Some(TimeOrNow::SpecificTime(t)) => SetTime::At(timespec(t)),
        };
        if let Err(e) = self.fs.utimens(&path, when) {
            return reply.error(e.errno());
        }
        match self.fs.getattr(&path) {
            Ok(st) => reply.attr(&TTL, &self.attr(&st)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = Self::child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        if mode & libc::S_IFMT != libc::S_IFREG {
            // only regular files live on this volume
            return reply.error(libc::EPERM);
        }
        match self.fs.create(&path, libc::S_IFREG | (mode & 0o7777)) {
            Ok(ino) => reply.entry(&TTL, &self.attr(&self.fs.stat_of(ino)), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = Self::child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.create(&path, libc::S_IFREG | (mode & 0o7777)) {
            Ok(ino) => reply.created(&TTL, &self.attr(&self.fs.stat_of(ino)), 0, 0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = Self::child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        let mut data = Vec::with_capacity(size as usize);
        let mut off = offset.max(0) as u64;
        let mut remaining = size as usize;
        let mut chunk = [0u8; BSIZE];
        while remaining > 0 {
            // keep each core call inside one block
            let want = min(remaining, BSIZE - off as usize % BSIZE);
            match self.fs.read(&path, off, &mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&chunk[..n]);
                    off += n as u64;
                    remaining -= n;
                }
                Err(e) => return reply.error(e.errno()),
            }
        }
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        let mut off = offset.max(0) as u64;
        let mut written = 0usize;
        while written < data.len() {
            let want = min(data.len() - written, BSIZE - off as usize % BSIZE);
            match self.fs.write(&path, &data[written..written + want], off) {
                Ok(n) => {
                    written += n;
                    off += n as u64;
                }
                Err(e) => {
                    if written > 0 {
                        break;
                    }
                    return reply.error(e.errno());
                }
            }
        }
        reply.written(written as u32);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != FUSE_ROOT_ID {
            return reply.error(libc::ENOTDIR);
        }
        let mut entries: Vec<(u64, Vec<u8>)> = vec![
            (FUSE_ROOT_ID, b".".to_vec()),
            (FUSE_ROOT_ID, b"..".to_vec()),
        ];
        if let Err(e) = self.fs.readdir(b"/", |name, entry_ino| {
            entries.push((fuse_ino(entry_ino), name.to_vec()));
            true
        }) {
            return reply.error(e.errno());
        }
        for (i, (entry_ino, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let kind = if *entry_ino == FUSE_ROOT_ID {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(*entry_ino, (i + 1) as i64, kind, OsStr::from_bytes(name)) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let vs = self.fs.statfs();
        debug!("statfs: {}/{} blocks free", vs.bfree, vs.blocks);
        reply.statfs(
            vs.blocks as u64,
            vs.bfree as u64,
            vs.bfree as u64,
            vs.files as u64,
            vs.ffree as u64,
            vs.bsize,
            vs.namemax,
            vs.bsize,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // permission bits are stored but not enforced
        reply.ok();
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }
}
