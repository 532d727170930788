// The image mapper: a volume is one fixed-size file mapped read-write
// into the process. All file system state lives inside the mapping;
// the page cache carries stores back to the file.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::{io, ptr, slice};

use zerocopy::IntoBytes;

use crate::layout::BSIZE;

enum Buf {
    /// A shared mapping of the opened image file. The file handle is
    /// kept so the descriptor outlives the mapping.
    Mapped {
        ptr: *mut u8,
        len: usize,
        _file: File,
    },
    /// An anonymous buffer, for callers that stage a volume in memory.
    /// Backed by u64 words so record views over the bytes stay aligned.
    Mem(Vec<u64>),
}

/// A contiguous byte region holding a whole number of blocks.
pub struct Image {
    buf: Buf,
}

// The raw pointer is owned by the mapping and never shared.
unsafe impl Send for Image {}

impl Image {
    /// Map an existing image file read-write. The file must be a whole,
    /// nonzero number of blocks long.
    pub fn map<P: AsRef<Path>>(path: P) -> io::Result<Image> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        check_len(len)?;
        let len = len as usize;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Image {
            buf: Buf::Mapped {
                ptr: ptr as *mut u8,
                len,
                _file: file,
            },
        })
    }

    /// Wrap an in-memory image, subject to the same size rules.
    pub fn from_vec(bytes: Vec<u8>) -> io::Result<Image> {
        check_len(bytes.len() as u64)?;
        let mut words = vec![0u64; bytes.len() / 8];
        words.as_mut_bytes().copy_from_slice(&bytes);
        Ok(Image {
            buf: Buf::Mem(words),
        })
    }

    pub fn len(&self) -> usize {
        match &self.buf {
            Buf::Mapped { len, .. } => *len,
            Buf::Mem(words) => words.len() * 8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.buf {
            Buf::Mapped { ptr, len, .. } => unsafe { slice::from_raw_parts(*ptr, *len) },
            Buf::Mem(words) => words.as_bytes(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Buf::Mapped { ptr, len, .. } => unsafe { slice::from_raw_parts_mut(*ptr, *len) },
            Buf::Mem(words) => words.as_mut_bytes(),
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Buf::Mapped { ptr, len, .. } = self.buf {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, len);
            }
        }
    }
}

fn check_len(len: u64) -> io::Result<()> {
    if len == 0 || len % BSIZE as u64 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "image is not a whole, nonzero number of blocks",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rejects_partial_blocks() {
        assert!(Image::from_vec(vec![0; BSIZE + 1]).is_err());
        assert!(Image::from_vec(Vec::new()).is_err());
        assert!(Image::from_vec(vec![0; 4 * BSIZE]).is_ok());
    }

    #[test]
    fn mapping_is_shared_with_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 2 * BSIZE]).unwrap();

        {
            let mut img = Image::map(&path).unwrap();
            assert_eq!(img.len(), 2 * BSIZE);
            img.as_mut_slice()[BSIZE] = 0xab;
        }
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes[BSIZE], 0xab);
    }

    #[test]
    fn mem_images_are_word_aligned() {
        let img = Image::from_vec(vec![0; BSIZE]).unwrap();
        assert_eq!(img.as_slice().as_ptr() as usize % 8, 0);
    }
}
