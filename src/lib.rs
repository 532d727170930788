//! A very simple file system: one volume, one root directory, and a
//! fixed-size image file memory-mapped by the running process.
//!
//! The image holds a superblock, an inode bitmap, a data bitmap, an
//! inode table and a data region. [`mkfs::format`] lays an empty
//! volume down, [`fs::Vsfs`] mounts one and carries the operations the
//! kernel bridge invokes, and [`fuse::VsfsFuse`] is that bridge.

pub mod bitmap;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod image;
pub mod layout;
pub mod mkfs;

pub use error::FsError;
pub use fs::Vsfs;
pub use image::Image;
