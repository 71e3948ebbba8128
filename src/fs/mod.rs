//! FUSE filesystem implementation

pub mod cloudfs;
pub mod handles;
pub mod inode;
pub mod leases;

pub use cloudfs::CloudFilesystem;
