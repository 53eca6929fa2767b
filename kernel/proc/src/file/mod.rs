//! File-system collaborator.
//!
//! The process core holds open-file references and a working directory
//! per process, and only ever duplicates or releases them: on fork, exit
//! and the `open`/`close` syscalls. [`SimFiles`] is the in-process
//! reference-counting implementation.

pub mod sim;

use core::fmt;

pub use sim::SimFiles;

bitflags::bitflags! {
    /// Open mode of a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Readable.
        const READ  = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
    }
}

/// An open-file table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

impl FileId {
    /// Creates a handle from its table index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// An in-memory inode reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(u32);

impl InodeId {
    /// Creates a handle from its table index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inode#{}", self.0)
    }
}

/// Reference-counted open files and inodes.
///
/// Methods may be called with a PCB lock held.
pub trait FileSystem: Send + Sync {
    /// Opens `path`, returning a new file reference, or `None` if the
    /// file table is full.
    fn open(&self, path: &str, flags: OpenFlags) -> Option<FileId>;

    /// Takes another reference to an open file.
    fn dup(&self, file: FileId) -> FileId;

    /// Drops a file reference.
    ///
    /// # Panics
    ///
    /// Implementations panic if the file has no references.
    fn close(&self, file: FileId);

    /// Returns a new reference to the root directory.
    fn root(&self) -> InodeId;

    /// Takes another reference to an inode.
    fn idup(&self, inode: InodeId) -> InodeId;

    /// Drops an inode reference.
    fn iput(&self, inode: InodeId);
}
