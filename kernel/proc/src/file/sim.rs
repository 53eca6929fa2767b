//! In-process file and inode tables.

use hearth_core::sync::SpinLock;

use super::{FileId, FileSystem, InodeId, OpenFlags};

/// Open files system-wide.
pub const NFILE: usize = 100;
/// In-memory inodes.
pub const NINODE: usize = 50;

#[derive(Default)]
struct FileEntry {
    refs: usize,
    inode: Option<InodeId>,
    flags: Option<OpenFlags>,
}

#[derive(Default)]
struct InodeEntry {
    refs: usize,
    path: String,
}

/// Reference-counted file and inode tables with no backing storage.
///
/// Lock order: `ftable` before `itable`.
pub struct SimFiles {
    ftable: SpinLock<Vec<FileEntry>>,
    itable: SpinLock<Vec<InodeEntry>>,
}

impl Default for SimFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFiles {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self {
            ftable: SpinLock::named(
                "ftable",
                (0..NFILE).map(|_| FileEntry::default()).collect(),
            ),
            itable: SpinLock::named(
                "itable",
                (0..NINODE).map(|_| InodeEntry::default()).collect(),
            ),
        }
    }

    /// Returns the reference count of an open file.
    pub fn file_refs(&self, file: FileId) -> usize {
        self.ftable.lock().get(file.index()).map_or(0, |f| f.refs)
    }

    /// Returns the reference count of an inode.
    pub fn inode_refs(&self, inode: InodeId) -> usize {
        self.itable.lock().get(inode.index()).map_or(0, |i| i.refs)
    }

    /// Returns the number of file table entries in use.
    pub fn open_files(&self) -> usize {
        self.ftable.lock().iter().filter(|f| f.refs > 0).count()
    }

    /// Returns the path an open file was opened with.
    pub fn path_of(&self, file: FileId) -> Option<String> {
        let inode = self.ftable.lock().get(file.index())?.inode?;
        Some(self.itable.lock()[inode.index()].path.clone())
    }

    /// Returns the mode an open file was opened with.
    pub fn flags_of(&self, file: FileId) -> Option<OpenFlags> {
        self.ftable.lock().get(file.index())?.flags
    }

    /// Finds or creates the inode for `path`, taking a reference.
    fn iget(&self, path: &str) -> Option<InodeId> {
        let mut itable = self.itable.lock();
        let slot = itable
            .iter()
            .position(|i| i.refs > 0 && i.path == path)
            .or_else(|| itable.iter().position(|i| i.refs == 0))?;
        let entry = &mut itable[slot];
        if entry.refs == 0 {
            entry.path = path.to_owned();
        }
        entry.refs += 1;
        Some(inode_id(slot))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn file_id(slot: usize) -> FileId {
    FileId::new(slot as u32)
}

#[allow(clippy::cast_possible_truncation)]
fn inode_id(slot: usize) -> InodeId {
    InodeId::new(slot as u32)
}

impl FileSystem for SimFiles {
    fn open(&self, path: &str, flags: OpenFlags) -> Option<FileId> {
        let mut ftable = self.ftable.lock();
        let slot = ftable.iter().position(|f| f.refs == 0)?;
        let inode = self.iget(path)?;
        ftable[slot] = FileEntry {
            refs: 1,
            inode: Some(inode),
            flags: Some(flags),
        };
        Some(file_id(slot))
    }

    fn dup(&self, file: FileId) -> FileId {
        let mut ftable = self.ftable.lock();
        let entry = &mut ftable[file.index()];
        assert!(entry.refs > 0, "filedup: {file} is not open");
        entry.refs += 1;
        file
    }

    fn close(&self, file: FileId) {
        let mut ftable = self.ftable.lock();
        let entry = &mut ftable[file.index()];
        assert!(entry.refs > 0, "fileclose: {file} has no references");
        entry.refs -= 1;
        if entry.refs == 0 {
            entry.flags = None;
            if let Some(inode) = entry.inode.take() {
                self.iput(inode);
            }
        }
    }

    fn root(&self) -> InodeId {
        match self.iget("/") {
            Some(inode) => inode,
            None => panic!("iget: no inodes for the root directory"),
        }
    }

    fn idup(&self, inode: InodeId) -> InodeId {
        let mut itable = self.itable.lock();
        let entry = &mut itable[inode.index()];
        assert!(entry.refs > 0, "idup: {inode} has no references");
        entry.refs += 1;
        inode
    }

    fn iput(&self, inode: InodeId) {
        let mut itable = self.itable.lock();
        let entry = &mut itable[inode.index()];
        assert!(entry.refs > 0, "iput: {inode} has no references");
        entry.refs -= 1;
    }
}
