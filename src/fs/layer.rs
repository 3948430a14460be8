//! Read access to one layer's directory tree.
//!
//! A layer is an ordered position in the stack with a root into a directory
//! tree. All reads go through the `LayerStore` trait so alternative data
//! sources can be plugged in behind the same operations; the shipped
//! implementation is direct filesystem access. Path operations never follow
//! symbolic links, so a link in one layer cannot escape into another.

use std::ffi::OsString;
use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{DirEntryExt, FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Index of a layer in the stack; the upper layer, when present, is index 0.
pub type LayerIdx = usize;

#[derive(Debug, Clone)]
pub struct LayerDirEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_char_dev: bool,
    pub rdev: u64,
    pub ino: u64,
}

/// Uniform read operations over a directory tree. Paths are relative to the
/// layer root; an empty path addresses the root itself.
pub trait LayerStore: Send + Sync {
    fn root(&self) -> &Path;

    /// Open a file without following a trailing symlink.
    fn open(&self, rel: &str, write: bool) -> io::Result<File>;

    /// No-follow stat.
    fn stat(&self, rel: &str) -> io::Result<Metadata>;

    fn read_dir(&self, rel: &str) -> io::Result<Vec<LayerDirEntry>>;

    fn readlink(&self, rel: &str) -> io::Result<OsString>;

    fn getxattr(&self, rel: &str, name: &str) -> io::Result<Option<Vec<u8>>>;

    fn listxattr(&self, rel: &str) -> io::Result<Vec<String>>;

    /// Existence probe: ENOENT, ENOTDIR and ENAMETOOLONG all report a clean
    /// "absent"; other errors propagate.
    fn file_exists(&self, rel: &str) -> io::Result<bool> {
        match self.stat(rel) {
            Ok(_) => Ok(true),
            Err(e) => match e.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENOTDIR) | Some(libc::ENAMETOOLONG) => Ok(false),
                _ => Err(e),
            },
        }
    }

    /// Absolute path of an entry, for the mutation paths that need to act
    /// on the backing tree directly.
    fn full_path(&self, rel: &str) -> PathBuf;
}

/// Direct filesystem access to a local directory tree.
#[derive(Debug)]
pub struct DirectLayer {
    root: PathBuf,
}

impl DirectLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn join(&self, rel: &str) -> PathBuf {
        if rel.is_empty() || rel == "." {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

impl LayerStore for DirectLayer {
    fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self, rel: &str, write: bool) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .custom_flags(libc::O_NOFOLLOW)
            .open(self.join(rel))
    }

    fn stat(&self, rel: &str) -> io::Result<Metadata> {
        std::fs::symlink_metadata(self.join(rel))
    }

    fn read_dir(&self, rel: &str) -> io::Result<Vec<LayerDirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.join(rel))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;

            // Char devices need a full stat to see the device number, since
            // (0, 0) encodes a whiteout.
            let (is_char_dev, rdev) = if file_type.is_char_device() {
                let meta = entry.path().symlink_metadata()?;
                (true, meta.rdev())
            } else {
                (false, 0)
            };

            entries.push(LayerDirEntry {
                name,
                is_dir: file_type.is_dir(),
                is_char_dev,
                rdev,
                ino: entry.ino(),
            });
        }
        Ok(entries)
    }

    fn readlink(&self, rel: &str) -> io::Result<OsString> {
        std::fs::read_link(self.join(rel)).map(PathBuf::into_os_string)
    }

    fn getxattr(&self, rel: &str, name: &str) -> io::Result<Option<Vec<u8>>> {
        xattr::get(self.join(rel), name)
    }

    fn listxattr(&self, rel: &str) -> io::Result<Vec<String>> {
        Ok(xattr::list(self.join(rel))?
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn full_path(&self, rel: &str) -> PathBuf {
        self.join(rel)
    }
}

/// One position in the layer stack.
pub struct Layer {
    pub store: Box<dyn LayerStore>,
    pub upper: bool,
}

impl Layer {
    pub fn direct(root: impl Into<PathBuf>, upper: bool) -> Self {
        Self {
            store: Box::new(DirectLayer::new(root)),
            upper,
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("root", &self.store.root())
            .field("upper", &self.upper)
            .finish()
    }
}
