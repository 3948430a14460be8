//! Overlay filesystem engine.
//!
//! `layer` is the read seam over a directory tree, `node` the in-memory
//! graph and inode identity, `overlay` the composition engine (lookup,
//! directory merge, copy-up, mutations), and `fuse` the kernel adapter.

pub mod fuse;
pub mod layer;
pub mod node;
pub mod overlay;

/// Prefix marking a deleted lower-layer name in the upper layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Sentinel file marking a directory opaque when xattrs are unavailable.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

pub const XATTR_PREFIX: &str = "user.fuseoverlayfs.";
pub const ORIGIN_XATTR: &str = "user.fuseoverlayfs.origin";
pub const OPAQUE_XATTR: &str = "user.fuseoverlayfs.opaque";
pub const PRIVILEGED_XATTR_PREFIX: &str = "trusted.overlay.";
pub const PRIVILEGED_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
pub const XATTR_OVERRIDE_STAT: &str = "user.containers.override_stat";
pub const XATTR_PRIVILEGED_OVERRIDE_STAT: &str = "trusted.overlay.override_stat";

pub const CURRENT_DIR: &str = ".";
pub const PARENT_DIR: &str = "..";

pub const WHITEOUT_MAX_LEN: u64 = WHITEOUT_PREFIX.len() as u64;

/// Reserved attribute namespaces are invisible to callers.
pub fn can_access_xattr(name: &str) -> bool {
    !name.starts_with(XATTR_PREFIX) && !name.starts_with(PRIVILEGED_XATTR_PREFIX)
}

/// `.wh.<name>` for a plain name.
pub fn whiteout_name(name: &str) -> String {
    format!("{WHITEOUT_PREFIX}{name}")
}

/// The plain name hidden by a whiteout entry, if the entry is one. A
/// character device at (0, 0) whiteouts its own name.
pub fn unwhiteout_name<'a>(name: &'a str, char_dev_00: bool) -> Option<&'a str> {
    if let Some(rest) = name.strip_prefix(WHITEOUT_PREFIX) {
        return Some(rest);
    }
    if char_dev_00 {
        return Some(name);
    }
    None
}
