//! Mount option parsing.
//!
//! Options arrive as one or more `-o key=value,...` strings, the same
//! surface mount(8) helpers use. Unrecognized keys that the kernel FUSE
//! layer understands are silently ignored.

use std::path::PathBuf;

use crate::Error;

/// How ownership and mode changes are persisted on the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatOverride {
    /// Apply chown/chmod directly to the backing inode.
    #[default]
    None,
    /// Encode uid:gid:mode into a trusted-namespace attribute; write errors
    /// are fatal.
    Privileged,
    /// Encode uid:gid:mode into a user-namespace attribute; EPERM on write
    /// is swallowed.
    User,
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub lowerdir: Option<String>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub uidmapping: Option<String>,
    pub gidmapping: Option<String>,
    pub timeout: f64,
    pub threaded: bool,
    pub fsync: bool,
    pub fast_ino: bool,
    pub writeback: bool,
    pub noxattrs: bool,
    pub plugins: Option<String>,
    pub xattr_permissions: u32,
    pub squash_to_root: bool,
    pub squash_to_uid: Option<u32>,
    pub squash_to_gid: Option<u32>,
    pub static_nlink: bool,
    pub context: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            lowerdir: None,
            upperdir: None,
            workdir: None,
            uidmapping: None,
            gidmapping: None,
            timeout: 1000000000.0,
            threaded: true,
            fsync: true,
            fast_ino: false,
            writeback: true,
            noxattrs: false,
            plugins: None,
            xattr_permissions: 0,
            squash_to_root: false,
            squash_to_uid: None,
            squash_to_gid: None,
            static_nlink: false,
            context: None,
        }
    }
}

/// Mount options the kernel or fusermount consume; accepted and dropped.
const PASSTHROUGH_OPTS: &[&str] = &[
    "allow_root",
    "allow_other",
    "default_permissions",
    "suid",
    "nosuid",
    "dev",
    "nodev",
    "exec",
    "noexec",
    "atime",
    "noatime",
    "diratime",
    "nodiratime",
    "lazytime",
    "kernel_cache",
    "splice_read",
    "splice_write",
    "splice_move",
    "max_write",
    "ro",
    "rw",
];

impl MountOptions {
    /// Parse a sequence of `-o` strings into options, applying each
    /// comma-separated `key[=value]` in order.
    pub fn parse<'a>(opt_strings: impl IntoIterator<Item = &'a str>) -> crate::Result<Self> {
        let mut opts = MountOptions::default();

        for raw in opt_strings {
            for item in raw.split(',').filter(|s| !s.is_empty()) {
                let (key, value) = match item.split_once('=') {
                    Some((k, v)) => (k, Some(v)),
                    None => (item, None),
                };
                opts.apply(key, value, item)?;
            }
        }

        Ok(opts)
    }

    fn apply(&mut self, key: &str, value: Option<&str>, raw: &str) -> crate::Result<()> {
        let need = |v: Option<&str>| -> crate::Result<String> {
            v.map(str::to_owned)
                .ok_or_else(|| Error::InvalidMountOption(raw.to_string()).into())
        };
        let flag = |v: Option<&str>| -> crate::Result<bool> {
            match v {
                None | Some("1") => Ok(true),
                Some("0") => Ok(false),
                Some(_) => Err(Error::InvalidMountOption(raw.to_string()).into()),
            }
        };

        match key {
            "lowerdir" => self.lowerdir = Some(need(value)?),
            "upperdir" => self.upperdir = Some(PathBuf::from(need(value)?)),
            "workdir" => self.workdir = Some(PathBuf::from(need(value)?)),
            "redirect_dir" => {
                let v = need(value)?;
                if v != "off" {
                    return Err(Error::RedirectDirUnsupported(v).into());
                }
            }
            "uidmapping" => self.uidmapping = Some(need(value)?),
            "gidmapping" => self.gidmapping = Some(need(value)?),
            "timeout" => {
                self.timeout = need(value)?
                    .parse::<f64>()
                    .map_err(|_| Error::InvalidMountOption(raw.to_string()))?;
            }
            "threaded" => self.threaded = flag(value)?,
            "fsync" => self.fsync = flag(value)?,
            // Native overlay supports "volatile" to mean fsync=0.
            "volatile" => self.fsync = false,
            "fast_ino" => self.fast_ino = flag(value)?,
            "writeback" => self.writeback = flag(value)?,
            "noxattrs" => self.noxattrs = flag(value)?,
            "plugins" => self.plugins = Some(need(value)?),
            "xattr_permissions" => {
                let v: u32 = need(value)?
                    .parse()
                    .map_err(|_| Error::InvalidMountOption(raw.to_string()))?;
                if v > 2 {
                    return Err(Error::InvalidXattrPermissions(v).into());
                }
                self.xattr_permissions = v;
            }
            "squash_to_root" => self.squash_to_root = true,
            "squash_to_uid" => {
                self.squash_to_uid = Some(
                    need(value)?
                        .parse()
                        .map_err(|_| Error::InvalidMountOption(raw.to_string()))?,
                );
            }
            "squash_to_gid" => {
                self.squash_to_gid = Some(
                    need(value)?
                        .parse()
                        .map_err(|_| Error::InvalidMountOption(raw.to_string()))?,
                );
            }
            "static_nlink" => self.static_nlink = true,
            "context" => self.context = Some(need(value)?),
            _ if PASSTHROUGH_OPTS.contains(&key) => {}
            // Ignore anything else the way fuse_opt_proc does.
            _ => {}
        }
        Ok(())
    }

    /// Lower layer roots, first entry is the topmost lower layer.
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        self.lowerdir
            .as_deref()
            .map(|s| {
                s.split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate the option set for mounting.
    pub fn validate(&self) -> crate::Result<()> {
        if self.lowerdir.is_none() || self.lower_dirs().is_empty() {
            return Err(Error::MissingLowerDir.into());
        }
        if self.upperdir.is_some() && self.workdir.is_none() {
            return Err(Error::MissingWorkDir.into());
        }
        Ok(())
    }

    pub fn stat_override(&self) -> StatOverride {
        match self.xattr_permissions {
            1 => StatOverride::Privileged,
            2 => StatOverride::User,
            _ => StatOverride::None,
        }
    }
}
