//! Hide-list profile parsing.
//!
//! A profile file contains `whitelist <glob>`, `nowhitelist <glob>` and
//! `blacklist <glob>` lines. The effective hide-list is
//! `blacklist - (whitelist - nowhitelist)`: whitelisted paths survive in
//! lower-layer listings, everything else on the blacklist is hidden.
//! `${HOME}` and a leading `~` expand to the home directory of the user
//! named by `PKEXEC_UID`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use glob::glob;
use nix::unistd::{Uid, User};
use tracing::{debug, warn};

pub const DEFAULT_PROFILE_PATH: &str = "/home/jailbox/profile.config";

#[derive(Debug, Clone, Default)]
pub struct HideList {
    entries: Vec<String>,
}

fn home_for_pkexec_uid() -> Option<String> {
    let uid: u32 = std::env::var("PKEXEC_UID").ok()?.parse().ok()?;
    let user = User::from_uid(Uid::from_raw(uid)).ok().flatten()?;
    Some(user.dir.to_string_lossy().into_owned())
}

fn expand_macros(pattern: &str) -> Option<String> {
    if pattern.starts_with("$HOME") {
        warn!("$HOME is not allowed in profile files, use ${{HOME}}");
        return None;
    }
    if let Some(rest) = pattern.strip_prefix("${HOME}") {
        return Some(format!("{}{}", home_for_pkexec_uid()?, rest));
    }
    if let Some(rest) = pattern.strip_prefix('~') {
        return Some(format!("{}{}", home_for_pkexec_uid()?, rest));
    }
    Some(pattern.to_string())
}

/// Expand a glob pattern into concrete paths. A pattern with no matches is
/// kept verbatim, matching glob(3) with GLOB_NOCHECK.
fn expand_glob(pattern: &str, out: &mut Vec<String>) {
    let mut matched = false;
    match glob(pattern) {
        Ok(paths) => {
            for path in paths.flatten() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if name == "." || name == ".." {
                    continue;
                }
                matched = true;
                out.push(path.to_string_lossy().into_owned());
            }
        }
        Err(e) => {
            warn!(pattern, error = %e, "failed to glob profile pattern");
            return;
        }
    }
    if !matched {
        out.push(pattern.to_string());
    }
}

fn collapse_spaces(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_gap = false;
    for ch in line.trim().chars() {
        if ch == '\n' || ch == '\r' {
            break;
        }
        if ch == ' ' || ch == '\t' {
            if !in_gap {
                out.push(' ');
                in_gap = true;
            }
        } else {
            out.push(ch);
            in_gap = false;
        }
    }
    out
}

impl HideList {
    /// Load and merge the profile file. A missing file yields an empty list.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let contents = match fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.as_ref().display(), error = %e, "cannot open profile file");
                return Self::default();
            }
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Self {
        let mut whitelist = Vec::new();
        let mut nowhitelist = Vec::new();
        let mut blacklist = Vec::new();

        for raw in contents.lines() {
            let line = collapse_spaces(raw);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (list, pattern) = if let Some(p) = line.strip_prefix("whitelist ") {
                (&mut whitelist, p)
            } else if let Some(p) = line.strip_prefix("nowhitelist ") {
                (&mut nowhitelist, p)
            } else if let Some(p) = line.strip_prefix("blacklist ") {
                (&mut blacklist, p)
            } else {
                continue;
            };

            if let Some(expanded) = expand_macros(pattern) {
                expand_glob(&expanded, list);
            }
        }

        let nowhite: BTreeSet<&str> = nowhitelist.iter().map(String::as_str).collect();
        let kept: BTreeSet<&str> = whitelist
            .iter()
            .map(String::as_str)
            .filter(|w| !nowhite.contains(*w))
            .collect();

        let entries: Vec<String> = blacklist
            .into_iter()
            .filter(|b| !kept.contains(b.as_str()))
            .collect();

        for entry in &entries {
            debug!(entry, "hide-list entry");
        }

        Self { entries }
    }

    /// Whether `name` inside the layer-relative directory `dir_path` is
    /// hidden. Entries ending in `/` hide whole subtrees; other entries hide
    /// a single name in its parent directory. Entry paths are absolute and
    /// compared against layer-relative paths with the leading slash dropped.
    pub fn hides(&self, dir_path: &str, name: &str) -> bool {
        for entry in &self.entries {
            let rel = entry.strip_prefix('/').unwrap_or(entry.as_str());
            if let Some(prefix) = rel.strip_suffix('/') {
                if dir_path.starts_with(prefix) {
                    debug!(path = dir_path, name, "hide-list subtree match");
                    return true;
                }
            } else {
                let (dir, base) = match rel.rsplit_once('/') {
                    Some((d, b)) => (d, b),
                    None => ("", rel),
                };
                if dir_path == dir && name == base {
                    debug!(path = dir_path, name, "hide-list entry match");
                    return true;
                }
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
