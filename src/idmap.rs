//! Bidirectional uid/gid translation between host and presented values.
//!
//! Mappings are `host:presented:length` triples. Squash overrides
//! short-circuit the host-to-presented direction; ids that fall outside
//! every range map to the kernel overflow ids.

use std::fs;

use crate::Error;

const OVERFLOW_UID_FILE: &str = "/proc/sys/kernel/overflowuid";
const OVERFLOW_GID_FILE: &str = "/proc/sys/kernel/overflowgid";
const OVERFLOW_FALLBACK: u32 = 65534;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub host: u32,
    pub presented: u32,
    pub len: u32,
}

/// Parse a `h:p:l[:h:p:l...]` mapping string.
pub fn parse_mappings(spec: &str) -> crate::Result<Vec<MapRange>> {
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.is_empty() || fields.len() % 3 != 0 {
        return Err(Error::InvalidMapping(spec.to_string()).into());
    }

    let mut ranges = Vec::with_capacity(fields.len() / 3);
    for triple in fields.chunks(3) {
        let parse = |s: &str| -> crate::Result<u32> {
            s.parse()
                .map_err(|_| Error::InvalidMapping(spec.to_string()).into())
        };
        ranges.push(MapRange {
            host: parse(triple[0])?,
            presented: parse(triple[1])?,
            len: parse(triple[2])?,
        });
    }
    Ok(ranges)
}

fn read_overflow_id(path: &str) -> u32 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(OVERFLOW_FALLBACK)
}

#[derive(Debug, Clone, Default)]
pub struct IdMapper {
    uid_ranges: Vec<MapRange>,
    gid_ranges: Vec<MapRange>,
    squash_to_root: bool,
    squash_to_uid: Option<u32>,
    squash_to_gid: Option<u32>,
    overflow_uid: u32,
    overflow_gid: u32,
}

impl IdMapper {
    pub fn new(
        uidmapping: Option<&str>,
        gidmapping: Option<&str>,
        squash_to_root: bool,
        squash_to_uid: Option<u32>,
        squash_to_gid: Option<u32>,
    ) -> crate::Result<Self> {
        Ok(Self {
            uid_ranges: uidmapping.map(parse_mappings).transpose()?.unwrap_or_default(),
            gid_ranges: gidmapping.map(parse_mappings).transpose()?.unwrap_or_default(),
            squash_to_root,
            squash_to_uid,
            squash_to_gid,
            overflow_uid: read_overflow_id(OVERFLOW_UID_FILE),
            overflow_gid: read_overflow_id(OVERFLOW_GID_FILE),
        })
    }

    fn map(&self, id: u32, ranges: &[MapRange], direct: bool, overflow: u32) -> u32 {
        if ranges.is_empty() {
            return id;
        }
        for r in ranges {
            if direct {
                if id >= r.host && id - r.host < r.len {
                    return r.presented + (id - r.host);
                }
            } else if id >= r.presented && id - r.presented < r.len {
                return r.host + (id - r.presented);
            }
        }
        overflow
    }

    /// Host uid to the value presented on stat output.
    pub fn uid_out(&self, uid: u32) -> u32 {
        if let Some(squash) = self.squash_to_uid {
            return squash;
        }
        if self.squash_to_root {
            return 0;
        }
        self.map(uid, &self.uid_ranges, true, self.overflow_uid)
    }

    /// Host gid to the value presented on stat output.
    pub fn gid_out(&self, gid: u32) -> u32 {
        if let Some(squash) = self.squash_to_gid {
            return squash;
        }
        if self.squash_to_root {
            return 0;
        }
        self.map(gid, &self.gid_ranges, true, self.overflow_gid)
    }

    /// Presented uid back to the host value, for ownership writes.
    pub fn uid_in(&self, uid: u32) -> u32 {
        self.map(uid, &self.uid_ranges, false, self.overflow_uid)
    }

    /// Presented gid back to the host value, for ownership writes.
    pub fn gid_in(&self, gid: u32) -> u32 {
        self.map(gid, &self.gid_ranges, false, self.overflow_gid)
    }

    /// Chown results are ignored when any squash override is active.
    pub fn squashed(&self) -> bool {
        self.squash_to_root || self.squash_to_uid.is_some() || self.squash_to_gid.is_some()
    }
}
