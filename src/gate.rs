//! Access gate keyed on the requesting process's ancestry and PID namespace.
//!
//! Every request is attributed to a pid by the kernel. A request is allowed
//! when the target is the filesystem root, when any ancestor along the
//! `/proc/<pid>/stat` chain is the manager process, a trusted application or
//! a kernel thread, or when the caller shares our PID namespace and the
//! sandbox is not currently running. Rejections surface as not-found so the
//! gate never leaks that a name exists.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Set by SIGUSR2, cleared by SIGUSR1. Signal handlers cannot reach into an
/// instance, so this stays a process-wide flag.
pub static SANDBOX_RUNNING: AtomicBool = AtomicBool::new(false);

/// Executable short-name prefixes whose descendants may access the mount.
const TRUSTED_COMM_PREFIXES: &[&str] = &[
    "firejail",
    "EnDeskTop",
    "uebm",
    "StreamTran",
    "BgIOThr~Poo",
    "TaskCon~lle",
    "apport",
    "Backgro~Poo",
];

const INIT_PID: i32 = 1;
const KTHREADD_PID: i32 = 2;

#[derive(Debug)]
pub struct AccessGate {
    manager_pid: i32,
    own_ns: OnceLock<Option<String>>,
}

/// Parse `/proc/<pid>/stat` into (comm, ppid). The comm field is enclosed in
/// parentheses and may itself contain spaces or parentheses, so scan from the
/// last closing one.
fn read_stat(pid: i32) -> Option<(String, i32)> {
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let comm = raw.get(open + 1..close)?.to_string();
    let mut rest = raw.get(close + 1..)?.split_ascii_whitespace();
    let _state = rest.next()?;
    let ppid: i32 = rest.next()?.parse().ok()?;
    Some((comm, ppid))
}

fn pid_namespace(pid: i32) -> Option<String> {
    fs::read_link(format!("/proc/{pid}/ns/pid"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

impl AccessGate {
    /// Capture the manager pid (our parent at startup).
    pub fn new(manager_pid: i32) -> Self {
        Self {
            manager_pid,
            own_ns: OnceLock::new(),
        }
    }

    fn own_namespace(&self) -> Option<&str> {
        self.own_ns
            .get_or_init(|| pid_namespace(std::process::id() as i32))
            .as_deref()
    }

    /// Walk the parent chain of `pid` looking for an ancestor that grants
    /// access. Stops at init (deny) and kthreadd or the idle task (allow).
    fn chain_allows(&self, pid: i32) -> bool {
        let mut pid = pid;
        loop {
            match pid {
                0 => return true,
                INIT_PID => return false,
                KTHREADD_PID => return true,
                p if p == self.manager_pid => return true,
                _ => {}
            }

            let (comm, ppid) = match read_stat(pid) {
                Some(v) => v,
                None => {
                    warn!(pid, "cannot read process stat; denying");
                    return false;
                }
            };

            if TRUSTED_COMM_PREFIXES.iter().any(|p| comm.starts_with(p)) {
                return true;
            }

            pid = ppid;
        }
    }

    /// Gate decision for a request from `pid` targeting `ino`.
    pub fn allow(&self, pid: i32, is_root_ino: bool) -> bool {
        if is_root_ino {
            return true;
        }

        if self.chain_allows(pid) {
            return true;
        }

        // Callers in our own PID namespace are host-side processes: they may
        // look while the sandbox is idle but not while it runs.
        if let (Some(own), Some(caller)) = (self.own_namespace(), pid_namespace(pid)) {
            if own == caller {
                let running = SANDBOX_RUNNING.load(Ordering::Relaxed);
                if running {
                    debug!(pid, "denied: sandbox running and caller in host namespace");
                }
                return !running;
            }
        }

        debug!(pid, "denied by access gate");
        false
    }
}

/// A path equal to the parent of the mountpoint is refused everywhere, so a
/// mount cannot recurse into itself. `path` is layer-relative,
/// `mount_parent` is the precomputed layer-relative parent of the mountpoint.
pub fn path_allowed(path: &str, mount_parent: Option<&str>) -> bool {
    match mount_parent {
        Some(parent) if path == parent => {
            debug!(path, "denied: path is the mountpoint parent");
            false
        }
        _ => true,
    }
}
