//! Mount orchestration: option parsing, engine setup, FUSE session, signal
//! handling and the parent-process watchdog.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::MountOptions;
use crate::crypto::CryptoParams;
use crate::fs::fuse::{self, JailFs};
use crate::fs::overlay::OverlayFs;
use crate::gate::{AccessGate, SANDBOX_RUNNING};
use crate::logging::{log_graph_snapshot, GraphSnapshot};
use crate::{Error, Result};

use super::CliArgs;

const SESSION_FILE: &str = ".jailfs.session";
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Raised by SIGUSR1 together with clearing the sandbox flag; the watchdog
/// loop dumps graph counts when it sees it.
static REPORT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigusr1(_: libc::c_int) {
    SANDBOX_RUNNING.store(false, Ordering::Relaxed);
    REPORT_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn handle_sigusr2(_: libc::c_int) {
    SANDBOX_RUNNING.store(true, Ordering::Relaxed);
}

/// Record of the active session, written beside the working directory so
/// operators can see which process owns a diff tree.
#[derive(Debug, Serialize, Deserialize)]
struct SessionMarker {
    mount_id: uuid::Uuid,
    mountpoint: String,
    pid: i32,
    version: String,
}

pub fn execute(args: CliArgs) -> Result<()> {
    let mountpoint = args.mountpoint.clone().ok_or(Error::MissingMountpoint)?;
    let opts = MountOptions::parse(args.options.iter().map(String::as_str))?;
    opts.validate()?;

    tracing::debug!(
        foreground = args.foreground,
        mountpoint = %mountpoint.display(),
        lowerdir = ?opts.lowerdir,
        upperdir = ?opts.upperdir,
        workdir = ?opts.workdir,
        fsync = opts.fsync,
        "mount helper starting"
    );

    if opts.plugins.is_some() {
        warn!("plugin data sources are not supported in this build; ignoring");
    }
    if let Some(ctx) = &opts.context {
        info!(context = %ctx, "selinux context accepted");
    }

    let manager_pid = nix::unistd::getppid().as_raw();
    if manager_pid == 1 {
        return Err(Error::ParentIsInit.into());
    }

    // Upper-layer entries carry their modes verbatim.
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    raise_nofile_limit();
    install_signal_handlers()?;

    let overlay = Arc::new(OverlayFs::new(&opts, &mountpoint, CryptoParams::default())?);
    let gate = Arc::new(AccessGate::new(manager_pid));
    let adapter = JailFs::new(overlay.clone(), gate);

    if let Some(workdir_base) = &opts.workdir {
        write_session_marker(workdir_base, &mountpoint)?;
    }

    let handle = fuse::spawn_overlay(adapter, &mountpoint)?;
    info!(mountpoint = %mountpoint.display(), "mount ready");

    #[derive(Debug)]
    enum Event {
        Signal,
        ParentExited,
        Unmounted,
    }

    let (tx, rx) = mpsc::channel();

    ctrlc::set_handler({
        let tx = tx.clone();
        move || {
            let _ = tx.send(Event::Signal);
        }
    })
    .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;

    // Watchdog: exit when the managing parent disappears, detect external
    // unmounts, and serve the SIGUSR1 statistics dump.
    {
        let tx = tx.clone();
        let mount_path = mountpoint.clone();
        let overlay = overlay.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(WATCHDOG_INTERVAL);

            if REPORT_REQUESTED.swap(false, Ordering::Relaxed) {
                let (nodes, inodes) = overlay.counts();
                log_graph_snapshot(GraphSnapshot { nodes, inodes });
            }

            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(manager_pid), None).is_err() {
                let _ = tx.send(Event::ParentExited);
                break;
            }

            if !is_mounted(&mount_path) {
                let _ = tx.send(Event::Unmounted);
                break;
            }
        });
    }

    match rx.recv() {
        Ok(Event::Signal) => {
            info!("signal received; unmounting {}", mountpoint.display());
            handle.unmount();
        }
        Ok(Event::ParentExited) => {
            warn!("parent process exited; unmounting {}", mountpoint.display());
            handle.unmount();
        }
        Ok(Event::Unmounted) => {
            info!(
                "detected external unmount; exiting for {}",
                mountpoint.display()
            );
            handle.unmount();
        }
        Err(_) => {
            handle.unmount();
        }
    }

    if let Some(workdir_base) = &opts.workdir {
        let _ = fs::remove_file(workdir_base.join(SESSION_FILE));
    }

    Ok(())
}

fn install_signal_handlers() -> Result<()> {
    let usr1 = SigAction::new(
        SigHandler::Handler(handle_sigusr1),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let usr2 = SigAction::new(
        SigHandler::Handler(handle_sigusr2),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGUSR1, &usr1)
            .map_err(|e| Error::Cli(format!("cannot install SIGUSR1 handler: {e}")))?;
        sigaction(Signal::SIGUSR2, &usr2)
            .map_err(|e| Error::Cli(format!("cannot install SIGUSR2 handler: {e}")))?;
    }
    Ok(())
}

/// Set the soft nofile limit to the hard limit; every open node can pin a
/// descriptor.
fn raise_nofile_limit() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((_, hard)) => {
            if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                warn!(error = %e, "cannot raise nofile limit");
            }
        }
        Err(e) => warn!(error = %e, "cannot read nofile limit"),
    }
}

fn write_session_marker(workdir_base: &Path, mountpoint: &Path) -> Result<()> {
    let marker = SessionMarker {
        mount_id: uuid::Uuid::new_v4(),
        mountpoint: mountpoint.to_string_lossy().into_owned(),
        pid: std::process::id() as i32,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = serde_json::to_vec_pretty(&marker).map_err(Error::from)?;
    fs::create_dir_all(workdir_base).map_err(Error::from)?;
    fs::write(workdir_base.join(SESSION_FILE), bytes).map_err(Error::from)?;
    Ok(())
}

/// Check if a path is currently mounted (Linux-only, /proc/mounts).
fn is_mounted(path: &Path) -> bool {
    if let Ok(contents) = fs::read_to_string("/proc/mounts") {
        let target = path.to_string_lossy();
        return contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|p| p == target);
    }
    false
}
