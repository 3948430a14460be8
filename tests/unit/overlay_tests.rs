use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jailfs::config::MountOptions;
use jailfs::crypto::CryptoParams;
use jailfs::fs::node::Node;
use jailfs::fs::overlay::{OverlayFs, SetAttrChanges};
use jailfs::profile::HideList;
use tempfile::{tempdir, TempDir};

struct Fixture {
    _keep: Vec<TempDir>,
    pub lowers: Vec<PathBuf>,
    pub upper: Option<PathBuf>,
    pub fs: OverlayFs,
}

fn caller() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

/// Build an overlay over `n_lowers` empty lower trees, optionally writable.
fn fixture(n_lowers: usize, writable: bool) -> Fixture {
    fixture_with_hide_list(n_lowers, writable, HideList::default())
}

fn fixture_with_hide_list(n_lowers: usize, writable: bool, hide_list: HideList) -> Fixture {
    let mut keep = Vec::new();
    let mut lowers = Vec::new();
    for _ in 0..n_lowers {
        let dir = tempdir().unwrap();
        lowers.push(dir.path().to_path_buf());
        keep.push(dir);
    }

    let mut opts = MountOptions::default();
    // Zero timeout: listings are rebuilt on demand, so fixtures may write
    // into the layer trees after the engine is up.
    opts.timeout = 0.0;
    opts.lowerdir = Some(
        lowers
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":"),
    );

    let upper = if writable {
        let dir = tempdir().unwrap();
        let upper_path = dir.path().join("upper");
        let work_path = dir.path().join("work");
        fs::create_dir(&upper_path).unwrap();
        opts.upperdir = Some(upper_path.clone());
        opts.workdir = Some(work_path);
        keep.push(dir);
        Some(upper_path)
    } else {
        None
    };

    let mnt = tempdir().unwrap();
    let mountpoint = mnt.path().join("mnt");
    keep.push(mnt);

    let fs = OverlayFs::with_hide_list(&opts, &mountpoint, CryptoParams::default(), hide_list)
        .unwrap();

    Fixture {
        _keep: keep,
        lowers,
        upper,
        fs,
    }
}

fn read_all(fs: &OverlayFs, node: &Arc<Node>) -> Vec<u8> {
    let (node, file) = fs.open_node(node, None, libc::O_RDONLY, 0, caller()).unwrap();
    fs.read_node(&node, &file, 0, 1 << 16).unwrap()
}

fn names(fs: &OverlayFs, node: &Arc<Node>) -> Vec<String> {
    let mut v: Vec<String> = fs
        .dir_entries(node)
        .unwrap()
        .iter()
        .map(|n| n.name())
        .collect();
    v.sort();
    v
}

#[test]
fn first_lower_layer_wins() {
    let fx = fixture(2, false);
    fs::write(fx.lowers[0].join("a"), b"from-top").unwrap();
    fs::write(fx.lowers[1].join("a"), b"from-bottom").unwrap();
    fs::write(fx.lowers[1].join("b"), b"only-bottom").unwrap();

    let root = fx.fs.root();
    let a = fx.fs.lookup_ok(&root, "a").unwrap();
    assert_eq!(read_all(&fx.fs, &a), b"from-top");

    let b = fx.fs.lookup_ok(&root, "b").unwrap();
    assert_eq!(read_all(&fx.fs, &b), b"only-bottom");

    assert_eq!(names(&fx.fs, &root), vec!["a", "b"]);
}

#[test]
fn whiteout_file_hides_lower_entry() {
    let fx = fixture(2, false);
    fs::write(fx.lowers[0].join(".wh.gone"), b"").unwrap();
    fs::write(fx.lowers[1].join("gone"), b"data").unwrap();
    fs::write(fx.lowers[1].join("kept"), b"data").unwrap();

    let root = fx.fs.root();
    assert!(fx.fs.lookup_ok(&root, "gone").is_err());
    assert_eq!(names(&fx.fs, &root), vec!["kept"]);
}

#[test]
fn opaque_sentinel_stops_the_merge() {
    let fx = fixture(2, false);
    fs::create_dir(fx.lowers[0].join("d")).unwrap();
    fs::write(fx.lowers[0].join("d/top"), b"1").unwrap();
    fs::write(fx.lowers[0].join("d/.wh..wh..opq"), b"").unwrap();
    fs::create_dir(fx.lowers[1].join("d")).unwrap();
    fs::write(fx.lowers[1].join("d/bottom"), b"2").unwrap();

    let root = fx.fs.root();
    let d = fx.fs.lookup_ok(&root, "d").unwrap();
    assert_eq!(names(&fx.fs, &d), vec!["top"]);
}

#[test]
fn lookup_rejects_whiteout_prefixed_names() {
    let fx = fixture(1, false);
    let root = fx.fs.root();
    let err = fx.fs.lookup(&root, ".wh.x").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn hide_list_filters_lower_layer_listings() {
    let list = HideList::parse("blacklist /secret\n");
    let fx = fixture_with_hide_list(1, false, list);
    fs::write(fx.lowers[0].join("secret"), b"x").unwrap();
    fs::write(fx.lowers[0].join("visible"), b"y").unwrap();

    let root = fx.fs.root();
    assert_eq!(names(&fx.fs, &root), vec!["visible"]);
}

#[test]
fn write_copies_up_and_encrypts() {
    let fx = fixture(1, true);
    fs::write(fx.lowers[0].join("f"), b"hello world").unwrap();

    let root = fx.fs.root();
    let node = fx.fs.lookup_ok(&root, "f").unwrap();
    let (node, file) = fx
        .fs
        .open_node(&node, None, libc::O_WRONLY, 0, caller())
        .unwrap();
    fx.fs.write_node(&node, &file, 0, b"HELLO").unwrap();

    // The upper copy exists and its body is not plaintext.
    let upper_path = fx.upper.as_ref().unwrap().join("f");
    let raw = fs::read(&upper_path).unwrap();
    assert_eq!(raw.len(), 11);
    assert_ne!(&raw, b"HELLO world");

    assert_eq!(read_all(&fx.fs, &node), b"HELLO world");

    // The lower original is untouched.
    assert_eq!(fs::read(fx.lowers[0].join("f")).unwrap(), b"hello world");
}

#[test]
fn setattr_mode_copies_up() {
    let fx = fixture(1, true);
    fs::write(fx.lowers[0].join("f"), b"abc").unwrap();

    let root = fx.fs.root();
    let node = fx.fs.lookup_ok(&root, "f").unwrap();
    let changes = SetAttrChanges {
        mode: Some(0o640),
        ..Default::default()
    };
    let stat = fx.fs.setattr(&node, &changes).unwrap();
    assert_eq!(stat.mode & 0o7777, 0o640);

    assert!(fx.upper.as_ref().unwrap().join("f").exists());
}

#[test]
fn setattr_without_changes_is_a_noop_on_stat() {
    let fx = fixture(1, true);
    fs::write(fx.lowers[0].join("f"), b"abc").unwrap();

    let root = fx.fs.root();
    let node = fx.fs.lookup_ok(&root, "f").unwrap();
    let before = fx.fs.stat_node(&node).unwrap();
    let after = fx.fs.setattr(&node, &SetAttrChanges::default()).unwrap();
    assert_eq!(before.size, after.size);
    assert_eq!(before.mode, after.mode);
    assert_eq!(before.uid, after.uid);
    assert_eq!(before.gid, after.gid);
}

#[test]
fn unlink_upper_only_file_needs_no_whiteout() {
    let fx = fixture(1, true);
    let root = fx.fs.root();

    let (_node, _file) = fx
        .fs
        .open_node(
            &root,
            Some("fresh"),
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
            caller(),
        )
        .unwrap();
    fx.fs.do_rm(&root, "fresh", false).unwrap();

    assert!(fx.fs.lookup_ok(&root, "fresh").is_err());
    let upper = fx.upper.as_ref().unwrap();
    assert!(!upper.join("fresh").exists());
    assert!(!upper.join(".wh.fresh").exists());
}

#[test]
fn create_unlink_create_behaves_like_single_create() {
    let fx = fixture(1, true);
    let root = fx.fs.root();

    let (node, file) = fx
        .fs
        .open_node(
            &root,
            Some("n"),
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
            caller(),
        )
        .unwrap();
    fx.fs.write_node(&node, &file, 0, b"first").unwrap();
    drop(file);
    fx.fs.do_rm(&root, "n", false).unwrap();

    let (node, file) = fx
        .fs
        .open_node(
            &root,
            Some("n"),
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
            caller(),
        )
        .unwrap();
    fx.fs.write_node(&node, &file, 0, b"second").unwrap();

    let stat = fx.fs.stat_node(&node).unwrap();
    assert_eq!(stat.size, 6);
    assert_eq!(read_all(&fx.fs, &node), b"second");
}

#[test]
fn rmdir_of_non_empty_directory_fails() {
    let fx = fixture(1, true);
    fs::create_dir(fx.lowers[0].join("d")).unwrap();
    fs::write(fx.lowers[0].join("d/x"), b"1").unwrap();

    let root = fx.fs.root();
    let err = fx.fs.do_rm(&root, "d", true).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
}

#[test]
fn rename_reestablishes_paths() {
    let fx = fixture(1, true);
    fs::create_dir(fx.lowers[0].join("d")).unwrap();
    fs::write(fx.lowers[0].join("d/a"), b"move me").unwrap();

    let root = fx.fs.root();
    let d = fx.fs.lookup_ok(&root, "d").unwrap();
    let a = fx.fs.lookup_ok(&d, "a").unwrap();

    fx.fs.mkdir(&root, "d2", 0o755, caller()).unwrap();
    let d2 = fx.fs.lookup_ok(&root, "d2").unwrap();

    fx.fs.rename_direct(&d, "a", &d2, "b", false).unwrap();

    assert_eq!(a.path(), "d2/b");
    assert_eq!(a.name(), "b");
    assert!(fx.fs.lookup_ok(&d, "a").is_err());
    let found = fx.fs.lookup_ok(&d2, "b").unwrap();
    assert!(Arc::ptr_eq(&found, &a));
    assert_eq!(read_all(&fx.fs, &found), b"move me");
}

#[test]
fn rename_noreplace_refuses_existing_destination() {
    let fx = fixture(1, true);
    fs::write(fx.lowers[0].join("a"), b"1").unwrap();
    fs::write(fx.lowers[0].join("b"), b"2").unwrap();

    let root = fx.fs.root();
    let err = fx.fs.rename_direct(&root, "a", &root, "b", true).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
}

#[test]
fn exchange_rename_swaps_two_upper_entries() {
    let fx = fixture(1, true);
    let root = fx.fs.root();

    for (name, content) in [("x", b"xx".as_slice()), ("y", b"yy".as_slice())] {
        let (node, file) = fx
            .fs
            .open_node(
                &root,
                Some(name),
                libc::O_CREAT | libc::O_WRONLY,
                0o644,
                caller(),
            )
            .unwrap();
        fx.fs.write_node(&node, &file, 0, content).unwrap();
    }

    fx.fs.rename_exchange(&root, "x", &root, "y").unwrap();

    let x = fx.fs.lookup_ok(&root, "x").unwrap();
    let y = fx.fs.lookup_ok(&root, "y").unwrap();
    assert_eq!(read_all(&fx.fs, &x), b"yy");
    assert_eq!(read_all(&fx.fs, &y), b"xx");
}

#[test]
fn hardlink_aliases_share_an_inode() {
    let fx = fixture(1, true);
    let root = fx.fs.root();

    let (node, file) = fx
        .fs
        .open_node(
            &root,
            Some("orig"),
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
            caller(),
        )
        .unwrap();
    fx.fs.write_node(&node, &file, 0, b"shared").unwrap();

    let alias = fx.fs.link(&node, &root, "alias").unwrap();
    assert_eq!(alias.kernel_ino(), node.kernel_ino());
    assert_eq!(read_all(&fx.fs, &alias), b"shared");
}

#[test]
fn reserved_xattr_names_are_invisible() {
    let fx = fixture(1, true);
    fs::write(fx.lowers[0].join("f"), b"x").unwrap();

    let root = fx.fs.root();
    let node = fx.fs.lookup_ok(&root, "f").unwrap();

    let err = fx
        .fs
        .setxattr(&node, "user.fuseoverlayfs.opaque", b"y")
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));

    let err = fx
        .fs
        .setxattr(&node, "trusted.overlay.opaque", b"y")
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));

    let err = fx
        .fs
        .getxattr(&node, "user.fuseoverlayfs.origin")
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENODATA));

    let err = fx
        .fs
        .removexattr(&node, "trusted.overlay.opaque")
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));

    let names = fx.fs.listxattr(&node).unwrap();
    assert!(names
        .iter()
        .all(|n| !n.starts_with("user.fuseoverlayfs.") && !n.starts_with("trusted.overlay.")));
}

#[test]
fn copied_up_file_keeps_its_kernel_inode() {
    let fx = fixture(1, true);
    fs::write(fx.lowers[0].join("f"), b"body").unwrap();

    let root = fx.fs.root();
    let node = fx.fs.lookup_ok(&root, "f").unwrap();
    let ino_before = node.kernel_ino();

    let changes = SetAttrChanges {
        mode: Some(0o600),
        ..Default::default()
    };
    fx.fs.setattr(&node, &changes).unwrap();

    let again = fx.fs.lookup_ok(&root, "f").unwrap();
    assert_eq!(again.kernel_ino(), ino_before);
}

#[test]
fn too_long_names_are_rejected() {
    let fx = fixture(1, true);
    let root = fx.fs.root();
    let long = "x".repeat(300);

    let err = fx
        .fs
        .open_node(
            &root,
            Some(&long),
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
            caller(),
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));

    let err = fx.fs.mkdir(&root, &long, 0o755, caller()).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
}

#[test]
fn symlink_and_readlink_roundtrip() {
    let fx = fixture(1, true);
    let root = fx.fs.root();

    let node = fx
        .fs
        .symlink(&root, "ln", "target/path", caller())
        .unwrap();
    let target = fx.fs.readlink(&node).unwrap();
    assert_eq!(target, std::ffi::OsString::from("target/path"));
}

#[test]
fn mknod_creates_a_fifo_on_the_upper_layer() {
    let fx = fixture(1, true);
    let root = fx.fs.root();

    fx.fs
        .mknod(&root, "pipe", libc::S_IFIFO | 0o644, 0, caller())
        .unwrap();

    let meta = fs::symlink_metadata(fx.upper.as_ref().unwrap().join("pipe")).unwrap();
    assert_eq!(
        std::os::unix::fs::MetadataExt::mode(&meta) & libc::S_IFMT,
        libc::S_IFIFO
    );
}

#[test]
fn lower_directory_listing_survives_copy_up_of_one_child(){
    let fx = fixture(1, true);
    fs::create_dir(fx.lowers[0].join("d")).unwrap();
    fs::write(fx.lowers[0].join("d/a"), b"1").unwrap();
    fs::write(fx.lowers[0].join("d/b"), b"2").unwrap();

    let root = fx.fs.root();
    let d = fx.fs.lookup_ok(&root, "d").unwrap();
    let a = fx.fs.lookup_ok(&d, "a").unwrap();

    let changes = SetAttrChanges {
        mode: Some(0o600),
        ..Default::default()
    };
    fx.fs.setattr(&a, &changes).unwrap();

    assert_eq!(names(&fx.fs, &d), vec!["a", "b"]);
    assert_eq!(read_all(&fx.fs, &fx.fs.lookup_ok(&d, "b").unwrap()), b"2");
}

fn touch_tree(base: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = base.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }
}

#[test]
fn rename_out_of_a_lower_directory_hides_the_old_name() {
    let fx = fixture(1, true);
    touch_tree(&fx.lowers[0], &[("d/a", "1")]);

    let root = fx.fs.root();

    // Copy the directory up first so the rename stays on the upper layer.
    let d = fx.fs.lookup_ok(&root, "d").unwrap();
    let a = fx.fs.lookup_ok(&d, "a").unwrap();
    let changes = SetAttrChanges {
        mode: Some(0o600),
        ..Default::default()
    };
    fx.fs.setattr(&a, &changes).unwrap();

    fx.fs.rename_direct(&d, "a", &root, "a2", false).unwrap();

    // The old name resolves to nothing even though the lower copy remains.
    assert!(fx.fs.lookup_ok(&d, "a").is_err());
    assert!(fx.lowers[0].join("d/a").exists());
    assert_eq!(read_all(&fx.fs, &fx.fs.lookup_ok(&root, "a2").unwrap()), b"1");
}
