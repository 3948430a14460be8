//! End-to-end scenarios driving the composition engine the way the kernel
//! adapter does, against real directory trees.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use jailfs::config::MountOptions;
use jailfs::crypto::CryptoParams;
use jailfs::fs::node::Node;
use jailfs::fs::overlay::OverlayFs;
use jailfs::profile::HideList;
use tempfile::{tempdir, TempDir};

struct Mount {
    _keep: Vec<TempDir>,
    lower: PathBuf,
    upper: Option<PathBuf>,
    fs: OverlayFs,
}

fn caller() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

fn mount(writable: bool, extra_opts: &str) -> Mount {
    let mut keep = Vec::new();

    let lower_dir = tempdir().unwrap();
    let lower = lower_dir.path().to_path_buf();
    keep.push(lower_dir);

    // timeout=0 keeps listings uncached so fixtures can seed the lower
    // tree after the engine comes up.
    let mut opt_string = format!("lowerdir={},timeout=0", lower.display());

    let upper = if writable {
        let dir = tempdir().unwrap();
        let upper_path = dir.path().join("upper");
        fs::create_dir(&upper_path).unwrap();
        opt_string.push_str(&format!(
            ",upperdir={},workdir={}",
            upper_path.display(),
            dir.path().join("work").display()
        ));
        keep.push(dir);
        Some(upper_path)
    } else {
        None
    };

    if !extra_opts.is_empty() {
        opt_string.push(',');
        opt_string.push_str(extra_opts);
    }

    let opts = MountOptions::parse([opt_string.as_str()]).unwrap();

    let mnt = tempdir().unwrap();
    let mountpoint = mnt.path().join("mnt");
    keep.push(mnt);

    let fs = OverlayFs::with_hide_list(
        &opts,
        &mountpoint,
        CryptoParams::default(),
        HideList::default(),
    )
    .unwrap();

    Mount {
        _keep: keep,
        lower,
        upper,
        fs,
    }
}

fn read_path(fs: &OverlayFs, parent: &Arc<Node>, name: &str) -> Vec<u8> {
    let node = fs.lookup_ok(parent, name).unwrap();
    let (node, file) = fs
        .open_node(&node, None, libc::O_RDONLY, 0, caller())
        .unwrap();
    fs.read_node(&node, &file, 0, 1 << 16).unwrap()
}

fn listing(fs: &OverlayFs, node: &Arc<Node>) -> Vec<String> {
    let mut v: Vec<String> = fs
        .dir_entries(node)
        .unwrap()
        .iter()
        .map(|n| n.name())
        .collect();
    v.sort();
    v
}

fn is_whiteout_on_disk(path: &std::path::Path) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_char_device() && meta.rdev() == 0,
        Err(_) => false,
    }
}

// Lowers L1={a:"x"}, no upper: reads pass through, writes fail read-only.
#[test]
fn read_only_stack_rejects_writes() {
    let m = mount(false, "");
    fs::write(m.lower.join("a"), b"x").unwrap();

    let root = m.fs.root();
    assert_eq!(read_path(&m.fs, &root, "a"), b"x");

    let node = m.fs.lookup_ok(&root, "a").unwrap();
    let err = m
        .fs
        .open_node(&node, None, libc::O_WRONLY, 0, caller())
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EROFS));
}

// Lowers L1={a:"xxxxxxxxx"}, upper U={}: a one-byte write at offset zero
// copies up, preserves length, and re-resolves to the upper layer.
#[test]
fn first_write_copies_up_and_preserves_length() {
    let m = mount(true, "");
    fs::write(m.lower.join("a"), b"xxxxxxxxx").unwrap();

    let root = m.fs.root();
    let node = m.fs.lookup_ok(&root, "a").unwrap();
    let (node, file) = m
        .fs
        .open_node(&node, None, libc::O_WRONLY, 0, caller())
        .unwrap();
    m.fs.write_node(&node, &file, 0, b"Y").unwrap();

    assert_eq!(read_path(&m.fs, &root, "a"), b"Yxxxxxxxx");

    let upper_file = m.upper.as_ref().unwrap().join("a");
    assert!(upper_file.exists());
    assert_eq!(fs::metadata(&upper_file).unwrap().len(), 9);
    // The upper body is ciphertext.
    assert_ne!(fs::read(&upper_file).unwrap(), b"Yxxxxxxxx");

    assert!(m.fs.node_uses_crypto(&node));
}

// Lowers L1={d/{a,b}}, upper U={}: unlink(d/a) leaves a whiteout and the
// merged listing drops the name.
#[test]
fn unlink_hides_a_lower_name_with_a_whiteout() {
    let m = mount(true, "");
    fs::create_dir(m.lower.join("d")).unwrap();
    fs::write(m.lower.join("d/a"), b"1").unwrap();
    fs::write(m.lower.join("d/b"), b"2").unwrap();

    let root = m.fs.root();
    let d = m.fs.lookup_ok(&root, "d").unwrap();
    m.fs.do_rm(&d, "a", false).unwrap();

    assert_eq!(listing(&m.fs, &d), vec!["b"]);
    assert!(m.fs.lookup_ok(&d, "a").is_err());

    let upper_d = m.upper.as_ref().unwrap().join("d");
    let has_marker =
        upper_d.join(".wh.a").exists() || is_whiteout_on_disk(&upper_d.join("a"));
    assert!(has_marker, "expected a whiteout for d/a on the upper layer");
}

// Lowers L1={d/{a}}, upper U={}: mkdir(d2) then rename(d/a -> d2/a).
#[test]
fn rename_into_a_new_directory() {
    let m = mount(true, "");
    fs::create_dir(m.lower.join("d")).unwrap();
    fs::write(m.lower.join("d/a"), b"payload").unwrap();

    let root = m.fs.root();
    m.fs.mkdir(&root, "d2", 0o755, caller()).unwrap();

    let d = m.fs.lookup_ok(&root, "d").unwrap();
    let d2 = m.fs.lookup_ok(&root, "d2").unwrap();
    m.fs.rename_direct(&d, "a", &d2, "a", false).unwrap();

    assert!(listing(&m.fs, &d).is_empty());
    assert!(m.fs.lookup_ok(&d, "a").is_err());
    assert_eq!(listing(&m.fs, &d2), vec!["a"]);
    assert_eq!(read_path(&m.fs, &d2, "a"), b"payload");
}

// mkdir over an existing lower directory shadows its contents (opaque).
#[test]
fn recreated_directory_is_opaque() {
    let m = mount(true, "");
    fs::create_dir(m.lower.join("d")).unwrap();
    fs::write(m.lower.join("d/old"), b"stale").unwrap();

    let root = m.fs.root();
    m.fs.do_rm(&root, "d", true).unwrap_err(); // non-empty, must refuse

    // Remove the children first, then the directory, then recreate it.
    let d = m.fs.lookup_ok(&root, "d").unwrap();
    m.fs.do_rm(&d, "old", false).unwrap();
    m.fs.do_rm(&root, "d", true).unwrap();
    m.fs.mkdir(&root, "d", 0o755, caller()).unwrap();

    let d = m.fs.lookup_ok(&root, "d").unwrap();
    assert!(listing(&m.fs, &d).is_empty());
}

// setxattr in a reserved namespace fails with permission-denied.
#[test]
fn reserved_xattr_namespace_is_refused() {
    let m = mount(true, "");
    let root = m.fs.root();
    m.fs.mkdir(&root, "e", 0o755, caller()).unwrap();
    let e = m.fs.lookup_ok(&root, "e").unwrap();

    let err = m
        .fs
        .setxattr(&e, "user.fuseoverlayfs.opaque", b"y")
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));
}

// With squash_to_uid=1000 every stat reports uid 1000.
#[test]
fn squash_to_uid_rewrites_ownership() {
    let m = mount(false, "squash_to_uid=1000");
    fs::write(m.lower.join("owned"), b"z").unwrap();

    let root = m.fs.root();
    let node = m.fs.lookup_ok(&root, "owned").unwrap();
    let stat = m.fs.stat_node(&node).unwrap();
    assert_eq!(stat.uid, 1000);
}

// Copy-up followed by read returns the lower content byte for byte.
#[test]
fn copy_up_is_content_preserving() {
    let m = mount(true, "");
    let body: Vec<u8> = (0..4096u32 + 123).map(|i| (i % 251) as u8).collect();
    fs::write(m.lower.join("big"), &body).unwrap();

    let root = m.fs.root();
    let node = m.fs.lookup_ok(&root, "big").unwrap();

    // Trigger copy-up via an ownership-free metadata change.
    let changes = jailfs::fs::overlay::SetAttrChanges {
        mode: Some(0o600),
        ..Default::default()
    };
    m.fs.setattr(&node, &changes).unwrap();

    assert!(m.upper.as_ref().unwrap().join("big").exists());
    assert_eq!(read_path(&m.fs, &root, "big"), body);
}

// Whiteouts survive a remount: a fresh engine over the same trees still
// hides the deleted name.
#[test]
fn whiteouts_are_durable_across_engines() {
    let m = mount(true, "");
    fs::create_dir(m.lower.join("d")).unwrap();
    fs::write(m.lower.join("d/a"), b"1").unwrap();

    {
        let root = m.fs.root();
        let d = m.fs.lookup_ok(&root, "d").unwrap();
        m.fs.do_rm(&d, "a", false).unwrap();
    }

    // Second engine over the same lower/upper/work trees.
    let upper = m.upper.clone().unwrap();
    let work_base = upper.parent().unwrap().join("work2");
    let opts = MountOptions::parse([format!(
        "lowerdir={},upperdir={},workdir={}",
        m.lower.display(),
        upper.display(),
        work_base.display()
    )
    .as_str()])
    .unwrap();
    let mnt = tempdir().unwrap();
    let fs2 = OverlayFs::with_hide_list(
        &opts,
        &mnt.path().join("mnt"),
        CryptoParams::default(),
        HideList::default(),
    )
    .unwrap();

    let root = fs2.root();
    let d = fs2.lookup_ok(&root, "d").unwrap();
    assert!(fs2.lookup_ok(&d, "a").is_err());
    assert!(listing(&fs2, &d).is_empty());
}
