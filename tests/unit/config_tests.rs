use jailfs::config::{MountOptions, StatOverride};

#[test]
fn defaults_match_documented_values() {
    let opts = MountOptions::default();
    assert!(opts.fsync);
    assert!(opts.writeback);
    assert!(opts.threaded);
    assert!(!opts.fast_ino);
    assert!(!opts.noxattrs);
    assert_eq!(opts.xattr_permissions, 0);
    assert_eq!(opts.timeout, 1000000000.0);
    assert!(opts.squash_to_uid.is_none());
    assert!(opts.squash_to_gid.is_none());
}

#[test]
fn parses_lower_upper_work() -> jailfs::Result<()> {
    let opts = MountOptions::parse(["lowerdir=/l1:/l2,upperdir=/up,workdir=/work"])?;
    assert_eq!(
        opts.lower_dirs(),
        vec![std::path::PathBuf::from("/l1"), std::path::PathBuf::from("/l2")]
    );
    assert_eq!(opts.upperdir.as_deref(), Some(std::path::Path::new("/up")));
    assert_eq!(opts.workdir.as_deref(), Some(std::path::Path::new("/work")));
    opts.validate()?;
    Ok(())
}

#[test]
fn multiple_option_strings_accumulate() -> jailfs::Result<()> {
    let opts = MountOptions::parse(["lowerdir=/l", "fsync=0,squash_to_uid=1000"])?;
    assert!(!opts.fsync);
    assert_eq!(opts.squash_to_uid, Some(1000));
    Ok(())
}

#[test]
fn volatile_is_an_alias_for_no_fsync() -> jailfs::Result<()> {
    let opts = MountOptions::parse(["lowerdir=/l,volatile"])?;
    assert!(!opts.fsync);
    Ok(())
}

#[test]
fn redirect_dir_only_accepts_off() {
    assert!(MountOptions::parse(["redirect_dir=off"]).is_ok());
    assert!(MountOptions::parse(["redirect_dir=on"]).is_err());
}

#[test]
fn xattr_permissions_range_checked() {
    assert_eq!(
        MountOptions::parse(["xattr_permissions=1"])
            .unwrap()
            .stat_override(),
        StatOverride::Privileged
    );
    assert_eq!(
        MountOptions::parse(["xattr_permissions=2"])
            .unwrap()
            .stat_override(),
        StatOverride::User
    );
    assert!(MountOptions::parse(["xattr_permissions=3"]).is_err());
}

#[test]
fn upper_without_workdir_is_rejected() {
    let opts = MountOptions::parse(["lowerdir=/l,upperdir=/up"]).unwrap();
    assert!(opts.validate().is_err());
}

#[test]
fn missing_lowerdir_is_rejected() {
    let opts = MountOptions::parse(["upperdir=/up,workdir=/w"]).unwrap();
    assert!(opts.validate().is_err());
}

#[test]
fn kernel_passthrough_options_are_ignored() -> jailfs::Result<()> {
    let opts = MountOptions::parse(["lowerdir=/l,allow_other,default_permissions,noatime"])?;
    opts.validate()?;
    Ok(())
}

#[test]
fn usage_names_the_binary_and_mountpoint() {
    let cmd = jailfs::cli::clap_command();
    let usage = cmd.clone().render_usage().to_string();
    assert!(usage.contains("jailfs"));
    assert!(usage.to_lowercase().contains("mountpoint"));
}
