use jailfs::idmap::{parse_mappings, IdMapper, MapRange};

#[test]
fn parses_triples() -> jailfs::Result<()> {
    let ranges = parse_mappings("0:1000:1:1000:2000:500")?;
    assert_eq!(
        ranges,
        vec![
            MapRange {
                host: 0,
                presented: 1000,
                len: 1
            },
            MapRange {
                host: 1000,
                presented: 2000,
                len: 500
            }
        ]
    );
    Ok(())
}

#[test]
fn rejects_ragged_specs() {
    assert!(parse_mappings("0:1000").is_err());
    assert!(parse_mappings("a:b:c").is_err());
    assert!(parse_mappings("0:1000:1:5").is_err());
}

#[test]
fn maps_both_directions() -> jailfs::Result<()> {
    let mapper = IdMapper::new(Some("1000:0:1000"), None, false, None, None)?;
    // host 1000..2000 presented as 0..1000
    assert_eq!(mapper.uid_out(1000), 0);
    assert_eq!(mapper.uid_out(1500), 500);
    assert_eq!(mapper.uid_in(0), 1000);
    assert_eq!(mapper.uid_in(500), 1500);
    Ok(())
}

#[test]
fn unmapped_ids_pass_through_without_table() -> jailfs::Result<()> {
    let mapper = IdMapper::new(None, None, false, None, None)?;
    assert_eq!(mapper.uid_out(42), 42);
    assert_eq!(mapper.gid_out(42), 42);
    Ok(())
}

#[test]
fn out_of_range_ids_become_overflow() -> jailfs::Result<()> {
    let mapper = IdMapper::new(Some("0:0:100"), None, false, None, None)?;
    let mapped = mapper.uid_out(5000);
    // Whatever the host reports as its overflow uid, never the input.
    assert_ne!(mapped, 5000);
    Ok(())
}

#[test]
fn squash_to_uid_wins_over_everything() -> jailfs::Result<()> {
    let mapper = IdMapper::new(Some("0:9:10"), None, true, Some(1000), None)?;
    assert_eq!(mapper.uid_out(0), 1000);
    assert_eq!(mapper.uid_out(12345), 1000);
    // Reverse direction ignores squashing.
    assert_eq!(mapper.uid_in(9), 0);
    Ok(())
}

#[test]
fn squash_to_root_forces_zero() -> jailfs::Result<()> {
    let mapper = IdMapper::new(None, None, true, None, None)?;
    assert_eq!(mapper.uid_out(4242), 0);
    assert_eq!(mapper.gid_out(4242), 0);
    assert!(mapper.squashed());
    Ok(())
}
