use jailfs::profile::HideList;

#[test]
fn blacklist_entry_hides_a_name() {
    let list = HideList::parse("blacklist /secret\n");
    assert!(list.hides("", "secret"));
    assert!(!list.hides("", "public"));
}

#[test]
fn whitelist_subtracts_from_blacklist() {
    let list = HideList::parse("blacklist /data/keep\nwhitelist /data/keep\n");
    assert!(!list.hides("data", "keep"));
}

#[test]
fn nowhitelist_restores_the_blacklist_entry() {
    let list = HideList::parse(
        "blacklist /data/keep\nwhitelist /data/keep\nnowhitelist /data/keep\n",
    );
    assert!(list.hides("data", "keep"));
}

#[test]
fn trailing_slash_hides_the_subtree() {
    let list = HideList::parse("blacklist /vault/private/\n");
    assert!(list.hides("vault/private", "anything"));
    assert!(list.hides("vault/private/nested", "file"));
    assert!(!list.hides("var", "file"));
}

#[test]
fn nested_entry_matches_its_parent_directory() {
    let list = HideList::parse("blacklist /etc/shadow\n");
    assert!(list.hides("etc", "shadow"));
    assert!(!list.hides("etc", "passwd"));
    assert!(!list.hides("", "shadow"));
}

#[test]
fn comments_and_blank_lines_are_ignored() {
    let list = HideList::parse("# a comment\n\nblacklist /x\n");
    assert!(list.hides("", "x"));
}

#[test]
fn whitespace_is_collapsed() {
    let list = HideList::parse("blacklist   /spaced\n");
    assert!(list.hides("", "spaced"));
}

#[test]
fn home_macro_without_pkexec_uid_drops_the_entry() {
    // No PKEXEC_UID in the test environment: entries needing expansion are
    // skipped rather than guessed.
    std::env::remove_var("PKEXEC_UID");
    let list = HideList::parse("blacklist ${HOME}/x\n");
    assert!(list.is_empty());
}

#[test]
fn missing_file_yields_empty_list() {
    let list = HideList::load("/nonexistent/profile.config");
    assert!(list.is_empty());
}

#[test]
fn unknown_directives_are_ignored() {
    let list = HideList::parse("include /other\nblacklist /y\n");
    assert!(list.hides("", "y"));
}
