//! Exercises the Host-Key Trust Store as an on-disk SQLite file across
//! separate connections, the way the gateway binary actually uses it
//! (spec §4.9): one process opens the store at startup, trusts a host,
//! and a later open of the same path must see what was trusted.

use webshgate::hostkey::{fingerprint, TrustStore};

#[test]
fn trusted_host_persists_across_separate_opens() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("known_hosts.sqlite3");
    let path = path.to_str().expect("utf8 path");

    {
        let store = TrustStore::open(path).expect("open for write");
        store.add_known_host("example.test", 22, "ssh-ed25519", b"key-bytes", Some("seen via gateway"), 1_000).expect("add");
    }

    let store = TrustStore::open(path).expect("reopen");
    let known = store.lookup("example.test", 22, "ssh-ed25519").expect("lookup").expect("host present");
    assert_eq!(known.key, b"key-bytes");
    assert_eq!(known.comment.as_deref(), Some("seen via gateway"));

    assert!(store.remove_host("example.test", 22, "ssh-ed25519").expect("remove"));
    assert!(store.lookup("example.test", 22, "ssh-ed25519").expect("lookup after remove").is_none());
}

#[test]
fn replacing_a_known_host_changes_its_fingerprint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("known_hosts.sqlite3");
    let path = path.to_str().expect("utf8 path");
    let store = TrustStore::open(path).expect("open");

    store.add_known_host("router.test", 22, "ssh-ed25519", b"first-key", None, 1_000).expect("add first");
    let first = fingerprint(b"first-key");

    store.add_known_host("router.test", 22, "ssh-ed25519", b"second-key", None, 2_000).expect("replace");
    let known = store.lookup("router.test", 22, "ssh-ed25519").expect("lookup").expect("present");

    assert_ne!(fingerprint(&known.key), first);
    assert_eq!(fingerprint(&known.key), fingerprint(b"second-key"));
}
