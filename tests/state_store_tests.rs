mod common;

use chrono::Duration;
use common::t0;
use warden::client::state::{chain_seed, next_chain, GraceLatch, LoadedState, StateStore};
use warden::client::storage::{StorageDir, StorageKey};

fn open(dir: &tempfile::TempDir) -> StateStore {
    StateStore::open(StorageDir::new(dir.path())).unwrap()
}

#[test]
fn record_then_load_returns_what_was_written() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let written = store.record(t0(), "build-1").unwrap();
    let loaded = store.load("build-1");
    assert_eq!(loaded, LoadedState::Valid(written.clone()));
    assert_eq!(written.last_good, t0());
    assert_eq!(written.fingerprint, "build-1");

    // Repeated loads of an unmodified file agree.
    assert_eq!(store.load("build-1"), loaded);
    assert_eq!(store.load("build-1"), loaded);
}

#[test]
fn state_survives_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let written = open(&dir).record(t0(), "build-1").unwrap();
    assert_eq!(open(&dir).load("build-1"), LoadedState::Valid(written));
}

#[test]
fn flipping_any_byte_invalidates_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.record(t0(), "build-1").unwrap();

    let path = store.storage().path(StorageKey::State);
    let original = std::fs::read(&path).unwrap();

    for i in 0..original.len() {
        for mask in [0x01u8, 0x20, 0x80, 0xFF] {
            let mut mutated = original.clone();
            mutated[i] ^= mask;
            std::fs::write(&path, &mutated).unwrap();
            assert!(
                store.load("build-1").valid().is_none(),
                "byte {i} ^ {mask:#04x} was accepted: {}",
                String::from_utf8_lossy(&mutated)
            );
        }
    }

    std::fs::write(&path, &original).unwrap();
    assert!(store.load("build-1").valid().is_some());
}

#[test]
fn truncated_record_reads_as_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.record(t0(), "build-1").unwrap();

    let path = store.storage().path(StorageKey::State);
    let original = std::fs::read(&path).unwrap();
    std::fs::write(&path, &original[..original.len() / 2]).unwrap();
    assert!(store.load("build-1").is_tampered());
}

#[test]
fn fingerprint_mismatch_reads_as_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.record(t0(), "build-1").unwrap();
    assert!(store.load("build-2").is_tampered());
    assert!(store.load("build-1").valid().is_some());
}

#[test]
fn chain_links_follow_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);

    let mut expected = chain_seed();
    for day in 0..4 {
        let at = t0() + Duration::days(day);
        let state = store.record(at, "build-1").unwrap();
        expected = next_chain(&expected, at.timestamp(), "build-1");
        assert_eq!(state.chain, expected);
        assert_eq!(state.counter, day as u64 + 1);
    }
}

#[test]
fn replaying_an_older_state_file_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let path = store.storage().path(StorageKey::State);

    store.record(t0(), "build-1").unwrap();
    let old = std::fs::read(&path).unwrap();
    store.record(t0() + Duration::days(6), "build-1").unwrap();

    std::fs::write(&path, old).unwrap();
    assert!(store.load("build-1").is_tampered());
}

#[test]
fn last_good_never_decreases() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.record(t0() + Duration::days(2), "build-1").unwrap();

    let clamped = store.record(t0(), "build-1").unwrap();
    assert_eq!(clamped.last_good, t0() + Duration::days(2));
    assert_eq!(
        store.load("build-1").valid().map(|s| s.last_good),
        Some(t0() + Duration::days(2))
    );
}

#[test]
fn losing_the_secret_invalidates_everything() {
    let dir = tempfile::tempdir().unwrap();
    open(&dir).record(t0(), "build-1").unwrap();
    std::fs::remove_file(dir.path().join("secret.key")).unwrap();

    let store = open(&dir);
    assert!(store.load("build-1").is_tampered());
}

#[test]
fn watermark_is_bound_to_one_link() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let first = store.record(t0(), "build-1").unwrap();
    store
        .observe(&first, t0() + Duration::days(1), Some(GraceLatch::RollbackDetected))
        .unwrap();

    let second = store.record(t0() + Duration::days(1), "build-1").unwrap();
    assert!(store.watermark(&first).is_err());
    let wm = store.watermark(&second).unwrap();
    assert_eq!(wm.latch, None);
    assert_eq!(wm.highest_seen, second.last_good);
}

#[test]
fn wipe_removes_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    store.record(t0(), "build-1").unwrap();
    store.wipe().unwrap();

    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    assert_eq!(open(&dir).load("build-1"), LoadedState::Absent);
}
