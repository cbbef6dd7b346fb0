//! Cross-module queue persistence contract: mutations must survive a
//! `save`/`load` round trip through `queue.json`, and a missing file must
//! start an empty queue rather than erroring (spec.md §4.9).

use flowcast_core::metadata::AudioMetadata;
use flowcast_core::queue::{PlaybackMode, QueueStore};
use tempfile::tempdir;

fn track(title: &str) -> AudioMetadata {
    AudioMetadata {
        title: Some(title.into()),
        sample_rate: 44_100,
        channels: 2,
        bit_depth: 16,
        ..Default::default()
    }
}

#[test]
fn queue_survives_a_save_and_load_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");

    let mut store = QueueStore::load(&path).unwrap();
    assert!(store.is_empty());
    store.add("a.flac", track("A")).unwrap();
    store.add("b.flac", track("B")).unwrap();
    store.add("c.flac", track("C")).unwrap();
    store.advance().unwrap();

    let reloaded = QueueStore::load(&path).unwrap();
    assert_eq!(reloaded.len(), 3);
    assert_eq!(reloaded.state().current_index, 1);
    assert_eq!(reloaded.get_current().unwrap().file_path, "b.flac");
}

#[test]
fn missing_queue_file_starts_empty_rather_than_erroring() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("does_not_exist.json");
    let store = QueueStore::load(&path).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.state().current_index, 0);
}

#[test]
fn removing_the_current_entry_rebalances_index_and_positions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");

    let mut store = QueueStore::load(&path).unwrap();
    store.add("a.flac", track("A")).unwrap();
    store.add("b.flac", track("B")).unwrap();
    store.add("c.flac", track("C")).unwrap();
    store.advance().unwrap();
    store.advance().unwrap();
    assert_eq!(store.state().current_index, 2);

    store.remove(1).unwrap();
    assert_eq!(store.state().current_index, 1);
    for (i, entry) in store.state().entries.iter().enumerate() {
        assert_eq!(entry.position, i);
    }

    let reloaded = QueueStore::load(&path).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.state().current_index, 1);
}

#[test]
fn playback_mode_persists_across_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");

    let mut store = QueueStore::load(&path).unwrap();
    store.add("a.flac", track("A")).unwrap();
    assert_eq!(store.state().mode, PlaybackMode::Sequential);
    store.save().unwrap();

    let reloaded = QueueStore::load(&path).unwrap();
    assert_eq!(reloaded.state().mode, PlaybackMode::Sequential);
}
