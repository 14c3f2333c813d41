use pregen_io::{RosterStore, SchedulerConfig, ConfigSource, TomlConfigFile};
use pregen_world::{CellKey, KeySet, PartitionId};

fn keys_for(n: i32) -> Vec<CellKey> {
    (0..n)
        .map(|i| CellKey::new(i * 37 - 5_000, -(i * 13) + 77))
        .collect()
}

#[test]
fn save_then_load_reproduces_completed_sets() {
    let dir = tempfile::tempdir().unwrap();
    let store = RosterStore::new(dir.path());
    for n in [0, 1, 10_000] {
        let partition = PartitionId::new(format!("test:dim_{n}"));
        let original: KeySet = keys_for(n).into_iter().collect();
        assert_eq!(store.save(&partition, &original).unwrap(), n as usize);

        let restored = KeySet::new();
        restored.insert(CellKey::new(123, 456));
        assert_eq!(store.load(&partition, &restored), n as usize);

        let mut a = original.snapshot();
        let mut b = restored.snapshot();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }
}

#[test]
fn corrupt_roster_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = RosterStore::new(dir.path());
    let partition = PartitionId::new("minecraft:overworld");
    std::fs::write(store.path_for(&partition), [0u8, 0, 0, 9, 1, 2]).unwrap();
    let set = KeySet::new();
    set.insert(CellKey::new(1, 1));
    assert_eq!(store.load(&partition, &set), 0);
    assert!(set.is_empty());
}

#[test]
fn failed_save_keeps_previous_roster() {
    let dir = tempfile::tempdir().unwrap();
    let store = RosterStore::new(dir.path());
    let partition = PartitionId::new("p");
    let first: KeySet = keys_for(3).into_iter().collect();
    store.save(&partition, &first).unwrap();

    // a directory squatting on the temp path makes the next write fail
    let tmp = store.path_for(&partition).with_extension("bin.tmp");
    std::fs::create_dir(&tmp).unwrap();
    let second: KeySet = keys_for(50).into_iter().collect();
    assert!(store.save(&partition, &second).is_err());

    let restored = KeySet::new();
    assert_eq!(store.load(&partition, &restored), 3);
}

#[test]
fn missing_roster_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = RosterStore::new(dir.path().join("nested"));
    assert!(store.try_load(&PartitionId::new("nothing")).unwrap().is_none());
}

#[test]
fn missing_config_file_is_created_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let source = TomlConfigFile::new(dir.path().join("pregen.toml"));
    let cfg = source.load();
    assert!(source.path().exists());
    assert_eq!(source.try_load().unwrap(), cfg);

    std::fs::write(source.path(), "generation_radius = \"wide\"").unwrap();
    // parse failure falls back to the last good config
    assert_eq!(source.load(), cfg);

    std::fs::write(source.path(), "max_active_tasks = 9").unwrap();
    let reloaded = source.load();
    assert_eq!(reloaded.max_active_tasks, 9);
    assert_eq!(reloaded.generation_radius, SchedulerConfig::default().generation_radius);
}
