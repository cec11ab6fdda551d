use shardfabric::shard::ShardStoreError;
use shardfabric::{Membership, ShardState, ShardStateStore, StateMachineKind};
use std::error::Error;
use std::fs;
use tempfile::TempDir;

#[test]
fn saved_state_loads_back_and_lists_in_order() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path().join("shards"));
    assert!(store.list()?.is_empty());
    assert!(store.load(1)?.is_none());

    let second = ShardState::bootstrap(20, 2, StateMachineKind::Test, "node-b:9000");
    let first = ShardState::bootstrap(3, 1, StateMachineKind::Kv, "node-a:9000");
    store.save(&second)?;
    store.save(&first)?;
    fs::write(store.root().join("notes.txt"), b"ignored")?;

    assert_eq!(store.load(3)?, Some(first.clone()));
    let listed: Vec<u64> = store.list()?.iter().map(|state| state.shard_id).collect();
    assert_eq!(listed, vec![3, 20]);
    assert!(!store.path_for(3).with_extension("tmp").exists());
    Ok(())
}

#[test]
fn bootstrap_state_lists_only_the_local_replica() {
    let state = ShardState::bootstrap(5, 4, StateMachineKind::Kv, "node-d:9000");
    assert!(!state.join);
    assert_eq!(state.members, Membership::single(4, "node-d:9000"));
    assert!(state.members.contains(4));
    assert!(!state.members.contains(1));
}

#[test]
fn membership_updates_only_touch_known_shards() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path());
    store.save(&ShardState::bootstrap(
        9,
        1,
        StateMachineKind::Kv,
        "node-a:9000",
    ))?;
    let mut members = Membership::single(1, "node-a:9000");
    members.witnesses.insert(5, "node-e:9000".into());
    members.removed.insert(2);
    members.config_change_id = 17;

    assert!(store.update_members(9, members.clone())?);
    assert!(!store.update_members(10, members.clone())?);

    let state = store.load(9)?.expect("shard 9");
    assert_eq!(state.members, members);
    assert!(state.members.contains(5));
    Ok(())
}

#[test]
fn remove_reports_whether_state_existed() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path());
    store.save(&ShardState::bootstrap(1, 1, StateMachineKind::Kv, "h"))?;

    assert!(store.remove(1)?);
    assert!(!store.remove(1)?);
    assert!(store.load(1)?.is_none());
    Ok(())
}

#[test]
fn misfiled_state_is_reported() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path());
    store.save(&ShardState::bootstrap(1, 1, StateMachineKind::Kv, "h"))?;
    fs::rename(store.path_for(1), store.path_for(2))?;

    assert!(matches!(
        store.load(2),
        Err(ShardStoreError::Mismatch {
            expected: 2,
            found: 1,
            ..
        })
    ));
    Ok(())
}

#[test]
fn older_files_without_optional_fields_still_load() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let store = ShardStateStore::new(tmp.path());
    fs::write(
        store.path_for(4),
        br#"{"shard_id":4,"replica_id":2,"kind":"kv","hostname":"node-b:9000"}"#,
    )?;

    let state = store.load(4)?.expect("shard 4");
    assert_eq!(state.kind, StateMachineKind::Kv);
    assert!(!state.join);
    assert_eq!(state.members, Membership::default());
    Ok(())
}
