use shardfabric::{ConfigError, NodeConfig};
use std::error::Error;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn minimal_config_uses_control_defaults() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("node.yaml");
    fs::write(&path, "node_id: node-a\ndata_dir: state\n")?;

    let config = NodeConfig::load(&path)?;

    assert_eq!(config.node_id, "node-a");
    assert_eq!(config.data_dir, tmp.path().join("state"));
    assert_eq!(config.control.bind, None);
    assert_eq!(config.control.default_timeout(), Duration::from_secs(3));
    assert_eq!(config.control.compaction_timeout(), Duration::from_secs(30));
    assert_eq!(config.control.max_payload_bytes, 64 * 1024 * 1024);
    assert_eq!(
        config.store_path(7, 2),
        tmp.path().join("state/shard-7/replica-2/store.db")
    );
    assert_eq!(config.shard_state_dir(), tmp.path().join("state/shards"));
    Ok(())
}

#[test]
fn control_section_overrides_defaults() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("node.yaml");
    let absolute = tmp.path().join("absolute-data");
    fs::write(
        &path,
        format!(
            "node_id: node-b\ndata_dir: {}\ncontrol:\n  bind: 127.0.0.1:7400\n  default_timeout_ms: 500\n  max_connections: 4\n",
            absolute.display()
        ),
    )?;

    let config = NodeConfig::load(&path)?;

    assert_eq!(config.data_dir, absolute);
    assert_eq!(config.control.bind.as_deref(), Some("127.0.0.1:7400"));
    assert_eq!(config.control.default_timeout(), Duration::from_millis(500));
    assert_eq!(config.control.max_connections, 4);
    assert_eq!(config.control.write_timeout(), Duration::from_secs(1));
    Ok(())
}

#[test]
fn invalid_configs_are_rejected() -> Result<(), Box<dyn Error>> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("node.yaml");

    fs::write(&path, "node_id: ''\ndata_dir: state\n")?;
    assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Invalid(_))));

    fs::write(
        &path,
        "node_id: node-a\ndata_dir: state\ncontrol:\n  write_timeout_ms: 0\n",
    )?;
    assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Invalid(_))));

    fs::write(&path, "node_id: [not, a, string\n")?;
    assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Parse { .. })));

    assert!(matches!(
        NodeConfig::load(&tmp.path().join("missing.yaml")),
        Err(ConfigError::Read { .. })
    ));
    Ok(())
}
