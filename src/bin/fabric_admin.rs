use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use shardfabric::fsm::{LookupQuery, LookupResult};
use shardfabric::{KeyPath, KvStateMachine, NodeConfig, OnDiskStateMachine, ShardStateStore};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

const DEFAULT_LOG_FILTER: &str = "warn,shardfabric=info";

/// Offline inspection of a node's persisted shard and state machine data.
#[derive(Parser, Debug)]
#[command(name = "fabric_admin")]
struct Cli {
    /// Path to the node configuration YAML
    #[arg(long)]
    config: PathBuf,

    /// env_logger-style filter string (e.g. "info,shardfabric=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every persisted shard state
    Shards,
    /// Print the last applied index of a replica's state machine
    AppliedIndex {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
    },
    /// Print the value stored under a key (slash form or resource name)
    Get {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
        #[arg(long)]
        key: String,
    },
    /// Write a point-in-time snapshot of a replica's store to a file
    ExportSnapshot {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
        #[arg(long)]
        out: PathBuf,
    },
}

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    let config = NodeConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Shards => list_shards(&config),
        Command::AppliedIndex { shard, replica } => {
            let machine = open_machine(&config, shard, replica)?;
            let applied = match machine.lookup(&LookupQuery::AppliedIndex)? {
                LookupResult::AppliedIndex(index) => index,
                other => bail!("unexpected lookup result {other:?}"),
            };
            println!("{applied}");
            machine.close()?;
            Ok(())
        }
        Command::Get {
            shard,
            replica,
            key,
        } => {
            let path = KeyPath::parse(&key).with_context(|| format!("invalid key {key:?}"))?;
            let machine = open_machine(&config, shard, replica)?;
            let value = machine.lookup(&LookupQuery::Get {
                key: path.to_string(),
            })?;
            machine.close()?;
            match value {
                LookupResult::Value(Some(bytes)) => {
                    std::io::stdout().write_all(&bytes)?;
                    println!();
                    Ok(())
                }
                LookupResult::Value(None) => bail!("key {path} not found"),
                other => bail!("unexpected lookup result {other:?}"),
            }
        }
        Command::ExportSnapshot {
            shard,
            replica,
            out,
        } => export_snapshot(&config, shard, replica, &out),
    }
}

fn list_shards(config: &NodeConfig) -> Result<()> {
    let store = ShardStateStore::new(config.shard_state_dir());
    for state in store.list()? {
        let members: Vec<String> = state
            .members
            .replicas
            .iter()
            .map(|(id, target)| format!("{id}={target}"))
            .collect();
        println!(
            "shard={} replica={} kind={:?} join={} members=[{}]",
            state.shard_id,
            state.replica_id,
            state.kind,
            state.join,
            members.join(",")
        );
    }
    Ok(())
}

fn open_machine(config: &NodeConfig, shard: u64, replica: u64) -> Result<KvStateMachine> {
    let machine = KvStateMachine::for_replica(config, shard, replica);
    if !machine.path().exists() {
        bail!(
            "no state machine for shard {shard} replica {replica} at {}",
            machine.path().display()
        );
    }
    machine
        .open(&AtomicBool::new(false))
        .with_context(|| format!("failed to open {}", machine.path().display()))?;
    Ok(machine)
}

fn export_snapshot(config: &NodeConfig, shard: u64, replica: u64, out: &Path) -> Result<()> {
    let machine = open_machine(config, shard, replica)?;
    let ctx = machine.prepare_snapshot()?;
    let applied = ctx.applied_index();
    let file = File::create(out).with_context(|| format!("failed to create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    let records = machine.save_snapshot(ctx, &mut writer, &AtomicBool::new(false))?;
    writer.flush()?;
    machine.close()?;
    info!(
        "event=snapshot_exported shard_id={shard} replica_id={replica} applied_index={applied} records={records} out={}",
        out.display()
    );
    Ok(())
}
