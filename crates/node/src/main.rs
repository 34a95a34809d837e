//! cinderd: loads the chain state, replays any bootstrap or import files,
//! and reports the resulting tip. Socket transport and wallet services
//! attach through the dispatcher and notifier interfaces.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cinder_chainstate::blockfiles::{BlockFileStore, FramedBlockReader};
use cinder_chainstate::state::ChainState;
use cinder_chainstate::validation::ValidationFlags;
use cinder_consensus::{chain_params, hash256_to_hex, Network};
use cinder_log::{log_error, log_info, log_warn};
use cinder_node::mempool::Mempool;
use cinder_node::sync::MempoolSync;
use cinder_primitives::block::Block;
use cinder_script::StructuralVerifier;
use cinder_storage::KeyValueStore;

struct Config {
    network: Network,
    datadir: PathBuf,
    log_level: cinder_log::Level,
    log_format: cinder_log::Format,
    import: Option<PathBuf>,
}

fn default_datadir() -> PathBuf {
    std::env::var_os("CINDER_DATADIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn parse_config() -> Result<Config, String> {
    let mut config = Config {
        network: Network::Mainnet,
        datadir: default_datadir(),
        log_level: cinder_log::Level::Info,
        log_format: cinder_log::Format::Text,
        import: None,
    };

    for argument in std::env::args().skip(1) {
        let Some((key, value)) = argument.split_once('=') else {
            return Err(format!("unrecognized argument: {argument}"));
        };
        match key {
            "--network" => {
                config.network = Network::parse(value)
                    .ok_or_else(|| format!("unknown network: {value}"))?;
            }
            "--datadir" => config.datadir = PathBuf::from(value),
            "--log-level" => {
                config.log_level = value
                    .parse()
                    .map_err(|_| format!("unknown log level: {value}"))?;
            }
            "--log-format" => {
                config.log_format = value
                    .parse()
                    .map_err(|_| format!("unknown log format: {value}"))?;
            }
            "--import" => config.import = Some(PathBuf::from(value)),
            _ => return Err(format!("unrecognized argument: {key}")),
        }
    }
    Ok(config)
}

fn import_framed_file(
    chain: &ChainState,
    path: &Path,
    magic: [u8; 4],
    flags: &ValidationFlags,
) -> Result<(usize, usize), String> {
    let mut reader =
        FramedBlockReader::open(path, magic).map_err(|err| format!("open {path:?}: {err}"))?;
    let mut accepted = 0usize;
    let mut skipped = 0usize;
    loop {
        let body = match reader.next_block() {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(err) => return Err(format!("read {path:?}: {err}")),
        };
        let Ok(block) = Block::from_wire_bytes(&body) else {
            skipped += 1;
            continue;
        };
        match chain.process_block(&block, flags) {
            Ok(_) => accepted += 1,
            Err(_) => skipped += 1,
        }
        if chain.is_shutdown() {
            break;
        }
    }
    Ok((accepted, skipped))
}

fn run() -> Result<(), String> {
    let config = parse_config()?;
    cinder_log::init(cinder_log::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: true,
        capture: 256,
    });

    let params = chain_params(config.network);
    log_info!(
        "starting cinderd on {} (datadir {:?})",
        config.network.as_str(),
        config.datadir
    );

    let store: Arc<dyn KeyValueStore> = open_store(&config.datadir)?;
    let files = BlockFileStore::open(config.datadir.join("blocks"), params.magic)
        .map_err(|err| format!("open block files: {err}"))?;
    let chain = Arc::new(
        ChainState::new(store, files, params.clone(), Arc::new(StructuralVerifier))
            .map_err(|err| format!("load chain state: {err}"))?,
    );
    let mempool = Arc::new(Mempool::default());
    chain.register_notifier(Arc::new(MempoolSync::new(
        Arc::downgrade(&chain),
        Arc::clone(&mempool),
    )));

    let genesis = chain
        .init_genesis()
        .map_err(|err| format!("initialize genesis: {err}"))?;
    log_info!("genesis {}", hash256_to_hex(&genesis));

    let flags = ValidationFlags::default();

    // A bootstrap.dat in the data directory is consumed once and renamed.
    let bootstrap = config.datadir.join("bootstrap.dat");
    if bootstrap.exists() {
        log_info!("importing {bootstrap:?}");
        let (accepted, skipped) = import_framed_file(&chain, &bootstrap, params.magic, &flags)?;
        log_info!("bootstrap import: {accepted} accepted, {skipped} skipped");
        let consumed = config.datadir.join("bootstrap.dat.old");
        if let Err(err) = std::fs::rename(&bootstrap, &consumed) {
            log_warn!("could not rename consumed bootstrap file: {err}");
        }
    }

    if let Some(path) = &config.import {
        log_info!("importing {path:?}");
        let (accepted, skipped) = import_framed_file(&chain, path, params.magic, &flags)?;
        log_info!("import: {accepted} accepted, {skipped} skipped");
    }

    match chain.best_hash() {
        Some(tip) => log_info!(
            "best chain {} at height {}",
            hash256_to_hex(&tip),
            chain.best_height()
        ),
        None => log_warn!("no best chain"),
    }
    log_info!("mempool holds {} transactions", mempool.len());
    Ok(())
}

#[cfg(feature = "fjall")]
fn open_store(datadir: &Path) -> Result<Arc<dyn KeyValueStore>, String> {
    use cinder_storage::fjall::FjallStore;
    let store = FjallStore::open(datadir.join("db"))
        .map_err(|err| format!("open store: {err}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "fjall"))]
fn open_store(_datadir: &Path) -> Result<Arc<dyn KeyValueStore>, String> {
    log_warn!("built without a persistent store; using the in-memory backend");
    Ok(Arc::new(cinder_storage::memory::MemoryStore::new()))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            log_error!("{message}");
            ExitCode::FAILURE
        }
    }
}
