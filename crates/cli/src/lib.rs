use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing_subscriber::EnvFilter;
use transfer_cache::image::pixel_byte_len;
use transfer_cache::{
    CacheKey, ClientDiscardableHandle, ColorSpace, ColorSpaceEntry, ColorType, ImageEntry,
    MemoryCoordinator, MemoryPressureLevel, MemoryState, RawMemoryEntry, ServiceTransferCache,
    TransferCacheConfig, TransferCacheEntryType, TransferCacheStats,
};

const LOG_ENV: &str = "TRANSFER_CACHE_LOG";

#[derive(Debug, Parser)]
#[command(name = "transfer-cache-cli")]
#[command(about = "Replay and inspect GPU transfer cache behavior")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a JSON script of cache operations and print a JSON report.
    Replay {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },
    /// Print the byte budget for each memory state.
    Limits {
        /// TOML configuration file; environment variables are used otherwise.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Treat the device as low-end.
        #[arg(long)]
        low_end: bool,
    },
    /// Print CLI version.
    Version,
}

/// Install a stderr `tracing` subscriber filtered by `TRANSFER_CACHE_LOG`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Replay { script } => run_replay(&script),
        Commands::Limits { config, low_end } => run_limits(config.as_deref(), low_end),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Script {
    #[serde(default)]
    config: ScriptConfig,
    steps: Vec<Step>,
}

/// Byte budgets for a replay; unset values fall back to the environment
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptConfig {
    normal_limit: Option<usize>,
    low_end_limit: Option<usize>,
    low_end_device: Option<bool>,
    max_texture_size: Option<u32>,
}

impl ScriptConfig {
    fn resolve(&self) -> Result<TransferCacheConfig> {
        let mut config =
            TransferCacheConfig::from_env().context("failed to read configuration from env")?;
        if let Some(limit) = self.normal_limit {
            config.normal_limit = limit;
        }
        if let Some(limit) = self.low_end_limit {
            config.low_end_limit = limit;
        }
        if let Some(low_end) = self.low_end_device {
            config.low_end_device = low_end;
        }
        if let Some(size) = self.max_texture_size {
            config.max_texture_size = size;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    CreateLocked {
        entry_type: TransferCacheEntryType,
        id: u32,
        payload: Payload,
    },
    CreateLocal {
        #[serde(default)]
        entry_type: Option<TransferCacheEntryType>,
        id: u32,
        payload: Payload,
    },
    Get {
        entry_type: TransferCacheEntryType,
        id: u32,
    },
    Unlock {
        entry_type: TransferCacheEntryType,
        id: u32,
    },
    Delete {
        entry_type: TransferCacheEntryType,
        id: u32,
    },
    ClientLock {
        entry_type: TransferCacheEntryType,
        id: u32,
    },
    ClientUnlock {
        entry_type: TransferCacheEntryType,
        id: u32,
    },
    MemoryState {
        state: MemoryState,
    },
    Purge,
    Pressure {
        level: MemoryPressureLevel,
    },
    Utilization {
        ratio: f64,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::CreateLocked { .. } => "create_locked",
            Step::CreateLocal { .. } => "create_local",
            Step::Get { .. } => "get",
            Step::Unlock { .. } => "unlock",
            Step::Delete { .. } => "delete",
            Step::ClientLock { .. } => "client_lock",
            Step::ClientUnlock { .. } => "client_unlock",
            Step::MemoryState { .. } => "memory_state",
            Step::Purge => "purge",
            Step::Pressure { .. } => "pressure",
            Step::Utilization { .. } => "utilization",
        }
    }
}

/// Client data for a created entry
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Payload {
    Raw {
        size: usize,
        #[serde(default)]
        fill: u8,
    },
    Image {
        width: u32,
        height: u32,
        color_type: ColorType,
    },
    ColorSpace {
        primaries: u8,
        transfer: u8,
        matrix: u8,
        range: u8,
    },
    /// Arbitrary bytes, for feeding malformed data
    Bytes {
        data: Vec<u8>,
    },
}

impl Payload {
    /// The entry type this payload naturally encodes, if any
    fn entry_type(&self) -> Option<TransferCacheEntryType> {
        match self {
            Payload::Raw { .. } => Some(TransferCacheEntryType::RawMemory),
            Payload::Image { .. } => Some(TransferCacheEntryType::Image),
            Payload::ColorSpace { .. } => Some(TransferCacheEntryType::ColorSpace),
            Payload::Bytes { .. } => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Payload::Raw { size, fill } => RawMemoryEntry::serialize(&vec![*fill; *size]),
            Payload::Image { width, height, color_type } => {
                let len = pixel_byte_len(*width, *height, *color_type)
                    .with_context(|| format!("image {width}x{height} is too large"))?;
                ImageEntry::serialize(*width, *height, *color_type, &vec![0; len])
            }
            Payload::ColorSpace { primaries, transfer, matrix, range } => {
                ColorSpaceEntry::serialize(&ColorSpace::new(*primaries, *transfer, *matrix, *range))
            }
            Payload::Bytes { data } => data.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct StepReport {
    index: usize,
    op: &'static str,
    /// Outcome for operations that report one
    result: Option<bool>,
    total_size: usize,
    entry_count: usize,
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    steps: Vec<StepReport>,
    memory_state: MemoryState,
    lru_order: Vec<CacheKey>,
    stats: TransferCacheStats,
}

/// A cache wired to a coordinator, plus the client side of every handle
struct Replay {
    coordinator: Rc<MemoryCoordinator>,
    cache: Rc<RefCell<ServiceTransferCache>>,
    clients: HashMap<CacheKey, ClientDiscardableHandle>,
}

impl Replay {
    fn new(config: TransferCacheConfig) -> Self {
        let coordinator = MemoryCoordinator::new();
        let cache = ServiceTransferCache::with_coordinator(config, &coordinator);
        Self {
            coordinator,
            cache,
            clients: HashMap::new(),
        }
    }

    fn apply(&mut self, index: usize, step: &Step) -> Result<Option<bool>> {
        let result = match step {
            Step::CreateLocked { entry_type, id, payload } => {
                let data = payload.encode()?;
                let client = ClientDiscardableHandle::new();
                let mut cache = self.cache.borrow_mut();
                let context = cache.decode_context();
                let created = cache.create_locked_entry(
                    *entry_type,
                    *id,
                    Box::new(client.service_handle()),
                    &context,
                    &data,
                );
                if created {
                    self.clients.insert(CacheKey::new(*entry_type, *id), client);
                }
                Some(created)
            }
            Step::CreateLocal { entry_type, id, payload } => {
                let entry_type = entry_type.or(payload.entry_type()).with_context(|| {
                    format!("step {index}: create_local with a bytes payload needs an entry_type")
                })?;
                let data = payload.encode()?;
                let mut cache = self.cache.borrow_mut();
                let context = cache.decode_context();
                match transfer_cache::deserialize_entry(entry_type, &context, &data) {
                    Ok(entry) => {
                        self.clients.remove(&CacheKey::new(entry_type, *id));
                        cache.create_local_entry(*id, Some(entry));
                        Some(true)
                    }
                    Err(error) => {
                        tracing::warn!(index, %error, "local entry failed to deserialize");
                        Some(false)
                    }
                }
            }
            Step::Get { entry_type, id } => {
                Some(self.cache.borrow_mut().get_entry(*entry_type, *id).is_some())
            }
            Step::Unlock { entry_type, id } => {
                Some(self.cache.borrow_mut().unlock_entry(*entry_type, *id))
            }
            Step::Delete { entry_type, id } => {
                Some(self.cache.borrow_mut().delete_entry(*entry_type, *id))
            }
            Step::ClientLock { entry_type, id } => {
                Some(self.client(*entry_type, *id).is_some_and(|client| client.lock()))
            }
            Step::ClientUnlock { entry_type, id } => match self.client(*entry_type, *id) {
                Some(client) => {
                    client.unlock();
                    Some(true)
                }
                None => Some(false),
            },
            Step::MemoryState { state } => {
                if *state == MemoryState::Unknown {
                    anyhow::bail!("step {index}: the unknown memory state cannot be replayed");
                }
                self.coordinator.set_memory_state(*state);
                None
            }
            Step::Purge => {
                self.coordinator.purge_memory();
                None
            }
            Step::Pressure { level } => {
                self.coordinator.notify_pressure(*level);
                None
            }
            Step::Utilization { ratio } => {
                if !(0.0..=1.0).contains(ratio) {
                    anyhow::bail!("step {index}: utilization ratio {ratio} is outside 0.0..=1.0");
                }
                self.coordinator.report_utilization(*ratio);
                None
            }
        };
        self.prune_clients();
        Ok(result)
    }

    /// Drops client handles whose entries were evicted, deleted or replaced.
    fn prune_clients(&mut self) {
        let cache = self.cache.borrow();
        self.clients
            .retain(|key, _| cache.contains(key.entry_type, key.entry_id));
    }

    fn client(
        &self,
        entry_type: TransferCacheEntryType,
        id: u32,
    ) -> Option<&ClientDiscardableHandle> {
        self.clients.get(&CacheKey::new(entry_type, id))
    }

    fn report(self, steps: Vec<StepReport>) -> ReplayReport {
        let cache = self.cache.borrow();
        ReplayReport {
            steps,
            memory_state: cache.memory_state(),
            lru_order: cache.keys_lru_first(),
            stats: cache.stats(),
        }
    }
}

fn load_script(path: &Path) -> Result<Script> {
    if !path.is_file() {
        anyhow::bail!("script does not exist: {}", path.display());
    }
    let bytes =
        fs::read(path).with_context(|| format!("failed to read script {}", path.display()))?;
    serde_json::from_slice(&bytes).context("failed to parse replay script")
}

fn run_replay(path: &Path) -> Result<()> {
    let script = load_script(path)?;
    let mut replay = Replay::new(script.config.resolve()?);

    let mut steps = Vec::with_capacity(script.steps.len());
    for (index, step) in script.steps.iter().enumerate() {
        let result = replay.apply(index, step)?;
        let cache = replay.cache.borrow();
        steps.push(StepReport {
            index,
            op: step.name(),
            result,
            total_size: cache.total_size(),
            entry_count: cache.entry_count(),
        });
    }

    let report = replay.report(steps);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct LimitsOutput {
    low_end_device: bool,
    normal: usize,
    throttled: usize,
    suspended: usize,
}

fn run_limits(config_path: Option<&Path>, low_end: bool) -> Result<()> {
    let mut config = match config_path {
        Some(path) => TransferCacheConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TransferCacheConfig::from_env().context("failed to read configuration from env")?,
    };
    if low_end {
        config.low_end_device = true;
    }

    let output = LimitsOutput {
        low_end_device: config.low_end_device,
        normal: config.limit_for_state(MemoryState::Normal),
        throttled: config.limit_for_state(MemoryState::Throttled),
        suspended: config.limit_for_state(MemoryState::Suspended),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
