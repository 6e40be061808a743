//! Command line and `coind.conf` handling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use coind_chainstate::state::DEFAULT_COINS_CACHE_BYTES;
use coind_chainstate::ChainConfig;
use coind_consensus::money::{Amount, FeeRate};
use coind_consensus::params::{ChainParams, Network};
use coind_log::{self as logging, LogConfig};

use crate::accept::{
    MempoolPolicy, DEFAULT_ENABLE_REPLACEMENT, DEFAULT_LIMIT_FREE_RELAY, DEFAULT_MIN_RELAY_TX_FEE,
    DEFAULT_RELAY_PRIORITY,
};
use crate::mempool::{
    MempoolLimits, DEFAULT_ANCESTOR_LIMIT, DEFAULT_ANCESTOR_SIZE_LIMIT_KB, DEFAULT_DESCENDANT_LIMIT,
    DEFAULT_DESCENDANT_SIZE_LIMIT_KB, DEFAULT_MAX_MEMPOOL_SIZE_MB, DEFAULT_MEMPOOL_EXPIRY_HOURS,
};
use crate::orphans::DEFAULT_MAX_ORPHAN_TRANSACTIONS;
use crate::sync::{SyncConfig, DEFAULT_BANSCORE_THRESHOLD};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "coind.conf";
pub const DEFAULT_CHECKBLOCKS: i32 = 288;
pub const DEFAULT_CHECKLEVEL: i32 = 3;
const MAX_SCRIPT_THREADS: usize = 16;

/// Flags that take no value on the command line.
const SWITCHES: &[&str] = &[
    "reindex",
    "log-timestamps",
    "no-log-timestamps",
    "relaypriority",
    "mempoolreplacement",
    "acceptnonstdtxn",
    "checkpoints",
    "checkblockindex",
    "whitelistforcerelay",
    "stopafterblockimport",
];

/// Flags that take a value.
const VALUED: &[&str] = &[
    "data-dir",
    "conf",
    "network",
    "backend",
    "log-level",
    "log-format",
    "debug",
    "maxmempool",
    "mempoolexpiry",
    "limitancestorcount",
    "limitancestorsize",
    "limitdescendantcount",
    "limitdescendantsize",
    "minrelaytxfee",
    "limitfreerelay",
    "bytespersigop",
    "maxorphantx",
    "banscore",
    "par",
    "dbcache",
    "checkblocks",
    "checklevel",
    "checkmempool",
    "loadblock",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    /// Base directory holding the config file.
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub debug_categories: u32,

    pub reindex: bool,
    pub check_blocks: i32,
    pub check_level: i32,
    pub check_block_index: Option<bool>,
    /// Run the mempool consistency check on one in `n` updates.
    pub check_mempool: Option<u32>,
    pub db_cache_mb: usize,
    pub par: i32,
    pub checkpoints: bool,
    pub load_block: Vec<PathBuf>,
    pub stop_after_import: bool,

    pub max_mempool_mb: usize,
    pub mempool_expiry_hours: i64,
    pub limit_ancestor_count: u64,
    pub limit_ancestor_size_kb: u64,
    pub limit_descendant_count: u64,
    pub limit_descendant_size_kb: u64,
    pub min_relay_fee_per_kb: Amount,
    pub limit_free_relay: u64,
    pub relay_priority: bool,
    pub mempool_replacement: bool,
    pub accept_non_std_txn: Option<bool>,
    pub bytes_per_sigop: u64,

    pub max_orphan_tx: usize,
    pub ban_score: i32,
    pub whitelist_force_relay: bool,

    /// Config file keys that were not recognised; logged once logging is up.
    pub unsupported_conf_keys: Vec<String>,
}

pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

impl Config {
    /// Network-specific directory for the database and block files.
    pub fn network_dir(&self) -> PathBuf {
        match self.network {
            Network::Mainnet => self.data_dir.clone(),
            Network::Testnet => self.data_dir.join("testnet3"),
            Network::Regtest => self.data_dir.join("regtest"),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: self.log_timestamps,
            categories: self.debug_categories,
        }
    }

    pub fn mempool_policy(&self, params: &ChainParams) -> MempoolPolicy {
        MempoolPolicy {
            max_mempool_bytes: self.max_mempool_mb * 1_000_000,
            expiry_secs: self.mempool_expiry_hours * 60 * 60,
            limits: MempoolLimits {
                ancestor_count: self.limit_ancestor_count,
                ancestor_size: self.limit_ancestor_size_kb * 1000,
                descendant_count: self.limit_descendant_count,
                descendant_size: self.limit_descendant_size_kb * 1000,
            },
            min_relay_fee: FeeRate::new(self.min_relay_fee_per_kb),
            limit_free_relay: self.limit_free_relay,
            relay_priority: self.relay_priority,
            enable_replacement: self.mempool_replacement,
            require_standard: !self.accept_non_std_txn.unwrap_or(!params.require_standard),
            bytes_per_sigop: self.bytes_per_sigop,
            ..MempoolPolicy::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            ban_score: self.ban_score,
            max_orphan_tx: self.max_orphan_tx,
            whitelist_force_relay: self.whitelist_force_relay,
        }
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            checkpoints_enabled: self.checkpoints,
            check_block_index: self
                .check_block_index
                .unwrap_or(self.network == Network::Regtest),
            coins_cache_bytes: self.db_cache_mb << 20,
            reindex: self.reindex,
        }
    }

    pub fn mempool_check_ratio(&self) -> f64 {
        let every = self
            .check_mempool
            .unwrap_or(u32::from(self.network == Network::Regtest));
        if every == 0 {
            0.0
        } else {
            1.0 / f64::from(every)
        }
    }

    /// Script verification threads. Zero and negative values count back
    /// from the number of cores.
    pub fn script_threads(&self) -> usize {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get()) as i32;
        let threads = if self.par <= 0 { cores + self.par } else { self.par };
        (threads.max(1) as usize).min(MAX_SCRIPT_THREADS)
    }
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

/// Command line values by option name. Repeated options accumulate.
fn collect_cli<I>(raw_args: I) -> Result<Option<HashMap<String, Vec<String>>>, String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "help" | "--help" | "-h" => return Ok(None),
            _ => {}
        }
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument '{arg}'\n{}", usage()));
        };
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name.to_ascii_lowercase(), Some(value.to_string())),
            None => (flag.to_ascii_lowercase(), None),
        };
        let value = if SWITCHES.contains(&name.as_str()) {
            inline.unwrap_or_else(|| "1".to_string())
        } else if VALUED.contains(&name.as_str()) {
            match inline {
                Some(value) => value,
                None => args
                    .next()
                    .ok_or_else(|| format!("missing value for --{name}"))?,
            }
        } else {
            return Err(format!("unknown option --{name}\n{}", usage()));
        };
        out.entry(name).or_default().push(value);
    }
    Ok(Some(out))
}

/// Option lookup with the command line taking precedence over the config
/// file.
struct Settings {
    cli: HashMap<String, Vec<String>>,
    conf: HashMap<String, Vec<String>>,
}

impl Settings {
    fn values(&self, name: &str) -> Option<&[String]> {
        self.cli
            .get(name)
            .or_else(|| self.conf.get(name))
            .map(Vec::as_slice)
    }

    fn last(&self, name: &str) -> Option<&str> {
        self.values(name)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, String> {
        match self.last(name) {
            Some(value) => parse_conf_bool(value)
                .map(Some)
                .ok_or_else(|| format!("invalid boolean for {name}: '{value}'")),
            None => Ok(None),
        }
    }

    fn number<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, String> {
        match self.last(name) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|_| format!("invalid value for {name}: '{value}'")),
            None => Ok(default),
        }
    }
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut raw_args: Vec<String> = raw_args.into_iter().collect();
    match raw_args.first().map(String::as_str) {
        Some("version" | "--version" | "-V") => return Ok(CliAction::PrintVersion),
        Some("run") => {
            raw_args.remove(0);
        }
        _ => {}
    }
    let Some(cli) = collect_cli(raw_args)? else {
        return Ok(CliAction::PrintHelp);
    };

    let data_dir = cli
        .get("data-dir")
        .and_then(|values| values.last())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = cli
        .get("conf")
        .and_then(|values| values.last())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = load_conf(&conf_path)?.unwrap_or_default();
    let mut unsupported_conf_keys: Vec<String> = conf
        .keys()
        .filter(|key| {
            let key = key.as_str();
            !(SWITCHES.contains(&key) || VALUED.contains(&key)) || key == "data-dir" || key == "conf"
        })
        .cloned()
        .collect();
    unsupported_conf_keys.sort();

    let settings = Settings { cli, conf };

    let backend = match settings.last("backend") {
        Some(value) => Backend::parse(value).ok_or_else(|| format!("invalid backend '{value}'"))?,
        None => Backend::Fjall,
    };
    let network = match settings.last("network") {
        Some(value) => Network::parse(value).ok_or_else(|| format!("invalid network '{value}'"))?,
        None => Network::Mainnet,
    };
    let log_level = match settings.last("log-level") {
        Some(value) => {
            logging::Level::parse(value).ok_or_else(|| format!("invalid log level '{value}'"))?
        }
        None => logging::Level::Info,
    };
    let log_format = match settings.last("log-format") {
        Some(value) => {
            logging::Format::parse(value).ok_or_else(|| format!("invalid log format '{value}'"))?
        }
        None => logging::Format::Text,
    };
    let log_timestamps = match settings.bool("no-log-timestamps")? {
        Some(true) => false,
        _ => settings.bool("log-timestamps")?.unwrap_or(true),
    };
    let debug_categories = match settings.values("debug") {
        Some(values) => logging::parse_categories(values.iter().map(String::as_str))?,
        None => 0,
    };

    let check_mempool = match settings.last("checkmempool") {
        Some(value) => Some(
            value
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid value for checkmempool: '{value}'"))?,
        ),
        None => None,
    };
    let check_level = settings.number("checklevel", DEFAULT_CHECKLEVEL)?;
    if !(0..=4).contains(&check_level) {
        return Err(format!("checklevel must be between 0 and 4, got {check_level}"));
    }
    let ban_score = settings.number("banscore", DEFAULT_BANSCORE_THRESHOLD)?;
    if ban_score <= 0 {
        return Err("banscore must be positive".to_string());
    }
    let min_relay_fee_per_kb = settings.number("minrelaytxfee", DEFAULT_MIN_RELAY_TX_FEE)?;
    if min_relay_fee_per_kb < 0 {
        return Err("minrelaytxfee must not be negative".to_string());
    }

    let config = Config {
        backend,
        data_dir,
        conf_path,
        network,
        log_level,
        log_format,
        log_timestamps,
        debug_categories,
        reindex: settings.bool("reindex")?.unwrap_or(false),
        check_blocks: settings.number("checkblocks", DEFAULT_CHECKBLOCKS)?,
        check_level,
        check_block_index: settings.bool("checkblockindex")?,
        check_mempool,
        db_cache_mb: settings.number("dbcache", DEFAULT_COINS_CACHE_BYTES >> 20)?.max(4),
        par: settings.number("par", 0)?,
        checkpoints: settings.bool("checkpoints")?.unwrap_or(true),
        load_block: settings
            .values("loadblock")
            .map(|values| values.iter().map(PathBuf::from).collect())
            .unwrap_or_default(),
        stop_after_import: settings.bool("stopafterblockimport")?.unwrap_or(false),
        max_mempool_mb: settings.number("maxmempool", DEFAULT_MAX_MEMPOOL_SIZE_MB)?,
        mempool_expiry_hours: settings.number("mempoolexpiry", DEFAULT_MEMPOOL_EXPIRY_HOURS)?,
        limit_ancestor_count: settings.number("limitancestorcount", DEFAULT_ANCESTOR_LIMIT)?,
        limit_ancestor_size_kb: settings.number("limitancestorsize", DEFAULT_ANCESTOR_SIZE_LIMIT_KB)?,
        limit_descendant_count: settings.number("limitdescendantcount", DEFAULT_DESCENDANT_LIMIT)?,
        limit_descendant_size_kb: settings
            .number("limitdescendantsize", DEFAULT_DESCENDANT_SIZE_LIMIT_KB)?,
        min_relay_fee_per_kb,
        limit_free_relay: settings.number("limitfreerelay", DEFAULT_LIMIT_FREE_RELAY)?,
        relay_priority: settings.bool("relaypriority")?.unwrap_or(DEFAULT_RELAY_PRIORITY),
        mempool_replacement: settings
            .bool("mempoolreplacement")?
            .unwrap_or(DEFAULT_ENABLE_REPLACEMENT),
        accept_non_std_txn: settings.bool("acceptnonstdtxn")?,
        bytes_per_sigop: settings.number("bytespersigop", crate::accept::DEFAULT_BYTES_PER_SIGOP)?,
        max_orphan_tx: settings.number("maxorphantx", DEFAULT_MAX_ORPHAN_TRANSACTIONS)?,
        ban_score,
        whitelist_force_relay: settings.bool("whitelistforcerelay")?.unwrap_or(true),
        unsupported_conf_keys,
    };
    Ok(CliAction::Run(Box::new(config)))
}

/// Reads `key=value` lines. Missing files are not an error.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  coind [options]",
        "  coind <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --data-dir <dir>  Base data directory (default: ./data)",
        "  --conf <file>  Config file path (default: <data-dir>/coind.conf)",
        "  --network <main|test|regtest>  Chain to run (default: main)",
        "  --backend <memory|fjall>  Storage backend (default: fjall)",
        "  --log-level <level>  error|warn|info|debug|trace (default: info)",
        "  --log-format <text|json>  Log output format (default: text)",
        "  --log-timestamps, --no-log-timestamps  Timestamps in text logs (default: on)",
        "  --debug <category>  Enable debug category logs (mempool, mempoolrej, net, bench, reindex, validation, prune, all)",
        "  --reindex  Rebuild the block index and coins from blocks/blk*.dat",
        "  --loadblock <file>  Import blocks from an external file on startup (repeatable)",
        "  --stopafterblockimport  Stop after importing blocks",
        "  --checkblocks <n>  Blocks to verify at startup (default: 288, 0 = all)",
        "  --checklevel <0-4>  How thorough the startup verification is (default: 3)",
        "  --checkblockindex  Check the block index after every change (default: on for regtest)",
        "  --checkmempool <n>  Check mempool consistency every n updates (default: 1 on regtest, else 0)",
        "  --checkpoints  Reject forks below the last checkpoint (default: on)",
        "  --dbcache <MB>  Coin cache size (default: 100)",
        "  --par <n>  Script verification threads, <= 0 leaves that many cores free (default: 0)",
        "  --maxmempool <MB>  Mempool size cap (default: 300)",
        "  --mempoolexpiry <hours>  Evict mempool entries older than this (default: 72)",
        "  --limitancestorcount <n>  In-mempool ancestors allowed (default: 25)",
        "  --limitancestorsize <kB>  Size of in-mempool ancestors allowed (default: 101)",
        "  --limitdescendantcount <n>  In-mempool descendants allowed (default: 25)",
        "  --limitdescendantsize <kB>  Size of in-mempool descendants allowed (default: 101)",
        "  --minrelaytxfee <sat/kB>  Minimum relay fee rate (default: 1000)",
        "  --limitfreerelay <kB/min>  Free transaction rate limit (default: 15)",
        "  --relaypriority  Require high priority for free transactions (default: on)",
        "  --mempoolreplacement  Allow opt-in replacement (default: on)",
        "  --acceptnonstdtxn  Relay non-standard transactions (default: off on main)",
        "  --bytespersigop <n>  Virtual bytes charged per sigop (default: 20)",
        "  --maxorphantx <n>  Orphan transactions kept (default: 100)",
        "  --banscore <n>  Misbehavior threshold for disconnecting peers (default: 100)",
        "  --whitelistforcerelay  Relay rejected transactions from whitelisted peers (default: on)",
    ]
    .join("\n")
}
