//! Consensus parameter definitions.

use crate::constants::DEFAULT_MAX_TIP_AGE;
use crate::deployments::{Deployment, DeploymentPos, MAX_VERSION_BITS_DEPLOYMENTS};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub subsidy_halving_interval: i32,
    /// Blocks of the window that must carry a new version before it is enforced.
    pub majority_enforce_block_upgrade: i32,
    /// Blocks of the window that must carry a new version before older ones are rejected.
    pub majority_reject_block_outdated: i32,
    pub majority_window: i32,
    /// Height and hash of the block that activated BIP34, if known.
    pub bip34: Option<(i32, Hash256)>,
    pub rule_change_activation_threshold: u32,
    pub miner_confirmation_window: u32,
    pub deployments: [Deployment; MAX_VERSION_BITS_DEPLOYMENTS],
    pub pow_limit: Hash256,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    /// Blocks whose duplicate coinbase overwrote an earlier unspent one.
    pub bip30_exceptions: &'static [(i32, &'static str)],
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn deployment(&self, pos: DeploymentPos) -> &Deployment {
        &self.deployments[pos.as_usize()]
    }

    pub fn is_bip30_exception(&self, height: i32, hash: &Hash256) -> bool {
        self.bip30_exceptions.iter().any(|(exception_height, exception_hash)| {
            *exception_height == height
                && hash256_from_hex(exception_hash)
                    .map(|expected| &expected == hash)
                    .unwrap_or(false)
        })
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hash into internal little-endian bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in hex.len()..64 {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = bytes_from_hex(&padded)?;
    bytes.reverse();
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn bytes_from_hex(hex: &str) -> Result<Vec<u8>, HexError> {
    if hex.len() % 2 != 0 {
        return Err(HexError::InvalidLength);
    }
    (0..hex.len())
        .step_by(2)
        .map(|start| {
            hex.get(start..start + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or(HexError::InvalidHex)
        })
        .collect()
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Transaction-count statistics at the last checkpoint, used to estimate
/// verification progress.
#[derive(Clone, Copy, Debug)]
pub struct CheckpointData {
    pub time_last_checkpoint: i64,
    pub transactions_last_checkpoint: u64,
    pub transactions_per_day: f64,
}

/// Fields of the hard-coded first block. The block itself is assembled by the
/// primitives crate from these values.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub coinbase_script_sig: Vec<u8>,
    pub coinbase_script_pubkey: Vec<u8>,
    pub reward: Amount,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub genesis: GenesisParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub checkpoints: Vec<Checkpoint>,
    pub checkpoint_data: CheckpointData,
    pub max_tip_age: i64,
    pub require_standard: bool,
    pub mine_blocks_on_demand: bool,
}

impl ChainParams {
    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

const GENESIS_TIMESTAMP: &str = "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_OUTPUT_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

fn genesis_params(time: u32, nonce: u32, bits: u32) -> GenesisParams {
    // <486604799> <4> <timestamp>
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    script_sig.push(GENESIS_TIMESTAMP.len() as u8);
    script_sig.extend_from_slice(GENESIS_TIMESTAMP.as_bytes());

    let mut script_pubkey = vec![0x41];
    script_pubkey.extend(bytes_from_hex(GENESIS_OUTPUT_PUBKEY).unwrap_or_default());
    script_pubkey.push(0xac);

    GenesisParams {
        version: 1,
        time,
        bits,
        nonce,
        coinbase_script_sig: script_sig,
        coinbase_script_pubkey: script_pubkey,
        reward: 50 * COIN,
    }
}

fn hash_or_zero(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0u8; 32])
}

fn checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: hash_or_zero(hash),
        })
        .collect()
}

const MAINNET_BIP30_EXCEPTIONS: &[(i32, &str)] = &[
    (
        91_842,
        "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
    ),
    (
        91_880,
        "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
    ),
];

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash_or_zero(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        subsidy_halving_interval: 210_000,
        majority_enforce_block_upgrade: 750,
        majority_reject_block_outdated: 950,
        majority_window: 1_000,
        bip34: Some((
            227_931,
            hash_or_zero("000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8"),
        )),
        rule_change_activation_threshold: 1_916,
        miner_confirmation_window: 2_016,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Deployment {
                bit: 0,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
        ],
        pow_limit: hash_or_zero("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        bip30_exceptions: MAINNET_BIP30_EXCEPTIONS,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash_or_zero(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        majority_enforce_block_upgrade: 51,
        majority_reject_block_outdated: 75,
        majority_window: 100,
        bip34: Some((
            21_111,
            hash_or_zero("0000000023b3a96d3484e5abb3755c413e7d41500f8e2a5c3f0dd01299cd8ef8"),
        )),
        rule_change_activation_threshold: 1_512,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Deployment {
                bit: 0,
                start_time: 1_456_790_400,
                timeout: 1_493_596_800,
            },
        ],
        pow_allow_min_difficulty_blocks: true,
        bip30_exceptions: &[],
        ..mainnet_consensus_params()
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash_or_zero(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        subsidy_halving_interval: 150,
        bip34: None,
        rule_change_activation_threshold: 108,
        miner_confirmation_window: 144,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 0,
                timeout: 999_999_999_999,
            },
            Deployment {
                bit: 0,
                start_time: 0,
                timeout: 999_999_999_999,
            },
        ],
        pow_limit: hash_or_zero("7fffff0000000000000000000000000000000000000000000000000000000000"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        bip30_exceptions: &[],
        ..mainnet_consensus_params()
    }
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        consensus: mainnet_consensus_params(),
        genesis: genesis_params(1_231_006_505, 2_083_236_893, 0x1d00_ffff),
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8333,
        checkpoints: checkpoints(&[
            (11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            (33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            (74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
            (105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
            (134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
            (168_000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
            (193_000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
            (210_000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            (216_116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
            (225_430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
            (250_000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
            (279_000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
            (295_000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
        ]),
        checkpoint_data: CheckpointData {
            time_last_checkpoint: 1_397_080_064,
            transactions_last_checkpoint: 36_544_669,
            transactions_per_day: 60_000.0,
        },
        max_tip_age: DEFAULT_MAX_TIP_AGE,
        require_standard: true,
        mine_blocks_on_demand: false,
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        consensus: testnet_consensus_params(),
        genesis: genesis_params(1_296_688_602, 414_098_458, 0x1d00_ffff),
        message_start: [0x0b, 0x11, 0x09, 0x07],
        default_port: 18333,
        checkpoints: checkpoints(&[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )]),
        checkpoint_data: CheckpointData {
            time_last_checkpoint: 1_337_966_069,
            transactions_last_checkpoint: 1_488,
            transactions_per_day: 300.0,
        },
        max_tip_age: DEFAULT_MAX_TIP_AGE,
        require_standard: false,
        mine_blocks_on_demand: false,
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        consensus: regtest_consensus_params(),
        genesis: genesis_params(1_296_688_602, 2, 0x207f_ffff),
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18444,
        checkpoints: checkpoints(&[(
            0,
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )]),
        checkpoint_data: CheckpointData {
            time_last_checkpoint: 0,
            transactions_last_checkpoint: 0,
            transactions_per_day: 0.0,
        },
        max_tip_age: DEFAULT_MAX_TIP_AGE,
        require_standard: false,
        mine_blocks_on_demand: true,
    }
}
