//! Consensus constants, chain parameters, and soft-fork deployments.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub type Hash256 = [u8; 32];

pub use deployments::{Deployment, DeploymentPos, MAX_VERSION_BITS_DEPLOYMENTS};
pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint,
    CheckpointData, ConsensusParams, GenesisParams, Network,
};
pub use rewards::block_subsidy;
