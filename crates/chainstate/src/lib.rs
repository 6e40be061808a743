//! Block index, active chain selection, UTXO cache and block validation.

pub mod blockindex;
pub mod blockstore;
pub mod chain;
pub mod clock;
pub mod coins;
pub mod events;
pub mod filemeta;
pub mod flatfiles;
pub mod index;
pub mod state;
pub mod undo;
pub mod validation;
pub mod versionbits;

pub use blockindex::{BlockIndex, BlockIndexNode, NodeId};
pub use chain::ActiveChain;
pub use clock::Clock;
pub use coins::{Coins, CoinsView, CoinsViewCache, CoinsViewDb, MEMPOOL_HEIGHT};
pub use events::ChainEvent;
pub use state::{
    ChainConfig, ChainState, ChainStateError, ChainView, ConnectTrace, FlushMode, PeerId,
    TipUpdate,
};
pub use validation::{ValidationState, REJECT_INVALID};
