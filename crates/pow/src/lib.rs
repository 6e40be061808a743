//! Compact targets, chain work, difficulty retargeting and proof-of-work checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, block_proof_equivalent_time, get_next_work_required, HeaderInfo};
pub use validation::{check_proof_of_work, PowError};
