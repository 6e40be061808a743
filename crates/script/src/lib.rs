//! Script verification, signature hashing and relay standardness.

use std::sync::Arc;

use coind_primitives::transaction::Transaction;

pub mod interpreter;
pub mod script;
mod secp;
pub mod sigcache;
pub mod sighash;
pub mod standard;

pub use interpreter::{
    verify_script, ScriptError, ScriptFlags, SignatureChecker, TransactionSignatureChecker,
    MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_NOT_MANDATORY_VERIFY_FLAGS,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
pub use sigcache::SignatureCache;

/// Verifies one input of a transaction against the output it spends.
///
/// Validation talks to scripts only through this trait. `cache_store` is set
/// for mempool admission so block connection can reuse the results.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
        flags: ScriptFlags,
        cache_store: bool,
    ) -> Result<(), ScriptError>;
}

/// The built-in interpreter, optionally backed by a shared signature cache.
#[derive(Clone, Default)]
pub struct Interpreter {
    sig_cache: Option<Arc<SignatureCache>>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sig_cache(sig_cache: Arc<SignatureCache>) -> Self {
        Self {
            sig_cache: Some(sig_cache),
        }
    }

    pub fn sig_cache(&self) -> Option<&Arc<SignatureCache>> {
        self.sig_cache.as_ref()
    }
}

impl ScriptVerifier for Interpreter {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
        flags: ScriptFlags,
        cache_store: bool,
    ) -> Result<(), ScriptError> {
        let input = tx.vin.get(input_index).ok_or(ScriptError::Unknown)?;
        let mut checker = TransactionSignatureChecker::new(tx, input_index);
        if let Some(cache) = self.sig_cache.as_deref() {
            checker = checker.with_cache(cache, cache_store);
        }
        verify_script(&input.script_sig, script_pubkey, flags, &checker)
    }
}
