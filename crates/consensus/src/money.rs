//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in satoshi) is valid.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Fee rate in satoshis per 1000 bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct FeeRate {
    per_k: Amount,
}

impl FeeRate {
    pub const fn new(per_k: Amount) -> Self {
        Self { per_k }
    }

    pub fn from_fee(fee: Amount, size: usize) -> Self {
        if size == 0 {
            return Self::default();
        }
        Self {
            per_k: fee.saturating_mul(1000) / size as Amount,
        }
    }

    pub fn per_k(self) -> Amount {
        self.per_k
    }

    /// Fee for `size` bytes. A positive rate never yields a zero fee.
    pub fn fee(self, size: usize) -> Amount {
        let fee = self.per_k.saturating_mul(size as Amount) / 1000;
        if fee == 0 && self.per_k > 0 {
            return self.per_k;
        }
        fee
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:08} BTC/kB",
            self.per_k / COIN,
            (self.per_k % COIN).abs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
        assert!(!money_range(-1));
    }

    #[test]
    fn fee_rate_rounds_up_to_one_satoshi() {
        let rate = FeeRate::new(1000);
        assert_eq!(rate.fee(250), 250);
        assert_eq!(FeeRate::new(1).fee(100), 1);
        assert_eq!(FeeRate::from_fee(500, 250).per_k(), 2000);
        assert_eq!(FeeRate::from_fee(500, 0).per_k(), 0);
    }
}
