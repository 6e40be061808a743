//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// New coins created by the coinbase at `height`: 50 coins halved every
/// `subsidy_halving_interval` blocks, zero once the shift would exceed 63.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    let subsidy: Amount = 50 * COIN;
    subsidy >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{consensus_params, Network};

    #[test]
    fn mainnet_halvings() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 1_250_000_000);
        assert_eq!(block_subsidy(210_000 * 64, &params), 0);
    }

    #[test]
    fn total_supply_stays_below_max_money() {
        let params = consensus_params(Network::Mainnet);
        let mut total: Amount = 0;
        let mut height = 0;
        while height < 14_000_000 {
            let subsidy = block_subsidy(height, &params);
            total += subsidy * params.subsidy_halving_interval as Amount;
            height += params.subsidy_halving_interval;
        }
        assert_eq!(total, 2_099_999_997_690_000);
        assert!(crate::money::money_range(total));
    }

    #[test]
    fn regtest_halves_every_150_blocks() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(block_subsidy(149, &params), 50 * COIN);
        assert_eq!(block_subsidy(150, &params), 25 * COIN);
    }
}
