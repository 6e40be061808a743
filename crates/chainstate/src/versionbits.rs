//! BIP9 deployment state machine.

use std::collections::HashMap;

use coind_consensus::constants::{VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK};
use coind_consensus::deployments::ALL_DEPLOYMENTS;
use coind_consensus::params::ConsensusParams;
use coind_consensus::{DeploymentPos, MAX_VERSION_BITS_DEPLOYMENTS};

use crate::blockindex::{BlockIndex, NodeId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdState::Defined => "defined",
            ThresholdState::Started => "started",
            ThresholdState::LockedIn => "locked_in",
            ThresholdState::Active => "active",
            ThresholdState::Failed => "failed",
        }
    }
}

/// Per-deployment state, keyed by the last block of a retarget period.
/// `None` stands for "before genesis".
#[derive(Debug, Default)]
pub struct VersionBitsCache {
    caches: [HashMap<Option<NodeId>, ThresholdState>; MAX_VERSION_BITS_DEPLOYMENTS],
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        for cache in &mut self.caches {
            cache.clear();
        }
    }

    /// State of `pos` for the block whose parent is `prev`.
    pub fn state(
        &mut self,
        index: &BlockIndex,
        prev: Option<NodeId>,
        params: &ConsensusParams,
        pos: DeploymentPos,
    ) -> ThresholdState {
        let deployment = params.deployment(pos);
        let period = params.miner_confirmation_window as i32;
        let threshold = params.rule_change_activation_threshold;
        let cache = &mut self.caches[pos.as_usize()];

        // Every block of a period shares the state of the period boundary.
        let mut cursor = prev.and_then(|id| {
            let height = index.node(id).height;
            index.ancestor(id, height - ((height + 1) % period))
        });

        let mut to_compute = Vec::new();
        while !cache.contains_key(&cursor) {
            let Some(id) = cursor else {
                cache.insert(None, ThresholdState::Defined);
                break;
            };
            if index.median_time_past(id) < deployment.start_time {
                cache.insert(cursor, ThresholdState::Defined);
                break;
            }
            to_compute.push(id);
            let height = index.node(id).height;
            cursor = index.ancestor(id, height - period);
        }

        let mut state = cache
            .get(&cursor)
            .copied()
            .unwrap_or(ThresholdState::Defined);
        while let Some(id) = to_compute.pop() {
            let time = index.median_time_past(id);
            let next = match state {
                ThresholdState::Defined => {
                    if time >= deployment.timeout {
                        ThresholdState::Failed
                    } else if time >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    if time >= deployment.timeout {
                        ThresholdState::Failed
                    } else {
                        let mut count = 0u32;
                        let mut walk = Some(id);
                        for _ in 0..period {
                            let Some(current) = walk else {
                                break;
                            };
                            if signals(index.node(current).version, deployment.mask()) {
                                count += 1;
                            }
                            walk = index.prev(current);
                        }
                        if count >= threshold {
                            ThresholdState::LockedIn
                        } else {
                            ThresholdState::Started
                        }
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                ThresholdState::Active | ThresholdState::Failed => state,
            };
            cache.insert(Some(id), next);
            state = next;
        }
        state
    }

    /// Version a new block on top of `prev` should carry.
    pub fn compute_block_version(
        &mut self,
        index: &BlockIndex,
        prev: Option<NodeId>,
        params: &ConsensusParams,
    ) -> i32 {
        let mut version = VERSIONBITS_TOP_BITS;
        for pos in ALL_DEPLOYMENTS {
            let state = self.state(index, prev, params, pos);
            if matches!(state, ThresholdState::LockedIn | ThresholdState::Started) {
                version |= params.deployment(pos).mask();
            }
        }
        version
    }
}

fn signals(version: i32, mask: i32) -> bool {
    (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS && (version & mask) != 0
}
