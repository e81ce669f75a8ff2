//! Per-network chain parameters.

use crate::{hash256_from_hex, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Self::Mainnet),
            "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

/// A known-good {height, hash} pair on the canonical chain. Blocks below the
/// latest checkpoint are eligible for reduced validation during headers-first
/// sync.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// First four bytes of every P2P message on this network.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: Vec<&'static str>,
    pub genesis_hash: Hash256,
    /// Ordered by ascending height.
    pub checkpoints: Vec<Checkpoint>,
    /// Regression test feeds intentionally duplicated and unrequested blocks
    /// into the chain, so the sync manager must not punish peers for them.
    pub regression_test: bool,
}

const MAINNET_CHECKPOINT_TABLE: &[(i32, &str)] = &[
    (
        999,
        "0000000000ad4a03b1a1e0a0d315ca69a69b976fa2b7e2b870a45a88eb0bb2bc",
    ),
    (
        50000,
        "000000000017e5b2b1c5f2b9e9d06d32c6e0e71b225b7c1a9a7e5cdd0a40bfa1",
    ),
    (
        100000,
        "00000000000b2a6b4b1ab53e1f8a03d9a87fcd57bb8be4dd86c1f09bbf0dd6e3",
    ),
    (
        150000,
        "0000000000024429c9c9f5a4e4b2dbca13b7a0fbd9a7d5e6c187d0f31a1efccd",
    ),
];

const TESTNET_CHECKPOINT_TABLE: &[(i32, &str)] = &[(
    546,
    "0000000041b2c5c1e1afc4cb10ad5e98357e0a42e27e67b15ce26b4a6a04cd33",
)];

fn build_checkpoints(table: &[(i32, &str)]) -> Vec<Checkpoint> {
    table
        .iter()
        .map(|(height, hex)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hex).expect("bad checkpoint hash in params table"),
        })
        .collect()
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xf9, 0xc9, 0xb7, 0xdd],
            default_port: 11_047,
            dns_seeds: vec!["seed1.parallelcoin.io", "seed2.parallelcoin.io"],
            genesis_hash: hash256_from_hex(
                "00000000d2516a20e0b1988f929b9f7d0c2e7d1f745ba47de0b2f0c7e2c9a0b3",
            )
            .expect("bad genesis hash"),
            checkpoints: build_checkpoints(MAINNET_CHECKPOINT_TABLE),
            regression_test: false,
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            default_port: 21_047,
            dns_seeds: vec!["testnet-seed.parallelcoin.io"],
            genesis_hash: hash256_from_hex(
                "00000000a42ea61bc02e546b8c1e3a4e57e26cfd0e0b60fd42a9e655e00ae427",
            )
            .expect("bad genesis hash"),
            checkpoints: build_checkpoints(TESTNET_CHECKPOINT_TABLE),
            regression_test: false,
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 31_047,
            dns_seeds: Vec::new(),
            genesis_hash: hash256_from_hex(
                "3a1c1b9f66e6b15e1e9ab1fd7b6c1e2a7c98d9f2a0b3c4d5e6f7081922ab41cd",
            )
            .expect("bad genesis hash"),
            checkpoints: Vec::new(),
            regression_test: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_are_ordered_by_height() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            let heights: Vec<i32> = params.checkpoints.iter().map(|cp| cp.height).collect();
            let mut sorted = heights.clone();
            sorted.sort_unstable();
            assert_eq!(heights, sorted, "{network:?} checkpoint table out of order");
        }
    }

    #[test]
    fn regtest_has_no_checkpoints_and_allows_unrequested() {
        let params = chain_params(Network::Regtest);
        assert!(params.checkpoints.is_empty());
        assert!(params.regression_test);
    }
}
