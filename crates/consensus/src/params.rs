//! Per-network chain parameters.

use crate::money::{Amount, COIN};
use crate::{shifted_limit, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i64,
    pub hash: Hash256,
}

/// Fixed header fields and coinbase tag the genesis block is built from.
#[derive(Clone, Debug)]
pub struct GenesisSeed {
    pub version: u32,
    pub time: u32,
    pub bits: u32,
    pub burn_bits: u32,
    pub nonce: u32,
    pub coinbase_tag: &'static str,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// True on test networks: new-protocol rules apply regardless of switch times.
    pub test_rules: bool,

    // Target limits, little-endian 256-bit thresholds.
    pub work_limit: Hash256,
    pub burn_limit: Hash256,
    pub stake_limit: Hash256,
    pub initial_hash_target: Hash256,

    // Chain-trust numerators for PoW and PoB blocks.
    pub pow_base: Hash256,
    pub pob_base: Hash256,

    // Retarget cadence.
    pub stake_target_spacing: i64,
    pub pob_target_spacing: i64,
    pub pob_target_timespan: i64,
    /// Height at which the retarget timespan moves from 30 minutes to 6 hours.
    pub retarget_timespan_switch_height: i64,

    pub coinbase_maturity: i64,
    pub stake_min_age: u32,
    pub max_clock_drift: u32,

    pub max_mint_proof_of_work: Amount,
    pub max_mint_proof_of_burn: Amount,

    // Proof-of-burn engine.
    pub burn_min_confirms: i64,
    pub burn_constant: Amount,
    pub burn_hash_double: f64,
    pub burn_decay_rate: f64,
    /// Legacy pre-switch burn-target formula only.
    pub burn_harder_target: u64,
    pub burn_script_pubkey: Vec<u8>,

    // Protocol switch times (seconds since epoch; zero means always active).
    pub burn_round_down_time: u32,
    pub burn_intermediate_switch_time: u32,
    pub pob_pos_target_switch_time: u32,
    pub chainchecks_switch_time: u32,
    pub protocol_v05_time: u32,
    pub p2sh_switch_time: u32,
    pub bip30_switch_time: u32,

    pub checkpoints: Vec<Checkpoint>,
    /// Pubkey authorized to broadcast synchronized checkpoints, if any.
    pub checkpoint_pubkey: Option<Vec<u8>>,
    /// Pubkey authorized to broadcast alerts; without one, alerts are
    /// ignored rather than trusted.
    pub alert_pubkey: Option<Vec<u8>>,

    pub genesis: GenesisSeed,
}

impl ConsensusParams {
    pub fn new_protocol_at(&self, time: u32) -> bool {
        self.test_rules || time > self.pob_pos_target_switch_time
    }

    pub fn chainchecks_at(&self, time: u32) -> bool {
        self.test_rules || time > self.chainchecks_switch_time
    }

    pub fn v05_rules_at(&self, time: u32) -> bool {
        self.test_rules || time >= self.protocol_v05_time
    }

    pub fn strict_p2sh_at(&self, time: u32) -> bool {
        time >= self.p2sh_switch_time
    }

    pub fn bip30_active_at(&self, time: u32) -> bool {
        time > self.bip30_switch_time
    }

    pub fn burn_intermediate_at(&self, time: u32) -> bool {
        time >= self.burn_intermediate_switch_time
    }

    /// Stake target limit; the relaxed limit only applies under the new protocol.
    pub fn stake_limit_at(&self, time: u32) -> Hash256 {
        if self.new_protocol_at(time) {
            self.stake_limit
        } else {
            self.work_limit
        }
    }

    /// Height covered by the hardened checkpoint list.
    pub fn total_blocks_estimate(&self) -> i64 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn check_hardened(&self, height: i64, hash: &Hash256) -> bool {
        match self
            .checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
        {
            Some(checkpoint) => checkpoint.hash == *hash,
            None => true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Network magic prefixing gossip frames and block files.
    pub magic: [u8; 4],
    pub default_port: u16,
    /// Reject non-standard transactions from the relay path.
    pub require_standard: bool,
    pub consensus: ConsensusParams,
}

const BURN_HASH160: [u8; 20] = *b"CINDER*BURN*ADDRESS*";

fn burn_script() -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&BURN_HASH160);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magic: [0x6e, 0x8b, 0x92, 0xa5],
            default_port: 41682,
            require_standard: true,
            consensus: ConsensusParams {
                test_rules: false,
                work_limit: shifted_limit(20),
                burn_limit: shifted_limit(16),
                stake_limit: shifted_limit(27),
                initial_hash_target: shifted_limit(21),
                pow_base: shifted_limit(24),
                pob_base: shifted_limit(20),
                stake_target_spacing: 90,
                pob_target_spacing: 3,
                pob_target_timespan: 30,
                retarget_timespan_switch_height: 4258,
                coinbase_maturity: 500,
                stake_min_age: 30 * 24 * 60 * 60,
                max_clock_drift: 2 * 60 * 60,
                max_mint_proof_of_work: 50 * COIN,
                max_mint_proof_of_burn: 100 * COIN,
                burn_min_confirms: 6,
                burn_constant: 10_000,
                burn_hash_double: 350.0,
                burn_decay_rate: 1.000_001_98,
                burn_harder_target: 32,
                burn_script_pubkey: burn_script(),
                burn_round_down_time: 1_402_314_985,
                burn_intermediate_switch_time: 1_407_110_400,
                pob_pos_target_switch_time: 1_407_110_400,
                chainchecks_switch_time: 1_407_110_400,
                protocol_v05_time: 1_407_110_400,
                p2sh_switch_time: 1_333_238_400,
                bip30_switch_time: 1_331_769_600,
                checkpoints: Vec::new(),
                checkpoint_pubkey: None,
                alert_pubkey: None,
                genesis: GenesisSeed {
                    version: 1,
                    time: 1_399_578_460,
                    bits: 0x1e0f_ffff,
                    burn_bits: 0x1f00_ffff,
                    nonce: 116_872,
                    coinbase_tag: "parallel chains burn brightest where the work runs deepest",
                },
            },
        },
        Network::Testnet => {
            let mut params = chain_params(Network::Mainnet);
            params.network = network;
            params.magic = [0xcd, 0xf2, 0xc0, 0xef];
            params.default_port = 41684;
            params.require_standard = false;
            params.consensus.test_rules = true;
            params.consensus.stake_min_age = 24 * 60 * 60;
            params.consensus.coinbase_maturity = 60;
            params.consensus.genesis.time = 1_405_164_774;
            params.consensus.genesis.nonce = 63_626;
            params
        }
        Network::Regtest => {
            let mut params = chain_params(Network::Testnet);
            params.network = network;
            params.magic = [0xfa, 0xbf, 0xb5, 0xda];
            params.default_port = 41686;
            params.consensus.work_limit = shifted_limit(1);
            params.consensus.burn_limit = shifted_limit(1);
            params.consensus.stake_limit = shifted_limit(1);
            params.consensus.initial_hash_target = shifted_limit(1);
            params.consensus.coinbase_maturity = 10;
            params.consensus.stake_min_age = 24 * 60 * 60;
            params.consensus.burn_round_down_time = 0;
            params.consensus.burn_intermediate_switch_time = 0;
            params.consensus.pob_pos_target_switch_time = 0;
            params.consensus.chainchecks_switch_time = 0;
            params.consensus.protocol_v05_time = 0;
            params.consensus.p2sh_switch_time = 0;
            params.consensus.bip30_switch_time = 0;
            params.consensus.genesis.time = 1_400_000_000;
            params.consensus.genesis.bits = 0x207f_ffff;
            params.consensus.genesis.burn_bits = 0x207f_ffff;
            params.consensus.genesis.nonce = 0;
            params
        }
    }
}
