//! Network parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    /// Largest allowed target, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_retarget_interval: u32,
    pub pow_allow_min_difficulty_blocks: bool,
    pub coinbase_maturity: u32,
    pub subsidy_halving_interval: u32,
    pub majority_enforce_block_upgrade: u32,
    pub majority_reject_block_outdated: u32,
    pub majority_window: u32,
    pub bip16_switch_time: u32,
    pub bip30_exceptions: Vec<Checkpoint>,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn pow_target_spacing(&self) -> i64 {
        self.pow_target_timespan / self.pow_retarget_interval as i64
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Hash256> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| &checkpoint.hash)
    }

    pub fn max_checkpoint_height(&self) -> u32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn is_bip30_exception(&self, height: u32, hash: &Hash256) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|entry| entry.height == height && &entry.hash == hash)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub pubkey_address_prefix: u8,
    pub script_address_prefix: u8,
    /// Loose transactions must pass the relay policy checks.
    pub require_standard: bool,
    pub consensus: ConsensusParams,
}

/// Decodes a display-order hash literal at compile time.
pub const fn display_hash(value: &str) -> Hash256 {
    let bytes = value.as_bytes();
    assert!(bytes.len() == 64, "hash literal must be 64 hex characters");
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[31 - i] = (hex_nibble(bytes[2 * i]) << 4) | hex_nibble(bytes[2 * i + 1]);
        i += 1;
    }
    out
}

const fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex digit in hash literal"),
    }
}

const fn checkpoint(height: u32, hash: &str) -> Checkpoint {
    Checkpoint {
        height,
        hash: display_hash(hash),
    }
}

pub const BIP16_SWITCH_TIME: u32 = 1_333_238_400;

const MAINNET_CHECKPOINTS: [Checkpoint; 12] = [
    checkpoint(11_111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    checkpoint(33_333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    checkpoint(74_000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    checkpoint(105_000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    checkpoint(134_444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    checkpoint(168_000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
    checkpoint(193_000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
    checkpoint(210_000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
    checkpoint(216_116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
    checkpoint(225_430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
    checkpoint(250_000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    checkpoint(279_000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
];

const MAINNET_BIP30_EXCEPTIONS: [Checkpoint; 2] = [
    checkpoint(91_842, "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    checkpoint(91_880, "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
];

const TESTNET_CHECKPOINTS: [Checkpoint; 1] = [checkpoint(
    546,
    "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
)];

/// Target ceiling shared by mainnet and testnet.
const MAINNET_POW_LIMIT: Hash256 =
    display_hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff");
const REGTEST_POW_LIMIT: Hash256 =
    display_hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff");

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            pubkey_address_prefix: 0,
            script_address_prefix: 5,
            require_standard: true,
            consensus: ConsensusParams {
                hash_genesis_block: display_hash(
                    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                ),
                pow_limit: MAINNET_POW_LIMIT,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_retarget_interval: 2016,
                pow_allow_min_difficulty_blocks: false,
                coinbase_maturity: 100,
                subsidy_halving_interval: 210_000,
                majority_enforce_block_upgrade: 750,
                majority_reject_block_outdated: 950,
                majority_window: 1000,
                bip16_switch_time: BIP16_SWITCH_TIME,
                bip30_exceptions: MAINNET_BIP30_EXCEPTIONS.to_vec(),
                checkpoints: MAINNET_CHECKPOINTS.to_vec(),
            },
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            pubkey_address_prefix: 111,
            script_address_prefix: 196,
            require_standard: false,
            consensus: ConsensusParams {
                hash_genesis_block: display_hash(
                    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
                ),
                pow_limit: MAINNET_POW_LIMIT,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_retarget_interval: 2016,
                pow_allow_min_difficulty_blocks: true,
                coinbase_maturity: 100,
                subsidy_halving_interval: 210_000,
                majority_enforce_block_upgrade: 51,
                majority_reject_block_outdated: 75,
                majority_window: 100,
                bip16_switch_time: BIP16_SWITCH_TIME,
                bip30_exceptions: Vec::new(),
                checkpoints: TESTNET_CHECKPOINTS.to_vec(),
            },
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            pubkey_address_prefix: 111,
            script_address_prefix: 196,
            require_standard: false,
            consensus: ConsensusParams {
                hash_genesis_block: display_hash(
                    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                ),
                pow_limit: REGTEST_POW_LIMIT,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_retarget_interval: 2016,
                pow_allow_min_difficulty_blocks: true,
                coinbase_maturity: 100,
                subsidy_halving_interval: 150,
                majority_enforce_block_upgrade: 51,
                majority_reject_block_outdated: 75,
                majority_window: 100,
                bip16_switch_time: BIP16_SWITCH_TIME,
                bip30_exceptions: Vec::new(),
                checkpoints: Vec::new(),
            },
        },
    }
}
