// In case of potential forks, have a unique network id to not connect to
// other compatible chains
pub const NETWORK_ID_SIZE: usize = 16;
pub const NETWORK_ID: [u8; NETWORK_ID_SIZE] = [
    0x74, 0x65, 0x73, 0x73, 0x65, 0x72, 0x61, 0x2d, 0x6d, 0x65, 0x73, 0x68, 0x2d, 0x76, 0x30,
    0x31,
];

// Protocol version advertised during the handshake
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const BYTES_PER_KB: usize = 1024;

// Hard cap on a single serialized transaction
pub const MAX_TRANSACTION_SIZE: usize = 16 * BYTES_PER_KB;

// Fixed timestamp of the genesis block so every node derives the same
// genesis hash from the same configuration
pub const GENESIS_TIMESTAMP_MILLIS: u64 = 1_735_689_600_000;

// Current block header version
pub const BLOCK_VERSION: u8 = 0;
