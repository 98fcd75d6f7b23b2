use tessera_common::{
    crypto::{Address, Hash},
    serializer::ReaderError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Block {0} is already in the chain")]
    DuplicateHash(Hash),

    #[error("Block at height {height} does not link to the tip (expected height {expected_height}, parent {expected_parent})")]
    InvalidLinkage {
        height: u64,
        expected_height: u64,
        expected_parent: Hash,
    },

    #[error("Merkle root of block {0} does not match its transactions")]
    InvalidMerkleRoot(Hash),

    #[error("Invalid signature in block {0}")]
    InvalidSignature(Hash),

    #[error("Validator {0} does not meet the minimum stake")]
    NotEligibleValidator(Address),

    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(&'static str),

    #[error("Block timestamp {got} is older than its parent ({parent})")]
    InvalidTimestamp { got: u64, parent: u64 },

    #[error("Block size {got} exceeds the maximum of {max} bytes")]
    BlockTooLarge { got: usize, max: usize },

    #[error("Invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: Address,
        expected: u64,
        got: u64,
    },

    #[error("Insufficient funds for {address}: required {required}, available {available}")]
    InsufficientFunds {
        address: Address,
        required: u64,
        available: u64,
    },

    #[error("Insufficient stake for {address}: required {required}, available {available}")]
    InsufficientStake {
        address: Address,
        required: u64,
        available: u64,
    },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),

    #[error("Invalid transaction {0} in block")]
    InvalidTransaction(Hash),

    #[error("Checkpoint at height {0} failed hash validation")]
    InvalidCheckpoint(u64),

    #[error("Invalid checkpoint lineage: block references checkpoint at height {0} above its own height")]
    InvalidCheckpointLineage(u64),

    #[error("Block {0} not found")]
    BlockNotFound(Hash),

    #[error("No block at height {0}")]
    BlockNotFoundAtHeight(u64),

    #[error("Fork rejected: {0}")]
    ForkRejected(&'static str),

    #[error("Persisted genesis block does not match the configured one")]
    GenesisMismatch,

    #[error("No genesis configuration and the database is empty")]
    MissingGenesis,

    #[error("Corrupted data in storage: {0}")]
    CorruptedData(&'static str),

    #[error(transparent)]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    Codec(#[from] ReaderError),
}
