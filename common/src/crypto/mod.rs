mod ed25519;
mod hash;

pub use ed25519::{
    CryptoError, KeyPair, PublicKey, SecretKey, Signature, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE,
    SIGNATURE_SIZE,
};
pub use hash::{hash, Hash, Hashable, HASH_SIZE};

/// Accounts are addressed directly by their Ed25519 public key.
pub type Address = PublicKey;
