use crate::{
    crypto::{Address, KeyPair, SecretKey, Signature},
    transaction::{Transaction, TransactionPayload},
};

/// Signing oracle bound to one address. The daemon uses it to author
/// transactions, blocks and checkpoints; it never leaves the node.
pub struct Wallet {
    keypair: KeyPair,
}

impl Wallet {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn generate() -> Self {
        Self::new(KeyPair::generate())
    }

    pub fn from_secret(secret: &SecretKey) -> Self {
        Self::new(KeyPair::from_secret(secret))
    }

    pub fn address(&self) -> Address {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }

    /// Build and sign a transaction from this wallet.
    pub fn create_transaction(
        &self,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        payload: TransactionPayload,
    ) -> Transaction {
        let mut tx = Transaction::new(self.address(), to, amount, fee, nonce, payload);
        tx.sign(&self.keypair);
        tx
    }

    /// Convenience for a stake movement: target is always the wallet
    /// itself.
    pub fn create_stake_transaction(&self, delta: u64, fee: u64, nonce: u64) -> Transaction {
        self.create_transaction(
            self.address(),
            0,
            fee,
            nonce,
            TransactionPayload::Stake { amount: delta },
        )
    }
}
