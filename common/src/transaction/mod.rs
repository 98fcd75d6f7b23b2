use crate::{
    crypto::{hash, Address, Hash, KeyPair, Signature},
    serializer::{Reader, ReaderError, Serializer, Writer},
};
use serde::{Deserialize, Serialize};

/// Interpretation of the transaction data field.
///
/// Stake and Unstake carry the stake delta; the transaction `amount` is
/// unused for them and must be zero. Coinbase is only ever built by a
/// block producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TransactionPayload {
    Transfer,
    Stake { amount: u64 },
    Unstake { amount: u64 },
    Coinbase,
}

impl TransactionPayload {
    const TRANSFER_ID: u8 = 0;
    const STAKE_ID: u8 = 1;
    const UNSTAKE_ID: u8 = 2;
    const COINBASE_ID: u8 = 3;
}

impl Serializer for TransactionPayload {
    fn write(&self, writer: &mut Writer) {
        match self {
            Self::Transfer => writer.write_u8(Self::TRANSFER_ID),
            Self::Stake { amount } => {
                writer.write_u8(Self::STAKE_ID);
                writer.write_u64(amount);
            }
            Self::Unstake { amount } => {
                writer.write_u8(Self::UNSTAKE_ID);
                writer.write_u64(amount);
            }
            Self::Coinbase => writer.write_u8(Self::COINBASE_ID),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(match reader.read_u8()? {
            Self::TRANSFER_ID => Self::Transfer,
            Self::STAKE_ID => Self::Stake {
                amount: reader.read_u64()?,
            },
            Self::UNSTAKE_ID => Self::Unstake {
                amount: reader.read_u64()?,
            },
            Self::COINBASE_ID => Self::Coinbase,
            _ => return Err(ReaderError::InvalidValue),
        })
    }

    fn size(&self) -> usize {
        match self {
            Self::Transfer | Self::Coinbase => 1,
            Self::Stake { .. } | Self::Unstake { .. } => 1 + 8,
        }
    }
}

/// A transfer, stake movement or coinbase reward.
///
/// The transaction id is a pure function of the signed fields: signing a
/// transaction never changes its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// None marks a coinbase
    pub from: Option<Address>,
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
    /// Sender nonce; fixed to the block height for a coinbase
    pub nonce: u64,
    pub payload: TransactionPayload,
    pub signature: Option<Signature>,
}

impl Transaction {
    pub fn new(
        from: Address,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        payload: TransactionPayload,
    ) -> Self {
        Self {
            from: Some(from),
            to,
            amount,
            fee,
            nonce,
            payload,
            signature: None,
        }
    }

    /// Build the reward transaction for a block at `height` paying
    /// `amount` (block reward plus collected fees) to the validator.
    pub fn coinbase(to: Address, height: u64, amount: u64) -> Self {
        Self {
            from: None,
            to,
            amount,
            fee: 0,
            nonce: height,
            payload: TransactionPayload::Coinbase,
            signature: None,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.from.is_none() && self.payload == TransactionPayload::Coinbase
    }

    /// Stake delta encoded in the payload, if any
    pub fn stake_delta(&self) -> Option<u64> {
        match self.payload {
            TransactionPayload::Stake { amount } | TransactionPayload::Unstake { amount } => {
                Some(amount)
            }
            _ => None,
        }
    }

    // Canonical bytes covered by the signature (everything but the
    // signature itself)
    fn write_signed_fields(&self, writer: &mut Writer) {
        match &self.from {
            Some(from) => {
                writer.write_bool(true);
                from.write(writer);
            }
            None => writer.write_bool(false),
        }
        self.to.write(writer);
        writer.write_u64(&self.amount);
        writer.write_u64(&self.fee);
        writer.write_u64(&self.nonce);
        self.payload.write(writer);
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write_signed_fields(&mut writer);
        writer.bytes()
    }

    /// Transaction id: hash over the signed fields only.
    pub fn hash(&self) -> Hash {
        hash(&self.signing_bytes())
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = Some(keypair.sign(&self.signing_bytes()));
    }

    /// Check the signature against the sender address. A coinbase carries
    /// no signature and always verifies.
    pub fn verify_signature(&self) -> bool {
        if self.is_coinbase() {
            return self.signature.is_none();
        }
        let (Some(from), Some(signature)) = (&self.from, &self.signature) else {
            return false;
        };
        from.verify(&self.signing_bytes(), signature).is_ok()
    }

    /// Structural checks that do not need any state: payload/field
    /// consistency for each transaction kind.
    pub fn has_valid_shape(&self) -> bool {
        match self.payload {
            TransactionPayload::Coinbase => self.from.is_none() && self.fee == 0,
            TransactionPayload::Stake { amount } | TransactionPayload::Unstake { amount } => {
                self.from == Some(self.to) && self.amount == 0 && amount > 0
            }
            TransactionPayload::Transfer => self.from.is_some(),
        }
    }
}

impl Serializer for Transaction {
    fn write(&self, writer: &mut Writer) {
        self.write_signed_fields(writer);
        match &self.signature {
            Some(signature) => {
                writer.write_bool(true);
                signature.write(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let from = if reader.read_bool()? {
            Some(Address::read(reader)?)
        } else {
            None
        };
        let to = Address::read(reader)?;
        let amount = reader.read_u64()?;
        let fee = reader.read_u64()?;
        let nonce = reader.read_u64()?;
        let payload = TransactionPayload::read(reader)?;
        let signature = if reader.read_bool()? {
            Some(Signature::read(reader)?)
        } else {
            None
        };

        Ok(Self {
            from,
            to,
            amount,
            fee,
            nonce,
            payload,
            signature,
        })
    }

    fn size(&self) -> usize {
        1 + self.from.as_ref().map_or(0, |k| k.size())
            + self.to.size()
            + 8 * 3
            + self.payload.size()
            + 1
            + self.signature.as_ref().map_or(0, |s| s.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn transfer(keypair: &KeyPair, to: Address, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(
            keypair.public_key(),
            to,
            1000,
            10,
            nonce,
            TransactionPayload::Transfer,
        );
        tx.sign(keypair);
        tx
    }

    #[test]
    fn test_sign_then_verify() {
        let keypair = KeyPair::generate();
        let tx = transfer(&keypair, KeyPair::generate().public_key(), 1);
        assert!(tx.verify_signature());
    }

    #[test]
    fn test_tampered_transaction_fails_verification() {
        let keypair = KeyPair::generate();
        let mut tx = transfer(&keypair, KeyPair::generate().public_key(), 1);
        tx.amount += 1;
        assert!(!tx.verify_signature());
    }

    #[test]
    fn test_id_ignores_signature() {
        let keypair = KeyPair::generate();
        let to = KeyPair::generate().public_key();
        let mut unsigned = Transaction::new(
            keypair.public_key(),
            to,
            1000,
            10,
            1,
            TransactionPayload::Transfer,
        );
        let id_before = unsigned.hash();
        unsigned.sign(&keypair);
        assert_eq!(id_before, unsigned.hash());
    }

    #[test]
    fn test_wire_roundtrip() {
        let keypair = KeyPair::generate();
        let tx = transfer(&keypair, KeyPair::generate().public_key(), 3);
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(tx.size(), tx.to_bytes().len());
    }

    #[test]
    fn test_coinbase_shape() {
        let to = KeyPair::generate().public_key();
        let coinbase = Transaction::coinbase(to, 42, 5000);
        assert!(coinbase.is_coinbase());
        assert!(coinbase.has_valid_shape());
        assert_eq!(coinbase.nonce, 42);
        assert!(coinbase.verify_signature());
    }

    #[test]
    fn test_stake_requires_self_target() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(
            keypair.public_key(),
            keypair.public_key(),
            0,
            10,
            1,
            TransactionPayload::Stake { amount: 500 },
        );
        tx.sign(&keypair);
        assert!(tx.has_valid_shape());

        tx.to = KeyPair::generate().public_key();
        assert!(!tx.has_valid_shape());
    }
}
