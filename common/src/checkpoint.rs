use crate::{
    account::AccountState,
    crypto::{Address, Hash, KeyPair, Signature},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampSeconds,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::{Display, Error as FmtError, Formatter};

pub const DEFAULT_CSV_DELIMITER: char = ',';

// Upper bound on accounts accepted in a checkpoint off the wire
pub const MAX_CHECKPOINT_ACCOUNTS: usize = 1_000_000;

/// Producer attestation: which validator signed the checkpoint hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSignature {
    pub validator: Address,
    pub signature: Signature,
}

/// Snapshot of the state accumulator at an interval boundary.
///
/// The hash commits to the canonical CSV rendering of the account map, so
/// two honest nodes at the same height produce the same hash bit for bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub timestamp: TimestampSeconds,
    /// BTreeMap keeps addresses sorted by raw bytes, which is exactly the
    /// CSV line order
    pub accounts: BTreeMap<Address, AccountState>,
    pub hash: Hash,
    pub signature: Option<CheckpointSignature>,
}

impl Checkpoint {
    /// Build a checkpoint from a state snapshot and seal it with its
    /// content hash.
    pub fn create(
        height: u64,
        timestamp: TimestampSeconds,
        accounts: BTreeMap<Address, AccountState>,
        delimiter: char,
    ) -> Self {
        let csv = render_csv(&accounts, delimiter);
        let hash = compute_hash(height, timestamp, &csv);
        Self {
            height,
            timestamp,
            accounts,
            hash,
            signature: None,
        }
    }

    /// Canonical CSV: one line per address in byte order, numeric fields
    /// decimal, no trailing newline.
    pub fn to_csv(&self, delimiter: char) -> String {
        render_csv(&self.accounts, delimiter)
    }

    /// Recompute the content hash and compare with the committed one.
    pub fn verify(&self, delimiter: char) -> bool {
        compute_hash(self.height, self.timestamp, &self.to_csv(delimiter)) == self.hash
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = Some(CheckpointSignature {
            validator: keypair.public_key(),
            signature: keypair.sign(self.hash.as_bytes()),
        });
    }

    /// Check the producer attestation, when one is attached.
    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(sig) => sig
                .validator
                .verify(self.hash.as_bytes(), &sig.signature)
                .is_ok(),
            None => false,
        }
    }
}

fn render_csv(accounts: &BTreeMap<Address, AccountState>, delimiter: char) -> String {
    let mut lines = Vec::with_capacity(accounts.len());
    for (address, state) in accounts {
        lines.push(format!(
            "{}{delimiter}{}{delimiter}{}{delimiter}{}",
            address.to_hex(),
            state.balance,
            state.stake,
            state.nonce
        ));
    }
    lines.join("\n")
}

/// `sha256(u64_be(height) || u64_be(timestamp) || csv_bytes)`
pub fn compute_hash(height: u64, timestamp: TimestampSeconds, csv: &str) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(height.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(csv.as_bytes());
    Hash::new(hasher.finalize().into())
}

impl Serializer for Checkpoint {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.height);
        writer.write_u64(&self.timestamp);
        writer.write_u32(&(self.accounts.len() as u32));
        for (address, state) in &self.accounts {
            address.write(writer);
            state.write(writer);
        }
        writer.write_hash(&self.hash);
        match &self.signature {
            Some(sig) => {
                writer.write_bool(true);
                sig.validator.write(writer);
                sig.signature.write(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let height = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let count = reader.read_u32()? as usize;
        if count > MAX_CHECKPOINT_ACCOUNTS {
            return Err(ReaderError::InvalidValue);
        }
        let mut accounts = BTreeMap::new();
        for _ in 0..count {
            let address = Address::read(reader)?;
            let state = AccountState::read(reader)?;
            accounts.insert(address, state);
        }
        let hash = reader.read_hash()?;
        let signature = if reader.read_bool()? {
            Some(CheckpointSignature {
                validator: Address::read(reader)?,
                signature: Signature::read(reader)?,
            })
        } else {
            None
        };

        Ok(Self {
            height,
            timestamp,
            accounts,
            hash,
            signature,
        })
    }

    fn size(&self) -> usize {
        8 + 8
            + 4
            + self
                .accounts
                .iter()
                .map(|(address, state)| address.size() + state.size())
                .sum::<usize>()
            + self.hash.size()
            + 1
            + self
                .signature
                .as_ref()
                .map_or(0, |sig| sig.validator.size() + sig.signature.size())
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Checkpoint[height: {}, accounts: {}, hash: {}]",
            self.height,
            self.accounts.len(),
            self.hash
        )
    }
}
