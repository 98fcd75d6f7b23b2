use crate::serializer::{Reader, ReaderError, Serializer, Writer};
use serde::{Deserialize, Serialize};

/// Per-address entry of the state accumulator: spendable balance, locked
/// stake and the nonce of the last applied transaction from this address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: u64,
    pub stake: u64,
    pub nonce: u64,
}

impl AccountState {
    pub fn new(balance: u64, stake: u64, nonce: u64) -> Self {
        Self {
            balance,
            stake,
            nonce,
        }
    }
}

impl Serializer for AccountState {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.balance);
        writer.write_u64(&self.stake);
        writer.write_u64(&self.nonce);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let balance = reader.read_u64()?;
        let stake = reader.read_u64()?;
        let nonce = reader.read_u64()?;
        Ok(Self {
            balance,
            stake,
            nonce,
        })
    }

    fn size(&self) -> usize {
        8 * 3
    }
}
