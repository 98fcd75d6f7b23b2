use crate::core::error::BlockchainError;
use log::trace;
use std::collections::{BTreeMap, HashMap};
use tessera_common::{
    account::AccountState,
    block::Block,
    crypto::Address,
    transaction::{Transaction, TransactionPayload},
};

/// Running map of address -> (balance, stake, nonce), advanced by block
/// application. Stake is locked balance: an account can never spend below
/// what it has staked.
///
/// The accumulator is cheap to clone; block validation runs against a
/// clone and the result is committed only on full success.
#[derive(Debug, Clone, Default)]
pub struct StateAccumulator {
    accounts: HashMap<Address, AccountState>,
    total_stake: u64,
}

impl StateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> AccountState {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn get_balance(&self, address: &Address) -> u64 {
        self.get(address).balance
    }

    pub fn get_stake(&self, address: &Address) -> u64 {
        self.get(address).stake
    }

    pub fn get_nonce(&self, address: &Address) -> u64 {
        self.get(address).nonce
    }

    /// Balance not locked as stake
    pub fn get_spendable(&self, address: &Address) -> u64 {
        let account = self.get(address);
        account.balance.saturating_sub(account.stake)
    }

    /// Sum of all stakes, the denominator of leader election
    pub fn total_stake(&self) -> u64 {
        self.total_stake
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Ordered snapshot of all accounts, the raw material of a checkpoint
    pub fn snapshot(&self) -> BTreeMap<Address, AccountState> {
        self.accounts.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Seed the genesis allocation: the coinbase amount is credited and
    /// locked as stake in one step, so the chain has an eligible
    /// validator from height 1 on.
    pub fn apply_genesis(&mut self, block: &Block) -> Result<(), BlockchainError> {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                return Err(BlockchainError::InvalidCoinbase(
                    "genesis may only contain coinbase transactions",
                ));
            }
            let account = self.accounts.entry(tx.to).or_default();
            account.balance = account
                .balance
                .checked_add(tx.amount)
                .ok_or(BlockchainError::BalanceOverflow(tx.to))?;
            account.stake += tx.amount;
            self.total_stake += tx.amount;
        }
        Ok(())
    }

    /// Apply a full block: coinbase first paying exactly
    /// `block_reward + fees`, then every other transaction in order.
    pub fn apply_block(&mut self, block: &Block, block_reward: u64) -> Result<(), BlockchainError> {
        let coinbase = block
            .transactions
            .first()
            .ok_or(BlockchainError::InvalidCoinbase("block has no coinbase"))?;
        if !coinbase.is_coinbase() {
            return Err(BlockchainError::InvalidCoinbase(
                "first transaction must be the coinbase",
            ));
        }
        if coinbase.nonce != block.header.height {
            return Err(BlockchainError::InvalidCoinbase(
                "coinbase nonce must equal the block height",
            ));
        }
        if coinbase.to != block.header.validator {
            return Err(BlockchainError::InvalidCoinbase(
                "coinbase must pay the block validator",
            ));
        }
        let expected = block_reward
            .checked_add(block.total_fees())
            .ok_or(BlockchainError::BalanceOverflow(coinbase.to))?;
        if coinbase.amount != expected {
            return Err(BlockchainError::InvalidCoinbase(
                "coinbase amount must equal block reward plus fees",
            ));
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 && tx.is_coinbase() {
                return Err(BlockchainError::InvalidCoinbase(
                    "only the first transaction may be a coinbase",
                ));
            }
            self.apply_transaction(tx)?;
        }
        Ok(())
    }

    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), BlockchainError> {
        if tx.is_coinbase() {
            let account = self.accounts.entry(tx.to).or_default();
            account.balance = account
                .balance
                .checked_add(tx.amount)
                .ok_or(BlockchainError::BalanceOverflow(tx.to))?;
            return Ok(());
        }

        let from = tx.from.ok_or(BlockchainError::InvalidTransaction(tx.hash()))?;
        let sender = self.get(&from);

        let expected = sender.nonce + 1;
        if tx.nonce != expected {
            return Err(BlockchainError::InvalidNonce {
                address: from,
                expected,
                got: tx.nonce,
            });
        }

        let spendable = sender.balance.saturating_sub(sender.stake);
        match tx.payload {
            TransactionPayload::Transfer => {
                let outflow = tx
                    .amount
                    .checked_add(tx.fee)
                    .ok_or(BlockchainError::BalanceOverflow(from))?;
                if spendable < outflow {
                    return Err(BlockchainError::InsufficientFunds {
                        address: from,
                        required: outflow,
                        available: spendable,
                    });
                }
                {
                    let account = self.accounts.entry(from).or_default();
                    account.balance -= outflow;
                    account.nonce = tx.nonce;
                }
                let recipient = self.accounts.entry(tx.to).or_default();
                recipient.balance = recipient
                    .balance
                    .checked_add(tx.amount)
                    .ok_or(BlockchainError::BalanceOverflow(tx.to))?;
            }
            TransactionPayload::Stake { amount } => {
                let required = amount
                    .checked_add(tx.fee)
                    .ok_or(BlockchainError::BalanceOverflow(from))?;
                if spendable < required {
                    return Err(BlockchainError::InsufficientFunds {
                        address: from,
                        required,
                        available: spendable,
                    });
                }
                let account = self.accounts.entry(from).or_default();
                account.balance -= tx.fee;
                account.stake += amount;
                account.nonce = tx.nonce;
                self.total_stake += amount;
            }
            TransactionPayload::Unstake { amount } => {
                if sender.stake < amount {
                    return Err(BlockchainError::InsufficientStake {
                        address: from,
                        required: amount,
                        available: sender.stake,
                    });
                }
                if spendable < tx.fee {
                    return Err(BlockchainError::InsufficientFunds {
                        address: from,
                        required: tx.fee,
                        available: spendable,
                    });
                }
                let account = self.accounts.entry(from).or_default();
                account.stake -= amount;
                account.balance -= tx.fee;
                account.nonce = tx.nonce;
                self.total_stake -= amount;
            }
            TransactionPayload::Coinbase => {
                return Err(BlockchainError::InvalidTransaction(tx.hash()));
            }
        }

        trace!("applied transaction {} from {}", tx.hash(), from);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_common::{
        block::{calculate_merkle_root, BlockHeader},
        crypto::{Hash, KeyPair},
        wallet::Wallet,
    };

    fn funded_state(wallet: &Wallet, balance: u64, stake: u64) -> StateAccumulator {
        let mut state = StateAccumulator::new();
        let coinbase = Arc::new(Transaction::coinbase(wallet.address(), 0, balance));
        let header = BlockHeader::new(
            0,
            0,
            0,
            Hash::zero(),
            calculate_merkle_root(&[coinbase.clone()]),
            wallet.address(),
            0,
        );
        state
            .apply_genesis(&Block::new(header, vec![coinbase]))
            .unwrap();
        // Genesis locks everything; free up the difference for spending
        if stake < balance {
            let account = state.accounts.get_mut(&wallet.address()).unwrap();
            account.stake = stake;
            state.total_stake = stake;
        }
        state
    }

    #[test]
    fn test_genesis_seeds_balance_and_stake() {
        let wallet = Wallet::generate();
        let state = funded_state(&wallet, 1_000_000, 1_000_000);
        assert_eq!(state.get_balance(&wallet.address()), 1_000_000);
        assert_eq!(state.get_stake(&wallet.address()), 1_000_000);
        assert_eq!(state.total_stake(), 1_000_000);
        assert_eq!(state.get_spendable(&wallet.address()), 0);
    }

    #[test]
    fn test_transfer_moves_spendable_balance() {
        let wallet = Wallet::generate();
        let recipient = KeyPair::generate().public_key();
        let mut state = funded_state(&wallet, 10_000, 1_000);

        let tx = wallet.create_transaction(
            recipient,
            500,
            10,
            1,
            TransactionPayload::Transfer,
        );
        state.apply_transaction(&tx).unwrap();

        assert_eq!(state.get_balance(&wallet.address()), 10_000 - 510);
        assert_eq!(state.get_balance(&recipient), 500);
        assert_eq!(state.get_nonce(&wallet.address()), 1);
    }

    #[test]
    fn test_transfer_cannot_spend_locked_stake() {
        let wallet = Wallet::generate();
        let mut state = funded_state(&wallet, 1_000, 900);

        let tx = wallet.create_transaction(
            KeyPair::generate().public_key(),
            500,
            0,
            1,
            TransactionPayload::Transfer,
        );
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(BlockchainError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_stake_locks_without_reducing_balance() {
        let wallet = Wallet::generate();
        let mut state = funded_state(&wallet, 10_000, 0);

        let tx = wallet.create_stake_transaction(4_000, 10, 1);
        state.apply_transaction(&tx).unwrap();

        assert_eq!(state.get_balance(&wallet.address()), 10_000 - 10);
        assert_eq!(state.get_stake(&wallet.address()), 4_000);
        assert_eq!(state.total_stake(), 4_000);
    }

    #[test]
    fn test_unstake_releases_stake() {
        let wallet = Wallet::generate();
        let mut state = funded_state(&wallet, 10_000, 0);
        state
            .apply_transaction(&wallet.create_stake_transaction(4_000, 0, 1))
            .unwrap();

        let unstake = wallet.create_transaction(
            wallet.address(),
            0,
            5,
            2,
            TransactionPayload::Unstake { amount: 1_500 },
        );
        state.apply_transaction(&unstake).unwrap();

        assert_eq!(state.get_stake(&wallet.address()), 2_500);
        assert_eq!(state.get_balance(&wallet.address()), 10_000 - 5);
        assert_eq!(state.total_stake(), 2_500);
    }

    #[test]
    fn test_nonce_gap_is_rejected() {
        let wallet = Wallet::generate();
        let mut state = funded_state(&wallet, 10_000, 0);

        let tx = wallet.create_transaction(
            KeyPair::generate().public_key(),
            10,
            1,
            3,
            TransactionPayload::Transfer,
        );
        assert!(matches!(
            state.apply_transaction(&tx),
            Err(BlockchainError::InvalidNonce {
                expected: 1,
                got: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_coinbase_credits_balance_only() {
        let wallet = Wallet::generate();
        let mut state = funded_state(&wallet, 1_000, 1_000);
        let coinbase = Transaction::coinbase(wallet.address(), 7, 5_000);
        state.apply_transaction(&coinbase).unwrap();
        assert_eq!(state.get_balance(&wallet.address()), 6_000);
        assert_eq!(state.get_stake(&wallet.address()), 1_000);
        // Coinbase does not bump the account nonce
        assert_eq!(state.get_nonce(&wallet.address()), 0);
    }
}
