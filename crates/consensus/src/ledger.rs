//! Account balances derived from a branch of blocks.
//!
//! The ledger is never stored. It is rebuilt by replaying blocks from genesis
//! and advanced one block at a time by the validator, so each branch of the
//! chain can carry its own view of who owns what.

use powchain_core::{Address, Block, Hash, Transaction};
use std::collections::{HashMap, HashSet};

/// Balances plus the set of transaction hashes confirmed on one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    balances: HashMap<Address, u64>,
    confirmed: HashSet<Hash>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay a sequence of already-validated blocks, genesis first.
    pub fn replay<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Self {
        let mut ledger = Self::new();
        for block in blocks {
            ledger.apply_block(block);
        }
        ledger
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn is_confirmed(&self, hash: &Hash) -> bool {
        self.confirmed.contains(hash)
    }

    /// Apply every transaction of a block. Fees go to the reward recipient.
    pub fn apply_block(&mut self, block: &Block) {
        let fee_recipient = block.reward().map(|tx| tx.recipient);
        for tx in &block.transactions {
            self.apply_transaction(tx, fee_recipient);
        }
    }

    /// Apply one transaction without checking it.
    ///
    /// Callers validate first; debits saturate rather than fail. A fee with no
    /// recipient (a block without a reward) is burned.
    pub fn apply_transaction(&mut self, tx: &Transaction, fee_recipient: Option<Address>) {
        if tx.is_reward() {
            self.credit(tx.recipient, tx.amount);
        } else {
            self.debit(tx.sender, tx.amount.saturating_add(tx.fee));
            self.credit(tx.recipient, tx.amount);
            if let Some(miner) = fee_recipient {
                self.credit(miner, tx.fee);
            }
        }
        self.confirmed.insert(tx.hash());
    }

    fn credit(&mut self, address: Address, amount: u64) {
        let balance = self.balances.entry(address).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    fn debit(&mut self, address: Address, amount: u64) {
        let balance = self.balances.entry(address).or_insert(0);
        *balance = balance.saturating_sub(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powchain_core::Keypair;

    #[test]
    fn test_genesis_allocations() {
        let alice = Address::from_bytes([1u8; 20]);
        let bob = Address::from_bytes([2u8; 20]);
        let genesis = Block::genesis(1, &[(alice, 500), (bob, 70)]);

        let ledger = LedgerState::replay([&genesis]);
        assert_eq!(ledger.balance(&alice), 500);
        assert_eq!(ledger.balance(&bob), 70);
        assert_eq!(genesis.transactions.len(), 2);
        assert!(genesis.transactions.iter().all(|tx| ledger.is_confirmed(&tx.hash())));
    }

    #[test]
    fn test_transfer_moves_amount_and_fee() {
        let alice = Keypair::generate();
        let bob = Address::from_bytes([2u8; 20]);
        let miner = Address::from_bytes([3u8; 20]);
        let genesis = Block::genesis(1, &[(alice.address(), 100)]);

        let reward = Transaction::reward(miner, 50, 1, 10);
        let transfer = Transaction::transfer(alice.address(), bob, 30, 5, 0).signed(&alice);
        let block = Block::new(1, genesis.hash(), vec![reward, transfer.clone()], 1, 10);

        let ledger = LedgerState::replay([&genesis, &block]);
        assert_eq!(ledger.balance(&alice.address()), 65);
        assert_eq!(ledger.balance(&bob), 30);
        assert_eq!(ledger.balance(&miner), 55);
        assert!(ledger.is_confirmed(&transfer.hash()));
    }

    #[test]
    fn test_unknown_address_has_zero_balance() {
        let ledger = LedgerState::new();
        assert_eq!(ledger.balance(&Address::from_bytes([9u8; 20])), 0);
        assert!(!ledger.is_confirmed(&Hash::ZERO));
    }
}
