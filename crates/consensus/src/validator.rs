//! Transaction and block validation rules.
//!
//! Everything here is a pure function of its inputs: validation never touches
//! the chain or the pending pool, so it can run concurrently for different
//! candidates. A successful block validation hands back the ledger state after
//! the block so the caller does not replay it a second time.

use crate::difficulty::MIN_DIFFICULTY;
use crate::ledger::LedgerState;
use crate::params::ConsensusParams;
use powchain_core::{Address, Block, Hash, Transaction, TransactionError};
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur during validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed amount: {0}")]
    MalformedAmount(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] TransactionError),

    #[error("insufficient funds (required {required}, available {available})")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("double spend by transaction {0}")]
    DoubleSpend(Hash),

    #[error("block does not link to its parent (expected index {expected_index} after {expected_prev})")]
    LinkageMismatch { expected_prev: Hash, expected_index: u64 },

    #[error("block timestamp {got} is earlier than parent timestamp {parent}")]
    TimestampTooEarly { parent: u64, got: u64 },

    #[error("block timestamp {got} is too far ahead of local time {now}")]
    TimestampTooFuture { now: u64, got: u64 },

    #[error("unexpected difficulty (expected {expected}, got {got})")]
    UnexpectedDifficulty { expected: u32, got: u32 },

    #[error("difficulty not met (required {required} leading zero bits, got {actual})")]
    DifficultyNotMet { required: u32, actual: u32 },

    #[error("block merkle root does not match its transactions")]
    MerkleMismatch,

    #[error("too many transactions (max {max}, got {got})")]
    TooManyTransactions { max: usize, got: usize },

    #[error("block too large (max {max} bytes, got {got})")]
    BlockTooLarge { max: usize, got: usize },

    #[error("invalid block reward: {0}")]
    InvalidReward(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Transaction validator.
pub struct TransactionValidator;

impl TransactionValidator {
    /// Amount and fee bounds; zero is a legal amount. Rewards are only legal
    /// in the reward slot.
    pub fn check_amounts(tx: &Transaction, params: &ConsensusParams) -> Result<()> {
        if tx.is_reward() {
            return Err(ValidationError::MalformedAmount(
                "reward transaction submitted as a transfer".into(),
            ));
        }
        if tx.amount > params.max_amount {
            return Err(ValidationError::MalformedAmount(format!(
                "amount {} exceeds maximum {}",
                tx.amount, params.max_amount
            )));
        }
        if tx.fee > params.max_fee {
            return Err(ValidationError::MalformedAmount(format!(
                "fee {} exceeds maximum {}",
                tx.fee, params.max_fee
            )));
        }
        Ok(())
    }

    /// Sender's balance must cover amount plus fee.
    pub fn check_funds(tx: &Transaction, ledger: &LedgerState) -> Result<()> {
        let required = tx
            .total_cost()
            .ok_or_else(|| ValidationError::MalformedAmount("amount plus fee overflows".into()))?;
        let available = ledger.balance(&tx.sender);
        if available < required {
            return Err(ValidationError::InsufficientFunds {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Full check of a transfer against the state of the branch it would enter.
    pub fn validate(tx: &Transaction, ledger: &LedgerState, params: &ConsensusParams) -> Result<()> {
        Self::check_amounts(tx, params)?;
        tx.verify_signature()?;
        if ledger.is_confirmed(&tx.hash()) {
            return Err(ValidationError::DoubleSpend(tx.hash()));
        }
        Self::check_funds(tx, ledger)
    }
}

/// Applies transactions one after another on top of a base ledger,
/// catching spends that are only valid in isolation.
///
/// Used both to validate received blocks and to assemble mined ones.
pub struct SequentialLedger<'a> {
    base: &'a LedgerState,
    scratch: LedgerState,
    seen: HashSet<Hash>,
    fee_recipient: Option<Address>,
}

impl<'a> SequentialLedger<'a> {
    pub fn new(base: &'a LedgerState, fee_recipient: Option<Address>) -> Self {
        Self {
            base,
            scratch: base.clone(),
            seen: HashSet::new(),
            fee_recipient,
        }
    }

    /// Apply the block reward without transfer checks.
    pub fn apply_reward(&mut self, reward: &Transaction) {
        self.seen.insert(reward.hash());
        self.scratch.apply_transaction(reward, None);
    }

    /// Validate `tx` on its own against the base ledger, then against what the
    /// earlier transactions already consumed. Applies it on success.
    pub fn push(&mut self, tx: &Transaction, params: &ConsensusParams) -> Result<()> {
        TransactionValidator::validate(tx, self.base, params)?;

        let hash = tx.hash();
        if self.seen.contains(&hash) {
            return Err(ValidationError::DoubleSpend(hash));
        }
        if TransactionValidator::check_funds(tx, &self.scratch).is_err() {
            return Err(ValidationError::DoubleSpend(hash));
        }

        self.seen.insert(hash);
        self.scratch.apply_transaction(tx, self.fee_recipient);
        Ok(())
    }

    pub fn into_state(self) -> LedgerState {
        self.scratch
    }
}

/// Block validator.
pub struct BlockValidator;

impl BlockValidator {
    /// Previous hash and index must follow the parent.
    pub fn check_linkage(block: &Block, parent: &Block) -> Result<()> {
        let expected_prev = parent.hash();
        let expected_index = parent.index() + 1;
        if block.header.prev_hash != expected_prev || block.index() != expected_index {
            return Err(ValidationError::LinkageMismatch {
                expected_prev,
                expected_index,
            });
        }
        Ok(())
    }

    /// Not before the parent, and not beyond the allowed drift from `now`.
    pub fn check_timestamp(
        block: &Block,
        parent: &Block,
        now: u64,
        params: &ConsensusParams,
    ) -> Result<()> {
        let got = block.header.timestamp;
        if got < parent.header.timestamp {
            return Err(ValidationError::TimestampTooEarly {
                parent: parent.header.timestamp,
                got,
            });
        }
        if got > now.saturating_add(params.max_future_drift) {
            return Err(ValidationError::TimestampTooFuture { now, got });
        }
        Ok(())
    }

    /// Declared difficulty must be the expected one and the hash must meet it.
    pub fn check_proof_of_work(block: &Block, expected_difficulty: u32) -> Result<()> {
        let declared = block.header.difficulty;
        if declared != expected_difficulty {
            return Err(ValidationError::UnexpectedDifficulty {
                expected: expected_difficulty,
                got: declared,
            });
        }
        let hash = block.hash();
        if !hash.meets_difficulty(declared) {
            return Err(ValidationError::DifficultyNotMet {
                required: declared,
                actual: hash.leading_zero_bits(),
            });
        }
        Ok(())
    }

    /// What can be checked without the parent: the hash meets the declared
    /// difficulty (at least [`MIN_DIFFICULTY`]) and the structure is sound.
    pub fn check_detached(block: &Block, params: &ConsensusParams) -> Result<()> {
        let required = block.header.difficulty.max(MIN_DIFFICULTY);
        let hash = block.hash();
        if block.header.difficulty < MIN_DIFFICULTY || !hash.meets_difficulty(required) {
            return Err(ValidationError::DifficultyNotMet {
                required,
                actual: hash.leading_zero_bits(),
            });
        }
        Self::check_structure(block, params)
    }

    /// Merkle root, transaction count and encoded size.
    pub fn check_structure(block: &Block, params: &ConsensusParams) -> Result<()> {
        if !block.verify_merkle_root() {
            return Err(ValidationError::MerkleMismatch);
        }
        if block.tx_count() > params.max_transactions_per_block {
            return Err(ValidationError::TooManyTransactions {
                max: params.max_transactions_per_block,
                got: block.tx_count(),
            });
        }
        let size = block.encoded_size();
        if size > params.max_block_size {
            return Err(ValidationError::BlockTooLarge {
                max: params.max_block_size,
                got: size,
            });
        }
        Ok(())
    }

    /// The first transaction must be the reward for this block and the only one.
    pub fn check_reward(block: &Block, params: &ConsensusParams) -> Result<()> {
        let reward = block
            .reward()
            .ok_or_else(|| ValidationError::InvalidReward("first transaction is not a reward".into()))?;
        if reward.amount != params.mining_reward {
            return Err(ValidationError::InvalidReward(format!(
                "reward is {}, expected {}",
                reward.amount, params.mining_reward
            )));
        }
        if reward.fee != 0 || reward.nonce != block.index() {
            return Err(ValidationError::InvalidReward(
                "reward fee must be zero and nonce must equal the block index".into(),
            ));
        }
        if reward.recipient.is_zero() {
            return Err(ValidationError::InvalidReward("reward paid to the zero address".into()));
        }
        if block.transactions[1..].iter().any(Transaction::is_reward) {
            return Err(ValidationError::InvalidReward("more than one reward transaction".into()));
        }
        Ok(())
    }
}

/// Validate a transaction against the ledger of the branch it would enter.
pub fn validate_transaction(
    tx: &Transaction,
    ledger: &LedgerState,
    params: &ConsensusParams,
) -> Result<()> {
    TransactionValidator::validate(tx, ledger, params)
}

/// Validate `block` as a child of `parent`, where `ledger` is the state after
/// `parent`. Returns the state after `block`.
pub fn validate_block(
    block: &Block,
    parent: &Block,
    expected_difficulty: u32,
    ledger: &LedgerState,
    params: &ConsensusParams,
    now: u64,
) -> Result<LedgerState> {
    BlockValidator::check_linkage(block, parent)?;
    BlockValidator::check_timestamp(block, parent, now, params)?;
    BlockValidator::check_proof_of_work(block, expected_difficulty)?;
    BlockValidator::check_structure(block, params)?;
    BlockValidator::check_reward(block, params)?;

    let reward = &block.transactions[0];
    let mut sequence = SequentialLedger::new(ledger, Some(reward.recipient));
    sequence.apply_reward(reward);
    for tx in &block.transactions[1..] {
        sequence.push(tx, params)?;
    }
    Ok(sequence.into_state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use powchain_core::Keypair;

    const NOW: u64 = 1_700_000_600;

    struct Fixture {
        alice: Keypair,
        miner: Address,
        genesis: Block,
        ledger: LedgerState,
        params: ConsensusParams,
    }

    fn fixture(alice_balance: u64) -> Fixture {
        let alice = Keypair::generate();
        let genesis = Block::genesis(1, &[(alice.address(), alice_balance)]);
        let ledger = LedgerState::replay([&genesis]);
        Fixture {
            alice,
            miner: Address::from_bytes([7u8; 20]),
            genesis,
            ledger,
            params: ConsensusParams::default(),
        }
    }

    fn mine(mut block: Block) -> Block {
        while !block.header.meets_difficulty() {
            block.header.nonce += 1;
        }
        block
    }

    fn child(f: &Fixture, txs: Vec<Transaction>) -> Block {
        let mut all = vec![Transaction::reward(f.miner, f.params.mining_reward, 1, NOW)];
        all.extend(txs);
        mine(Block::new(1, f.genesis.hash(), all, 1, NOW))
    }

    fn transfer(f: &Fixture, amount: u64, fee: u64, nonce: u64) -> Transaction {
        Transaction::transfer(f.alice.address(), Address::from_bytes([2u8; 20]), amount, fee, nonce)
            .signed(&f.alice)
    }

    #[test]
    fn test_valid_transfer() {
        let f = fixture(100);
        let tx = transfer(&f, 90, 10, 0);
        assert!(validate_transaction(&tx, &f.ledger, &f.params).is_ok());
    }

    #[test]
    fn test_malformed_amounts_rejected() {
        let f = fixture(100);
        // A fee-only transfer is well formed.
        let zero = transfer(&f, 0, 1, 0);
        assert_eq!(validate_transaction(&zero, &f.ledger, &f.params), Ok(()));

        let mut params = f.params.clone();
        params.max_amount = 50;
        let large = transfer(&f, 51, 0, 0);
        assert!(matches!(
            validate_transaction(&large, &f.ledger, &params),
            Err(ValidationError::MalformedAmount(_))
        ));

        let mut params = f.params.clone();
        params.max_fee = 5;
        let pricey = transfer(&f, 1, 6, 0);
        assert!(matches!(
            validate_transaction(&pricey, &f.ledger, &params),
            Err(ValidationError::MalformedAmount(_))
        ));

        let reward = Transaction::reward(f.miner, 50, 1, NOW);
        assert!(matches!(
            validate_transaction(&reward, &f.ledger, &f.params),
            Err(ValidationError::MalformedAmount(_))
        ));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let f = fixture(100);
        let mut tx = transfer(&f, 10, 0, 0);
        tx.amount = 11;
        assert!(matches!(
            validate_transaction(&tx, &f.ledger, &f.params),
            Err(ValidationError::InvalidSignature(TransactionError::VerificationFailed))
        ));

        let thief = Keypair::generate();
        let stolen = Transaction::transfer(f.alice.address(), thief.address(), 10, 0, 0).signed(&thief);
        assert!(matches!(
            validate_transaction(&stolen, &f.ledger, &f.params),
            Err(ValidationError::InvalidSignature(TransactionError::KeyMismatch(_)))
        ));
    }

    #[test]
    fn test_insufficient_funds() {
        let f = fixture(100);
        let tx = transfer(&f, 100, 1, 0);
        assert!(matches!(
            validate_transaction(&tx, &f.ledger, &f.params),
            Err(ValidationError::InsufficientFunds { required: 101, available: 100 })
        ));
    }

    #[test]
    fn test_valid_block_returns_next_state() {
        let f = fixture(100);
        let tx = transfer(&f, 40, 2, 0);
        let block = child(&f, vec![tx.clone()]);

        let next = validate_block(&block, &f.genesis, 1, &f.ledger, &f.params, NOW).unwrap();
        assert_eq!(next.balance(&f.alice.address()), 58);
        assert_eq!(next.balance(&f.miner), 52);
        assert!(next.is_confirmed(&tx.hash()));
        // The input ledger is untouched.
        assert_eq!(f.ledger.balance(&f.alice.address()), 100);
    }

    #[test]
    fn test_double_spend_in_one_block() {
        let f = fixture(100);
        let first = transfer(&f, 100, 0, 0);
        let second = transfer(&f, 100, 0, 1);

        let single = child(&f, vec![first.clone()]);
        assert!(validate_block(&single, &f.genesis, 1, &f.ledger, &f.params, NOW).is_ok());

        let both = child(&f, vec![first, second.clone()]);
        assert_eq!(
            validate_block(&both, &f.genesis, 1, &f.ledger, &f.params, NOW),
            Err(ValidationError::DoubleSpend(second.hash()))
        );
    }

    #[test]
    fn test_duplicate_transaction_in_block() {
        let f = fixture(100);
        let tx = transfer(&f, 10, 0, 0);
        let block = child(&f, vec![tx.clone(), tx.clone()]);
        assert_eq!(
            validate_block(&block, &f.genesis, 1, &f.ledger, &f.params, NOW),
            Err(ValidationError::DoubleSpend(tx.hash()))
        );
    }

    #[test]
    fn test_already_confirmed_transaction_rejected() {
        let f = fixture(100);
        let tx = transfer(&f, 10, 0, 0);
        let block = child(&f, vec![tx.clone()]);
        let next = validate_block(&block, &f.genesis, 1, &f.ledger, &f.params, NOW).unwrap();
        assert!(matches!(
            validate_transaction(&tx, &next, &f.params),
            Err(ValidationError::DoubleSpend(_))
        ));
    }

    #[test]
    fn test_linkage_mismatch() {
        let f = fixture(100);
        let reward = Transaction::reward(f.miner, 50, 2, NOW);
        let block = mine(Block::new(2, f.genesis.hash(), vec![reward], 1, NOW));
        assert!(matches!(
            validate_block(&block, &f.genesis, 1, &f.ledger, &f.params, NOW),
            Err(ValidationError::LinkageMismatch { expected_index: 1, .. })
        ));
    }

    #[test]
    fn test_timestamp_bounds() {
        let f = fixture(100);
        let mut early = child(&f, vec![]);
        early.header.timestamp = f.genesis.header.timestamp - 1;
        assert!(matches!(
            BlockValidator::check_timestamp(&early, &f.genesis, NOW, &f.params),
            Err(ValidationError::TimestampTooEarly { .. })
        ));

        let mut future = child(&f, vec![]);
        future.header.timestamp = NOW + f.params.max_future_drift + 1;
        assert!(matches!(
            BlockValidator::check_timestamp(&future, &f.genesis, NOW, &f.params),
            Err(ValidationError::TimestampTooFuture { .. })
        ));
    }

    #[test]
    fn test_difficulty_checks() {
        let f = fixture(100);
        let block = child(&f, vec![]);
        assert!(matches!(
            validate_block(&block, &f.genesis, 2, &f.ledger, &f.params, NOW),
            Err(ValidationError::UnexpectedDifficulty { expected: 2, got: 1 })
        ));

        // Bump the declared difficulty far beyond what the nonce satisfies.
        let mut hard = block.clone();
        hard.header.difficulty = 200;
        assert!(matches!(
            BlockValidator::check_proof_of_work(&hard, 200),
            Err(ValidationError::DifficultyNotMet { required: 200, .. })
        ));
    }

    #[test]
    fn test_merkle_mismatch() {
        let f = fixture(100);
        let mut block = child(&f, vec![transfer(&f, 10, 0, 0)]);
        block.transactions.pop();
        assert_eq!(
            BlockValidator::check_structure(&block, &f.params),
            Err(ValidationError::MerkleMismatch)
        );
    }

    #[test]
    fn test_detached_checks() {
        let f = fixture(100);
        let block = child(&f, vec![]);
        assert_eq!(BlockValidator::check_detached(&block, &f.params), Ok(()));

        let mut free = block.clone();
        free.header.difficulty = 0;
        assert!(matches!(
            BlockValidator::check_detached(&free, &f.params),
            Err(ValidationError::DifficultyNotMet { required: 1, .. })
        ));

        let mut hard = block.clone();
        hard.header.difficulty = 200;
        assert!(matches!(
            BlockValidator::check_detached(&hard, &f.params),
            Err(ValidationError::DifficultyNotMet { required: 200, .. })
        ));

        let mut tampered = block;
        tampered.transactions[0].amount += 1;
        assert_eq!(
            BlockValidator::check_detached(&tampered, &f.params),
            Err(ValidationError::MerkleMismatch)
        );
    }

    #[test]
    fn test_block_limits() {
        let f = fixture(1_000);
        let txs: Vec<_> = (0..3).map(|n| transfer(&f, 1, 0, n)).collect();
        let block = child(&f, txs);

        let mut params = f.params.clone();
        params.max_transactions_per_block = 3;
        assert!(matches!(
            BlockValidator::check_structure(&block, &params),
            Err(ValidationError::TooManyTransactions { max: 3, got: 4 })
        ));

        let mut params = f.params.clone();
        params.max_block_size = 100;
        assert!(matches!(
            BlockValidator::check_structure(&block, &params),
            Err(ValidationError::BlockTooLarge { max: 100, .. })
        ));
    }

    #[test]
    fn test_reward_rules() {
        let f = fixture(100);
        let missing = mine(Block::new(1, f.genesis.hash(), vec![transfer(&f, 1, 0, 0)], 1, NOW));
        assert!(matches!(
            BlockValidator::check_reward(&missing, &f.params),
            Err(ValidationError::InvalidReward(_))
        ));

        let greedy = Transaction::reward(f.miner, f.params.mining_reward + 1, 1, NOW);
        let block = mine(Block::new(1, f.genesis.hash(), vec![greedy], 1, NOW));
        assert!(matches!(
            BlockValidator::check_reward(&block, &f.params),
            Err(ValidationError::InvalidReward(_))
        ));

        let r1 = Transaction::reward(f.miner, f.params.mining_reward, 1, NOW);
        let r2 = Transaction::reward(f.alice.address(), f.params.mining_reward, 1, NOW);
        let block = mine(Block::new(1, f.genesis.hash(), vec![r1, r2], 1, NOW));
        assert!(matches!(
            BlockValidator::check_reward(&block, &f.params),
            Err(ValidationError::InvalidReward(_))
        ));
    }
}
