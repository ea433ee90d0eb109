//! Account records held in the world state.

use crate::core::validator::ValidationError;
use serde::{Deserialize, Serialize};

/// Balance and nonce of a single account.
///
/// Accounts exist implicitly: an absent key behaves as a zero account, and
/// a record is only materialized on its first credit or authored
/// transaction. Accounts are never deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Spendable balance in base units.
    pub balance: u64,
    /// Next expected transaction index for this account.
    pub nonce: u64,
}

impl Account {
    /// Creates an account with the given balance and a zero nonce.
    pub fn with_balance(balance: u64) -> Self {
        Self { balance, nonce: 0 }
    }

    /// Adds `amount` to the balance, rejecting overflow.
    pub fn credit(&mut self, amount: u64) -> Result<(), ValidationError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| ValidationError::ConsensusViolation("balance overflow".into()))?;
        Ok(())
    }

    /// Removes `amount` from the balance, rejecting underflow.
    pub fn debit(&mut self, amount: u64) -> Result<(), ValidationError> {
        self.balance =
            self.balance
                .checked_sub(amount)
                .ok_or(ValidationError::InsufficientBalance {
                    needed: amount,
                    available: self.balance,
                })?;
        Ok(())
    }

    /// Advances the nonce after a confirmed authored transaction.
    pub fn bump_nonce(&mut self) {
        self.nonce += 1;
    }
}
