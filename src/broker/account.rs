//! Seams to the account manager and the cached balance state.
//!
//! Key handling, transaction construction and chain access live behind
//! these traits. The broker only calls [`AccountManager`] after the operator
//! approved a request, and only from the approval controller.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::broker::TransactionPayload;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Account is locked")]
    Locked,

    #[error("No active account")]
    NoActiveAccount,

    #[error("{0}")]
    Failed(String),
}

/// Privileged wallet operations.
#[async_trait]
pub trait AccountManager: Send + Sync {
    async fn active_address(&self) -> Result<String, AccountError>;

    /// Submit a transfer, returning its transaction hash.
    async fn submit_transaction(&self, payload: &TransactionPayload) -> Result<String, AccountError>;

    async fn sign_message(&self, message: &str) -> Result<String, AccountError>;
}

/// Read-only balance state kept fresh by the wallet's own fetchers.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// `None` when nothing is cached for `address`.
    async fn cached_balance(&self, address: &str) -> Result<Option<Decimal>, AccountError>;
}

/// Deterministic single-account manager for local development.
///
/// Hashes and signatures are BLAKE3 digests, stable for the same inputs and
/// obviously not valid on any chain.
pub struct DevAccountManager {
    address: String,
    balance: Decimal,
    nonce: AtomicU64,
}

impl DevAccountManager {
    pub fn new(address: impl Into<String>, balance: Decimal) -> Self {
        Self {
            address: address.into(),
            balance,
            nonce: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl AccountManager for DevAccountManager {
    async fn active_address(&self) -> Result<String, AccountError> {
        if self.address.is_empty() {
            return Err(AccountError::NoActiveAccount);
        }
        Ok(self.address.clone())
    }

    async fn submit_transaction(&self, payload: &TransactionPayload) -> Result<String, AccountError> {
        if payload.amount > self.balance {
            return Err(AccountError::Failed(format!(
                "insufficient funds: balance {} is below {}",
                self.balance, payload.amount
            )));
        }
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);

        let mut hasher = blake3::Hasher::new();
        hasher.update(self.address.as_bytes());
        hasher.update(payload.to.as_bytes());
        hasher.update(payload.amount.to_string().as_bytes());
        if let Some(token) = &payload.token_ref {
            hasher.update(token.as_bytes());
        }
        hasher.update(&nonce.to_le_bytes());
        let hash = format!("0x{}", hasher.finalize().to_hex());

        tracing::info!(to = %payload.to, amount = %payload.amount, %hash, "Dev transaction submitted");
        Ok(hash)
    }

    async fn sign_message(&self, message: &str) -> Result<String, AccountError> {
        let key = blake3::hash(self.address.as_bytes());
        let signature = blake3::keyed_hash(key.as_bytes(), message.as_bytes());
        Ok(format!("0x{}", signature.to_hex()))
    }
}

#[async_trait]
impl BalanceSource for DevAccountManager {
    async fn cached_balance(&self, address: &str) -> Result<Option<Decimal>, AccountError> {
        Ok((address == self.address).then_some(self.balance))
    }
}
