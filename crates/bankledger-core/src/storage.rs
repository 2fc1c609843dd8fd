use crate::models::{
    write::{
        AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
        ListParams, UpdateAccountParams,
    },
    Account, Entry, Transfer,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("conflict with a concurrent transaction: {0}")]
    Conflict(String),
    #[error("transaction failure: {0}")]
    Transaction(String),
    #[error("transaction error: {source}, rollback error: {rollback}")]
    Rollback {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        StoreError::NotFound { entity, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Record store: one single-statement accessor per entity operation.
///
/// Implemented by every backend session, transactional or not, so the same
/// accessors run unchanged inside and outside a transaction.
pub trait Queries {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError>;
    fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;
    /// Like `get_account`, but holds the row lock until the enclosing
    /// transaction ends on backends with row-level locking.
    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;
    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError>;
    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError>;
    /// Adds `params.amount` to the stored balance as one read-modify-write
    /// statement and returns the updated row.
    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StoreError>;
    fn delete_account(&mut self, id: i64) -> Result<(), StoreError>;

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError>;
    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;
    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError>;
    fn list_account_entries(&mut self, account_id: i64, params: &ListParams) -> Result<Vec<Entry>, StoreError>;
    fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError>;

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError>;
    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;
    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError>;
}

/// A session with an open transaction.
///
/// Dropping a session without calling `commit` or `rollback` rolls the
/// transaction back.
pub trait Session: Queries {
    fn queries(&mut self) -> &mut dyn Queries;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// A transactional backing store. Every session owns its own connection.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Opens a plain autocommit session.
    fn connect(&self) -> Result<Box<dyn Queries>, StoreError>;
    /// Opens a session and begins a transaction on it.
    fn begin(&self) -> Result<Box<dyn Session>, StoreError>;
}
