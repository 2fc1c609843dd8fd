//! Transactional core of a double-entry banking ledger.
//!
//! [`Store`] moves money between accounts with [`Store::transfer_tx`] and
//! exposes the record accessors of the configured backend through
//! [`Store::queries`] (autocommit) and [`Store::exec_tx`] (one transaction).

pub mod config;
pub mod store;

pub use bankledger_core::{
    Account, AddAccountBalanceParams, Backend, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListParams, Queries, Session, StoreError, Transfer,
    TransferTxParams, TransferTxResult, UpdateAccountParams,
};
pub use bankledger_postgres::PostgresBackend;
pub use bankledger_sqlite::SqliteBackend;
pub use store::Store;
