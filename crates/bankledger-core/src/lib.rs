//! Core types and traits for bankledger storage backends.
//!
//! This crate provides the `Queries` record-store trait, the `Backend` and
//! `Session` transaction seams and the row types they exchange, so storage
//! implementations can live in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{Account, Entry, Transfer, TransferTxResult};
pub use models::write::{
    AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    ListParams, TransferTxParams, UpdateAccountParams,
};
pub use storage::{Backend, Queries, Session, StoreError};
