use std::sync::Arc;

use bankledger_core::{
    Account, AddAccountBalanceParams, Backend, CreateEntryParams, CreateTransferParams, Queries,
    StoreError, TransferTxParams, TransferTxResult,
};

/// Entry point to the ledger: plain record access plus transactional
/// operations over one backing store.
///
/// Cheap to share across threads; every call opens its own session.
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Opens a session outside any transaction. Each accessor call on it
    /// commits on its own.
    pub fn queries(&self) -> Result<Box<dyn Queries>, StoreError> {
        self.backend.connect()
    }

    /// Runs `work` inside a database transaction.
    ///
    /// The transaction is committed when `work` succeeds and rolled back
    /// when it fails. If the rollback fails as well, both errors are
    /// returned together as [`StoreError::Rollback`].
    pub fn exec_tx<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, StoreError>,
    {
        let mut session = self.backend.begin()?;

        match work(session.queries()) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(backend = self.backend.name(), error = %err, "Rolling back transaction");
                match session.rollback() {
                    Ok(()) => Err(err),
                    Err(rollback) => {
                        tracing::error!(
                            backend = self.backend.name(),
                            error = %err,
                            rollback_error = %rollback,
                            "Rollback failed"
                        );
                        Err(StoreError::Rollback {
                            source: Box::new(err),
                            rollback: Box::new(rollback),
                        })
                    }
                }
            }
        }
    }

    /// Moves `amount` from one account to another.
    ///
    /// Creates the transfer record and both entries, then applies the two
    /// balance deltas, all in one transaction. Balances are updated in
    /// ascending account id order whatever the direction of the transfer,
    /// so concurrent transfers over the same accounts always lock them in
    /// the same order. No overdraft check is made.
    pub fn transfer_tx(&self, params: &TransferTxParams) -> Result<TransferTxResult, StoreError> {
        validate_transfer(params)?;

        let result = self.exec_tx(|q| {
            let transfer = q.create_transfer(&CreateTransferParams {
                from_account_id: params.from_account_id,
                to_account_id: params.to_account_id,
                amount: params.amount,
            })?;

            let from_entry = q.create_entry(&CreateEntryParams {
                account_id: params.from_account_id,
                amount: -params.amount,
            })?;

            let to_entry = q.create_entry(&CreateEntryParams {
                account_id: params.to_account_id,
                amount: params.amount,
            })?;

            let (from_account, to_account) = if params.from_account_id < params.to_account_id {
                add_money(
                    q,
                    params.from_account_id,
                    -params.amount,
                    params.to_account_id,
                    params.amount,
                )?
            } else {
                let (to_account, from_account) = add_money(
                    q,
                    params.to_account_id,
                    params.amount,
                    params.from_account_id,
                    -params.amount,
                )?;
                (from_account, to_account)
            };

            Ok(TransferTxResult {
                transfer,
                from_account,
                to_account,
                from_entry,
                to_entry,
            })
        })?;

        tracing::info!(
            transfer_id = result.transfer.id,
            from_account_id = params.from_account_id,
            to_account_id = params.to_account_id,
            amount = params.amount,
            "Transfer completed"
        );
        Ok(result)
    }
}

fn validate_transfer(params: &TransferTxParams) -> Result<(), StoreError> {
    if params.amount <= 0 {
        return Err(StoreError::InvalidArgument(format!(
            "transfer amount must be positive, got {}",
            params.amount
        )));
    }
    if params.from_account_id == params.to_account_id {
        return Err(StoreError::InvalidArgument(format!(
            "cannot transfer from account {} to itself",
            params.from_account_id
        )));
    }
    Ok(())
}

/// Applies two balance deltas in the given order, first account first.
fn add_money(
    q: &mut dyn Queries,
    first_id: i64,
    first_amount: i64,
    second_id: i64,
    second_amount: i64,
) -> Result<(Account, Account), StoreError> {
    let first = q.add_account_balance(&AddAccountBalanceParams {
        id: first_id,
        amount: first_amount,
    })?;
    let second = q.add_account_balance(&AddAccountBalanceParams {
        id: second_id,
        amount: second_amount,
    })?;
    Ok((first, second))
}
