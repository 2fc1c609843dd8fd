//! PostgreSQL storage backend for bankledger.
//!
//! Every session opens its own connection. Balance updates take row locks,
//! so concurrent transfers only serialize on the accounts they share.

use bankledger_core::{
    Account, AddAccountBalanceParams, Backend, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListParams, Queries, Session, StoreError, Transfer,
    UpdateAccountParams,
};
use std::time::Duration;

use postgres::{error::SqlState, Client, Config, NoTls, Row};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

// serializes concurrent schema creation from several processes
const SCHEMA_LOCK_KEY: i64 = 0x62616e6b;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PostgresBackend {
    config: Config,
    lock_timeout: Duration,
}

impl PostgresBackend {
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        Self::with_lock_timeout(connection_string, DEFAULT_LOCK_TIMEOUT)
    }

    /// A zero `lock_timeout` lets transactions wait for row locks without limit.
    pub fn with_lock_timeout(
        connection_string: &str,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let config = connection_string
            .parse::<Config>()
            .map_err(|e| StoreError::Config(format!("invalid PostgreSQL connection string: {}", e)))?;

        let backend = Self { config, lock_timeout };
        let mut client = backend.open()?;
        init_schema(&mut client)?;
        Ok(backend)
    }

    fn open(&self) -> Result<Client, StoreError> {
        self.config
            .connect(NoTls)
            .map_err(|e| StoreError::Other(format!("PostgreSQL connection failed: {}", e)))
    }
}

fn init_schema(client: &mut Client) -> Result<(), StoreError> {
    client
        .batch_execute(&format!(
            "
            BEGIN;
            SELECT pg_advisory_xact_lock({});

            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                owner TEXT NOT NULL,
                balance BIGINT NOT NULL,
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS entries (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                from_account_id BIGINT NOT NULL REFERENCES accounts(id),
                to_account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_pair
                ON transfers(from_account_id, to_account_id);

            COMMIT;
            ",
            SCHEMA_LOCK_KEY
        ))
        .map_err(map_err)?;
    Ok(())
}

impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn connect(&self) -> Result<Box<dyn Queries>, StoreError> {
        Ok(Box::new(PostgresSession {
            client: self.open()?,
            in_tx: false,
        }))
    }

    fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        let mut client = self.open()?;
        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL READ COMMITTED; SET LOCAL lock_timeout = {};",
                self.lock_timeout.as_millis()
            ))
            .map_err(|e| StoreError::Transaction(format!("begin failed: {}", e)))?;
        tracing::debug!(
            lock_timeout_ms = self.lock_timeout.as_millis() as u64,
            "PostgreSQL transaction started"
        );
        Ok(Box::new(PostgresSession { client, in_tx: true }))
    }
}

pub struct PostgresSession {
    client: Client,
    in_tx: bool,
}

impl PostgresSession {
    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::Transaction("no active transaction".to_string()));
        }
        self.in_tx = false;
        self.client
            .batch_execute(sql)
            .map_err(|e| StoreError::Transaction(format!("{} failed: {}", sql, e)))
    }

    fn fetch_one<T>(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        mapper: fn(&Row) -> Result<T, postgres::Error>,
    ) -> Result<T, StoreError> {
        let row = self.client.query_one(sql, params).map_err(map_err)?;
        mapper(&row).map_err(map_err)
    }

    fn fetch_opt<T>(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        mapper: fn(&Row) -> Result<T, postgres::Error>,
    ) -> Result<Option<T>, StoreError> {
        match self.client.query_opt(sql, params).map_err(map_err)? {
            Some(row) => mapper(&row).map(Some).map_err(map_err),
            None => Ok(None),
        }
    }

    fn fetch_list<T>(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        mapper: fn(&Row) -> Result<T, postgres::Error>,
    ) -> Result<Vec<T>, StoreError> {
        let rows = self.client.query(sql, params).map_err(map_err)?;
        rows.iter()
            .map(mapper)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if self.in_tx {
            if let Err(e) = self.client.batch_execute("ROLLBACK") {
                tracing::warn!(error = %e, "PostgreSQL rollback of abandoned transaction failed");
            } else {
                tracing::debug!("PostgreSQL abandoned transaction rolled back");
            }
        }
    }
}

impl Session for PostgresSession {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")?;
        tracing::debug!("PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")?;
        tracing::debug!("PostgreSQL transaction rolled back");
        Ok(())
    }
}

fn map_err(e: postgres::Error) -> StoreError {
    match e.code() {
        Some(code) if code.code().starts_with("23") => StoreError::ConstraintViolation(e.to_string()),
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::LOCK_NOT_AVAILABLE
                || *code == SqlState::QUERY_CANCELED =>
        {
            StoreError::Conflict(e.to_string())
        }
        _ => StoreError::Other(e.to_string()),
    }
}

fn limit_offset(params: &ListParams) -> (i64, i64) {
    (i64::from(params.limit), i64::from(params.offset))
}

fn account_from_row(row: &Row) -> Result<Account, postgres::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency: row.try_get("currency")?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &Row) -> Result<Entry, postgres::Error> {
    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &Row) -> Result<Transfer, postgres::Error> {
    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Queries for PostgresSession {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        self.fetch_one(
            &format!(
                "INSERT INTO accounts (owner, balance, currency)
                 VALUES ($1, $2, $3) RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            &[&params.owner, &params.balance, &params.currency],
            account_from_row,
        )
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.fetch_opt(
            &format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS),
            &[&id],
            account_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("account", id))
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.fetch_opt(
            &format!(
                "SELECT {} FROM accounts WHERE id = $1 FOR NO KEY UPDATE",
                ACCOUNT_COLUMNS
            ),
            &[&id],
            account_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("account", id))
    }

    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError> {
        let (limit, offset) = limit_offset(params);
        self.fetch_list(
            &format!(
                "SELECT {} FROM accounts ORDER BY id LIMIT $1 OFFSET $2",
                ACCOUNT_COLUMNS
            ),
            &[&limit, &offset],
            account_from_row,
        )
    }

    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError> {
        self.fetch_opt(
            &format!(
                "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            &[&params.id, &params.balance],
            account_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("account", params.id))
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StoreError> {
        self.fetch_opt(
            &format!(
                "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {}",
                ACCOUNT_COLUMNS
            ),
            &[&params.id, &params.amount],
            account_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("account", params.id))
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM accounts WHERE id = $1", &[&id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::not_found("account", id));
        }
        Ok(())
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError> {
        self.fetch_one(
            &format!(
                "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
                ENTRY_COLUMNS
            ),
            &[&params.account_id, &params.amount],
            entry_from_row,
        )
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.fetch_opt(
            &format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS),
            &[&id],
            entry_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("entry", id))
    }

    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        let (limit, offset) = limit_offset(params);
        self.fetch_list(
            &format!(
                "SELECT {} FROM entries ORDER BY id LIMIT $1 OFFSET $2",
                ENTRY_COLUMNS
            ),
            &[&limit, &offset],
            entry_from_row,
        )
    }

    fn list_account_entries(&mut self, account_id: i64, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        let (limit, offset) = limit_offset(params);
        self.fetch_list(
            &format!(
                "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
                ENTRY_COLUMNS
            ),
            &[&account_id, &limit, &offset],
            entry_from_row,
        )
    }

    fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError> {
        // SUM(BIGINT) yields NUMERIC
        self.fetch_one(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT AS total FROM entries WHERE account_id = $1",
            &[&account_id],
            |row| row.try_get("total"),
        )
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError> {
        self.fetch_one(
            &format!(
                "INSERT INTO transfers (from_account_id, to_account_id, amount)
                 VALUES ($1, $2, $3) RETURNING {}",
                TRANSFER_COLUMNS
            ),
            &[&params.from_account_id, &params.to_account_id, &params.amount],
            transfer_from_row,
        )
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.fetch_opt(
            &format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS),
            &[&id],
            transfer_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("transfer", id))
    }

    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError> {
        let (limit, offset) = limit_offset(params);
        self.fetch_list(
            &format!(
                "SELECT {} FROM transfers ORDER BY id LIMIT $1 OFFSET $2",
                TRANSFER_COLUMNS
            ),
            &[&limit, &offset],
            transfer_from_row,
        )
    }
}
