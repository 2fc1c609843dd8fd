//! SQLite storage backend for bankledger.
//!
//! Every session opens its own connection to the database file. SQLite locks
//! the whole database for writing, so transactions begin with
//! `BEGIN IMMEDIATE` and wait up to the busy timeout for the write lock.

use std::{path::PathBuf, time::Duration};

use bankledger_core::{
    Account, AddAccountBalanceParams, Backend, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListParams, Queries, Session, StoreError, Transfer,
    UpdateAccountParams,
};
use rusqlite::{params, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn with_busy_timeout(path: &str, busy_timeout: Duration) -> Result<Self, StoreError> {
        // each session needs its own connection to the same data
        if path == ":memory:" || path.is_empty() {
            return Err(StoreError::Config(
                "sqlite backend needs a database file path".to_string(),
            ));
        }

        let backend = Self {
            path: PathBuf::from(path),
            busy_timeout,
        };
        let conn = backend.open()?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(map_err)?;
        tracing::debug!(path = %backend.path.display(), journal_mode = %mode, "SQLite database opened");
        init_schema(&conn)?;
        Ok(backend)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(map_err)?;
        conn.busy_timeout(self.busy_timeout).map_err(map_err)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(map_err)?;
        Ok(conn)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner TEXT NOT NULL,
            balance INTEGER NOT NULL,
            currency TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        );

        CREATE TABLE IF NOT EXISTS transfers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_account_id INTEGER NOT NULL,
            to_account_id INTEGER NOT NULL,
            amount INTEGER NOT NULL CHECK (amount > 0),
            created_at TEXT NOT NULL,
            FOREIGN KEY (from_account_id) REFERENCES accounts(id),
            FOREIGN KEY (to_account_id) REFERENCES accounts(id)
        );

        CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
        CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
        CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_account_id);
        CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_account_id);
        CREATE INDEX IF NOT EXISTS idx_transfers_pair
            ON transfers(from_account_id, to_account_id);
        ",
    )
    .map_err(map_err)?;
    Ok(())
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self) -> Result<Box<dyn Queries>, StoreError> {
        Ok(Box::new(SqliteSession {
            conn: self.open()?,
            in_tx: false,
        }))
    }

    fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        let conn = self.open()?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(begin_err)?;
        tracing::debug!(path = %self.path.display(), "SQLite transaction started");
        Ok(Box::new(SqliteSession { conn, in_tx: true }))
    }
}

pub struct SqliteSession {
    conn: Connection,
    in_tx: bool,
}

impl SqliteSession {
    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        if !self.in_tx {
            return Err(StoreError::Transaction("no active transaction".to_string()));
        }
        self.in_tx = false;
        self.conn
            .execute_batch(sql)
            .map_err(|e| StoreError::Transaction(format!("{} failed: {}", sql, e)))
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.in_tx {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "SQLite rollback of abandoned transaction failed");
            } else {
                tracing::debug!("SQLite abandoned transaction rolled back");
            }
        }
    }
}

impl Session for SqliteSession {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")?;
        tracing::debug!("SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")?;
        tracing::debug!("SQLite transaction rolled back");
        Ok(())
    }
}

fn map_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation => StoreError::ConstraintViolation(e.to_string()),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::Conflict(e.to_string())
            }
            _ => StoreError::Other(e.to_string()),
        },
        _ => StoreError::Other(e.to_string()),
    }
}

// waiting for the write lock happens here, so busy stays a conflict
fn begin_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => map_err(e),
        _ => StoreError::Transaction(format!("begin failed: {}", e)),
    }
}

fn now_to_str() -> Result<String, StoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| StoreError::Other(format!("Invalid timestamp: {}", e)))
}

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let s: String = row.get(idx)?;
    OffsetDateTime::parse(&s, &Rfc3339)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        created_at: timestamp_at(row, 3)?,
    })
}

fn transfer_from_row(row: &Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        from_account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
    })
}

impl SqliteSession {
    fn fetch_account(&self, id: i64) -> Result<Account, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    fn fetch_list<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        mapper: fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let mut stmt = self.conn.prepare(sql).map_err(map_err)?;
        let rows = stmt.query_map(params, mapper).map_err(map_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_err)
    }
}

impl Queries for SqliteSession {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency, created_at)
                     VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.owner, params.balance, params.currency, now_to_str()?],
                account_from_row,
            )
            .map_err(map_err)
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.fetch_account(id)
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        // the IMMEDIATE transaction already holds the database write lock
        self.fetch_account(id)
    }

    fn list_accounts(&mut self, params: &ListParams) -> Result<Vec<Account>, StoreError> {
        self.fetch_list(
            &format!(
                "SELECT {} FROM accounts ORDER BY id LIMIT ?1 OFFSET ?2",
                ACCOUNT_COLUMNS
            ),
            params![params.limit, params.offset],
            account_from_row,
        )
    }

    fn update_account(&mut self, params: &UpdateAccountParams) -> Result<Account, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = ?2 WHERE id = ?1 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.id, params.balance],
                account_from_row,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StoreError::not_found("account", params.id))
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = balance + ?2 WHERE id = ?1 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.id, params.amount],
                account_from_row,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StoreError::not_found("account", params.id))
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(map_err)?;
        if deleted == 0 {
            return Err(StoreError::not_found("account", id));
        }
        Ok(())
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO entries (account_id, amount, created_at)
                     VALUES (?1, ?2, ?3) RETURNING {}",
                    ENTRY_COLUMNS
                ),
                params![params.account_id, params.amount, now_to_str()?],
                entry_from_row,
            )
            .map_err(map_err)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StoreError::not_found("entry", id))
    }

    fn list_entries(&mut self, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        self.fetch_list(
            &format!(
                "SELECT {} FROM entries ORDER BY id LIMIT ?1 OFFSET ?2",
                ENTRY_COLUMNS
            ),
            params![params.limit, params.offset],
            entry_from_row,
        )
    }

    fn list_account_entries(&mut self, account_id: i64, params: &ListParams) -> Result<Vec<Entry>, StoreError> {
        self.fetch_list(
            &format!(
                "SELECT {} FROM entries WHERE account_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                ENTRY_COLUMNS
            ),
            params![account_id, params.limit, params.offset],
            entry_from_row,
        )
    }

    fn sum_account_entries(&mut self, account_id: i64) -> Result<i64, StoreError> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM entries WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .map_err(map_err)
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at)
                     VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                params![
                    params.from_account_id,
                    params.to_account_id,
                    params.amount,
                    now_to_str()?
                ],
                transfer_from_row,
            )
            .map_err(map_err)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS),
                params![id],
                transfer_from_row,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StoreError::not_found("transfer", id))
    }

    fn list_transfers(&mut self, params: &ListParams) -> Result<Vec<Transfer>, StoreError> {
        self.fetch_list(
            &format!(
                "SELECT {} FROM transfers ORDER BY id LIMIT ?1 OFFSET ?2",
                TRANSFER_COLUMNS
            ),
            params![params.limit, params.offset],
            transfer_from_row,
        )
    }
}
