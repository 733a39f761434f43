//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call `Ledger` methods, they never execute SQL directly.
//!
//! Reads go through `LedgerStore::ledger()`. Multi-statement writes go
//! through `LedgerStore::write()`, which runs the closure inside a
//! `BEGIN IMMEDIATE` transaction: the write lock is taken before the first
//! read, so check-then-set sequences are atomic across connections and
//! processes.

use crate::{
    error::{BillingError, BillingResult},
    types::{ClientId, Gateway, Money, NetworkActionKind, PaymentStatus, TriggeredBy, TxKind},
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod client;
mod event_log;
mod network_action;
mod payment;
mod reminder;
mod wallet;

pub use client::NewClient;
pub use payment::NewPayment;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for a private :memory: database
}

impl LedgerStore {
    /// Open (or create) the database at `path`. Accepts `file:` URIs.
    pub fn open(path: &str) -> BillingResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL only applies to real files; memory databases ignore it.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open a private in-memory database. Other connections cannot see it.
    pub fn in_memory() -> BillingResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a named in-memory database shared by every connection in this
    /// process that uses the same name. Lives while any connection is open.
    pub fn shared_memory(name: &str) -> BillingResult<Self> {
        Self::open(&format!("file:{name}?mode=memory&cache=shared"))
    }

    /// Open another connection to the same database.
    /// A private in-memory store reopens as a fresh, empty database.
    pub fn reopen(&self) -> BillingResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> BillingResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_clients_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_network_audit.sql"))?;
        Ok(())
    }

    pub fn ledger(&self) -> Ledger<'_> {
        Ledger { conn: &self.conn }
    }

    /// Run `f` inside one IMMEDIATE transaction. Any error rolls back.
    pub fn write<T>(&self, f: impl FnOnce(&Ledger<'_>) -> BillingResult<T>) -> BillingResult<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(&Ledger { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }
}

/// Query surface over a connection or an open transaction.
pub struct Ledger<'c> {
    conn: &'c Connection,
}

/// Unique-constraint hits on ledger tables mean a contract was broken.
fn constraint_to_invariant(err: rusqlite::Error, what: &str) -> BillingError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            BillingError::InvariantViolation(format!(
                "{what}: {}",
                msg.as_deref().unwrap_or("constraint violation")
            ))
        }
        _ => BillingError::Database(err),
    }
}

// ── Row structs ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRow {
    pub id: String,
    pub tenant_id: String,
    pub gateway: Gateway,
    pub external_reference: String,
    pub amount: Option<Money>,
    pub payer_identifier: Option<String>,
    pub client_id: Option<ClientId>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub raw_payload: String,
    pub received_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTxRow {
    pub id: String,
    pub client_id: ClientId,
    pub kind: TxKind,
    pub amount: Money,
    pub reference: String,
    pub balance_after: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkActionRow {
    pub id: Option<i64>,
    pub client_id: ClientId,
    pub action: NetworkActionKind,
    pub success: bool,
    pub error_message: Option<String>,
    pub triggered_by: TriggeredBy,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
