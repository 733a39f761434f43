use super::{constraint_to_invariant, Ledger, WalletTxRow};
use crate::{
    error::{BillingError, BillingResult},
    types::{from_epoch, from_minor, parse_column, to_epoch, to_minor, Money, TxKind},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl Ledger<'_> {
    // ── Wallet ledger ─────────────────────────────────────────────

    /// Append a wallet entry and move the materialised balance with it.
    ///
    /// A debit that would take the balance below zero is refused as an
    /// invariant violation. A second entry with the same `(kind, reference)`
    /// is refused the same way.
    pub fn post_wallet_entry(
        &self,
        client_id: &str,
        kind: TxKind,
        amount: Money,
        reference: &str,
        at: DateTime<Utc>,
    ) -> BillingResult<WalletTxRow> {
        let minor = to_minor(amount)?;
        if minor <= 0 {
            return Err(BillingError::InvalidAmount(amount.to_string()));
        }
        let delta = match kind {
            TxKind::Credit => minor,
            TxKind::Debit => -minor,
        };

        let changed = self.conn.execute(
            "UPDATE clients SET wallet_balance = wallet_balance + ?1
             WHERE id = ?2 AND wallet_balance + ?1 >= 0",
            params![delta, client_id],
        )?;
        if changed == 0 {
            let balance: Option<i64> = self
                .conn
                .query_row(
                    "SELECT wallet_balance FROM clients WHERE id = ?1",
                    params![client_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match balance {
                None => BillingError::ClientNotFound {
                    client_id: client_id.to_string(),
                },
                Some(balance) => BillingError::InvariantViolation(format!(
                    "{kind} of {amount} would overdraw client {client_id} (balance {})",
                    from_minor(balance)
                )),
            });
        }

        let balance_after: i64 = self.conn.query_row(
            "SELECT wallet_balance FROM clients WHERE id = ?1",
            params![client_id],
            |row| row.get(0),
        )?;

        let entry = WalletTxRow {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            kind,
            amount: from_minor(minor),
            reference: reference.to_string(),
            balance_after: from_minor(balance_after),
            created_at: at,
        };
        self.conn
            .execute(
                "INSERT INTO wallet_transactions
                 (id, client_id, kind, amount, reference, balance_after, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &entry.id,
                    &entry.client_id,
                    kind.as_str(),
                    minor,
                    &entry.reference,
                    balance_after,
                    to_epoch(at),
                ],
            )
            .map_err(|e| constraint_to_invariant(e, "wallet entry"))?;
        Ok(entry)
    }

    pub fn wallet_entries(&self, client_id: &str) -> BillingResult<Vec<WalletTxRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_id, kind, amount, reference, balance_after, created_at
             FROM wallet_transactions WHERE client_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![client_id], |row| {
                Ok(WalletTxRow {
                    id: row.get(0)?,
                    client_id: row.get(1)?,
                    kind: parse_column(2, row.get(2)?)?,
                    amount: from_minor(row.get(3)?),
                    reference: row.get(4)?,
                    balance_after: from_minor(row.get(5)?),
                    created_at: from_epoch(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Balance recomputed from the ledger. Must equal the stored balance.
    pub fn wallet_fold(&self, client_id: &str) -> BillingResult<Money> {
        let minor: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(CASE kind WHEN 'credit' THEN amount ELSE -amount END), 0)
             FROM wallet_transactions WHERE client_id = ?1",
            params![client_id],
            |row| row.get(0),
        )?;
        Ok(from_minor(minor))
    }

    pub fn wallet_entry_count(&self, client_id: &str, kind: TxKind) -> BillingResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM wallet_transactions WHERE client_id = ?1 AND kind = ?2",
            params![client_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
