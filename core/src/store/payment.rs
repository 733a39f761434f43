use super::{constraint_to_invariant, Ledger, PaymentRow};
use crate::{
    error::BillingResult,
    types::{from_epoch, from_minor, parse_column, to_epoch, to_minor, Gateway, Money, PaymentStatus},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const PAYMENT_COLUMNS: &str = "id, tenant_id, gateway, external_reference, amount,
     payer_identifier, client_id, status, failure_reason, raw_payload, received_at, applied_at";

/// Fields written when a callback is first seen.
#[derive(Debug, Clone)]
pub struct NewPayment<'a> {
    pub tenant_id: &'a str,
    pub gateway: Gateway,
    pub external_reference: &'a str,
    pub amount: Option<Money>,
    pub payer_identifier: Option<&'a str>,
    pub status: PaymentStatus,
    pub failure_reason: Option<&'a str>,
    pub raw_payload: &'a str,
    pub received_at: DateTime<Utc>,
}

impl Ledger<'_> {
    // ── Payments ──────────────────────────────────────────────────

    /// Insert the payment unless `(gateway, external_reference)` already
    /// exists, then return whichever row is stored. The second element is
    /// true when this call created the row.
    pub fn claim_payment(&self, p: &NewPayment<'_>) -> BillingResult<(PaymentRow, bool)> {
        let id = uuid::Uuid::new_v4().to_string();
        let inserted = self.conn.execute(
            "INSERT INTO payments
             (id, tenant_id, gateway, external_reference, amount, payer_identifier,
              client_id, status, failure_reason, raw_payload, received_at, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, NULL)
             ON CONFLICT (gateway, external_reference) DO NOTHING",
            params![
                id,
                p.tenant_id,
                p.gateway.as_str(),
                p.external_reference,
                p.amount.map(to_minor).transpose()?,
                p.payer_identifier,
                p.status.as_str(),
                p.failure_reason,
                p.raw_payload,
                to_epoch(p.received_at),
            ],
        )?;
        let row = self
            .payment(p.gateway, p.external_reference)?
            .ok_or_else(|| {
                crate::error::BillingError::InvariantViolation(format!(
                    "payment {}/{} vanished after claim",
                    p.gateway, p.external_reference
                ))
            })?;
        Ok((row, inserted == 1))
    }

    pub fn payment(&self, gateway: Gateway, external_reference: &str)
        -> BillingResult<Option<PaymentRow>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE gateway = ?1 AND external_reference = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![gateway.as_str(), external_reference], map_payment)
            .optional()?;
        Ok(row)
    }

    /// Move a not-yet-applied payment to `status`. Applied rows are
    /// protected by a trigger, so this fails loudly on them.
    pub fn resolve_payment(
        &self,
        payment_id: &str,
        status: PaymentStatus,
        client_id: Option<&str>,
        failure_reason: Option<&str>,
    ) -> BillingResult<()> {
        self.conn
            .execute(
                "UPDATE payments SET status = ?1, client_id = ?2, failure_reason = ?3
                 WHERE id = ?4",
                params![status.as_str(), client_id, failure_reason, payment_id],
            )
            .map_err(|e| constraint_to_invariant(e, "resolve payment"))?;
        Ok(())
    }

    /// Fill in amount and payer from a redelivery when the first delivery
    /// could not supply them. Values already stored are kept.
    pub fn refresh_payment(
        &self,
        payment_id: &str,
        amount: Money,
        payer_identifier: Option<&str>,
    ) -> BillingResult<()> {
        self.conn
            .execute(
                "UPDATE payments SET
                    amount = COALESCE(amount, ?1),
                    payer_identifier = COALESCE(payer_identifier, ?2)
                 WHERE id = ?3",
                params![to_minor(amount)?, payer_identifier, payment_id],
            )
            .map_err(|e| constraint_to_invariant(e, "refresh payment"))?;
        Ok(())
    }

    /// Conditional set to `applied`. Returns false when the row was already
    /// applied or does not exist.
    pub fn mark_payment_applied(&self, payment_id: &str, at: DateTime<Utc>) -> BillingResult<bool> {
        let changed = self.conn.execute(
            "UPDATE payments SET status = 'applied', applied_at = ?1
             WHERE id = ?2 AND status <> 'applied'",
            params![to_epoch(at), payment_id],
        )?;
        Ok(changed == 1)
    }

    pub fn payments_with_status(&self, status: PaymentStatus) -> BillingResult<Vec<PaymentRow>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = ?1
             ORDER BY received_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status.as_str()], map_payment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn payments_for_client(&self, client_id: &str) -> BillingResult<Vec<PaymentRow>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE client_id = ?1
             ORDER BY received_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![client_id], map_payment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn payment_count(&self, gateway: Gateway, external_reference: &str, status: PaymentStatus)
        -> BillingResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM payments
             WHERE gateway = ?1 AND external_reference = ?2 AND status = ?3",
            params![gateway.as_str(), external_reference, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn map_payment(row: &Row<'_>) -> rusqlite::Result<PaymentRow> {
    Ok(PaymentRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        gateway: parse_column(2, row.get(2)?)?,
        external_reference: row.get(3)?,
        amount: row.get::<_, Option<i64>>(4)?.map(from_minor),
        payer_identifier: row.get(5)?,
        client_id: row.get(6)?,
        status: parse_column(7, row.get(7)?)?,
        failure_reason: row.get(8)?,
        raw_payload: row.get(9)?,
        received_at: from_epoch(row.get(10)?),
        applied_at: row.get::<_, Option<i64>>(11)?.map(from_epoch),
    })
}
