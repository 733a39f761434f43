use super::Ledger;
use crate::{
    error::{BillingError, BillingResult},
    lifecycle::Client,
    types::{
        from_epoch, from_minor, parse_column, to_epoch, to_minor, Money, TenantId,
    },
};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Registration data for a new (pending) client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClient {
    pub tenant_id: TenantId,
    pub full_name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    pub billing_reference: String,
    pub package_speed: String,
    pub monthly_rate: Money,
}

const CLIENT_COLUMNS: &str = "id, tenant_id, full_name, phone, email, billing_reference,
     package_speed, status, wallet_balance, monthly_rate, subscription_end_date,
     approved_by, approved_at, rejection_reason, created_at, updated_at";

impl Ledger<'_> {
    // ── Client ────────────────────────────────────────────────────

    pub fn insert_client(&self, c: &Client) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO clients (
                id, tenant_id, full_name, phone, email, billing_reference,
                package_speed, status, wallet_balance, monthly_rate, subscription_end_date,
                approved_by, approved_at, rejection_reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                &c.id,
                &c.tenant_id,
                &c.full_name,
                &c.phone,
                &c.email,
                &c.billing_reference,
                &c.package_speed,
                c.status.as_str(),
                to_minor(c.wallet_balance)?,
                to_minor(c.monthly_rate)?,
                c.subscription_end_date.map(to_epoch),
                &c.approved_by,
                c.approved_at.map(to_epoch),
                &c.rejection_reason,
                to_epoch(c.created_at),
                to_epoch(c.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn client(&self, client_id: &str) -> BillingResult<Option<Client>> {
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1");
        let client = self
            .conn
            .query_row(&sql, params![client_id], map_client)
            .optional()?;
        Ok(client)
    }

    pub fn require_client(&self, client_id: &str) -> BillingResult<Client> {
        self.client(client_id)?
            .ok_or_else(|| BillingError::ClientNotFound {
                client_id: client_id.to_string(),
            })
    }

    pub fn find_client_by_billing_reference(
        &self,
        tenant_id: &str,
        billing_reference: &str,
    ) -> BillingResult<Option<Client>> {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients
             WHERE tenant_id = ?1 AND billing_reference = ?2"
        );
        let client = self
            .conn
            .query_row(&sql, params![tenant_id, billing_reference.trim()], map_client)
            .optional()?;
        Ok(client)
    }

    /// Phone numbers are not unique; callers decide what ambiguity means.
    pub fn find_clients_by_phone(&self, tenant_id: &str, phone: &str) -> BillingResult<Vec<Client>> {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients
             WHERE tenant_id = ?1 AND phone = ?2
             ORDER BY created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![tenant_id, phone], map_client)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clients the renewal sweep evaluates, soonest expiry first.
    pub fn billable_clients(&self) -> BillingResult<Vec<Client>> {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients
             WHERE status IN ('active','suspended') AND subscription_end_date IS NOT NULL
             ORDER BY subscription_end_date ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_client)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Write the lifecycle fields of `after`, but only if the stored row
    /// still has the status `before` was read with and the balance `after`
    /// expects (wallet entries are posted first and move the balance).
    pub fn save_transition(&self, before: &Client, after: &Client) -> BillingResult<()> {
        let changed = self.conn.execute(
            "UPDATE clients SET
                status = ?1, monthly_rate = ?2, package_speed = ?3,
                subscription_end_date = ?4, approved_by = ?5, approved_at = ?6,
                rejection_reason = ?7, updated_at = ?8
             WHERE id = ?9 AND status = ?10 AND wallet_balance = ?11",
            params![
                after.status.as_str(),
                to_minor(after.monthly_rate)?,
                &after.package_speed,
                after.subscription_end_date.map(to_epoch),
                &after.approved_by,
                after.approved_at.map(to_epoch),
                &after.rejection_reason,
                to_epoch(after.updated_at),
                &before.id,
                before.status.as_str(),
                to_minor(after.wallet_balance)?,
            ],
        )?;
        if changed == 0 {
            return Err(BillingError::Conflict {
                client_id: before.id.clone(),
            });
        }
        Ok(())
    }
}

fn map_client(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        full_name: row.get(2)?,
        phone: row.get(3)?,
        email: row.get(4)?,
        billing_reference: row.get(5)?,
        package_speed: row.get(6)?,
        status: parse_column(7, row.get(7)?)?,
        wallet_balance: from_minor(row.get(8)?),
        monthly_rate: from_minor(row.get(9)?),
        subscription_end_date: row.get::<_, Option<i64>>(10)?.map(from_epoch),
        approved_by: row.get(11)?,
        approved_at: row.get::<_, Option<i64>>(12)?.map(from_epoch),
        rejection_reason: row.get(13)?,
        created_at: from_epoch(row.get(14)?),
        updated_at: from_epoch(row.get(15)?),
    })
}
