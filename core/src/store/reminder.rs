use super::Ledger;
use crate::{error::BillingResult, types::to_epoch};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Ledger<'_> {
    // ── Expiry reminders ──────────────────────────────────────────

    /// Claim the reminder slot for `client_id` on `day_bucket` (YYYY-MM-DD).
    /// Returns false if a reminder was already recorded for that day.
    pub fn claim_reminder(
        &self,
        client_id: &str,
        day_bucket: &str,
        days_left: i64,
        at: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO expiry_reminders (client_id, day_bucket, days_left, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![client_id, day_bucket, days_left, to_epoch(at)],
        )?;
        Ok(inserted == 1)
    }

    pub fn reminder_count(&self, client_id: &str) -> BillingResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM expiry_reminders WHERE client_id = ?1",
            params![client_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
