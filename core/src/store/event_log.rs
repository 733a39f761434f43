use super::Ledger;
use crate::{
    error::BillingResult,
    event::{BillingEvent, EventLogEntry},
    types::{from_epoch, to_epoch},
};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Ledger<'_> {
    // ── Event log ─────────────────────────────────────────────────

    pub fn append_event(&self, event: &BillingEvent, at: DateTime<Utc>) -> BillingResult<()> {
        let entry = EventLogEntry::from_event(event, at)?;
        self.conn.execute(
            "INSERT INTO event_log (client_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.client_id, entry.event_type, entry.payload, to_epoch(entry.created_at)],
        )?;
        Ok(())
    }

    pub fn events_for_client(&self, client_id: &str) -> BillingResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_id, event_type, payload, created_at
             FROM event_log WHERE client_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![client_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    client_id: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: from_epoch(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, event_type: &str) -> BillingResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
