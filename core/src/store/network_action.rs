use super::{Ledger, NetworkActionRow};
use crate::{
    error::BillingResult,
    types::{from_epoch, parse_column, to_epoch},
};
use rusqlite::{params, OptionalExtension, Row};

const ACTION_COLUMNS: &str =
    "id, client_id, action, success, error_message, triggered_by, attempts, created_at";

impl Ledger<'_> {
    // ── Network actions ───────────────────────────────────────────

    pub fn insert_network_action(&self, a: &NetworkActionRow) -> BillingResult<i64> {
        self.conn.execute(
            "INSERT INTO network_actions
             (client_id, action, success, error_message, triggered_by, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &a.client_id,
                a.action.as_str(),
                a.success,
                &a.error_message,
                a.triggered_by.as_str(),
                a.attempts,
                to_epoch(a.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest first.
    pub fn network_actions_for(&self, client_id: &str) -> BillingResult<Vec<NetworkActionRow>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM network_actions WHERE client_id = ?1 ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![client_id], map_action)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_network_action(&self, client_id: &str) -> BillingResult<Option<NetworkActionRow>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM network_actions WHERE client_id = ?1
             ORDER BY id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![client_id], map_action)
            .optional()?;
        Ok(row)
    }

    /// Failed commands not yet superseded by a later command of the same
    /// family. Connect/disconnect and bandwidth are tracked apart, so a
    /// failed reconnect stays outstanding after a successful bandwidth push.
    pub fn unresolved_failed_actions(&self) -> BillingResult<Vec<NetworkActionRow>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM network_actions
             WHERE id IN (
                 SELECT MAX(id) FROM network_actions
                 GROUP BY client_id,
                          CASE action WHEN 'update_bandwidth' THEN 'bandwidth' ELSE 'access' END
             )
               AND success = 0
             ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_action)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn map_action(row: &Row<'_>) -> rusqlite::Result<NetworkActionRow> {
    Ok(NetworkActionRow {
        id: Some(row.get(0)?),
        client_id: row.get(1)?,
        action: parse_column(2, row.get(2)?)?,
        success: row.get(3)?,
        error_message: row.get(4)?,
        triggered_by: parse_column(5, row.get(5)?)?,
        attempts: row.get(6)?,
        created_at: from_epoch(row.get(7)?),
    })
}
