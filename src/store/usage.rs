//! Monthly usage accounting and the numerator.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::Store;

/// Per-month token and cost counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageState {
    pub month: String,
    pub tokens_this_run: i64,
    pub tokens_this_month: i64,
    pub cost_this_month: f64,
}

/// Current month key, `YYYY-MM` in UTC.
pub fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

impl Store {
    /// Accumulate tokens and cost into the current month's row.
    pub fn add_usage(&self, month: &str, tokens: i64, cost: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_state (month, tokens_this_run, tokens_this_month, cost_this_month)
                 VALUES (?1, ?2, ?2, ?3)
                 ON CONFLICT(month) DO UPDATE SET
                     tokens_this_run = tokens_this_run + excluded.tokens_this_run,
                     tokens_this_month = tokens_this_month + excluded.tokens_this_month,
                     cost_this_month = cost_this_month + excluded.cost_this_month",
                params![month, tokens, cost],
            )?;
            Ok(())
        })
    }

    /// Reset the per-run counter for a month (process start).
    pub fn reset_run_usage(&self, month: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE usage_state SET tokens_this_run = 0 WHERE month = ?1",
                params![month],
            )?;
            Ok(())
        })
    }

    /// Usage counters for a month, if any were recorded.
    pub fn usage_for_month(&self, month: &str) -> Result<Option<UsageState>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT month, tokens_this_run, tokens_this_month, cost_this_month
                     FROM usage_state WHERE month = ?1",
                    params![month],
                    |row| {
                        Ok(UsageState {
                            month: row.get(0)?,
                            tokens_this_run: row.get(1)?,
                            tokens_this_month: row.get(2)?,
                            cost_this_month: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Mint the next stable story correlation id.
    pub fn mint_story_id(&self) -> Result<i64> {
        self.next_number("story_id")
    }

    /// Mint the next integer for a numerator key, starting at 1.
    ///
    /// Used for stable `story_id` values and thread-scope numbers that
    /// must not depend on row ids.
    pub fn next_number(&self, key: &str) -> Result<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO numerator_state (key, value) VALUES (?1, 1)
                 ON CONFLICT(key) DO UPDATE SET value = value + 1",
                params![key],
            )?;
            let value = tx.query_row(
                "SELECT value FROM numerator_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(value)
        })
    }
}
