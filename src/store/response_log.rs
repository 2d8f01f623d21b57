//! Append-only log of outbound model calls.
//!
//! Rows buffer in memory and reach the store on `flush`. The
//! validator must flush before looking up the row id it stamps: the
//! verdict can only be written once the row exists.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

use super::Store;

/// Terminal verdict stamped on a response-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallResult {
    Success,
    Failed,
}

impl CallResult {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallResult::Success => "SUCCESS",
            CallResult::Failed => "FAILED",
        }
    }
}

/// One persisted record of an outbound model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponseLog {
    pub id: i64,
    pub thread_id: String,
    pub agent_name: Option<String>,
    pub model_name: String,
    pub request_json: Option<String>,
    pub response_json: Option<String>,
    /// `SUCCESS`, `FAILED`, or null while unexamined.
    pub result: Option<String>,
    pub fail_reason: Option<String>,
    pub examined: bool,
    pub ts: String,
}

impl ModelResponseLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            agent_name: row.get("agent_name")?,
            model_name: row.get("model_name")?,
            request_json: row.get("request_json")?,
            response_json: row.get("response_json")?,
            result: row.get("result")?,
            fail_reason: row.get("fail_reason")?,
            examined: row.get("examined")?,
            ts: row.get("ts")?,
        })
    }
}

#[derive(Debug, Clone)]
struct PendingLog {
    thread_id: String,
    agent_name: Option<String>,
    model_name: String,
    request_json: Option<String>,
    response_json: Option<String>,
    ts: String,
}

/// Buffered writer for response-log rows.
///
/// The bridge appends one row per call; appends are cheap and never
/// touch the store. `flush` persists the buffer in append order.
#[derive(Debug, Clone)]
pub struct ResponseLogWriter {
    store: Arc<Store>,
    buffer: Arc<Mutex<Vec<PendingLog>>>,
}

impl ResponseLogWriter {
    /// Writer over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Buffer one call record.
    pub fn append(
        &self,
        thread_id: &str,
        agent_name: Option<&str>,
        model_name: &str,
        request: &Value,
        response: Option<&Value>,
    ) {
        self.buffer.lock().push(PendingLog {
            thread_id: thread_id.to_string(),
            agent_name: agent_name.map(String::from),
            model_name: model_name.to_string(),
            request_json: Some(request.to_string()),
            response_json: response.map(|r| r.to_string()),
            ts: Store::now(),
        });
    }

    /// Persist every buffered row, in append order.
    pub fn flush(&self) -> Result<()> {
        let pending: Vec<PendingLog> = std::mem::take(&mut *self.buffer.lock());
        if pending.is_empty() {
            return Ok(());
        }
        self.store.with_tx(|tx| {
            for row in &pending {
                tx.execute(
                    "INSERT INTO model_response_log
                         (thread_id, agent_name, model_name, request_json, response_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.thread_id,
                        row.agent_name,
                        row.model_name,
                        row.request_json,
                        row.response_json,
                        row.ts,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Flush, then return the id of the latest persisted row for a
    /// thread scope. The validator stamps its verdict on this row.
    pub fn flush_and_last_id(&self, thread_id: &str) -> Result<Option<i64>> {
        self.flush()?;
        self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM model_response_log
                     WHERE thread_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }
}

impl Store {
    /// Stamp a response-log row with its verdict and mark it examined.
    pub fn stamp_response_log(
        &self,
        log_id: i64,
        result: CallResult,
        fail_reason: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE model_response_log
                 SET result = ?1, fail_reason = ?2, examined = 1
                 WHERE id = ?3",
                params![result.as_str(), fail_reason, log_id],
            )?;
            Ok(())
        })
    }

    /// Fetch a log row by id.
    pub fn response_log_by_id(&self, id: i64) -> Result<Option<ModelResponseLog>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM model_response_log WHERE id = ?1",
                    params![id],
                    ModelResponseLog::from_row,
                )
                .optional()?)
        })
    }

    /// Every log row of a thread, in append order.
    pub fn response_logs_for_thread(&self, thread_id: &str) -> Result<Vec<ModelResponseLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM model_response_log WHERE thread_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![thread_id], ModelResponseLog::from_row)?;
            let mut logs = Vec::new();
            for row in rows {
                logs.push(row?);
            }
            Ok(logs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_does_not_touch_store_until_flush() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = ResponseLogWriter::new(store.clone());
        writer.append("t1", Some("W1"), "m1", &json!({"r": 1}), None);

        assert!(store.response_logs_for_thread("t1").unwrap().is_empty());
        writer.flush().unwrap();
        assert_eq!(store.response_logs_for_thread("t1").unwrap().len(), 1);
    }

    #[test]
    fn test_rows_keep_append_order_per_thread() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = ResponseLogWriter::new(store.clone());
        writer.append("t1", None, "m1", &json!({"n": 1}), None);
        writer.append("t1", None, "m1", &json!({"n": 2}), None);
        writer.flush().unwrap();

        let logs = store.response_logs_for_thread("t1").unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].id < logs[1].id);
        assert!(logs[0].request_json.as_ref().unwrap().contains("1"));
    }

    #[test]
    fn test_flush_and_last_id_scopes_by_thread() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = ResponseLogWriter::new(store.clone());
        writer.append("t1", None, "m1", &json!({}), None);
        writer.append("t2", None, "m2", &json!({}), None);
        writer.append("t1", None, "m1", &json!({}), None);

        let last_t1 = writer.flush_and_last_id("t1").unwrap().unwrap();
        let logs = store.response_logs_for_thread("t1").unwrap();
        assert_eq!(last_t1, logs.last().unwrap().id);
        assert!(writer.flush_and_last_id("t3").unwrap().is_none());
    }

    #[test]
    fn test_stamp_marks_examined() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = ResponseLogWriter::new(store.clone());
        writer.append("t1", Some("W1"), "m1", &json!({}), Some(&json!({"ok": true})));
        let id = writer.flush_and_last_id("t1").unwrap().unwrap();

        store
            .stamp_response_log(id, CallResult::Failed, Some("empty_response"))
            .unwrap();

        let row = store.response_log_by_id(id).unwrap().unwrap();
        assert!(row.examined);
        assert_eq!(row.result.as_deref(), Some("FAILED"));
        assert_eq!(row.fail_reason.as_deref(), Some("empty_response"));
    }

    #[test]
    fn test_double_flush_is_harmless() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let writer = ResponseLogWriter::new(store.clone());
        writer.append("t1", None, "m1", &json!({}), None);
        writer.flush().unwrap();
        writer.flush().unwrap();
        assert_eq!(store.response_logs_for_thread("t1").unwrap().len(), 1);
    }
}
