use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{types::Value as SqlValue, Connection, InterruptHandle, OpenFlags};
use serde_json::{json, Value};
use tracing::info;

use super::{ColumnInfo, ColumnType, Row, TableStore};

/// Table store backed by an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteTableStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

#[derive(Default)]
struct CallState {
    cancelled: bool,
    running: bool,
}

/// Interrupts the statement of a call whose caller stopped waiting, so the
/// blocking task gives the connection back instead of running to the end.
struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    call: Arc<Mutex<CallState>>,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Ok(mut state) = self.call.lock() {
            state.cancelled = true;
            if state.running {
                self.handle.interrupt();
            }
        }
    }
}

fn begin(call: &Mutex<CallState>) -> Result<()> {
    let mut state = call
        .lock()
        .map_err(|_| anyhow!("call state lock poisoned"))?;
    if state.cancelled {
        bail!("call cancelled before it started");
    }
    state.running = true;
    Ok(())
}

fn finish(call: &Mutex<CallState>) {
    if let Ok(mut state) = call.lock() {
        state.running = false;
    }
}

impl SqliteTableStore {
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )
        .with_context(|| format!("failed to open {}", path.display()))?;
        info!(path = %path.display(), "Opened table store");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    /// Runs `f` on the blocking pool. Dropping the returned future while `f`
    /// runs interrupts its statement; dropping it earlier skips `f`.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let call = Arc::new(Mutex::new(CallState::default()));
        let _interrupt = InterruptOnDrop {
            handle: Arc::clone(&self.interrupt),
            call: Arc::clone(&call),
        };
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("table store connection lock poisoned"))?;
            begin(&call)?;
            let result = f(&guard);
            // Cleared while the connection is still held, so a late
            // interrupt cannot reach the next caller's statement.
            finish(&call);
            result
        })
        .await?
    }
}

#[async_trait]
impl TableStore for SqliteTableStore {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        self.with_conn(move |conn| query_rows(conn, &sql)).await
    }

    async fn schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let pragma = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
            let mut stmt = conn.prepare(&pragma)?;
            let columns = stmt
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let declared: String = row.get(2)?;
                    Ok(ColumnInfo {
                        name,
                        data_type: ColumnType::from_declared(&declared),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if columns.is_empty() {
                bail!("no such table: {table}");
            }
            Ok(columns)
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names = stmt
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, name) in column_names.iter().enumerate() {
            let value = row.get::<usize, SqlValue>(index)?;
            record.insert(name.clone(), json_value(value));
        }
        records.push(record);
    }
    Ok(records)
}

fn json_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => json!(v),
        SqlValue::Real(v) => json!(v),
        SqlValue::Text(v) => json!(v),
        SqlValue::Blob(v) => json!(format!("<{} bytes>", v.len())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn store() -> SqliteTableStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (id INTEGER, region TEXT, amount REAL, sold_on DATE);
             INSERT INTO sales VALUES (1, 'east', 10.5, '2024-01-02');
             INSERT INTO sales VALUES (2, 'west', NULL, '2024-01-03');
             CREATE TABLE customers (id INTEGER, name TEXT);",
        )
        .unwrap();
        SqliteTableStore::from_connection(conn)
    }

    #[tokio::test]
    async fn lists_tables_alphabetically() {
        let tables = store().list_tables().await.unwrap();
        assert_eq!(tables, vec!["customers", "sales"]);
    }

    #[tokio::test]
    async fn schema_infers_types() {
        let schema = store().schema("sales").await.unwrap();
        let types: Vec<_> = schema.iter().map(|c| (c.name.as_str(), c.data_type)).collect();
        assert_eq!(
            types,
            vec![
                ("id", ColumnType::Integer),
                ("region", ColumnType::Text),
                ("amount", ColumnType::Real),
                ("sold_on", ColumnType::Date),
            ]
        );
        assert!(store().schema("missing").await.is_err());
    }

    #[tokio::test]
    async fn rows_keep_select_order() {
        let rows = store()
            .execute("SELECT region, amount, id FROM sales ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let keys: Vec<_> = rows[0].keys().cloned().collect();
        assert_eq!(keys, vec!["region", "amount", "id"]);
        assert_eq!(rows[0]["amount"], json!(10.5));
        assert_eq!(rows[1]["amount"], Value::Null);
    }

    #[tokio::test]
    async fn engine_errors_are_returned() {
        let err = store().execute("SELECT nope FROM sales").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn read_only_file_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retail.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        let store = SqliteTableStore::open_read_only(&path).unwrap();
        assert_eq!(store.execute("SELECT x FROM t").await.unwrap().len(), 1);
        assert!(store.execute("INSERT INTO t VALUES (2)").await.is_err());
    }

    #[tokio::test]
    async fn timed_out_statement_releases_the_connection() {
        let store = store();
        let runaway = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT count(*) FROM c";
        let slow = tokio::time::timeout(Duration::from_millis(200), store.execute(runaway)).await;
        assert!(slow.is_err());

        let rows = tokio::time::timeout(
            Duration::from_secs(2),
            store.execute("SELECT COUNT(*) AS n FROM sales"),
        )
        .await
        .expect("connection released after the timeout")
        .unwrap();
        assert_eq!(rows[0]["n"], json!(2));
    }
}
