// 🔎 Store Inspection - runtime schema introspection and guarded read queries
// The query agent never assumes the unified schema; it asks for it here.

use crate::db::{count_rows, quote_ident};
use crate::error::{PipelineError, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// ============================================================================
// SCHEMA INTROSPECTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: i64,
}

/// User tables in name order (SQLite internals such as `sqlite_sequence` excluded)
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;

    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(tables)
}

pub fn describe_table(conn: &Connection, table: &str) -> Result<TableSchema> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;

    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                data_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        row_count: count_rows(conn, table)?,
    })
}

pub fn describe_store(conn: &Connection) -> Result<Vec<TableSchema>> {
    list_tables(conn)?
        .iter()
        .map(|table| describe_table(conn, table))
        .collect()
}

/// Plain-text schema, the form handed to the query agent:
///
/// ```text
/// Table 'unified_accounts':
///   - account_id (TEXT)
/// ```
pub fn render_schema(tables: &[TableSchema]) -> String {
    let mut out = String::new();

    for table in tables {
        out.push_str(&format!("Table '{}':\n", table.name));
        for column in &table.columns {
            out.push_str(&format!("  - {} ({})\n", column.name, column.data_type));
        }
        out.push('\n');
    }

    out
}

// ============================================================================
// READ-ONLY QUERIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// More rows were available than the limit allowed
    pub truncated: bool,
}

fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(r) => serde_json::Number::from_f64(r)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(t) => Value::String(t),
        SqlValue::Blob(b) => Value::String(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
    }
}

/// Byte offset of the first `;` that is not inside a literal, quoted
/// identifier or comment
fn statement_end(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b';' => return i,
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // Doubled quote is an escaped quote
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
            }
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    bytes.len()
}

/// Validate that `sql` is one SELECT/WITH statement and return it without
/// its trailing semicolons.
pub fn guard_query(sql: &str) -> Result<&str> {
    let sql = sql.trim();
    let (statement, tail) = sql.split_at(statement_end(sql));
    let statement = statement.trim();

    if statement.is_empty() {
        return Err(PipelineError::QueryRejected("empty query".to_string()));
    }

    if !tail.trim_matches(|c: char| c == ';' || c.is_whitespace()).is_empty() {
        return Err(PipelineError::QueryRejected(
            "only a single statement is allowed".to_string(),
        ));
    }

    let keyword = statement
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    if keyword != "SELECT" && keyword != "WITH" {
        return Err(PipelineError::QueryRejected(format!(
            "only SELECT queries are allowed, got '{}'",
            keyword
        )));
    }

    Ok(statement)
}

/// Run a read-only query and collect at most `limit` rows.
///
/// SQLite itself confirms the prepared statement cannot write.
pub fn run_read_only_query(conn: &Connection, sql: &str, limit: Option<usize>) -> Result<QueryResult> {
    let statement = guard_query(sql)?;
    let mut stmt = conn.prepare(statement)?;

    if !stmt.readonly() {
        return Err(PipelineError::QueryRejected(
            "statement would modify the database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([])?;
    let mut result = QueryResult {
        columns,
        rows: Vec::new(),
        truncated: false,
    };

    while let Some(row) = rows.next()? {
        if limit.is_some_and(|max| result.rows.len() >= max) {
            result.truncated = true;
            break;
        }

        let values = (0..result.columns.len())
            .map(|index| row.get::<_, SqlValue>(index).map(sql_to_json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        result.rows.push(values);
    }

    debug!(rows = result.rows.len(), truncated = result.truncated, "query executed");
    Ok(result)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE unified_balances (
                 balance_pk INTEGER PRIMARY KEY AUTOINCREMENT,
                 account_id_fk TEXT NOT NULL,
                 amount REAL
             );
             INSERT INTO unified_balances (account_id_fk, amount) VALUES ('a', 10.5), ('b', NULL);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_describe_store_skips_internal_tables() {
        let conn = store();

        let tables = describe_store(&conn).unwrap();

        // AUTOINCREMENT creates sqlite_sequence
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "unified_balances");
        assert_eq!(tables[0].row_count, 2);
        assert!(tables[0].columns[0].primary_key);
        assert!(tables[0].columns[1].not_null);
    }

    #[test]
    fn test_render_schema() {
        let conn = store();
        let rendered = render_schema(&describe_store(&conn).unwrap());

        assert_eq!(
            rendered,
            "Table 'unified_balances':\n  - balance_pk (INTEGER)\n  - account_id_fk (TEXT)\n  - amount (REAL)\n\n"
        );
    }

    #[test]
    fn test_guard_query() {
        assert_eq!(guard_query("  SELECT 1 ;  ").unwrap(), "SELECT 1");
        assert!(guard_query("with x as (select 1) select * from x").is_ok());
        assert!(matches!(guard_query("DELETE FROM t"), Err(PipelineError::QueryRejected(_))));
        assert!(matches!(
            guard_query("SELECT 1; DROP TABLE t"),
            Err(PipelineError::QueryRejected(_))
        ));
        assert!(matches!(guard_query(""), Err(PipelineError::QueryRejected(_))));
        assert!(matches!(guard_query(" ;; "), Err(PipelineError::QueryRejected(_))));
        assert_eq!(
            guard_query("SELECT ';' AS s, \"a;b\" -- x;y\n FROM t;").unwrap(),
            "SELECT ';' AS s, \"a;b\" -- x;y\n FROM t"
        );
        assert_eq!(guard_query("SELECT 'it''s;' /* ; */ ;;").unwrap(), "SELECT 'it''s;' /* ; */");
    }

    #[test]
    fn test_second_statement_is_rejected() {
        let conn = store();

        let result = run_read_only_query(&conn, "SELECT 1; DROP TABLE unified_balances", None);

        assert!(matches!(result, Err(PipelineError::QueryRejected(_))));
        assert_eq!(list_tables(&conn).unwrap(), vec!["unified_balances".to_string()]);
    }

    #[test]
    fn test_semicolon_inside_literal_is_allowed() {
        let conn = store();

        let result = run_read_only_query(
            &conn,
            "SELECT account_id_fk FROM unified_balances WHERE account_id_fk NOT LIKE '%;%' ORDER BY 1;",
            None,
        )
        .unwrap();

        assert_eq!(result.rows, vec![vec![json!("a")], vec![json!("b")]]);
    }

    #[test]
    fn test_run_read_only_query() {
        let conn = store();

        let result = run_read_only_query(
            &conn,
            "SELECT account_id_fk, amount FROM unified_balances ORDER BY account_id_fk",
            None,
        )
        .unwrap();

        assert_eq!(result.columns, vec!["account_id_fk", "amount"]);
        assert_eq!(result.rows, vec![vec![json!("a"), json!(10.5)], vec![json!("b"), Value::Null]]);
        assert!(!result.truncated);
    }

    #[test]
    fn test_query_limit_truncates() {
        let conn = store();

        let result = run_read_only_query(&conn, "SELECT * FROM unified_balances", Some(1)).unwrap();

        assert_eq!(result.rows.len(), 1);
        assert!(result.truncated);
    }

    #[test]
    fn test_writing_cte_is_rejected() {
        let conn = store();

        let result = run_read_only_query(
            &conn,
            "WITH x AS (SELECT 1) DELETE FROM unified_balances",
            None,
        );

        assert!(matches!(result, Err(PipelineError::QueryRejected(_))));
        assert_eq!(count_rows(&conn, "unified_balances").unwrap(), 2);
    }
}
