//! Gated query execution.
//!
//! Every query runs on a connection from the owning tenant's pool, inside
//! an explicit read-only transaction with `SET LOCAL lock_timeout`. The
//! result set is hard-capped: when the generated SQL carries no limit at
//! or below the cap, the query is wrapped and fetched with `cap + 1` rows
//! so truncation is detected without counting the full set.

use super::safety::CheckedQuery;
use askgate_core::{Error, Result};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::{debug, info};

/// A decoded result set, values rendered as display strings.
#[derive(Debug, Clone)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// True when the database had more rows than the cap.
    pub truncated: bool,
}

impl QueryTable {
    pub fn is_scalar(&self) -> bool {
        self.rows.len() == 1 && self.columns.len() == 1
    }
}

/// Applies the row cap. Queries already limited at or under the cap run
/// unchanged; everything else is wrapped and probed one row past the cap.
fn apply_row_cap(sql: &str, checked: &CheckedQuery, max_rows: u64) -> (String, bool) {
    if let Some(limit) = checked.limit {
        if limit <= max_rows {
            return (sql.trim().trim_end_matches(';').to_string(), false);
        }
    }
    let inner = sql.trim().trim_end_matches(';');
    (
        format!("SELECT * FROM ({inner}) AS capped_result LIMIT {}", max_rows + 1),
        true,
    )
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        serde_json::Value::Null => query.bind(Option::<String>::None),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.as_str()),
        // arrays/objects travel as their JSON text
        other => query.bind(other.to_string()),
    }
}

/// Renders one column of one row as display text.
fn render_value(row: &PgRow, idx: usize) -> String {
    let type_name = row.columns()[idx].type_info().name().to_string();

    macro_rules! fetch {
        ($ty:ty) => {
            match row.try_get::<Option<$ty>, _>(idx) {
                Ok(Some(v)) => return v.to_string(),
                Ok(None) => return "NULL".to_string(),
                Err(_) => {}
            }
        };
    }

    match type_name.as_str() {
        "INT2" => fetch!(i16),
        "INT4" => fetch!(i32),
        "INT8" => fetch!(i64),
        "FLOAT4" => fetch!(f32),
        "FLOAT8" => fetch!(f64),
        "NUMERIC" => fetch!(rust_decimal::Decimal),
        "BOOL" => fetch!(bool),
        "DATE" => fetch!(chrono::NaiveDate),
        "TIME" => fetch!(chrono::NaiveTime),
        "TIMESTAMP" => fetch!(chrono::NaiveDateTime),
        "TIMESTAMPTZ" => fetch!(chrono::DateTime<chrono::Utc>),
        "UUID" => fetch!(uuid::Uuid),
        "JSON" | "JSONB" => {
            if let Ok(Some(v)) = row.try_get::<Option<serde_json::Value>, _>(idx) {
                return v.to_string();
            } else if let Ok(None) = row.try_get::<Option<serde_json::Value>, _>(idx) {
                return "NULL".to_string();
            }
        }
        _ => {}
    }

    // text-ish and everything else
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => v,
        Ok(None) => "NULL".to_string(),
        Err(_) => format!("<{}>", type_name.to_lowercase()),
    }
}

/// Runs a gate-checked query and decodes the capped result set.
pub async fn run(
    pool: &PgPool,
    tenant_id: &str,
    sql: &str,
    params: &[serde_json::Value],
    checked: &CheckedQuery,
    max_rows: u64,
    log_queries: bool,
) -> Result<QueryTable> {
    let (final_sql, probing) = apply_row_cap(sql, checked, max_rows);

    if log_queries {
        info!(tenant = tenant_id, sql = %final_sql, "executing generated query");
    }

    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    sqlx::query("SET LOCAL lock_timeout = '2s'")
        .execute(&mut *tx)
        .await?;

    let mut query = sqlx::query(&final_sql);
    for value in params {
        query = bind_value(query, value);
    }
    let fetched: Vec<PgRow> = query.fetch_all(&mut *tx).await?;

    // Read-only: rolling back returns the connection with nothing pending.
    tx.rollback().await?;

    let truncated = probing && fetched.len() as u64 > max_rows;
    let keep = if truncated { max_rows as usize } else { fetched.len() };

    let columns: Vec<String> = fetched
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows: Vec<Vec<String>> = fetched[..keep]
        .iter()
        .map(|row| (0..columns.len()).map(|i| render_value(row, i)).collect())
        .collect();

    debug!(
        tenant = tenant_id,
        rows = rows.len(),
        truncated,
        "query executed"
    );

    Ok(QueryTable { columns, rows, truncated })
}

/// Sees whether an error hints that the cached schema went stale: the
/// table or column the model referenced no longer exists.
pub fn suggests_schema_drift(err: &Error) -> bool {
    err.details
        .as_deref()
        .map(|d| {
            let d = d.to_ascii_lowercase();
            d.contains("does not exist") && (d.contains("relation") || d.contains("column"))
        })
        .unwrap_or(false)
}
