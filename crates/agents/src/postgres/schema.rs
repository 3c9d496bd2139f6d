//! Schema introspection and snapshot cache.
//!
//! The SQL generator is grounded in a [`SchemaSnapshot`] of the tenant
//! database: schemas, tables, columns with types and nullability, key
//! relationships, and row-count estimates. Snapshots are cached per
//! tenant with a TTL and single-flight refresh, so concurrent requests
//! never stampede `information_schema`.

use askgate_core::Result;
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub row_estimate: i64,
}

impl TableInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Introspected shape of one tenant database at a point in time.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub schemas: Vec<String>,
    pub tables: Vec<TableInfo>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl SchemaSnapshot {
    pub fn allowed_schemas(&self) -> &[String] {
        &self.schemas
    }

    /// Compact textual summary for the generation prompt, capped at
    /// `budget` bytes. Tables are ranked by name/column overlap with the
    /// question; ties break on table name so output is stable.
    pub fn summary(&self, question: &str, budget: usize) -> String {
        let needles = question_tokens(question);

        let mut ranked: Vec<(&TableInfo, usize)> = self
            .tables
            .iter()
            .map(|t| (t, relevance(t, question, &needles)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name.cmp(&b.0.name)));

        let mut out = String::new();
        for (table, _) in ranked {
            let line = describe_table(table);
            if out.len() + line.len() > budget && !out.is_empty() {
                break;
            }
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

fn question_tokens(question: &str) -> HashSet<String> {
    question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

fn relevance(table: &TableInfo, question: &str, needles: &HashSet<String>) -> usize {
    let q = question.to_lowercase();
    let mut score = 0usize;
    let name = table.name.to_lowercase();
    // substring containment also matches languages without spaces
    if q.contains(&name) {
        score += 4;
    }
    for part in name.split('_') {
        if needles.contains(part) {
            score += 2;
        }
    }
    for column in &table.columns {
        let col = column.name.to_lowercase();
        if needles.contains(&col) || q.contains(&col) && col.len() > 2 {
            score += 1;
        }
    }
    score
}

fn describe_table(table: &TableInfo) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut s = format!("{} {}", c.name, c.data_type);
            if table.primary_key.contains(&c.name) {
                s.push_str(" pk");
            }
            if c.nullable {
                s.push_str(" null");
            }
            s
        })
        .collect();
    let mut line = format!(
        "{} (~{} rows): {}",
        table.qualified_name(),
        table.row_estimate.max(0),
        columns.join(", ")
    );
    if !table.foreign_keys.is_empty() {
        let fks: Vec<String> = table
            .foreign_keys
            .iter()
            .map(|fk| format!("{} -> {}.{}", fk.column, fk.ref_table, fk.ref_column))
            .collect();
        line.push_str(&format!("; fk: {}", fks.join(", ")));
    }
    line
}

/// Reads the full snapshot from `information_schema` and statistics views.
pub async fn introspect(pool: &PgPool) -> Result<SchemaSnapshot> {
    let schema_rows = sqlx::query(
        "SELECT schema_name FROM information_schema.schemata \
         WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast') \
           AND schema_name NOT LIKE 'pg_temp%' AND schema_name NOT LIKE 'pg_toast%' \
         ORDER BY schema_name",
    )
    .fetch_all(pool)
    .await?;
    let schemas: Vec<String> = schema_rows
        .iter()
        .map(|r| r.get::<String, _>("schema_name"))
        .collect();

    let table_rows = sqlx::query(
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_type = 'BASE TABLE' \
           AND table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast') \
         ORDER BY table_schema, table_name",
    )
    .fetch_all(pool)
    .await?;

    let mut tables: Vec<TableInfo> = table_rows
        .iter()
        .map(|r| TableInfo {
            schema: r.get("table_schema"),
            name: r.get("table_name"),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            row_estimate: 0,
        })
        .collect();

    let column_rows = sqlx::query(
        "SELECT table_schema, table_name, column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast') \
         ORDER BY table_schema, table_name, ordinal_position",
    )
    .fetch_all(pool)
    .await?;
    for row in &column_rows {
        let schema: String = row.get("table_schema");
        let table: String = row.get("table_name");
        if let Some(t) = tables.iter_mut().find(|t| t.schema == schema && t.name == table) {
            t.columns.push(ColumnInfo {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<String, _>("is_nullable") == "YES",
            });
        }
    }

    let pk_rows = sqlx::query(
        "SELECT tc.table_schema, tc.table_name, kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name \
          AND tc.table_schema = kcu.table_schema \
         WHERE tc.constraint_type = 'PRIMARY KEY' \
         ORDER BY kcu.ordinal_position",
    )
    .fetch_all(pool)
    .await?;
    for row in &pk_rows {
        let schema: String = row.get("table_schema");
        let table: String = row.get("table_name");
        if let Some(t) = tables.iter_mut().find(|t| t.schema == schema && t.name == table) {
            t.primary_key.push(row.get("column_name"));
        }
    }

    let fk_rows = sqlx::query(
        "SELECT tc.table_schema, tc.table_name, kcu.column_name, \
                ccu.table_name AS ref_table, ccu.column_name AS ref_column \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name \
          AND tc.table_schema = kcu.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
           ON ccu.constraint_name = tc.constraint_name \
          AND ccu.table_schema = tc.table_schema \
         WHERE tc.constraint_type = 'FOREIGN KEY'",
    )
    .fetch_all(pool)
    .await?;
    for row in &fk_rows {
        let schema: String = row.get("table_schema");
        let table: String = row.get("table_name");
        if let Some(t) = tables.iter_mut().find(|t| t.schema == schema && t.name == table) {
            t.foreign_keys.push(ForeignKey {
                column: row.get("column_name"),
                ref_table: row.get("ref_table"),
                ref_column: row.get("ref_column"),
            });
        }
    }

    let stat_rows = sqlx::query(
        "SELECT schemaname, relname, n_live_tup FROM pg_stat_user_tables",
    )
    .fetch_all(pool)
    .await?;
    for row in &stat_rows {
        let schema: String = row.get("schemaname");
        let table: String = row.get("relname");
        if let Some(t) = tables.iter_mut().find(|t| t.schema == schema && t.name == table) {
            t.row_estimate = row.get::<i64, _>("n_live_tup");
        }
    }

    info!(schemas = schemas.len(), tables = tables.len(), "schema snapshot captured");
    Ok(SchemaSnapshot {
        schemas,
        tables,
        captured_at: chrono::Utc::now(),
    })
}

#[derive(Default)]
struct CacheSlot {
    snapshot: Option<(Arc<SchemaSnapshot>, Instant)>,
}

/// Per-tenant snapshot cache with TTL and single-flight refresh.
pub struct SchemaCache {
    slots: DashMap<String, Arc<Mutex<CacheSlot>>>,
    ttl: Duration,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached snapshot or introspects under the tenant's slot
    /// lock, so at most one introspection is in flight per tenant.
    pub async fn snapshot(&self, tenant_id: &str, pool: &PgPool) -> Result<Arc<SchemaSnapshot>> {
        let slot = self
            .slots
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CacheSlot::default())))
            .clone();

        let mut guard = slot.lock().await;
        if let Some((snapshot, captured)) = &guard.snapshot {
            if captured.elapsed() < self.ttl {
                debug!(tenant = tenant_id, "schema snapshot cache hit");
                return Ok(snapshot.clone());
            }
        }

        let snapshot = Arc::new(introspect(pool).await?);
        guard.snapshot = Some((snapshot.clone(), Instant::now()));
        Ok(snapshot)
    }

    /// Drops a tenant's snapshot, forcing re-introspection on next use.
    /// Called when execution errors hint at DDL drift.
    pub fn invalidate(&self, tenant_id: &str) {
        if let Some(slot) = self.slots.get(tenant_id) {
            if let Ok(mut guard) = slot.value().clone().try_lock_owned() {
                guard.snapshot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, columns: &[&str], rows: i64) -> TableInfo {
        TableInfo {
            schema: "public".to_string(),
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| ColumnInfo {
                    name: c.to_string(),
                    data_type: "text".to_string(),
                    nullable: false,
                })
                .collect(),
            primary_key: vec!["id".to_string()],
            foreign_keys: Vec::new(),
            row_estimate: rows,
        }
    }

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot {
            schemas: vec!["public".to_string()],
            tables: vec![
                table("employees", &["id", "name", "department", "salary"], 1200),
                table("orders", &["id", "total", "created_at"], 90000),
                table("audit_log", &["id", "entry"], 5_000_000),
            ],
            captured_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn relevant_table_ranks_first() {
        let s = snapshot();
        let summary = s.summary("How many employees are in the IT department?", 4096);
        let first_line = summary.lines().next().unwrap();
        assert!(first_line.starts_with("public.employees"), "{first_line}");
        assert!(first_line.contains("department"));
    }

    #[test]
    fn budget_caps_output() {
        let s = snapshot();
        let summary = s.summary("anything", 80);
        assert!(summary.len() <= 160, "summary was {} bytes", summary.len());
        assert!(summary.lines().count() < 3);
    }

    #[test]
    fn summary_is_stable_for_unrelated_questions() {
        let s = snapshot();
        let a = s.summary("completely unrelated words", 4096);
        let b = s.summary("completely unrelated words", 4096);
        assert_eq!(a, b);
        // tie-break is alphabetical
        assert!(a.lines().next().unwrap().starts_with("public.audit_log"));
    }

    #[test]
    fn describe_includes_keys_and_estimates() {
        let mut t = table("orders", &["id", "total"], 90000);
        t.foreign_keys.push(ForeignKey {
            column: "emp_id".to_string(),
            ref_table: "employees".to_string(),
            ref_column: "id".to_string(),
        });
        let line = describe_table(&t);
        assert!(line.contains("~90000 rows"));
        assert!(line.contains("id text pk"));
        assert!(line.contains("fk: emp_id -> employees.id"));
    }

    #[tokio::test]
    async fn invalidate_clears_between_requests() {
        let cache = SchemaCache::new(Duration::from_secs(600));
        // no snapshot yet: invalidate on an empty cache is a no-op
        cache.invalidate("company-a");
        assert!(cache.slots.get("company-a").is_none());
    }
}
