use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode},
    query_builder::Separated,
    FromRow, PgPool, Postgres, QueryBuilder,
};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::util::env::{env_flag, env_parse};

/// PostgreSQL rejects statements with more bind parameters than this.
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("invalid DATABASE_URL")?;

        // Ensure TLS is enabled when DSN contains sslmode=require
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        // Optional fast-ingest session tuning (applies to every acquired connection).
        let fast_ingest = env_flag("FAST_INGEST", false);
        let work_mem_mb: u32 = env_parse("FAST_INGEST_WORK_MEM_MB", 64u32);
        let acquire_secs: u64 = env_parse("DB_ACQUIRE_TIMEOUT_SECS", 60u64);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(acquire_secs))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if fast_ingest {
                        // Best-effort; ignore errors to avoid blocking startup in restricted envs
                        let _ = sqlx::query("SET synchronous_commit = 'off'")
                            .execute(&mut *conn)
                            .await;
                        let _ = sqlx::query(&format!("SET work_mem = '{}MB'", work_mem_mb))
                            .execute(&mut *conn)
                            .await;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await
            .context("connect to database")?;
        info!(max_connections, fast_ingest, "connected to db");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests provision their own schema-scoped pools).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// What to do when an inserted row hits the table's unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// `ON CONFLICT (...) DO NOTHING`
    Ignore,
    /// Overwrite every non-key column with the incoming value.
    UpdateAll,
    /// Overwrite only the listed columns.
    UpdateColumns(&'static [&'static str]),
    /// No `ON CONFLICT` clause; a conflict fails the statement (append-only tables).
    Reject,
}

impl ConflictPolicy {
    /// Render the `ON CONFLICT` clause for a table.
    pub fn clause(self, conflict_target: &[&str], columns: &[&str]) -> String {
        if self == ConflictPolicy::Reject {
            return String::new();
        }
        if conflict_target.is_empty() {
            // No unique key to conflict on; only Ignore makes sense.
            return match self {
                ConflictPolicy::Ignore => " ON CONFLICT DO NOTHING".to_string(),
                _ => String::new(),
            };
        }
        let target = conflict_target.join(", ");
        let updates: Vec<&str> = match self {
            ConflictPolicy::Ignore | ConflictPolicy::Reject => Vec::new(),
            ConflictPolicy::UpdateAll => columns
                .iter()
                .copied()
                .filter(|c| !conflict_target.contains(c))
                .collect(),
            ConflictPolicy::UpdateColumns(cols) => cols.to_vec(),
        };
        if updates.is_empty() {
            return format!(" ON CONFLICT ({target}) DO NOTHING");
        }
        let set = updates
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(" ON CONFLICT ({target}) DO UPDATE SET {set}")
    }
}

/// A row shape that can be written with [`Db::bulk_insert`].
pub trait BulkRow: Sync {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    /// Columns of the unique key the conflict policy applies to.
    const CONFLICT_TARGET: &'static [&'static str];

    /// Bind this row's values in `COLUMNS` order.
    fn push_binds<'args>(&'args self, b: &mut Separated<'_, 'args, Postgres, &'static str>);
}

/// Largest number of rows of `R` that fit in one statement.
pub fn rows_per_statement<R: BulkRow>(requested: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / R::COLUMNS.len().max(1);
    requested.clamp(1, by_params.max(1))
}

fn insert_builder<'args, R: BulkRow>(
    rows: &'args [R],
    policy: ConflictPolicy,
) -> QueryBuilder<'args, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} ({}) ",
        R::TABLE,
        R::COLUMNS.join(", ")
    ));
    qb.push_values(rows, |mut b, row| row.push_binds(&mut b));
    qb.push(policy.clause(R::CONFLICT_TARGET, R::COLUMNS));
    qb
}

impl Db {
    /// Insert `rows` in a single statement; returns rows affected.
    ///
    /// Callers size `rows` with [`rows_per_statement`].
    pub async fn bulk_insert<R: BulkRow>(&self, rows: &[R], policy: ConflictPolicy) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = insert_builder(rows, policy);
        let done = qb
            .build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .with_context(|| format!("bulk insert into {}", R::TABLE))?;
        Ok(done.rows_affected())
    }

    /// Insert `rows` and fetch `RETURNING {returning}` for every row written.
    ///
    /// With `ConflictPolicy::Ignore`, skipped rows return nothing.
    pub async fn bulk_insert_returning<R, O>(
        &self,
        rows: &[R],
        policy: ConflictPolicy,
        returning: &str,
    ) -> Result<Vec<O>>
    where
        R: BulkRow,
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = insert_builder(rows, policy);
        qb.push(" RETURNING ").push(returning);
        qb.build_query_as::<O>()
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("bulk insert into {} (returning)", R::TABLE))
    }

    /// Write `rows` in sub-batches, folding failures into the outcome instead of
    /// returning them. A failed sub-batch does not stop the remaining ones.
    #[instrument(skip(self, rows), fields(table = R::TABLE, rows = rows.len()))]
    pub async fn bulk_insert_chunked<R: BulkRow>(
        &self,
        rows: &[R],
        policy: ConflictPolicy,
        batch_size: usize,
    ) -> BulkWriteOutcome {
        let mut outcome = BulkWriteOutcome::new(R::TABLE);
        for part in rows.chunks(rows_per_statement::<R>(batch_size)) {
            outcome.attempted += part.len() as u64;
            match self.bulk_insert(part, policy).await {
                Ok(n) => outcome.inserted += n,
                Err(e) => {
                    warn!(table = R::TABLE, rows = part.len(), error = %format!("{e:#}"), "sub-batch insert failed");
                    outcome.record_failure(part.len() as u64, &e);
                }
            }
        }
        outcome
    }
}

/// Result of writing one row set: nothing is swallowed silently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub table: &'static str,
    pub attempted: u64,
    pub inserted: u64,
    pub failed: u64,
    pub first_error: Option<String>,
}

impl BulkWriteOutcome {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    pub fn record_failure(&mut self, rows: u64, err: &anyhow::Error) {
        self.failed += rows;
        if self.first_error.is_none() {
            self.first_error = Some(format!("{err:#}"));
        }
    }

    /// Rows accepted by the statement but not written (conflicts).
    pub fn skipped(&self) -> u64 {
        self.attempted
            .saturating_sub(self.inserted)
            .saturating_sub(self.failed)
    }

    pub fn merge(&mut self, other: &BulkWriteOutcome) {
        self.attempted += other.attempted;
        self.inserted += other.inserted;
        self.failed += other.failed;
        if self.first_error.is_none() {
            self.first_error.clone_from(&other.first_error);
        }
    }
}

impl fmt::Display for BulkWriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: attempted={} inserted={} skipped={} failed={}",
            self.table,
            self.attempted,
            self.inserted,
            self.skipped(),
            self.failed
        )
    }
}

/// Per-table outcomes accumulated over a whole run.
#[derive(Debug, Clone, Default)]
pub struct TableOutcomes(BTreeMap<&'static str, BulkWriteOutcome>);

impl TableOutcomes {
    pub fn add(&mut self, outcome: &BulkWriteOutcome) {
        self.0
            .entry(outcome.table)
            .or_insert_with(|| BulkWriteOutcome::new(outcome.table))
            .merge(outcome);
    }

    pub fn get(&self, table: &str) -> Option<&BulkWriteOutcome> {
        self.0.get(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BulkWriteOutcome> {
        self.0.values()
    }

    pub fn total_failed(&self) -> u64 {
        self.0.values().map(|o| o.failed).sum()
    }
}
