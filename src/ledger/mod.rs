//! Run ledger: one row per in-flight START/STOP request of a managed node.
//!
//! A unique index on `node_id` provides the per-node exclusivity. It holds across
//! processes sharing the database, without any in-process locking.
//! A row blocks its node until `remove_run`, even once cancelled or flagged.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dynamic_services_runs (
    run_id TEXT PRIMARY KEY NOT NULL,
    node_id TEXT NOT NULL,
    workflow_name TEXT NOT NULL,
    is_reverting BOOLEAN NOT NULL DEFAULT FALSE,
    waiting_manual_intervention BOOLEAN NOT NULL DEFAULT FALSE,
    created TEXT NOT NULL,
    cancelled TEXT
)
"#;

const CREATE_NODE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ix_dynamic_services_runs_node_id
    ON dynamic_services_runs (node_id)
"#;

const RUN_COLUMNS: &str =
    "run_id, node_id, workflow_name, is_reverting, waiting_manual_intervention, created, cancelled";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("a run for node '{0}' is already in progress")]
    RunAlreadyExists(String),

    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowName {
    Start,
    Stop,
}

impl WorkflowName {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowName::Start => "START",
            WorkflowName::Stop => "STOP",
        }
    }

    fn parse(s: &str) -> Result<Self, sqlx::Error> {
        match s {
            "START" => Ok(WorkflowName::Start),
            "STOP" => Ok(WorkflowName::Stop),
            other => Err(sqlx::Error::Decode(
                format!("unknown workflow name '{}'", other).into(),
            )),
        }
    }
}

impl std::fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub node_id: String,
    pub workflow_name: WorkflowName,
    /// STOP runs drive the start machinery backwards, so they are always reverting.
    pub is_reverting: bool,
    pub waiting_manual_intervention: bool,
    pub created: DateTime<Utc>,
    pub cancelled: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RunLedger {
    pool: SqlitePool,
}

impl RunLedger {
    /// Connect to `url` and create the table if needed.
    ///
    /// `sqlite::memory:` is pinned to a single never-recycled connection, otherwise
    /// every new connection would see an empty database.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(url).await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Open (creating if needed) a SQLite database file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Database(sqlx::Error::Io(e)))?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    pub async fn in_memory() -> Result<Self, LedgerError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(CREATE_RUNS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_NODE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_from_start_request(&self, node_id: &str) -> Result<Run, LedgerError> {
        self.create(node_id, WorkflowName::Start, false).await
    }

    pub async fn create_from_stop_request(&self, node_id: &str) -> Result<Run, LedgerError> {
        self.create(node_id, WorkflowName::Stop, true).await
    }

    async fn create(
        &self,
        node_id: &str,
        workflow_name: WorkflowName,
        is_reverting: bool,
    ) -> Result<Run, LedgerError> {
        let run = Run {
            run_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            workflow_name,
            is_reverting,
            waiting_manual_intervention: false,
            created: Utc::now(),
            cancelled: None,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO dynamic_services_runs
                (run_id, node_id, workflow_name, is_reverting, waiting_manual_intervention, created)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.node_id)
        .bind(run.workflow_name.as_str())
        .bind(run.is_reverting)
        .bind(run.waiting_manual_intervention)
        .bind(run.created)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(
                    run_id = %run.run_id,
                    node_id = %node_id,
                    workflow = %workflow_name,
                    "Created run"
                );
                Ok(run)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(LedgerError::RunAlreadyExists(node_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM dynamic_services_runs WHERE run_id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_run).transpose()?)
    }

    pub async fn get_run_from_node_id(&self, node_id: &str) -> Result<Option<Run>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM dynamic_services_runs WHERE node_id = ?",
            RUN_COLUMNS
        ))
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_run).transpose()?)
    }

    /// Mark a run cancelled. Administrative only; in-flight steps are not interrupted.
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE dynamic_services_runs SET cancelled = ? WHERE run_id = ? AND cancelled IS NULL"
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        debug!(run_id = %run_id, updated = result.rows_affected(), "Cancel run");
        Ok(())
    }

    pub async fn set_waiting_manual_intervention(&self, run_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE dynamic_services_runs SET waiting_manual_intervention = TRUE WHERE run_id = ?"
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        debug!(
            run_id = %run_id,
            updated = result.rows_affected(),
            "Flag run for manual intervention"
        );
        Ok(())
    }

    pub async fn remove_run(&self, run_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query("DELETE FROM dynamic_services_runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(run_id = %run_id, "Removed run");
        }
        Ok(())
    }

    /// Every row, oldest first.
    pub async fn get_all_runs(&self) -> Result<Vec<Run>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM dynamic_services_runs ORDER BY created ASC",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(row_to_run)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

fn row_to_run(row: &SqliteRow) -> Result<Run, sqlx::Error> {
    let workflow_name: String = row.try_get("workflow_name")?;
    Ok(Run {
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        workflow_name: WorkflowName::parse(&workflow_name)?,
        is_reverting: row.try_get("is_reverting")?,
        waiting_manual_intervention: row.try_get("waiting_manual_intervention")?,
        created: row.try_get("created")?,
        cancelled: row.try_get("cancelled")?,
    })
}
