//! SQLite schema for the scheduler database.
//!
//! The scheduler owns exactly three tables: run markers, lock leases and
//! (since version 2) the execution history.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Run markers and lock leases
// =============================================================================

/// One row per job, upserted after every successful execution.
const RUN_MARKERS_TABLE_V1: Table = Table {
    name: "run_markers",
    columns: &[
        sqlite_column!("job_name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("last_run_at", &SqlType::Text),
        sqlite_column!("last_completed_period", &SqlType::Text),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
};

/// Advisory locks. A row whose `expires_at` (unix millis) is in the past is free.
const SCHEDULER_LOCKS_TABLE_V1: Table = Table {
    name: "scheduler_locks",
    columns: &[
        sqlite_column!("name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("holder", &SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

// =============================================================================
// Version 2 - Execution history
// =============================================================================

const JOB_RUNS_TABLE_V2: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_name", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("processed", &SqlType::Integer, non_null = true),
        sqlite_column!("failed_items", &SqlType::Integer, non_null = true),
        sqlite_column!("first_period", &SqlType::Text),
        sqlite_column!("last_period", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
    ],
    indices: &[("idx_job_runs_job_name_id", "job_name, id DESC")],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    JOB_RUNS_TABLE_V2.create(conn)
}

/// Version 1: run markers and lock leases
/// Version 2: execution history
pub const SCHEDULER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[RUN_MARKERS_TABLE_V1, SCHEDULER_LOCKS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            RUN_MARKERS_TABLE_V1,
            SCHEDULER_LOCKS_TABLE_V1,
            JOB_RUNS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
