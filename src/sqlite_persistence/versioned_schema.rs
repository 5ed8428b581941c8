use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::info;

/// Offset added to every schema version before it is written to `PRAGMA user_version`,
/// so a database created by some other tool is never mistaken for one of ours.
pub const BASE_DB_VERSION: usize = 71000;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SqlType {
    Text,
    Integer,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(SqlType::Text),
            "INTEGER" => Some(SqlType::Integer),
            _ => None,
        }
    }
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<&'static str>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let columns_sql = self
            .columns
            .iter()
            .map(|column| {
                let mut sql = format!("{} {}", column.name, column.sql_type.as_sql());
                if column.is_primary_key {
                    sql.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    sql.push_str(" NOT NULL");
                }
                if let Some(default_value) = column.default_value {
                    sql.push_str(&format!(" DEFAULT {}", default_value));
                }
                sql
            })
            .collect::<Vec<_>>()
            .join(", ");

        conn.execute(
            &format!("CREATE TABLE {} ({});", self.name, columns_sql),
            params![],
        )?;

        for (index_name, columns) in self.indices {
            conn.execute(
                &format!("CREATE INDEX {} ON {}({});", index_name, self.name, columns),
                params![],
            )?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        struct ActualColumn {
            name: String,
            sql_type: String,
            non_null: bool,
            is_primary_key: bool,
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual: Vec<ActualColumn> = stmt
            .query_map(params![], |row| {
                Ok(ActualColumn {
                    name: row.get(1)?,
                    sql_type: row.get(2)?,
                    non_null: row.get::<_, i32>(3)? == 1,
                    is_primary_key: row.get::<_, i32>(5)? == 1,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {} ({})",
                self.name,
                actual.len(),
                self.columns.len(),
                self.columns
                    .iter()
                    .map(|c| c.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        for (actual_column, expected) in actual.iter().zip(self.columns.iter()) {
            if actual_column.name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    actual_column.name
                );
            }
            if SqlType::parse(&actual_column.sql_type).as_ref() != Some(expected.sql_type) {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    actual_column.sql_type
                );
            }
            if actual_column.non_null != expected.non_null
                || actual_column.is_primary_key != expected.is_primary_key
            {
                bail!(
                    "Table {} column {} constraint mismatch",
                    self.name,
                    expected.name
                );
            }
        }

        for (index_name, _) in self.indices {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                    params![index_name, self.name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                bail!("Table {} is missing index '{}'", self.name, index_name);
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

/// Bring `conn` up to the last entry of `schemas`.
///
/// A database without a version stamp gets the latest schema created from scratch.
/// Otherwise the stored version is validated against its definition and every
/// later migration runs.
///
/// The version is read and acted upon inside one write transaction, so
/// processes opening the same file at once serialize here: the first one
/// creates or migrates, the others find the result already in place.
pub fn prepare_database(
    conn: &mut Connection,
    schemas: &'static [VersionedSchema],
    label: &str,
) -> Result<()> {
    let latest = schemas
        .last()
        .with_context(|| format!("No schema defined for {} database", label))?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .with_context(|| format!("Failed to lock {} database for schema setup", label))?;

    let raw_version: i64 = tx.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if raw_version == 0 {
        info!("Creating {} database schema v{}", label, latest.version);
        latest.create(&tx)?;
        tx.commit()?;
        return Ok(());
    }

    let db_version = raw_version - BASE_DB_VERSION as i64;
    let current = schemas
        .iter()
        .find(|s| s.version as i64 == db_version)
        .with_context(|| format!("Unknown {} database version {}", label, db_version))?;
    current.validate(&tx).with_context(|| {
        format!(
            "{} database schema validation failed for version {}",
            label, db_version
        )
    })?;

    if current.version == latest.version {
        tx.commit()?;
        return Ok(());
    }

    info!(
        "Migrating {} database from version {} to {}",
        label, current.version, latest.version
    );
    for schema in schemas.iter().filter(|s| s.version > current.version) {
        if let Some(migration) = schema.migration {
            migration(&tx)
                .with_context(|| format!("Failed to run migration to version {}", schema.version))?;
        }
    }
    tx.execute(
        &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
        [],
    )?;
    tx.commit()?;
    Ok(())
}
