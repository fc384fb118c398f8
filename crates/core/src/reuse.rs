//! The reuse-metadata table.
//!
//! Every database built by scenariodb carries a single-row table recording
//! which scenario it represents. The row is written as the very last build
//! step, so a database that has a row was built completely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BuildConfig;
use crate::hash::HashTriplet;

/// Name of the reuse-metadata table.
pub const REUSE_TABLE: &str = "_scenariodb_reuse";

/// Layout version of the reuse table. Rows with another version are ignored.
pub const REUSE_TABLE_VERSION: i64 = 1;

pub const CREATE_REUSE_TABLE: &str = "CREATE TABLE IF NOT EXISTS _scenariodb_reuse (
    table_version INTEGER NOT NULL,
    project_name VARCHAR(255) NOT NULL,
    connection VARCHAR(255) NOT NULL,
    orig_database VARCHAR(255) NOT NULL,
    driver VARCHAR(16) NOT NULL,
    build_hash VARCHAR(64) NOT NULL,
    snapshot_hash VARCHAR(64) NOT NULL,
    scenario_hash VARCHAR(64) NOT NULL,
    reuse_transaction INTEGER NOT NULL,
    inuse INTEGER NOT NULL,
    last_used VARCHAR(40) NOT NULL
)";

pub const SELECT_REUSE_ROW: &str = "SELECT table_version, project_name, connection, orig_database, driver,
    build_hash, snapshot_hash, scenario_hash, reuse_transaction, inuse, last_used
    FROM _scenariodb_reuse LIMIT 1";

pub const CLEAR_REUSE_ROWS: &str = "DELETE FROM _scenariodb_reuse";

/// Flags the database as in use. Run inside the reuse transaction so a
/// rollback clears it again and a commit leaves it behind.
pub const MARK_IN_USE: &str = "UPDATE _scenariodb_reuse SET inuse = 1";

/// Stamps the row with `now`. Run before the reuse transaction opens so the
/// rollback after each test keeps the new time.
pub fn touch_last_used(now: DateTime<Utc>) -> String {
    format!("UPDATE {REUSE_TABLE} SET last_used = '{}'", now.to_rfc3339())
}

/// The single row of the reuse-metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseRecord {
    pub table_version: i64,
    pub project_name: String,
    pub connection: String,
    pub orig_database: String,
    pub driver: String,
    pub build_hash: String,
    pub snapshot_hash: String,
    pub scenario_hash: String,
    pub reuse_transaction: bool,
    pub inuse: bool,
    pub last_used: String,
}

impl ReuseRecord {
    /// The row describing a database that was just built for `config`.
    pub fn for_build(config: &BuildConfig, hashes: &HashTriplet) -> Self {
        Self {
            table_version: REUSE_TABLE_VERSION,
            project_name: config.project_name.clone(),
            connection: config.connection.clone(),
            orig_database: config.database.clone(),
            driver: config.driver.as_str().to_string(),
            build_hash: hashes.build_hash.clone(),
            snapshot_hash: hashes.snapshot_hash.clone(),
            scenario_hash: hashes.scenario_hash.clone(),
            reuse_transaction: config.reuse_transaction,
            inuse: false,
            last_used: Utc::now().to_rfc3339(),
        }
    }

    /// Parse a row returned as text columns, in [`SELECT_REUSE_ROW`] order.
    ///
    /// Returns `None` for anything that does not look like one of our rows.
    pub fn from_text_row(row: &[Option<String>]) -> Option<Self> {
        if row.len() != 11 {
            return None;
        }
        let text = |i: usize| row[i].clone();
        let record = Self {
            table_version: text(0)?.trim().parse().ok()?,
            project_name: text(1)?,
            connection: text(2)?,
            orig_database: text(3)?,
            driver: text(4)?,
            build_hash: text(5)?,
            snapshot_hash: text(6)?,
            scenario_hash: text(7)?,
            reuse_transaction: parse_flag(&text(8)?)?,
            inuse: parse_flag(&text(9)?)?,
            last_used: text(10)?,
        };
        (record.table_version == REUSE_TABLE_VERSION).then_some(record)
    }

    /// Whether this database can be handed to another test unchanged.
    pub fn is_reusable_for(&self, hashes: &HashTriplet) -> bool {
        self.build_hash == hashes.build_hash
            && self.scenario_hash == hashes.scenario_hash
            && self.reuse_transaction
            && !self.inuse
    }

    /// INSERT statement with inlined literals, for engines reached through text SQL.
    pub fn insert_sql(&self, escape: fn(&str) -> String) -> String {
        format!(
            "INSERT INTO {REUSE_TABLE} (table_version, project_name, connection, orig_database, driver, \
             build_hash, snapshot_hash, scenario_hash, reuse_transaction, inuse, last_used) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
            self.table_version,
            escape(&self.project_name),
            escape(&self.connection),
            escape(&self.orig_database),
            escape(&self.driver),
            escape(&self.build_hash),
            escape(&self.snapshot_hash),
            escape(&self.scenario_hash),
            i32::from(self.reuse_transaction),
            i32::from(self.inuse),
            escape(&self.last_used),
        )
    }

    #[cfg(test)]
    pub(crate) fn sample() -> Self {
        Self {
            table_version: REUSE_TABLE_VERSION,
            project_name: "shop".into(),
            connection: "main".into(),
            orig_database: "app".into(),
            driver: "sqlite".into(),
            build_hash: "b".repeat(32),
            snapshot_hash: "s".repeat(32),
            scenario_hash: "c".repeat(32),
            reuse_transaction: true,
            inuse: false,
            last_used: "2026-01-01T00:00:00+00:00".into(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_row(record: &ReuseRecord) -> Vec<Option<String>> {
        vec![
            Some(record.table_version.to_string()),
            Some(record.project_name.clone()),
            Some(record.connection.clone()),
            Some(record.orig_database.clone()),
            Some(record.driver.clone()),
            Some(record.build_hash.clone()),
            Some(record.snapshot_hash.clone()),
            Some(record.scenario_hash.clone()),
            Some("1".into()),
            Some("f".into()),
            Some(record.last_used.clone()),
        ]
    }

    fn hashes(record: &ReuseRecord) -> HashTriplet {
        HashTriplet {
            build_hash: record.build_hash.clone(),
            snapshot_hash: record.snapshot_hash.clone(),
            scenario_hash: record.scenario_hash.clone(),
        }
    }

    #[test]
    fn test_parse_text_row() {
        let record = ReuseRecord::sample();
        assert_eq!(ReuseRecord::from_text_row(&text_row(&record)), Some(record));
    }

    #[test]
    fn test_parse_rejects_foreign_rows() {
        let record = ReuseRecord::sample();

        let mut wrong_version = text_row(&record);
        wrong_version[0] = Some("99".into());
        assert!(ReuseRecord::from_text_row(&wrong_version).is_none());

        let mut null_hash = text_row(&record);
        null_hash[5] = None;
        assert!(ReuseRecord::from_text_row(&null_hash).is_none());

        assert!(ReuseRecord::from_text_row(&text_row(&record)[..4]).is_none());
    }

    #[test]
    fn test_reusable_requires_clean_matching_row() {
        let record = ReuseRecord::sample();
        let current = hashes(&record);
        assert!(record.is_reusable_for(&current));

        let dirty = ReuseRecord { inuse: true, ..record.clone() };
        assert!(!dirty.is_reusable_for(&current));

        let no_txn = ReuseRecord { reuse_transaction: false, ..record.clone() };
        assert!(!no_txn.is_reusable_for(&current));

        let other_scenario = HashTriplet { scenario_hash: "x".repeat(32), ..current };
        assert!(!record.is_reusable_for(&other_scenario));
    }

    #[test]
    fn test_touch_last_used_stamps_rfc3339() {
        let now = DateTime::parse_from_rfc3339("2026-03-04T05:06:07+00:00").unwrap().with_timezone(&Utc);
        assert_eq!(touch_last_used(now), "UPDATE _scenariodb_reuse SET last_used = '2026-03-04T05:06:07+00:00'");
    }

    #[test]
    fn test_insert_sql_escapes_literals() {
        let record = ReuseRecord { project_name: "o'brien".into(), ..ReuseRecord::sample() };
        let sql = record.insert_sql(|v| format!("'{}'", v.replace('\'', "''")));
        assert!(sql.starts_with("INSERT INTO _scenariodb_reuse"));
        assert!(sql.contains("'o''brien'"));
        assert!(sql.contains("VALUES (1, "));
    }
}
