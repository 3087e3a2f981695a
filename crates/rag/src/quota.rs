use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::QuotaConfig;
use crate::error::{RagError, Result};
use crate::period::{next_reset_date, Clock};
use crate::principal::{Principal, ResourceClass};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub principal_id: String,
    pub resource_class: String,
    pub resource_name: String,
    pub consumed_units: u64,
    // 0 means unlimited.
    pub unit_limit: u64,
    pub period_reset_at: NaiveDate,
    pub active: bool,
}

impl UsageRecord {
    pub fn remaining(&self) -> Option<u64> {
        (self.unit_limit > 0).then(|| self.unit_limit.saturating_sub(self.consumed_units))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDenial {
    pub consumed: u64,
    pub limit: u64,
    pub requested: u64,
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "token quota exceeded: used {}, limit {}, requested {}",
            self.consumed, self.limit, self.requested
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(QuotaDenial),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStatistics {
    pub records: u64,
    pub principals: u64,
    pub principals_with_limits: u64,
    pub total_consumed: u64,
    pub consumed_by_class: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct UsageLedger {
    path: PathBuf,
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn open<P: AsRef<Path>>(path: P, config: QuotaConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let ledger = Self {
            path: path.as_ref().to_path_buf(),
            config,
            clock,
        };
        ledger.init()?;
        Ok(ledger)
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS user_token_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                llm_type TEXT NOT NULL,
                llm_name TEXT NOT NULL,
                used_tokens INTEGER NOT NULL DEFAULT 0,
                token_limit INTEGER NOT NULL DEFAULT 0,
                reset_date TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                create_date TEXT DEFAULT CURRENT_TIMESTAMP,
                update_date TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(user_id, llm_type, llm_name)
            );
            CREATE INDEX IF NOT EXISTS idx_usage_user ON user_token_usage(user_id);
            "#,
        )?;
        Ok(())
    }

    fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    fn next_boundary(&self) -> String {
        next_reset_date(self.config.reset_interval, self.today())
            .format(DATE_FORMAT)
            .to_string()
    }

    pub fn check(
        &self,
        principal: &Principal,
        class: ResourceClass,
        name: &str,
        requested: u64,
    ) -> Result<Admission> {
        let conn = self.connection()?;
        let default_limit = if principal.is_superuser {
            0
        } else {
            self.config.normal_user_limit
        };
        self.ensure_record(&conn, &principal.id, class, name, default_limit)?;
        if !self.config.enabled || principal.is_superuser {
            return Ok(Admission::Allow);
        }
        self.roll_period(&conn, &principal.id, class, name)?;
        let Some(record) = load_record(&conn, &principal.id, class.as_str(), name)? else {
            warn!(user = %principal.id, class = %class, name, "usage record vanished during check");
            return Ok(Admission::Allow);
        };
        if !record.active || record.unit_limit == 0 {
            return Ok(Admission::Allow);
        }
        if record.consumed_units.saturating_add(requested) > record.unit_limit {
            let denial = QuotaDenial {
                consumed: record.consumed_units,
                limit: record.unit_limit,
                requested,
            };
            info!(user = %principal.id, class = %class, name, %denial, "quota check denied");
            return Ok(Admission::Deny(denial));
        }
        Ok(Admission::Allow)
    }

    pub fn commit(&self, principal: &Principal, class: ResourceClass, name: &str, used: u64) -> bool {
        match self.try_commit(&principal.id, class, name, used) {
            Ok(0) => {
                warn!(user = %principal.id, class = %class, name, used, "no usage record to commit against");
                false
            }
            Ok(_) => {
                debug!(user = %principal.id, class = %class, name, used, "usage committed");
                true
            }
            Err(err) => {
                error!(user = %principal.id, class = %class, name, used, error = %err, "usage commit failed");
                false
            }
        }
    }

    fn try_commit(&self, user_id: &str, class: ResourceClass, name: &str, used: u64) -> Result<usize> {
        let conn = self.connection()?;
        self.roll_period(&conn, user_id, class, name)?;
        let updated = conn.execute(
            "UPDATE user_token_usage
             SET used_tokens = used_tokens + ?1, update_date = CURRENT_TIMESTAMP
             WHERE user_id = ?2 AND llm_type = ?3 AND llm_name = ?4",
            params![to_sql_int(used)?, user_id, class.as_str(), name],
        )?;
        Ok(updated)
    }

    pub fn set_limit(&self, principal: &Principal, class: ResourceClass, name: &str, limit: u64) -> Result<UsageRecord> {
        let conn = self.connection()?;
        self.ensure_record(&conn, &principal.id, class, name, limit)?;
        conn.execute(
            "UPDATE user_token_usage SET token_limit = ?1, update_date = CURRENT_TIMESTAMP
             WHERE user_id = ?2 AND llm_type = ?3 AND llm_name = ?4",
            params![to_sql_int(limit)?, principal.id, class.as_str(), name],
        )?;
        info!(user = %principal.id, class = %class, name, limit, "usage limit set");
        load_record(&conn, &principal.id, class.as_str(), name)?
            .ok_or_else(|| RagError::Config(format!("usage record for {} disappeared", principal.id)))
    }

    pub fn reset(&self, user_id: &str, class: Option<ResourceClass>, name: Option<&str>) -> Result<usize> {
        let conn = self.connection()?;
        let reset = conn.execute(
            "UPDATE user_token_usage SET used_tokens = 0, reset_date = ?1, update_date = CURRENT_TIMESTAMP
             WHERE user_id = ?2 AND (?3 IS NULL OR llm_type = ?3) AND (?4 IS NULL OR llm_name = ?4)",
            params![self.next_boundary(), user_id, class.map(|c| c.as_str()), name],
        )?;
        info!(user = user_id, reset, "usage reset");
        Ok(reset)
    }

    pub fn deactivate(&self, user_id: &str, class: ResourceClass, name: &str) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE user_token_usage SET is_active = 0, update_date = CURRENT_TIMESTAMP
             WHERE user_id = ?1 AND llm_type = ?2 AND llm_name = ?3",
            params![user_id, class.as_str(), name],
        )?;
        Ok(updated > 0)
    }

    pub fn record(&self, user_id: &str, class: ResourceClass, name: &str) -> Result<Option<UsageRecord>> {
        let conn = self.connection()?;
        load_record(&conn, user_id, class.as_str(), name)
    }

    pub fn usage_for(&self, user_id: &str) -> Result<Vec<UsageRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, llm_type, llm_name, used_tokens, token_limit, reset_date, is_active
             FROM user_token_usage WHERE user_id = ?1 ORDER BY llm_type, llm_name",
        )?;
        let rows = stmt.query_map([user_id], map_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn statistics(&self) -> Result<UsageStatistics> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, llm_type, llm_name, used_tokens, token_limit, reset_date, is_active
             FROM user_token_usage",
        )?;
        let rows = stmt.query_map([], map_record)?;
        let mut stats = UsageStatistics::default();
        let mut principals = BTreeSet::new();
        let mut limited = BTreeSet::new();
        for row in rows {
            let record = row?;
            stats.records += 1;
            stats.total_consumed += record.consumed_units;
            *stats
                .consumed_by_class
                .entry(record.resource_class.clone())
                .or_default() += record.consumed_units;
            if record.unit_limit > 0 {
                limited.insert(record.principal_id.clone());
            }
            principals.insert(record.principal_id);
        }
        stats.principals = principals.len() as u64;
        stats.principals_with_limits = limited.len() as u64;
        Ok(stats)
    }

    fn ensure_record(
        &self,
        conn: &Connection,
        user_id: &str,
        class: ResourceClass,
        name: &str,
        limit: u64,
    ) -> Result<()> {
        let created = conn.execute(
            "INSERT OR IGNORE INTO user_token_usage
             (user_id, llm_type, llm_name, used_tokens, token_limit, reset_date, is_active)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, 1)",
            params![user_id, class.as_str(), name, to_sql_int(limit)?, self.next_boundary()],
        )?;
        if created > 0 {
            debug!(user = user_id, class = %class, name, limit, "usage record created");
        }
        Ok(())
    }

    // Zeroes consumption once the stored boundary has passed. The date
    // guard makes this a no-op for everyone but the first caller.
    fn roll_period(&self, conn: &Connection, user_id: &str, class: ResourceClass, name: &str) -> Result<()> {
        let today = self.today().format(DATE_FORMAT).to_string();
        let rolled = conn.execute(
            "UPDATE user_token_usage SET used_tokens = 0, reset_date = ?1, update_date = CURRENT_TIMESTAMP
             WHERE user_id = ?2 AND llm_type = ?3 AND llm_name = ?4 AND reset_date <= ?5",
            params![self.next_boundary(), user_id, class.as_str(), name, today],
        )?;
        if rolled > 0 {
            info!(user = user_id, class = %class, name, "usage period rolled over");
        }
        Ok(())
    }
}

fn load_record(conn: &Connection, user_id: &str, class: &str, name: &str) -> Result<Option<UsageRecord>> {
    Ok(conn
        .query_row(
            "SELECT user_id, llm_type, llm_name, used_tokens, token_limit, reset_date, is_active
             FROM user_token_usage WHERE user_id = ?1 AND llm_type = ?2 AND llm_name = ?3",
            params![user_id, class, name],
            map_record,
        )
        .optional()?)
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    let reset: String = row.get(5)?;
    let period_reset_at = NaiveDate::parse_from_str(&reset, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(UsageRecord {
        principal_id: row.get(0)?,
        resource_class: row.get(1)?,
        resource_name: row.get(2)?,
        consumed_units: row.get::<_, i64>(3)?.max(0) as u64,
        unit_limit: row.get::<_, i64>(4)?.max(0) as u64,
        period_reset_at,
        active: row.get::<_, i64>(6)? != 0,
    })
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| RagError::Config(format!("{value} does not fit a sqlite integer")))
}
