use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::models::account::{Account, AuthType, RateLimitOverride, Tier};

// One row in the `requests` table, produced at response completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub account_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub timestamp: i64,
    pub duration_ms: i64,
    pub attempts: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_estimate: Option<f64>,
    pub agent: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct UsageStats {
    pub total_requests: i64,
    pub success_count: i64,
    pub error_count: i64,
}

// Typed façade over the embedded database. All request-path mutations are
// funneled through the async writer; reads are snapshot-at-call and may be
// stale by up to one flush interval.
pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = Connection::open(path)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                provider TEXT NOT NULL DEFAULT 'anthropic',
                tier INTEGER NOT NULL DEFAULT 1,
                auth_type TEXT NOT NULL,
                refresh_token TEXT,
                access_token TEXT,
                expires_at INTEGER,
                api_key TEXT,
                base_url TEXT,
                paused INTEGER NOT NULL DEFAULT 0,
                rate_limit_status TEXT,
                rate_limit_reset_at INTEGER,
                rate_limit_remaining INTEGER,
                rate_limit_override TEXT,
                session_start INTEGER,
                session_request_count INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                total_requests INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| AppError::Migration(format!("accounts table: {}", e)))?;
        let _ = conn.execute("ALTER TABLE accounts ADD COLUMN rate_limit_override TEXT", []);
        let _ = conn.execute("ALTER TABLE accounts ADD COLUMN base_url TEXT", []);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                account_id TEXT,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                status INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                input_tokens INTEGER,
                output_tokens INTEGER,
                cost_estimate REAL,
                agent TEXT,
                truncated INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(|e| AppError::Migration(format!("requests table: {}", e)))?;
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp)",
            [],
        );
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_requests_account ON requests(account_id)",
            [],
        );

        Ok(())
    }

    fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
        let tier_raw: u8 = row.get("tier")?;
        let auth_raw: String = row.get("auth_type")?;
        let override_raw: Option<String> = row.get("rate_limit_override")?;
        Ok(Account {
            id: row.get("id")?,
            name: row.get("name")?,
            provider: row.get("provider")?,
            tier: Tier::try_from(tier_raw).unwrap_or(Tier::Pro),
            auth_type: AuthType::parse(&auth_raw).unwrap_or(AuthType::ApiKey),
            refresh_token: row.get("refresh_token")?,
            access_token: row.get("access_token")?,
            expires_at: row.get("expires_at")?,
            api_key: row.get("api_key")?,
            base_url: row.get("base_url")?,
            paused: row.get("paused")?,
            rate_limit_status: row.get("rate_limit_status")?,
            rate_limit_reset_at: row.get("rate_limit_reset_at")?,
            rate_limit_remaining: row.get("rate_limit_remaining")?,
            rate_limit_override: override_raw
                .and_then(|raw| serde_json::from_str::<RateLimitOverride>(&raw).ok()),
            session_start: row.get("session_start")?,
            session_request_count: row.get("session_request_count")?,
            request_count: row.get("request_count")?,
            total_requests: row.get("total_requests")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, String> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM accounts ORDER BY created_at ASC")
            .map_err(|e| format!("Failed to prepare account query: {}", e))?;
        let rows = stmt
            .query_map([], Self::row_to_account)
            .map_err(|e| format!("Failed to query accounts: {}", e))?;

        let mut accounts = Vec::new();
        for account in rows {
            accounts.push(account.map_err(|e| format!("Failed to parse account row: {}", e))?);
        }
        Ok(accounts)
    }

    pub fn get_account(&self, id: &str) -> Result<Option<Account>, String> {
        let conn = self.conn.lock();
        let result = conn
            .prepare("SELECT * FROM accounts WHERE id = ?1")
            .map_err(|e| format!("Failed to prepare account query: {}", e))?
            .query_row(params![id], Self::row_to_account)
            .optional()
            .map_err(|e| format!("Failed to query account: {}", e));
        result
    }

    pub fn get_account_by_name(&self, name: &str) -> Result<Option<Account>, String> {
        let conn = self.conn.lock();
        let result = conn
            .prepare("SELECT * FROM accounts WHERE name = ?1")
            .map_err(|e| format!("Failed to prepare account query: {}", e))?
            .query_row(params![name], Self::row_to_account)
            .optional()
            .map_err(|e| format!("Failed to query account by name: {}", e));
        result
    }

    pub fn insert_account(&self, account: &Account) -> Result<(), String> {
        let conn = self.conn.lock();
        let override_json = account
            .rate_limit_override
            .as_ref()
            .map(|o| serde_json::to_string(o).unwrap_or_default());
        conn.execute(
            "INSERT INTO accounts (
                id, name, provider, tier, auth_type, refresh_token, access_token,
                expires_at, api_key, base_url, paused, rate_limit_status,
                rate_limit_reset_at, rate_limit_remaining, rate_limit_override,
                session_start, session_request_count, request_count, total_requests,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                account.id,
                account.name,
                account.provider,
                account.tier.weight() as u8,
                account.auth_type.as_str(),
                account.refresh_token,
                account.access_token,
                account.expires_at,
                account.api_key,
                account.base_url,
                account.paused,
                account.rate_limit_status,
                account.rate_limit_reset_at,
                account.rate_limit_remaining,
                override_json,
                account.session_start,
                account.session_request_count,
                account.request_count,
                account.total_requests,
                account.created_at,
            ],
        )
        .map_err(|e| format!("Failed to insert account: {}", e))?;
        Ok(())
    }

    pub fn delete_account_by_name(&self, name: &str) -> Result<bool, String> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM accounts WHERE name = ?1", params![name])
            .map_err(|e| format!("Failed to delete account: {}", e))?;
        Ok(affected > 0)
    }

    pub fn insert_usage_record(&self, record: &UsageRecord) -> Result<(), String> {
        let conn = self.conn.lock();
        Self::insert_usage_record_on(&conn, record)
    }

    fn insert_usage_record_on(conn: &Connection, record: &UsageRecord) -> Result<(), String> {
        conn.execute(
            "INSERT INTO requests (
                id, account_id, method, path, status, timestamp, duration_ms,
                attempts, input_tokens, output_tokens, cost_estimate, agent, truncated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.request_id,
                record.account_id,
                record.method,
                record.path,
                record.status,
                record.timestamp,
                record.duration_ms,
                record.attempts,
                record.input_tokens,
                record.output_tokens,
                record.cost_estimate,
                record.agent,
                record.truncated,
            ],
        )
        .map_err(|e| format!("Failed to insert usage record: {}", e))?;
        Ok(())
    }

    pub fn list_requests(&self, limit: usize, offset: usize) -> Result<Vec<UsageRecord>, String> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, method, path, status, timestamp, duration_ms,
                        attempts, input_tokens, output_tokens, cost_estimate, agent, truncated
                 FROM requests ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
            )
            .map_err(|e| format!("Failed to prepare request query: {}", e))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                Ok(UsageRecord {
                    request_id: row.get(0)?,
                    account_id: row.get(1)?,
                    method: row.get(2)?,
                    path: row.get(3)?,
                    status: row.get(4)?,
                    timestamp: row.get(5)?,
                    duration_ms: row.get(6)?,
                    attempts: row.get(7)?,
                    input_tokens: row.get(8)?,
                    output_tokens: row.get(9)?,
                    cost_estimate: row.get(10)?,
                    agent: row.get(11)?,
                    truncated: row.get(12)?,
                })
            })
            .map_err(|e| format!("Failed to query requests: {}", e))?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record.map_err(|e| format!("Failed to parse request row: {}", e))?);
        }
        Ok(records)
    }

    pub fn usage_stats(&self) -> Result<UsageStats, String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status >= 200 AND status < 400 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status >= 400 THEN 1 ELSE 0 END), 0)
             FROM requests",
            [],
            |row| {
                Ok(UsageStats {
                    total_requests: row.get(0)?,
                    success_count: row.get(1)?,
                    error_count: row.get(2)?,
                })
            },
        )
        .map_err(|e| format!("Failed to query usage stats: {}", e))
    }

    // Applies a drained writer batch inside one transaction, in enqueue order.
    pub fn apply_batch(&self, ops: &[super::writer::ResolvedOp]) -> Result<(), String> {
        use super::writer::ResolvedOp;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| format!("Failed to open transaction: {}", e))?;

        for op in ops {
            match op {
                ResolvedOp::IncrementUsage {
                    account_id,
                    count,
                    now,
                    session_ttl_secs,
                } => {
                    // A fresh or expired session restarts at `now`; a live one
                    // only accumulates, keeping its original session_start.
                    let session_floor = now - *session_ttl_secs as i64;
                    tx.execute(
                        "UPDATE accounts SET
                            request_count = request_count + ?1,
                            total_requests = total_requests + ?1,
                            session_request_count = CASE
                                WHEN session_start IS NULL OR session_start < ?2 THEN ?1
                                ELSE session_request_count + ?1
                            END,
                            session_start = CASE
                                WHEN session_start IS NULL OR session_start < ?2 THEN ?3
                                ELSE session_start
                            END
                         WHERE id = ?4",
                        params![count, session_floor, now, account_id],
                    )
                    .map_err(|e| format!("Failed to increment usage: {}", e))?;
                }
                ResolvedOp::MarkRateLimited {
                    account_id,
                    reset_at,
                } => {
                    tx.execute(
                        "UPDATE accounts SET rate_limit_reset_at = ?1 WHERE id = ?2",
                        params![reset_at, account_id],
                    )
                    .map_err(|e| format!("Failed to mark rate limited: {}", e))?;
                }
                ResolvedOp::ClearRateLimit {
                    account_id,
                    reset_request_count,
                } => {
                    if *reset_request_count {
                        tx.execute(
                            "UPDATE accounts SET rate_limit_reset_at = NULL, request_count = 0
                             WHERE id = ?1 AND (rate_limit_reset_at IS NULL OR rate_limit_reset_at <= CAST(strftime('%s','now') AS INTEGER))",
                            params![account_id],
                        )
                    } else {
                        tx.execute(
                            "UPDATE accounts SET rate_limit_reset_at = NULL
                             WHERE id = ?1 AND (rate_limit_reset_at IS NULL OR rate_limit_reset_at <= CAST(strftime('%s','now') AS INTEGER))",
                            params![account_id],
                        )
                    }
                    .map_err(|e| format!("Failed to clear rate limit: {}", e))?;
                }
                ResolvedOp::UpdateRateLimitMeta {
                    account_id,
                    status,
                    reset_at,
                    remaining,
                } => {
                    tx.execute(
                        "UPDATE accounts SET
                            rate_limit_status = COALESCE(?1, rate_limit_status),
                            rate_limit_reset_at = COALESCE(?2, rate_limit_reset_at),
                            rate_limit_remaining = COALESCE(?3, rate_limit_remaining)
                         WHERE id = ?4",
                        params![status, reset_at, remaining, account_id],
                    )
                    .map_err(|e| format!("Failed to update rate limit meta: {}", e))?;
                }
                ResolvedOp::UpdateTokens {
                    account_id,
                    access_token,
                    expires_at,
                    refresh_token,
                } => {
                    tx.execute(
                        "UPDATE accounts SET
                            access_token = ?1,
                            expires_at = ?2,
                            refresh_token = COALESCE(?3, refresh_token)
                         WHERE id = ?4",
                        params![access_token, expires_at, refresh_token, account_id],
                    )
                    .map_err(|e| format!("Failed to update tokens: {}", e))?;
                }
                ResolvedOp::SetTier { account_id, tier } => {
                    tx.execute(
                        "UPDATE accounts SET tier = ?1 WHERE id = ?2",
                        params![tier.weight() as u8, account_id],
                    )
                    .map_err(|e| format!("Failed to set tier: {}", e))?;
                }
                ResolvedOp::SetPaused { account_id, paused } => {
                    tx.execute(
                        "UPDATE accounts SET paused = ?1 WHERE id = ?2",
                        params![paused, account_id],
                    )
                    .map_err(|e| format!("Failed to set paused: {}", e))?;
                }
                ResolvedOp::Rename { account_id, name } => {
                    tx.execute(
                        "UPDATE accounts SET name = ?1 WHERE id = ?2",
                        params![name, account_id],
                    )
                    .map_err(|e| format!("Failed to rename account: {}", e))?;
                }
                ResolvedOp::UpdateRateLimitOverride {
                    account_id,
                    override_config,
                } => {
                    let json = override_config
                        .as_ref()
                        .map(|o| serde_json::to_string(o).unwrap_or_default());
                    tx.execute(
                        "UPDATE accounts SET rate_limit_override = ?1 WHERE id = ?2",
                        params![json, account_id],
                    )
                    .map_err(|e| format!("Failed to update rate limit override: {}", e))?;
                }
                ResolvedOp::ResetRequestCounts => {
                    tx.execute("UPDATE accounts SET request_count = 0", [])
                        .map_err(|e| format!("Failed to reset request counts: {}", e))?;
                }
                ResolvedOp::InsertUsageRecord { record } => {
                    Self::insert_usage_record_on(&tx, record)?;
                }
            }
        }

        tx.commit()
            .map_err(|e| format!("Failed to commit batch: {}", e))?;
        Ok(())
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
