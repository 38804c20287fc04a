//! Request accounting rows and the per-day rate-limit counters.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{MainStore, StoreError};

/// One accounting row per proxied request. Persisted best-effort by the
/// background drainer, never on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequestStat {
    pub id: Option<i64>,
    pub service_id: i64,
    pub service_name: String,
    pub user_id: i64,
    /// Downstream direction: `sse` or `mcp`.
    pub request_type: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub success: bool,
    pub elapsed_ms: i64,
    pub created_at: Option<DateTime<Utc>>,
}

impl MainStore {
    /// Inserts a request statistic row.
    pub fn record_request_stat(&self, stat: &ProxyRequestStat) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO proxy_request_stats (service_id, service_name, user_id, request_type, \
             method, path, status_code, success, elapsed_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stat.service_id,
                stat.service_name,
                stat.user_id,
                stat.request_type,
                stat.method,
                stat.path,
                stat.status_code,
                stat.success,
                stat.elapsed_ms,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Atomic rate-limit admission for the given UTC day.
    ///
    /// Returns `true` and increments the counter when the request is under
    /// `limit`; returns `false` and leaves the counter unchanged when the cap
    /// is reached. A `limit` of 0 always admits without touching the table.
    pub fn admit_request(
        &self,
        user_id: i64,
        service_id: i64,
        limit: i64,
        day: &str,
    ) -> Result<bool, StoreError> {
        if limit <= 0 {
            return Ok(true);
        }
        // The conditional upsert keeps check and increment in one statement,
        // so concurrent writers on the same connection never over-admit.
        let changed = self.conn().execute(
            "INSERT INTO request_counters (user_id, service_id, day, count) \
             VALUES (?1, ?2, ?3, 1) \
             ON CONFLICT (user_id, service_id, day) \
             DO UPDATE SET count = count + 1 WHERE count < ?4",
            params![user_id, service_id, day, limit],
        )?;
        Ok(changed > 0)
    }

    /// Reads the persisted counter for a (user, service, day) triple.
    pub fn rpd_count(&self, user_id: i64, service_id: i64, day: &str) -> Result<i64, StoreError> {
        self.conn()
            .query_row(
                "SELECT count FROM request_counters \
                 WHERE user_id = ?1 AND service_id = ?2 AND day = ?3",
                params![user_id, service_id, day],
                |row| row.get(0),
            )
            .or_else(|e| {
                if e == rusqlite::Error::QueryReturnedNoRows {
                    Ok(0)
                } else {
                    Err(StoreError::from(e))
                }
            })
    }
}

/// Formats the current UTC calendar day as used by the counters table.
pub fn utc_day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_stops_at_limit_and_counter_is_exact() {
        let store = MainStore::open_in_memory().unwrap();
        let day = utc_day(Utc::now());

        assert!(store.admit_request(1, 9, 2, &day).unwrap());
        assert!(store.admit_request(1, 9, 2, &day).unwrap());
        // Third request is denied and must not move the counter.
        assert!(!store.admit_request(1, 9, 2, &day).unwrap());
        assert!(!store.admit_request(1, 9, 2, &day).unwrap());
        assert_eq!(store.rpd_count(1, 9, &day).unwrap(), 2);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let store = MainStore::open_in_memory().unwrap();
        let day = utc_day(Utc::now());
        for _ in 0..50 {
            assert!(store.admit_request(1, 9, 0, &day).unwrap());
        }
        assert_eq!(store.rpd_count(1, 9, &day).unwrap(), 0);
    }

    #[test]
    fn counters_are_scoped_per_user_and_day() {
        let store = MainStore::open_in_memory().unwrap();
        assert!(store.admit_request(1, 9, 1, "2026-08-01").unwrap());
        assert!(!store.admit_request(1, 9, 1, "2026-08-01").unwrap());
        // Different user and different day are independent.
        assert!(store.admit_request(2, 9, 1, "2026-08-01").unwrap());
        assert!(store.admit_request(1, 9, 1, "2026-08-02").unwrap());
    }

    #[test]
    fn stat_rows_persist() {
        let store = MainStore::open_in_memory().unwrap();
        let id = store
            .record_request_stat(&ProxyRequestStat {
                id: None,
                service_id: 9,
                service_name: "echo".into(),
                user_id: 1,
                request_type: "sse".into(),
                method: "GET".into(),
                path: "/sse".into(),
                status_code: 200,
                success: true,
                elapsed_ms: 42,
                created_at: None,
            })
            .unwrap();
        assert!(id > 0);
    }
}
