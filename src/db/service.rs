//! Service records: the persisted description of each proxied MCP backend.
//!
//! JSON columns (`args_json`, `default_envs_json`, `headers_json`) hold
//! canonical JSON strings; accessors parse them on demand so a malformed row
//! surfaces as a `StoreError` instead of a panic.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use super::{MainStore, StoreError};

/// Transport type of a backend MCP service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Local subprocess speaking MCP over stdin/stdout.
    Stdio,
    /// Remote Server-Sent Events endpoint.
    Sse,
    /// Remote streamable-HTTP endpoint.
    StreamableHttp,
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> Self {
        match value {
            "sse" => ServiceType::Sse,
            "streamable_http" => ServiceType::StreamableHttp,
            _ => ServiceType::Stdio,
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Stdio => write!(f, "stdio"),
            ServiceType::Sse => write!(f, "sse"),
            ServiceType::StreamableHttp => write!(f, "streamable_http"),
        }
    }
}

/// Health classification maintained by the health monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Starting,
    Healthy,
    Warning,
    Unhealthy,
    Stopped,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Stopped => "stopped",
        }
    }
}

impl From<&str> for HealthStatus {
    fn from(value: &str) -> Self {
        match value {
            "starting" => HealthStatus::Starting,
            "healthy" => HealthStatus::Healthy,
            "warning" => HealthStatus::Warning,
            "unhealthy" => HealthStatus::Unhealthy,
            "stopped" => HealthStatus::Stopped,
            _ => HealthStatus::Unknown,
        }
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted service row. Treated as immutable by the proxy between reload
/// events; the only path to picking up a change is cache invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub enabled: bool,
    pub deleted: bool,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_details: Option<String>,
    /// Executable for `stdio`; upstream URL for `sse`/`streamable_http`.
    pub command: String,
    pub args_json: String,
    pub headers_json: String,
    pub default_envs_json: String,
    pub allow_user_override: bool,
    /// Per-user daily request cap; 0 means unlimited.
    pub rpd_limit: i64,
    /// Per-request timeout for streamable-HTTP upstreams, seconds.
    pub request_timeout_s: Option<u64>,
    pub installer_user_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    /// Parses the argument vector for a `stdio` service.
    pub fn args(&self) -> Result<Vec<String>, StoreError> {
        if self.args_json.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.args_json).map_err(StoreError::from)
    }

    /// Parses the upstream header map for remote services.
    pub fn headers(&self) -> Result<IndexMap<String, String>, StoreError> {
        if self.headers_json.trim().is_empty() {
            return Ok(IndexMap::new());
        }
        serde_json::from_str(&self.headers_json).map_err(StoreError::from)
    }

    /// Parses the service-wide default environment (`stdio` only).
    pub fn default_envs(&self) -> Result<IndexMap<String, String>, StoreError> {
        if self.default_envs_json.trim().is_empty() {
            return Ok(IndexMap::new());
        }
        serde_json::from_str(&self.default_envs_json).map_err(StoreError::from)
    }
}

/// Partial update applied by the admin reconfigure seam. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceUpdate {
    pub command: Option<String>,
    pub args_json: Option<String>,
    pub headers_json: Option<String>,
    pub default_envs_json: Option<String>,
    #[serde(rename = "type")]
    pub service_type: Option<ServiceType>,
    pub allow_user_override: Option<bool>,
    pub rpd_limit: Option<i64>,
    pub request_timeout_s: Option<u64>,
}

impl ServiceUpdate {
    /// True when the update changes what a live instance was built from, so
    /// existing instances must be drained.
    pub fn affects_instances(&self) -> bool {
        self.command.is_some()
            || self.args_json.is_some()
            || self.headers_json.is_some()
            || self.default_envs_json.is_some()
            || self.service_type.is_some()
            || self.request_timeout_s.is_some()
    }
}

const SERVICE_COLUMNS: &str = "id, name, type, enabled, deleted, health_status, last_health_check, \
     health_details, command, args_json, headers_json, default_envs_json, \
     allow_user_override, rpd_limit, request_timeout_s, installer_user_id, created_at";

fn row_to_service(row: &Row) -> rusqlite::Result<ServiceRecord> {
    let service_type: String = row.get("type")?;
    let health_status: String = row.get("health_status")?;
    let last_health_check: Option<String> = row.get("last_health_check")?;
    let created_at: Option<String> = row.get("created_at")?;
    Ok(ServiceRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        service_type: service_type.as_str().into(),
        enabled: row.get("enabled")?,
        deleted: row.get("deleted")?,
        health_status: health_status.as_str().into(),
        last_health_check: last_health_check.and_then(parse_utc),
        health_details: row.get("health_details")?,
        command: row.get("command")?,
        args_json: row.get("args_json")?,
        headers_json: row.get("headers_json")?,
        default_envs_json: row.get("default_envs_json")?,
        allow_user_override: row.get("allow_user_override")?,
        rpd_limit: row.get("rpd_limit")?,
        request_timeout_s: row.get::<_, Option<i64>>("request_timeout_s")?.map(|v| v as u64),
        installer_user_id: row.get("installer_user_id")?,
        created_at: created_at.and_then(parse_utc),
    })
}

fn parse_utc(raw: String) -> Option<DateTime<Utc>> {
    // Stored either as RFC 3339 (our writes) or sqlite's `datetime('now')`.
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .ok()
        })
}

impl MainStore {
    /// Retrieves a service by its URL-safe unique name. Soft-deleted rows are
    /// not visible here.
    pub fn get_service_by_name(&self, name: &str) -> Result<ServiceRecord, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {SERVICE_COLUMNS} FROM services WHERE name = ?1 AND deleted = 0"),
                [name],
                row_to_service,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("service not found: {}", name))
                }
                other => StoreError::from(other),
            })
    }

    /// Retrieves a service by id, including soft-deleted rows.
    pub fn get_service(&self, id: i64) -> Result<ServiceRecord, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?1"),
                [id],
                row_to_service,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("service not found: id {}", id))
                }
                other => StoreError::from(other),
            })
    }

    /// Lists services that are enabled and not soft-deleted, the working set
    /// for the health monitor and the startup synchronizer.
    pub fn list_active_services(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE enabled = 1 AND deleted = 0 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_service)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Lists all non-deleted services.
    pub fn list_services(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE deleted = 0 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_service)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Inserts a new service row and returns its id.
    pub fn create_service(&self, record: &ServiceRecord) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO services (name, type, enabled, command, args_json, headers_json, \
             default_envs_json, allow_user_override, rpd_limit, request_timeout_s, installer_user_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.name,
                record.service_type.to_string(),
                record.enabled,
                record.command,
                record.args_json,
                record.headers_json,
                record.default_envs_json,
                record.allow_user_override,
                record.rpd_limit,
                record.request_timeout_s.map(|v| v as i64),
                record.installer_user_id,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Applies a partial update to a service row.
    pub fn update_service(&self, id: i64, update: &ServiceUpdate) -> Result<(), StoreError> {
        let existing = self.get_service(id)?;
        self.conn().execute(
            "UPDATE services SET command = ?1, args_json = ?2, headers_json = ?3, \
             default_envs_json = ?4, type = ?5, allow_user_override = ?6, rpd_limit = ?7, \
             request_timeout_s = ?8 WHERE id = ?9",
            params![
                update.command.as_ref().unwrap_or(&existing.command),
                update.args_json.as_ref().unwrap_or(&existing.args_json),
                update.headers_json.as_ref().unwrap_or(&existing.headers_json),
                update
                    .default_envs_json
                    .as_ref()
                    .unwrap_or(&existing.default_envs_json),
                update
                    .service_type
                    .unwrap_or(existing.service_type)
                    .to_string(),
                update.allow_user_override.unwrap_or(existing.allow_user_override),
                update.rpd_limit.unwrap_or(existing.rpd_limit),
                update
                    .request_timeout_s
                    .or(existing.request_timeout_s)
                    .map(|v| v as i64),
                id,
            ],
        )?;
        Ok(())
    }

    /// Flips the enabled flag.
    pub fn set_service_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("UPDATE services SET enabled = ?1 WHERE id = ?2", params![enabled, id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("service not found: id {}", id)));
        }
        Ok(())
    }

    /// Marks a service soft-deleted (and disabled). The row stays for stats.
    pub fn soft_delete_service(&self, id: i64) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE services SET deleted = 1, enabled = 0 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("service not found: id {}", id)));
        }
        Ok(())
    }

    /// Records a health observation for a service.
    pub fn update_service_health(
        &self,
        id: i64,
        status: HealthStatus,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE services SET health_status = ?1, last_health_check = ?2, health_details = ?3 \
             WHERE id = ?4",
            params![status.as_str(), Utc::now().to_rfc3339(), details, id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_service() -> (MainStore, i64) {
        let store = MainStore::open_in_memory().expect("in-memory store");
        let id = store
            .create_service(&ServiceRecord {
                id: 0,
                name: "echo".into(),
                service_type: ServiceType::Stdio,
                enabled: true,
                deleted: false,
                health_status: HealthStatus::Unknown,
                last_health_check: None,
                health_details: None,
                command: "bash".into(),
                args_json: r#"["-c","cat"]"#.into(),
                headers_json: "{}".into(),
                default_envs_json: r#"{"X":"1"}"#.into(),
                allow_user_override: true,
                rpd_limit: 0,
                request_timeout_s: None,
                installer_user_id: Some(1),
                created_at: None,
            })
            .expect("insert");
        (store, id)
    }

    #[test]
    fn round_trips_service_rows() {
        let (store, id) = store_with_service();
        let rec = store.get_service_by_name("echo").expect("lookup");
        assert_eq!(rec.id, id);
        assert_eq!(rec.service_type, ServiceType::Stdio);
        assert_eq!(rec.args().unwrap(), vec!["-c".to_string(), "cat".to_string()]);
        assert_eq!(rec.default_envs().unwrap().get("X").map(String::as_str), Some("1"));
        assert!(rec.enabled);
    }

    #[test]
    fn soft_delete_hides_by_name_but_not_by_id() {
        let (store, id) = store_with_service();
        store.soft_delete_service(id).expect("delete");
        assert!(matches!(
            store.get_service_by_name("echo"),
            Err(StoreError::NotFound(_))
        ));
        let rec = store.get_service(id).expect("by id");
        assert!(rec.deleted);
        assert!(!rec.enabled);
        assert!(store.list_active_services().unwrap().is_empty());
    }

    #[test]
    fn partial_update_keeps_unset_fields() {
        let (store, id) = store_with_service();
        let update = ServiceUpdate {
            rpd_limit: Some(5),
            ..Default::default()
        };
        assert!(!update.affects_instances());
        store.update_service(id, &update).expect("update");
        let rec = store.get_service(id).expect("get");
        assert_eq!(rec.rpd_limit, 5);
        assert_eq!(rec.command, "bash");

        let update = ServiceUpdate {
            command: Some("python3".into()),
            ..Default::default()
        };
        assert!(update.affects_instances());
    }

    #[test]
    fn health_update_sets_timestamp() {
        let (store, id) = store_with_service();
        store
            .update_service_health(id, HealthStatus::Healthy, Some("12 tools"))
            .expect("health");
        let rec = store.get_service(id).expect("get");
        assert_eq!(rec.health_status, HealthStatus::Healthy);
        assert!(rec.last_health_check.is_some());
        assert_eq!(rec.health_details.as_deref(), Some("12 tools"));
    }
}
