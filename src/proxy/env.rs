//! Effective-environment resolution for stdio services.
//!
//! Pure function of the service record and an optional per-user override
//! map: defaults first, user values win per key, output order is stable
//! insertion order. Non-stdio services carry headers instead and resolve to
//! nothing here.

use indexmap::IndexMap;

use crate::db::{ServiceRecord, ServiceType};

/// Computes the ordered environment vector for a service instance.
///
/// The override map is only honored for stdio services whose record allows
/// user overrides; otherwise it is silently ignored.
pub fn resolve_env(
    record: &ServiceRecord,
    user_override: Option<&IndexMap<String, String>>,
) -> Option<Vec<(String, String)>> {
    if record.service_type != ServiceType::Stdio {
        return None;
    }

    let mut merged: IndexMap<String, String> = record.default_envs().unwrap_or_else(|e| {
        log::warn!("Service {} has malformed default envs: {}", record.name, e);
        IndexMap::new()
    });

    if record.allow_user_override {
        if let Some(overrides) = user_override {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    Some(merged.into_iter().collect())
}

/// Whether a request from `user_override`'s owner needs a user-scoped
/// instance rather than the shared one.
pub fn needs_user_instance(record: &ServiceRecord, has_override: bool) -> bool {
    record.service_type == ServiceType::Stdio && record.allow_user_override && has_override
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HealthStatus;

    fn stdio_record(allow_override: bool) -> ServiceRecord {
        ServiceRecord {
            id: 1,
            name: "echo".into(),
            service_type: ServiceType::Stdio,
            enabled: true,
            deleted: false,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
            health_details: None,
            command: "bash".into(),
            args_json: "[]".into(),
            headers_json: "{}".into(),
            default_envs_json: r#"{"A":"1","X":"1"}"#.into(),
            allow_user_override: allow_override,
            rpd_limit: 0,
            request_timeout_s: None,
            installer_user_id: None,
            created_at: None,
        }
    }

    fn overrides() -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        map.insert("X".to_string(), "2".to_string());
        map.insert("B".to_string(), "3".to_string());
        map
    }

    #[test]
    fn user_values_win_per_key_in_stable_order() {
        let record = stdio_record(true);
        let env = resolve_env(&record, Some(&overrides())).unwrap();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("X".to_string(), "2".to_string()),
                ("B".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn overrides_ignored_when_policy_disallows() {
        let record = stdio_record(false);
        let env = resolve_env(&record, Some(&overrides())).unwrap();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("X".to_string(), "1".to_string()),
            ]
        );
        assert!(!needs_user_instance(&record, true));
    }

    #[test]
    fn non_stdio_resolves_to_nothing() {
        let mut record = stdio_record(true);
        record.service_type = ServiceType::Sse;
        assert!(resolve_env(&record, Some(&overrides())).is_none());
        assert!(!needs_user_instance(&record, true));
    }

    #[test]
    fn stdio_with_override_needs_user_instance() {
        let record = stdio_record(true);
        assert!(needs_user_instance(&record, true));
        assert!(!needs_user_instance(&record, false));
    }
}
