//! Per-user environment overrides for stdio services.
//!
//! Written by the external config subsystem through the admin seam; the proxy
//! core only reads them when resolving the effective environment.

use chrono::Utc;
use indexmap::IndexMap;
use rusqlite::params;

use super::{MainStore, StoreError};

impl MainStore {
    /// Returns the override map for a (service, user) pair, or `None` when
    /// the user has no overrides for that service.
    pub fn get_user_env(
        &self,
        service_id: i64,
        user_id: i64,
    ) -> Result<Option<IndexMap<String, String>>, StoreError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT envs_json FROM user_env_overrides WHERE service_id = ?1 AND user_id = ?2",
                params![service_id, user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| {
                if e == rusqlite::Error::QueryReturnedNoRows {
                    Ok(None)
                } else {
                    Err(StoreError::from(e))
                }
            })?;

        match raw {
            Some(json) => {
                let envs: IndexMap<String, String> = serde_json::from_str(&json)?;
                if envs.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(envs))
                }
            }
            None => Ok(None),
        }
    }

    /// Upserts the override map for a (service, user) pair. An empty map
    /// removes the row.
    pub fn set_user_env(
        &self,
        service_id: i64,
        user_id: i64,
        envs: &IndexMap<String, String>,
    ) -> Result<(), StoreError> {
        if envs.is_empty() {
            return self.delete_user_env(service_id, user_id);
        }
        let json = serde_json::to_string(envs)?;
        self.conn().execute(
            "INSERT INTO user_env_overrides (service_id, user_id, envs_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (service_id, user_id) DO UPDATE SET envs_json = ?3, updated_at = ?4",
            params![service_id, user_id, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Removes the override row for a (service, user) pair, if present.
    pub fn delete_user_env(&self, service_id: i64, user_id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM user_env_overrides WHERE service_id = ?1 AND user_id = ?2",
            params![service_id, user_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_read_back() {
        let store = MainStore::open_in_memory().unwrap();
        let mut envs = IndexMap::new();
        envs.insert("X".to_string(), "2".to_string());
        store.set_user_env(3, 7, &envs).unwrap();

        let got = store.get_user_env(3, 7).unwrap().expect("override present");
        assert_eq!(got.get("X").map(String::as_str), Some("2"));
        assert!(store.get_user_env(3, 8).unwrap().is_none());

        envs.insert("Y".to_string(), "z".to_string());
        store.set_user_env(3, 7, &envs).unwrap();
        assert_eq!(store.get_user_env(3, 7).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn empty_map_deletes_row() {
        let store = MainStore::open_in_memory().unwrap();
        let mut envs = IndexMap::new();
        envs.insert("X".to_string(), "2".to_string());
        store.set_user_env(3, 7, &envs).unwrap();
        store.set_user_env(3, 7, &IndexMap::new()).unwrap();
        assert!(store.get_user_env(3, 7).unwrap().is_none());
    }
}
