//! Opaque access-token lookup backing the `key=` query parameter and the
//! bearer header for MCP clients that cannot use the session middleware.

use rusqlite::params;

use super::{MainStore, StoreError};
use crate::proxy::auth::{Role, UserIdentity};

impl MainStore {
    /// Resolves an opaque token into a user identity. Disabled tokens do not
    /// resolve.
    pub fn resolve_token(&self, token: &str) -> Result<Option<UserIdentity>, StoreError> {
        self.conn()
            .query_row(
                "SELECT user_id, role FROM access_tokens WHERE token = ?1 AND enabled = 1",
                params![token],
                |row| {
                    let role: String = row.get(1)?;
                    Ok(UserIdentity {
                        user_id: row.get(0)?,
                        role: role.as_str().into(),
                    })
                },
            )
            .map(Some)
            .or_else(|e| {
                if e == rusqlite::Error::QueryReturnedNoRows {
                    Ok(None)
                } else {
                    Err(StoreError::from(e))
                }
            })
    }

    /// Inserts a token row. Used by tests and the admin seam.
    pub fn create_token(&self, token: &str, user_id: i64, role: Role) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO access_tokens (token, user_id, role, enabled) VALUES (?1, ?2, ?3, 1)",
            params![token, user_id, role.as_str()],
        )?;
        Ok(())
    }
}
