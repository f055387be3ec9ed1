//! Source database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// A configured content origin.
///
/// `backend_name` is the registry key identifying which backend enumerates
/// images for this source (e.g. `"claw.reddit.v1"`). `parameter` is opaque to
/// the engine and interpreted by the backend.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SourceDbModel {
    pub id: i64,
    pub backend_name: String,
    pub parameter: String,
    /// Lookback hint passed to the backend. Zero or negative means "use the
    /// backend default".
    pub countback: i64,
    pub is_disabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_run_at: Option<i64>,
}

impl SourceDbModel {
    pub fn new(backend_name: impl Into<String>, parameter: impl Into<String>) -> Self {
        let now = time::now_ms();
        Self {
            id: 0,
            backend_name: backend_name.into(),
            parameter: parameter.into(),
            countback: 0,
            is_disabled: false,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }

    pub fn with_countback(mut self, countback: i64) -> Self {
        self.countback = countback;
        self
    }
}
