use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hoist_core::{QueueError, QueueResult};

const MAX_PAGE_SIZE: usize = 1000;

/// Offset pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    50
}

impl PageParams {
    pub fn validate(&self) -> QueueResult<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(QueueError::Validation(format!(
                "page_size must be 1-{}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> usize {
        self.page * self.page_size
    }
}

/// Opaque cursor ordered by `(timestamp, id)`; preferred by newer endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub ts: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> QueueResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| QueueError::Validation("malformed cursor".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| QueueError::Validation("malformed cursor".to_string()))
    }

    /// Whether an item at `(ts, id)` comes after this cursor
    pub fn precedes(&self, ts: DateTime<Utc>, id: &str) -> bool {
        (self.ts, self.id.as_str()) < (ts, id)
    }
}
