use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error envelope returned by the backend for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl ApiErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("backend returned {status}: {detail}")]
pub struct ApiException {
    pub status: u16,
    pub detail: String,
}

impl ApiException {
    pub fn new(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn from_body(status: u16, raw: &str) -> Self {
        let detail = serde_json::from_str::<ApiErrorBody>(raw)
            .map(|body| body.message())
            .unwrap_or_else(|_| raw.trim().to_string());
        Self::new(status, detail)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}
