use serde::{Deserialize, Serialize};

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_PREPARING: &str = "preparing";
pub const STATUS_DONE: &str = "done";
pub const STATUS_ERROR: &str = "error";

/// Progress record published per bucket while a calculation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub message: String,
    pub current: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn idle() -> Self {
        Self {
            message: STATUS_IDLE.to_string(),
            current: 0,
            total: 0,
            error: None,
        }
    }

    pub fn preparing(total: usize) -> Self {
        Self {
            message: STATUS_PREPARING.to_string(),
            current: 0,
            total,
            error: None,
        }
    }

    pub fn progress(message: impl Into<String>, current: usize, total: usize) -> Self {
        Self {
            message: message.into(),
            current,
            total,
            error: None,
        }
    }

    pub fn done(total: usize) -> Self {
        Self {
            message: STATUS_DONE.to_string(),
            current: total,
            total,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            message: STATUS_ERROR.to_string(),
            current: 0,
            total: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.message == STATUS_ERROR
    }

    pub fn is_done(&self) -> bool {
        self.message == STATUS_DONE
    }
}
