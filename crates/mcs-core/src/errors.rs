/// Core error type for the routing subsystem.
///
/// Adapter crates map their specific failures into this taxonomy so the core
/// can decide between retrying, recovering, and surfacing: transient backend
/// errors are retryable at idempotent call sites, permission and not-found
/// failures invalidate the remembered room, and a room mismatch blocks sends
/// until reconciliation succeeds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeouts and 5xx-class backend failures.
    #[error("transient backend error during {op}: {detail}")]
    Transient { op: &'static str, detail: String },

    /// 403-class failures. Non-retryable.
    #[error("forbidden during {op}: {detail}")]
    Forbidden { op: &'static str, detail: String },

    /// The room or state the operation targeted is gone server-side.
    #[error("not found during {op}: {detail}")]
    NotFound { op: &'static str, detail: String },

    /// Local bookkeeping disagrees with the room actually in use and a
    /// recovery pass did not resolve it. The message must not be sent.
    #[error("room state mismatch for department {department}: expected {expected:?}, current {current:?}")]
    RoomMismatch {
        department: String,
        expected: Option<String>,
        current: Option<String>,
    },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Whether a failed room operation means the remembered room is gone for
    /// good. Not-found and permission failures are treated identically here:
    /// either way the record becomes invalid and recovery starts fresh.
    pub fn invalidates_room(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::Forbidden { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_forbidden_invalidate_rooms() {
        let nf = Error::NotFound {
            op: "invite",
            detail: "M_NOT_FOUND".to_string(),
        };
        let fb = Error::Forbidden {
            op: "send",
            detail: "M_FORBIDDEN".to_string(),
        };
        let tr = Error::Transient {
            op: "sync",
            detail: "504".to_string(),
        };
        assert!(nf.invalidates_room());
        assert!(fb.invalidates_room());
        assert!(!tr.invalidates_room());
        assert!(tr.is_transient());
    }
}
