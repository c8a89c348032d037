use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParcelError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("timeout: {operation} exceeded {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ParcelError {
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Upstream conditions the pipeline absorbs as a degraded result.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable(_) | Self::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParcelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_display_not_found() {
        let e = ParcelError::NotFound("zone Z1".into());
        assert_eq!(e.to_string(), "not found: zone Z1");
    }

    #[test]
    fn test_display_timeout() {
        let e = ParcelError::timeout("rule_store.rules_for_zone", Duration::from_millis(250));
        assert_eq!(
            e.to_string(),
            "timeout: rule_store.rules_for_zone exceeded 250ms"
        );
    }

    #[test]
    fn test_display_internal() {
        let e = ParcelError::Internal(anyhow::anyhow!("pool closed"));
        assert_eq!(e.to_string(), "internal: pool closed");
    }

    #[test]
    fn test_degradable_classification() {
        assert!(ParcelError::timeout("x", Duration::from_secs(1)).is_degradable());
        assert!(ParcelError::Unavailable("db".into()).is_degradable());
        assert!(ParcelError::Internal(anyhow::anyhow!("boom")).is_degradable());
        assert!(!ParcelError::InvalidInput("area".into()).is_degradable());
        assert!(!ParcelError::InvalidGeometry("ring".into()).is_degradable());
        assert!(!ParcelError::NotFound("x".into()).is_degradable());
        assert!(!ParcelError::Conflict("x".into()).is_degradable());
    }
}
