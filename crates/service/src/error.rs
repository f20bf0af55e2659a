use std::sync::Arc;

use thiserror::Error;

/// Failures callers are expected to tell apart. Logic returns `anyhow::Error`
/// wrapping one of these; the web layer downcasts to pick a status code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("invalid request - {0}")]
    Validation(String),
    #[error("conflict - {0}")]
    Conflict(String),
    #[error("not found - {0}")]
    NotFound(String),
    #[error("metric data repository failed - {0}")]
    Adapter(String),
    #[error("storage failure - {0}")]
    Storage(String),
    #[error("archiving failed - {0}")]
    ArchivingFailure(String),
}

impl MonitorError {
    pub fn of(e: &anyhow::Error) -> Option<&MonitorError> {
        e.downcast_ref::<MonitorError>()
    }

    pub fn is_not_found(e: &anyhow::Error) -> bool {
        matches!(Self::of(e), Some(MonitorError::NotFound(_)))
    }
}

/// Turn an error shared by the cache between waiters back into an owned one,
/// keeping its kind.
pub fn unshare(e: Arc<anyhow::Error>) -> anyhow::Error {
    match Arc::try_unwrap(e) {
        Ok(e) => e,
        Err(e) => match MonitorError::of(&e) {
            Some(kind) => kind.clone().into(),
            None => anyhow::anyhow!("{e:#}"),
        },
    }
}

#[test]
fn test_unshare_keeps_kind() {
    let e = Arc::new(anyhow::Error::from(MonitorError::NotFound("job 1".into())));
    let other = e.clone();
    let owned = unshare(e);
    assert!(MonitorError::is_not_found(&owned));
    drop(other);
}
