//! Soft outcomes a reconciler can report instead of a genuine failure.
//!
//! - [`RequeueError`]: expected transient condition (a dependency is not ready
//!   yet); put the key back on the queue without counting a fault.
//! - [`IgnoreError`]: expected and terminal for this pass; drop the key.
//!
//! Anything else is a fault: requeued as well, but logged and counted.

#![forbid(unsafe_code)]

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RequeueError(String);

impl RequeueError {
    pub fn new(msg: impl Into<String>) -> Self { Self(msg.into()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct IgnoreError(String);

impl IgnoreError {
    pub fn new(msg: impl Into<String>) -> Self { Self(msg.into()) }
}

/// Build an `anyhow::Error` carrying a [`RequeueError`] from a format string.
#[macro_export]
macro_rules! requeue_error {
    ($($arg:tt)*) => {
        $crate::__anyhow::Error::new($crate::errors::RequeueError::new(format!($($arg)*)))
    };
}

/// Build an `anyhow::Error` carrying an [`IgnoreError`] from a format string.
#[macro_export]
macro_rules! ignore_error {
    ($($arg:tt)*) => {
        $crate::__anyhow::Error::new($crate::errors::IgnoreError::new(format!($($arg)*)))
    };
}

/// True if any error in the chain is a [`RequeueError`].
pub fn is_requeue_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<RequeueError>())
}

/// True if any error in the chain is an [`IgnoreError`].
pub fn is_ignore_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<IgnoreError>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Requeue,
    Ignore,
    Fault,
}

pub fn classify(err: &anyhow::Error) -> ErrorClass {
    if is_requeue_error(err) {
        ErrorClass::Requeue
    } else if is_ignore_error(err) {
        ErrorClass::Ignore
    } else {
        ErrorClass::Fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn requeue_and_ignore_are_disjoint() {
        let rq = requeue_error!("x {}", 1);
        assert_eq!(rq.to_string(), "x 1");
        assert!(is_requeue_error(&rq));
        assert!(!is_ignore_error(&rq));

        let ig = ignore_error!("y {}", 2);
        assert_eq!(ig.to_string(), "y 2");
        assert!(is_ignore_error(&ig));
        assert!(!is_requeue_error(&ig));
    }

    #[test]
    fn plain_errors_are_faults() {
        let e = anyhow::anyhow!("x {}", 1);
        assert!(!is_requeue_error(&e));
        assert!(!is_ignore_error(&e));
        assert_eq!(classify(&e), ErrorClass::Fault);
    }

    #[test]
    fn sentinel_survives_added_context() {
        let res: anyhow::Result<()> = Err(requeue_error!("pd not ready"));
        let e = res.context("syncing tikv statefulset").unwrap_err();
        assert_eq!(classify(&e), ErrorClass::Requeue);
        let res: anyhow::Result<()> = Err(ignore_error!("cluster paused"));
        let e = res.context("syncing").unwrap_err();
        assert_eq!(classify(&e), ErrorClass::Ignore);
    }
}
