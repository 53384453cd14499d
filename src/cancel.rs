use crate::error::Error;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    deadline: Option<Instant>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(AtomicOrdering::SeqCst) {
            return true;
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return true;
        }
        self.parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancelled())
    }

    fn deadline_expired(&self) -> bool {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return true;
        }
        self.parent
            .as_ref()
            .is_some_and(|parent| parent.deadline_expired())
    }

    fn reason(&self) -> Option<String> {
        if let Ok(guard) = self.reason.lock()
            && let Some(reason) = guard.as_ref()
        {
            return Some(reason.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.reason())
    }
}

/// Cloneable cancellation handle threaded through every blocking operation.
/// A child token observes its own cancellation, its own deadline, and every
/// ancestor's.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                deadline: None,
                parent: None,
            }),
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                deadline,
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    pub fn child(&self) -> Self {
        self.derive(None)
    }

    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline))
    }

    /// Flip the token. Only the first reason is retained.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.inner.cancelled.store(true, AtomicOrdering::SeqCst);
        if let Ok(mut guard) = self.inner.reason.lock()
            && guard.is_none()
        {
            *guard = Some(reason.into());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.inner
            .reason()
            .unwrap_or_else(|| "cancellation requested".to_string())
    }

    /// The error this token reports for an interrupted operation; a deadline
    /// that expired before any explicit cancel surfaces as DeadlineExceeded.
    pub fn err(&self, context: &str) -> Error {
        if !self.inner.cancelled.load(AtomicOrdering::SeqCst)
            && self
                .inner
                .parent
                .as_ref()
                .is_none_or(|p| !p.cancelled.load(AtomicOrdering::SeqCst))
            && self.inner.deadline_expired()
        {
            return Error::DeadlineExceeded(context.to_string());
        }
        Error::Cancelled(format!("{}: {}", context, self.reason()))
    }

    /// Convenience guard for loop bodies.
    pub fn check(&self, context: &str) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(self.err(context));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn child_observes_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel("stop requested");
        assert!(child.is_cancelled());
        assert!(matches!(child.err("worker loop"), Error::Cancelled(_)));
        assert_eq!(child.reason(), "stop requested");
    }

    #[test]
    fn first_cancellation_reason_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason(), "first");
    }

    #[test]
    fn expired_deadline_reports_deadline_error() {
        let parent = CancelToken::new();
        let child = parent.child_with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(child.is_cancelled());
        assert!(matches!(
            child.err("make build"),
            Error::DeadlineExceeded(_)
        ));
        assert!(!parent.is_cancelled());
    }
}
