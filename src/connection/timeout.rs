//! A single timeout budget shared by a sequence of operations.

use std::time::{Duration, Instant};

use crate::error::{ConnectionError, Error};

/// One deadline carved into successive per-operation budgets.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutHelper {
    original: Duration,
    deadline: Option<Instant>,
}

impl TimeoutHelper {
    /// `Duration::MAX` (or any budget past the representable horizon) never expires.
    pub fn new(timeout: Duration) -> Self {
        Self {
            original: timeout,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn original_timeout(&self) -> Duration {
        self.original
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Time left, or a timeout error carrying the original budget when none is.
    pub fn remaining_or_timeout(&self) -> Result<Duration, ConnectionError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            Err(self.timeout_error())
        } else {
            Ok(remaining)
        }
    }

    pub fn timeout_error(&self) -> ConnectionError {
        ConnectionError::Timeout {
            timeout: self.original,
        }
    }

    /// Report a per-operation timeout against the whole budget.
    pub fn classify(&self, err: ConnectionError) -> ConnectionError {
        match err {
            ConnectionError::Timeout { .. } => self.timeout_error(),
            other => other,
        }
    }

    /// [`classify`](Self::classify) for failures that come back from a layer above the
    /// connection, such as a stream upgrade running on its own slice of the budget.
    pub fn classify_error(&self, err: Error) -> Error {
        match err {
            Error::Connection(e) => self.classify(e).into(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_budget_never_expires() {
        let t = TimeoutHelper::new(Duration::MAX);
        assert_eq!(t.remaining(), Duration::MAX);
        assert!(t.remaining_or_timeout().is_ok());
    }

    #[test]
    fn expired_budget_reports_original() {
        let t = TimeoutHelper::new(Duration::ZERO);
        match t.remaining_or_timeout() {
            Err(ConnectionError::Timeout { timeout }) => assert_eq!(timeout, Duration::ZERO),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn remaining_shrinks() {
        let t = TimeoutHelper::new(Duration::from_secs(30));
        let r = t.remaining();
        assert!(r <= Duration::from_secs(30));
        assert!(r > Duration::from_secs(29));
        let err = t.classify(ConnectionError::Timeout {
            timeout: Duration::from_millis(5),
        });
        assert!(matches!(err, ConnectionError::Timeout { timeout } if timeout == Duration::from_secs(30)));
    }

    #[test]
    fn upgrade_timeouts_report_the_whole_budget() {
        let t = TimeoutHelper::new(Duration::from_secs(1));
        let err = t.classify_error(Error::Connection(ConnectionError::Timeout {
            timeout: Duration::from_millis(600),
        }));
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout { timeout }) if timeout == Duration::from_secs(1)
        ));
        let other = t.classify_error(Error::Connection(ConnectionError::Closed));
        assert!(matches!(other, Error::Connection(ConnectionError::Closed)));
    }
}
