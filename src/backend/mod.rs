//! Storage backend abstraction.
//!
//! The cache talks to the relational storage proxy through
//! [`StorageBackend`]: describe a table, find its split column, run a keyed
//! query, run a keyed write. Rows travel as string tuples in the column
//! order of the statement that produced them.

use crate::error::BackendError;
use crate::types::HintKey;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Result type alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Rows returned by the backend.
pub type Rows = Vec<Vec<String>>;

/// A parameterized SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<String>,
}

/// Keyed read against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub table: String,
    /// Keys the statement addresses, used by the proxy for routing.
    pub keys: Vec<HintKey>,
    /// Selected columns, in result order.
    pub fields: Vec<String>,
    pub statement: Statement,
}

/// Keyed write against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub table: String,
    pub key: HintKey,
    pub statement: Statement,
}

/// Metadata and storage service in front of the database.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Column description of a table. Each row starts with the column name
    /// followed by its SQL type.
    async fn describe_table(&self, table: &str) -> BackendResult<Rows>;

    /// Name of the column the proxy splits the table on. `None` or an empty
    /// name means the table is not split.
    async fn split_hint_column(&self, table: &str) -> BackendResult<Option<String>>;

    /// Run a keyed read.
    async fn query(&self, query: &RowQuery) -> BackendResult<Rows>;

    /// Run a keyed write.
    async fn write(&self, write: &RowWrite) -> BackendResult<()>;
}

/// Run a backend call with a timeout, retrying exactly once on a transient
/// failure. Application errors reported by the backend are not retried.
pub(crate) async fn call_with_retry<T, F, Fut>(
    operation: &'static str,
    table: &str,
    timeout: Duration,
    mut call: F,
) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    match with_timeout(timeout, call()).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => {
            warn!(operation, table, error = %e, "Backend call failed, retrying once");
            let retried = with_timeout(timeout, call()).await;
            if let Err(ref e) = retried {
                warn!(operation, table, error = %e, "Backend call failed after retry");
            }
            retried
        }
        Err(e) => {
            warn!(operation, table, error = %e, "Backend rejected call");
            Err(e)
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = BackendResult<T>>,
) -> BackendResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(BackendError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_success_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = call_with_retry("query", "users", TIMEOUT, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BackendError>(7)
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = call_with_retry("query", "users", TIMEOUT, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BackendError::Unavailable("connection reset".into()))
            } else {
                Ok(1)
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_double_failure_is_terminal() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: BackendResult<()> = call_with_retry("write", "users", TIMEOUT, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_application_error_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: BackendResult<()> = call_with_retry("write", "users", TIMEOUT, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Reported {
                code: 100_001,
                message: "syntax error".into(),
                raiser: "dbproxy".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(BackendError::Reported { code: 100_001, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: BackendResult<()> =
            call_with_retry("query", "users", Duration::from_millis(50), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(BackendError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
