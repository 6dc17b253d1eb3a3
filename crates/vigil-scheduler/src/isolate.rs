//! Panic isolation for independently scheduled units of work.

use std::any::Any;
use std::future::Future;

use tracing::error;

use crate::SchedulerError;

/// Run a future on its own task and convert a panic into an error.
///
/// The caller's task never unwinds: a panic inside `fut` is logged with the
/// given `label` and reported as [`SchedulerError::Panicked`].
pub async fn run_isolated<F, T>(label: &str, fut: F) -> Result<T, SchedulerError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(task = label, panic = %message, "isolated task panicked");
            Err(SchedulerError::Panicked(message))
        }
        Err(_) => Err(SchedulerError::Aborted),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_value() {
        let value = run_isolated("value", async { 41 + 1 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let result = run_isolated("boom", async {
            panic!("boom");
        })
        .await;

        match result {
            Err(SchedulerError::Panicked(message)) => assert_eq!(message, "boom"),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_formatted_panic_message() {
        let result: Result<(), _> = run_isolated("fmt", async move {
            let n = 3;
            panic!("item {n} exploded");
        })
        .await;

        assert!(matches!(result, Err(SchedulerError::Panicked(m)) if m == "item 3 exploded"));
    }
}
