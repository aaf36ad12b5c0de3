//! Async timeout wrappers and default durations.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default deadline for socket handshakes and request/response round trips
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for a single socket write or close
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower bound of the jittered keepalive period
pub const KEEPALIVE_MIN_INTERVAL: Duration = Duration::from_secs(20);

/// Upper bound of the jittered keepalive period
pub const KEEPALIVE_MAX_INTERVAL: Duration = Duration::from_secs(90);

/// Ceiling of the flat random pause between reconnect attempts
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Ceiling of the random pause between connect attempts on the send path
pub const SEND_RETRY_MAX_PAUSE: Duration = Duration::from_secs(5);

/// Pause before retrying a read after a non-fatal socket error
pub const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run a future with a deadline, mapping expiry to `ProtocolError::Timeout`
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Like `with_timeout` for futures that already return a `Result`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(future, duration).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_expires() {
        let result = with_timeout(tokio::time::sleep(Duration::from_millis(200)), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_is_preserved() {
        let result: Result<()> =
            with_timeout_error(async { Err(ProtocolError::ConnectionClosed) }, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
