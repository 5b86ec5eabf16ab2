//! Cancellation helpers.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};

/// Runs `future` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`ControllerError::Cancelled`] on cancellation, or the future's
/// own error converted into a [`ControllerError`].
pub async fn cancellable<T, E, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<ControllerError>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ControllerError::Cancelled),
        outcome = future => outcome.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocisync_registry::RegistryError;

    #[tokio::test]
    async fn test_passes_through_result() {
        let cancel = CancellationToken::new();
        let ok: Result<u8> = cancellable(&cancel, async { Ok::<_, RegistryError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u8> =
            cancellable(&cancel, async { Err(RegistryError::not_found("x")) }).await;
        assert!(matches!(err, Err(ControllerError::Registry(_))));
    }

    #[tokio::test]
    async fn test_cancelled_future_is_abandoned() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: Result<()> =
            cancellable(&cancel, std::future::pending::<std::result::Result<(), RegistryError>>())
                .await;
        assert!(matches!(outcome, Err(ControllerError::Cancelled)));
    }
}
