//! Stop signal shared by the engine's tasks.

use tokio::sync::watch;

/// Resolves once `stop` reads true or its sender is gone.
///
/// The borrow taken by `wait_for` is dropped before this returns, so the
/// future can sit in a `select!` next to arms that borrow the same task.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
