use std::fmt::Display;
use std::future::Future;

use tracing::warn;

pub(crate) async fn with_fallback<T, E, P, F, Fut, R>(
    operation: &'static str,
    primary: P,
    fallback: F,
) -> Result<T, R>
where
    E: Display,
    P: Future<Output = Result<T, E>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, R>>,
{
    match primary.await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(operation, error = %err, "worker path failed, retrying on main thread");
            fallback().await
        }
    }
}
