/// Resolve on the first CTRL+C. Never resolves if the signal handler
/// cannot be installed.
pub async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
