use std::sync::Arc;

use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::{
    App,
    configuration::Settings,
    handlers::app,
    lifecycle::VmLifecycleManager,
    reconcile::{self, ReconcileContext, WorkQueue},
    token_broker::GithubTokenBroker,
    vm_client::VmClient,
};

const RECONCILE_WORKERS: usize = 4;

pub async fn run(
    listener: TcpListener,
    db_pool: PgPool,
    settings: Settings,
) -> anyhow::Result<()> {
    let (queue, rx) = WorkQueue::new();
    let a = App::new(db_pool, queue.clone());

    let broker = Arc::new(GithubTokenBroker::new(
        settings.github.api_url.clone(),
        settings.github.html_url.clone(),
        settings.github.token.clone(),
    ));
    let client = VmClient::new(settings.vm.daemon_urls.clone());
    let lifecycle = Arc::new(VmLifecycleManager::new(
        client,
        broker,
        settings.vm.clone(),
        settings.github.html_url.clone(),
    ));

    let ctx = Arc::new(ReconcileContext {
        pool: a.pool_arc(),
        firecracker: lifecycle,
        queue: queue.clone(),
        settings: settings.vm.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcilers = tokio::spawn(reconcile::run(ctx, rx, RECONCILE_WORKERS, shutdown_rx));

    let router = app(a);
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    // Stop the workers once the HTTP surface is down.
    let _ = shutdown_tx.send(true);
    let _ = reconcilers.await;
    Ok(())
}
