use tokio::net::TcpListener;

use common::telemetry::{get_subscriber, init_subscriber};
use ember::{configuration::get_configuration, database, startup::run};
use sqlx::PgPool;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let subscriber = get_subscriber("ember".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let configuration = get_configuration().expect("Failed to read configuration.");
    database::run_migrations(&configuration.database.connection_string())
        .await
        .expect("Failed to run migrations");

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );

    let db_options = configuration.database.with_db();
    let connection_pool = PgPool::connect_lazy_with(db_options);
    tracing::info!("Starting server on {}", address);
    tracing::info!(
        "Daemon endpoints: {}",
        configuration.vm.daemon_urls.join(", ")
    );
    let listener = TcpListener::bind(address).await?;

    if let Err(e) = run(listener, connection_pool, configuration).await {
        tracing::error!("Server failed: {}", e);
    }

    Ok(())
}
