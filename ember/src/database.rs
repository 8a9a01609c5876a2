use sqlx::PgPool;

pub async fn run_migrations(connection_string: &str) -> Result<(), anyhow::Error> {
    let pool = PgPool::connect(connection_string).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    pool.close().await;
    Ok(())
}
