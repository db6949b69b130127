use dbmanager::{DatabaseManager, PoolOptions, QueryDescriptor};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost:5432/postgres".to_string());
    let manager = DatabaseManager::new(
        PoolOptions::from_url(url)
            .max(4)
            .connection_timeout_millis(5_000)
            .on_connect(|c| info!(connection = c.id, "connected")),
    )?;

    let now = manager.raw_query("SELECT now() AS now, $1::text AS who", &("demo",)).await?;
    info!(row = ?now.rows.first(), "server time");

    manager
        .run_tx(|c| {
            Box::pin(async move {
                c.query("CREATE TEMP TABLE demo (id int PRIMARY KEY, name text)").await?;
                c.query(
                    QueryDescriptor::new("INSERT INTO demo (id, name) VALUES ($1, $2)")
                        .bind(1i32)
                        .bind("first"),
                )
                .await?;
                let rows = c.raw_query("SELECT count(*) AS n FROM demo", &()).await?;
                info!(count = ?rows.get(0, "n"), "rows inside the transaction");
                Ok(())
            })
        })
        .await?;

    manager.close().await?;
    Ok(())
}
