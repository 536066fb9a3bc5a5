use quillan_backend::config::Settings;
use quillan_backend::{build_state, routes::build_router, telemetry};
use sqlx::mysql::MySqlPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init_tracing()?;

    let settings = Settings::from_env();
    let addr = settings.bind_addr()?;
    if settings.gemini.is_none() {
        tracing::warn!("GEMINI_API_KEY is not set, ai generation uses the offline mock");
    }

    if let Some(db_url) = settings.database_url.as_deref() {
        match MySqlPoolOptions::new().max_connections(5).connect(db_url).await {
            Ok(pool) => match sqlx::migrate!("./migrations").run(&pool).await {
                Ok(_) => tracing::info!("mysql connected and migrations applied"),
                Err(err) => tracing::warn!("mysql connected but migrations failed: {}", err),
            },
            Err(err) => {
                tracing::warn!(
                    "mysql is unavailable ({}), backend continues in local in-memory mode",
                    err
                );
            }
        }
    }

    let state = build_state(settings)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("backend listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
