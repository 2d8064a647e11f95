use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Context as _;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use convo::collab::{InMemDirectory, LogNotifier, NotificationDispatcher, StoreAttachmentLinker, WebhookNotifier};
use convo::config::AppConfig;
use convo::openapi::ApiDoc;
use convo::rate_limit::RateLimiter;
use convo::repo::Repo;
use convo::{config, telemetry, AppState, Collaborators, ConversationService};

#[cfg(not(any(feature = "inmem-store", feature = "postgres-store")))]
compile_error!("enable either the `inmem-store` or the `postgres-store` feature");

#[cfg(feature = "postgres-store")]
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    use sqlx::postgres::PgPoolOptions;
    let db_url = cfg.database_url.as_deref().context("DATABASE_URL must be set for postgres-store")?;
    let pool = PgPoolOptions::new().max_connections(5).connect(db_url).await?;
    let repo = convo::repo::pg::PgRepo::new(pool);
    repo.migrate().await?;
    repo.spawn_change_listener();
    info!("Using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    use convo::repo::inmem::InMemRepo;
    let repo = match &cfg.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using in-memory repository with snapshots");
            InMemRepo::with_snapshot(dir.join("conversations.json"))
        }
        None => {
            warn!("CONVO_DATA_DIR not set, conversations will not survive a restart");
            InMemRepo::new()
        }
    };
    Ok(Arc::new(repo))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }
    telemetry::init_tracing();
    let cfg = AppConfig::from_env().context("invalid configuration")?;
    telemetry::prometheus();

    info!("Bootstrapping conversation service");
    info!("Frontend URL: {}", cfg.frontend_url);

    let directory = match &cfg.directory_file {
        Some(path) => InMemDirectory::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            warn!("CONVO_DIRECTORY_FILE not set, user directory starts empty");
            InMemDirectory::new()
        }
    };
    let directory = Arc::new(directory);
    let notifier: Arc<dyn NotificationDispatcher> = match &cfg.notify_webhook {
        Some(url) => {
            info!(%url, "Notifications posted to webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => Arc::new(LogNotifier),
    };

    let repo = build_repo(&cfg).await?;
    let service = ConversationService::new(
        repo.clone(),
        Collaborators {
            users: directory.clone(),
            interventions: directory,
            notifier,
            attachments: Arc::new(StoreAttachmentLinker::new(repo)),
        },
        cfg.service.clone(),
    );
    let state = AppState { service: service.clone(), rate_limiter: Some(RateLimiter::new(cfg.rate_limits.clone())) };

    let openapi = ApiDoc::openapi();
    let frontend = cfg.frontend_url.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            // during local dev allow React/Vite default ports
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allowed_origin(&frontend)
            .allow_any_header()
            .allowed_methods(["GET", "POST", "DELETE", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(cfg.bind.as_str())?;

    info!("Listening on http://{}", cfg.bind);
    server.run().await?;

    service.gateway().shutdown();
    info!("Shut down");
    Ok(())
}
