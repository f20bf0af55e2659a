use std::time::Duration;

use anyhow::{Context, Result};
use api::{job::JobApi, tag::TagApi};
use migration::{Migrator, MigratorTrait};
use poem::{Endpoint, EndpointExt, Route, listener::TcpListener};
use poem_openapi::OpenApiService;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use service::{archive::init_db, config::Conf, state::AppContext};
use tracing::info;

pub mod api;
mod error;

pub use error::custom_error;
pub use service::{logic, state};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Default)]
pub struct WebapiOptions {
    pub database_url: Option<String>,
    pub bind_addr: Option<String>,
    pub config_file: String,
    /// rebuild the job tables from the archive before serving
    pub init_db: bool,
    pub debug: bool,
}

impl WebapiOptions {
    fn merge_conf(&self) -> Result<Conf> {
        let real_path = shellexpand::full(&self.config_file)?;
        let mut conf = Conf::parse(real_path.as_ref())?;

        if let Some(v) = &self.database_url {
            conf.database_url = v.to_string();
        }
        if let Some(v) = &self.bind_addr {
            conf.bind_addr = v.to_string();
        }
        conf.debug |= self.debug;
        Ok(conf)
    }
}

pub async fn upgrade(conn: &DatabaseConnection) -> Result<()> {
    if !Migrator::get_pending_migrations(conn).await?.is_empty() {
        Migrator::up(conn, None).await?;
    }
    Ok(())
}

/// All routes, with `ctx` shared by the handlers.
pub fn build_app(ctx: AppContext) -> impl Endpoint {
    let api_service = OpenApiService::new((JobApi, TagApi), "jobmon web api", APP_VERSION)
        .summary("jobmon web api")
        .description("Job lifecycle, metric data and archiving of HPC cluster jobs")
        .server("/api");
    let ui = api_service.rapidoc();

    Route::new()
        .nest("/api", api_service)
        .nest("/doc", ui)
        .catch_all_error(custom_error)
        .data(ctx)
}

pub async fn run(opts: WebapiOptions) -> Result<()> {
    let conf = opts.merge_conf().context("merge config")?;

    let mut connect_opts = ConnectOptions::new(conf.database_url.clone());
    connect_opts.sqlx_logging(conf.debug);
    let conn = Database::connect(connect_opts)
        .await
        .context("failed connect to database")?;

    let ctx = AppContext::builder()
        .db(conn.clone())
        .conf(conf.clone())
        .http_client(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
        )
        .build()?;

    if opts.init_db {
        init_db(&conn, &ctx.archive)
            .await
            .context("import job archive")?;
    } else {
        upgrade(&conn).await.context("upgrade database")?;
    }

    let archivings = ctx.archivings.clone();
    let app = build_app(ctx);

    info!("listening on {}", conf.bind_addr);
    poem::Server::new(TcpListener::bind(conf.bind_addr.clone()))
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            },
            None,
        )
        .await?;

    info!("waiting for {} archiving tasks", archivings.count());
    archivings.wait_all().await;
    Ok(())
}
