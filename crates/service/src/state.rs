use std::sync::Arc;

use anyhow::Result;
use sea_orm::DatabaseConnection;
use tokio::sync::Mutex;

use crate::{
    archive::ArchiveStore,
    cache::MetricCache,
    clusters::ClusterRegistry,
    config::Conf,
    logic::{
        archiver::{ArchiverLogic, InFlight},
        job::JobLogic,
        metric_data::MetricDataLogic,
        tag::TagLogic,
    },
    metricdata::MetricDataRegistry,
    schema::JobData,
    ui::UiDefaults,
};

pub struct Service<'a> {
    pub job: JobLogic<'a>,
    pub tag: TagLogic<'a>,
    pub metric_data: MetricDataLogic<'a>,
    pub archiver: ArchiverLogic<'a>,
}

pub struct AppContextBuilder {
    db: Option<DatabaseConnection>,
    conf: Option<Conf>,
    clusters: Option<ClusterRegistry>,
    metric_repos: Option<MetricDataRegistry>,
    http_client: Option<reqwest::Client>,
}

impl AppContextBuilder {
    pub fn db(mut self, db: DatabaseConnection) -> Self {
        self.db = Some(db);
        self
    }

    pub fn conf(mut self, conf: Conf) -> Self {
        self.conf = Some(conf);
        self
    }

    /// Defaults to the `cluster.json` files below the job archive.
    pub fn clusters(mut self, clusters: ClusterRegistry) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Defaults to one repository per cluster as configured in `cluster.json`.
    pub fn metric_repos(mut self, repos: MetricDataRegistry) -> Self {
        self.metric_repos = Some(repos);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<AppContext> {
        let db = self
            .db
            .ok_or(anyhow::anyhow!("database connection is required"))?;
        let conf = self.conf.ok_or(anyhow::anyhow!("config is required"))?;
        let archive_root = conf.job_archive_path()?;

        let clusters = match self.clusters {
            Some(c) => c,
            None => ClusterRegistry::load(&archive_root)?,
        };
        let http_client = self.http_client.unwrap_or_default();
        let metric_repos = match self.metric_repos {
            Some(r) => r,
            None => MetricDataRegistry::init(&clusters, http_client.clone())?,
        };

        Ok(AppContext {
            archive: ArchiveStore::new(
                archive_root,
                conf.disable_archive,
                conf.cache.archive_capacity,
            ),
            data_cache: MetricCache::new(conf.cache.data_capacity),
            ui_defaults: UiDefaults::new(conf.ui_defaults.clone()),
            archivings: InFlight::default(),
            start_lock: Arc::new(Mutex::new(())),
            clusters: Arc::new(clusters),
            metric_repos,
            http_client,
            conf,
            db,
        })
    }
}

/// Everything the logic layer needs, built once at startup and cloned into
/// request handlers and background tasks.
#[derive(Clone)]
pub struct AppContext {
    pub db: DatabaseConnection,
    pub conf: Conf,
    pub clusters: Arc<ClusterRegistry>,
    pub metric_repos: MetricDataRegistry,
    pub archive: ArchiveStore,
    /// job data by job, state, metrics and scopes
    pub data_cache: MetricCache<Arc<JobData>>,
    pub archivings: InFlight,
    pub ui_defaults: UiDefaults,
    pub http_client: reqwest::Client,
    /// serializes the duplicate check and insert of job starts
    pub start_lock: Arc<Mutex<()>>,
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder {
            db: None,
            conf: None,
            clusters: None,
            metric_repos: None,
            http_client: None,
        }
    }

    pub fn service(&self) -> Service {
        Service {
            job: JobLogic::new(self),
            tag: TagLogic::new(self),
            metric_data: MetricDataLogic::new(self),
            archiver: ArchiverLogic::new(self),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use tempfile::TempDir;

    use super::AppContext;
    use crate::{
        clusters::TEST_CLUSTER_JSON,
        config::Conf,
        metricdata::{MetricDataRegistry, TestMetricDataRepository},
        schema::{JobMeta, Resource},
    };

    pub(crate) struct TestEnv {
        pub ctx: AppContext,
        /// the repository registered for `testcluster`
        pub repo: TestMetricDataRepository,
        _dir: TempDir,
    }

    /// A context over a fresh sqlite database and a job archive holding
    /// only the `testcluster` configuration.
    pub(crate) async fn test_env() -> TestEnv {
        test_env_with(|_| {}).await
    }

    /// Like `test_env`, with `configure` applied to the configuration.
    pub(crate) async fn test_env_with(configure: impl FnOnce(&mut Conf)) -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("job-archive");
        std::fs::create_dir_all(archive.join("testcluster")).unwrap();
        std::fs::write(
            archive.join("testcluster").join("cluster.json"),
            TEST_CLUSTER_JSON,
        )
        .unwrap();

        let db = Database::connect(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("job.db").display()
        ))
        .await
        .unwrap();
        Migrator::up(&db, None).await.unwrap();

        let repo = TestMetricDataRepository::default();
        let mut repos = MetricDataRegistry::default();
        repos.register("testcluster", Arc::new(repo.clone()));

        let mut conf = Conf {
            job_archive: archive.to_string_lossy().to_string(),
            ..Default::default()
        };
        configure(&mut conf);
        let ctx = AppContext::builder()
            .db(db)
            .conf(conf)
            .metric_repos(repos)
            .build()
            .unwrap();

        TestEnv {
            ctx,
            repo,
            _dir: dir,
        }
    }

    impl JobMeta {
        /// A running single node job of alice on `host123` (sub cluster sc1).
        pub(crate) fn example(job_id: i64, start_time: i64) -> Self {
            let mut meta = JobMeta {
                start_time,
                ..Default::default()
            };
            meta.base.job_id = job_id;
            meta.base.cluster = "testcluster".into();
            meta.base.user = "alice".into();
            meta.base.project = "testproj".into();
            meta.base.num_nodes = 1;
            meta.base.num_hwthreads = 8;
            meta.base.walltime = 3600;
            meta.base.resources = vec![Resource {
                hostname: "host123".into(),
                hwthreads: Some((0..8).collect()),
                ..Default::default()
            }];
            meta
        }
    }

    #[tokio::test]
    async fn test_builder_loads_clusters() {
        let env = test_env().await;
        assert!(env.ctx.clusters.get("testcluster").is_some());
        assert!(env.ctx.metric_repos.get("testcluster").is_some());
        assert!(!env.ctx.archive.is_disabled());
        assert_eq!(env.ctx.archivings.count(), 0);
    }
}
