use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::Result;
use config::{Config, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConf {
    /// capacity of the job data cache, in bytes
    pub data_capacity: u64,
    /// capacity of each archive read cache, in bytes
    pub archive_capacity: u64,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            data_capacity: 128 * 1024 * 1024,
            archive_capacity: 128 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Conf {
    pub debug: bool,
    pub bind_addr: String,
    pub database_url: String,
    /// root directory of the job archive
    pub job_archive: String,
    pub disable_archive: bool,
    /// seconds within which a second start of the same job id is a duplicate
    pub duplicate_start_window: i64,
    pub cache: CacheConf,
    /// seconds one archiving task may take
    pub archiving_timeout: u64,
    pub ui_defaults: HashMap<String, serde_json::Value>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            debug: false,
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: "sqlite://./var/job.db?mode=rwc".to_string(),
            job_archive: "./var/job-archive".to_string(),
            disable_archive: false,
            duplicate_start_window: 86400,
            cache: CacheConf::default(),
            archiving_timeout: 300,
            ui_defaults: HashMap::new(),
        }
    }
}

impl Conf {
    pub fn parse(filename: &str) -> Result<Self> {
        let defaults = Config::try_from(&Conf::default())?;
        let v = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(filename).required(false))
            .build()?
            .try_deserialize()?;
        Ok(v)
    }

    pub fn job_archive_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(shellexpand::full(&self.job_archive)?.as_ref()))
    }

    pub fn archiving_timeout(&self) -> Duration {
        Duration::from_secs(self.archiving_timeout)
    }
}

#[test]
fn test_parse_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("jobmon.toml");
    std::fs::write(
        &file,
        r#"
job_archive = "/data/archive"
duplicate_start_window = 60

[cache]
data_capacity = 1024
"#,
    )
    .unwrap();

    let conf = Conf::parse(file.to_str().unwrap()).unwrap();
    assert_eq!(conf.job_archive, "/data/archive");
    assert_eq!(conf.duplicate_start_window, 60);
    assert_eq!(conf.cache.data_capacity, 1024);
    assert_eq!(conf.cache.archive_capacity, 128 * 1024 * 1024);
    assert_eq!(conf.bind_addr, "0.0.0.0:8080");
    assert_eq!(conf.archiving_timeout(), Duration::from_secs(300));
}
