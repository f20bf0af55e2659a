use sea_orm::FromQueryResult;
use serde::{Deserialize, Serialize};

/// The caller on whose behalf a query runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserInfo {
    pub username: String,
    /// sees all jobs, not only their own
    pub is_admin: bool,
}

impl UserInfo {
    pub fn admin() -> Self {
        Self {
            username: String::new(),
            is_admin: true,
        }
    }

    pub fn user(name: &str) -> Self {
        Self {
            username: name.to_string(),
            is_admin: false,
        }
    }

    /// `None` for callers allowed to see every job.
    pub fn scope(&self) -> Option<String> {
        (!self.is_admin).then(|| self.username.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, FromQueryResult)]
pub struct TagCount {
    pub tag_name: String,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, FromQueryResult)]
pub struct ClusterCount {
    pub cluster: String,
    pub total: i64,
}

/// Result of disambiguating a search term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOrUser {
    Job(i64),
    User(String),
}

/// What a stop request names.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StopJobRequest {
    pub job_id: i64,
    pub cluster: String,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default, rename = "jobState")]
    pub state: Option<crate::schema::JobState>,
    pub stop_time: i64,
}
