use poem::{Result, web::Data};
use poem_openapi::{OpenApi, param::Query, payload::Json};
use service::state::AppContext;

use crate::error::anyhow_into_error;

pub mod types {
    use std::collections::HashMap;

    use poem_openapi::Object;
    use serde::{Deserialize, Serialize};

    #[derive(Object, Serialize, Deserialize)]
    pub struct TagRecord {
        pub id: i64,
        #[oai(rename = "type")]
        pub tag_type: String,
        pub name: String,
    }

    #[derive(Object, Serialize, Deserialize)]
    pub struct GetTagsResp {
        pub tags: Vec<TagRecord>,
        /// tag name -> number of jobs carrying a tag of that name
        pub counts: HashMap<String, i64>,
    }
}

pub struct TagApi;

#[OpenApi(tag = super::Tag::Tag)]
impl TagApi {
    /// All tags with their usage, optionally counting only one user's jobs
    #[oai(path = "/tags", method = "get")]
    pub async fn get_tags(
        &self,
        state: Data<&AppContext>,
        Query(user): Query<Option<String>>,
    ) -> Result<Json<types::GetTagsResp>> {
        let (tags, counts) = state
            .service()
            .tag
            .get_tags(user.as_deref())
            .await
            .map_err(anyhow_into_error)?;

        let tags = tags
            .into_iter()
            .map(|t| types::TagRecord {
                id: t.id.unwrap_or_default(),
                tag_type: t.tag_type,
                name: t.name,
            })
            .collect();
        Ok(Json(types::GetTagsResp { tags, counts }))
    }
}
