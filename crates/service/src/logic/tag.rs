use std::collections::HashMap;

use anyhow::Result;
use entity::{job, jobtag, prelude::*, tag};
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, JoinType, QueryFilter, QueryOrder, QuerySelect,
    QueryTrait, RelationTrait, Set,
};
use tracing::debug;

use super::types::TagCount;
use crate::{error::MonitorError, schema, state::AppContext};

#[derive(Clone)]
pub struct TagLogic<'a> {
    ctx: &'a AppContext,
}

impl<'a> TagLogic<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    pub async fn create_tag(&self, tag_type: &str, tag_name: &str) -> Result<i64> {
        self.create_tag_with(&self.ctx.db, tag_type, tag_name).await
    }

    pub async fn tag_id(&self, tag_type: &str, tag_name: &str) -> Result<Option<i64>> {
        self.tag_id_with(&self.ctx.db, tag_type, tag_name).await
    }

    /// Attach a tag to a job; attaching it twice is a no-op.
    pub async fn add_tag(&self, job_db_id: i64, tag_id: i64) -> Result<()> {
        self.add_tag_with(&self.ctx.db, job_db_id, tag_id).await
    }

    pub async fn add_tag_or_create(
        &self,
        job_db_id: i64,
        tag_type: &str,
        tag_name: &str,
    ) -> Result<i64> {
        self.add_tag_or_create_with(&self.ctx.db, job_db_id, tag_type, tag_name)
            .await
    }

    async fn create_tag_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        tag_type: &str,
        tag_name: &str,
    ) -> Result<i64> {
        let inserted = Tag::insert(tag::ActiveModel {
            tag_type: Set(tag_type.to_string()),
            tag_name: Set(tag_name.to_string()),
            ..Default::default()
        })
        .exec(conn)
        .await?;
        debug!("created tag {tag_type}:{tag_name} (id {})", inserted.last_insert_id);
        Ok(inserted.last_insert_id)
    }

    async fn tag_id_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        tag_type: &str,
        tag_name: &str,
    ) -> Result<Option<i64>> {
        let record = Tag::find()
            .filter(tag::Column::TagType.eq(tag_type))
            .filter(tag::Column::TagName.eq(tag_name))
            .one(conn)
            .await?;
        Ok(record.map(|v| v.id))
    }

    async fn add_tag_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_db_id: i64,
        tag_id: i64,
    ) -> Result<()> {
        Job::find_by_id(job_db_id)
            .one(conn)
            .await?
            .ok_or(MonitorError::NotFound(format!("no job with id {job_db_id}")))?;
        Tag::find_by_id(tag_id)
            .one(conn)
            .await?
            .ok_or(MonitorError::NotFound(format!("no tag with id {tag_id}")))?;

        let attached = Jobtag::find()
            .filter(jobtag::Column::JobId.eq(job_db_id))
            .filter(jobtag::Column::TagId.eq(tag_id))
            .one(conn)
            .await?;
        if attached.is_some() {
            return Ok(());
        }

        Jobtag::insert(jobtag::ActiveModel {
            job_id: Set(job_db_id),
            tag_id: Set(tag_id),
        })
        .exec_without_returning(conn)
        .await?;
        Ok(())
    }

    /// Like `add_tag_or_create`, on `conn` so the caller can run it inside
    /// its own transaction.
    pub(crate) async fn add_tag_or_create_with<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_db_id: i64,
        tag_type: &str,
        tag_name: &str,
    ) -> Result<i64> {
        let tag_id = match self.tag_id_with(conn, tag_type, tag_name).await? {
            Some(id) => id,
            None => match self.create_tag_with(conn, tag_type, tag_name).await {
                Ok(id) => id,
                // lost a race against a concurrent insert of the same pair
                Err(e) => self
                    .tag_id_with(conn, tag_type, tag_name)
                    .await?
                    .ok_or(e)?,
            },
        };
        self.add_tag_with(conn, job_db_id, tag_id).await?;
        Ok(tag_id)
    }

    /// All tags, and how many jobs carry each tag name. With `user` the
    /// counts only include that user's jobs.
    pub async fn get_tags(
        &self,
        user: Option<&str>,
    ) -> Result<(Vec<schema::Tag>, HashMap<String, i64>)> {
        let tags = Tag::find()
            .order_by_asc(tag::Column::Id)
            .all(&self.ctx.db)
            .await?
            .into_iter()
            .map(to_schema_tag)
            .collect();

        let counts = Jobtag::find()
            .select_only()
            .column(tag::Column::TagName)
            .column_as(jobtag::Column::JobId.count(), "total")
            .join(JoinType::InnerJoin, jobtag::Relation::Tag.def())
            .join(JoinType::InnerJoin, jobtag::Relation::Job.def())
            .apply_if(user, |q, v| q.filter(job::Column::User.eq(v)))
            .group_by(tag::Column::TagName)
            .into_model::<TagCount>()
            .all(&self.ctx.db)
            .await?
            .into_iter()
            .map(|v| (v.tag_name, v.total))
            .collect();

        Ok((tags, counts))
    }

    pub async fn get_job_tags(&self, job_db_id: i64) -> Result<Vec<schema::Tag>> {
        let tags = Tag::find()
            .join_rev(
                JoinType::InnerJoin,
                Jobtag::belongs_to(Tag)
                    .from(jobtag::Column::TagId)
                    .to(tag::Column::Id)
                    .into(),
            )
            .filter(jobtag::Column::JobId.eq(job_db_id))
            .order_by_asc(tag::Column::Id)
            .all(&self.ctx.db)
            .await?;
        Ok(tags.into_iter().map(to_schema_tag).collect())
    }
}

fn to_schema_tag(m: tag::Model) -> schema::Tag {
    schema::Tag {
        id: Some(m.id),
        tag_type: m.tag_type,
        name: m.tag_name,
    }
}

#[cfg(test)]
mod tests {
    use crate::{schema::JobMeta, state::testing::test_env};

    #[tokio::test]
    async fn test_add_tag_or_create_is_idempotent() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(1, 100)).await.unwrap();

        let t1 = svc.tag.add_tag_or_create(id, "testing", "slow").await.unwrap();
        let t2 = svc.tag.add_tag_or_create(id, "testing", "slow").await.unwrap();
        assert_eq!(t1, t2);

        let other = svc.job.start(JobMeta::example(2, 100)).await.unwrap();
        assert_eq!(
            svc.tag.add_tag_or_create(other, "testing", "slow").await.unwrap(),
            t1
        );
        svc.tag.add_tag_or_create(other, "issue", "slow").await.unwrap();

        let (tags, counts) = svc.tag.get_tags(None).await.unwrap();
        assert_eq!(tags.len(), 2);
        // both tags are named "slow": 2 jobs + 1 job
        assert_eq!(counts["slow"], 3);

        let (_, counts) = svc.tag.get_tags(Some("nobody")).await.unwrap();
        assert!(counts.is_empty());

        let job_tags = svc.tag.get_job_tags(other).await.unwrap();
        assert_eq!(job_tags.len(), 2);
        assert_eq!(job_tags[0].id, Some(t1));

        assert!(svc.tag.add_tag(9999, t1).await.is_err());
    }
}
