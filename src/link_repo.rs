use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set},
    ColumnTrait, Condition, DbConn, EntityTrait, QueryFilter, QueryOrder, SqlErr,
    TransactionTrait,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::{
    config::db_conn_capsule,
    model::{ShortLink, to_unix_millis},
    orm::{click_event, short_link},
};

/// Partial update of a link's mutable metadata; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkUpdate {
    pub original_url: Option<String>,
    pub notes: Option<String>,
    pub tags: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl LinkUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.original_url.is_none()
            && self.notes.is_none()
            && self.tags.is_none()
            && self.expires_at.is_none()
    }
}

#[derive(Debug, Error)]
pub enum SaveLinkError {
    #[error("an active link already uses short code {0}")]
    CodeTaken(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub fn link_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn LinkRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(LinkRepositoryImpl::new(db))
}

#[async_trait]
pub trait LinkRepository: Send + Sync {
    /// The active row for `code`, expired or not.
    async fn find_active(&self, code: &str) -> anyhow::Result<Option<ShortLink>>;

    /// Inserts a new active link; fails with [`SaveLinkError::CodeTaken`] on a
    /// conflicting active row, even if a concurrent writer won the race.
    async fn insert(&self, link: ShortLink) -> Result<ShortLink, SaveLinkError>;

    async fn update_active(&self, code: &str, changes: LinkUpdate) -> anyhow::Result<bool>;

    async fn deactivate(&self, code: &str) -> anyhow::Result<bool>;

    /// Removes every row for `code` along with its click events.
    async fn purge(&self, code: &str) -> anyhow::Result<bool>;

    async fn list(&self, include_inactive: bool) -> anyhow::Result<Vec<ShortLink>>;

    async fn search_active(&self, term: &str) -> anyhow::Result<Vec<ShortLink>>;

    async fn deactivate_expired(&self, now: OffsetDateTime) -> anyhow::Result<u64>;
}

pub struct LinkRepositoryImpl {
    db: DbConn,
}

impl LinkRepositoryImpl {
    #[must_use]
    pub const fn new(db: DbConn) -> Self {
        Self { db }
    }
}

fn into_links(models: Vec<short_link::Model>) -> anyhow::Result<Vec<ShortLink>> {
    models.into_iter().map(ShortLink::try_from).collect()
}

#[async_trait]
impl LinkRepository for LinkRepositoryImpl {
    #[instrument(skip(self))]
    async fn find_active(&self, code: &str) -> anyhow::Result<Option<ShortLink>> {
        short_link::Entity::find()
            .filter(short_link::Column::ShortCode.eq(code))
            .filter(short_link::Column::IsActive.eq(true))
            .one(&self.db)
            .await
            .context("Failed to query short link")?
            .map(ShortLink::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn insert(&self, link: ShortLink) -> Result<ShortLink, SaveLinkError> {
        let to_insert = short_link::ActiveModel {
            id: NotSet,
            short_code: Set(link.short_code.clone()),
            original_url: Set(link.original_url),
            is_custom: Set(link.is_custom),
            created_at_ms: Set(to_unix_millis(link.created_at)),
            expires_at_ms: Set(link.expires_at.map(to_unix_millis)),
            is_active: Set(true),
            notes: Set(link.notes),
            tags: Set(link.tags),
        };

        match to_insert.insert(&self.db).await {
            Ok(model) => Ok(ShortLink::try_from(model)?),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(SaveLinkError::CodeTaken(link.short_code))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context("Failed to insert short link")
                .into()),
        }
    }

    #[instrument(skip(self))]
    async fn update_active(&self, code: &str, changes: LinkUpdate) -> anyhow::Result<bool> {
        if changes.is_empty() {
            return Ok(false);
        }

        let txn = self.db.begin().await.context("Failed to begin transaction")?;

        let Some(model) = short_link::Entity::find()
            .filter(short_link::Column::ShortCode.eq(code))
            .filter(short_link::Column::IsActive.eq(true))
            .one(&txn)
            .await
            .context("Failed to query short link")?
        else {
            return Ok(false);
        };

        let mut active: short_link::ActiveModel = model.into();
        if let Some(original_url) = changes.original_url {
            active.original_url = Set(original_url);
        }
        if let Some(notes) = changes.notes {
            active.notes = Set(notes);
        }
        if let Some(tags) = changes.tags {
            active.tags = Set(tags);
        }
        if let Some(expires_at) = changes.expires_at {
            active.expires_at_ms = Set(Some(to_unix_millis(expires_at)));
        }

        active
            .update(&txn)
            .await
            .context("Failed to update short link")?;
        txn.commit().await.context("Failed to commit update")?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn deactivate(&self, code: &str) -> anyhow::Result<bool> {
        let result = short_link::Entity::update_many()
            .set(short_link::ActiveModel {
                is_active: Set(false),
                ..Default::default()
            })
            .filter(short_link::Column::ShortCode.eq(code))
            .filter(short_link::Column::IsActive.eq(true))
            .exec(&self.db)
            .await
            .context("Failed to deactivate short link")?;
        Ok(result.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn purge(&self, code: &str) -> anyhow::Result<bool> {
        let txn = self.db.begin().await.context("Failed to begin transaction")?;

        let clicks = click_event::Entity::delete_many()
            .filter(click_event::Column::ShortCode.eq(code))
            .exec(&txn)
            .await
            .context("Failed to delete click events")?;
        let links = short_link::Entity::delete_many()
            .filter(short_link::Column::ShortCode.eq(code))
            .exec(&txn)
            .await
            .context("Failed to delete short links")?;

        txn.commit().await.context("Failed to commit purge")?;
        info!(
            code,
            links = links.rows_affected,
            clicks = clicks.rows_affected,
            "Purged short code"
        );
        Ok(links.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn list(&self, include_inactive: bool) -> anyhow::Result<Vec<ShortLink>> {
        let mut query = short_link::Entity::find();
        if !include_inactive {
            query = query.filter(short_link::Column::IsActive.eq(true));
        }

        let models = query
            .order_by_desc(short_link::Column::CreatedAtMs)
            .order_by_desc(short_link::Column::Id)
            .all(&self.db)
            .await
            .context("Failed to list short links")?;
        into_links(models)
    }

    #[instrument(skip(self))]
    async fn search_active(&self, term: &str) -> anyhow::Result<Vec<ShortLink>> {
        let models = short_link::Entity::find()
            .filter(short_link::Column::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(short_link::Column::ShortCode.contains(term))
                    .add(short_link::Column::OriginalUrl.contains(term))
                    .add(short_link::Column::Notes.contains(term))
                    .add(short_link::Column::Tags.contains(term)),
            )
            .order_by_desc(short_link::Column::CreatedAtMs)
            .order_by_desc(short_link::Column::Id)
            .all(&self.db)
            .await
            .context("Failed to search short links")?;
        into_links(models)
    }

    #[instrument(skip(self))]
    async fn deactivate_expired(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let result = short_link::Entity::update_many()
            .set(short_link::ActiveModel {
                is_active: Set(false),
                ..Default::default()
            })
            .filter(short_link::Column::IsActive.eq(true))
            .filter(short_link::Column::ExpiresAtMs.lte(to_unix_millis(now)))
            .exec(&self.db)
            .await
            .context("Failed to deactivate expired short links")?;
        Ok(result.rows_affected)
    }
}
