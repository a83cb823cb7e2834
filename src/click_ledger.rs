use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, DbConn, EntityTrait,
    FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, sea_query::Expr,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::{
    config::db_conn_capsule,
    model::{ClickEvent, to_unix_millis},
    orm::{click_event, short_link},
};

const TOP_COUNTRIES: u64 = 5;

/// Conjunctive filters over the ledger; `None` means unfiltered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClickQuery {
    pub short_code: Option<String>,
    /// Inclusive
    pub start: Option<OffsetDateTime>,
    /// Inclusive
    pub end: Option<OffsetDateTime>,
    pub limit: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total_links: u64,
    pub total_clicks: u64,
    pub avg_clicks_per_link: f64,
    pub most_clicked: Option<MostClicked>,
    pub avg_response_time_ms: f64,
    pub top_countries: Vec<CountryCount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MostClicked {
    pub short_code: String,
    pub clicks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CountryCount {
    pub country: String,
    pub count: u64,
}

pub fn click_ledger_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn ClickLedger> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(ClickLedgerImpl::new(db))
}

/// Append-only store of served redirects.
#[async_trait]
pub trait ClickLedger: Send + Sync {
    /// Appends `event` regardless of the state of the link it references.
    async fn record(&self, event: ClickEvent) -> anyhow::Result<()>;

    async fn count_for(&self, short_code: &str) -> anyhow::Result<u64>;

    /// Newest first.
    async fn query(&self, query: ClickQuery) -> anyhow::Result<Vec<ClickEvent>>;

    /// Computed on demand over active links and every recorded click.
    async fn aggregate_stats(&self) -> anyhow::Result<AggregateStats>;
}

pub struct ClickLedgerImpl {
    db: DbConn,
}

impl ClickLedgerImpl {
    #[must_use]
    pub const fn new(db: DbConn) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ClickLedger for ClickLedgerImpl {
    #[instrument(skip(self))]
    async fn record(&self, event: ClickEvent) -> anyhow::Result<()> {
        let to_insert = click_event::ActiveModel {
            id: NotSet,
            short_code: Set(event.short_code),
            clicked_at_ms: Set(to_unix_millis(event.clicked_at)),
            ip_address: Set(event.ip_address),
            country: Set(event.country),
            city: Set(event.city),
            browser: Set(event.browser),
            device: Set(event.device),
            response_time_ms: Set(event.response_time_ms),
        };
        let model = to_insert
            .insert(&self.db)
            .await
            .context("Failed to insert click event")?;
        debug!(id = model.id, "Click recorded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_for(&self, short_code: &str) -> anyhow::Result<u64> {
        click_event::Entity::find()
            .filter(click_event::Column::ShortCode.eq(short_code))
            .count(&self.db)
            .await
            .context("Failed to count click events")
    }

    #[instrument(skip(self))]
    async fn query(&self, query: ClickQuery) -> anyhow::Result<Vec<ClickEvent>> {
        let mut select = click_event::Entity::find();
        if let Some(short_code) = query.short_code {
            select = select.filter(click_event::Column::ShortCode.eq(short_code));
        }
        if let Some(start) = query.start {
            select = select.filter(click_event::Column::ClickedAtMs.gte(to_unix_millis(start)));
        }
        if let Some(end) = query.end {
            select = select.filter(click_event::Column::ClickedAtMs.lte(to_unix_millis(end)));
        }

        let models = select
            .order_by_desc(click_event::Column::ClickedAtMs)
            .order_by_desc(click_event::Column::Id)
            .limit(query.limit)
            .all(&self.db)
            .await
            .context("Failed to query click events")?;
        models.into_iter().map(ClickEvent::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn aggregate_stats(&self) -> anyhow::Result<AggregateStats> {
        let total_links = short_link::Entity::find()
            .filter(short_link::Column::IsActive.eq(true))
            .count(&self.db)
            .await
            .context("Failed to count active short links")?;

        let totals = click_event::Entity::find()
            .select_only()
            .column_as(click_event::Column::Id.count(), "total_clicks")
            .column_as(click_event::Column::ResponseTimeMs.sum(), "response_time_sum")
            .into_model::<ClickTotalsRow>()
            .one(&self.db)
            .await
            .context("Failed to total click events")?
            .unwrap_or_default();

        let most_clicked = click_event::Entity::find()
            .select_only()
            .column(click_event::Column::ShortCode)
            .column_as(click_event::Column::Id.count(), "count")
            .group_by(click_event::Column::ShortCode)
            .order_by_desc(Expr::cust("count"))
            .order_by_asc(click_event::Column::ShortCode)
            .into_model::<CodeCountRow>()
            .one(&self.db)
            .await
            .context("Failed to find the most clicked short code")?;

        let top_countries = click_event::Entity::find()
            .select_only()
            .column(click_event::Column::Country)
            .column_as(click_event::Column::Id.count(), "count")
            .filter(click_event::Column::Country.ne(""))
            .group_by(click_event::Column::Country)
            .order_by_desc(Expr::cust("count"))
            .order_by_asc(click_event::Column::Country)
            .limit(TOP_COUNTRIES)
            .into_model::<CountryCountRow>()
            .all(&self.db)
            .await
            .context("Failed to rank click countries")?;

        Ok(summarize(total_links, &totals, most_clicked, top_countries))
    }
}

#[derive(Debug, Default, FromQueryResult)]
struct ClickTotalsRow {
    total_clicks: i64,
    response_time_sum: Option<f64>,
}

#[derive(Debug, FromQueryResult)]
struct CodeCountRow {
    short_code: String,
    count: i64,
}

#[derive(Debug, FromQueryResult)]
struct CountryCountRow {
    country: String,
    count: i64,
}

fn to_count(count: i64) -> u64 {
    u64::try_from(count).unwrap_or_default()
}

/// Turns the aggregate rows into [`AggregateStats`]; averages are 0 when there's nothing to divide by.
fn summarize(
    total_links: u64,
    totals: &ClickTotalsRow,
    most_clicked: Option<CodeCountRow>,
    top_countries: Vec<CountryCountRow>,
) -> AggregateStats {
    let total_clicks = to_count(totals.total_clicks);

    #[allow(clippy::cast_precision_loss)]
    let ratio = |sum: f64, count: u64| if count == 0 { 0.0 } else { sum / count as f64 };

    #[allow(clippy::cast_precision_loss)]
    let avg_clicks_per_link = ratio(total_clicks as f64, total_links);

    AggregateStats {
        total_links,
        total_clicks,
        avg_clicks_per_link,
        most_clicked: most_clicked.map(|row| MostClicked {
            short_code: row.short_code,
            clicks: to_count(row.count),
        }),
        avg_response_time_ms: ratio(totals.response_time_sum.unwrap_or_default(), total_clicks),
        top_countries: top_countries
            .into_iter()
            .map(|row| CountryCount {
                country: row.country,
                count: to_count(row.count),
            })
            .collect(),
    }
}
