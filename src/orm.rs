use sea_orm::{ConnectionTrait, DbBackend, DbConn, DbErr};
use tracing::{info, instrument};

#[allow(warnings, clippy::all)]
pub(crate) mod short_link {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "short_links")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub short_code: String,
        #[sea_orm(column_type = "Text")]
        pub original_url: String,
        pub is_custom: bool,
        pub created_at_ms: i64,
        pub expires_at_ms: Option<i64>,
        pub is_active: bool,
        #[sea_orm(column_type = "Text")]
        pub notes: String,
        #[sea_orm(column_type = "Text")]
        pub tags: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

#[allow(warnings, clippy::all)]
pub(crate) mod click_event {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "click_events")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub short_code: String,
        pub clicked_at_ms: i64,
        pub ip_address: String,
        pub country: String,
        pub city: String,
        pub browser: String,
        pub device: String,
        pub response_time_ms: f64,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Idempotently creates the tables and indexes backing the registry and the ledger.
///
/// # Errors
/// Will return [`Err`] if the backend is unsupported or any DDL statement fails.
#[instrument(skip(db))]
pub async fn create_schema(db: &DbConn) -> Result<(), DbErr> {
    let id_column = match db.get_database_backend() {
        DbBackend::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        DbBackend::Postgres => "id BIGSERIAL PRIMARY KEY",
        // NOTE: MySQL has no partial indexes, so active-code uniqueness can't be enforced there
        other => {
            return Err(DbErr::Custom(format!(
                "unsupported database backend: {other:?}"
            )));
        }
    };

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS short_links (
                {id_column},
                short_code TEXT NOT NULL,
                original_url TEXT NOT NULL,
                is_custom BOOLEAN NOT NULL DEFAULT FALSE,
                created_at_ms BIGINT NOT NULL,
                expires_at_ms BIGINT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                notes TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT ''
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS click_events (
                {id_column},
                short_code TEXT NOT NULL,
                clicked_at_ms BIGINT NOT NULL,
                ip_address TEXT NOT NULL DEFAULT '',
                country TEXT NOT NULL DEFAULT '',
                city TEXT NOT NULL DEFAULT '',
                browser TEXT NOT NULL DEFAULT '',
                device TEXT NOT NULL DEFAULT '',
                response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0
            )"
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_short_links_active_code \
            ON short_links (short_code) WHERE is_active"
            .to_owned(),
        "CREATE INDEX IF NOT EXISTS idx_short_links_created_at ON short_links (created_at_ms)"
            .to_owned(),
        "CREATE INDEX IF NOT EXISTS idx_click_events_short_code ON click_events (short_code)"
            .to_owned(),
    ];

    for statement in statements {
        db.execute_unprepared(&statement).await?;
    }

    info!("Database schema created/verified");
    Ok(())
}
