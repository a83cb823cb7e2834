use std::{
    env::{self, VarError},
    fmt::Display,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, anyhow};
use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn, SqlxSqliteConnector, sqlx};
use tracing::{info, instrument, warn};

use crate::orm;

const DEFAULT_DB_URL: &str = "sqlite://clicky-short.db?mode=rwc";
const DEFAULT_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_GEOIP_API_URL: &str = "http://ip-api.com/json/{ip}?fields=status,country,city";
const DEFAULT_BLACKLIST: &str = "malware.com,phishing.com,scam.com";

#[derive(Clone, Debug)]
pub struct Settings {
    pub db_url: String,
    pub addr: String,
    pub public_base_url: String,
    pub short_code_length: usize,
    pub max_custom_code_length: usize,
    pub max_generation_attempts: usize,
    pub tracking: TrackingSettings,
    pub validation: ValidationSettings,
}

#[derive(Clone, Debug)]
pub struct TrackingSettings {
    pub track_ip: bool,
    pub track_location: bool,
    pub track_browser: bool,
    /// `{ip}` is replaced with the client address
    pub geoip_api_url: String,
    pub lookup_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ValidationSettings {
    pub check_dns: bool,
    pub check_reachability: bool,
    pub timeout: Duration,
    pub blacklisted_domains: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_url: DEFAULT_DB_URL.to_owned(),
            addr: DEFAULT_ADDR.to_owned(),
            public_base_url: format!("http://{DEFAULT_ADDR}"),
            short_code_length: 6,
            max_custom_code_length: 50,
            max_generation_attempts: 16,
            tracking: TrackingSettings {
                track_ip: true,
                track_location: true,
                track_browser: true,
                geoip_api_url: DEFAULT_GEOIP_API_URL.to_owned(),
                lookup_timeout: Duration::from_millis(2000),
            },
            validation: ValidationSettings {
                check_dns: false,
                check_reachability: false,
                timeout: Duration::from_millis(5000),
                blacklisted_domains: split_list(DEFAULT_BLACKLIST),
            },
        }
    }
}

impl Settings {
    /// # Errors
    /// Will return [`Err`] if an environment variable is set but invalid.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| match env::var(name) {
            Ok(value) => Some(value),
            Err(VarError::NotPresent) => None,
            Err(VarError::NotUnicode(actual)) => {
                warn!(name, "Ignoring non-unicode value {}", actual.display());
                None
            }
        })
    }

    /// Builds settings from an arbitrary variable source, falling back to defaults.
    ///
    /// # Errors
    /// Will return [`Err`] if a variable is present but fails to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let var = |name: &str, default: &str| read_var(&lookup, name, default.to_owned());

        let addr = var("ADDR", &defaults.addr);
        let public_base_url = var("PUBLIC_BASE_URL", &format!("http://{addr}"));

        Ok(Self {
            db_url: var("DB_URL", &defaults.db_url),
            public_base_url: public_base_url.trim_end_matches('/').to_owned(),
            addr,
            short_code_length: parse_var(&lookup, "SHORT_CODE_LENGTH", defaults.short_code_length)?,
            max_custom_code_length: parse_var(
                &lookup,
                "MAX_CUSTOM_CODE_LENGTH",
                defaults.max_custom_code_length,
            )?,
            max_generation_attempts: parse_var(
                &lookup,
                "MAX_GENERATION_ATTEMPTS",
                defaults.max_generation_attempts,
            )?,
            tracking: TrackingSettings {
                track_ip: parse_var(&lookup, "TRACK_IP", defaults.tracking.track_ip)?,
                track_location: parse_var(
                    &lookup,
                    "TRACK_LOCATION",
                    defaults.tracking.track_location,
                )?,
                track_browser: parse_var(&lookup, "TRACK_BROWSER", defaults.tracking.track_browser)?,
                geoip_api_url: var("GEOIP_API_URL", &defaults.tracking.geoip_api_url),
                lookup_timeout: Duration::from_millis(parse_var(&lookup, "LOOKUP_TIMEOUT_MS", 2000)?),
            },
            validation: ValidationSettings {
                check_dns: parse_var(&lookup, "CHECK_URL_DNS", defaults.validation.check_dns)?,
                check_reachability: parse_var(
                    &lookup,
                    "CHECK_URL_REACHABLE",
                    defaults.validation.check_reachability,
                )?,
                timeout: Duration::from_millis(parse_var(&lookup, "URL_CHECK_TIMEOUT_MS", 5000)?),
                blacklisted_domains: split_list(&var("BLACKLISTED_DOMAINS", DEFAULT_BLACKLIST)),
            },
        })
    }
}

fn read_var(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: String) -> String {
    if let Some(value) = lookup(name) {
        info!(name, value, "Environment variable set");
        value
    } else {
        warn!(
            name,
            default, "Environment variable not set; defaulting to {default}"
        );
        default
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    read_var(lookup, name, default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("{name} environment variable is invalid"))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Connects to the database and ensures the schema exists.
///
/// # Errors
/// Will return [`Err`] if the connection or the schema creation fails.
#[instrument(skip(db_url))]
pub async fn connect(db_url: &str) -> anyhow::Result<DbConn> {
    let db = if db_url.starts_with("sqlite:") {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};

        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("Invalid SQLite URL {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite")?;
        SqlxSqliteConnector::from_sqlx_sqlite_pool(pool)
    } else {
        let mut options = ConnectOptions::new(db_url.to_owned());
        options
            .max_connections(16)
            .connect_timeout(Duration::from_secs(8))
            .acquire_timeout(Duration::from_secs(8))
            .sqlx_logging(false);
        Database::connect(options)
            .await
            .context("Failed to connect to database")?
    };

    orm::create_schema(&db)
        .await
        .context("Failed to create database schema")?;
    Ok(db)
}

/// # Errors
/// Will return [`Err`] if the connection to the database fails.
#[instrument(skip(settings))]
pub async fn init_container(settings: Settings) -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (set_settings, set_db_conn) = container.read((settings_init_action, db_conn_init_action));

    info!(db_url = settings.db_url, "Connecting to database");
    set_db_conn(connect(&settings.db_url).await?);
    set_settings(settings);

    info!("Container initialized");
    Ok(container)
}

fn settings_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<Settings>, impl use<> + CData + Fn(Option<Settings>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn settings_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(Settings) {
    let set_settings = get.as_ref(settings_manager).1.clone();
    move |settings| set_settings(Some(settings))
}

/// # Panics
/// Panics when the [`Settings`] were not set via [`settings_init_action`].
pub fn settings_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Settings {
    let settings = get.as_ref(settings_manager).0.clone();
    settings.expect("Settings should've been set via settings_init_action!")
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// Installs the process-wide `tracing` subscriber. Call once, from a binary's `main`.
///
/// # Errors
/// Will return [`Err`] if a global subscriber was already installed.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!("Failed to install tracing subscriber: {err}"))
}
