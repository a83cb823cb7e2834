#![allow(dead_code, clippy::unwrap_used)]

use axum::Router;
use clicky_short::{
    config::{self, Settings},
    model::ClickEvent,
    server::{app_state_capsule, router},
};
use rearch::Container;
use tempfile::TempDir;
use time::OffsetDateTime;

/// A container wired to a fresh SQLite file; the directory lives as long as this value.
pub struct TestEnv {
    pub container: Container,
    _dir: TempDir,
}

pub async fn setup() -> TestEnv {
    setup_with(|_| {}).await
}

pub async fn setup_with(configure: impl FnOnce(&mut Settings)) -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("clicky-short-test.db");

    let mut settings = Settings {
        db_url: format!("sqlite://{}?mode=rwc", db_path.display()),
        addr: "127.0.0.1:0".to_owned(),
        public_base_url: "http://sho.rt".to_owned(),
        ..Settings::default()
    };
    // Tests never reach out to the geolocation API
    settings.tracking.track_location = false;
    configure(&mut settings);

    let container = config::init_container(settings)
        .await
        .expect("Failed to initialize container");
    TestEnv {
        container,
        _dir: dir,
    }
}

/// The full HTTP surface backed by `container`.
pub fn app(container: &Container) -> Router {
    router(container.read(app_state_capsule))
}

pub fn click(code: &str, country: &str, response_time_ms: f64) -> ClickEvent {
    click_at(code, country, response_time_ms, OffsetDateTime::now_utc())
}

pub fn click_at(
    code: &str,
    country: &str,
    response_time_ms: f64,
    clicked_at: OffsetDateTime,
) -> ClickEvent {
    ClickEvent {
        short_code: code.to_owned(),
        clicked_at,
        ip_address: "203.0.113.7".to_owned(),
        country: country.to_owned(),
        city: String::new(),
        browser: "Firefox 121.0".to_owned(),
        device: "pc".to_owned(),
        response_time_ms,
    }
}
