#![allow(clippy::unwrap_used)]

mod common;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use clicky_short::{
    click_ledger::{ClickQuery, click_ledger_capsule},
    config::settings_capsule,
    geo::{GeoInfo, GeoLocator},
    redirect::RedirectHandler,
    registry::{NewLink, url_registry_capsule},
    server::{AppState, Server, ServerState, StartOutcome, router},
    user_agent::user_agent_parser_capsule,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Notify,
};

/// Announces each lookup, then holds the request open for `delay`.
struct StallingLocator {
    entered: Arc<Notify>,
    delay: Duration,
}

#[async_trait]
impl GeoLocator for StallingLocator {
    async fn locate(&self, _ip: IpAddr) -> Option<GeoInfo> {
        self.entered.notify_one();
        tokio::time::sleep(self.delay).await;
        Some(GeoInfo {
            country: "Iceland".to_owned(),
            city: "Reykjavik".to_owned(),
        })
    }
}

async fn raw_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nUser-Agent: curl/8.5.0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_start_serve_stop() {
    let env = common::setup().await;
    env.container
        .read(url_registry_capsule)
        .create(NewLink {
            original_url: "https://example.com/page".to_owned(),
            custom_code: Some("live".to_owned()),
            ..NewLink::default()
        })
        .await
        .unwrap();

    let server = Server::new(common::app(&env.container), "127.0.0.1:0");
    assert_eq!(server.state(), ServerState::Stopped);

    let StartOutcome::Started(addr) = server.start().await.unwrap() else {
        panic!("server should have started");
    };
    assert!(server.is_running());
    assert_eq!(
        server.start().await.unwrap(),
        StartOutcome::AlreadyRunning(addr)
    );

    let response = raw_get(addr, "/live").await;
    assert!(response.starts_with("HTTP/1.1 301"), "{response}");
    assert!(
        response
            .to_ascii_lowercase()
            .contains("location: https://example.com/page\r\n"),
        "{response}"
    );

    let response = raw_get(addr, "/missing").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    assert!(response.ends_with("Shortened URL not found"), "{response}");

    let clicks = env
        .container
        .read(click_ledger_capsule)
        .query(ClickQuery::default())
        .await
        .unwrap();
    assert_eq!(clicks.len(), 1);
    assert_eq!(clicks[0].short_code, "live");
    assert_eq!(clicks[0].ip_address, "127.0.0.1");

    assert!(server.stop().await.unwrap());
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!server.is_running());
    assert!(TcpStream::connect(addr).await.is_err());

    assert!(!server.stop().await.unwrap());
}

#[tokio::test]
async fn test_restart_after_stop() {
    let env = common::setup().await;
    let server = Server::new(common::app(&env.container), "127.0.0.1:0");
    let mut states = server.subscribe();

    assert!(matches!(
        server.start().await.unwrap(),
        StartOutcome::Started(_)
    ));
    assert_eq!(*states.borrow_and_update(), ServerState::Running);
    server.stop().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ServerState::Stopped);

    let StartOutcome::Started(addr) = server.start().await.unwrap() else {
        panic!("server should have restarted");
    };
    let response = raw_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_leaves_server_stopped() {
    let env = common::setup().await;
    let first = Server::new(common::app(&env.container), "127.0.0.1:0");
    let StartOutcome::Started(addr) = first.start().await.unwrap() else {
        panic!("server should have started");
    };

    let second = Server::new(common::app(&env.container), addr.to_string());
    assert!(second.start().await.is_err());
    assert_eq!(second.state(), ServerState::Stopped);

    first.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_in_flight_redirect() {
    let env = common::setup().await;
    let (registry, ledger) = env
        .container
        .read((url_registry_capsule, click_ledger_capsule));
    let (ua_parser, settings) = env
        .container
        .read((user_agent_parser_capsule, settings_capsule));
    registry
        .create(NewLink {
            original_url: "https://example.com/slow".to_owned(),
            custom_code: Some("slow".to_owned()),
            ..NewLink::default()
        })
        .await
        .unwrap();

    let entered = Arc::new(Notify::new());
    let locator = StallingLocator {
        entered: Arc::clone(&entered),
        delay: Duration::from_millis(300),
    };
    let handler = RedirectHandler::new(
        registry,
        Arc::clone(&ledger),
        Arc::new(locator),
        ua_parser,
        true,
        Duration::from_secs(5),
    );
    let state = AppState {
        settings,
        ledger: Arc::clone(&ledger),
        redirect: Arc::new(handler),
    };
    let server = Server::new(router(state), "127.0.0.1:0");
    let StartOutcome::Started(addr) = server.start().await.unwrap() else {
        panic!("server should have started");
    };

    let in_flight = tokio::spawn(raw_get(addr, "/slow"));
    entered.notified().await;

    assert!(server.stop().await.unwrap());
    assert_eq!(server.state(), ServerState::Stopped);
    // stop() returned only after the stalled request was answered and recorded
    let clicks = ledger.query(ClickQuery::default()).await.unwrap();
    assert_eq!(clicks.len(), 1);
    assert_eq!(clicks[0].country, "Iceland");
    assert_eq!(clicks[0].city, "Reykjavik");

    let response = in_flight.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 301"), "{response}");
    assert!(
        response
            .to_ascii_lowercase()
            .contains("location: https://example.com/slow\r\n"),
        "{response}"
    );
}
