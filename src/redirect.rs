use std::{net::IpAddr, sync::Arc, time::Duration};

use rearch::CapsuleHandle;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    click_ledger::{ClickLedger, click_ledger_capsule},
    config::settings_capsule,
    geo::{GeoInfo, GeoLocator, geo_locator_capsule},
    model::ClickEvent,
    registry::{UrlRegistry, url_registry_capsule},
    user_agent::{UserAgentParser, user_agent_parser_capsule},
};

const API_PREFIX: &str = "api/";

/// What an inbound request path asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPath<'a> {
    Home,
    /// The endpoint below `/api/`, e.g. `stats`
    Api(&'a str),
    /// Used verbatim; codes are case-sensitive
    Code(&'a str),
}

impl<'a> RequestPath<'a> {
    #[must_use]
    pub fn parse(path_and_query: &'a str) -> Self {
        let path = path_and_query.trim_start_matches('/');
        let path = path.split_once('?').map_or(path, |(path, _)| path);

        if path.is_empty() || path == "index.html" {
            Self::Home
        } else if let Some(endpoint) = path.strip_prefix(API_PREFIX) {
            Self::Api(endpoint)
        } else {
            Self::Code(path)
        }
    }
}

/// Request metadata the redirect derives click telemetry from.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub ip: Option<IpAddr>,
    pub user_agent: String,
    pub accepted_at: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedirectOutcome {
    Redirect { location: String },
    NotFound,
    /// The registry couldn't be consulted; never answered with a redirect
    LookupFailed,
}

pub fn redirect_handler_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<RedirectHandler> {
    let registry = Arc::clone(get.as_ref(url_registry_capsule));
    let ledger = Arc::clone(get.as_ref(click_ledger_capsule));
    let geo = Arc::clone(get.as_ref(geo_locator_capsule));
    let ua_parser = Arc::clone(get.as_ref(user_agent_parser_capsule));
    let tracking = &get.as_ref(settings_capsule).tracking;
    Arc::new(RedirectHandler::new(
        registry,
        ledger,
        geo,
        ua_parser,
        tracking.track_ip,
        tracking.lookup_timeout,
    ))
}

/// Resolves a short code, records the click, and decides the redirect.
pub struct RedirectHandler {
    registry: Arc<dyn UrlRegistry>,
    ledger: Arc<dyn ClickLedger>,
    geo: Arc<dyn GeoLocator>,
    ua_parser: Arc<dyn UserAgentParser>,
    track_ip: bool,
    lookup_timeout: Duration,
}

impl RedirectHandler {
    #[must_use]
    pub fn new(
        registry: Arc<dyn UrlRegistry>,
        ledger: Arc<dyn ClickLedger>,
        geo: Arc<dyn GeoLocator>,
        ua_parser: Arc<dyn UserAgentParser>,
        track_ip: bool,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            geo,
            ua_parser,
            track_ip,
            lookup_timeout,
        }
    }

    /// The ledger write is attempted exactly once and its failure never
    /// changes the outcome.
    #[instrument(skip(self, client))]
    pub async fn redirect(&self, code: &str, client: ClientInfo) -> RedirectOutcome {
        let link = match self.registry.lookup(code).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                warn!(code, "Short code not found");
                return RedirectOutcome::NotFound;
            }
            Err(err) => {
                error!(code, %err, "Failed to look up short code");
                return RedirectOutcome::LookupFailed;
            }
        };

        let response_time_ms = client.accepted_at.elapsed().as_secs_f64() * 1000.0;

        let GeoInfo { country, city } = self.locate(client.ip).await.unwrap_or_default();
        let parsed_ua = self
            .ua_parser
            .parse(&client.user_agent)
            .unwrap_or_default();
        let ip_address = match client.ip {
            Some(ip) if self.track_ip => ip.to_string(),
            _ => String::new(),
        };

        let event = ClickEvent {
            short_code: link.short_code.clone(),
            clicked_at: OffsetDateTime::now_utc(),
            ip_address,
            country,
            city,
            browser: parsed_ua.browser(),
            device: parsed_ua.device_family,
            response_time_ms,
        };
        debug!(?event, "Recording click");
        if let Err(err) = self.ledger.record(event).await {
            error!(code, ?err, "Failed to record click; redirecting anyway");
        }

        info!(
            code,
            location = link.original_url,
            response_time_ms,
            "Redirected"
        );
        RedirectOutcome::Redirect {
            location: link.original_url,
        }
    }

    async fn locate(&self, ip: Option<IpAddr>) -> Option<GeoInfo> {
        let ip = ip?;
        if let Ok(info) = tokio::time::timeout(self.lookup_timeout, self.geo.locate(ip)).await {
            info
        } else {
            warn!(%ip, timeout = ?self.lookup_timeout, "Geolocation timed out");
            None
        }
    }
}
