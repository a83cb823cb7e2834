use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use rearch::CapsuleHandle;
use tracing::{debug, info, instrument, warn};
use ureq::Agent;

use crate::config::{TrackingSettings, settings_capsule};

/// Best-effort location of a client address. Missing fields are empty strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// `None` when the address can't be located; never fails past this boundary.
    async fn locate(&self, ip: IpAddr) -> Option<GeoInfo>;
}

pub fn geo_locator_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn GeoLocator> {
    from_settings(&get.as_ref(settings_capsule).tracking)
}

/// Builds the locator selected by `TRACK_LOCATION`.
#[must_use]
pub fn from_settings(settings: &TrackingSettings) -> Arc<dyn GeoLocator> {
    if settings.track_location {
        info!(api = settings.geoip_api_url, "Using external geolocation API");
        Arc::new(ExternalApiLocator::new(settings))
    } else {
        info!("Location tracking disabled");
        Arc::new(DisabledLocator)
    }
}

pub struct DisabledLocator;

#[async_trait]
impl GeoLocator for DisabledLocator {
    async fn locate(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }
}

/// Queries an ip-api.com style JSON endpoint; `{ip}` in the template is
/// replaced with the client address.
pub struct ExternalApiLocator {
    api_url_template: String,
    agent: Agent,
}

impl ExternalApiLocator {
    #[must_use]
    pub fn new(settings: &TrackingSettings) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(settings.lookup_timeout))
            .build()
            .into();
        Self {
            api_url_template: settings.geoip_api_url.clone(),
            agent,
        }
    }

    fn fetch(agent: &Agent, url: &str) -> Option<GeoInfo> {
        let response = match agent.get(url).call() {
            Ok(response) => response,
            Err(err) => {
                warn!(url, %err, "Geolocation request failed");
                return None;
            }
        };

        let json: serde_json::Value = match response.into_body().read_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(url, %err, "Geolocation response was not valid JSON");
                return None;
            }
        };

        parse_response(&json)
    }
}

#[async_trait]
impl GeoLocator for ExternalApiLocator {
    #[instrument(skip(self))]
    async fn locate(&self, ip: IpAddr) -> Option<GeoInfo> {
        if is_private_or_local(ip) {
            debug!("Skipping geolocation of a non-public address");
            return None;
        }

        let url = self.api_url_template.replace("{ip}", &ip.to_string());
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || Self::fetch(&agent, &url))
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "Geolocation task failed");
                None
            })
    }
}

/// Accepts ip-api.com's `{"status", "country", "city"}` shape, plus the
/// `country_name` field used by some other providers.
fn parse_response(json: &serde_json::Value) -> Option<GeoInfo> {
    if json["status"].as_str() == Some("fail") {
        debug!(message = ?json["message"].as_str(), "Geolocation API reported failure");
        return None;
    }

    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| json[*name].as_str())
            .map(str::trim)
            .unwrap_or_default()
            .to_owned()
    };

    Some(GeoInfo {
        country: field(&["country", "country_name"]),
        city: field(&["city"]),
    })
}

fn is_private_or_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_or_local(IpAddr::V4(v4));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn settings(track_location: bool) -> TrackingSettings {
        TrackingSettings {
            track_ip: true,
            track_location,
            track_browser: true,
            geoip_api_url: "http://ip-api.com/json/{ip}?fields=status,country,city".to_owned(),
            lookup_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_parse_response_success() {
        let info = parse_response(&json!({
            "status": "success",
            "country": "United States",
            "city": " Mountain View "
        }))
        .unwrap();
        assert_eq!(info.country, "United States");
        assert_eq!(info.city, "Mountain View");
    }

    #[test]
    fn test_parse_response_missing_fields_are_empty() {
        let info = parse_response(&json!({ "country_name": "Germany" })).unwrap();
        assert_eq!(info.country, "Germany");
        assert_eq!(info.city, "");
    }

    #[test]
    fn test_parse_response_fail_status() {
        assert_eq!(
            parse_response(&json!({ "status": "fail", "message": "reserved range" })),
            None
        );
    }

    #[test]
    fn test_is_private_or_local() {
        let local = [
            "10.0.0.1",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.1.1",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:192.168.0.1",
        ];
        for ip in local {
            assert!(is_private_or_local(ip.parse().unwrap()), "{ip} should be local");
        }
        for ip in ["8.8.8.8", "1.1.1.1", "2001:4860:4860::8888"] {
            assert!(!is_private_or_local(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[tokio::test]
    async fn test_external_locator_skips_local_addresses() {
        let locator = ExternalApiLocator::new(&settings(true));
        assert_eq!(locator.locate("127.0.0.1".parse().unwrap()).await, None);
    }

    #[tokio::test]
    async fn test_disabled_locator() {
        let locator = from_settings(&settings(false));
        assert_eq!(locator.locate("8.8.8.8".parse().unwrap()).await, None);
    }

    /// Depends on external network access
    #[tokio::test]
    #[ignore]
    async fn test_external_locator_real() {
        let locator = ExternalApiLocator::new(&settings(true));
        let info = locator.locate("8.8.8.8".parse().unwrap()).await.unwrap();
        assert_eq!(info.country, "United States");
    }
}
