use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use ureq::Agent;
use url::Url;

use crate::config::{ValidationSettings, settings_capsule};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("invalid URL format: {0}")]
    InvalidFormat(String),
    #[error("domain {domain} is blacklisted")]
    Blacklisted { domain: String },
    #[error("DNS resolution failed for {host}")]
    DnsResolutionFailed { host: String },
    #[error("URL appears to be unreachable: {0}")]
    Unreachable(String),
}

/// Creation-time checks for a redirect target. Never consulted on the redirect path.
pub fn url_validator_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn UrlValidator> {
    let settings = get.as_ref(settings_capsule).validation.clone();
    Arc::new(StandardUrlValidator::new(settings))
}

#[async_trait]
pub trait UrlValidator: Send + Sync {
    async fn validate(&self, url: &str) -> Result<(), UrlRejection>;
}

pub struct StandardUrlValidator {
    settings: ValidationSettings,
    agent: Agent,
}

impl StandardUrlValidator {
    #[must_use]
    pub fn new(settings: ValidationSettings) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .build()
            .into();
        Self { settings, agent }
    }
}

#[async_trait]
impl UrlValidator for StandardUrlValidator {
    #[instrument(skip(self))]
    async fn validate(&self, url: &str) -> Result<(), UrlRejection> {
        let parsed = check_format(url)?;
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        if let Some(domain) = blacklisted_domain(&host, &self.settings.blacklisted_domains) {
            return Err(UrlRejection::Blacklisted {
                domain: domain.to_owned(),
            });
        }

        if self.settings.check_dns {
            let port = parsed.port_or_known_default().unwrap_or(80);
            resolves(&host, port, self.settings.timeout).await?;
        }

        if self.settings.check_reachability {
            probe(self.agent.clone(), url.to_owned()).await?;
        }

        Ok(())
    }
}

/// # Errors
/// Will return [`Err`] unless the URL parses, uses http(s), and names a host.
pub fn check_format(url: &str) -> Result<Url, UrlRejection> {
    let url = url.trim();
    if url.is_empty() {
        return Err(UrlRejection::InvalidFormat("URL cannot be empty".to_owned()));
    }

    let parsed = Url::parse(url).map_err(|err| UrlRejection::InvalidFormat(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlRejection::InvalidFormat(format!(
            "scheme {} is not allowed; use http:// or https://",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(UrlRejection::InvalidFormat("missing host".to_owned()));
    }

    Ok(parsed)
}

fn blacklisted_domain<'a>(host: &str, blacklist: &'a [String]) -> Option<&'a str> {
    blacklist
        .iter()
        .map(|domain| domain.trim())
        .filter(|domain| !domain.is_empty())
        .find(|domain| {
            let domain = domain.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
}

async fn resolves(host: &str, port: u16, timeout: Duration) -> Result<(), UrlRejection> {
    let failed = || UrlRejection::DnsResolutionFailed {
        host: host.to_owned(),
    };

    match tokio::time::timeout(timeout, tokio::net::lookup_host((host, port))).await {
        Ok(Ok(mut addrs)) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(failed())
            }
        }
        Ok(Err(err)) => {
            debug!(host, ?err, "DNS lookup failed");
            Err(failed())
        }
        Err(_) => {
            warn!(host, "DNS lookup timed out");
            Err(failed())
        }
    }
}

async fn probe(agent: Agent, url: String) -> Result<(), UrlRejection> {
    // NOTE: ureq treats 4xx/5xx statuses as errors by default
    tokio::task::spawn_blocking(move || agent.head(&url).call().map(|_| ()))
        .await
        .map_err(|err| UrlRejection::Unreachable(err.to_string()))?
        .map_err(|err| UrlRejection::Unreachable(err.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings(blacklist: &[&str]) -> ValidationSettings {
        ValidationSettings {
            check_dns: false,
            check_reachability: false,
            timeout: Duration::from_secs(1),
            blacklisted_domains: blacklist.iter().map(|&s| s.to_owned()).collect(),
        }
    }

    #[test]
    fn test_check_format_accepts_http_and_https() {
        assert!(check_format("http://example.com").is_ok());
        assert!(check_format("https://example.com/path?q=1").is_ok());
        assert!(check_format("  https://example.com  ").is_ok());
    }

    #[test]
    fn test_check_format_rejects_bad_urls() {
        for bad in ["", "   ", "not a url", "ftp://example.com", "javascript:alert(1)"] {
            assert!(
                matches!(check_format(bad), Err(UrlRejection::InvalidFormat(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_blacklisted_domain_matches_host_and_subdomains() {
        let blacklist = vec!["malware.com".to_owned(), " Scam.com ".to_owned()];
        assert_eq!(blacklisted_domain("malware.com", &blacklist), Some("malware.com"));
        assert_eq!(blacklisted_domain("cdn.malware.com", &blacklist), Some("malware.com"));
        assert_eq!(blacklisted_domain("scam.com", &blacklist), Some("Scam.com"));
        assert_eq!(blacklisted_domain("notmalware.com", &blacklist), None);
        assert_eq!(blacklisted_domain("example.com", &blacklist), None);
    }

    #[tokio::test]
    async fn test_validate_rejects_blacklisted() {
        let validator = StandardUrlValidator::new(settings(&["phishing.com"]));
        let err = validator
            .validate("https://login.PHISHING.com/account")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            UrlRejection::Blacklisted {
                domain: "phishing.com".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_validate_without_network_checks() {
        let validator = StandardUrlValidator::new(settings(&[]));
        assert!(validator.validate("https://example.com/page").await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_dns_failure() {
        let validator = StandardUrlValidator::new(ValidationSettings {
            check_dns: true,
            ..settings(&[])
        });
        let err = validator
            .validate("https://does-not-exist.invalid/")
            .await
            .unwrap_err();
        assert!(matches!(err, UrlRejection::DnsResolutionFailed { host } if host == "does-not-exist.invalid"));
    }

    #[tokio::test]
    async fn test_validate_dns_success_for_localhost() {
        let validator = StandardUrlValidator::new(ValidationSettings {
            check_dns: true,
            ..settings(&[])
        });
        assert!(validator.validate("http://localhost:8080/").await.is_ok());
    }

    /// Depends on external network access
    #[tokio::test]
    #[ignore]
    async fn test_validate_reachability_real() {
        let validator = StandardUrlValidator::new(ValidationSettings {
            check_reachability: true,
            timeout: Duration::from_secs(5),
            ..settings(&[])
        });
        assert!(validator.validate("https://example.com/").await.is_ok());
    }
}
