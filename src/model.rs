use anyhow::Context;
use time::OffsetDateTime;

use crate::orm::{click_event, short_link};

const NANOS_PER_MILLI: i128 = 1_000_000;

/// A short code and the URL it redirects to, plus its lifecycle metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShortLink {
    pub short_code: String,
    pub original_url: String,
    pub is_custom: bool,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub notes: String,
    pub tags: String,
}

impl ShortLink {
    /// Liveness is computed, never stored: an active link whose expiration
    /// has passed is treated as missing.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// One served redirect. Absent metadata is always the empty string.
#[derive(Clone, Debug, PartialEq)]
pub struct ClickEvent {
    pub short_code: String,
    pub clicked_at: OffsetDateTime,
    pub ip_address: String,
    pub country: String,
    pub city: String,
    pub browser: String,
    pub device: String,
    pub response_time_ms: f64,
}

pub(crate) fn to_unix_millis(time: OffsetDateTime) -> i64 {
    i64::try_from(time.unix_timestamp_nanos() / NANOS_PER_MILLI).unwrap_or(i64::MAX)
}

pub(crate) fn from_unix_millis(millis: i64) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * NANOS_PER_MILLI)
        .with_context(|| format!("Stored timestamp {millis} is out of range"))
}

impl TryFrom<short_link::Model> for ShortLink {
    type Error = anyhow::Error;

    fn try_from(model: short_link::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            short_code: model.short_code,
            original_url: model.original_url,
            is_custom: model.is_custom,
            created_at: from_unix_millis(model.created_at_ms)?,
            expires_at: model.expires_at_ms.map(from_unix_millis).transpose()?,
            is_active: model.is_active,
            notes: model.notes,
            tags: model.tags,
        })
    }
}

impl TryFrom<click_event::Model> for ClickEvent {
    type Error = anyhow::Error;

    fn try_from(model: click_event::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            short_code: model.short_code,
            clicked_at: from_unix_millis(model.clicked_at_ms)?,
            ip_address: model.ip_address,
            country: model.country,
            city: model.city,
            browser: model.browser,
            device: model.device,
            response_time_ms: model.response_time_ms,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use time::{Duration, macros::datetime};

    use super::*;

    fn link(expires_at: Option<OffsetDateTime>) -> ShortLink {
        ShortLink {
            short_code: "abc123".to_owned(),
            original_url: "https://example.com/".to_owned(),
            is_custom: false,
            created_at: OffsetDateTime::now_utc(),
            expires_at,
            is_active: true,
            notes: String::new(),
            tags: String::new(),
        }
    }

    #[test]
    fn test_is_expired_at() {
        let now = OffsetDateTime::now_utc();
        assert!(!link(None).is_expired_at(now));
        assert!(!link(Some(now + Duration::minutes(1))).is_expired_at(now));
        assert!(link(Some(now - Duration::seconds(1))).is_expired_at(now));
        assert!(link(Some(now)).is_expired_at(now));
    }

    #[test]
    fn test_unix_millis_keeps_millisecond_precision() {
        let time = datetime!(2025-03-04 05:06:07.891 UTC);
        let millis = to_unix_millis(time);
        assert_eq!(millis, 1_741_064_767_891);
        assert_eq!(from_unix_millis(millis).unwrap(), time);
    }

    #[test]
    fn test_try_from_short_link_model() {
        let model = short_link::Model {
            id: 7,
            short_code: "Zz9".to_owned(),
            original_url: "https://example.com/page".to_owned(),
            is_custom: true,
            created_at_ms: 1_000,
            expires_at_ms: None,
            is_active: false,
            notes: "note".to_owned(),
            tags: "a,b".to_owned(),
        };

        let link = ShortLink::try_from(model).unwrap();
        assert_eq!(link.short_code, "Zz9");
        assert!(link.is_custom);
        assert!(!link.is_active);
        assert_eq!(link.created_at.unix_timestamp(), 1);
        assert_eq!(link.expires_at, None);
    }
}
