use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    click_ledger::ClickLedger,
    model::{ClickEvent, ShortLink},
};

#[derive(Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
}

/// A link as shown to operators, with timestamps in ISO-8601 format.
#[derive(Debug, Serialize)]
pub struct LinkDetails {
    pub short_code: String,
    pub shortened_url: String,
    pub original_url: String,
    pub is_custom: bool,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub is_active: bool,
    pub notes: String,
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clicks: Option<u64>,
}

impl LinkDetails {
    /// # Errors
    /// Will return [`Err`] if a timestamp can't be formatted.
    pub fn new(
        link: ShortLink,
        shortened_url: String,
        clicks: Option<u64>,
    ) -> Result<Self, time::error::Format> {
        Ok(Self {
            created_at: link.created_at.format(&Rfc3339)?,
            expires_at: link.expires_at.map(|at| at.format(&Rfc3339)).transpose()?,
            short_code: link.short_code,
            shortened_url,
            original_url: link.original_url,
            is_custom: link.is_custom,
            is_active: link.is_active,
            notes: link.notes,
            tags: link.tags,
            clicks,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ClickRecord {
    pub short_code: String,
    pub clicked_at: String,
    pub ip_address: String,
    pub country: String,
    pub city: String,
    pub browser: String,
    pub device: String,
    pub response_time_ms: f64,
}

impl TryFrom<ClickEvent> for ClickRecord {
    type Error = time::error::Format;

    fn try_from(event: ClickEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            clicked_at: event.clicked_at.format(&Rfc3339)?,
            short_code: event.short_code,
            ip_address: event.ip_address,
            country: event.country,
            city: event.city,
            browser: event.browser,
            device: event.device,
            response_time_ms: event.response_time_ms,
        })
    }
}

/// Parses an ISO-8601 timestamp and normalizes it to UTC.
///
/// # Errors
/// Will return [`Err`] if `timestamp` isn't valid RFC 3339.
pub fn parse_timestamp(timestamp: &str) -> Result<OffsetDateTime, time::error::Parse> {
    Ok(OffsetDateTime::parse(timestamp, &Rfc3339)?.to_offset(time::UtcOffset::UTC))
}

/// Serves `/api/{endpoint}`.
#[instrument(skip(ledger))]
pub async fn respond(endpoint: &str, ledger: Arc<dyn ClickLedger>) -> Response {
    let err_uuid = Uuid::new_v4();
    match endpoint {
        "stats" => match ledger.aggregate_stats().await {
            Ok(stats) => Json(stats).into_response(),
            Err(err) => {
                error!(?err_uuid, ?err, "Failed to compute statistics");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(Error {
                        error: "Internal server error".to_owned(),
                        error_id: err_uuid.to_string(),
                    }),
                )
                    .into_response()
            }
        },
        _ => {
            info!(?err_uuid, endpoint, "Unknown API endpoint");
            (
                StatusCode::NOT_FOUND,
                Json(Error {
                    error: "API endpoint not found".to_owned(),
                    error_id: err_uuid.to_string(),
                }),
            )
                .into_response()
        }
    }
}
