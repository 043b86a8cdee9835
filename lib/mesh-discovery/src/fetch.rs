//! Conditional fetch of endpoint listings
//!
//! A discovery source is an HTTP locator serving a JSON array of
//! endpoint property maps. Fetches are conditional: the poller sends
//! the last known modification stamp and the server may answer "not
//! modified". Everything a fetch can produce is expressed in the
//! [`FetchOutcome`] tag — callers never see transport exceptions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mesh_core::endpoint::read_endpoints;
use mesh_core::EndpointDescription;
use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Result of one conditional fetch against a discovery source.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The source reports no change since the given stamp.
    NotModified,
    /// The source answered with a full endpoint listing.
    Modified {
        endpoints: Vec<EndpointDescription>,
        modified: Option<DateTime<Utc>>,
    },
    /// The fetch failed or the response was unusable. The poller treats
    /// this as "modified with an empty listing".
    Failed { reason: String },
}

/// Fetches endpoint listings from a discovery source locator.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        locator: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> FetchOutcome;
}

/// HTTP implementation of [`Fetcher`].
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        locator: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> FetchOutcome {
        let mut request = self.client.get(locator);
        if let Some(stamp) = if_modified_since {
            match HeaderValue::from_str(&format_http_date(stamp)) {
                Ok(value) => request = request.header(IF_MODIFIED_SINCE, value),
                Err(e) => {
                    return FetchOutcome::Failed {
                        reason: format!("invalid modification stamp: {}", e),
                    }
                }
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return FetchOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => FetchOutcome::NotModified,
            StatusCode::OK => {
                let modified = response
                    .headers()
                    .get(LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_http_date);
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        return FetchOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                match read_endpoints(&body) {
                    Ok(endpoints) => {
                        debug!("Fetched {} endpoints from {}", endpoints.len(), locator);
                        FetchOutcome::Modified {
                            endpoints,
                            modified,
                        }
                    }
                    Err(e) => FetchOutcome::Failed {
                        reason: format!("malformed endpoint listing: {}", e),
                    },
                }
            }
            status => FetchOutcome::Failed {
                reason: format!("unexpected status {}", status),
            },
        }
    }
}

/// Format a stamp as an RFC 7231 HTTP date (always GMT).
pub fn format_http_date(stamp: DateTime<Utc>) -> String {
    stamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date header value.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_http_date_round_trip() {
        let stamp = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap();
        let formatted = format_http_date(stamp);
        assert_eq!(formatted, "Sat, 09 Mar 2024 12:30:05 GMT");
        assert_eq!(parse_http_date(&formatted), Some(stamp));
    }

    #[test]
    fn test_parse_http_date_rejects_garbage() {
        assert_eq!(parse_http_date("not a date"), None);
    }
}
