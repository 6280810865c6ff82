//! Best-effort IP geolocation.
//!
//! Geolocation is enrichment, not a correctness requirement: every failure
//! mode (disabled, private address, network error, provider error) demotes
//! to `None` and the check-in carries on without it.

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolves a public IP to a "City, Country" display string.
#[derive(Clone)]
pub struct GeoLocator {
    client: reqwest::Client,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

impl GeoLocator {
    pub fn new(enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, enabled }
    }

    /// Look up a caller address. Returns `None` for anything non-routable
    /// and swallows lookup failures with a debug log.
    pub async fn lookup(&self, ip: IpAddr) -> Option<String> {
        if !self.enabled || !is_public(ip) {
            return None;
        }

        let url = format!("http://ip-api.com/json/{}?fields=status,country,city", ip);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%ip, error = %e, "geolocation request failed");
                return None;
            }
        };
        let body: GeoApiResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(%ip, error = %e, "geolocation response unreadable");
                return None;
            }
        };
        if body.status != "success" {
            return None;
        }

        match (body.city, body.country) {
            (Some(city), Some(country)) if !city.is_empty() => Some(format!("{}, {}", city, country)),
            (_, Some(country)) if !country.is_empty() => Some(country),
            _ => None,
        }
    }
}

/// Whether an address is plausibly routable on the public internet.
fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local)
        }
    }
}
