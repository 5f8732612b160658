use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::constants;
use crate::models::account::Tier;

// Headers that must not cross the proxy boundary in either direction.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Clone)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
    None,
}

// Transient per-response view of the upstream's rate-limit headers.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSignal {
    pub is_rate_limited: bool,
    pub reset_at: Option<i64>,
    pub remaining: Option<i64>,
    pub status_tag: Option<String>,
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

// Joins the account's base_url override (or the default upstream) with the
// client's path+query, both passed through unchanged.
pub fn build_url(base_url: Option<&str>, default_base: &str, path_and_query: &str) -> String {
    let base = base_url.unwrap_or(default_base).trim_end_matches('/');
    format!("{}{}", base, path_and_query)
}

// Copies the incoming headers minus hop-by-hop and any client-supplied
// credentials, then injects exactly one credential for the chosen account.
pub fn prepare_headers(incoming: &HeaderMap, credential: &Credential) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || name_str.eq_ignore_ascii_case("authorization")
            || name_str.eq_ignore_ascii_case("x-api-key")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match credential {
        Credential::Bearer(token) => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(axum::http::header::AUTHORIZATION, v);
            }
            headers.insert(
                HeaderName::from_static("anthropic-beta"),
                HeaderValue::from_static(constants::OAUTH_BETA_HEADER_VALUE),
            );
            if let Ok(v) = HeaderValue::from_str(constants::USER_AGENT.as_str()) {
                headers.insert(axum::http::header::USER_AGENT, v);
            }
            headers.insert(
                HeaderName::from_static(constants::ANTHROPIC_VERSION_HEADER),
                HeaderValue::from_static(constants::ANTHROPIC_VERSION),
            );
        }
        Credential::ApiKey(key) => {
            if let Ok(v) = HeaderValue::from_str(key) {
                headers.insert(HeaderName::from_static("x-api-key"), v);
            }
            headers.insert(
                HeaderName::from_static(constants::ANTHROPIC_VERSION_HEADER),
                HeaderValue::from_static(constants::ANTHROPIC_VERSION),
            );
        }
        Credential::None => {}
    }

    headers
}

pub fn is_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// Reads the unified rate-limit headers into a signal. The reset header
// carries absolute seconds since epoch; a plain `retry-after` delta is
// accepted as a fallback.
pub fn parse_rate_limit(status: StatusCode, headers: &HeaderMap, now: i64) -> RateLimitSignal {
    let status_tag = header_str(headers, constants::RATELIMIT_STATUS_HEADER).map(str::to_string);
    let remaining =
        header_str(headers, constants::RATELIMIT_REMAINING_HEADER).and_then(|v| v.parse().ok());

    let mut reset_at: Option<i64> = header_str(headers, constants::RATELIMIT_RESET_HEADER)
        .and_then(|v| v.parse::<i64>().ok());
    if reset_at.is_none() {
        reset_at = header_str(headers, "retry-after")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|delta| now + delta);
    }

    let is_rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || status_tag.as_deref().is_some_and(|tag| tag == "rejected");

    RateLimitSignal {
        is_rate_limited,
        reset_at,
        remaining,
        status_tag,
    }
}

// Best-effort tier detection from the unified tier header, when the
// upstream chooses to advertise it.
pub fn extract_tier_info(headers: &HeaderMap) -> Option<Tier> {
    let raw = header_str(headers, "anthropic-ratelimit-unified-tier")?;
    match raw {
        "pro" | "default" => Some(Tier::Pro),
        "max_5x" => Some(Tier::Max5),
        "max_20x" => Some(Tier::Max20),
        _ => None,
    }
}
