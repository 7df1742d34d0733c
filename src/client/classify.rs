//! Response Classification
//!
//! Maps failed provider responses onto per-call outcome errors.

use crate::error::ProviderError;
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Longest body excerpt carried in an error message
const BODY_EXCERPT_CHARS: usize = 300;

/// Classify a non-success HTTP response
pub fn classify_response(status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
    let excerpt = excerpt(body);

    // OpenAI reports an empty balance as 429 insufficient_quota
    if is_quota_error(body) {
        return ProviderError::QuotaExceeded(excerpt);
    }
    if is_rate_limit_error(status, body) {
        return ProviderError::RateLimited {
            retry_after: retry_after_secs(headers),
        };
    }

    match status {
        401 | 403 => ProviderError::Auth(format!("status {}: {}", status, excerpt)),
        408 | 409 | 425 => ProviderError::Transient(format!("status {}: {}", status, excerpt)),
        400..=499 => ProviderError::InvalidRequest(format!("status {}: {}", status, excerpt)),
        _ => ProviderError::Transient(format!("status {}: {}", status, excerpt)),
    }
}

/// Detect if a response indicates a rate limit error
pub fn is_rate_limit_error(status: u16, body: &str) -> bool {
    // HTTP 429 Too Many Requests
    if status == 429 {
        return true;
    }

    // Some providers return 400 or 403 with rate limit messages
    let lower_body = body.to_lowercase();
    lower_body.contains("rate limit")
        || lower_body.contains("rate_limit")
        || lower_body.contains("too many requests")
}

/// Detect a used-up daily or billing quota
pub fn is_quota_error(body: &str) -> bool {
    let lower_body = body.to_lowercase();
    lower_body.contains("insufficient_quota")
        || lower_body.contains("quota exceeded")
        || lower_body.contains("exceeded your current quota")
        || lower_body.contains("resource_exhausted")
        || lower_body.contains("daily limit")
}

/// `retry-after` header in whole seconds, rounded up
pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get("retry-after")?.to_str().ok()?;
    let duration = match value.trim().parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => parse_duration_string(value)?,
    };
    Some(
        duration
            .as_secs()
            .saturating_add(u64::from(duration.subsec_nanos() > 0)),
    )
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= BODY_EXCERPT_CHARS {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Parse "1m30s", "2h", "1.5s" or "250ms"; malformed or out-of-range values are `None`
fn parse_duration_string(s: &str) -> Option<Duration> {
    let mut rest = s.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let value: f64 = number.parse().ok()?;
        let scale = match unit {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            _ => return None,
        };
        let part = Duration::try_from_secs_f64(value * scale).ok()?;
        total = total.checked_add(part)?;
        rest = next;
    }
    Some(total)
}
