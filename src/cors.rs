//! Cross-origin policy for the HTTP surface.
//!
//! Origins come as a comma-separated list: `*`, explicit `http(s)://`
//! origins, and `regex:<pattern>` entries matched against the whole origin.
//! Credentials are never combined with a wildcard origin.

use axum::http::HeaderValue;
use axum::http::request::Parts;
use regex::Regex;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::SpectraConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    origins: Vec<String>,
    patterns: Vec<String>,
    allow_credentials: bool,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::parse("", false)
    }
}

impl CorsPolicy {
    pub fn from_config(config: &SpectraConfig) -> Self {
        Self::parse(&config.cors_allowed_origins, config.cors_allow_credentials)
    }

    pub fn parse(raw: &str, allow_credentials: bool) -> Self {
        let mut origins = Vec::new();
        let mut patterns = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                origins.push(entry.to_string());
            } else if entry.starts_with("http://") || entry.starts_with("https://") {
                origins.push(entry.trim_end_matches('/').to_string());
            } else if let Some(pattern) = entry.strip_prefix("regex:") {
                let pattern = pattern.trim();
                if !pattern.is_empty() {
                    patterns.push(pattern.to_string());
                }
            } else {
                warn!(origin = %entry, "ignoring CORS origin without http(s) scheme");
            }
        }

        let unrestricted =
            (origins.is_empty() && patterns.is_empty()) || origins.iter().any(|o| o == "*");
        if origins.is_empty() && patterns.is_empty() {
            origins.push("*".to_string());
        }
        Self {
            origins,
            patterns,
            allow_credentials: allow_credentials && !unrestricted,
        }
    }

    pub fn allows_any_origin(&self) -> bool {
        self.origins.iter().any(|o| o == "*")
    }

    pub fn allows_credentials(&self) -> bool {
        self.allow_credentials
    }

    pub fn layer(&self) -> CorsLayer {
        if self.allows_any_origin() {
            return CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
        }

        let exact: Vec<HeaderValue> = self
            .origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        let origin = match self.pattern() {
            Some(pattern) => AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
                exact.contains(origin) || origin.to_str().is_ok_and(|o| pattern.is_match(o))
            }),
            None => AllowOrigin::list(exact),
        };

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(self.allow_credentials)
    }

    fn pattern(&self) -> Option<Regex> {
        if self.patterns.is_empty() {
            return None;
        }
        let alternatives: Vec<String> = self.patterns.iter().map(|p| format!("(?:{p})")).collect();
        match Regex::new(&format!("^(?:{})$", alternatives.join("|"))) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                warn!(%err, "ignoring invalid CORS origin patterns");
                None
            }
        }
    }
}
