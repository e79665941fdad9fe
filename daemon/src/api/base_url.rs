//! Request-relative base URL

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::convert::Infallible;

const DEFAULT_SCHEME: &str = "http";
const DEFAULT_HOST: &str = "localhost";

/// `<scheme>://<host>` the client used to reach us, honouring reverse proxy headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl(pub String);

impl BaseUrl {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                // Proxies may append a list, the first entry is the client-facing one
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let scheme = header("x-forwarded-proto").unwrap_or(DEFAULT_SCHEME);
        let host = header("x-forwarded-host")
            .or_else(|| header("host"))
            .unwrap_or(DEFAULT_HOST);
        Self(format!("{}://{}", scheme, host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for BaseUrl
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
