//! Client IP extraction.

use std::net::SocketAddr;

use axum::{extract::ConnectInfo, http::request::Parts};

use crate::cli::IpExtractor;

/// Access to HTTP headers and extensions, implemented for both `Parts` and `Request`.
pub trait HasHeadersAndExtensions {
    fn headers(&self) -> &axum::http::HeaderMap;
    fn extensions(&self) -> &axum::http::Extensions;
}

impl HasHeadersAndExtensions for Parts {
    fn headers(&self) -> &axum::http::HeaderMap {
        &self.headers
    }
    fn extensions(&self) -> &axum::http::Extensions {
        &self.extensions
    }
}

impl<B> HasHeadersAndExtensions for axum::extract::Request<B> {
    fn headers(&self) -> &axum::http::HeaderMap {
        axum::extract::Request::headers(self)
    }
    fn extensions(&self) -> &axum::http::Extensions {
        axum::extract::Request::extensions(self)
    }
}

/// Extract client IP address based on configuration.
///
/// With an extractor the configured header is mandatory; there is no
/// fallback to the socket address, which would be the proxy's.
pub fn extract_client_ip<T: HasHeadersAndExtensions>(
    source: &T,
    ip_extractor: Option<&IpExtractor>,
) -> Result<String, &'static str> {
    match ip_extractor {
        Some(extractor) => {
            let header_value = source
                .headers()
                .get(extractor.header_name)
                .ok_or("IP header not present")?
                .to_str()
                .map_err(|_| "IP header contains invalid characters")?;
            extractor.extract(header_value)
        }
        None => source
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .ok_or("No client IP available"),
    }
}
