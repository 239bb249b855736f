//! Shared utility functions for provider adapters.

use aegis_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_error_maps_to_http() {
        let client = reqwest::Client::new();
        let err = client.get("http://127.0.0.1:1").send().await.unwrap_err();
        assert!(matches!(from_reqwest(err), Error::Http(_) | Error::Timeout(_)));
    }
}
