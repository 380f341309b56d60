pub use uri::{InvalidUriError, Uri};

/// Path of the agent API under the agent subdomain
pub const AGENT_API_PATH: &str = "/api-agent/v1/";

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use thiserror::Error;

    use super::AGENT_API_PATH;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    /// An absolute `http(s)` URI
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        fn new(uri: http::Uri) -> Self {
            Self(uri)
        }

        /// The `host[:port]` part of the URI
        pub fn authority(&self) -> Option<&str> {
            self.0.authority().map(|a| a.as_str())
        }

        /// Replace the path of `base_uri`, dropping any query
        pub fn from_parts(base_uri: Uri, path: &str) -> Result<Self, InvalidUriError> {
            let mut parts = base_uri.0.into_parts();
            parts.path_and_query = Some(http::uri::PathAndQuery::from_str(path)?);

            Ok(http::Uri::from_parts(parts).map(Self::new)?)
        }

        /// Derive the agent API endpoint of a cloud base URL.
        ///
        /// The agent API lives on the `agent.` subdomain of the cloud host,
        /// under a fixed path, e.g. `https://wirenboard.cloud` becomes
        /// `https://agent.wirenboard.cloud/api-agent/v1/`.
        pub fn agent_url(&self) -> Result<Self, InvalidUriError> {
            let authority = self
                .authority()
                .ok_or_else(|| InvalidUriError(format!("missing host in '{self}'")))?;

            let mut parts = self.0.clone().into_parts();
            parts.authority = Some(http::uri::Authority::from_maybe_shared(format!(
                "agent.{authority}"
            ))?);
            parts.path_and_query = Some(http::uri::PathAndQuery::from_static(AGENT_API_PATH));

            Ok(http::Uri::from_parts(parts).map(Self::new)?)
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let uri = http::Uri::from_str(s)?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => return Err(InvalidUriError(format!("unsupported scheme in '{s}'"))),
            }
            if uri.host().is_none_or(str::is_empty) {
                return Err(InvalidUriError(format!("missing host in '{s}'")));
            }
            Ok(Self(uri))
        }
    }
}
