//! Correlation identifier: an opaque tag carried through job, result, and log
//! records for a single request.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `{origin}-{unix-seconds}-{6-hex-random}`, minted by the Front-End when a
/// client does not supply `X-Correlation-ID`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a new identifier for requests originating at `origin` (e.g. `"api"`).
    pub fn generate(origin: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        let suffix: u32 = rand::thread_rng().gen_range(0..0x1_000_000);
        Self(format!("{origin}-{now}-{suffix:06x}"))
    }

    /// Adopt a client-supplied value verbatim.
    pub fn from_header(value: &str) -> Self {
        Self(value.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<CorrelationId> for String {
    fn from(value: CorrelationId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_has_expected_shape() {
        let id = CorrelationId::generate("api");
        let parts: Vec<&str> = id.as_str().splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "api");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn from_header_is_verbatim() {
        let id = CorrelationId::from_header("trace-xyz");
        assert_eq!(id.as_str(), "trace-xyz");
        assert_eq!(id.to_string(), "trace-xyz");
    }

    #[test]
    fn generate_is_probabilistically_unique() {
        let a = CorrelationId::generate("api");
        let b = CorrelationId::generate("api");
        assert_ne!(a, b);
    }
}
