use serde::Serialize;

pub const PRODUCT_NAME: &str = "hooklink";

/// Identifies this client to the backend on both the REST calls and the
/// websocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_agent: String,
    /// JSON document sent as `X-Stripe-Client-User-Agent`.
    pub metadata: String,
}

#[derive(Serialize)]
struct ClientMetadata<'a> {
    name: &'a str,
    version: &'a str,
    publisher: &'a str,
    os: &'a str,
    arch: &'a str,
}

impl ClientIdentity {
    pub fn current() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let metadata = ClientMetadata {
            name: PRODUCT_NAME,
            version,
            publisher: PRODUCT_NAME,
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        };
        Self {
            user_agent: format!("{PRODUCT_NAME}/{version}"),
            metadata: serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_owned()),
        }
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_json_with_platform() {
        let identity = ClientIdentity::current();
        assert!(identity.user_agent.starts_with("hooklink/"));
        let value: serde_json::Value = serde_json::from_str(&identity.metadata).unwrap();
        assert_eq!(value["name"], PRODUCT_NAME);
        assert_eq!(value["os"], std::env::consts::OS);
    }
}
