use std::collections::HashMap;
use std::fmt;

use crate::error::VdevError;

pub const CONFIG_KEY_ENDPOINT: &str = "object_endpoint";
pub const CONFIG_KEY_REGION: &str = "object_region";
pub const CONFIG_KEY_CREDENTIALS_LOCATION: &str = "object_credentials_location";
pub const CONFIG_KEY_CREDENTIALS: &str = "object_credentials";

/// Connection parameters captured once at `init` and held immutable for the
/// life of the device.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub region: String,
    pub credential_location: String,
    /// Ephemeral material forwarded to the agent. Never included in `Debug`
    /// output or log lines.
    pub credentials: String,
}

impl ConnectionConfig {
    /// Extracts the four connection strings from a host-supplied config map.
    /// Missing any of them is an invalid-argument error.
    pub fn from_map(config: &HashMap<String, String>) -> Result<Self, VdevError> {
        let get = |key: &'static str| {
            config
                .get(key)
                .cloned()
                .ok_or(VdevError::MissingConfigKey(key))
        };
        Ok(ConnectionConfig {
            endpoint: get(CONFIG_KEY_ENDPOINT)?,
            region: get(CONFIG_KEY_REGION)?,
            credential_location: get(CONFIG_KEY_CREDENTIALS_LOCATION)?,
            credentials: get(CONFIG_KEY_CREDENTIALS)?,
        })
    }

    /// What `config_generate` reports back to the host: the credential
    /// *location*, never the material itself.
    pub fn generate(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(
            CONFIG_KEY_CREDENTIALS.to_string(),
            self.credential_location.clone(),
        );
        out.insert(CONFIG_KEY_ENDPOINT.to_string(), self.endpoint.clone());
        out.insert(CONFIG_KEY_REGION.to_string(), self.region.clone());
        out
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("credential_location", &self.credential_location)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
