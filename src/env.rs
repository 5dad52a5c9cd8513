//! Translation of external configuration into gateway environment variables.
//!
//! Pure name translation only: each recognized external key maps to exactly
//! one container-side variable, absent keys are omitted, and repeated calls
//! with the same input yield the same mapping.

use crate::config::{GatewayConfig, StorageConfig};
use std::collections::HashMap;

/// Container-side variable for the development-mode flag
pub const GATEWAY_DEV_MODE: &str = "GATEWAY_DEV_MODE";
/// Container-side variable for the gateway access token
pub const GATEWAY_AUTH_TOKEN: &str = "GATEWAY_AUTH_TOKEN";
/// Container-side variable for the sleep timeout (seconds)
pub const GATEWAY_SLEEP_TIMEOUT: &str = "GATEWAY_SLEEP_TIMEOUT";
/// Container-side variable for the bucket name
pub const STORAGE_BUCKET: &str = "STORAGE_BUCKET";
/// Container-side variable for the bucket access key
pub const STORAGE_ACCESS_KEY: &str = "STORAGE_ACCESS_KEY";
/// Container-side variable for the bucket secret key
pub const STORAGE_SECRET_KEY: &str = "STORAGE_SECRET_KEY";

/// Build the environment for the gateway process from the external
/// configuration. Deterministic and side-effect free.
pub fn gateway_env(
    gateway: &GatewayConfig,
    storage: Option<&StorageConfig>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(dev_mode) = gateway.dev_mode {
        env.insert(
            GATEWAY_DEV_MODE.to_string(),
            if dev_mode { "1" } else { "0" }.to_string(),
        );
    }

    if let Some(ref token) = gateway.auth_token {
        env.insert(GATEWAY_AUTH_TOKEN.to_string(), token.clone());
    }

    if let Some(secs) = gateway.sleep_timeout_secs {
        env.insert(GATEWAY_SLEEP_TIMEOUT.to_string(), secs.to_string());
    }

    if let Some(storage) = storage {
        env.insert(STORAGE_BUCKET.to_string(), storage.bucket.clone());
        if !storage.access_key.is_empty() {
            env.insert(STORAGE_ACCESS_KEY.to_string(), storage.access_key.clone());
        }
        if !storage.secret_key.is_empty() {
            env.insert(STORAGE_SECRET_KEY.to_string(), storage.secret_key.clone());
        }
    }

    env
}
