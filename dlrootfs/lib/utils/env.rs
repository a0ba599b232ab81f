use std::env;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable overriding the registry base url.
pub const DLROOTFS_REGISTRY_URL_ENV_VAR: &str = "DLROOTFS_REGISTRY_URL";

/// Environment variable overriding the token endpoint.
pub const DLROOTFS_AUTH_REALM_ENV_VAR: &str = "DLROOTFS_AUTH_REALM";

/// Environment variable overriding the token service name.
pub const DLROOTFS_AUTH_SERVICE_ENV_VAR: &str = "DLROOTFS_AUTH_SERVICE";

/// Base URL for the Docker Registry v2 API.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Endpoint for acquiring anonymous pull tokens.
pub const DEFAULT_AUTH_REALM: &str = "https://auth.docker.io/token";

/// The service name used during token authentication.
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the registry base url, honoring `DLROOTFS_REGISTRY_URL`.
pub fn get_registry_url() -> String {
    env_or_default(DLROOTFS_REGISTRY_URL_ENV_VAR, DEFAULT_REGISTRY_URL)
}

/// Returns the token endpoint, honoring `DLROOTFS_AUTH_REALM`.
pub fn get_auth_realm() -> String {
    env_or_default(DLROOTFS_AUTH_REALM_ENV_VAR, DEFAULT_AUTH_REALM)
}

/// Returns the token service name, honoring `DLROOTFS_AUTH_SERVICE`.
pub fn get_auth_service() -> String {
    env_or_default(DLROOTFS_AUTH_SERVICE_ENV_VAR, DEFAULT_AUTH_SERVICE)
}

fn env_or_default(var: &str, default: &str) -> String {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            tracing::debug!("using {var}={value}");
            value.trim_end_matches('/').to_string()
        }
        _ => default.to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
