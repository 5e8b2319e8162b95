use std::env;

/// Logical names of the two streams and the consumer groups that read them.
///
/// Pure configuration; the bridge never hardcodes these outside of the
/// defaults below.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRegistry {
    /// Stream the producers append requests to.
    pub request_stream: String,
    /// Stream the workers append results to.
    pub result_stream: String,
    /// Consumer group shared by all worker instances.
    pub worker_group: String,
    /// Prefix for the per-client groups on the result stream.
    pub client_group_prefix: String,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self {
            request_stream: "data-requests".to_string(),
            result_stream: "data-results".to_string(),
            worker_group: "bridge-workers".to_string(),
            client_group_prefix: "bridge-clients".to_string(),
        }
    }
}

impl StreamRegistry {
    /// Builds a registry from the environment, falling back to the defaults
    /// for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            request_stream: env::var("BRIDGE_REQUEST_STREAM").unwrap_or(defaults.request_stream),
            result_stream: env::var("BRIDGE_RESULT_STREAM").unwrap_or(defaults.result_stream),
            worker_group: env::var("BRIDGE_WORKER_GROUP").unwrap_or(defaults.worker_group),
            client_group_prefix: env::var("BRIDGE_CLIENT_GROUP_PREFIX")
                .unwrap_or(defaults.client_group_prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serial_test::serial;

    #[test]
    fn default_names_match_deployment() {
        let registry = StreamRegistry::default();

        assert_eq!(registry.request_stream, "data-requests");
        assert_eq!(registry.result_stream, "data-results");
    }

    #[test]
    #[serial]
    fn from_env_overrides_names() {
        unsafe {
            env::set_var("BRIDGE_REQUEST_STREAM", "requests-test");
            env::set_var("BRIDGE_WORKER_GROUP", "workers-test");
        }

        let registry = StreamRegistry::from_env();

        unsafe {
            env::remove_var("BRIDGE_REQUEST_STREAM");
            env::remove_var("BRIDGE_WORKER_GROUP");
        }

        assert_eq!(registry.request_stream, "requests-test");
        assert_eq!(registry.worker_group, "workers-test");
        assert_eq!(registry.result_stream, "data-results");
    }
}
