use std::time::Duration;

use typed_builder::TypedBuilder;

#[derive(Debug, Clone, TypedBuilder)]
pub struct RosterConfig {
    /// Period of the background reconciliation against the peer source.
    #[builder(default = Duration::from_secs(5))]
    pub refresh_interval: Duration,
    /// Refresh requests closer together than this are coalesced.
    #[builder(default = Duration::from_millis(250))]
    pub refresh_debounce: Duration,
    #[builder(default = String::from("127.0.0.1"), setter(into))]
    pub loopback: String,
    /// Non-loopback addresses of this host.
    #[builder(default)]
    pub local_addresses: Vec<String>,
    /// Drop peers announced on a local non-loopback address; the same agent is
    /// also announced on loopback.
    #[builder(default = true)]
    pub drop_local_non_loopback: bool,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RosterConfig {
    pub fn is_loopback(&self, host: &str) -> bool {
        host == self.loopback
            || host.starts_with("127.")
            || host == "::1"
            || host.eq_ignore_ascii_case("localhost")
    }

    pub fn is_local_host(&self, host: &str) -> bool {
        self.is_loopback(host) || self.local_addresses.iter().any(|a| a == host)
    }
}
