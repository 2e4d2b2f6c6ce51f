use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use typed_builder::TypedBuilder;

/// Well-known peer attribute keys.
pub mod attr {
    pub const ID: &str = "ID";
    pub const NAME: &str = "Name";
    pub const AGENT_ID: &str = "AgentID";
    pub const TRANSPORT_NAME: &str = "TransportName";
    pub const HOST: &str = "Host";
    pub const PORT: &str = "Port";
    /// Id the agent was known by before it reconnected through another address.
    pub const CLIENT_ID: &str = "ClientID";
    /// Marks a proxy/relay peer that adds value on top of another agent.
    pub const VALUE_ADD: &str = "ValueAdd";
    /// Id of the discovered peer merged into a static peer.
    pub const REMOTE_ID: &str = "RemoteID";
}

const CLI_PREFIXES: [&str; 2] = ["Eclipse CLI", "Eclipse Command Server"];
const CLI_SUFFIXES: [&str; 2] = ["CLI Server", "CLI Client"];

/// A remote agent as known to the roster.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PeerDescriptor {
    #[builder(setter(into))]
    pub id: String,
    #[builder(default, setter(into))]
    pub name: String,
    #[builder(default)]
    pub attributes: HashMap<String, String>,
    #[builder(default = Utc::now())]
    pub last_heartbeat: DateTime<Utc>,
    /// User-configured rather than discovered.
    #[builder(default)]
    pub is_static: bool,
}

impl PeerDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::builder().id(id).name(name).build()
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.attr(attr::AGENT_ID)
    }

    pub fn transport_name(&self) -> Option<&str> {
        self.attr(attr::TRANSPORT_NAME)
    }

    pub fn host(&self) -> Option<&str> {
        self.attr(attr::HOST)
    }

    pub fn port(&self) -> Option<&str> {
        self.attr(attr::PORT)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.attr(attr::CLIENT_ID)
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.attr(attr::REMOTE_ID)
    }

    /// Whether `id` names this peer, directly or through its merged alias.
    pub fn answers_to(&self, id: &str) -> bool {
        self.id == id || self.remote_id() == Some(id)
    }

    pub fn is_value_add(&self) -> bool {
        self.attr(attr::VALUE_ADD).is_some_and(|value| {
            let value = value.trim();
            value == "1" || value.eq_ignore_ascii_case("true")
        })
    }

    /// Command-line relays announce themselves like agents but are not targets.
    pub fn is_cli_relay(&self) -> bool {
        CLI_PREFIXES.iter().any(|p| self.name.starts_with(p))
            || CLI_SUFFIXES.iter().any(|s| self.name.ends_with(s))
    }

    /// Same name and attributes. Liveness and origin are not compared.
    pub fn same_content(&self, other: &PeerDescriptor) -> bool {
        self.id == other.id && self.name == other.name && self.attributes == other.attributes
    }

    /// Whether `other` reaches the same agent: same agent id, or the same TCP
    /// or SSL endpoint.
    pub fn same_endpoint(&self, other: &PeerDescriptor) -> bool {
        if let (Some(a), Some(b)) = (self.agent_id(), other.agent_id()) {
            if a == b {
                return true;
            }
        }
        match (self.transport_name(), other.transport_name()) {
            (Some(t), Some(u)) if t == u && (t == "TCP" || t == "SSL") => {
                self.host().is_some()
                    && self.host() == other.host()
                    && self.port().is_some()
                    && self.port() == other.port()
            }
            _ => false,
        }
    }
}
