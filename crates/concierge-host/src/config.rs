//! Host configuration loaded from environment variables.
//!
//! All settings have defaults so the demo portal runs with zero
//! configuration.

use std::path::PathBuf;

use concierge_client::ChatConfig;
use concierge_shared::{Identity, IdentityId, Role, ScopeId};

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// SQLite database file.
    /// Env: `CONCIERGE_DB_PATH`
    /// Default: `concierge.db` in the platform data directory.
    pub db_path: Option<PathBuf>,

    /// The signed-in customer of the scripted session.
    /// Env: `CONCIERGE_CUSTOMER_ID`
    /// Default: `cust-001`
    pub customer: Identity,

    /// The staff member answering.
    /// Env: `CONCIERGE_AGENT_ID`
    /// Default: `agent-001`
    pub agent: Identity,

    /// Business record the scoped thread is anchored to.
    /// Env: `CONCIERGE_DEMO_SCOPE`
    /// Default: `REQ-1042`
    pub scope: ScopeId,

    pub chat: ChatConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            customer: Identity {
                id: IdentityId::new("cust-001"),
                display_name: "Dana Customer".to_string(),
                role: Role::Customer,
            },
            agent: Identity {
                id: IdentityId::new("agent-001"),
                display_name: "Sam Sourcing".to_string(),
                role: Role::Agent,
            },
            scope: ScopeId::new("REQ-1042"),
            chat: ChatConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self {
            chat: ChatConfig::from_env(),
            ..Self::default()
        };

        if let Ok(path) = std::env::var("CONCIERGE_DB_PATH") {
            if !path.trim().is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(id) = non_empty_var("CONCIERGE_CUSTOMER_ID") {
            config.customer.id = IdentityId::new(id);
        }
        if let Some(id) = non_empty_var("CONCIERGE_AGENT_ID") {
            config.agent.id = IdentityId::new(id);
        }
        if let Some(scope) = non_empty_var("CONCIERGE_DEMO_SCOPE") {
            config.scope = ScopeId::new(scope);
        }

        if config.customer.id == config.agent.id {
            tracing::warn!(
                id = %config.agent.id,
                "Customer and agent ids are equal, using default agent id"
            );
            config.agent.id = IdentityId::new("agent-001");
        }

        config
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
