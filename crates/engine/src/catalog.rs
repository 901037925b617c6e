use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Source of the bridge agents the backend currently offers. Consulted synchronously per send.
pub trait AgentCatalog: Send + Sync {
    /// `None` means the catalogue has not been loaded yet.
    fn available_agent_ids(&self) -> Option<HashSet<String>>;
}

/// Catalogue snapshot that can be refreshed while engines hold it.
#[derive(Default)]
pub struct StaticAgentCatalog {
    agents: ArcSwapOption<HashSet<String>>,
}

impl StaticAgentCatalog {
    pub fn new<I, S>(agent_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let catalog = Self::unknown();
        catalog.replace(agent_ids);
        catalog
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn replace<I, S>(&self, agent_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents = agent_ids.into_iter().map(Into::into).collect::<HashSet<_>>();
        self.agents.store(Some(Arc::new(agents)));
    }

    pub fn clear(&self) {
        self.agents.store(None);
    }
}

impl AgentCatalog for StaticAgentCatalog {
    fn available_agent_ids(&self) -> Option<HashSet<String>> {
        self.agents.load_full().map(|agents| agents.as_ref().clone())
    }
}
