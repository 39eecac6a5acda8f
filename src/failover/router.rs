//! Keyword routing used while the standby coordinator is active.

use serde::{Deserialize, Serialize};

use crate::config::KeywordRoute;

/// Where a message goes during failover
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agent", rename_all = "snake_case")]
pub enum RouteTarget {
    Agent(String),
    /// Held for the primary coordinator
    Queued,
}

impl RouteTarget {
    pub fn as_str(&self) -> &str {
        match self {
            RouteTarget::Agent(agent) => agent,
            RouteTarget::Queued => "queued",
        }
    }

    pub fn agent(&self) -> Option<&str> {
        match self {
            RouteTarget::Agent(agent) => Some(agent),
            RouteTarget::Queued => None,
        }
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First-match, case-insensitive substring classifier
#[derive(Debug, Clone)]
pub struct MessageRouter {
    routes: Vec<KeywordRoute>,
    default_agent: String,
}

impl MessageRouter {
    pub fn new(routes: &[KeywordRoute], default_agent: impl Into<String>) -> Self {
        let routes = routes
            .iter()
            .filter(|route| !route.keyword.trim().is_empty())
            .map(|route| KeywordRoute::new(route.keyword.to_lowercase(), route.agent.clone()))
            .collect();
        Self {
            routes,
            default_agent: default_agent.into(),
        }
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// Agent of the first route whose keyword occurs in `content`
    pub fn classify(&self, content: &str) -> Option<&str> {
        let content = content.to_lowercase();
        self.routes
            .iter()
            .find(|route| content.contains(&route.keyword))
            .map(|route| route.agent.as_str())
    }

    /// Target for a critical message; unmatched content goes to the default agent
    pub fn route_critical(&self, content: &str) -> RouteTarget {
        RouteTarget::Agent(
            self.classify(content)
                .unwrap_or(&self.default_agent)
                .to_string(),
        )
    }
}
