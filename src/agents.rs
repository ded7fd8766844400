//! Agent records and the lookups the dispatcher and scheduler depend on
//!
//! Agents are owned by the content core. This crate only reads them, through
//! [`SubscriptionResolver`] (event fan-out) and [`CronAgentSource`] (scheduling).

use crate::error::{Error, Result};
use crate::events::EventType;
use crate::jobs::TriggerType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// A (collection, event type) pair an agent listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub collection_name: String,
    pub event_type: EventType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Prompt for scheduled runs
    #[serde(default)]
    pub initial_input: Option<String>,
    /// Trigger data attached to scheduled runs
    #[serde(default)]
    pub default_trigger_data: serde_json::Map<String, serde_json::Value>,
}

impl Agent {
    #[must_use]
    pub fn subscribes_to(&self, collection_name: &str, event_type: EventType) -> bool {
        self.trigger_type == TriggerType::CollectionEvent
            && self
                .subscriptions
                .iter()
                .any(|s| s.collection_name == collection_name && s.event_type == event_type)
    }
}

/// Finds the agents subscribed to a content event
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::Resolver` if the agent store is unavailable.
    async fn find_agents_by_event_trigger(
        &self,
        collection_name: &str,
        event_type: EventType,
    ) -> Result<Vec<Agent>>;
}

/// Lists the agents that run on a cron schedule
#[async_trait]
pub trait CronAgentSource: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::Resolver` if the agent store is unavailable.
    async fn cron_agents(&self) -> Result<Vec<Agent>>;
}

/// Agent directory backed by a JSON file holding an array of agents
///
/// The file is re-read on every lookup, so edits apply without a restart.
pub struct FileAgentDirectory {
    path: PathBuf,
}

impl FileAgentDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<Agent>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::Resolver(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let agents: Vec<Agent> = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Resolver(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        debug!("Loaded {} agent(s) from {}", agents.len(), self.path.display());
        Ok(agents)
    }

    /// Look up one agent by id
    ///
    /// # Errors
    ///
    /// Returns `Error::Resolver` if the file cannot be read or parsed.
    pub async fn agent(&self, id: u64) -> Result<Option<Agent>> {
        Ok(self.load().await?.into_iter().find(|a| a.id == id))
    }
}

#[async_trait]
impl SubscriptionResolver for FileAgentDirectory {
    async fn find_agents_by_event_trigger(
        &self,
        collection_name: &str,
        event_type: EventType,
    ) -> Result<Vec<Agent>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|a| a.subscribes_to(collection_name, event_type))
            .collect())
    }
}

#[async_trait]
impl CronAgentSource for FileAgentDirectory {
    async fn cron_agents(&self) -> Result<Vec<Agent>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|a| a.trigger_type == TriggerType::Cron && a.cron_expression.is_some())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const AGENTS: &str = r#"[
        {"id": 1, "name": "summarizer", "trigger_type": "collection_event",
         "subscriptions": [{"collection_name": "articles", "event_type": "item_created"}]},
        {"id": 2, "trigger_type": "collection_event",
         "subscriptions": [{"collection_name": "articles", "event_type": "item:created"},
                           {"collection_name": "pages", "event_type": "item_deleted"}]},
        {"id": 3, "trigger_type": "cron", "cron_expression": "*/5 * * * *"},
        {"id": 4, "trigger_type": "cron"},
        {"id": 5, "trigger_type": "webhook",
         "subscriptions": [{"collection_name": "articles", "event_type": "item_created"}]}
    ]"#;

    fn directory(contents: &str) -> (FileAgentDirectory, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agents.json");
        std::fs::write(&path, contents).unwrap();
        (FileAgentDirectory::new(path), temp_dir)
    }

    #[tokio::test]
    async fn test_find_agents_by_event_trigger() {
        let (dir, _temp) = directory(AGENTS);

        let ids: Vec<u64> = dir
            .find_agents_by_event_trigger("articles", EventType::ItemCreated)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let none = dir
            .find_agents_by_event_trigger("articles", EventType::ItemDeleted)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_cron_agents_require_expression() {
        let (dir, _temp) = directory(AGENTS);

        let agents = dir.cron_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, 3);
    }

    #[tokio::test]
    async fn test_agent_lookup() {
        let (dir, _temp) = directory(AGENTS);

        let agent = dir.agent(5).await.unwrap().unwrap();
        assert_eq!(agent.trigger_type, TriggerType::Webhook);
        assert!(dir.agent(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_directory_is_resolver_error() {
        let missing = FileAgentDirectory::new("/nonexistent/agents.json");
        let err = missing.cron_agents().await.unwrap_err();
        assert!(matches!(err, Error::Resolver(_)));
        assert!(err.is_retryable());

        let (broken, _temp) = directory("{not an array");
        assert!(matches!(
            broken
                .find_agents_by_event_trigger("articles", EventType::ItemCreated)
                .await,
            Err(Error::Resolver(_))
        ));
    }
}
