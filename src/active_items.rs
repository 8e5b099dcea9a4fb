//! Tracks the currently-exposed identifiers per item kind for delta computation (L4).

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::name_tracker::ItemKind;

/// Result of a single delta cycle: identifiers to add and to remove so the
/// exposed set matches the fresh input set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub additions: Vec<String>,
    pub removals: Vec<String>,
}

#[derive(Debug, Default)]
struct PerKind {
    tools: HashSet<String>,
    resources: HashSet<String>,
    prompts: HashSet<String>,
}

impl PerKind {
    fn set_for(&mut self, kind: ItemKind) -> &mut HashSet<String> {
        match kind {
            ItemKind::Tool => &mut self.tools,
            ItemKind::Resource => &mut self.resources,
            ItemKind::Prompt => &mut self.prompts,
        }
    }
}

/// Maintains the active exposed-identifier set per item kind.
#[derive(Debug, Clone, Default)]
pub struct ActiveItemManager {
    state: Arc<Mutex<PerKind>>,
}

impl ActiveItemManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes additions/removals between `fresh` and the currently active
    /// set for `kind`, then commits `fresh` as the new active set. Duplicate
    /// identifiers within `fresh` are coalesced via the `HashSet` conversion.
    pub async fn diff_and_commit(&self, kind: ItemKind, fresh: Vec<String>) -> Delta {
        let incoming: HashSet<String> = fresh.into_iter().collect();
        let mut state = self.state.lock().await;
        let active = state.set_for(kind);

        let additions: Vec<String> = incoming.difference(active).cloned().collect();
        let removals: Vec<String> = active.difference(&incoming).cloned().collect();

        *active = incoming;
        Delta {
            additions,
            removals,
        }
    }

    /// Current active set for a kind, for diagnostics/testing.
    pub async fn active(&self, kind: ItemKind) -> HashSet<String> {
        let state = self.state.lock().await;
        match kind {
            ItemKind::Tool => state.tools.clone(),
            ItemKind::Resource => state.resources.clone(),
            ItemKind::Prompt => state.prompts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_cycle_is_all_additions() {
        let mgr = ActiveItemManager::new();
        let delta = mgr
            .diff_and_commit(
                ItemKind::Tool,
                vec!["a".to_string(), "b".to_string()],
            )
            .await;
        assert_eq!(delta.removals.len(), 0);
        let mut additions = delta.additions;
        additions.sort();
        assert_eq!(additions, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn subsequent_cycle_computes_additions_and_removals() {
        let mgr = ActiveItemManager::new();
        mgr.diff_and_commit(ItemKind::Tool, vec!["a".to_string(), "b".to_string()])
            .await;

        let delta = mgr
            .diff_and_commit(ItemKind::Tool, vec!["b".to_string(), "c".to_string()])
            .await;

        assert_eq!(delta.additions, vec!["c".to_string()]);
        assert_eq!(delta.removals, vec!["a".to_string()]);

        let active = mgr.active(ItemKind::Tool).await;
        assert_eq!(active.len(), 2);
        assert!(active.contains("b"));
        assert!(active.contains("c"));
    }

    #[tokio::test]
    async fn duplicate_identifiers_are_coalesced() {
        let mgr = ActiveItemManager::new();
        let delta = mgr
            .diff_and_commit(
                ItemKind::Tool,
                vec!["a".to_string(), "a".to_string(), "b".to_string()],
            )
            .await;
        assert_eq!(delta.additions.len(), 2);
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let mgr = ActiveItemManager::new();
        mgr.diff_and_commit(ItemKind::Tool, vec!["a".to_string()])
            .await;
        mgr.diff_and_commit(ItemKind::Resource, vec!["r1".to_string()])
            .await;
        assert_eq!(mgr.active(ItemKind::Tool).await.len(), 1);
        assert_eq!(mgr.active(ItemKind::Resource).await.len(), 1);
        assert_eq!(mgr.active(ItemKind::Prompt).await.len(), 0);
    }
}
