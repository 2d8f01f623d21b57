//! Model registry and role table.
//!
//! Model, agent, and fallback-ranking rows are read on every step but
//! written rarely; the registry caches them and invalidates on write.
//! All writes go straight through to the store.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::store::{Agent, Model, Store};

/// Cached read surface over models, agents, and role rankings.
pub struct Registry {
    store: Arc<Store>,
    models_by_id: DashMap<i64, Model>,
    models_by_name: DashMap<String, i64>,
    agents_by_role: DashMap<String, Agent>,
    fallbacks_by_role: DashMap<String, Vec<i64>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("cached_models", &self.models_by_id.len())
            .field("cached_roles", &self.agents_by_role.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Registry over `store` with empty caches.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            models_by_id: DashMap::new(),
            models_by_name: DashMap::new(),
            agents_by_role: DashMap::new(),
            fallbacks_by_role: DashMap::new(),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Drop every cached row.
    pub fn invalidate(&self) {
        self.models_by_id.clear();
        self.models_by_name.clear();
        self.agents_by_role.clear();
        self.fallbacks_by_role.clear();
    }

    /// Model by id, cached.
    pub fn model_by_id(&self, id: i64) -> Result<Model> {
        if let Some(model) = self.models_by_id.get(&id) {
            return Ok(model.clone());
        }
        let model = self.store.model_by_id(id)?;
        self.models_by_name.insert(model.name.clone(), model.id);
        self.models_by_id.insert(id, model.clone());
        Ok(model)
    }

    /// Model by name, cached.
    pub fn model_by_name(&self, name: &str) -> Result<Model> {
        let cached_id = self.models_by_name.get(name).map(|id| *id);
        if let Some(id) = cached_id {
            return self.model_by_id(id);
        }
        let model = self.store.model_by_name(name)?;
        self.models_by_name.insert(model.name.clone(), model.id);
        self.models_by_id.insert(model.id, model.clone());
        Ok(model)
    }

    /// Upsert a model and invalidate.
    pub fn upsert_model(&self, model: &Model) -> Result<i64> {
        let id = self.store.upsert_model(model)?;
        self.invalidate();
        Ok(id)
    }

    /// Default executor agent for a role, cached.
    pub fn active_agent_for_role(&self, role: &str) -> Result<Agent> {
        if let Some(agent) = self.agents_by_role.get(role) {
            return Ok(agent.clone());
        }
        let agent = self.store.active_agent_for_role(role)?;
        self.agents_by_role.insert(role.to_string(), agent.clone());
        Ok(agent)
    }

    /// Upsert an agent and invalidate.
    pub fn upsert_agent(&self, agent: &Agent) -> Result<i64> {
        let id = self.store.upsert_agent(agent)?;
        self.invalidate();
        Ok(id)
    }

    /// Ranked, enabled fallback models for a role, cached.
    pub fn fallback_models(&self, role: &str) -> Result<Vec<Model>> {
        let cached: Option<Vec<i64>> = self.fallbacks_by_role.get(role).map(|ids| ids.clone());
        if let Some(ids) = cached {
            return ids.iter().map(|id| self.model_by_id(*id)).collect();
        }
        let models = self.store.fallback_models_for_role(role)?;
        self.fallbacks_by_role
            .insert(role.to_string(), models.iter().map(|m| m.id).collect());
        for model in &models {
            self.models_by_name.insert(model.name.clone(), model.id);
            self.models_by_id.insert(model.id, model.clone());
        }
        Ok(models)
    }

    /// Replace the fallback ranking for a role and invalidate.
    pub fn set_role_fallbacks(&self, role: &str, ranked_model_ids: &[i64]) -> Result<()> {
        self.store.set_role_fallbacks(role, ranked_model_ids)?;
        self.invalidate();
        Ok(())
    }

    /// Write-through success/failure accounting for `(role, model)`.
    pub fn record_role_outcome(&self, role: &str, model_id: i64, success: bool) -> Result<()> {
        self.store.record_role_outcome(role, model_id, success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_model_lookup_is_cached() {
        let registry = registry();
        let id = registry
            .upsert_model(&Model::new("m1", "http://x"))
            .unwrap();

        let first = registry.model_by_id(id).unwrap();
        // Write behind the registry's back; the cache still serves the
        // old row until invalidated.
        registry
            .store()
            .set_model_category_score(id, "writer", 9.9)
            .unwrap();
        let cached = registry.model_by_id(id).unwrap();
        assert_eq!(cached.writer_score, first.writer_score);

        registry.invalidate();
        let fresh = registry.model_by_id(id).unwrap();
        assert_eq!(fresh.writer_score, 9.9);
    }

    #[test]
    fn test_upsert_invalidates() {
        let registry = registry();
        let mut model = Model::new("m1", "http://x");
        let id = registry.upsert_model(&model).unwrap();
        registry.model_by_id(id).unwrap();

        model.no_tools = true;
        registry.upsert_model(&model).unwrap();
        assert!(registry.model_by_id(id).unwrap().no_tools);
    }

    #[test]
    fn test_role_resolution_and_cache() {
        let registry = registry();
        registry.upsert_agent(&Agent::new("W1", "writer")).unwrap();
        assert_eq!(registry.active_agent_for_role("writer").unwrap().name, "W1");

        // A newly-upserted agent with lower activity does not displace
        // the resolution; a new role lookup after invalidation does.
        let mut w0 = Agent::new("A-first", "writer");
        w0.is_active = false;
        registry.upsert_agent(&w0).unwrap();
        assert_eq!(registry.active_agent_for_role("writer").unwrap().name, "W1");
    }

    #[test]
    fn test_fallback_models_cached_in_rank_order() {
        let registry = registry();
        let m1 = registry.upsert_model(&Model::new("m1", "http://x")).unwrap();
        let m2 = registry.upsert_model(&Model::new("m2", "http://x")).unwrap();
        registry.set_role_fallbacks("writer", &[m2, m1]).unwrap();

        let ranked = registry.fallback_models("writer").unwrap();
        assert_eq!(ranked[0].name, "m2");
        assert_eq!(ranked[1].name, "m1");
        // Second read comes from cache.
        let ranked = registry.fallback_models("writer").unwrap();
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_missing_role_surfaces_not_found() {
        let registry = registry();
        assert!(registry.active_agent_for_role("response_checker").is_err());
    }
}
