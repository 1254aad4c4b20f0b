use std::collections::HashMap;
use std::sync::Arc;

use atrium_core::error::CoreError;
use dashmap::DashMap;

use crate::stage::StageHandle;
use crate::traits::StageFactory;

/// Per-process map of live stages.
///
/// `get_or_create` is the only way a stage shell comes into being: the
/// dashmap entry guarantees exactly one creator wins a race. The shell is
/// published before any `on_create` runs; whether a caller may use it is
/// settled by the stage worker through the created flag.
pub(crate) struct StageDirectory {
    stages: DashMap<i64, Arc<StageHandle>>,
}

impl StageDirectory {
    pub(crate) fn new() -> Self {
        Self {
            stages: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, stage_id: i64) -> Option<Arc<StageHandle>> {
        self.stages.get(&stage_id).map(|entry| entry.clone())
    }

    /// Fetch the stage, creating its shell from the factory for
    /// `stage_type` if absent. Unknown types are rejected before anything
    /// is inserted.
    pub(crate) fn get_or_create(
        &self,
        stage_id: i64,
        stage_type: &str,
        factories: &HashMap<String, Arc<StageFactory>>,
    ) -> Result<Arc<StageHandle>, CoreError> {
        if let Some(existing) = self.stages.get(&stage_id) {
            return Ok(existing.clone());
        }
        let factory = factories
            .get(stage_type)
            .cloned()
            .ok_or_else(|| CoreError::UnknownStageType(stage_type.to_string()))?;
        let entry = self
            .stages
            .entry(stage_id)
            .or_insert_with(|| StageHandle::new(stage_id, factory));
        Ok(entry.clone())
    }

    pub(crate) fn remove(&self, stage_id: i64) {
        self.stages.remove(&stage_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.stages.len()
    }

    pub(crate) fn contains(&self, stage_id: i64) -> bool {
        self.stages.contains_key(&stage_id)
    }

    pub(crate) fn ids(&self) -> Vec<i64> {
        self.stages.iter().map(|entry| *entry.key()).collect()
    }
}
