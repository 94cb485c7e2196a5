//! RollbackEngine (C2): snapshot/change-log capture and reconciliation
//! (spec §4.2).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::canonical::canonical_json;
use crate::error::{OrchestratorError, Result};
use crate::kg::{Entity, KnowledgeGraph, ListOptions, Relationship};

const SNAPSHOT_PAGE_SIZE: usize = 1000;
const MAX_ROLLBACK_POINTS: usize = 50;
const MAX_CHECKPOINT_HISTORY: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity_id: String,
    pub action: ChangeAction,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub relationship_id: String,
    pub action: ChangeAction,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
}

/// A rollback point is either a full graph snapshot or a change log. A
/// dynamically-typed engine detects this at rollback time by sniffing
/// whether the first captured element carries an `action` field; this
/// port tracks the same fact as a discriminant fixed at creation, since
/// the two kinds are never mixed within one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackMode {
    Snapshot,
    ChangeLog,
}

#[derive(Debug, Clone)]
pub struct RollbackPoint {
    pub id: String,
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub mode: RollbackMode,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub entity_changes: Vec<EntityChange>,
    pub relationship_changes: Vec<RelationshipChange>,
}

impl RollbackPoint {
    fn snapshot(id: String, operation_id: String, description: String) -> Self {
        Self {
            id,
            operation_id,
            timestamp: Utc::now(),
            description,
            mode: RollbackMode::Snapshot,
            entities: Vec::new(),
            relationships: Vec::new(),
            entity_changes: Vec::new(),
            relationship_changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackItemError {
    #[serde(rename = "type")]
    pub item_type: String,
    pub id: String,
    pub action: String,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub partial_success: bool,
    pub rolled_back_entities: usize,
    pub rolled_back_relationships: usize,
    pub errors: Vec<RollbackItemError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Daily,
    Incident,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpointRecord {
    pub checkpoint_id: String,
    pub reason: CheckpointReason,
    pub hop_count: u32,
    pub attempts: u32,
    pub seed_entity_ids: Vec<String>,
    pub job_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Input to `register_checkpoint_link`; `timestamp` defaults to now if unset.
pub struct CheckpointLinkRequest {
    pub checkpoint_id: String,
    pub reason: CheckpointReason,
    pub hop_count: u32,
    pub attempts: u32,
    pub seed_entity_ids: Vec<String>,
    pub job_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// C2: captures graph state before an operation and reconciles the live
/// graph back to it on failure.
pub struct RollbackEngine {
    store_initialized: std::sync::atomic::AtomicBool,
    points: RwLock<HashMap<String, RollbackPoint>>,
    checkpoint_history: RwLock<HashMap<String, Vec<SessionCheckpointRecord>>>,
}

impl Default for RollbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RollbackEngine {
    pub fn new() -> Self {
        Self {
            store_initialized: std::sync::atomic::AtomicBool::new(true),
            points: RwLock::new(HashMap::new()),
            checkpoint_history: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_store_initialized(&self, initialized: bool) {
        self.store_initialized
            .store(initialized, std::sync::atomic::Ordering::SeqCst);
    }

    /// Pages through the full graph and captures a snapshot rollback
    /// point (spec §4.2 `createRollbackPoint`).
    pub async fn create_rollback_point(
        &self,
        operation_id: &str,
        description: &str,
        kg: &dyn KnowledgeGraph,
    ) -> Result<String> {
        if !self.store_initialized.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(OrchestratorError::StoreNotInitialized);
        }

        let id = format!("rollback_{}_{}", operation_id, Utc::now().timestamp_millis());
        let mut point = RollbackPoint::snapshot(id.clone(), operation_id.to_string(), description.to_string());

        let mut offset = 0;
        loop {
            let page = kg
                .list_entities(ListOptions {
                    limit: Some(SNAPSHOT_PAGE_SIZE),
                    offset: Some(offset),
                })
                .await?;
            let n = page.items.len();
            point.entities.extend(page.items);
            if n < SNAPSHOT_PAGE_SIZE {
                break;
            }
            offset += SNAPSHOT_PAGE_SIZE;
        }

        offset = 0;
        loop {
            let page = kg
                .list_relationships(ListOptions {
                    limit: Some(SNAPSHOT_PAGE_SIZE),
                    offset: Some(offset),
                })
                .await?;
            let n = page.items.len();
            point.relationships.extend(page.items);
            if n < SNAPSHOT_PAGE_SIZE {
                break;
            }
            offset += SNAPSHOT_PAGE_SIZE;
        }

        self.points.write().await.insert(id.clone(), point);
        self.cleanup_old_rollback_points(3_600_000).await;
        Ok(id)
    }

    /// Records a single entity change against a rollback point, converting
    /// an empty snapshot point into change-log mode on first use.
    pub async fn record_entity_change(
        &self,
        rollback_id: &str,
        entity_id: &str,
        action: ChangeAction,
        previous_state: Option<Value>,
        new_state: Option<Value>,
        kg: &dyn KnowledgeGraph,
    ) -> Result<()> {
        let previous_state = if previous_state.is_none()
            && matches!(action, ChangeAction::Update | ChangeAction::Delete)
        {
            kg.get_entity(entity_id).await?.map(|e| e.to_value())
        } else {
            previous_state
        };

        let mut points = self.points.write().await;
        let point = points
            .get_mut(rollback_id)
            .ok_or_else(|| OrchestratorError::RollbackPointNotFound(rollback_id.to_string()))?;
        self.coerce_change_log_mode(point)?;
        point.entity_changes.push(EntityChange {
            entity_id: entity_id.to_string(),
            action,
            previous_state,
            new_state,
        });
        Ok(())
    }

    pub async fn record_relationship_change(
        &self,
        rollback_id: &str,
        relationship_id: &str,
        action: ChangeAction,
        previous_state: Option<Value>,
        new_state: Option<Value>,
    ) -> Result<()> {
        let state = previous_state.as_ref().or(new_state.as_ref());
        if state.is_none() {
            return Err(OrchestratorError::Validation(vec![format!(
                "relationship change for {} requires a non-empty previous or new state",
                relationship_id
            )]));
        }

        let mut points = self.points.write().await;
        let point = points
            .get_mut(rollback_id)
            .ok_or_else(|| OrchestratorError::RollbackPointNotFound(rollback_id.to_string()))?;
        self.coerce_change_log_mode(point)?;
        point.relationship_changes.push(RelationshipChange {
            relationship_id: relationship_id.to_string(),
            action,
            previous_state,
            new_state,
        });
        Ok(())
    }

    fn coerce_change_log_mode(&self, point: &mut RollbackPoint) -> Result<()> {
        match point.mode {
            RollbackMode::ChangeLog => Ok(()),
            RollbackMode::Snapshot if point.entities.is_empty() && point.relationships.is_empty() => {
                point.mode = RollbackMode::ChangeLog;
                Ok(())
            }
            RollbackMode::Snapshot => Err(OrchestratorError::Validation(vec![format!(
                "rollback point {} already holds a snapshot; cannot append change-log entries",
                point.id
            )])),
        }
    }

    /// Reconciles the live graph back to a captured point (spec §4.2
    /// `rollbackToPoint`).
    pub async fn rollback_to_point(
        &self,
        rollback_id: &str,
        kg: &dyn KnowledgeGraph,
    ) -> Result<RollbackResult> {
        let point = {
            let points = self.points.read().await;
            points
                .get(rollback_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::RollbackPointNotFound(rollback_id.to_string()))?
        };

        match point.mode {
            RollbackMode::ChangeLog => self.rollback_change_log(&point, kg).await,
            RollbackMode::Snapshot => self.rollback_snapshot(&point, kg).await,
        }
    }

    async fn rollback_change_log(
        &self,
        point: &RollbackPoint,
        kg: &dyn KnowledgeGraph,
    ) -> Result<RollbackResult> {
        let mut errors = Vec::new();
        let mut rolled_back_entities = 0;
        let mut rolled_back_relationships = 0;

        for change in point.entity_changes.iter().rev() {
            match self.reverse_entity_change(change, kg).await {
                Ok(applied) => {
                    if applied {
                        rolled_back_entities += 1;
                    }
                }
                Err(message) => errors.push(RollbackItemError {
                    item_type: "entity".to_string(),
                    id: change.entity_id.clone(),
                    action: format!("{:?}", change.action).to_lowercase(),
                    message,
                    recoverable: false,
                }),
            }
        }

        for change in point.relationship_changes.iter().rev() {
            match self.reverse_relationship_change(change, kg).await {
                Ok(applied) => {
                    if applied {
                        rolled_back_relationships += 1;
                    }
                }
                Err(message) => errors.push(RollbackItemError {
                    item_type: "relationship".to_string(),
                    id: change.relationship_id.clone(),
                    action: format!("{:?}", change.action).to_lowercase(),
                    message,
                    recoverable: true,
                }),
            }
        }

        let success = errors.is_empty();
        Ok(RollbackResult {
            success,
            partial_success: !success && !errors.is_empty(),
            rolled_back_entities,
            rolled_back_relationships,
            errors,
        })
    }

    /// Entity change reversal table (spec §4.2.a).
    async fn reverse_entity_change(
        &self,
        change: &EntityChange,
        kg: &dyn KnowledgeGraph,
    ) -> std::result::Result<bool, String> {
        match change.action {
            ChangeAction::Create => {
                kg.delete_entity(&change.entity_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(true)
            }
            ChangeAction::Update => match &change.previous_state {
                Some(prev) => {
                    let fields = prev.as_object().cloned().unwrap_or_default();
                    kg.update_entity(&change.entity_id, fields)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(true)
                }
                None => {
                    kg.delete_entity(&change.entity_id)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(true)
                }
            },
            ChangeAction::Delete => match &change.previous_state {
                Some(prev) => {
                    let id_matches = prev
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|id| id == change.entity_id)
                        .unwrap_or(false);
                    if !id_matches {
                        return Err(format!(
                            "previousState.id does not match change entity id {}",
                            change.entity_id
                        ));
                    }
                    let entity_type = prev
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let mut entity = Entity::new(change.entity_id.clone(), entity_type);
                    if let Some(obj) = prev.as_object() {
                        entity.fields = obj.clone();
                    }
                    kg.create_entity(&entity, true)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(true)
                }
                None => Err(format!(
                    "cannot reverse delete of {} without previousState",
                    change.entity_id
                )),
            },
        }
    }

    async fn reverse_relationship_change(
        &self,
        change: &RelationshipChange,
        kg: &dyn KnowledgeGraph,
    ) -> std::result::Result<bool, String> {
        match change.action {
            ChangeAction::Create => {
                if let Err(e) = kg.delete_relationship(&change.relationship_id).await {
                    warn!(relationship = %change.relationship_id, error = %e, "non-fatal relationship reversal error");
                }
                Ok(true)
            }
            ChangeAction::Update => {
                let _ = kg.delete_relationship(&change.relationship_id).await;
                if let Some(prev) = &change.previous_state {
                    self.recreate_relationship(&change.relationship_id, prev, kg).await?;
                }
                Ok(true)
            }
            ChangeAction::Delete => {
                if let Some(prev) = &change.previous_state {
                    self.recreate_relationship(&change.relationship_id, prev, kg).await?;
                    Ok(true)
                } else {
                    Err(format!(
                        "cannot reverse delete of relationship {} without previousState",
                        change.relationship_id
                    ))
                }
            }
        }
    }

    async fn recreate_relationship(
        &self,
        id: &str,
        state: &Value,
        kg: &dyn KnowledgeGraph,
    ) -> std::result::Result<(), String> {
        let obj = state.as_object().cloned().unwrap_or_default();
        let relationship_type = obj
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let from = obj
            .get("fromEntityId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let to = obj
            .get("toEntityId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut relationship = Relationship::new(id.to_string(), relationship_type, from, to);
        relationship.fields = obj;
        kg.create_relationship(&relationship, false)
            .await
            .map_err(|e| e.to_string())
    }

    async fn rollback_snapshot(
        &self,
        point: &RollbackPoint,
        kg: &dyn KnowledgeGraph,
    ) -> Result<RollbackResult> {
        let mut errors = Vec::new();
        let mut rolled_back_entities = 0;

        let snapshot_entities: HashMap<&str, &Entity> =
            point.entities.iter().map(|e| (e.id.as_str(), e)).collect();
        let current_entities = self.collect_all_entities(kg).await?;

        for current in &current_entities {
            if !snapshot_entities.contains_key(current.id.as_str()) {
                if let Err(e) = kg.delete_entity(&current.id).await {
                    errors.push(RollbackItemError {
                        item_type: "entity".to_string(),
                        id: current.id.clone(),
                        action: "delete".to_string(),
                        message: e.to_string(),
                        recoverable: true,
                    });
                } else {
                    rolled_back_entities += 1;
                }
            }
        }

        let current_ids: std::collections::HashSet<&str> =
            current_entities.iter().map(|e| e.id.as_str()).collect();
        for snapshot_entity in &point.entities {
            if !current_ids.contains(snapshot_entity.id.as_str()) {
                if let Err(e) = kg.create_entity(snapshot_entity, true).await {
                    errors.push(RollbackItemError {
                        item_type: "entity".to_string(),
                        id: snapshot_entity.id.clone(),
                        action: "create".to_string(),
                        message: e.to_string(),
                        recoverable: true,
                    });
                } else {
                    rolled_back_entities += 1;
                }
            } else if let Some(current) = current_entities
                .iter()
                .find(|e| e.id == snapshot_entity.id)
            {
                if canonical_json(&current.to_value()) != canonical_json(&snapshot_entity.to_value()) {
                    let mut fields = snapshot_entity.fields.clone();
                    fields.remove("id");
                    fields.remove("type");
                    if let Err(e) = kg.update_entity(&snapshot_entity.id, fields).await {
                        errors.push(RollbackItemError {
                            item_type: "entity".to_string(),
                            id: snapshot_entity.id.clone(),
                            action: "update".to_string(),
                            message: e.to_string(),
                            recoverable: true,
                        });
                    } else {
                        rolled_back_entities += 1;
                    }
                }
            }
        }

        let mut rolled_back_relationships = 0;
        let snapshot_rels: HashMap<String, &Relationship> = point
            .relationships
            .iter()
            .map(|r| (r.composite_key(), r))
            .collect();
        let current_relationships = self.collect_all_relationships(kg).await?;
        let current_rel_keys: std::collections::HashSet<String> = current_relationships
            .iter()
            .map(|r| r.composite_key())
            .collect();

        for current in &current_relationships {
            if !snapshot_rels.contains_key(&current.composite_key()) {
                if let Err(e) = kg.delete_relationship(&current.id).await {
                    errors.push(RollbackItemError {
                        item_type: "relationship".to_string(),
                        id: current.id.clone(),
                        action: "delete".to_string(),
                        message: e.to_string(),
                        recoverable: true,
                    });
                } else {
                    rolled_back_relationships += 1;
                }
            }
        }

        for (key, snapshot_rel) in &snapshot_rels {
            if !current_rel_keys.contains(key) {
                if let Err(e) = kg.create_relationship(snapshot_rel, false).await {
                    errors.push(RollbackItemError {
                        item_type: "relationship".to_string(),
                        id: snapshot_rel.id.clone(),
                        action: "create".to_string(),
                        message: e.to_string(),
                        recoverable: true,
                    });
                } else {
                    rolled_back_relationships += 1;
                }
            }
        }

        let success = errors.is_empty();
        Ok(RollbackResult {
            success,
            partial_success: !success && !errors.is_empty(),
            rolled_back_entities,
            rolled_back_relationships,
            errors,
        })
    }

    async fn collect_all_entities(&self, kg: &dyn KnowledgeGraph) -> Result<Vec<Entity>> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = kg
                .list_entities(ListOptions {
                    limit: Some(SNAPSHOT_PAGE_SIZE),
                    offset: Some(offset),
                })
                .await?;
            let n = page.items.len();
            all.extend(page.items);
            if n < SNAPSHOT_PAGE_SIZE {
                break;
            }
            offset += SNAPSHOT_PAGE_SIZE;
        }
        Ok(all)
    }

    async fn collect_all_relationships(&self, kg: &dyn KnowledgeGraph) -> Result<Vec<Relationship>> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = kg
                .list_relationships(ListOptions {
                    limit: Some(SNAPSHOT_PAGE_SIZE),
                    offset: Some(offset),
                })
                .await?;
            let n = page.items.len();
            all.extend(page.items);
            if n < SNAPSHOT_PAGE_SIZE {
                break;
            }
            offset += SNAPSHOT_PAGE_SIZE;
        }
        Ok(all)
    }

    pub async fn rollback_last_operation(
        &self,
        operation_id: &str,
        kg: &dyn KnowledgeGraph,
    ) -> Result<RollbackResult> {
        let id = {
            let points = self.points.read().await;
            points
                .values()
                .filter(|p| p.operation_id == operation_id)
                .max_by_key(|p| p.timestamp)
                .map(|p| p.id.clone())
                .ok_or_else(|| OrchestratorError::NoRollbackPoint(operation_id.to_string()))?
        };
        self.rollback_to_point(&id, kg).await
    }

    pub async fn validate_rollback_point(
        &self,
        rollback_id: &str,
        kg: &dyn KnowledgeGraph,
    ) -> Result<ValidationResult> {
        let points = self.points.read().await;
        let point = points
            .get(rollback_id)
            .ok_or_else(|| OrchestratorError::RollbackPointNotFound(rollback_id.to_string()))?;

        let mut issues = Vec::new();
        match point.mode {
            RollbackMode::ChangeLog => {
                if point.entity_changes.is_empty() && point.relationship_changes.is_empty() {
                    issues.push("change-log rollback point has no recorded changes".to_string());
                }
                for change in &point.entity_changes {
                    match change.action {
                        ChangeAction::Create => {
                            if kg.get_entity(&change.entity_id).await?.is_none() {
                                issues.push(format!(
                                    "entity {} expected to exist (create change) but is missing",
                                    change.entity_id
                                ));
                            }
                        }
                        ChangeAction::Update | ChangeAction::Delete => {
                            if let Some(current) = kg.get_entity(&change.entity_id).await? {
                                let prev_lm = change
                                    .previous_state
                                    .as_ref()
                                    .and_then(|v| v.get("lastModified"))
                                    .cloned();
                                let cur_lm = current.fields.get("lastModified").cloned();
                                if prev_lm.is_some() && prev_lm != cur_lm {
                                    issues.push(format!(
                                        "entity {} has been modified since the rollback point was captured",
                                        change.entity_id
                                    ));
                                }
                            }
                        }
                    }
                }
            }
            RollbackMode::Snapshot => {
                if point.entities.is_empty() && point.relationships.is_empty() {
                    issues.push("snapshot rollback point captured an empty graph".to_string());
                }
            }
        }

        Ok(ValidationResult {
            valid: issues.is_empty(),
            issues,
        })
    }

    /// Removes points older than `max_age_ms`, then caps the remaining set
    /// to the 50 most recent (spec §4.2 `cleanupOldRollbackPoints`).
    pub async fn cleanup_old_rollback_points(&self, max_age_ms: i64) -> usize {
        let mut points = self.points.write().await;
        let now = Utc::now();
        let before = points.len();

        points.retain(|_, p| (now - p.timestamp).num_milliseconds() <= max_age_ms);

        if points.len() > MAX_ROLLBACK_POINTS {
            let mut ids: Vec<(String, DateTime<Utc>)> =
                points.iter().map(|(id, p)| (id.clone(), p.timestamp)).collect();
            ids.sort_by(|a, b| b.1.cmp(&a.1));
            let keep: std::collections::HashSet<String> =
                ids.into_iter().take(MAX_ROLLBACK_POINTS).map(|(id, _)| id).collect();
            points.retain(|id, _| keep.contains(id));
        }

        before - points.len()
    }

    /// Deletes a rollback point outright (used once an operation finalizes).
    pub async fn delete_rollback_point(&self, rollback_id: &str) {
        self.points.write().await.remove(rollback_id);
    }

    pub async fn register_checkpoint_link(
        &self,
        session_id: &str,
        request: CheckpointLinkRequest,
    ) -> Result<()> {
        if !(1..=10).contains(&request.hop_count) {
            return Err(OrchestratorError::Validation(vec![format!(
                "hopCount must be in [1, 10], got {}",
                request.hop_count
            )]));
        }
        if request.attempts < 1 {
            return Err(OrchestratorError::Validation(vec![
                "attempts must be >= 1".to_string(),
            ]));
        }
        let mut seeds = request.seed_entity_ids;
        seeds.retain(|s| !s.is_empty());
        seeds.sort();
        seeds.dedup();
        if seeds.is_empty() {
            return Err(OrchestratorError::Validation(vec![
                "seedEntityIds must be non-empty after dedup".to_string(),
            ]));
        }

        let record = SessionCheckpointRecord {
            checkpoint_id: request.checkpoint_id,
            reason: request.reason,
            hop_count: request.hop_count,
            attempts: request.attempts,
            seed_entity_ids: seeds,
            job_id: request.job_id,
            recorded_at: request.timestamp.unwrap_or_else(Utc::now),
        };

        let mut history = self.checkpoint_history.write().await;
        let entries = history.entry(session_id.to_string()).or_default();
        entries.push(record);
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        entries.truncate(MAX_CHECKPOINT_HISTORY);
        Ok(())
    }

    pub async fn get_session_checkpoint_history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Vec<SessionCheckpointRecord> {
        let history = self.checkpoint_history.read().await;
        let entries = history.get(session_id).cloned().unwrap_or_default();
        match limit {
            Some(limit) => entries.into_iter().take(limit).collect(),
            None => entries,
        }
    }

    pub async fn get_latest_session_checkpoint(
        &self,
        session_id: &str,
    ) -> Option<SessionCheckpointRecord> {
        self.checkpoint_history
            .read()
            .await
            .get(session_id)
            .and_then(|entries| entries.first().cloned())
    }

    /// Prunes session checkpoint history entries older than `retention_days`.
    pub async fn prune_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days < 1 {
            return Err(OrchestratorError::Validation(vec![
                "retentionDays must be >= 1".to_string(),
            ]));
        }
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut history = self.checkpoint_history.write().await;
        let mut removed = 0;
        for entries in history.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.recorded_at >= cutoff);
            removed += before - entries.len();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kg::tests_support::FakeKnowledgeGraph;
    use serde_json::json;

    fn entity(id: &str, hash: &str) -> Entity {
        let mut e = Entity::new(id, "symbol");
        e.fields.insert("hash".into(), json!(hash));
        e
    }

    #[tokio::test]
    async fn test_create_rollback_point_requires_store_initialized() {
        let kg = FakeKnowledgeGraph::new();
        let engine = RollbackEngine::new();
        engine.set_store_initialized(false);
        let err = engine
            .create_rollback_point("op1", "before sync", &kg)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StoreNotInitialized));
    }

    #[tokio::test]
    async fn test_round_trip_no_mutation_yields_zero_rolled_back() {
        let kg = FakeKnowledgeGraph::new();
        kg.seed_entity(entity("e1", "h0")).await;
        let engine = RollbackEngine::new();
        let id = engine
            .create_rollback_point("op1", "before sync", &kg)
            .await
            .unwrap();

        let result = engine.rollback_to_point(&id, &kg).await.unwrap();
        assert!(result.success);
        assert_eq!(result.rolled_back_entities, 0);
        assert_eq!(result.rolled_back_relationships, 0);
    }

    #[tokio::test]
    async fn test_snapshot_rollback_deletes_entities_created_after_snapshot() {
        let kg = FakeKnowledgeGraph::new();
        kg.seed_entity(entity("e1", "h0")).await;
        let engine = RollbackEngine::new();
        let id = engine
            .create_rollback_point("op1", "before sync", &kg)
            .await
            .unwrap();

        kg.create_entity(&entity("e2", "h1"), true).await.unwrap();

        let result = engine.rollback_to_point(&id, &kg).await.unwrap();
        assert!(result.success);
        assert_eq!(result.rolled_back_entities, 1);
        assert!(kg.get_entity("e2").await.unwrap().is_none());
        assert!(kg.get_entity("e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_change_log_reverses_create_by_deleting() {
        let kg = FakeKnowledgeGraph::new();
        let engine = RollbackEngine::new();
        let id = engine
            .create_rollback_point("op1", "before sync", &kg)
            .await
            .unwrap();

        kg.create_entity(&entity("e2", "h1"), true).await.unwrap();
        engine
            .record_entity_change(&id, "e2", ChangeAction::Create, None, None, &kg)
            .await
            .unwrap();

        let result = engine.rollback_to_point(&id, &kg).await.unwrap();
        assert!(result.success);
        assert!(kg.get_entity("e2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_without_previous_state_is_hard_error() {
        let kg = FakeKnowledgeGraph::new();
        let engine = RollbackEngine::new();
        let id = engine
            .create_rollback_point("op1", "before sync", &kg)
            .await
            .unwrap();

        engine
            .record_entity_change(&id, "ghost", ChangeAction::Delete, None, None, &kg)
            .await
            .unwrap();

        let result = engine.rollback_to_point(&id, &kg).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(!result.errors[0].recoverable);
    }

    #[tokio::test]
    async fn test_cleanup_old_rollback_points_removes_stale_and_caps_count() {
        let kg = FakeKnowledgeGraph::new();
        let engine = RollbackEngine::new();
        for i in 0..3 {
            engine
                .create_rollback_point(&format!("op{i}"), "d", &kg)
                .await
                .unwrap();
        }
        let removed = engine.cleanup_old_rollback_points(3_600_000).await;
        assert_eq!(removed, 0);
        assert_eq!(engine.points.read().await.len(), 3);
    }

    #[tokio::test]
    async fn test_register_checkpoint_link_validates_hop_count() {
        let engine = RollbackEngine::new();
        let err = engine
            .register_checkpoint_link(
                "s1",
                CheckpointLinkRequest {
                    checkpoint_id: "c1".to_string(),
                    reason: CheckpointReason::Manual,
                    hop_count: 11,
                    attempts: 1,
                    seed_entity_ids: vec!["e1".to_string()],
                    job_id: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_history_trimmed_and_latest_first() {
        let engine = RollbackEngine::new();
        for i in 0..30 {
            engine
                .register_checkpoint_link(
                    "s1",
                    CheckpointLinkRequest {
                        checkpoint_id: format!("c{i}"),
                        reason: CheckpointReason::Manual,
                        hop_count: 2,
                        attempts: 1,
                        seed_entity_ids: vec!["e1".to_string()],
                        job_id: None,
                        timestamp: Some(Utc::now() + chrono::Duration::seconds(i)),
                    },
                )
                .await
                .unwrap();
        }
        let history = engine.get_session_checkpoint_history("s1", None).await;
        assert_eq!(history.len(), 25);
        assert_eq!(history[0].checkpoint_id, "c29");
        let latest = engine.get_latest_session_checkpoint("s1").await.unwrap();
        assert_eq!(latest.checkpoint_id, "c29");
    }

    #[tokio::test]
    async fn test_prune_history_rejects_zero_retention_days() {
        let engine = RollbackEngine::new();
        let err = engine.prune_history(0).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }
}
