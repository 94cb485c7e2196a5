//! ConflictResolver (C1): content-addressed conflict detection and
//! resolution (spec §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::canonical::{
    canonical_json, diff, entity_ignore_fields, prepare, relationship_ignore_fields,
    sorted_diff_entries_string,
};
use crate::kg::{Entity, KnowledgeGraph, Relationship};

/// Kind of divergence a [`Conflict`] represents (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    EntityVersion,
    EntityDeletion,
    RelationshipConflict,
    ConcurrentModification,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::EntityVersion => "entity_version",
            ConflictType::EntityDeletion => "entity_deletion",
            ConflictType::RelationshipConflict => "relationship_conflict",
            ConflictType::ConcurrentModification => "concurrent_modification",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictingValues {
    pub current: Value,
    pub incoming: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub entity_id: Option<String>,
    pub relationship_id: Option<String>,
    pub description: String,
    pub conflicting_values: ConflictingValues,
    /// dotted-path -> {current, incoming}
    pub diff: HashMap<String, ConflictingValues>,
    pub signature: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub resolution_strategy: Option<String>,
}

/// Suppresses re-reporting of an exact diff shape once resolved manually.
#[derive(Debug, Clone)]
pub struct ManualOverrideRecord {
    pub signature: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// A resolution decision for a conflict: either a strategy tag known to
/// [`apply_resolution`] (`overwrite`, `merge`, `skip`, `manual`) or any
/// other string, which is a fatal error (spec §4.1.c).
#[derive(Debug, Clone)]
pub struct Resolution {
    pub strategy: String,
    pub resolved_value: Option<Value>,
}

/// A pluggable automatic-resolution strategy (spec §4.1 `resolveConflictsAuto`).
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn can_handle(&self, conflict: &Conflict) -> bool;
    /// Produces a resolution for the conflict. Errors are caught by the
    /// caller and the next-lower-priority strategy is tried.
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, String>;
}

/// `last_write_wins` (priority 100, handles all).
pub struct LastWriteWins;

impl MergeStrategy for LastWriteWins {
    fn name(&self) -> &str {
        "last_write_wins"
    }
    fn priority(&self) -> i32 {
        100
    }
    fn can_handle(&self, _conflict: &Conflict) -> bool {
        true
    }
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, String> {
        Ok(Resolution {
            strategy: "overwrite".to_string(),
            resolved_value: Some(conflict.conflicting_values.incoming.clone()),
        })
    }
}

/// `property_merge` (priority 50, `entity_version` only).
pub struct PropertyMerge;

impl MergeStrategy for PropertyMerge {
    fn name(&self) -> &str {
        "property_merge"
    }
    fn priority(&self) -> i32 {
        50
    }
    fn can_handle(&self, conflict: &Conflict) -> bool {
        conflict.conflict_type == ConflictType::EntityVersion
    }
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, String> {
        let current = conflict
            .conflicting_values
            .current
            .as_object()
            .cloned()
            .ok_or_else(|| "current value is not an object".to_string())?;
        let incoming = conflict
            .conflicting_values
            .incoming
            .as_object()
            .cloned()
            .ok_or_else(|| "incoming value is not an object".to_string())?;

        let mut merged = current.clone();
        for (k, v) in &incoming {
            merged.insert(k.clone(), v.clone());
        }

        if let (Some(Value::Object(ch)), Some(Value::Object(ih))) =
            (current.get("hash"), incoming.get("hash"))
        {
            let mut h = ch.clone();
            for (k, v) in ih {
                h.insert(k.clone(), v.clone());
            }
            merged.insert("hash".to_string(), Value::Object(h));
        }
        if let (Some(Value::Object(cm)), Some(Value::Object(im))) =
            (current.get("metadata"), incoming.get("metadata"))
        {
            let mut m = cm.clone();
            for (k, v) in im {
                m.insert(k.clone(), v.clone());
            }
            merged.insert("metadata".to_string(), Value::Object(m));
        }

        let last_modified = max_last_modified(current.get("lastModified"), incoming.get("lastModified"));
        if let Some(lm) = last_modified {
            merged.insert("lastModified".to_string(), lm);
        }

        Ok(Resolution {
            strategy: "merge".to_string(),
            resolved_value: Some(Value::Object(merged)),
        })
    }
}

fn max_last_modified(current: Option<&Value>, incoming: Option<&Value>) -> Option<Value> {
    match (current.and_then(|v| v.as_str()), incoming.and_then(|v| v.as_str())) {
        (Some(c), Some(i)) => Some(Value::String(if i >= c { i.to_string() } else { c.to_string() })),
        (Some(c), None) => Some(Value::String(c.to_string())),
        (None, Some(i)) => Some(Value::String(i.to_string())),
        (None, None) => None,
    }
}

/// `skip_deletions` (priority 25, `entity_deletion` only).
pub struct SkipDeletions;

impl MergeStrategy for SkipDeletions {
    fn name(&self) -> &str {
        "skip_deletions"
    }
    fn priority(&self) -> i32 {
        25
    }
    fn can_handle(&self, conflict: &Conflict) -> bool {
        conflict.conflict_type == ConflictType::EntityDeletion
    }
    fn resolve(&self, _conflict: &Conflict) -> Result<Resolution, String> {
        Ok(Resolution {
            strategy: "skip".to_string(),
            resolved_value: None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictStatistics {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub by_type: HashMap<&'static str, usize>,
}

type ConflictListener = Arc<dyn Fn(&Conflict) + Send + Sync>;

/// C1: detects divergences between incoming and stored entities/
/// relationships, applies pluggable merge strategies, and remembers
/// manual overrides by content signature.
pub struct ConflictResolver {
    conflicts: RwLock<HashMap<String, Conflict>>,
    overrides: RwLock<HashMap<String, ManualOverrideRecord>>,
    strategies: RwLock<Vec<Arc<dyn MergeStrategy>>>,
    listeners: RwLock<HashMap<u64, ConflictListener>>,
    next_listener_id: std::sync::atomic::AtomicU64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        let resolver = Self {
            conflicts: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            strategies: RwLock::new(Vec::new()),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: std::sync::atomic::AtomicU64::new(1),
        };
        resolver
    }

    /// A resolver pre-populated with the three default strategies, in the
    /// order a fresh `SyncCoordinator` would register them.
    pub fn with_default_strategies() -> Self {
        let resolver = Self::new();
        resolver.add_merge_strategy_sync(Arc::new(LastWriteWins));
        resolver.add_merge_strategy_sync(Arc::new(PropertyMerge));
        resolver.add_merge_strategy_sync(Arc::new(SkipDeletions));
        resolver
    }

    fn add_merge_strategy_sync(&self, strategy: Arc<dyn MergeStrategy>) {
        // Construction-time only; safe to block on an uncontended lock.
        let mut strategies = self.strategies.blocking_write();
        strategies.push(strategy);
        strategies.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub async fn add_merge_strategy(&self, strategy: Arc<dyn MergeStrategy>) {
        let mut strategies = self.strategies.write().await;
        strategies.push(strategy);
        strategies.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub async fn add_conflict_listener(&self, listener: ConflictListener) -> u64 {
        let id = self
            .next_listener_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn remove_conflict_listener(&self, id: u64) {
        self.listeners.write().await.remove(&id);
    }

    async fn notify_listeners(&self, conflict: &Conflict) {
        for listener in self.listeners.read().await.values() {
            listener(conflict);
        }
    }

    fn signature(conflict_type: ConflictType, target_id: &str, entries: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}|{}", conflict_type.as_str(), target_id, entries));
        format!("{:x}", hasher.finalize())
    }

    fn conflict_id(conflict_type: ConflictType, target_id: &str, signature: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(format!("{}|{}|{}", conflict_type.as_str(), target_id, signature));
        format!("conflict_{}_{:x}", conflict_type.as_str(), hasher.finalize())
    }

    /// Detects divergences for a batch of incoming entities/relationships
    /// against the stored versions (spec §4.1 `detectConflicts`).
    pub async fn detect_conflicts(
        &self,
        incoming_entities: &[Entity],
        incoming_relationships: &[Relationship],
        kg: &dyn KnowledgeGraph,
    ) -> crate::error::Result<Vec<Conflict>> {
        if incoming_entities.is_empty() && incoming_relationships.is_empty() {
            return Ok(Vec::new());
        }

        let mut detected = Vec::new();
        let ignore_entity = entity_ignore_fields();
        let ignore_rel = relationship_ignore_fields();

        for incoming in incoming_entities {
            let Some(current) = kg.get_entity(&incoming.id).await? else {
                continue;
            };
            if let Some(conflict) = self
                .detect_one(
                    ConflictType::EntityVersion,
                    &incoming.id,
                    Some(incoming.id.clone()),
                    None,
                    &current.to_value(),
                    &incoming.to_value(),
                    &ignore_entity,
                )
                .await
            {
                self.notify_listeners(&conflict).await;
                detected.push(conflict);
            }
        }

        for incoming in incoming_relationships {
            let Some(current) = kg.get_relationship_by_id(&incoming.id).await? else {
                continue;
            };
            if let Some(conflict) = self
                .detect_one(
                    ConflictType::RelationshipConflict,
                    &incoming.id,
                    None,
                    Some(incoming.id.clone()),
                    &current.to_value(),
                    &incoming.to_value(),
                    &ignore_rel,
                )
                .await
            {
                self.notify_listeners(&conflict).await;
                detected.push(conflict);
            }
        }

        Ok(detected)
    }

    #[allow(clippy::too_many_arguments)]
    async fn detect_one(
        &self,
        conflict_type: ConflictType,
        target_id: &str,
        entity_id: Option<String>,
        relationship_id: Option<String>,
        current_raw: &Value,
        incoming_raw: &Value,
        ignore: &std::collections::HashSet<&str>,
    ) -> Option<Conflict> {
        let prepared_current = prepare(current_raw, ignore);
        let prepared_incoming = prepare(incoming_raw, ignore);
        let entries = diff(&prepared_current, &prepared_incoming);
        if entries.is_empty() {
            return None;
        }

        let sorted = sorted_diff_entries_string(&entries);
        let signature = Self::signature(conflict_type, target_id, &sorted);

        if self.overrides.read().await.contains_key(&signature) {
            return None;
        }

        let id = Self::conflict_id(conflict_type, target_id, &signature);
        let mut diff_map = HashMap::new();
        for entry in &entries {
            diff_map.insert(
                entry.path.clone(),
                ConflictingValues {
                    current: entry.current.clone(),
                    incoming: entry.incoming.clone(),
                },
            );
        }

        let mut conflicts = self.conflicts.write().await;
        let conflict = conflicts
            .entry(id.clone())
            .and_modify(|existing| {
                existing.timestamp = chrono::Utc::now();
                existing.conflicting_values.incoming = incoming_raw.clone();
                existing.diff = diff_map.clone();
                existing.signature = signature.clone();
            })
            .or_insert_with(|| Conflict {
                id: id.clone(),
                conflict_type,
                entity_id,
                relationship_id,
                description: format!("{} diverges from stored version", target_id),
                conflicting_values: ConflictingValues {
                    current: current_raw.clone(),
                    incoming: incoming_raw.clone(),
                },
                diff: diff_map,
                signature,
                timestamp: chrono::Utc::now(),
                resolved: false,
                resolution: None,
                resolution_strategy: None,
            });
        Some(conflict.clone())
    }

    /// Applies a single resolution to a conflict (spec §4.1 `resolveConflict`).
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: Resolution,
        kg: &dyn KnowledgeGraph,
    ) -> crate::error::Result<bool> {
        let conflict = {
            let conflicts = self.conflicts.read().await;
            match conflicts.get(id) {
                Some(c) if !c.resolved => c.clone(),
                _ => return Ok(false),
            }
        };

        let applied = self.apply_resolution(&conflict, &resolution, kg).await?;
        if applied {
            let mut conflicts = self.conflicts.write().await;
            if let Some(c) = conflicts.get_mut(id) {
                c.resolved = true;
                c.resolution_strategy = Some(resolution.strategy.clone());
                c.resolution = resolution
                    .resolved_value
                    .as_ref()
                    .map(canonical_json);
            }
        }
        Ok(applied)
    }

    /// Runs registered strategies, highest priority first, applying the
    /// first one whose `can_handle` matches (spec §4.1 `resolveConflictsAuto`).
    pub async fn resolve_conflicts_auto(
        &self,
        conflicts: &[Conflict],
        kg: &dyn KnowledgeGraph,
    ) -> crate::error::Result<Vec<bool>> {
        let strategies = self.strategies.read().await.clone();
        let mut outcomes = Vec::with_capacity(conflicts.len());

        for conflict in conflicts {
            let mut resolved_any = false;
            for strategy in strategies.iter().filter(|s| s.can_handle(conflict)) {
                match strategy.resolve(conflict) {
                    Ok(resolution) => {
                        match self.resolve_conflict(&conflict.id, resolution, kg).await {
                            Ok(true) => {
                                resolved_any = true;
                                break;
                            }
                            Ok(false) => continue,
                            Err(e) => {
                                warn!(strategy = strategy.name(), error = %e, "merge strategy apply failed");
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(strategy = strategy.name(), error = %e, "merge strategy produced no resolution");
                        continue;
                    }
                }
            }
            outcomes.push(resolved_any);
        }
        Ok(outcomes)
    }

    /// Applies a resolution's mutation to the graph (spec §4.1.c).
    async fn apply_resolution(
        &self,
        conflict: &Conflict,
        resolution: &Resolution,
        kg: &dyn KnowledgeGraph,
    ) -> crate::error::Result<bool> {
        match resolution.strategy.as_str() {
            "overwrite" | "merge" => {
                let payload = resolution
                    .resolved_value
                    .clone()
                    .unwrap_or_else(|| conflict.conflicting_values.incoming.clone());
                if payload.is_null() {
                    return Err(crate::error::OrchestratorError::NoResolvedValue(
                        conflict.id.clone(),
                    ));
                }
                self.write_payload(conflict, payload, kg).await
            }
            "skip" => Ok(true),
            "manual" => {
                if let Some(payload) = resolution.resolved_value.clone() {
                    let ok = self.write_payload(conflict, payload, kg).await?;
                    if ok {
                        self.record_override(&conflict.signature).await;
                    }
                    Ok(ok)
                } else {
                    self.record_override(&conflict.signature).await;
                    Ok(true)
                }
            }
            other => Err(crate::error::OrchestratorError::InvalidResolutionStrategy(
                other.to_string(),
            )),
        }
    }

    async fn write_payload(
        &self,
        conflict: &Conflict,
        payload: Value,
        kg: &dyn KnowledgeGraph,
    ) -> crate::error::Result<bool> {
        let result = if conflict.entity_id.is_some() {
            let fields = payload.as_object().cloned().unwrap_or_default();
            let id = conflict.entity_id.clone().unwrap();
            kg.update_entity(&id, fields).await
        } else if let Some(rel_id) = &conflict.relationship_id {
            let obj = payload.as_object().cloned().unwrap_or_default();
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
            let mut relationship = Relationship::new(rel_id.clone(), relationship_type, from, to);
            relationship.fields = obj;
            let canonical = kg.canonicalize_relationship(relationship).await?;
            kg.upsert_relationship(&canonical).await
        } else {
            return Ok(false);
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(conflict = %conflict.id, error = %e, "resolution apply failed");
                Ok(false)
            }
        }
    }

    async fn record_override(&self, signature: &str) {
        self.overrides.write().await.insert(
            signature.to_string(),
            ManualOverrideRecord {
                signature: signature.to_string(),
                recorded_at: chrono::Utc::now(),
            },
        );
    }

    pub async fn get_conflicts_for_entity(&self, entity_id: &str) -> Vec<Conflict> {
        self.conflicts
            .read()
            .await
            .values()
            .filter(|c| c.entity_id.as_deref() == Some(entity_id))
            .cloned()
            .collect()
    }

    pub async fn clear_resolved_conflicts(&self) -> usize {
        let mut conflicts = self.conflicts.write().await;
        let before = conflicts.len();
        conflicts.retain(|_, c| !c.resolved);
        before - conflicts.len()
    }

    pub async fn statistics(&self) -> ConflictStatistics {
        let conflicts = self.conflicts.read().await;
        let mut stats = ConflictStatistics {
            total: conflicts.len(),
            ..Default::default()
        };
        for c in conflicts.values() {
            if c.resolved {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            *stats.by_type.entry(c.conflict_type.as_str()).or_insert(0) += 1;
        }
        stats
    }

    pub async fn conflicts_snapshot(&self) -> Vec<Conflict> {
        self.conflicts.read().await.values().cloned().collect()
    }

    pub(crate) fn log_conflicts(conflicts: &[Conflict], unresolved: usize) {
        if unresolved > 0 {
            warn!(unresolved, total = conflicts.len(), "conflicts remain unresolved");
        } else if !conflicts.is_empty() {
            info!(total = conflicts.len(), "all conflicts auto-resolved");
        }
    }
}
