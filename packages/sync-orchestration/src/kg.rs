//! The knowledge-graph interface consumed by this core (spec §6).
//!
//! Everything in this module is a trait boundary. The AST parser, the
//! embedding service, and the graph's actual persistence layer are external
//! collaborators — this crate never implements [`KnowledgeGraph`], only
//! calls it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A graph entity. The core treats entities as opaque tagged records; it
/// only interprets `id` and `entity_type`, everything else is carried in
/// `fields` for diffing/storage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            fields: Map::new(),
        }
    }

    /// Renders the whole entity (id, type, fields) as a single JSON value,
    /// for canonicalization/diffing.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("type".to_string(), Value::String(self.entity_type.clone()));
        Value::Object(map)
    }
}

/// A graph relationship (edge).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub from_entity_id: String,
    pub to_entity_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Relationship {
    pub fn new(
        id: impl Into<String>,
        relationship_type: impl Into<String>,
        from_entity_id: impl Into<String>,
        to_entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            relationship_type: relationship_type.into(),
            from_entity_id: from_entity_id.into(),
            to_entity_id: to_entity_id.into(),
            fields: Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert(
            "type".to_string(),
            Value::String(self.relationship_type.clone()),
        );
        map.insert(
            "fromEntityId".to_string(),
            Value::String(self.from_entity_id.clone()),
        );
        map.insert(
            "toEntityId".to_string(),
            Value::String(self.to_entity_id.clone()),
        );
        Value::Object(map)
    }

    /// Composite key used to reconcile relationships during rollback
    /// (spec §4.2 "reconcile relationships by composite key").
    pub fn composite_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.from_entity_id, self.to_entity_id, self.relationship_type
        )
    }
}

/// Outcome of a bulk create: partial-failure-tolerant (spec §6).
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// A page of listed records.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Status communicated on `annotateSessionRelationshipsWithCheckpoint`
/// (spec §4.3.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointAnnotationStatus {
    Queued,
    Completed,
    ManualIntervention,
}

#[derive(Debug, Clone)]
pub struct CheckpointAnnotation {
    pub status: CheckpointAnnotationStatus,
    pub reason: Option<String>,
    pub hop_count: Option<u32>,
    pub seed_entity_ids: Vec<String>,
    pub job_id: Option<String>,
    pub error: Option<String>,
    pub triggered_by: String,
}

/// One resolved (or ambiguous) symbol match, used by the relationship
/// resolution ladder (spec §4.3.9).
#[derive(Debug, Clone)]
pub struct SymbolMatch {
    pub entity_id: String,
}

/// The knowledge-graph interface this core consumes (spec §6). All methods
/// are async; implementations are expected to be safe for concurrent reads
/// and idempotent writes (spec §5).
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;
    async fn update_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()>;
    async fn create_entity(&self, entity: &Entity, skip_embedding: bool) -> Result<()>;
    async fn create_or_update_entity(&self, entity: &Entity) -> Result<()>;
    async fn delete_entity(&self, id: &str) -> Result<()>;
    async fn get_entities_by_file(&self, path: &str) -> Result<Vec<Entity>>;

    /// Bulk create. Implementations are expected to tolerate and report
    /// per-entity failure rather than aborting the whole batch; the
    /// coordinator falls back to per-entity `create_entity` calls only
    /// when this call itself returns `Err` (a structural failure).
    async fn create_entities_bulk(
        &self,
        entities: &[Entity],
        skip_embedding: bool,
    ) -> Result<BulkOutcome>;

    async fn get_relationship_by_id(&self, id: &str) -> Result<Option<Relationship>>;
    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()>;

    /// Normalizes a relationship's shape before storage. Idempotent:
    /// `canonicalize_relationship(canonicalize_relationship(r)) ==
    /// canonicalize_relationship(r)` (spec §8 round-trip law).
    async fn canonicalize_relationship(&self, relationship: Relationship) -> Result<Relationship>;

    async fn create_relationship(&self, relationship: &Relationship, validate: bool)
        -> Result<()>;
    async fn delete_relationship(&self, id: &str) -> Result<()>;
    async fn create_relationships_bulk(
        &self,
        relationships: &[Relationship],
        validate: bool,
    ) -> Result<BulkOutcome>;
    async fn upsert_edge_evidence_bulk(&self, relationships: &[Relationship]) -> Result<()>;

    async fn open_edge(
        &self,
        from: &str,
        to: &str,
        edge_type: &str,
        at: DateTime<Utc>,
        change_id: &str,
    ) -> Result<()>;
    async fn close_edge(
        &self,
        from: &str,
        to: &str,
        edge_type: &str,
        at: DateTime<Utc>,
        change_id: &str,
    ) -> Result<()>;

    async fn finalize_scan(&self, scan_start: DateTime<Utc>) -> Result<()>;
    async fn append_version(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
        change_set_id: &str,
    ) -> Result<()>;

    async fn annotate_session_relationships_with_checkpoint(
        &self,
        session_id: &str,
        annotation: CheckpointAnnotation,
    ) -> Result<()>;

    async fn list_entities(&self, opts: ListOptions) -> Result<Page<Entity>>;
    async fn list_relationships(&self, opts: ListOptions) -> Result<Page<Relationship>>;

    async fn find_symbol_in_file(&self, file: &str, name: &str) -> Result<Option<SymbolMatch>>;
    async fn find_nearby_symbols(
        &self,
        file: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<SymbolMatch>>;
    async fn find_symbols_by_name(&self, name: &str) -> Result<Vec<SymbolMatch>>;
    async fn find_symbol_by_kind_and_name(
        &self,
        kind: &str,
        name: &str,
    ) -> Result<Vec<SymbolMatch>>;

    /// Capability-detected: returns `false` if the implementation doesn't
    /// support batch embedding. The coordinator checks this before relying
    /// on it (spec §4.3.5 step 5).
    fn supports_embeddings_batch(&self) -> bool {
        false
    }

    async fn create_embeddings_batch(&self, _entity_ids: &[String]) -> Result<()> {
        Ok(())
    }
}

/// A minimal in-memory [`KnowledgeGraph`] used by this crate's own unit and
/// integration tests. Not part of the public API.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct FakeKnowledgeGraph {
        entities: RwLock<HashMap<String, Entity>>,
        relationships: RwLock<HashMap<String, Relationship>>,
        get_entity_calls: AtomicUsize,
    }

    impl FakeKnowledgeGraph {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed_entity(&self, entity: Entity) {
            self.entities.write().await.insert(entity.id.clone(), entity);
        }

        pub async fn seed_relationship(&self, relationship: Relationship) {
            self.relationships
                .write()
                .await
                .insert(relationship.id.clone(), relationship);
        }

        pub fn get_entity_calls(&self) -> usize {
            self.get_entity_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KnowledgeGraph for FakeKnowledgeGraph {
        async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
            self.get_entity_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entities.read().await.get(id).cloned())
        }

        async fn update_entity(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
            let mut entities = self.entities.write().await;
            if let Some(existing) = entities.get_mut(id) {
                for (k, v) in fields {
                    if k == "id" || k == "type" {
                        continue;
                    }
                    existing.fields.insert(k, v);
                }
            }
            Ok(())
        }

        async fn create_entity(&self, entity: &Entity, _skip_embedding: bool) -> Result<()> {
            self.entities
                .write()
                .await
                .insert(entity.id.clone(), entity.clone());
            Ok(())
        }

        async fn create_or_update_entity(&self, entity: &Entity) -> Result<()> {
            self.entities
                .write()
                .await
                .insert(entity.id.clone(), entity.clone());
            Ok(())
        }

        async fn delete_entity(&self, id: &str) -> Result<()> {
            self.entities.write().await.remove(id);
            Ok(())
        }

        async fn get_entities_by_file(&self, path: &str) -> Result<Vec<Entity>> {
            Ok(self
                .entities
                .read()
                .await
                .values()
                .filter(|e| e.fields.get("file").and_then(|v| v.as_str()) == Some(path))
                .cloned()
                .collect())
        }

        async fn create_entities_bulk(
            &self,
            entities: &[Entity],
            skip_embedding: bool,
        ) -> Result<BulkOutcome> {
            let mut outcome = BulkOutcome::default();
            for entity in entities {
                self.create_entity(entity, skip_embedding).await?;
                outcome.succeeded.push(entity.id.clone());
            }
            Ok(outcome)
        }

        async fn get_relationship_by_id(&self, id: &str) -> Result<Option<Relationship>> {
            Ok(self.relationships.read().await.get(id).cloned())
        }

        async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
            self.relationships
                .write()
                .await
                .insert(relationship.id.clone(), relationship.clone());
            Ok(())
        }

        async fn canonicalize_relationship(
            &self,
            relationship: Relationship,
        ) -> Result<Relationship> {
            Ok(relationship)
        }

        async fn create_relationship(
            &self,
            relationship: &Relationship,
            _validate: bool,
        ) -> Result<()> {
            self.upsert_relationship(relationship).await
        }

        async fn delete_relationship(&self, id: &str) -> Result<()> {
            self.relationships.write().await.remove(id);
            Ok(())
        }

        async fn create_relationships_bulk(
            &self,
            relationships: &[Relationship],
            validate: bool,
        ) -> Result<BulkOutcome> {
            let mut outcome = BulkOutcome::default();
            for relationship in relationships {
                self.create_relationship(relationship, validate).await?;
                outcome.succeeded.push(relationship.id.clone());
            }
            Ok(outcome)
        }

        async fn upsert_edge_evidence_bulk(&self, relationships: &[Relationship]) -> Result<()> {
            for relationship in relationships {
                self.upsert_relationship(relationship).await?;
            }
            Ok(())
        }

        async fn open_edge(
            &self,
            _from: &str,
            _to: &str,
            _edge_type: &str,
            _at: DateTime<Utc>,
            _change_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn close_edge(
            &self,
            _from: &str,
            _to: &str,
            _edge_type: &str,
            _at: DateTime<Utc>,
            _change_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn finalize_scan(&self, _scan_start: DateTime<Utc>) -> Result<()> {
            Ok(())
        }

        async fn append_version(
            &self,
            _entity_id: &str,
            _timestamp: DateTime<Utc>,
            _change_set_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn annotate_session_relationships_with_checkpoint(
            &self,
            _session_id: &str,
            _annotation: CheckpointAnnotation,
        ) -> Result<()> {
            Ok(())
        }

        async fn list_entities(&self, opts: ListOptions) -> Result<Page<Entity>> {
            let mut items: Vec<Entity> = self.entities.read().await.values().cloned().collect();
            items.sort_by(|a, b| a.id.cmp(&b.id));
            let total = items.len();
            if let Some(offset) = opts.offset {
                items = items.into_iter().skip(offset).collect();
            }
            if let Some(limit) = opts.limit {
                items.truncate(limit);
            }
            Ok(Page {
                items,
                total: Some(total),
            })
        }

        async fn list_relationships(&self, opts: ListOptions) -> Result<Page<Relationship>> {
            let mut items: Vec<Relationship> =
                self.relationships.read().await.values().cloned().collect();
            items.sort_by(|a, b| a.id.cmp(&b.id));
            let total = items.len();
            if let Some(offset) = opts.offset {
                items = items.into_iter().skip(offset).collect();
            }
            if let Some(limit) = opts.limit {
                items.truncate(limit);
            }
            Ok(Page {
                items,
                total: Some(total),
            })
        }

        async fn find_symbol_in_file(
            &self,
            file: &str,
            name: &str,
        ) -> Result<Option<SymbolMatch>> {
            Ok(self
                .entities
                .read()
                .await
                .values()
                .find(|e| {
                    e.fields.get("file").and_then(|v| v.as_str()) == Some(file)
                        && e.fields.get("name").and_then(|v| v.as_str()) == Some(name)
                })
                .map(|e| SymbolMatch {
                    entity_id: e.id.clone(),
                }))
        }

        async fn find_nearby_symbols(
            &self,
            file: &str,
            _name: &str,
            limit: usize,
        ) -> Result<Vec<SymbolMatch>> {
            Ok(self
                .entities
                .read()
                .await
                .values()
                .filter(|e| e.fields.get("file").and_then(|v| v.as_str()) == Some(file))
                .take(limit)
                .map(|e| SymbolMatch {
                    entity_id: e.id.clone(),
                })
                .collect())
        }

        async fn find_symbols_by_name(&self, name: &str) -> Result<Vec<SymbolMatch>> {
            Ok(self
                .entities
                .read()
                .await
                .values()
                .filter(|e| e.fields.get("name").and_then(|v| v.as_str()) == Some(name))
                .map(|e| SymbolMatch {
                    entity_id: e.id.clone(),
                })
                .collect())
        }

        async fn find_symbol_by_kind_and_name(
            &self,
            kind: &str,
            name: &str,
        ) -> Result<Vec<SymbolMatch>> {
            Ok(self
                .entities
                .read()
                .await
                .values()
                .filter(|e| {
                    e.entity_type == kind
                        && e.fields.get("name").and_then(|v| v.as_str()) == Some(name)
                })
                .map(|e| SymbolMatch {
                    entity_id: e.id.clone(),
                })
                .collect())
        }
    }
}
