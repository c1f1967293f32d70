//! Scene documents: saving and loading entity data as JSON.
//!
//! Only component types that declare a [`JSON_ID`](crate::component::Component::JSON_ID)
//! take part, and each value decides through
//! [`to_json`](crate::component::Component::to_json) whether it is written at
//! all. Loading creates fresh entities, so ids in the document are treated as
//! document-local keys: an [`EntityMap`] translates them, and components that
//! hold entity references rewrite them in
//! [`map_entities`](crate::component::Component::map_entities).

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::world::World;
use crate::EcsError;

/// Current [`SceneDocument::version`].
pub const SCENE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// One entity's serialized components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEntity {
    /// Document-local id (the raw id at save time).
    pub id: u64,
    /// JSON id -> serialized value. `BTreeMap` for deterministic output.
    pub components: BTreeMap<String, serde_json::Value>,
}

/// A serializable set of entities and their persistent components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDocument {
    /// Format version.
    pub version: u32,
    /// Entities in ascending id order.
    pub entities: Vec<SceneEntity>,
}

/// Translation from document ids to the entities created by a load.
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    map: HashMap<EntityId, EntityId>,
}

impl EntityMap {
    /// Entity created for document id `old`, if the document contained it.
    pub fn get(&self, old: EntityId) -> Option<EntityId> {
        self.map.get(&old).copied()
    }

    /// Number of mapped entities.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing was mapped.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `(document id, new entity)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, EntityId)> + '_ {
        self.map.iter().map(|(&old, &new)| (old, new))
    }

    pub(crate) fn insert(&mut self, old: EntityId, new: EntityId) {
        self.map.insert(old, new);
    }
}

// ---------------------------------------------------------------------------
// World save/load impl
// ---------------------------------------------------------------------------

impl World {
    /// Serialize every live entity's persistent components.
    ///
    /// Entities with nothing to persist are left out. Component types without
    /// a JSON id, and values whose `to_json` returns `None`, are skipped.
    pub fn save_scene(&self) -> SceneDocument {
        let mut entities = Vec::new();
        for entity in self.allocator.iter_alive() {
            let mut components = BTreeMap::new();
            for &tid in &self.signatures[entity.index() as usize] {
                let Some(json_id) = self.registry.get_info(tid).and_then(|info| info.json_id)
                else {
                    continue;
                };
                match self.columns[tid.index()].to_json(entity) {
                    Some(value) => {
                        components.insert(json_id.to_owned(), value);
                    }
                    None => tracing::trace!(
                        entity = ?entity,
                        component = json_id,
                        "component opted out of serialization"
                    ),
                }
            }
            if !components.is_empty() {
                entities.push(SceneEntity {
                    id: entity.to_raw(),
                    components,
                });
            }
        }
        SceneDocument {
            version: SCENE_VERSION,
            entities,
        }
    }

    /// Create the document's entities and attach their components.
    ///
    /// Values are rehydrated through `on_set` and bindings start as for any
    /// other attach. The whole load is one logical update. On error, every
    /// entity created by this call is destroyed again before returning.
    ///
    /// # Errors
    ///
    /// [`EcsError::StateError`] for an unsupported version or duplicate ids;
    /// any error from rehydrating a component value.
    pub fn load_scene(&mut self, doc: &SceneDocument) -> Result<EntityMap, EcsError> {
        if doc.version > SCENE_VERSION {
            return Err(EcsError::StateError {
                details: format!(
                    "scene version {} is newer than supported version {SCENE_VERSION}",
                    doc.version
                ),
            });
        }
        let mut seen = HashSet::new();
        for scene_entity in &doc.entities {
            if !seen.insert(scene_entity.id) {
                return Err(EcsError::StateError {
                    details: format!("scene contains entity id {} twice", scene_entity.id),
                });
            }
        }

        let mut map = EntityMap::default();
        for scene_entity in &doc.entities {
            let entity = self.spawn();
            map.insert(EntityId::from_raw(scene_entity.id), entity);
        }

        self.begin_update();
        let result = self.attach_scene_components(doc, &map);
        if result.is_err() {
            for (_, entity) in map.iter() {
                if let Err(e) = self.despawn(entity) {
                    tracing::warn!(entity = ?entity, error = %e, "rollback despawn failed");
                }
            }
        }
        self.end_update();

        result.map(|loaded| {
            tracing::debug!(entities = map.len(), components = loaded, "scene loaded");
            map
        })
    }

    fn attach_scene_components(
        &mut self,
        doc: &SceneDocument,
        map: &EntityMap,
    ) -> Result<usize, EcsError> {
        let mut loaded = 0;
        for scene_entity in &doc.entities {
            let Some(entity) = map.get(EntityId::from_raw(scene_entity.id)) else {
                continue;
            };
            for (json_id, value) in &scene_entity.components {
                let Some(tid) = self.registry.lookup_by_json_id(json_id) else {
                    tracing::warn!(
                        entity = ?entity,
                        json_id = %json_id,
                        "unknown component in scene -- skipped"
                    );
                    continue;
                };
                self.load_component(entity, tid, value, map)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
