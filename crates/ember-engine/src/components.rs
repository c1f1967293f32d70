//! Built-in spatial components read by the [`TransformGraph`](crate::graph::TransformGraph).
//!
//! | Component           | Storage | Role                                            |
//! |---------------------|---------|-------------------------------------------------|
//! | [`Transform`]       | packed  | local translation, rotation and scale           |
//! | [`Hierarchy`]       | boxed   | optional parent edge                            |
//! | [`ComputedTransform`] | boxed | behaviour deriving the node from other nodes    |
//! | [`Camera`]          | boxed   | perspective parameters for frustum culling      |
//! | [`CullBounds`]      | packed  | bounding sphere radius and view distance        |

use ember_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

fn reject(component: &str, details: impl Into<String>) -> EcsError {
    EcsError::TypeMismatch {
        component: component.to_owned(),
        details: details.into(),
    }
}

fn remap(map: &EntityMap, entity: EntityId) -> EntityId {
    map.get(entity).unwrap_or(EntityId::PLACEHOLDER)
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Local position, rotation and scale relative to the parent (or the world
/// for roots).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_translation(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Local TRS matrix. The rotation is normalized here because path
    /// updates can write raw quaternion components.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation.normalize(), self.position)
    }
}

/// Fields of a [`Transform`] to overwrite. Absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformPatch {
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub scale: Option<Vec3>,
}

impl From<Transform> for TransformPatch {
    fn from(t: Transform) -> Self {
        Self {
            position: Some(t.position),
            rotation: Some(t.rotation),
            scale: Some(t.scale),
        }
    }
}

impl Component for Transform {
    type Patch = TransformPatch;
    const NAME: &'static str = "transform";
    const JSON_ID: Option<&'static str> = Some("ember.transform");
    const STORAGE: StorageKind = StorageKind::Packed;

    fn init(_entity: EntityId) -> Self {
        Self::IDENTITY
    }

    fn on_set(&mut self, patch: TransformPatch) -> Result<(), EcsError> {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(scale) = patch.scale {
            self.scale = scale;
        }
        self.validate()?;
        self.rotation = self.rotation.normalize();
        Ok(())
    }

    fn validate(&self) -> Result<(), EcsError> {
        if !self.position.is_finite() || !self.scale.is_finite() || !self.rotation.is_finite() {
            return Err(reject(Self::NAME, "components must be finite"));
        }
        if self.rotation.length_squared() < 1e-12 {
            return Err(reject(Self::NAME, "rotation must be a non-zero quaternion"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

/// Parent edge. A parent that is dead or has no [`Transform`] is ignored and
/// the node is composed as a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub parent: Option<EntityId>,
}

impl Hierarchy {
    pub fn child_of(parent: EntityId) -> Self {
        Self {
            parent: Some(parent),
        }
    }
}

impl Component for Hierarchy {
    type Patch = Hierarchy;
    const NAME: &'static str = "hierarchy";
    const JSON_ID: Option<&'static str> = Some("ember.hierarchy");

    fn init(_entity: EntityId) -> Self {
        Self::default()
    }

    fn on_set(&mut self, patch: Hierarchy) -> Result<(), EcsError> {
        *self = patch;
        Ok(())
    }

    /// A parent missing from the map becomes `PLACEHOLDER`, which is never
    /// alive, so the node composes as a root.
    fn map_entities(&mut self, map: &EntityMap) {
        self.parent = self.parent.map(|p| remap(map, p));
    }
}

// ---------------------------------------------------------------------------
// ComputedTransform
// ---------------------------------------------------------------------------

/// How a computed node derives its transform from the nodes it references.
///
/// The result replaces the node's local transform for the tick; the
/// [`Transform`] component itself is never written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComputeBehavior {
    /// Use the local transform unchanged.
    #[default]
    Local,
    /// Place the node at `target`'s world position plus `offset` (world
    /// space), keeping its own rotation and scale.
    CopyPosition { target: EntityId, offset: Vec3 },
    /// Keep the node's own position and turn its -Z axis toward `target`.
    LookAt { target: EntityId, up: Vec3 },
    /// Place the node halfway between the world positions of `a` and `b`.
    Midpoint { a: EntityId, b: EntityId },
    /// Dispatch to a function registered on the graph under `name`.
    Custom { name: String, refs: Vec<EntityId> },
}

impl ComputeBehavior {
    /// Entities this behaviour reads. Each one must be composed first.
    pub fn references(&self) -> Vec<EntityId> {
        match self {
            ComputeBehavior::Local => Vec::new(),
            ComputeBehavior::CopyPosition { target, .. } | ComputeBehavior::LookAt { target, .. } => {
                vec![*target]
            }
            ComputeBehavior::Midpoint { a, b } => vec![*a, *b],
            ComputeBehavior::Custom { refs, .. } => refs.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputedTransform {
    pub behavior: ComputeBehavior,
}

impl ComputedTransform {
    pub fn new(behavior: ComputeBehavior) -> Self {
        Self { behavior }
    }
}

impl Component for ComputedTransform {
    type Patch = ComputedTransform;
    const NAME: &'static str = "computed_transform";
    const JSON_ID: Option<&'static str> = Some("ember.computed_transform");

    fn init(_entity: EntityId) -> Self {
        Self::default()
    }

    fn on_set(&mut self, patch: ComputedTransform) -> Result<(), EcsError> {
        *self = patch;
        self.validate()
    }

    fn validate(&self) -> Result<(), EcsError> {
        match &self.behavior {
            ComputeBehavior::CopyPosition { offset, .. } if !offset.is_finite() => {
                Err(reject(Self::NAME, "offset must be finite"))
            }
            ComputeBehavior::LookAt { up, .. } if !up.is_finite() || up.length_squared() < 1e-12 => {
                Err(reject(Self::NAME, "up must be a finite non-zero vector"))
            }
            ComputeBehavior::Custom { name, .. } if name.is_empty() => {
                Err(reject(Self::NAME, "custom behaviour needs a name"))
            }
            _ => Ok(()),
        }
    }

    fn map_entities(&mut self, map: &EntityMap) {
        match &mut self.behavior {
            ComputeBehavior::Local => {}
            ComputeBehavior::CopyPosition { target, .. } | ComputeBehavior::LookAt { target, .. } => {
                *target = remap(map, *target);
            }
            ComputeBehavior::Midpoint { a, b } => {
                *a = remap(map, *a);
                *b = remap(map, *b);
            }
            ComputeBehavior::Custom { refs, .. } => {
                for r in refs.iter_mut() {
                    *r = remap(map, *r);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

/// Right-handed perspective camera. Its view is the inverse of the owning
/// entity's world matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fov_y: std::f32::consts::FRAC_PI_3,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }
}

impl Component for Camera {
    type Patch = Camera;
    const NAME: &'static str = "camera";
    const JSON_ID: Option<&'static str> = Some("ember.camera");

    fn init(_entity: EntityId) -> Self {
        Self::default()
    }

    fn on_set(&mut self, patch: Camera) -> Result<(), EcsError> {
        *self = patch;
        self.validate()
    }

    fn validate(&self) -> Result<(), EcsError> {
        if !(self.fov_y > 0.0 && self.fov_y < std::f32::consts::PI) {
            return Err(reject(Self::NAME, format!("fov_y {} out of (0, pi)", self.fov_y)));
        }
        if !(self.aspect > 0.0 && self.aspect.is_finite()) {
            return Err(reject(Self::NAME, "aspect must be positive"));
        }
        if !(self.near > 0.0 && self.far > self.near && self.far.is_finite()) {
            return Err(reject(Self::NAME, "expected 0 < near < far"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CullBounds
// ---------------------------------------------------------------------------

/// Bounding sphere around the node's world origin, plus an optional view
/// distance. A `max_distance` of zero or less falls back to the configured
/// default.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CullBounds {
    pub radius: f32,
    pub max_distance: f32,
}

impl CullBounds {
    pub fn sphere(radius: f32) -> Self {
        Self {
            radius,
            max_distance: 0.0,
        }
    }
}

impl Component for CullBounds {
    type Patch = CullBounds;
    const NAME: &'static str = "cull_bounds";
    const JSON_ID: Option<&'static str> = Some("ember.cull_bounds");
    const STORAGE: StorageKind = StorageKind::Packed;

    fn init(_entity: EntityId) -> Self {
        Self::default()
    }

    fn on_set(&mut self, patch: CullBounds) -> Result<(), EcsError> {
        *self = patch;
        self.validate()
    }

    fn validate(&self) -> Result<(), EcsError> {
        if !(self.radius >= 0.0 && self.radius.is_finite()) || self.max_distance.is_nan() {
            return Err(reject(Self::NAME, "radius must be finite and non-negative"));
        }
        Ok(())
    }
}

/// Register every built-in spatial component with `world`.
pub fn register_all(world: &mut World) -> Result<(), EcsError> {
    world.register::<Transform>()?;
    world.register::<Hierarchy>()?;
    world.register::<ComputedTransform>()?;
    world.register::<Camera>()?;
    world.register::<CullBounds>()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
