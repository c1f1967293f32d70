//! Dependency-ordered transform scheduler.
//!
//! The [`TransformGraph`] tracks every entity carrying a
//! [`Transform`]. Its edges are parent links ([`Hierarchy`]) and the
//! references of [`ComputedTransform`] behaviours. Each call to
//! [`update`](TransformGraph::update) runs these phases:
//!
//! 1. **Membership sync.** Entities gaining or losing `Transform` are added
//!    or dropped, and component versions are compared to pick up writes and
//!    structural changes (parent or reference edits).
//! 2. **Depth pass.** Only after a structural change:
//!    `depth = 1 + max(depth(deps))`, nodes without dependencies at 0.
//!    Cycles abort the update with [`EngineError::CyclicDependency`].
//! 3. **Sort.** Stable insertion sort of the node list by depth. The list is
//!    nearly sorted between re-sorts, so this stays close to linear.
//! 4. **Dirty propagation.** A node is dirty if it was marked, has a computed
//!    behaviour, or its parent is dirty.
//! 5. **Composition.** Dirty nodes in list order: computed behaviours first,
//!    then `world = parent_world * local`.
//! 6. **Culling.** Distance and frustum flags, only for nodes whose world
//!    matrix or bounds changed, or for every node when the camera changed.
//!
//! Dirty flags survive until [`clear_dirty`](TransformGraph::clear_dirty),
//! which the tick loop calls at the very end of a tick so later systems can
//! still see what moved.

use std::collections::{HashMap, HashSet};
use std::fmt;

use ember_ecs::prelude::*;
use glam::Mat4;

use crate::components::{
    register_all, Camera, ComputeBehavior, ComputedTransform, CullBounds, Hierarchy, Transform,
};
use crate::config::TransformConfig;
use crate::culling::{beyond_distance, Frustum};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What a custom behaviour sees when it is evaluated.
pub struct ComputeInput<'a> {
    /// The node being composed.
    pub entity: EntityId,
    /// Its own `Transform`, as stored.
    pub local: &'a Transform,
    /// World matrix of the resolved parent, identity for roots.
    pub parent_world: Mat4,
    /// World matrices of the declared references, `None` where a reference
    /// is not a tracked node.
    pub refs: &'a [Option<Mat4>],
}

/// A registered custom behaviour. Returns the node's world matrix, or `None`
/// to fall back to its plain local transform for this tick.
pub type CustomBehaviorFn = Box<dyn Fn(&ComputeInput<'_>) -> Option<Mat4>>;

/// Culling results for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullFlags {
    /// Farther from the camera than the node's view distance.
    pub distance: bool,
    /// Entirely outside the camera frustum.
    pub frustum: bool,
}

impl CullFlags {
    /// True if either test culled the node.
    pub fn is_culled(self) -> bool {
        self.distance || self.frustum
    }
}

/// Counters from the last [`TransformGraph::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Nodes in the graph after membership sync.
    pub tracked: usize,
    /// Whether depths were recomputed and the order re-sorted.
    pub resorted: bool,
    /// Nodes whose world matrix was recomputed.
    pub recomposed: usize,
    /// Nodes whose culling flags were re-tested.
    pub cull_updates: usize,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct Node {
    depth: u32,
    /// Parent as written in `Hierarchy`.
    declared_parent: Option<EntityId>,
    /// Declared parent if it is tracked, else `None`.
    parent: Option<EntityId>,
    behavior: ComputeBehavior,
    refs: Vec<EntityId>,
    transform_version: Option<u64>,
    hierarchy_version: Option<u64>,
    computed_version: Option<u64>,
    bounds_version: Option<u64>,
    dirty: bool,
    /// Needs culling regardless of matrix changes (new node, new bounds).
    recull: bool,
    matrix_changed: bool,
    local: Mat4,
    world: Mat4,
    cull: CullFlags,
}

impl Node {
    fn new() -> Self {
        Self {
            depth: 0,
            declared_parent: None,
            parent: None,
            behavior: ComputeBehavior::Local,
            refs: Vec::new(),
            transform_version: None,
            hierarchy_version: None,
            computed_version: None,
            bounds_version: None,
            dirty: true,
            recull: true,
            matrix_changed: false,
            local: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            cull: CullFlags::default(),
        }
    }

    fn deps(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.parent.into_iter().chain(self.refs.iter().copied())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done(u32),
}

fn to_local(parent_world: Option<Mat4>, world: Mat4) -> Mat4 {
    match parent_world {
        Some(parent) if parent.determinant().abs() > f32::EPSILON => parent.inverse() * world,
        _ => world,
    }
}

/// Stable insertion sort; cheap when `order` is already nearly sorted.
fn insertion_sort_by_key(order: &mut [EntityId], key: impl Fn(EntityId) -> u32) {
    for i in 1..order.len() {
        let mut j = i;
        while j > 0 && key(order[j - 1]) > key(order[j]) {
            order.swap(j - 1, j);
            j -= 1;
        }
    }
}

// ---------------------------------------------------------------------------
// TransformGraph
// ---------------------------------------------------------------------------

/// Hierarchical transform propagation and culling over a [`World`].
pub struct TransformGraph {
    config: TransformConfig,
    members: QueryHandle,
    nodes: HashMap<EntityId, Node>,
    /// Tracked entities in non-decreasing depth order once sorted.
    order: Vec<EntityId>,
    /// World matrices parallel to `order`.
    matrices: Vec<Mat4>,
    needs_resort: bool,
    camera: Option<EntityId>,
    /// Camera world matrix and parameters used by the last culling pass.
    last_view: Option<(Mat4, Camera)>,
    custom: HashMap<String, CustomBehaviorFn>,
    warned_custom: HashSet<String>,
    last_stats: UpdateStats,
}

impl fmt::Debug for TransformGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformGraph")
            .field("nodes", &self.nodes.len())
            .field("needs_resort", &self.needs_resort)
            .field("camera", &self.camera)
            .field("custom_behaviors", &self.custom.len())
            .finish()
    }
}

impl TransformGraph {
    /// Register the spatial components with `world` and start tracking its
    /// `Transform` entities.
    pub fn new(world: &mut World, config: TransformConfig) -> Result<Self, EngineError> {
        config.validate()?;
        register_all(world)?;
        let members = world.define_query(QuerySpec::new().with::<Transform>())?;
        Ok(Self {
            config,
            members,
            nodes: HashMap::new(),
            order: Vec::new(),
            matrices: Vec::new(),
            needs_resort: true,
            camera: None,
            last_view: None,
            custom: HashMap::new(),
            warned_custom: HashSet::new(),
            last_stats: UpdateStats::default(),
        })
    }

    /// Culling settings the graph was built with.
    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Register the function behind [`ComputeBehavior::Custom`] nodes named
    /// `name`, replacing any previous one.
    pub fn register_behavior(
        &mut self,
        name: &str,
        f: impl Fn(&ComputeInput<'_>) -> Option<Mat4> + 'static,
    ) {
        self.custom.insert(name.to_owned(), Box::new(f));
        self.warned_custom.remove(name);
    }

    /// Camera entity used for culling. It needs a [`Camera`] and a
    /// [`Transform`]; without one, nothing is culled.
    pub fn set_camera(&mut self, camera: Option<EntityId>) {
        self.camera = camera;
    }

    /// The camera set by [`set_camera`](Self::set_camera).
    pub fn camera(&self) -> Option<EntityId> {
        self.camera
    }

    /// Force `entity` to be recomposed on the next update.
    pub fn mark_dirty(&mut self, world: &World, entity: EntityId) -> Result<(), EngineError> {
        if let Some(node) = self.nodes.get_mut(&entity) {
            node.dirty = true;
            return Ok(());
        }
        if !world.is_alive(entity) {
            return Err(EcsError::InvalidEntity { entity }.into());
        }
        if world.has::<Transform>(entity) {
            // Not synced yet; it enters dirty.
            return Ok(());
        }
        Err(EcsError::MissingComponent {
            entity,
            component: <Transform as Component>::NAME,
        }
        .into())
    }

    // -- update -------------------------------------------------------------

    /// Run one scheduler pass (every phase except the dirty-flag cleanup).
    ///
    /// # Errors
    ///
    /// [`EngineError::CyclicDependency`] when parent and reference edges form
    /// a cycle. Nothing is recomposed in that case, and the next update
    /// retries the sort.
    pub fn update(&mut self, world: &mut World) -> Result<UpdateStats, EngineError> {
        let _span = tracing::debug_span!("transform_update", nodes = self.nodes.len()).entered();

        self.sync_membership(world)?;
        self.sync_structure(world);
        let resorted = self.needs_resort;
        if self.needs_resort {
            self.resort()?;
            self.needs_resort = false;
        }
        self.propagate_dirty();
        let recomposed = self.compose(world);
        let cull_updates = self.cull(world);
        if resorted || recomposed > 0 {
            let nodes = &self.nodes;
            self.matrices.clear();
            self.matrices.extend(
                self.order
                    .iter()
                    .map(|e| nodes.get(e).map_or(Mat4::IDENTITY, |n| n.world)),
            );
        }

        self.last_stats = UpdateStats {
            tracked: self.order.len(),
            resorted,
            recomposed,
            cull_updates,
        };
        tracing::trace!(stats = ?self.last_stats, "transform graph updated");
        Ok(self.last_stats)
    }

    /// Clear every dirty flag. Run last in a tick.
    pub fn clear_dirty(&mut self) {
        for node in self.nodes.values_mut() {
            node.dirty = false;
        }
    }

    fn sync_membership(&mut self, world: &mut World) -> Result<(), EngineError> {
        world.evaluate(self.members)?;
        for &entity in world.exited(self.members)? {
            if self.nodes.remove(&entity).is_some() {
                tracing::debug!(entity = ?entity, "transform node removed");
                self.needs_resort = true;
            }
        }
        for &entity in world.entered(self.members)? {
            if !self.nodes.contains_key(&entity) {
                tracing::debug!(entity = ?entity, "transform node added");
                self.nodes.insert(entity, Node::new());
                self.order.push(entity);
                self.needs_resort = true;
            }
        }
        Ok(())
    }

    /// Compare component versions against the last seen ones.
    fn sync_structure(&mut self, world: &World) {
        let nodes = &mut self.nodes;
        for &entity in &self.order {
            let Some(node) = nodes.get_mut(&entity) else {
                continue;
            };

            let version = world.version::<Transform>(entity);
            if version != node.transform_version {
                node.transform_version = version;
                node.dirty = true;
            }

            let version = world.version::<Hierarchy>(entity);
            if version != node.hierarchy_version {
                node.hierarchy_version = version;
                let parent = world.get_optional::<Hierarchy>(entity).and_then(|h| h.parent);
                if parent != node.declared_parent {
                    tracing::debug!(entity = ?entity, parent = ?parent, "parent changed");
                    node.declared_parent = parent;
                    self.needs_resort = true;
                }
            }

            let version = world.version::<ComputedTransform>(entity);
            if version != node.computed_version {
                node.computed_version = version;
                let behavior = world
                    .get_optional::<ComputedTransform>(entity)
                    .map(|c| c.behavior.clone())
                    .unwrap_or_default();
                let refs = behavior.references();
                if refs != node.refs {
                    tracing::debug!(entity = ?entity, refs = ?refs, "computed references changed");
                    node.refs = refs;
                    self.needs_resort = true;
                }
                node.behavior = behavior;
                node.dirty = true;
            }

            let version = world.version::<CullBounds>(entity);
            if version != node.bounds_version {
                node.bounds_version = version;
                node.recull = true;
            }
        }
    }

    /// Resolve parents, recompute depths and re-sort the node list.
    fn resort(&mut self) -> Result<(), EngineError> {
        let nodes = &self.nodes;
        self.order.retain(|e| nodes.contains_key(e));

        let mut reparented = Vec::new();
        for &entity in &self.order {
            let Some(node) = self.nodes.get(&entity) else {
                continue;
            };
            let resolved = node.declared_parent.filter(|p| self.nodes.contains_key(p));
            if let (Some(parent), None) = (node.declared_parent, resolved) {
                tracing::debug!(
                    entity = ?entity,
                    parent = ?parent,
                    "parent is not a tracked node -- composing as root"
                );
            }
            if resolved != node.parent {
                reparented.push((entity, resolved));
            }
        }
        for (entity, parent) in reparented {
            if let Some(node) = self.nodes.get_mut(&entity) {
                node.parent = parent;
                node.dirty = true;
            }
        }

        let depths = self.compute_depths()?;
        let mut max_depth = 0;
        for (entity, depth) in &depths {
            if let Some(node) = self.nodes.get_mut(entity) {
                node.depth = *depth;
                max_depth = max_depth.max(*depth);
            }
        }
        insertion_sort_by_key(&mut self.order, |e| depths.get(&e).copied().unwrap_or(0));
        tracing::debug!(nodes = self.order.len(), max_depth, "transform graph re-sorted");
        Ok(())
    }

    /// Iterative depth-first pass over dependency edges. Only edges to
    /// tracked nodes count.
    fn compute_depths(&self) -> Result<HashMap<EntityId, u32>, EngineError> {
        let deps: HashMap<EntityId, Vec<EntityId>> = self
            .order
            .iter()
            .filter_map(|&e| {
                let node = self.nodes.get(&e)?;
                let edges = node.deps().filter(|d| self.nodes.contains_key(d)).collect();
                Some((e, edges))
            })
            .collect();
        let deps_of = |e: &EntityId| deps.get(e).map_or(&[][..], Vec::as_slice);

        let mut marks: HashMap<EntityId, Mark> = HashMap::with_capacity(self.order.len());
        let mut stack: Vec<(EntityId, usize)> = Vec::new();
        for &start in &self.order {
            if marks.contains_key(&start) {
                continue;
            }
            marks.insert(start, Mark::Visiting);
            stack.push((start, 0));

            while let Some(top) = stack.len().checked_sub(1) {
                let (entity, next) = stack[top];
                let edges = deps_of(&entity);
                if let Some(&dep) = edges.get(next) {
                    stack[top].1 += 1;
                    match marks.get(&dep) {
                        Some(Mark::Done(_)) => {}
                        Some(Mark::Visiting) => {
                            let from = stack.iter().position(|&(e, _)| e == dep).unwrap_or(0);
                            let mut chain: Vec<EntityId> =
                                stack[from..].iter().map(|&(e, _)| e).collect();
                            chain.push(dep);
                            tracing::warn!(entity = ?dep, chain = ?chain, "cyclic transform dependency");
                            return Err(EngineError::CyclicDependency { entity: dep, chain });
                        }
                        None => {
                            marks.insert(dep, Mark::Visiting);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    let depth = edges
                        .iter()
                        .filter_map(|d| match marks.get(d) {
                            Some(Mark::Done(depth)) => Some(depth + 1),
                            _ => None,
                        })
                        .max()
                        .unwrap_or(0);
                    marks.insert(entity, Mark::Done(depth));
                    stack.pop();
                }
            }
        }

        Ok(marks
            .into_iter()
            .filter_map(|(e, mark)| match mark {
                Mark::Done(depth) => Some((e, depth)),
                Mark::Visiting => None,
            })
            .collect())
    }

    fn propagate_dirty(&mut self) {
        for &entity in &self.order {
            let Some(node) = self.nodes.get(&entity) else {
                continue;
            };
            let parent_dirty = node
                .parent
                .and_then(|p| self.nodes.get(&p))
                .is_some_and(|p| p.dirty);
            let dirty = node.dirty || parent_dirty || node.behavior != ComputeBehavior::Local;
            if let Some(node) = self.nodes.get_mut(&entity) {
                node.dirty = dirty;
            }
        }
    }

    /// Recompose dirty nodes in order. Returns how many were recomposed.
    fn compose(&mut self, world: &World) -> usize {
        let mut recomposed = 0;
        let mut missing_custom = Vec::new();

        for i in 0..self.order.len() {
            let entity = self.order[i];
            let Some(node) = self.nodes.get(&entity) else {
                continue;
            };
            if !node.dirty {
                continue;
            }
            let Some(transform) = world.get_optional::<Transform>(entity) else {
                continue;
            };
            let parent_world = node.parent.and_then(|p| self.nodes.get(&p)).map(|p| p.world);
            let local_trs = transform.matrix();

            let computed = match &node.behavior {
                ComputeBehavior::Local => None,
                behavior => {
                    let refs: Vec<Option<Mat4>> = node
                        .refs
                        .iter()
                        .map(|r| self.nodes.get(r).map(|n| n.world))
                        .collect();
                    if let ComputeBehavior::Custom { name, .. } = behavior {
                        if !self.custom.contains_key(name) {
                            missing_custom.push(name.clone());
                        }
                    }
                    self.evaluate(entity, behavior, transform, parent_world, &refs)
                }
            };
            let (local, world_matrix) = match computed {
                Some(world_matrix) => (to_local(parent_world, world_matrix), world_matrix),
                None => (
                    local_trs,
                    parent_world.map_or(local_trs, |parent| parent * local_trs),
                ),
            };

            if let Some(node) = self.nodes.get_mut(&entity) {
                node.matrix_changed |= node.world != world_matrix;
                node.local = local;
                node.world = world_matrix;
                recomposed += 1;
            }
        }

        for name in missing_custom {
            if self.warned_custom.insert(name.clone()) {
                tracing::warn!(behavior = %name, "custom transform behaviour not registered -- using local transform");
            }
        }
        recomposed
    }

    /// World matrix produced by a computed behaviour, or `None` to fall back.
    fn evaluate(
        &self,
        entity: EntityId,
        behavior: &ComputeBehavior,
        local: &Transform,
        parent_world: Option<Mat4>,
        refs: &[Option<Mat4>],
    ) -> Option<Mat4> {
        let rotation = local.rotation.normalize();
        let position_of = |m: &Mat4| m.w_axis.truncate();
        match behavior {
            ComputeBehavior::Local => None,
            ComputeBehavior::CopyPosition { offset, .. } => {
                let target = refs.first().copied().flatten()?;
                Some(Mat4::from_scale_rotation_translation(
                    local.scale,
                    rotation,
                    position_of(&target) + *offset,
                ))
            }
            ComputeBehavior::LookAt { up, .. } => {
                let target = position_of(&refs.first().copied().flatten()?);
                let eye = parent_world
                    .unwrap_or(Mat4::IDENTITY)
                    .transform_point3(local.position);
                let dir = target - eye;
                if dir.length_squared() < 1e-12 || dir.normalize().cross(up.normalize()).length_squared() < 1e-12 {
                    tracing::trace!(entity = ?entity, "look-at direction degenerate");
                    return None;
                }
                Some(Mat4::look_at_rh(eye, target, *up).inverse() * Mat4::from_scale(local.scale))
            }
            ComputeBehavior::Midpoint { .. } => {
                let a = refs.first().copied().flatten()?;
                let b = refs.get(1).copied().flatten()?;
                Some(Mat4::from_scale_rotation_translation(
                    local.scale,
                    rotation,
                    (position_of(&a) + position_of(&b)) * 0.5,
                ))
            }
            ComputeBehavior::Custom { name, .. } => {
                let f = self.custom.get(name)?;
                f(&ComputeInput {
                    entity,
                    local,
                    parent_world: parent_world.unwrap_or(Mat4::IDENTITY),
                    refs,
                })
            }
        }
    }

    /// Recompute culling flags where needed. Returns how many nodes were
    /// tested.
    fn cull(&mut self, world: &World) -> usize {
        let view = self.camera.and_then(|camera| {
            let node = self.nodes.get(&camera)?;
            let params = world.get_optional::<Camera>(camera)?;
            Some((node.world, *params))
        });
        let camera_changed = view != self.last_view;
        if camera_changed {
            tracing::debug!(camera = ?self.camera, "camera changed -- culling every node");
            self.last_view = view;
        }

        let eye_and_frustum = view.map(|(camera_world, params)| {
            let view_matrix = camera_world.inverse();
            (
                camera_world.w_axis.truncate(),
                Frustum::from_view_projection(&(params.projection() * view_matrix)),
            )
        });

        let mut updates = 0;
        for &entity in &self.order {
            let Some(node) = self.nodes.get_mut(&entity) else {
                continue;
            };
            let needs_cull = camera_changed || node.matrix_changed || node.recull;
            node.matrix_changed = false;
            node.recull = false;
            if !needs_cull {
                continue;
            }
            updates += 1;

            node.cull = match &eye_and_frustum {
                Some((eye, frustum)) if Some(entity) != self.camera => {
                    let bounds = world
                        .get_optional::<CullBounds>(entity)
                        .copied()
                        .unwrap_or_default();
                    let scale = node
                        .world
                        .x_axis
                        .truncate()
                        .length()
                        .max(node.world.y_axis.truncate().length())
                        .max(node.world.z_axis.truncate().length());
                    let radius = bounds.radius * scale;
                    let center = node.world.w_axis.truncate();
                    let max_distance = if bounds.max_distance > 0.0 {
                        bounds.max_distance
                    } else {
                        self.config.default_cull_distance
                    };
                    CullFlags {
                        distance: self.config.distance_culling
                            && beyond_distance(*eye, center, radius, max_distance),
                        frustum: self.config.frustum_culling
                            && !frustum.intersects_sphere(center, radius),
                    }
                }
                _ => CullFlags::default(),
            };
        }
        updates
    }

    // -- reads --------------------------------------------------------------

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no entity is tracked.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `entity` is a tracked node.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.nodes.contains_key(&entity)
    }

    /// Tracked entities in update order (non-decreasing depth).
    pub fn order(&self) -> &[EntityId] {
        &self.order
    }

    /// Local-to-world matrix from the last composition.
    pub fn world_matrix(&self, entity: EntityId) -> Option<Mat4> {
        self.nodes.get(&entity).map(|n| n.world)
    }

    /// Local matrix used by the last composition, including computed
    /// overrides.
    pub fn local_matrix(&self, entity: EntityId) -> Option<Mat4> {
        self.nodes.get(&entity).map(|n| n.local)
    }

    /// Dependency depth; roots are 0.
    pub fn depth(&self, entity: EntityId) -> Option<u32> {
        self.nodes.get(&entity).map(|n| n.depth)
    }

    /// Parent actually used for composition.
    pub fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.nodes.get(&entity).and_then(|n| n.parent)
    }

    /// Dirty flag for this tick. Cleared by [`clear_dirty`](Self::clear_dirty).
    pub fn is_dirty(&self, entity: EntityId) -> bool {
        self.nodes.get(&entity).is_some_and(|n| n.dirty)
    }

    /// Culling results, `None` for untracked entities.
    pub fn cull_flags(&self, entity: EntityId) -> Option<CullFlags> {
        self.nodes.get(&entity).map(|n| n.cull)
    }

    /// Whether `entity` is tracked and culled by either test.
    pub fn is_culled(&self, entity: EntityId) -> bool {
        self.nodes.get(&entity).is_some_and(|n| n.cull.is_culled())
    }

    /// World matrices parallel to [`order`](Self::order), as of the last
    /// update.
    pub fn world_matrices(&self) -> &[Mat4] {
        &self.matrices
    }

    /// [`world_matrices`](Self::world_matrices) as raw bytes for upload.
    pub fn world_matrix_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.matrices)
    }

    /// Counters from the most recent [`update`](Self::update).
    pub fn last_stats(&self) -> UpdateStats {
        self.last_stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
