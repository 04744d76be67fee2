//! Scene-wide collision surface shared by every grower.
//!
//! Geometry is registered as it is emitted, so a query from any pipe sees
//! everything emitted before it by any other pipe. Entries are only removed
//! when their owner is torn down or the whole scene is cleared.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::Vector3;
use ordered_float::OrderedFloat;

use crate::geometry::{PipeId, Shape};

/// Handle of a registered shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeometryId(pub u64);

/// A swept ray test.
#[derive(Debug, Clone, Copy)]
pub struct RayQuery {
    pub origin: Vector3<f32>,
    /// Normalized.
    pub direction: Vector3<f32>,
    pub max_distance: f32,
    /// Radius of the sphere swept along the ray (0 for a thin ray).
    pub radius: f32,
    /// Shapes owned by this pipe and anchored at the origin (the segment
    /// ending there and the spheres centered there) are skipped.
    pub allow_owner: Option<PipeId>,
}

impl RayQuery {
    pub fn thin(origin: Vector3<f32>, direction: Vector3<f32>, max_distance: f32) -> Self {
        Self {
            origin,
            direction,
            max_distance,
            radius: 0.0,
            allow_owner: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub geometry: GeometryId,
    pub owner: PipeId,
    pub distance: f32,
}

pub trait SpatialQuery {
    fn register(&mut self, owner: PipeId, shape: Shape) -> GeometryId;

    /// Nearest hit within `query.max_distance`.
    fn cast_ray(&self, query: &RayQuery) -> Option<RayHit>;

    /// Drops every shape registered by `owner`, returning how many went.
    fn release_owner(&mut self, owner: PipeId) -> usize;

    /// Whether any shape grown by `margin` contains `point`.
    fn is_occupied(&self, point: &Vector3<f32>, margin: f32) -> bool;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn query_ray(&self, origin: Vector3<f32>, direction: Vector3<f32>, max_distance: f32) -> bool {
        self.cast_ray(&RayQuery::thin(origin, direction, max_distance))
            .is_some()
    }
}

/// Handle passed to every grower in a pool.
pub type SharedScene = Rc<RefCell<dyn SpatialQuery>>;

#[derive(Debug, Clone)]
struct Entry {
    id: GeometryId,
    owner: PipeId,
    shape: Shape,
}

/// Flat append-only index, scanned linearly on every query.
#[derive(Debug, Default)]
pub struct SceneIndex {
    entries: Vec<Entry>,
    next_id: u64,
}

impl SceneIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Rc<RefCell<SceneIndex>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn shapes(&self) -> impl Iterator<Item = (PipeId, &Shape)> {
        self.entries.iter().map(|e| (e.owner, &e.shape))
    }

    pub fn count_owned_by(&self, owner: PipeId) -> usize {
        self.entries.iter().filter(|e| e.owner == owner).count()
    }
}

impl SpatialQuery for SceneIndex {
    fn register(&mut self, owner: PipeId, shape: Shape) -> GeometryId {
        let id = GeometryId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, owner, shape });
        id
    }

    fn cast_ray(&self, query: &RayQuery) -> Option<RayHit> {
        self.entries
            .iter()
            .filter(|e| {
                !(query.allow_owner == Some(e.owner) && e.shape.is_anchored_at(&query.origin))
            })
            .filter_map(|e| {
                e.shape
                    .ray_entry(&query.origin, &query.direction, query.radius)
                    .filter(|t| *t <= query.max_distance)
                    .map(|distance| RayHit {
                        geometry: e.id,
                        owner: e.owner,
                        distance,
                    })
            })
            .min_by_key(|hit| OrderedFloat(hit.distance))
    }

    fn release_owner(&mut self, owner: PipeId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner != owner);
        before - self.entries.len()
    }

    fn is_occupied(&self, point: &Vector3<f32>, margin: f32) -> bool {
        self.entries.iter().any(|e| e.shape.contains(point, margin))
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
