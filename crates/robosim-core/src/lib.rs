//! World model and tick loop for the robosim multi-robot simulator.
//!
//! This crate owns the shared geometric model of a world (walls, blocks,
//! boxes, doors, landmarks, a robot), advances it tick by tick, resolves
//! collisions and pushability, runs door kinematics, cascades transforms
//! through the containment tree, and answers laser-rangefinder queries.
//! Presentation, transport, and file I/O live in other processes; they talk
//! to this core exclusively through [`WorldCommand`]s and read-only
//! accessors.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use robosim_geom::ray_hit_distance;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SecondaryMap, SlotMap};
use thiserror::Error;
use tracing::{debug, warn};

pub use robosim_geom::{Affine, Bounds, Point, Segment};

new_key_type! {
    /// Arena handle for entities. Handles are process-local; the wire-level
    /// identity of an entity is its [`EntityId`].
    pub struct EntityKey;
}

/// Globally unique entity identity, stable across processes.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Which role this world-model instance plays in the distributed setup.
///
/// Only the authoritative environment advances door kinematics; actors and
/// viewers receive door geometry through replicated commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Owner {
    Environment,
    Actor,
    Viewer,
}

/// RGB display color.
pub type Color = [f32; 3];

/// Errors raised by the world model.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A second entity with an already-registered id was inserted. This is a
    /// protocol invariant violation with no recovery path; hosts must treat
    /// it as fatal.
    #[error("duplicate entity id {0}")]
    DuplicateId(EntityId),
    /// A command referenced an entity this instance does not know.
    #[error("unknown entity id {0}")]
    UnknownEntity(EntityId),
    /// A command carried values that cannot be applied (NaN offsets, missing
    /// door parameters, malformed shapes).
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A trigger effect attached to a shape, executed when the robot's shape
/// intersects it after a self-move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Action {
    /// Command a door to start opening. Attached to the door's own shape this
    /// doubles as its push-to-open marker.
    OpenDoor { door: EntityId },
    /// Command a door to start closing.
    CloseDoor { door: EntityId },
    /// Flip a box between open and closed.
    ToggleBox { target: EntityId },
    /// Surface a message to the host through the tick events.
    Notify { message: String },
}

// ---------------------------------------------------------------------------
// Pushability
// ---------------------------------------------------------------------------

/// Per-shape strategy deciding whether an obstacle may be displaced by robot
/// contact instead of blocking motion.
///
/// Both checks run before a move is committed and never mutate world state.
/// The static classification ([`Pushability::ever_pushable`]) is separate so
/// presentation code can distinguish "immovable" from "jammed".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Pushability {
    /// Never pushable (walls, landmarks).
    Fixed,
    /// Pushable when the hypothetical move would not introduce any overlap
    /// that did not already exist at the original pose.
    #[default]
    WhenClear,
    /// Delegates to door logic: pushable iff the door carries a push-to-open
    /// action; committing the push starts the door opening instead of
    /// translating it.
    Door,
}

impl Pushability {
    /// Static classification independent of current world state.
    #[must_use]
    pub const fn ever_pushable(&self) -> bool {
        !matches!(self, Pushability::Fixed)
    }
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// A transformable polygon stored as an ordered, closed list of segments,
/// with a vertical extent `[z, z + z_len]`.
///
/// The segment list always closes: segment `i` ends where segment `i + 1`
/// starts, wrapping at the end. Bounds are refreshed on every transform so
/// they are never stale. Clones share the action list and pushability tag
/// (both immutable) but own their segment list.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    segments: Vec<Segment>,
    z: f64,
    z_len: Option<f64>,
    actions: Arc<[Action]>,
    pushability: Pushability,
    bounds: Bounds,
}

impl Shape {
    /// Build a shape from an ordered boundary point list.
    ///
    /// Two points produce a single degenerate segment (used by world-boundary
    /// walls); three or more close into a polygon. Non-finite coordinates are
    /// rejected.
    pub fn new(points: &[Point], z: f64, z_len: Option<f64>) -> Result<Self, WorldError> {
        if points.len() < 2 {
            return Err(WorldError::InvalidConfig(
                "a shape needs at least two boundary points",
            ));
        }
        if points.iter().any(|p| !p.is_finite()) || !z.is_finite() {
            return Err(WorldError::InvalidConfig(
                "shape coordinates must be finite",
            ));
        }
        if let Some(len) = z_len {
            if !len.is_finite() || len < 0.0 {
                return Err(WorldError::InvalidConfig(
                    "z extent must be finite and non-negative",
                ));
            }
        }
        let segments: Vec<Segment> = if points.len() == 2 {
            vec![Segment::new(points[0], points[1])]
        } else {
            (0..points.len())
                .map(|i| Segment::new(points[i], points[(i + 1) % points.len()]))
                .collect()
        };
        let bounds = Self::compute_bounds(&segments);
        Ok(Self {
            segments,
            z,
            z_len,
            actions: Arc::from([]),
            pushability: Pushability::default(),
            bounds,
        })
    }

    /// Axis-aligned rectangle centered on `center`.
    pub fn rectangle(
        center: Point,
        width: f64,
        height: f64,
        z: f64,
        z_len: Option<f64>,
    ) -> Result<Self, WorldError> {
        if !(width > 0.0) || !(height > 0.0) {
            return Err(WorldError::InvalidConfig(
                "rectangle extents must be positive",
            ));
        }
        let hw = width * 0.5;
        let hh = height * 0.5;
        Self::new(
            &[
                Point::new(center.x - hw, center.y - hh),
                Point::new(center.x + hw, center.y - hh),
                Point::new(center.x + hw, center.y + hh),
                Point::new(center.x - hw, center.y + hh),
            ],
            z,
            z_len,
        )
    }

    /// Regular polygon approximating a disc, used for robot bodies.
    pub fn regular_polygon(
        center: Point,
        radius: f64,
        sides: usize,
        z: f64,
        z_len: Option<f64>,
    ) -> Result<Self, WorldError> {
        if sides < 3 || !(radius > 0.0) {
            return Err(WorldError::InvalidConfig(
                "polygon needs at least three sides and a positive radius",
            ));
        }
        let points: Vec<Point> = (0..sides)
            .map(|i| {
                let angle = std::f64::consts::TAU * i as f64 / sides as f64;
                Point::new(center.x + radius * angle.cos(), center.y + radius * angle.sin())
            })
            .collect();
        Self::new(&points, z, z_len)
    }

    fn compute_bounds(segments: &[Segment]) -> Bounds {
        Bounds::from_points(
            segments
                .iter()
                .flat_map(|s| [s.start, s.end]),
        )
        .unwrap_or(Bounds {
            min: Point::default(),
            max: Point::default(),
        })
    }

    /// Attach an action list, shared by reference across clones.
    #[must_use]
    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions.into();
        self
    }

    /// Set the pushability strategy.
    #[must_use]
    pub fn with_pushability(mut self, pushability: Pushability) -> Self {
        self.pushability = pushability;
        self
    }

    /// The ordered boundary segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The ordered boundary points (segment start points; both endpoints for
    /// a degenerate two-point shape).
    #[must_use]
    pub fn points(&self) -> Vec<Point> {
        if self.segments.len() == 1 {
            vec![self.segments[0].start, self.segments[0].end]
        } else {
            self.segments.iter().map(|s| s.start).collect()
        }
    }

    /// Attached trigger actions.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Pushability strategy for this shape.
    #[must_use]
    pub const fn pushability(&self) -> Pushability {
        self.pushability
    }

    /// Base height.
    #[must_use]
    pub const fn z(&self) -> f64 {
        self.z
    }

    /// Vertical extent, if resolved. Entity construction resolves a missing
    /// extent to the per-type default exactly once.
    #[must_use]
    pub const fn z_len(&self) -> Option<f64> {
        self.z_len
    }

    /// Cached bounding box.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Center of the cached bounding box.
    #[must_use]
    pub fn center(&self) -> Point {
        self.bounds.center()
    }

    /// Apply `map` point-wise to every boundary segment and refresh the
    /// cached bounds. Follow-up bookkeeping (door pivot resync) is the
    /// caller's responsibility via the mover's explicit returns.
    pub fn transform(&mut self, map: &Affine) {
        for segment in &mut self.segments {
            segment.start = map.apply(segment.start);
            segment.end = map.apply(segment.end);
        }
        self.bounds = Self::compute_bounds(&self.segments);
    }

    /// Clone with `map` already applied.
    #[must_use]
    pub fn transformed(&self, map: &Affine) -> Self {
        let mut clone = self.clone();
        clone.transform(map);
        clone
    }

    /// Clone translated by `(dx, dy)`, for hypothetical-move tests.
    #[must_use]
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        self.transformed(&Affine::translation(dx, dy))
    }

    /// Whether any segment of this shape crosses any segment of `other`.
    ///
    /// This is the sole collision primitive in the core: O(n * m) segment
    /// pairs behind a bounding-box pre-reject, acceptable because polygons
    /// are small.
    #[must_use]
    pub fn intersects(&self, other: &Shape) -> bool {
        if !self.bounds.overlaps(&other.bounds) {
            return false;
        }
        self.segments
            .iter()
            .any(|a| other.segments.iter().any(|b| a.intersects(b)))
    }

    /// Decompose into one degenerate two-point shape per boundary segment.
    /// World-boundary construction turns these into four bounding walls.
    #[must_use]
    pub fn perimeter_shapes(&self) -> Vec<Shape> {
        self.segments
            .iter()
            .map(|s| Shape {
                segments: vec![*s],
                z: self.z,
                z_len: self.z_len,
                actions: Arc::from([]),
                pushability: Pushability::Fixed,
                bounds: Self::compute_bounds(std::slice::from_ref(s)),
            })
            .collect()
    }

    /// Whether the laser height band at `height` falls inside this shape's
    /// vertical extent.
    #[must_use]
    pub fn spans_height(&self, height: f64) -> bool {
        let len = self.z_len.unwrap_or(0.0);
        height >= self.z && height <= self.z + len
    }

    /// Whether the boundary is an axis-aligned rectangle (export compaction).
    #[must_use]
    pub fn is_rectangle(&self) -> bool {
        self.segments.len() == 4 && robosim_geom::is_axis_aligned_rect(&self.points())
    }
}

// ---------------------------------------------------------------------------
// Door kinematics
// ---------------------------------------------------------------------------

/// Door travel state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DoorStatus {
    Opening,
    Closing,
    #[default]
    Holding,
}

/// Kinematic state of a door: a thin rectangle hinged at `pivot`, swept from
/// `closed_angle` through `pivot_angle` radians of travel.
///
/// The door's shape is regenerated from first principles whenever the open
/// fraction, pivot, or closed angle changes; it is never incrementally
/// mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoorState {
    pivot: Point,
    closed_angle: f64,
    pivot_angle: f64,
    open_fraction: f64,
    status: DoorStatus,
    width: f64,
    thickness: f64,
    push_to_open: bool,
}

impl DoorState {
    /// Construct a door. Zero or negative leaf dimensions are rejected, never
    /// clamped.
    pub fn new(
        pivot: Point,
        closed_angle: f64,
        pivot_angle: f64,
        width: f64,
        thickness: f64,
    ) -> Result<Self, WorldError> {
        if !(width > 0.0) || !(thickness > 0.0) || !width.is_finite() || !thickness.is_finite() {
            return Err(WorldError::InvalidConfig(
                "door width and thickness must be positive",
            ));
        }
        if !pivot.is_finite() || !closed_angle.is_finite() || !pivot_angle.is_finite() {
            return Err(WorldError::InvalidConfig(
                "door pivot and angles must be finite",
            ));
        }
        Ok(Self {
            pivot,
            closed_angle,
            pivot_angle,
            open_fraction: 0.0,
            status: DoorStatus::Holding,
            width,
            thickness,
            push_to_open: false,
        })
    }

    /// Hinge point.
    #[must_use]
    pub const fn pivot(&self) -> Point {
        self.pivot
    }

    /// Leaf angle when fully closed.
    #[must_use]
    pub const fn closed_angle(&self) -> f64 {
        self.closed_angle
    }

    /// Angular travel from closed to fully open.
    #[must_use]
    pub const fn pivot_angle(&self) -> f64 {
        self.pivot_angle
    }

    /// Travel position: 0 = fully closed, 1 = fully open.
    #[must_use]
    pub const fn open_fraction(&self) -> f64 {
        self.open_fraction
    }

    /// Current travel state.
    #[must_use]
    pub const fn status(&self) -> DoorStatus {
        self.status
    }

    /// Whether a push-to-open action is attached to this door's shape.
    #[must_use]
    pub const fn push_to_open(&self) -> bool {
        self.push_to_open
    }

    /// Current leaf angle in world coordinates.
    #[must_use]
    pub fn current_angle(&self) -> f64 {
        self.closed_angle + self.open_fraction * self.pivot_angle
    }

    /// Command the door to open or close.
    pub fn set_status(&mut self, status: DoorStatus) {
        self.status = status;
    }

    /// Regenerate the door leaf at travel fraction `fraction`: a thin
    /// rectangle extending from the pivot, rotated by
    /// `closed_angle + fraction * pivot_angle`.
    #[must_use]
    pub fn leaf_at(&self, fraction: f64, z: f64, z_len: Option<f64>) -> Shape {
        let angle = self.closed_angle + fraction * self.pivot_angle;
        let (sin, cos) = angle.sin_cos();
        let half = self.thickness * 0.5;
        let local = [
            Point::new(0.0, -half),
            Point::new(self.width, -half),
            Point::new(self.width, half),
            Point::new(0.0, half),
        ];
        let points: Vec<Point> = local
            .iter()
            .map(|p| {
                Point::new(
                    self.pivot.x + p.x * cos - p.y * sin,
                    self.pivot.y + p.x * sin + p.y * cos,
                )
            })
            .collect();
        let segments: Vec<Segment> = (0..4)
            .map(|i| Segment::new(points[i], points[(i + 1) % 4]))
            .collect();
        let bounds = Shape::compute_bounds(&segments);
        Shape {
            segments,
            z,
            z_len,
            actions: Arc::from([]),
            pushability: Pushability::Door,
            bounds,
        }
    }

    /// Keep the hinge in step with a transform applied to the door's shape by
    /// the object mover, which calls this as an explicit follow-up.
    pub fn resync(&mut self, map: &Affine) {
        self.pivot = map.apply(self.pivot);
        self.closed_angle += map.rotation_angle();
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Type tag for an entity, used for default colors/extents, wildcard
/// matching, and export.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityType {
    Wall,
    Landmark,
    Block,
    Box,
    Door,
}

impl EntityType {
    /// Lower-case tag used for matching and export.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            EntityType::Wall => "wall",
            EntityType::Landmark => "landmark",
            EntityType::Block => "block",
            EntityType::Box => "box",
            EntityType::Door => "door",
        }
    }

    /// Display color used when no explicit override is set.
    #[must_use]
    pub const fn default_color(&self) -> Color {
        match self {
            EntityType::Wall => [0.45, 0.45, 0.45],
            EntityType::Landmark => [0.95, 0.85, 0.2],
            EntityType::Block => [0.55, 0.35, 0.15],
            EntityType::Box => [0.75, 0.55, 0.25],
            EntityType::Door => [0.7, 0.15, 0.15],
        }
    }

    /// Vertical extent applied when a shape arrives without one.
    #[must_use]
    pub const fn default_z_len(&self) -> f64 {
        match self {
            EntityType::Wall => 2.5,
            EntityType::Landmark => 0.05,
            EntityType::Block => 0.5,
            EntityType::Box => 0.5,
            EntityType::Door => 2.0,
        }
    }

    /// Pushability applied when a shape arrives without one.
    #[must_use]
    pub const fn default_pushability(&self) -> Pushability {
        match self {
            EntityType::Wall | EntityType::Landmark => Pushability::Fixed,
            EntityType::Block | EntityType::Box => Pushability::WhenClear,
            EntityType::Door => Pushability::Door,
        }
    }
}

/// Variant payload for an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Wall,
    Landmark,
    Block,
    /// A container. `contents` holds the ordered keys of entities directly
    /// inside; the reverse parent table mirrors it.
    Box { open: bool, contents: Vec<EntityKey> },
    Door(DoorState),
}

/// A simulated world object: identity, type variant, display data, and a
/// shape. Geometry changes replace the shape; the entity itself is stable so
/// identity survives geometry updates.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    name: Option<String>,
    kind: EntityKind,
    color: Option<Color>,
    laser_visible: bool,
    shape: Shape,
}

impl Entity {
    /// Wire-level identity.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// Optional display name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Variant payload.
    #[must_use]
    pub const fn kind(&self) -> &EntityKind {
        &self.kind
    }

    /// Type tag of the variant.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self.kind {
            EntityKind::Wall => EntityType::Wall,
            EntityKind::Landmark => EntityType::Landmark,
            EntityKind::Block => EntityType::Block,
            EntityKind::Box { .. } => EntityType::Box,
            EntityKind::Door(_) => EntityType::Door,
        }
    }

    /// Effective display color: explicit override or the type default.
    #[must_use]
    pub fn color(&self) -> Color {
        self.color.unwrap_or_else(|| self.entity_type().default_color())
    }

    /// Whether laser beams can hit this entity.
    #[must_use]
    pub const fn laser_visible(&self) -> bool {
        self.laser_visible
    }

    /// Current shape.
    #[must_use]
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Whether this entity can contain others.
    #[must_use]
    pub const fn is_container(&self) -> bool {
        matches!(self.kind, EntityKind::Box { .. })
    }

    /// Door state, when this entity is a door.
    #[must_use]
    pub const fn door(&self) -> Option<&DoorState> {
        match &self.kind {
            EntityKind::Door(door) => Some(door),
            _ => None,
        }
    }

    /// Open flag, when this entity is a box.
    #[must_use]
    pub const fn box_open(&self) -> Option<bool> {
        match self.kind {
            EntityKind::Box { open, .. } => Some(open),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Fully-resolved wire form of a shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShapeSpec {
    pub points: Vec<(f64, f64)>,
    pub z: f64,
    pub z_len: Option<f64>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub pushability: Option<Pushability>,
}

impl ShapeSpec {
    /// Snapshot a live shape.
    #[must_use]
    pub fn from_shape(shape: &Shape) -> Self {
        Self {
            points: shape.points().iter().map(|p| (p.x, p.y)).collect(),
            z: shape.z(),
            z_len: shape.z_len(),
            actions: shape.actions().to_vec(),
            pushability: Some(shape.pushability()),
        }
    }

    /// Materialize a shape, filling a missing z extent and pushability from
    /// the given defaults.
    pub fn to_shape(
        &self,
        default_z_len: f64,
        default_pushability: Pushability,
    ) -> Result<Shape, WorldError> {
        let points: Vec<Point> = self.points.iter().map(|&(x, y)| Point::new(x, y)).collect();
        let z_len = Some(self.z_len.unwrap_or(default_z_len));
        let shape = Shape::new(&points, self.z, z_len)?
            .with_actions(self.actions.clone())
            .with_pushability(self.pushability.unwrap_or(default_pushability));
        Ok(shape)
    }
}

/// Wire form of a door's kinematic parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoorSpec {
    pub pivot: (f64, f64),
    pub closed_angle: f64,
    pub pivot_angle: f64,
    pub width: f64,
    pub thickness: f64,
    #[serde(default)]
    pub open_fraction: f64,
}

/// Fully-resolved wire form of an entity, including nested box contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpec {
    pub id: EntityId,
    #[serde(default)]
    pub name: Option<String>,
    pub entity_type: EntityType,
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default = "default_laser_visible")]
    pub laser_visible: bool,
    pub shape: ShapeSpec,
    #[serde(default)]
    pub door: Option<DoorSpec>,
    #[serde(default)]
    pub open: Option<bool>,
    #[serde(default)]
    pub contents: Vec<EntitySpec>,
}

const fn default_laser_visible() -> bool {
    true
}

/// Wire-level parent reference for insertions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParentRef {
    /// Directly inside the world.
    Root,
    /// Held by this instance's robot.
    Carried,
    /// Inside a container entity.
    Inside(EntityId),
}

/// Startup placement handed to a newly joining actor: where it starts and
/// what it is considered to be carrying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartPlacement {
    pub location: (f64, f64),
    pub heading: f64,
    #[serde(default)]
    pub carried: Vec<EntitySpec>,
}

/// Commands crossing the core boundary.
///
/// Requests (`OpenDoor`, `CloseDoor`, `ToggleBox`, `Translate`, `Rotate`,
/// `Scale`) are
/// issued by behavior or GUI layers; resolved updates (`ReplaceShape`,
/// `DoorUpdate`, `RobotPose`, `UpsertEntity`, `RemoveEntity`) are what the
/// authoritative environment emits for replication. Updates always describe a
/// fully-resolved post-state and must be applied in emission order, so a
/// late-joining peer can resynchronize by replaying the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorldCommand {
    UpsertEntity { spec: EntitySpec, parent: ParentRef },
    RemoveEntity { id: EntityId },
    ReplaceShape { id: EntityId, shape: ShapeSpec },
    DoorUpdate {
        id: EntityId,
        open_fraction: f64,
        status: DoorStatus,
        shape: ShapeSpec,
    },
    RobotPose { name: String, shape: ShapeSpec },
    OpenDoor { id: EntityId },
    CloseDoor { id: EntityId },
    ToggleBox { id: EntityId },
    Translate { id: EntityId, dx: f64, dy: f64, dz: f64 },
    Rotate { id: EntityId, theta: f64, around: (f64, f64) },
    Scale { id: EntityId, sx: f64, sy: f64, around: (f64, f64) },
}

/// Initial state snapshot handed to a newly joining process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WelcomePackage {
    pub tick: Tick,
    pub world_width: f64,
    pub world_height: f64,
    pub entities: Vec<EntitySpec>,
    pub peers: Vec<(String, ShapeSpec)>,
    pub placement: Option<StartPlacement>,
}

// ---------------------------------------------------------------------------
// Export tree
// ---------------------------------------------------------------------------

/// Abstract serialization node: tag, attributes, children. The external
/// exporter turns this into markup; the core never touches files.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportNode {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<ExportNode>,
}

impl ExportNode {
    /// Construct an empty node with the given tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    fn attr(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.attributes.push((key.to_string(), value.to_string()));
        self
    }
}

impl Shape {
    /// Export this shape: rectangles compactly, other polygons as explicit
    /// point lists.
    #[must_use]
    pub fn export_node(&self) -> ExportNode {
        let mut node = if self.is_rectangle() {
            let b = self.bounds();
            ExportNode::new("rect")
                .attr("x", b.min.x)
                .attr("y", b.min.y)
                .attr("width", b.max.x - b.min.x)
                .attr("height", b.max.y - b.min.y)
        } else {
            let mut node = ExportNode::new("polygon");
            for p in self.points() {
                node.children
                    .push(ExportNode::new("point").attr("x", p.x).attr("y", p.y));
            }
            node
        };
        node = node.attr("z", self.z());
        if let Some(len) = self.z_len() {
            node = node.attr("z-len", len);
        }
        node
    }
}

// ---------------------------------------------------------------------------
// Laser perception
// ---------------------------------------------------------------------------

/// Static laser-rangefinder parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaserConfig {
    /// Number of beams across the field of view.
    pub beams: usize,
    /// Angular span of the fan, in radians, centered on the mount bearing.
    pub fov: f64,
    /// Reported distance when a beam hits nothing, and the cast limit.
    pub max_range: f64,
    /// Mount offset forward of the robot center, along its heading.
    pub mount_forward: f64,
    /// Mount orientation relative to the robot heading.
    pub mount_bearing: f64,
    /// Mount height; only shapes whose vertical extent spans this height are
    /// visible to the beams.
    pub mount_height: f64,
    /// Number of angular sectors derived from the beam fan.
    pub sector_count: usize,
    /// A sector is unsafe when any of its beams reads below this.
    pub critical_distance: f64,
    /// A safe sector is open when its summed distances exceed this.
    pub min_open_sum: f64,
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            beams: 15,
            fov: std::f64::consts::PI,
            max_range: 8.0,
            mount_forward: 0.3,
            mount_bearing: 0.0,
            mount_height: 0.3,
            sector_count: 3,
            critical_distance: 0.5,
            min_open_sum: 10.0,
        }
    }
}

/// Derived safety flags for one angular sector of the beam fan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectorReading {
    /// No beam in the sector reads below the critical distance.
    pub safe: bool,
    /// Safe, and the summed distances exceed the minimum-open threshold.
    pub open: bool,
}

/// One refresh of the robot's laser: per-beam distances and endpoints plus
/// derived sector flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaserScan {
    pub distances: Vec<f64>,
    pub endpoints: Vec<(f64, f64)>,
    pub sectors: Vec<SectorReading>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static configuration for a world-model instance. The core performs no
/// file I/O; the external configuration loader fills this in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldConfig {
    /// World width in world units.
    pub width: f64,
    /// World height in world units.
    pub height: f64,
    /// Simulated duration of one tick.
    pub tick_seconds: f64,
    /// Time a door takes to travel from closed to fully open.
    pub door_open_seconds: f64,
    /// Radius of the robot's body polygon.
    pub robot_radius: f64,
    /// Vertex count of the robot's body polygon.
    pub robot_sides: usize,
    /// Vertical extent of the robot body.
    pub robot_z_len: f64,
    /// Laser rangefinder parameters.
    pub laser: LaserConfig,
    /// Startup placements for joining actors, keyed by robot name.
    #[serde(default)]
    pub placements: HashMap<String, StartPlacement>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 20.0,
            height: 20.0,
            tick_seconds: 0.1,
            door_open_seconds: 2.0,
            robot_radius: 0.4,
            robot_sides: 12,
            robot_z_len: 0.5,
            laser: LaserConfig::default(),
            placements: HashMap::new(),
        }
    }
}

impl WorldConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.width > 0.0) || !(self.height > 0.0) {
            return Err(WorldError::InvalidConfig(
                "world dimensions must be positive",
            ));
        }
        if !(self.tick_seconds > 0.0) {
            return Err(WorldError::InvalidConfig("tick_seconds must be positive"));
        }
        if !(self.door_open_seconds > 0.0) {
            return Err(WorldError::InvalidConfig(
                "door_open_seconds must be positive",
            ));
        }
        if !(self.robot_radius > 0.0) || self.robot_sides < 3 {
            return Err(WorldError::InvalidConfig(
                "robot body needs a positive radius and at least three sides",
            ));
        }
        if !(self.robot_z_len > 0.0) {
            return Err(WorldError::InvalidConfig("robot_z_len must be positive"));
        }
        let laser = &self.laser;
        if laser.beams == 0 || laser.sector_count == 0 || laser.sector_count > laser.beams {
            return Err(WorldError::InvalidConfig(
                "laser needs at least one beam and sectors no finer than beams",
            ));
        }
        if !(laser.max_range > 0.0) || !(laser.fov > 0.0) {
            return Err(WorldError::InvalidConfig(
                "laser range and field of view must be positive",
            ));
        }
        if laser.critical_distance < 0.0 || laser.min_open_sum < 0.0 {
            return Err(WorldError::InvalidConfig(
                "laser thresholds must be non-negative",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Robot
// ---------------------------------------------------------------------------

/// Per-tick motion intent set by the behavior layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Drive {
    /// Linear speed, world units per second, along the heading.
    pub speed: f64,
    /// Angular rate, radians per second.
    pub turn_rate: f64,
}

/// The robot owned by this instance.
#[derive(Debug, Clone)]
pub struct Robot {
    name: String,
    location: Point,
    heading: f64,
    shape: Shape,
    drive: Drive,
    scan: Option<LaserScan>,
}

impl Robot {
    /// Robot name, used for pushability attribution and peer maps.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current location.
    #[must_use]
    pub const fn location(&self) -> Point {
        self.location
    }

    /// Current heading in radians.
    #[must_use]
    pub const fn heading(&self) -> f64 {
        self.heading
    }

    /// Current body shape in world coordinates.
    #[must_use]
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Most recent laser scan, if the last refresh succeeded.
    #[must_use]
    pub const fn scan(&self) -> Option<&LaserScan> {
        self.scan.as_ref()
    }
}

/// Displacement produced by one robot motion step.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Displacement {
    dx: f64,
    dy: f64,
    dtheta: f64,
}

/// Reverse parent reference for an entity in the containment tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// Directly inside the world root holder.
    Root,
    /// Held by this instance's robot.
    Carried,
    /// Inside a container entity.
    Inside(EntityKey),
}

/// Something a door leaf can collide with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CollisionRef {
    Entity(EntityKey),
    OwnRobot,
    Peer(String),
}

/// Events emitted by one world tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickEvents {
    /// The tick these events belong to.
    pub tick: Tick,
    /// Whether the robot self-moved; hosts use this to decide whether to
    /// rebroadcast the robot pose.
    pub robot_moved: bool,
    /// Outbound replication commands, in emission order.
    pub commands: Vec<WorldCommand>,
    /// Doors whose move was rejected this tick.
    pub jams: Vec<EntityId>,
    /// Messages surfaced by triggered notify actions.
    pub notices: Vec<String>,
}

// ---------------------------------------------------------------------------
// World model
// ---------------------------------------------------------------------------

/// The shared world model: boundary, entity arena, containment holders,
/// robot, and peer shapes.
///
/// One thread advances ticks sequentially; asynchronous command/query paths
/// may concurrently announce arrivals (staged in the guestbook, absorbed at
/// the next tick start) and update the peer map. Everything else requires
/// `&mut`.
pub struct WorldModel {
    config: WorldConfig,
    owner: Owner,
    tick: Tick,
    boundary: Shape,
    entities: SlotMap<EntityKey, Entity>,
    by_id: HashMap<EntityId, EntityKey>,
    parents: SecondaryMap<EntityKey, Parent>,
    root: Vec<EntityKey>,
    carried: Vec<EntityKey>,
    robot: Option<Robot>,
    peers: RwLock<HashMap<String, Shape>>,
    guestbook: Mutex<Vec<(EntitySpec, ParentRef)>>,
}

impl fmt::Debug for WorldModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldModel")
            .field("owner", &self.owner)
            .field("tick", &self.tick)
            .field("entity_count", &self.entities.len())
            .field("has_robot", &self.robot.is_some())
            .finish()
    }
}

impl WorldModel {
    /// Instantiate a world: validates the configuration and builds the four
    /// boundary walls (ids 1-4) from the world rectangle's perimeter.
    /// Configuration loaders are expected to number their entities above 4.
    pub fn new(config: WorldConfig, owner: Owner) -> Result<Self, WorldError> {
        config.validate()?;
        let boundary = Shape::rectangle(
            Point::new(config.width * 0.5, config.height * 0.5),
            config.width,
            config.height,
            0.0,
            Some(EntityType::Wall.default_z_len()),
        )?;
        let mut world = Self {
            config,
            owner,
            tick: Tick::zero(),
            boundary: boundary.clone(),
            entities: SlotMap::with_key(),
            by_id: HashMap::new(),
            parents: SecondaryMap::new(),
            root: Vec::new(),
            carried: Vec::new(),
            robot: None,
            peers: RwLock::new(HashMap::new()),
            guestbook: Mutex::new(Vec::new()),
        };
        for (index, wall_shape) in boundary.perimeter_shapes().into_iter().enumerate() {
            let entity = Entity {
                id: EntityId(index as u64 + 1),
                name: None,
                kind: EntityKind::Wall,
                color: None,
                laser_visible: true,
                shape: wall_shape,
            };
            world.insert_entity(entity, Parent::Root)?;
        }
        Ok(world)
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Which role this instance plays.
    #[must_use]
    pub const fn owner(&self) -> Owner {
        self.owner
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick_count(&self) -> Tick {
        self.tick
    }

    /// The world boundary rectangle.
    #[must_use]
    pub fn boundary(&self) -> &Shape {
        &self.boundary
    }

    /// This instance's robot, if it owns one.
    #[must_use]
    pub const fn robot(&self) -> Option<&Robot> {
        self.robot.as_ref()
    }

    /// Number of entities in the arena (including boundary walls).
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Resolve a wire id to an arena key. Absence is a normal outcome.
    #[must_use]
    pub fn find(&self, id: EntityId) -> Option<EntityKey> {
        self.by_id.get(&id).copied()
    }

    /// Borrow an entity by key.
    #[must_use]
    pub fn entity(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    /// Parent reference of an entity.
    #[must_use]
    pub fn parent_of(&self, key: EntityKey) -> Option<Parent> {
        self.parents.get(key).copied()
    }

    /// Ordered keys of the world root holder.
    #[must_use]
    pub fn root_keys(&self) -> &[EntityKey] {
        &self.root
    }

    /// Ordered keys of the items currently carried by the robot.
    #[must_use]
    pub fn carried_keys(&self) -> &[EntityKey] {
        &self.carried
    }

    /// Depth-first traversal of all entities, root holder first, then the
    /// carried holder, containers before their contents. This is the
    /// deterministic per-tick iteration order.
    #[must_use]
    pub fn ordered_keys(&self) -> Vec<EntityKey> {
        let mut keys = Vec::with_capacity(self.entities.len());
        for &key in self.root.iter().chain(self.carried.iter()) {
            self.collect_subtree(key, &mut keys);
        }
        keys
    }

    fn collect_subtree(&self, key: EntityKey, out: &mut Vec<EntityKey>) {
        out.push(key);
        if let Some(entity) = self.entities.get(key) {
            if let EntityKind::Box { contents, .. } = &entity.kind {
                for &child in contents {
                    self.collect_subtree(child, out);
                }
            }
        }
    }

    /// Whether an entity is carried by the robot, directly or nested inside
    /// a carried container.
    #[must_use]
    pub fn is_carried(&self, key: EntityKey) -> bool {
        let mut current = key;
        loop {
            match self.parents.get(current) {
                Some(Parent::Carried) => return true,
                Some(Parent::Inside(parent)) => current = *parent,
                _ => return false,
            }
        }
    }

    /// Detach `key` from the holder list of `parent`.
    fn holder_detach(&mut self, parent: Parent, key: EntityKey) {
        match parent {
            Parent::Root => self.root.retain(|&k| k != key),
            Parent::Carried => self.carried.retain(|&k| k != key),
            Parent::Inside(container) => {
                if let Some(entity) = self.entities.get_mut(container) {
                    if let EntityKind::Box { contents, .. } = &mut entity.kind {
                        contents.retain(|&k| k != key);
                        return;
                    }
                }
                warn!("container missing while detaching an entity; holder inconsistency");
            }
        }
    }

    /// Attach `key` to the holder list of `parent`, falling back to the root
    /// holder when the container is gone. Returns the holder actually used.
    fn holder_attach(&mut self, parent: Parent, key: EntityKey) -> Parent {
        match parent {
            Parent::Root => {
                self.root.push(key);
                Parent::Root
            }
            Parent::Carried => {
                self.carried.push(key);
                Parent::Carried
            }
            Parent::Inside(container) => {
                if let Some(entity) = self.entities.get_mut(container) {
                    if let EntityKind::Box { contents, .. } = &mut entity.kind {
                        contents.push(key);
                        return Parent::Inside(container);
                    }
                }
                warn!("container missing while attaching an entity; placing at root");
                self.root.push(key);
                Parent::Root
            }
        }
    }

    /// Insert a fully-built entity into a holder. Duplicate ids are fatal:
    /// nothing is mutated before the check, so the index never corrupts.
    fn insert_entity(&mut self, mut entity: Entity, parent: Parent) -> Result<EntityKey, WorldError> {
        if self.by_id.contains_key(&entity.id) {
            return Err(WorldError::DuplicateId(entity.id));
        }
        if let Parent::Inside(container) = parent {
            // A box repositions new contents to its own center.
            if let Some(holder) = self.entities.get(container) {
                let delta = holder.shape.center();
                let center = entity.shape.center();
                let map = Affine::translation(delta.x - center.x, delta.y - center.y);
                entity.shape.transform(&map);
                if let EntityKind::Door(door) = &mut entity.kind {
                    door.resync(&map);
                }
            }
        }
        let id = entity.id;
        let key = self.entities.insert(entity);
        self.by_id.insert(id, key);
        let parent = self.holder_attach(parent, key);
        self.parents.insert(key, parent);
        Ok(key)
    }

    /// Materialize and insert a wire-form entity (and, recursively, its
    /// contents) into the given holder.
    pub fn insert_spec(&mut self, spec: EntitySpec, parent: ParentRef) -> Result<EntityKey, WorldError> {
        let parent = self.resolve_parent(parent);
        let entity = self.build_entity(&spec)?;
        let key = self.insert_entity(entity, parent)?;
        for child in spec.contents {
            self.insert_spec(child, ParentRef::Inside(spec.id))?;
        }
        Ok(key)
    }

    fn resolve_parent(&self, parent: ParentRef) -> Parent {
        match parent {
            ParentRef::Root => Parent::Root,
            ParentRef::Carried => Parent::Carried,
            ParentRef::Inside(id) => match self.find(id) {
                Some(key) => Parent::Inside(key),
                None => {
                    warn!(container = %id, "unknown container in insertion; placing at root");
                    Parent::Root
                }
            },
        }
    }

    fn build_entity(&self, spec: &EntitySpec) -> Result<Entity, WorldError> {
        let entity_type = spec.entity_type;
        let shape = spec.shape.to_shape(
            entity_type.default_z_len(),
            entity_type.default_pushability(),
        )?;
        let kind = match entity_type {
            EntityType::Wall => EntityKind::Wall,
            EntityType::Landmark => EntityKind::Landmark,
            EntityType::Block => EntityKind::Block,
            EntityType::Box => EntityKind::Box {
                open: spec.open.unwrap_or(false),
                contents: Vec::new(),
            },
            EntityType::Door => {
                let door_spec = spec
                    .door
                    .as_ref()
                    .ok_or(WorldError::InvalidCommand("door entity without door parameters"))?;
                let mut door = DoorState::new(
                    Point::new(door_spec.pivot.0, door_spec.pivot.1),
                    door_spec.closed_angle,
                    door_spec.pivot_angle,
                    door_spec.width,
                    door_spec.thickness,
                )?;
                if !(0.0..=1.0).contains(&door_spec.open_fraction) {
                    return Err(WorldError::InvalidCommand(
                        "door open fraction must be within [0, 1]",
                    ));
                }
                door.open_fraction = door_spec.open_fraction;
                door.push_to_open = shape.actions().iter().any(
                    |action| matches!(action, Action::OpenDoor { door } if *door == spec.id),
                );
                EntityKind::Door(door)
            }
        };
        // Doors regenerate their leaf from the kinematic parameters so the
        // shape and the state can never disagree at construction.
        let shape = if let EntityKind::Door(door) = &kind {
            let mut leaf = door.leaf_at(door.open_fraction, shape.z(), shape.z_len());
            leaf.actions = shape.actions.clone();
            leaf.pushability = shape.pushability();
            leaf
        } else {
            shape
        };
        Ok(Entity {
            id: spec.id,
            name: spec.name.clone(),
            kind,
            color: spec.color,
            laser_visible: spec.laser_visible,
            shape,
        })
    }

    /// Remove an entity (and, recursively, its contents) by wire id.
    ///
    /// Removing an id that is absent is reported as a holder inconsistency
    /// but does not halt the tick.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let Some(key) = self.find(id) else {
            warn!(entity = %id, "removal of unknown entity; holder inconsistency");
            return None;
        };
        self.remove_key(key)
    }

    fn remove_key(&mut self, key: EntityKey) -> Option<Entity> {
        // Contents go first, while the container is still in the arena so
        // their holder cleanup can see it.
        let children: Vec<EntityKey> = match self.entities.get(key) {
            Some(Entity {
                kind: EntityKind::Box { contents, .. },
                ..
            }) => contents.clone(),
            Some(_) => Vec::new(),
            None => {
                warn!("removal of a stale entity key; holder inconsistency");
                return None;
            }
        };
        for child in children {
            self.remove_key(child);
        }
        if let Some(parent) = self.parents.get(key).copied() {
            self.holder_detach(parent, key);
        }
        let entity = self.entities.remove(key)?;
        self.by_id.remove(&entity.id);
        self.parents.remove(key);
        Some(entity)
    }
}

// ---------------------------------------------------------------------------
// Object mover
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Translate an entity and, recursively, everything it contains by the
    /// same offset. Returns the touched keys **outermost-first**: the
    /// replication protocol must replace parents before children.
    pub fn translate_entity(
        &mut self,
        key: EntityKey,
        dx: f64,
        dy: f64,
        dz: f64,
    ) -> Result<Vec<EntityKey>, WorldError> {
        if !dx.is_finite() || !dy.is_finite() || !dz.is_finite() {
            return Err(WorldError::InvalidCommand("movement offset must be finite"));
        }
        let mut touched = Vec::new();
        self.apply_translation(key, dx, dy, dz, &mut touched);
        Ok(touched)
    }

    fn apply_translation(
        &mut self,
        key: EntityKey,
        dx: f64,
        dy: f64,
        dz: f64,
        touched: &mut Vec<EntityKey>,
    ) {
        let map = Affine::translation(dx, dy);
        let children = {
            let Some(entity) = self.entities.get_mut(key) else {
                warn!("translation of a stale entity key; holder inconsistency");
                return;
            };
            entity.shape.transform(&map);
            entity.shape.z += dz;
            if let EntityKind::Door(door) = &mut entity.kind {
                door.resync(&map);
            }
            match &entity.kind {
                EntityKind::Box { contents, .. } => contents.clone(),
                _ => Vec::new(),
            }
        };
        touched.push(key);
        for child in children {
            self.apply_translation(child, dx, dy, dz, touched);
        }
    }

    /// Rotate an entity by `theta` about `around`; contents rotate rigidly
    /// about the entity's own center, recursively. Returns the touched keys
    /// outermost-first.
    pub fn rotate_entity(
        &mut self,
        key: EntityKey,
        theta: f64,
        around: Point,
    ) -> Result<Vec<EntityKey>, WorldError> {
        if !theta.is_finite() || !around.is_finite() {
            return Err(WorldError::InvalidCommand("rotation must be finite"));
        }
        let mut touched = Vec::new();
        self.apply_rotation(key, theta, around, &mut touched);
        Ok(touched)
    }

    fn apply_rotation(
        &mut self,
        key: EntityKey,
        theta: f64,
        around: Point,
        touched: &mut Vec<EntityKey>,
    ) {
        let map = Affine::rotation(theta, around);
        let (center, children) = {
            let Some(entity) = self.entities.get_mut(key) else {
                warn!("rotation of a stale entity key; holder inconsistency");
                return;
            };
            entity.shape.transform(&map);
            if let EntityKind::Door(door) = &mut entity.kind {
                door.resync(&map);
            }
            let children = match &entity.kind {
                EntityKind::Box { contents, .. } => contents.clone(),
                _ => Vec::new(),
            };
            (entity.shape.center(), children)
        };
        touched.push(key);
        for child in children {
            self.apply_rotation(child, theta, center, touched);
        }
    }

    /// Scale an entity (and contents, rigidly) about `around`. Returns the
    /// touched keys outermost-first.
    pub fn scale_entity(
        &mut self,
        key: EntityKey,
        sx: f64,
        sy: f64,
        around: Point,
    ) -> Result<Vec<EntityKey>, WorldError> {
        if !sx.is_finite() || !sy.is_finite() || !around.is_finite() || sx == 0.0 || sy == 0.0 {
            return Err(WorldError::InvalidCommand(
                "scale factors must be finite and non-zero",
            ));
        }
        let map = Affine::scaling(sx, sy, around);
        let mut touched = Vec::new();
        self.apply_map(key, &map, &mut touched);
        Ok(touched)
    }

    fn apply_map(&mut self, key: EntityKey, map: &Affine, touched: &mut Vec<EntityKey>) {
        let children = {
            let Some(entity) = self.entities.get_mut(key) else {
                warn!("transform of a stale entity key; holder inconsistency");
                return;
            };
            entity.shape.transform(map);
            if let EntityKind::Door(door) = &mut entity.kind {
                door.resync(map);
            }
            match &entity.kind {
                EntityKind::Box { contents, .. } => contents.clone(),
                _ => Vec::new(),
            }
        };
        touched.push(key);
        for child in children {
            self.apply_map(child, map, touched);
        }
    }

    fn replace_shape_commands(&self, touched: &[EntityKey]) -> Vec<WorldCommand> {
        touched
            .iter()
            .filter_map(|&key| self.entities.get(key))
            .map(|entity| WorldCommand::ReplaceShape {
                id: entity.id,
                shape: ShapeSpec::from_shape(&entity.shape),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Pushability resolution
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Whether `key` may be displaced by `(dx, dy)` when pushed by
    /// `robot_name`. Evaluated before a move is committed; never mutates
    /// world state.
    #[must_use]
    pub fn is_pushable(&self, key: EntityKey, dx: f64, dy: f64, robot_name: &str) -> bool {
        let Some(entity) = self.entities.get(key) else {
            return false;
        };
        match entity.shape.pushability() {
            Pushability::Fixed => false,
            Pushability::Door => {
                matches!(&entity.kind, EntityKind::Door(door) if door.push_to_open())
            }
            Pushability::WhenClear => self.push_stays_clear(key, &entity.shape, dx, dy, robot_name),
        }
    }

    /// Static classification: can this entity ever be displaced, regardless
    /// of current state? Presentation code uses this to distinguish
    /// "immovable" from "jammed".
    #[must_use]
    pub fn is_hypothetically_pushable(&self, key: EntityKey) -> bool {
        self.entities
            .get(key)
            .is_some_and(|entity| entity.shape.pushability().ever_pushable())
    }

    /// Hypothetically apply the offset and accept only when no overlap
    /// appears that did not already exist at the original pose, so an object
    /// already pressed against something is not falsely blocked.
    fn push_stays_clear(
        &self,
        key: EntityKey,
        shape: &Shape,
        dx: f64,
        dy: f64,
        _robot_name: &str,
    ) -> bool {
        let moved = shape.translated(dx, dy);
        for (other_key, other) in &self.entities {
            if other_key == key || self.is_carried(other_key) {
                continue;
            }
            if other.shape.intersects(&moved) && !other.shape.intersects(shape) {
                return false;
            }
        }
        if let Some(robot) = &self.robot {
            if robot.shape.intersects(&moved) && !robot.shape.intersects(shape) {
                return false;
            }
        }
        if let Ok(peers) = self.peers.read() {
            for peer in peers.values() {
                if peer.intersects(&moved) && !peer.intersects(shape) {
                    return false;
                }
            }
        }
        true
    }

    /// Tooltip label for an entity, probing pushability with `probe` as the
    /// attempted offset.
    #[must_use]
    pub fn tooltip(&self, key: EntityKey, probe: (f64, f64)) -> Option<String> {
        let entity = self.entities.get(key)?;
        let label = if !entity.shape.pushability().ever_pushable() {
            "immovable"
        } else {
            let robot_name = self.robot.as_ref().map(Robot::name).unwrap_or("");
            if self.is_pushable(key, probe.0, probe.1, robot_name) {
                "pushable"
            } else {
                "jammed"
            }
        };
        let display = entity.name.as_deref().unwrap_or(entity.entity_type().tag());
        Some(format!("{display} #{} ({label})", entity.id))
    }
}

// ---------------------------------------------------------------------------
// Door ticking
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Command a door to open, close, or hold. Unknown ids are reported and
    /// ignored.
    pub fn set_door_status(&mut self, id: EntityId, status: DoorStatus) {
        let Some(key) = self.find(id) else {
            warn!(door = %id, "door command for unknown entity");
            return;
        };
        if let Some(entity) = self.entities.get_mut(key) {
            if let EntityKind::Door(door) = &mut entity.kind {
                door.set_status(status);
            }
        }
    }

    /// Everything the door leaf can collide with: the own robot, peer
    /// robots, and world entities except walls, landmarks, and doors.
    fn door_collisions(&self, door_key: EntityKey, leaf: &Shape) -> HashSet<CollisionRef> {
        let mut set = HashSet::new();
        for (key, entity) in &self.entities {
            if key == door_key {
                continue;
            }
            if matches!(
                entity.entity_type(),
                EntityType::Wall | EntityType::Landmark | EntityType::Door
            ) {
                continue;
            }
            if entity.shape.intersects(leaf) {
                set.insert(CollisionRef::Entity(key));
            }
        }
        if let Some(robot) = &self.robot {
            if robot.shape.intersects(leaf) {
                set.insert(CollisionRef::OwnRobot);
            }
        }
        if let Ok(peers) = self.peers.read() {
            for (name, shape) in peers.iter() {
                if shape.intersects(leaf) {
                    set.insert(CollisionRef::Peer(name.clone()));
                }
            }
        }
        set
    }

    /// Doors advance only on the authoritative environment; actors and
    /// viewers converge through replicated [`WorldCommand::DoorUpdate`]s.
    fn stage_doors(&mut self, events: &mut TickEvents) {
        if self.owner != Owner::Environment {
            return;
        }
        for key in self.ordered_keys() {
            if matches!(
                self.entities.get(key),
                Some(Entity {
                    kind: EntityKind::Door(_),
                    ..
                })
            ) {
                self.tick_door(key, events);
            }
        }
    }

    fn tick_door(&mut self, key: EntityKey, events: &mut TickEvents) {
        let (id, mut door, current_shape) = {
            let Some(entity) = self.entities.get(key) else {
                return;
            };
            let EntityKind::Door(door) = &entity.kind else {
                return;
            };
            (entity.id, door.clone(), entity.shape.clone())
        };

        // At a travel limit the door forcibly holds. The transition itself
        // must replicate, or followers would keep the door moving forever.
        let mut reached_limit = false;
        match door.status {
            DoorStatus::Opening if door.open_fraction >= 1.0 => {
                door.status = DoorStatus::Holding;
                reached_limit = true;
            }
            DoorStatus::Closing if door.open_fraction <= 0.0 => {
                door.status = DoorStatus::Holding;
                reached_limit = true;
            }
            _ => {}
        }
        if door.status == DoorStatus::Holding {
            self.write_door_state(key, &door);
            if reached_limit {
                events.commands.push(WorldCommand::DoorUpdate {
                    id,
                    open_fraction: door.open_fraction,
                    status: DoorStatus::Holding,
                    shape: ShapeSpec::from_shape(&current_shape),
                });
            }
            return;
        }

        let delta = self.config.tick_seconds / self.config.door_open_seconds;
        let step = if door.status == DoorStatus::Opening {
            delta
        } else {
            -delta
        };
        let next_fraction = (door.open_fraction + step).clamp(0.0, 1.0);
        let mut next_leaf = door.leaf_at(next_fraction, current_shape.z(), current_shape.z_len());
        next_leaf.actions = current_shape.actions.clone();
        next_leaf.pushability = current_shape.pushability();

        // Dual-snapshot rule: losing a collision (a robot that held the door
        // open moving away) is fine; gaining one is a jam.
        let before = self.door_collisions(key, &current_shape);
        let after = self.door_collisions(key, &next_leaf);
        if after.is_subset(&before) {
            door.open_fraction = next_fraction;
            let shape_spec = ShapeSpec::from_shape(&next_leaf);
            if let Some(entity) = self.entities.get_mut(key) {
                entity.shape = next_leaf;
            }
            self.write_door_state(key, &door);
            events.commands.push(WorldCommand::DoorUpdate {
                id,
                open_fraction: next_fraction,
                status: door.status,
                shape: shape_spec,
            });
        } else {
            warn!(door = %id, "door move rejected; obstruction holds the leaf");
            door.status = DoorStatus::Holding;
            self.write_door_state(key, &door);
            events.commands.push(WorldCommand::DoorUpdate {
                id,
                open_fraction: door.open_fraction,
                status: DoorStatus::Holding,
                shape: ShapeSpec::from_shape(&current_shape),
            });
            events.jams.push(id);
        }
    }

    fn write_door_state(&mut self, key: EntityKey, door: &DoorState) {
        if let Some(entity) = self.entities.get_mut(key) {
            if let EntityKind::Door(state) = &mut entity.kind {
                *state = door.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Robot management and motion
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Attach this instance's robot, replacing any previous one. The body is
    /// a regular polygon approximating a disc of the configured radius.
    pub fn attach_robot(
        &mut self,
        name: impl Into<String>,
        location: Point,
        heading: f64,
    ) -> Result<(), WorldError> {
        if !location.is_finite() || !heading.is_finite() {
            return Err(WorldError::InvalidCommand("robot pose must be finite"));
        }
        let shape = Shape::regular_polygon(
            location,
            self.config.robot_radius,
            self.config.robot_sides,
            0.0,
            Some(self.config.robot_z_len),
        )?;
        self.robot = Some(Robot {
            name: name.into(),
            location,
            heading,
            shape,
            drive: Drive::default(),
            scan: None,
        });
        Ok(())
    }

    /// Bootstrap this instance's robot from a startup placement: attach it
    /// at the configured pose and adopt the entities the placement says it
    /// is carrying.
    pub fn apply_placement(
        &mut self,
        name: impl Into<String>,
        placement: &StartPlacement,
    ) -> Result<(), WorldError> {
        self.attach_robot(
            name,
            Point::new(placement.location.0, placement.location.1),
            placement.heading,
        )?;
        for spec in &placement.carried {
            self.insert_spec(spec.clone(), ParentRef::Carried)?;
        }
        Ok(())
    }

    /// Set the robot's motion intent for subsequent ticks.
    pub fn set_drive(&mut self, drive: Drive) -> Result<(), WorldError> {
        if !drive.speed.is_finite() || !drive.turn_rate.is_finite() {
            return Err(WorldError::InvalidCommand("drive values must be finite"));
        }
        match &mut self.robot {
            Some(robot) => {
                robot.drive = drive;
                Ok(())
            }
            None => Err(WorldError::InvalidCommand("no robot attached")),
        }
    }

    /// Move a root entity into the robot's carried holder. Its geometry is
    /// left where it is; subsequent robot motion cascades to it.
    pub fn pick_up(&mut self, id: EntityId) -> Result<(), WorldError> {
        let key = self.find(id).ok_or(WorldError::UnknownEntity(id))?;
        let parent = self
            .parents
            .get(key)
            .copied()
            .ok_or(WorldError::UnknownEntity(id))?;
        if parent == Parent::Carried {
            return Ok(());
        }
        self.holder_detach(parent, key);
        let actual = self.holder_attach(Parent::Carried, key);
        self.parents.insert(key, actual);
        Ok(())
    }

    /// Release a carried entity back into the world root, leaving its
    /// geometry at its current pose.
    pub fn put_down(&mut self, id: EntityId) -> Result<(), WorldError> {
        let key = self.find(id).ok_or(WorldError::UnknownEntity(id))?;
        let parent = self
            .parents
            .get(key)
            .copied()
            .ok_or(WorldError::UnknownEntity(id))?;
        if parent == Parent::Root {
            return Ok(());
        }
        self.holder_detach(parent, key);
        let actual = self.holder_attach(Parent::Root, key);
        self.parents.insert(key, actual);
        Ok(())
    }

    /// One motion step: integrate the drive, test the candidate pose,
    /// resolve pushes, and commit or refuse atomically. Returns the applied
    /// displacement, or `None` when the robot did not move.
    fn stage_motion(&mut self, events: &mut TickEvents) -> Option<Displacement> {
        let (dx, dy, dtheta, current, candidate, name) = {
            let robot = self.robot.as_ref()?;
            let dt = self.config.tick_seconds;
            let dtheta = robot.drive.turn_rate * dt;
            let heading = robot.heading + dtheta;
            let dx = robot.drive.speed * dt * heading.cos();
            let dy = robot.drive.speed * dt * heading.sin();
            if dx.abs() < robosim_geom::EPSILON
                && dy.abs() < robosim_geom::EPSILON
                && dtheta.abs() < robosim_geom::EPSILON
            {
                return None;
            }
            let map = Affine::rotation(dtheta, robot.location).then(&Affine::translation(dx, dy));
            (
                dx,
                dy,
                dtheta,
                robot.shape.clone(),
                robot.shape.transformed(&map),
                robot.name.clone(),
            )
        };

        // Classify every freshly contacted obstacle: pushable ones queue a
        // push, anything else refuses the whole move.
        let mut pushes: Vec<EntityKey> = Vec::new();
        let mut door_pushes: Vec<EntityKey> = Vec::new();
        for key in self.ordered_keys() {
            if self.is_carried(key) {
                continue;
            }
            let Some(entity) = self.entities.get(key) else {
                continue;
            };
            if entity.shape.intersects(&candidate) && !entity.shape.intersects(&current) {
                if !self.is_pushable(key, dx, dy, &name) {
                    debug!(entity = %entity.id, "move refused by obstacle");
                    return None;
                }
                if matches!(&entity.kind, EntityKind::Door(door) if door.push_to_open()) {
                    door_pushes.push(key);
                } else {
                    pushes.push(key);
                }
            }
        }
        if let Ok(peers) = self.peers.read() {
            for shape in peers.values() {
                if shape.intersects(&candidate) && !shape.intersects(&current) {
                    return None;
                }
            }
        }

        // Nothing commits until the candidate pose provably comes clear:
        // pushed obstacles are tested at their displaced pose, while a pushed
        // door leaf stays put until its kinematics advance, so the leaf
        // always blocks this tick.
        let mut clear = door_pushes.is_empty();
        if clear {
            for &key in &pushes {
                let Some(entity) = self.entities.get(key) else {
                    continue;
                };
                if entity.shape.translated(dx, dy).intersects(&candidate) {
                    clear = false;
                    break;
                }
            }
        }

        // A push against a door commits its status change even when the
        // robot stays put: the push is what starts the leaf moving.
        for key in door_pushes {
            if let Some(entity) = self.entities.get_mut(key) {
                if let EntityKind::Door(door) = &mut entity.kind {
                    door.set_status(DoorStatus::Opening);
                }
            }
        }
        if !clear {
            return None;
        }

        for key in pushes {
            if let Ok(touched) = self.translate_entity(key, dx, dy, 0.0) {
                events.commands.extend(self.replace_shape_commands(&touched));
            }
        }

        let robot = self.robot.as_mut()?;
        robot.shape = candidate;
        robot.location = Point::new(robot.location.x + dx, robot.location.y + dy);
        robot.heading += dtheta;
        Some(Displacement { dx, dy, dtheta })
    }

    /// Cascade a committed robot displacement to carried entities: translate
    /// by the same offset, then rotate about the robot's post-move location.
    fn stage_carried(&mut self, d: Displacement, events: &mut TickEvents) -> Result<(), WorldError> {
        let Some(center) = self.robot.as_ref().map(Robot::location) else {
            return Ok(());
        };
        for key in self.carried.clone() {
            let touched = self.translate_entity(key, d.dx, d.dy, 0.0)?;
            if d.dtheta.abs() > robosim_geom::EPSILON {
                self.rotate_entity(key, d.dtheta, center)?;
            }
            events.commands.extend(self.replace_shape_commands(&touched));
        }
        Ok(())
    }

    /// Run trigger actions for every action-bearing shape the robot now
    /// overlaps. Only a self-move triggers actions; replicated peer motion
    /// does not.
    fn stage_actions(&mut self, events: &mut TickEvents) {
        let Some(robot_shape) = self.robot.as_ref().map(|r| r.shape.clone()) else {
            return;
        };
        let mut triggered: Vec<Action> = Vec::new();
        for key in self.ordered_keys() {
            if self.is_carried(key) {
                continue;
            }
            let Some(entity) = self.entities.get(key) else {
                continue;
            };
            if entity.shape.actions().is_empty() {
                continue;
            }
            if entity.shape.intersects(&robot_shape) {
                triggered.extend(entity.shape.actions().iter().cloned());
            }
        }
        for action in triggered {
            self.run_action(&action, events);
        }
    }

    fn run_action(&mut self, action: &Action, events: &mut TickEvents) {
        match action {
            Action::OpenDoor { door } => self.set_door_status(*door, DoorStatus::Opening),
            Action::CloseDoor { door } => self.set_door_status(*door, DoorStatus::Closing),
            Action::ToggleBox { target } => self.toggle_box(*target),
            Action::Notify { message } => events.notices.push(message.clone()),
        }
    }

    fn toggle_box(&mut self, id: EntityId) {
        let Some(key) = self.find(id) else {
            warn!(entity = %id, "box toggle for unknown entity");
            return;
        };
        if let Some(entity) = self.entities.get_mut(key) {
            if let EntityKind::Box { open, .. } = &mut entity.kind {
                *open = !*open;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Laser perception
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Refresh the robot's laser scan. A scan with any non-finite reading is
    /// discarded rather than cached, so behavior code never acts on garbage.
    fn stage_laser(&mut self) {
        let scan = match &self.robot {
            Some(robot) => self.scan_laser(robot),
            None => return,
        };
        let finite = scan.distances.iter().all(|d| d.is_finite());
        if let Some(robot) = self.robot.as_mut() {
            if finite {
                robot.scan = Some(scan);
            } else {
                warn!("laser scan produced non-finite readings; scan discarded");
                robot.scan = None;
            }
        }
    }

    fn scan_laser(&self, robot: &Robot) -> LaserScan {
        let cfg = &self.config.laser;
        let origin = Point::new(
            robot.location.x + cfg.mount_forward * robot.heading.cos(),
            robot.location.y + cfg.mount_forward * robot.heading.sin(),
        );
        let center = robot.heading + cfg.mount_bearing;

        // Candidate segments: laser-visible, non-carried entities whose
        // vertical extent spans the mount height, plus peer robots.
        let mut segments: Vec<Segment> = Vec::new();
        for key in self.ordered_keys() {
            if self.is_carried(key) {
                continue;
            }
            let Some(entity) = self.entities.get(key) else {
                continue;
            };
            if !entity.laser_visible || !entity.shape.spans_height(cfg.mount_height) {
                continue;
            }
            segments.extend_from_slice(entity.shape.segments());
        }
        if let Ok(peers) = self.peers.read() {
            for shape in peers.values() {
                if shape.spans_height(cfg.mount_height) {
                    segments.extend_from_slice(shape.segments());
                }
            }
        }

        let beams = cfg.beams;
        let readings: Vec<(f64, (f64, f64))> = (0..beams)
            .into_par_iter()
            .map(|i| {
                let offset = if beams == 1 {
                    0.0
                } else {
                    cfg.fov * (i as f64 / (beams as f64 - 1.0) - 0.5)
                };
                let angle = center + offset;
                let distance = segments
                    .iter()
                    .filter_map(|seg| ray_hit_distance(origin, angle, cfg.max_range, seg))
                    .min_by_key(|d| OrderedFloat(*d))
                    .unwrap_or(cfg.max_range);
                let endpoint = (
                    origin.x + distance * angle.cos(),
                    origin.y + distance * angle.sin(),
                );
                (distance, endpoint)
            })
            .collect();

        let distances: Vec<f64> = readings.iter().map(|r| r.0).collect();
        let endpoints: Vec<(f64, f64)> = readings.iter().map(|r| r.1).collect();
        let sectors = Self::derive_sectors(&distances, cfg);
        LaserScan {
            distances,
            endpoints,
            sectors,
        }
    }

    fn derive_sectors(distances: &[f64], cfg: &LaserConfig) -> Vec<SectorReading> {
        let per = (distances.len() / cfg.sector_count).max(1);
        (0..cfg.sector_count)
            .map(|s| {
                let start = (s * per).min(distances.len());
                let end = if s + 1 == cfg.sector_count {
                    distances.len()
                } else {
                    ((s + 1) * per).min(distances.len())
                };
                let slice = &distances[start..end];
                let safe = slice.iter().all(|d| *d >= cfg.critical_distance);
                let open = safe && slice.iter().sum::<f64>() > cfg.min_open_sum;
                SectorReading { safe, open }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Spatial and name queries
// ---------------------------------------------------------------------------

/// Relative position of a matched entity, from the robot's point of view.
#[derive(Debug, Clone, PartialEq)]
pub struct BearingReading {
    pub id: EntityId,
    /// Angle to the entity's center relative to the robot heading, wrapped
    /// to (-pi, pi].
    pub angle: f64,
    pub distance: f64,
}

/// Case-insensitive wildcard match; `*` spans any run of characters.
#[must_use]
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn wrap_angle(theta: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut wrapped = theta % two_pi;
    if wrapped <= -std::f64::consts::PI {
        wrapped += two_pi;
    } else if wrapped > std::f64::consts::PI {
        wrapped -= two_pi;
    }
    wrapped
}

impl WorldModel {
    fn shape_distance(shape: &Shape, point: Point) -> f64 {
        shape
            .segments()
            .iter()
            .map(|seg| OrderedFloat(seg.distance_to_point(point)))
            .min()
            .map_or(f64::INFINITY, OrderedFloat::into_inner)
    }

    fn matches(entity: &Entity, pattern: &str) -> bool {
        entity
            .name
            .as_deref()
            .is_some_and(|name| wildcard_match(pattern, name))
            || wildcard_match(pattern, entity.entity_type().tag())
    }

    /// The entity whose outline passes closest to `point`.
    #[must_use]
    pub fn nearest_entity(&self, point: Point) -> Option<EntityId> {
        let keys = self.ordered_keys();
        keys.iter()
            .filter_map(|&key| self.entities.get(key))
            .min_by_key(|entity| OrderedFloat(Self::shape_distance(&entity.shape, point)))
            .map(|entity| entity.id)
    }

    /// All entities whose name or type tag matches `pattern` and whose
    /// center is within `range` of the robot.
    #[must_use]
    pub fn find_matching_within(&self, pattern: &str, range: f64) -> Vec<EntityId> {
        let Some(location) = self.robot.as_ref().map(Robot::location) else {
            return Vec::new();
        };
        self.ordered_keys()
            .iter()
            .filter_map(|&key| self.entities.get(key))
            .filter(|entity| Self::matches(entity, pattern))
            .filter(|entity| entity.shape.center().distance(location) <= range)
            .map(|entity| entity.id)
            .collect()
    }

    /// First match in traversal order, if any.
    #[must_use]
    pub fn first_matching_within(&self, pattern: &str, range: f64) -> Option<EntityId> {
        self.find_matching_within(pattern, range).into_iter().next()
    }

    /// Relative angle and distance to every entity matching `pattern`.
    #[must_use]
    pub fn bearings_to_matching(&self, pattern: &str) -> Vec<BearingReading> {
        let Some(robot) = &self.robot else {
            return Vec::new();
        };
        self.ordered_keys()
            .iter()
            .filter_map(|&key| self.entities.get(key))
            .filter(|entity| Self::matches(entity, pattern))
            .map(|entity| {
                let center = entity.shape.center();
                BearingReading {
                    id: entity.id,
                    angle: wrap_angle(robot.location.bearing_to(center) - robot.heading),
                    distance: robot.location.distance(center),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Guestbook and peers
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Stage a newly joining entity from an asynchronous path. It is merged
    /// at the start of the next tick, so an in-progress tick never observes
    /// a half-registered entity.
    pub fn announce_arrival(&self, spec: EntitySpec, parent: ParentRef) {
        match self.guestbook.lock() {
            Ok(mut book) => book.push((spec, parent)),
            Err(_) => warn!("guestbook lock poisoned; arrival dropped"),
        }
    }

    fn stage_guestbook(&mut self) -> Result<(), WorldError> {
        let pending: Vec<(EntitySpec, ParentRef)> = match self.guestbook.lock() {
            Ok(mut book) => book.drain(..).collect(),
            Err(_) => {
                warn!("guestbook lock poisoned; merge skipped");
                Vec::new()
            }
        };
        for (spec, parent) in pending {
            self.insert_spec(spec, parent)?;
        }
        Ok(())
    }

    /// Record or refresh a peer robot's body shape.
    pub fn register_peer(&self, name: impl Into<String>, shape: Shape) {
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(name.into(), shape);
        }
    }

    /// Forget a departed peer.
    pub fn remove_peer(&self, name: &str) {
        if let Ok(mut peers) = self.peers.write() {
            if peers.remove(name).is_none() {
                warn!(peer = name, "removal of unknown peer");
            }
        }
    }

    /// Snapshot of the peer map, ordered by name for determinism.
    #[must_use]
    pub fn peer_shapes(&self) -> Vec<(String, Shape)> {
        let mut shapes: Vec<(String, Shape)> = match self.peers.read() {
            Ok(peers) => peers
                .iter()
                .map(|(name, shape)| (name.clone(), shape.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };
        shapes.sort_by(|a, b| a.0.cmp(&b.0));
        shapes
    }
}

// ---------------------------------------------------------------------------
// Command application
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Apply one inbound command, returning any resolved updates to
    /// replicate onward. Updates that reference an entity this instance does
    /// not know are logged and skipped, tolerating replication races around
    /// entity removal; malformed values are errors.
    pub fn apply_command(
        &mut self,
        command: WorldCommand,
    ) -> Result<Vec<WorldCommand>, WorldError> {
        debug!(?command, "applying world command");
        match command {
            WorldCommand::UpsertEntity { spec, parent } => {
                if self.find(spec.id).is_some() {
                    self.remove(spec.id);
                }
                self.insert_spec(spec, parent)?;
                Ok(Vec::new())
            }
            WorldCommand::RemoveEntity { id } => {
                self.remove(id);
                Ok(Vec::new())
            }
            WorldCommand::ReplaceShape { id, shape } => {
                let Some(key) = self.find(id) else {
                    warn!(entity = %id, "shape update for unknown entity");
                    return Ok(Vec::new());
                };
                let entity_type = match self.entities.get(key) {
                    Some(entity) => entity.entity_type(),
                    None => return Ok(Vec::new()),
                };
                let new_shape = shape.to_shape(
                    entity_type.default_z_len(),
                    entity_type.default_pushability(),
                )?;
                if let Some(entity) = self.entities.get_mut(key) {
                    entity.shape = new_shape;
                }
                Ok(Vec::new())
            }
            WorldCommand::DoorUpdate {
                id,
                open_fraction,
                status,
                shape,
            } => {
                if !(0.0..=1.0).contains(&open_fraction) {
                    return Err(WorldError::InvalidCommand(
                        "door open fraction must be within [0, 1]",
                    ));
                }
                let Some(key) = self.find(id) else {
                    warn!(door = %id, "door update for unknown entity");
                    return Ok(Vec::new());
                };
                let new_shape = shape.to_shape(
                    EntityType::Door.default_z_len(),
                    EntityType::Door.default_pushability(),
                )?;
                if let Some(entity) = self.entities.get_mut(key) {
                    entity.shape = new_shape;
                    if let EntityKind::Door(door) = &mut entity.kind {
                        door.open_fraction = open_fraction;
                        door.status = status;
                    }
                }
                Ok(Vec::new())
            }
            WorldCommand::RobotPose { name, shape } => {
                let shape = shape.to_shape(self.config.robot_z_len, Pushability::Fixed)?;
                self.register_peer(name, shape);
                Ok(Vec::new())
            }
            WorldCommand::OpenDoor { id } => {
                self.set_door_status(id, DoorStatus::Opening);
                Ok(Vec::new())
            }
            WorldCommand::CloseDoor { id } => {
                self.set_door_status(id, DoorStatus::Closing);
                Ok(Vec::new())
            }
            WorldCommand::ToggleBox { id } => {
                self.toggle_box(id);
                Ok(Vec::new())
            }
            WorldCommand::Translate { id, dx, dy, dz } => {
                let Some(key) = self.find(id) else {
                    warn!(entity = %id, "translate for unknown entity");
                    return Ok(Vec::new());
                };
                let touched = self.translate_entity(key, dx, dy, dz)?;
                Ok(self.replace_shape_commands(&touched))
            }
            WorldCommand::Rotate { id, theta, around } => {
                let Some(key) = self.find(id) else {
                    warn!(entity = %id, "rotate for unknown entity");
                    return Ok(Vec::new());
                };
                let touched =
                    self.rotate_entity(key, theta, Point::new(around.0, around.1))?;
                Ok(self.replace_shape_commands(&touched))
            }
            WorldCommand::Scale { id, sx, sy, around } => {
                let Some(key) = self.find(id) else {
                    warn!(entity = %id, "scale for unknown entity");
                    return Ok(Vec::new());
                };
                let touched =
                    self.scale_entity(key, sx, sy, Point::new(around.0, around.1))?;
                Ok(self.replace_shape_commands(&touched))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots and export
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Wire form of one entity, with nested box contents.
    #[must_use]
    pub fn entity_spec(&self, key: EntityKey) -> Option<EntitySpec> {
        let entity = self.entities.get(key)?;
        let contents = match &entity.kind {
            EntityKind::Box { contents, .. } => contents
                .iter()
                .filter_map(|&child| self.entity_spec(child))
                .collect(),
            _ => Vec::new(),
        };
        let door = entity.door().map(|d| DoorSpec {
            pivot: (d.pivot().x, d.pivot().y),
            closed_angle: d.closed_angle(),
            pivot_angle: d.pivot_angle(),
            width: d.width,
            thickness: d.thickness,
            open_fraction: d.open_fraction(),
        });
        Some(EntitySpec {
            id: entity.id,
            name: entity.name.clone(),
            entity_type: entity.entity_type(),
            color: entity.color,
            laser_visible: entity.laser_visible,
            shape: ShapeSpec::from_shape(&entity.shape),
            door,
            open: entity.box_open(),
            contents,
        })
    }

    /// Everything a newly joining process needs: full world state, peer
    /// poses, and its configured start placement if one exists.
    #[must_use]
    pub fn welcome_package(&self, joiner: &str) -> WelcomePackage {
        WelcomePackage {
            tick: self.tick,
            world_width: self.config.width,
            world_height: self.config.height,
            entities: self
                .root
                .iter()
                .filter_map(|&key| self.entity_spec(key))
                .collect(),
            peers: self
                .peer_shapes()
                .into_iter()
                .map(|(name, shape)| (name, ShapeSpec::from_shape(&shape)))
                .collect(),
            placement: self.config.placements.get(joiner).cloned(),
        }
    }

    /// Abstract export tree for the whole world, mirroring containment.
    #[must_use]
    pub fn export(&self) -> ExportNode {
        let mut node = ExportNode::new("world")
            .attr("width", self.config.width)
            .attr("height", self.config.height)
            .attr("tick", self.tick.0);
        for &key in &self.root {
            if let Some(child) = self.export_entity(key) {
                node.children.push(child);
            }
        }
        node
    }

    fn export_entity(&self, key: EntityKey) -> Option<ExportNode> {
        let entity = self.entities.get(key)?;
        let mut node = ExportNode::new(entity.entity_type().tag()).attr("id", entity.id);
        if let Some(name) = entity.name() {
            node = node.attr("name", name);
        }
        if let Some(color) = entity.color {
            node = node.attr(
                "color",
                format!("{} {} {}", color[0], color[1], color[2]),
            );
        }
        if !entity.laser_visible {
            node = node.attr("laser-visible", false);
        }
        if let Some(door) = entity.door() {
            node = node
                .attr("pivot-x", door.pivot().x)
                .attr("pivot-y", door.pivot().y)
                .attr("closed-angle", door.closed_angle())
                .attr("pivot-angle", door.pivot_angle())
                .attr("open-fraction", door.open_fraction());
        }
        if let Some(open) = entity.box_open() {
            node = node.attr("open", open);
        }
        node.children.push(entity.shape.export_node());
        if let EntityKind::Box { contents, .. } = &entity.kind {
            for &child in contents {
                if let Some(child_node) = self.export_entity(child) {
                    node.children.push(child_node);
                }
            }
        }
        Some(node)
    }
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

impl WorldModel {
    /// Advance the world by one tick: absorb the guestbook, tick doors,
    /// integrate robot motion with its carried cascade and trigger actions,
    /// then refresh perception. `allow_motion` lets hosts freeze the robot
    /// (for example while paused) without stalling door kinematics.
    pub fn tick(&mut self, allow_motion: bool) -> Result<TickEvents, WorldError> {
        let next = self.tick.next();
        let mut events = TickEvents {
            tick: next,
            ..TickEvents::default()
        };
        self.stage_guestbook()?;
        self.stage_doors(&mut events);
        let displacement = if allow_motion {
            self.stage_motion(&mut events)
        } else {
            None
        };
        if let Some(d) = displacement {
            self.stage_carried(d, &mut events)?;
            self.stage_actions(&mut events);
        }
        self.stage_laser();
        self.tick = next;
        events.robot_moved = displacement.is_some();
        Ok(events)
    }
}
