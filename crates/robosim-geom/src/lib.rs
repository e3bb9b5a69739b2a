//! Planar geometry kernel for the robosim world model: points, affine maps,
//! line segments, and bounding boxes.
//!
//! Shapes in the world model are pose-free: their position is entirely encoded
//! in segment coordinates, so every operation here works point-wise. Transforms
//! are applied to endpoints, never to a stored center + orientation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used for parallelism and endpoint comparisons.
pub const EPSILON: f64 = 1e-9;

/// Errors emitted by the geometry kernel.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// The transform matrix has no inverse.
    #[error("transform is not invertible")]
    Singular,
    /// Indicates geometry that cannot be represented (e.g., non-finite input).
    #[error("invalid geometry: {0}")]
    Invalid(&'static str),
}

/// A point in the world plane.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// Construct a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Bearing from this point to `other`, in radians.
    #[must_use]
    pub fn bearing_to(&self, other: Point) -> f64 {
        (other.y - self.y).atan2(other.x - self.x)
    }

    /// Midpoint between this point and `other`.
    #[must_use]
    pub fn midpoint(&self, other: Point) -> Point {
        Point::new((self.x + other.x) * 0.5, (self.y + other.y) * 0.5)
    }

    /// Both coordinates are finite numbers.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// An affine map of the plane stored as a 2x3 matrix:
/// `x' = m00*x + m01*y + tx`, `y' = m10*x + m11*y + ty`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Affine {
    m00: f64,
    m01: f64,
    m10: f64,
    m11: f64,
    tx: f64,
    ty: f64,
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    /// The identity map.
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            m00: 1.0,
            m01: 0.0,
            m10: 0.0,
            m11: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// Translation by `(dx, dy)`.
    #[must_use]
    pub const fn translation(dx: f64, dy: f64) -> Self {
        Self {
            m00: 1.0,
            m01: 0.0,
            m10: 0.0,
            m11: 1.0,
            tx: dx,
            ty: dy,
        }
    }

    /// Rotation by `theta` radians about `pivot`.
    #[must_use]
    pub fn rotation(theta: f64, pivot: Point) -> Self {
        let (sin, cos) = theta.sin_cos();
        Self {
            m00: cos,
            m01: -sin,
            m10: sin,
            m11: cos,
            tx: pivot.x - cos * pivot.x + sin * pivot.y,
            ty: pivot.y - sin * pivot.x - cos * pivot.y,
        }
    }

    /// Scaling by `(sx, sy)` about `pivot`.
    #[must_use]
    pub fn scaling(sx: f64, sy: f64, pivot: Point) -> Self {
        Self {
            m00: sx,
            m01: 0.0,
            m10: 0.0,
            m11: sy,
            tx: pivot.x - sx * pivot.x,
            ty: pivot.y - sy * pivot.y,
        }
    }

    /// Apply this map to a point.
    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.m00 * p.x + self.m01 * p.y + self.tx,
            self.m10 * p.x + self.m11 * p.y + self.ty,
        )
    }

    /// Compose: the returned map applies `self` first, then `next`.
    #[must_use]
    pub fn then(&self, next: &Affine) -> Self {
        Self {
            m00: next.m00 * self.m00 + next.m01 * self.m10,
            m01: next.m00 * self.m01 + next.m01 * self.m11,
            m10: next.m10 * self.m00 + next.m11 * self.m10,
            m11: next.m10 * self.m01 + next.m11 * self.m11,
            tx: next.m00 * self.tx + next.m01 * self.ty + next.tx,
            ty: next.m10 * self.tx + next.m11 * self.ty + next.ty,
        }
    }

    /// Invert the map, failing when the matrix is singular.
    pub fn invert(&self) -> Result<Self, GeometryError> {
        let det = self.m00 * self.m11 - self.m01 * self.m10;
        if det.abs() < EPSILON {
            return Err(GeometryError::Singular);
        }
        let i00 = self.m11 / det;
        let i01 = -self.m01 / det;
        let i10 = -self.m10 / det;
        let i11 = self.m00 / det;
        Ok(Self {
            m00: i00,
            m01: i01,
            m10: i10,
            m11: i11,
            tx: -(i00 * self.tx + i01 * self.ty),
            ty: -(i10 * self.tx + i11 * self.ty),
        })
    }

    /// Rotation component of the map, in radians.
    ///
    /// Used by door entities to keep their closed-angle in step with mover
    /// rotations; zero for pure translations.
    #[must_use]
    pub fn rotation_angle(&self) -> f64 {
        self.m10.atan2(self.m00)
    }
}

/// A directed line segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    /// Construct a segment from `start` to `end`.
    #[must_use]
    pub const fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    /// Segment length.
    #[must_use]
    pub fn length(&self) -> f64 {
        self.start.distance(self.end)
    }

    /// Intersection point with `other`, or `None` when the segments are
    /// parallel or do not cross within both spans.
    #[must_use]
    pub fn intersection(&self, other: &Segment) -> Option<Point> {
        let rx = self.end.x - self.start.x;
        let ry = self.end.y - self.start.y;
        let sx = other.end.x - other.start.x;
        let sy = other.end.y - other.start.y;
        let denom = rx * sy - ry * sx;
        if denom.abs() < EPSILON {
            return None;
        }
        let qpx = other.start.x - self.start.x;
        let qpy = other.start.y - self.start.y;
        let t = (qpx * sy - qpy * sx) / denom;
        let u = (qpx * ry - qpy * rx) / denom;
        if !(-EPSILON..=1.0 + EPSILON).contains(&t) || !(-EPSILON..=1.0 + EPSILON).contains(&u) {
            return None;
        }
        Some(Point::new(self.start.x + t * rx, self.start.y + t * ry))
    }

    /// Whether this segment crosses `other`.
    #[must_use]
    pub fn intersects(&self, other: &Segment) -> bool {
        self.intersection(other).is_some()
    }

    /// Shortest distance from `p` to any point on this segment.
    #[must_use]
    pub fn distance_to_point(&self, p: Point) -> f64 {
        let dx = self.end.x - self.start.x;
        let dy = self.end.y - self.start.y;
        let len_sq = dx * dx + dy * dy;
        if len_sq < EPSILON {
            return self.start.distance(p);
        }
        let t = (((p.x - self.start.x) * dx + (p.y - self.start.y) * dy) / len_sq).clamp(0.0, 1.0);
        p.distance(Point::new(self.start.x + t * dx, self.start.y + t * dy))
    }
}

/// Axis-aligned bounding box over a point set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bounds {
    pub min: Point,
    pub max: Point,
}

impl Bounds {
    /// Tightest bounds over `points`; `None` for an empty iterator.
    pub fn from_points(points: impl IntoIterator<Item = Point>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Self {
            min: first,
            max: first,
        };
        for p in iter {
            bounds.min.x = bounds.min.x.min(p.x);
            bounds.min.y = bounds.min.y.min(p.y);
            bounds.max.x = bounds.max.x.max(p.x);
            bounds.max.y = bounds.max.y.max(p.y);
        }
        Some(bounds)
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Point {
        self.min.midpoint(self.max)
    }

    /// Whether two boxes overlap (touching counts).
    #[must_use]
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x + EPSILON
            && other.min.x <= self.max.x + EPSILON
            && self.min.y <= other.max.y + EPSILON
            && other.min.y <= self.max.y + EPSILON
    }
}

/// Distance along a ray from `origin` at `angle` to its nearest crossing of
/// `segment`, capped at `max_range`; `None` when the ray misses.
#[must_use]
pub fn ray_hit_distance(origin: Point, angle: f64, max_range: f64, segment: &Segment) -> Option<f64> {
    let (sin, cos) = angle.sin_cos();
    let ray = Segment::new(
        origin,
        Point::new(origin.x + cos * max_range, origin.y + sin * max_range),
    );
    ray.intersection(segment).map(|hit| origin.distance(hit))
}

/// Whether a 4-point set forms an axis-aligned rectangle.
///
/// Every point must coincide with a distinct corner of the set's bounding box.
/// Used to detect shapes that can be exported compactly; simulation
/// correctness never depends on it.
#[must_use]
pub fn is_axis_aligned_rect(points: &[Point]) -> bool {
    if points.len() != 4 {
        return false;
    }
    let Some(bounds) = Bounds::from_points(points.iter().copied()) else {
        return false;
    };
    if (bounds.max.x - bounds.min.x) < EPSILON || (bounds.max.y - bounds.min.y) < EPSILON {
        return false;
    }
    let corners = [
        bounds.min,
        Point::new(bounds.max.x, bounds.min.y),
        bounds.max,
        Point::new(bounds.min.x, bounds.max.y),
    ];
    let mut matched = [false; 4];
    for p in points {
        let mut found = false;
        for (slot, corner) in corners.iter().enumerate() {
            if !matched[slot] && p.distance(*corner) < EPSILON {
                matched[slot] = true;
                found = true;
                break;
            }
        }
        if !found {
            return false;
        }
    }
    matched.iter().all(|m| *m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn segments_cross_at_expected_point() {
        let a = Segment::new(Point::new(0.0, 0.0), Point::new(2.0, 2.0));
        let b = Segment::new(Point::new(0.0, 2.0), Point::new(2.0, 0.0));
        let hit = a.intersection(&b).expect("segments cross");
        assert_abs_diff_eq!(hit.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hit.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn parallel_segments_do_not_intersect() {
        let a = Segment::new(Point::new(0.0, 0.0), Point::new(4.0, 0.0));
        let b = Segment::new(Point::new(0.0, 1.0), Point::new(4.0, 1.0));
        assert!(a.intersection(&b).is_none());
        assert!(!a.intersects(&b));
    }

    #[test]
    fn disjoint_collinear_spans_do_not_intersect() {
        let a = Segment::new(Point::new(0.0, 0.0), Point::new(1.0, 0.0));
        let b = Segment::new(Point::new(3.0, -1.0), Point::new(3.0, 1.0));
        assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn rotation_moves_points_about_pivot() {
        let map = Affine::rotation(FRAC_PI_2, Point::new(1.0, 1.0));
        let p = map.apply(Point::new(2.0, 1.0));
        assert_abs_diff_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(map.rotation_angle(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn composed_transform_applies_in_order() {
        let map = Affine::translation(1.0, 0.0).then(&Affine::rotation(PI, Point::default()));
        let p = map.apply(Point::new(1.0, 0.0));
        assert_abs_diff_eq!(p.x, -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn inverse_round_trips_points() {
        let map = Affine::translation(3.0, -2.0)
            .then(&Affine::rotation(0.7, Point::new(1.0, 1.0)))
            .then(&Affine::scaling(2.0, 0.5, Point::new(-1.0, 4.0)));
        let inverse = map.invert().expect("invertible");
        let p = Point::new(5.0, 7.0);
        let back = inverse.apply(map.apply(p));
        assert_abs_diff_eq!(back.x, p.x, epsilon = 1e-9);
        assert_abs_diff_eq!(back.y, p.y, epsilon = 1e-9);
    }

    #[test]
    fn degenerate_scale_is_singular() {
        let map = Affine::scaling(0.0, 1.0, Point::default());
        assert!(map.invert().is_err());
    }

    #[test]
    fn ray_reports_nearest_crossing_distance() {
        let wall = Segment::new(Point::new(5.0, -1.0), Point::new(5.0, 1.0));
        let hit = ray_hit_distance(Point::default(), 0.0, 10.0, &wall).expect("hit");
        assert_abs_diff_eq!(hit, 5.0, epsilon = 1e-9);
        assert!(ray_hit_distance(Point::default(), PI, 10.0, &wall).is_none());
        assert!(ray_hit_distance(Point::default(), 0.0, 4.0, &wall).is_none());
    }

    #[test]
    fn rect_detection_accepts_only_axis_aligned_corners() {
        let rect = [
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(2.0, 1.0),
            Point::new(0.0, 1.0),
        ];
        assert!(is_axis_aligned_rect(&rect));

        let skewed = [
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.5),
            Point::new(2.0, 1.5),
            Point::new(0.0, 1.0),
        ];
        assert!(!is_axis_aligned_rect(&skewed));
        assert!(!is_axis_aligned_rect(&rect[..3]));
    }

    #[test]
    fn bounds_track_extremes_and_overlap() {
        let bounds = Bounds::from_points([
            Point::new(-1.0, 2.0),
            Point::new(3.0, -4.0),
            Point::new(0.0, 0.0),
        ])
        .expect("bounds");
        assert_eq!(bounds.min, Point::new(-1.0, -4.0));
        assert_eq!(bounds.max, Point::new(3.0, 2.0));
        let other = Bounds::from_points([Point::new(2.5, 1.0), Point::new(6.0, 5.0)]).expect("b");
        assert!(bounds.overlaps(&other));
        let far = Bounds::from_points([Point::new(10.0, 10.0), Point::new(11.0, 11.0)]).expect("b");
        assert!(!bounds.overlaps(&far));
    }

    #[test]
    fn point_segment_distance_clamps_to_endpoints() {
        let seg = Segment::new(Point::new(0.0, 0.0), Point::new(4.0, 0.0));
        assert_abs_diff_eq!(seg.distance_to_point(Point::new(2.0, 3.0)), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(seg.distance_to_point(Point::new(-3.0, 4.0)), 5.0, epsilon = 1e-12);
    }
}
