//! Geometry shared by growers, the pool and the scene index.

use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Channels below this on every axis count as "near black".
pub const DARKNESS_THRESHOLD: f32 = 0.2;

/// Identity of one pipe, unique within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PipeId(pub u64);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Direction in 3D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::PosX,
        Direction::NegX,
        Direction::PosY,
        Direction::NegY,
        Direction::PosZ,
        Direction::NegZ,
    ];

    pub fn vector(self) -> Vector3<f32> {
        match self {
            Direction::PosX => Vector3::new(1.0, 0.0, 0.0),
            Direction::NegX => Vector3::new(-1.0, 0.0, 0.0),
            Direction::PosY => Vector3::new(0.0, 1.0, 0.0),
            Direction::NegY => Vector3::new(0.0, -1.0, 0.0),
            Direction::PosZ => Vector3::new(0.0, 0.0, 1.0),
            Direction::NegZ => Vector3::new(0.0, 0.0, -1.0),
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::PosX => Direction::NegX,
            Direction::NegX => Direction::PosX,
            Direction::PosY => Direction::NegY,
            Direction::NegY => Direction::PosY,
            Direction::PosZ => Direction::NegZ,
            Direction::NegZ => Direction::PosZ,
        }
    }

    /// The five directions a pipe may take after moving along `self`.
    pub fn forward_candidates(self) -> [Direction; 5] {
        let back = self.opposite();
        let mut out = [self; 5];
        let mut i = 0;
        for d in Direction::ALL {
            if d != back {
                out[i] = d;
                i += 1;
            }
        }
        out
    }
}

/// Axis-aligned containment box centered at the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    size: Vector3<f32>,
}

impl Bounds {
    /// `size` is the full extent on each axis.
    pub fn from_size(size: Vector3<f32>) -> Self {
        Self { size }
    }

    pub fn size(&self) -> Vector3<f32> {
        self.size
    }

    pub fn half_extents(&self) -> Vector3<f32> {
        self.size / 2.0
    }

    pub fn is_empty(&self) -> bool {
        self.size.iter().any(|c| !c.is_finite() || *c <= 0.0)
    }

    pub fn contains(&self, p: &Vector3<f32>) -> bool {
        let h = self.half_extents();
        p.x.abs() <= h.x && p.y.abs() <= h.y && p.z.abs() <= h.z
    }
}

/// Linear RGB color with channels in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// `h`, `s` and `v` all in `0.0..=1.0`.
    pub fn from_hsv(h: f32, s: f32, v: f32) -> Self {
        let h6 = (h.rem_euclid(1.0)) * 6.0;
        let c = v * s;
        let x = c * (1.0 - ((h6 % 2.0) - 1.0).abs());
        let m = v - c;
        let (r, g, b) = match h6 as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        Self::new(r + m, g + m, b + m)
    }

    pub fn is_near_black(&self) -> bool {
        self.r < DARKNESS_THRESHOLD && self.g < DARKNESS_THRESHOLD && self.b < DARKNESS_THRESHOLD
    }

    /// Samples light, saturated colors until one is not near black.
    pub fn random_pastel(rng: &mut oorandom::Rand32) -> Self {
        loop {
            let h = rng.rand_float();
            let s = 0.5 + 0.5 * rng.rand_float();
            let v = 0.5 + 0.5 * rng.rand_float();
            let color = Color::from_hsv(h, s, v);
            if !color.is_near_black() {
                return color;
            }
        }
    }

    pub fn to_rgb8(&self) -> (u8, u8, u8) {
        let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        (q(self.r), q(self.g), q(self.b))
    }
}

/// A straight cylindrical piece of pipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub pipe: PipeId,
    pub start: Vector3<f32>,
    pub end: Vector3<f32>,
    pub direction: Direction,
    pub radius: f32,
    pub color: Color,
}

impl Segment {
    pub fn length(&self) -> f32 {
        (self.end - self.start).norm()
    }

    pub fn midpoint(&self) -> Vector3<f32> {
        (self.start + self.end) / 2.0
    }
}

/// A spherical joint placed where a pipe changes direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnMarker {
    pub pipe: PipeId,
    pub center: Vector3<f32>,
    pub radius: f32,
    pub color: Color,
}

/// Solid volume registered in the scene index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Capsule {
        start: Vector3<f32>,
        end: Vector3<f32>,
        radius: f32,
    },
    Sphere {
        center: Vector3<f32>,
        radius: f32,
    },
}

impl From<&Segment> for Shape {
    fn from(s: &Segment) -> Self {
        Shape::Capsule {
            start: s.start,
            end: s.end,
            radius: s.radius,
        }
    }
}

impl From<&TurnMarker> for Shape {
    fn from(t: &TurnMarker) -> Self {
        Shape::Sphere {
            center: t.center,
            radius: t.radius,
        }
    }
}

impl Shape {
    /// Whether `p` lies within the shape grown by `margin`.
    pub fn contains(&self, p: &Vector3<f32>, margin: f32) -> bool {
        match *self {
            Shape::Sphere { center, radius } => (p - center).norm() <= radius + margin,
            Shape::Capsule { start, end, radius } => {
                distance_to_segment(p, &start, &end) <= radius + margin
            }
        }
    }

    /// Whether the shape is centered on `p` (sphere) or ends at `p` (capsule).
    pub fn is_anchored_at(&self, p: &Vector3<f32>) -> bool {
        const EPS: f32 = 1e-4;
        match *self {
            Shape::Sphere { center, .. } => (center - p).norm() <= EPS,
            Shape::Capsule { start, end, .. } => {
                (start - p).norm() <= EPS || (end - p).norm() <= EPS
            }
        }
    }

    /// Entry distance of a ray swept with radius `margin`, or `None` on a miss.
    ///
    /// `dir` must be normalized. A ray starting inside the grown shape hits
    /// at distance zero.
    pub fn ray_entry(&self, origin: &Vector3<f32>, dir: &Vector3<f32>, margin: f32) -> Option<f32> {
        if self.contains(origin, margin) {
            return Some(0.0);
        }
        match *self {
            Shape::Sphere { center, radius } => ray_sphere(origin, dir, &center, radius + margin),
            Shape::Capsule { start, end, radius } => {
                let r = radius + margin;
                [
                    ray_cylinder_body(origin, dir, &start, &end, r),
                    ray_sphere(origin, dir, &start, r),
                    ray_sphere(origin, dir, &end, r),
                ]
                .into_iter()
                .flatten()
                .reduce(f32::min)
            }
        }
    }
}

fn distance_to_segment(p: &Vector3<f32>, a: &Vector3<f32>, b: &Vector3<f32>) -> f32 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 <= f32::EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

fn ray_sphere(o: &Vector3<f32>, d: &Vector3<f32>, center: &Vector3<f32>, r: f32) -> Option<f32> {
    let oc = o - center;
    let b = oc.dot(d);
    let c = oc.norm_squared() - r * r;
    let h = b * b - c;
    if h < 0.0 {
        return None;
    }
    let t = -b - h.sqrt();
    (t >= 0.0).then_some(t)
}

fn ray_cylinder_body(
    o: &Vector3<f32>,
    d: &Vector3<f32>,
    a: &Vector3<f32>,
    b: &Vector3<f32>,
    r: f32,
) -> Option<f32> {
    let ba = b - a;
    let oa = o - a;
    let baba = ba.norm_squared();
    let bard = ba.dot(d);
    let baoa = ba.dot(&oa);
    let k2 = baba - bard * bard;
    // Parallel to the axis: only the end caps can be hit.
    if k2.abs() <= 1e-6 * baba.max(1.0) {
        return None;
    }
    let k1 = baba * oa.dot(d) - baoa * bard;
    let k0 = baba * oa.norm_squared() - baoa * baoa - r * r * baba;
    let h = k1 * k1 - k2 * k0;
    if h < 0.0 {
        return None;
    }
    let t = (-k1 - h.sqrt()) / k2;
    let y = baoa + t * bard;
    (t >= 0.0 && y > 0.0 && y < baba).then_some(t)
}
