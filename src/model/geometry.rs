//! Bounding boxes and query polygons.

use serde::{Deserialize, Serialize};

use super::operation::Coordinate;

/// Axis-aligned bounding box in degrees (x = lon, y = lat).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    /// Smallest box containing every coordinate, None for an empty input.
    pub fn from_coordinates<'a, I>(coords: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Coordinate>,
    {
        let mut iter = coords.into_iter();
        let first = iter.next()?;
        let mut bbox = BBox::point(first.lon, first.lat);
        for c in iter {
            bbox.expand(c.lon, c.lat);
        }
        Some(bbox)
    }

    pub fn expand(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }
}

/// Simple closed ring used as a bounding polygon for queries.
///
/// The ring is implicitly closed; the last vertex need not repeat the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    ring: Vec<(f64, f64)>,
    bbox: BBox,
}

impl Polygon {
    /// Returns None for rings with fewer than three vertices.
    pub fn new(ring: Vec<(f64, f64)>) -> Option<Self> {
        if ring.len() < 3 {
            return None;
        }
        let mut bbox = BBox::point(ring[0].0, ring[0].1);
        for &(x, y) in &ring[1..] {
            bbox.expand(x, y);
        }
        Some(Self { ring, bbox })
    }

    pub fn from_bbox(b: &BBox) -> Self {
        let ring = b.corners().to_vec();
        Self { ring, bbox: *b }
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    /// Even-odd rule point-in-polygon test.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        if !self.bbox.contains_point(x, y) {
            return false;
        }
        let mut inside = false;
        let n = self.ring.len();
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.ring[i];
            let (xj, yj) = self.ring[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// True if the polygon and the box share at least one point.
    pub fn intersects_bbox(&self, b: &BBox) -> bool {
        if !self.bbox.intersects(b) {
            return false;
        }
        if self.ring.iter().any(|&(x, y)| b.contains_point(x, y)) {
            return true;
        }
        let corners = b.corners();
        if corners.iter().any(|&(x, y)| self.contains_point(x, y)) {
            return true;
        }
        // Remaining case: edges cross without any vertex containment.
        let n = self.ring.len();
        for i in 0..n {
            let a = self.ring[i];
            let c = self.ring[(i + 1) % n];
            for k in 0..4 {
                if segments_intersect(a, c, corners[k], corners[(k + 1) % 4]) {
                    return true;
                }
            }
        }
        false
    }
}

fn orientation(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> f64 {
    (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
}

fn segments_intersect(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// Spatial predicate accepted by read-side queries.
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    BBox(BBox),
    Polygon(Polygon),
}

impl Region {
    pub fn bbox(&self) -> BBox {
        match self {
            Region::BBox(b) => *b,
            Region::Polygon(p) => *p.bbox(),
        }
    }

    pub fn intersects_bbox(&self, b: &BBox) -> bool {
        match self {
            Region::BBox(r) => r.intersects(b),
            Region::Polygon(p) => p.intersects_bbox(b),
        }
    }
}
