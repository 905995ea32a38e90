//! Planar bounds and quadrant subdivision used by quadtree clustering.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Create an envelope from two corners, normalizing their order.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Degenerate envelope covering a single point.
    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    /// The longitude/latitude extent, the usual maximum bounds of a spatial index.
    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.min_x + self.width() / 2.0,
            self.min_y + self.height() / 2.0,
        )
    }

    /// `true` if `other` lies entirely inside this envelope, borders included.
    pub fn contains(&self, other: &Envelope) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        other.min_x <= self.max_x
            && other.max_x >= self.min_x
            && other.min_y <= self.max_y
            && other.max_y >= self.min_y
    }

    /// Smallest envelope covering both.
    pub fn union(&self, other: &Envelope) -> Envelope {
        Envelope {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// One of the four children of a quadtree cell.
///
/// The discriminant is the bucket index the quadrant maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Quadrant {
    SouthWest = 0,
    NorthWest = 1,
    NorthEast = 2,
    SouthEast = 3,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::SouthWest,
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthEast,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Quadrant> {
        Self::ALL.get(index as usize).copied()
    }

    /// The sub-envelope of `parent` covered by this quadrant.
    pub fn slice(self, parent: &Envelope) -> Envelope {
        let (cx, cy) = parent.center();
        match self {
            Quadrant::SouthWest => Envelope::new(parent.min_x, parent.min_y, cx, cy),
            Quadrant::NorthWest => Envelope::new(parent.min_x, cy, cx, parent.max_y),
            Quadrant::NorthEast => Envelope::new(cx, cy, parent.max_x, parent.max_y),
            Quadrant::SouthEast => Envelope::new(cx, parent.min_y, parent.max_x, cy),
        }
    }

    /// Descend from `max_bounds` one quadrant at a time while `bounds` still
    /// fits entirely inside a single quadrant, stopping after `max_depth` levels.
    pub fn path_to(max_bounds: &Envelope, bounds: &Envelope, max_depth: usize) -> Vec<Quadrant> {
        let mut path = Vec::new();
        if !max_bounds.contains(bounds) {
            return path;
        }
        let mut cell = *max_bounds;
        while path.len() < max_depth {
            let next = Self::ALL
                .iter()
                .map(|q| (*q, q.slice(&cell)))
                .find(|(_, sub)| sub.contains(bounds));
            match next {
                Some((quadrant, sub)) => {
                    path.push(quadrant);
                    cell = sub;
                }
                None => break,
            }
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_normalizes_corners() {
        let env = Envelope::new(10.0, 5.0, -10.0, -5.0);
        assert_eq!(env.min_x, -10.0);
        assert_eq!(env.max_y, 5.0);
        assert_eq!(env.width(), 20.0);
        assert_eq!(env.center(), (0.0, 0.0));
    }

    #[test]
    fn containment_and_union() {
        let world = Envelope::world();
        let small = Envelope::new(1.0, 1.0, 2.0, 2.0);
        assert!(world.contains(&small));
        assert!(!small.contains(&world));
        assert!(small.intersects(&world));
        let merged = small.union(&Envelope::point(-3.0, 4.0));
        assert_eq!(merged, Envelope::new(-3.0, 1.0, 2.0, 4.0));
    }

    #[test]
    fn quadrants_tile_parent() {
        let world = Envelope::world();
        assert_eq!(
            Quadrant::SouthWest.slice(&world),
            Envelope::new(-180.0, -90.0, 0.0, 0.0)
        );
        assert_eq!(
            Quadrant::NorthEast.slice(&world),
            Envelope::new(0.0, 0.0, 180.0, 90.0)
        );
        for q in Quadrant::ALL {
            assert_eq!(Quadrant::from_index(q.index()), Some(q));
        }
        assert_eq!(Quadrant::from_index(4), None);
    }

    #[test]
    fn path_stops_at_max_depth() {
        let world = Envelope::world();
        let path = Quadrant::path_to(&world, &Envelope::point(100.0, 45.0), 5);
        assert_eq!(path.len(), 5);
        assert_eq!(path[0], Quadrant::NorthEast);
    }

    #[test]
    fn path_stops_when_bounds_straddle_quadrants() {
        let world = Envelope::world();
        let straddling = Envelope::new(-1.0, -1.0, 1.0, 1.0);
        assert!(Quadrant::path_to(&world, &straddling, 10).is_empty());

        let outside = Envelope::point(500.0, 0.0);
        assert!(Quadrant::path_to(&world, &outside, 10).is_empty());
    }
}
