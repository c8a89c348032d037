//! WKT polygon geometry in a planar CRS.
//!
//! Parcels and zones are exchanged as WKT `POLYGON` / `MULTIPOLYGON` text in a
//! fixed planar reference system (metres). Reprojection is the caller's job.
//! Parsing is done with nom; the planar helpers here back input validation,
//! default parcel areas, and the in-memory spatial ports.

use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, map_res, opt, value},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::error::ParcelError;

/// Coordinate reference system parcels are expected in (Swiss LV95).
pub const DEFAULT_SRID: i32 = 2056;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn dist(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

/// A polygon with one exterior ring and optional holes. Rings are closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    #[serde(default)]
    pub holes: Vec<Vec<Point>>,
}

impl Polygon {
    pub fn area(&self) -> f64 {
        let holes: f64 = self.holes.iter().map(|h| ring_signed_area(h).abs()).sum();
        (ring_signed_area(&self.exterior).abs() - holes).max(0.0)
    }

    pub fn contains_point(&self, p: &Point) -> bool {
        ring_contains(&self.exterior, p) && !self.holes.iter().any(|h| ring_contains(h, p))
    }

    fn rings(&self) -> impl Iterator<Item = &Vec<Point>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }

    fn segments(&self) -> impl Iterator<Item = (&Point, &Point)> {
        self.rings()
            .flat_map(|ring| ring.windows(2).map(|w| (&w[0], &w[1])))
    }
}

/// A validated (multi)polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(default)]
    pub srid: Option<i32>,
    pub polygons: Vec<Polygon>,
}

impl Geometry {
    /// Parse and validate WKT (or EWKT with an `SRID=n;` prefix).
    ///
    /// Rejects empty geometries, unclosed rings, rings with fewer than four
    /// positions, non-finite coordinates, and zero-area shapes.
    pub fn parse_wkt(input: &str) -> Result<Self, ParcelError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParcelError::InvalidGeometry("empty WKT".into()));
        }

        let (_, parsed) = all_consuming(delimited(multispace0, ewkt, multispace0))(trimmed)
            .map_err(|e| ParcelError::InvalidGeometry(format!("unparseable WKT: {e}")))?;

        let geometry = Geometry {
            srid: parsed.0,
            polygons: parsed.1,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<(), ParcelError> {
        if self.polygons.is_empty() {
            return Err(ParcelError::InvalidGeometry("geometry is EMPTY".into()));
        }
        for polygon in &self.polygons {
            for ring in polygon.rings() {
                if ring.len() < 4 {
                    return Err(ParcelError::InvalidGeometry(format!(
                        "ring has {} positions, need at least 4",
                        ring.len()
                    )));
                }
                if ring.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                    return Err(ParcelError::InvalidGeometry(
                        "non-finite coordinate".into(),
                    ));
                }
                let (first, last) = (ring[0], ring[ring.len() - 1]);
                if first.dist(&last) > EPSILON {
                    return Err(ParcelError::InvalidGeometry("ring is not closed".into()));
                }
            }
        }
        if self.area() <= EPSILON {
            return Err(ParcelError::InvalidGeometry("zero-area geometry".into()));
        }
        Ok(())
    }

    /// Planar area in square units of the CRS.
    pub fn area(&self) -> f64 {
        self.polygons.iter().map(Polygon::area).sum()
    }

    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for p in self.polygons.iter().flat_map(|poly| poly.exterior.iter()) {
            bbox.min_x = bbox.min_x.min(p.x);
            bbox.min_y = bbox.min_y.min(p.y);
            bbox.max_x = bbox.max_x.max(p.x);
            bbox.max_y = bbox.max_y.max(p.y);
        }
        bbox
    }

    /// Area-weighted centroid of the exterior rings.
    pub fn centroid(&self) -> Point {
        let mut total = 0.0;
        let (mut cx, mut cy) = (0.0, 0.0);
        for polygon in &self.polygons {
            let (a, c) = ring_centroid(&polygon.exterior);
            total += a;
            cx += c.x * a;
            cy += c.y * a;
        }
        if total.abs() <= EPSILON {
            let bbox = self.bbox();
            return Point::new((bbox.min_x + bbox.max_x) / 2.0, (bbox.min_y + bbox.max_y) / 2.0);
        }
        Point::new(cx / total, cy / total)
    }

    pub fn contains_point(&self, p: &Point) -> bool {
        self.polygons.iter().any(|poly| poly.contains_point(p))
    }

    /// True if the two geometries share any point (boundary contact included).
    pub fn intersects(&self, other: &Geometry) -> bool {
        if !self.bbox().overlaps(&other.bbox()) {
            return false;
        }
        for a in &self.polygons {
            for b in &other.polygons {
                if a.segments()
                    .any(|(p1, p2)| b.segments().any(|(q1, q2)| segments_intersect(p1, p2, q1, q2)))
                {
                    return true;
                }
                if a.exterior.first().is_some_and(|p| b.contains_point(p))
                    || b.exterior.first().is_some_and(|p| a.contains_point(p))
                {
                    return true;
                }
            }
        }
        false
    }

    /// Minimum planar distance; zero when intersecting.
    pub fn distance(&self, other: &Geometry) -> f64 {
        if self.intersects(other) {
            return 0.0;
        }
        let mut best = f64::INFINITY;
        for a in &self.polygons {
            for b in &other.polygons {
                for (p1, p2) in a.segments() {
                    for (q1, q2) in b.segments() {
                        best = best.min(segment_distance(p1, p2, q1, q2));
                    }
                }
            }
        }
        best
    }

    pub fn to_wkt(&self) -> String {
        let ring = |r: &Vec<Point>| {
            let coords: Vec<String> = r.iter().map(|p| format!("{} {}", p.x, p.y)).collect();
            format!("({})", coords.join(", "))
        };
        let polygon = |p: &Polygon| {
            let rings: Vec<String> = p.rings().map(ring).collect();
            format!("({})", rings.join(", "))
        };
        if self.polygons.len() == 1 {
            format!("POLYGON {}", polygon(&self.polygons[0]))
        } else {
            let parts: Vec<String> = self.polygons.iter().map(polygon).collect();
            format!("MULTIPOLYGON ({})", parts.join(", "))
        }
    }
}

// =============================================================================
// PLANAR HELPERS
// =============================================================================

/// Shoelace over coordinates shifted to the first vertex, which keeps the
/// products small for projected (LV95) coordinates.
fn ring_signed_area(ring: &[Point]) -> f64 {
    let Some(o) = ring.first() else {
        return 0.0;
    };
    ring.windows(2)
        .map(|w| (w[0].x - o.x) * (w[1].y - o.y) - (w[1].x - o.x) * (w[0].y - o.y))
        .sum::<f64>()
        / 2.0
}

fn ring_centroid(ring: &[Point]) -> (f64, Point) {
    let a = ring_signed_area(ring);
    if a.abs() <= EPSILON {
        return (0.0, ring[0]);
    }
    let o = ring[0];
    let (mut cx, mut cy) = (0.0, 0.0);
    for w in ring.windows(2) {
        let (x0, y0) = (w[0].x - o.x, w[0].y - o.y);
        let (x1, y1) = (w[1].x - o.x, w[1].y - o.y);
        let cross = x0 * y1 - x1 * y0;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    (
        a.abs(),
        Point::new(o.x + cx / (6.0 * a), o.y + cy / (6.0 * a)),
    )
}

/// Ray casting; points on the boundary count as inside.
fn ring_contains(ring: &[Point], p: &Point) -> bool {
    if ring
        .windows(2)
        .any(|w| point_segment_distance(p, &w[0], &w[1]) <= EPSILON)
    {
        return true;
    }
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn orientation(a: &Point, b: &Point, c: &Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: &Point, b: &Point, p: &Point) -> bool {
    p.x <= a.x.max(b.x) + EPSILON
        && p.x + EPSILON >= a.x.min(b.x)
        && p.y <= a.y.max(b.y) + EPSILON
        && p.y + EPSILON >= a.y.min(b.y)
}

fn segments_intersect(p1: &Point, p2: &Point, q1: &Point, q2: &Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
    {
        return true;
    }
    (d1.abs() <= EPSILON && on_segment(q1, q2, p1))
        || (d2.abs() <= EPSILON && on_segment(q1, q2, p2))
        || (d3.abs() <= EPSILON && on_segment(p1, p2, q1))
        || (d4.abs() <= EPSILON && on_segment(p1, p2, q2))
}

fn point_segment_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    if len_sq <= EPSILON {
        return p.dist(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.dist(&Point::new(a.x + t * dx, a.y + t * dy))
}

fn segment_distance(p1: &Point, p2: &Point, q1: &Point, q2: &Point) -> f64 {
    if segments_intersect(p1, p2, q1, q2) {
        return 0.0;
    }
    point_segment_distance(p1, q1, q2)
        .min(point_segment_distance(p2, q1, q2))
        .min(point_segment_distance(q1, p1, p2))
        .min(point_segment_distance(q2, p1, p2))
}

// =============================================================================
// WKT PARSERS
// =============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// `SRID=2056;` prefix.
fn srid(input: &str) -> IResult<&str, i32> {
    delimited(
        tag_no_case("SRID="),
        map_res(digit1, |d: &str| d.parse::<i32>()),
        char(';'),
    )(input)
}

fn point(input: &str) -> IResult<&str, Point> {
    map(
        tuple((ws(double), ws(double), opt(ws(double)))),
        |(x, y, _z)| Point::new(x, y),
    )(input)
}

fn ring(input: &str) -> IResult<&str, Vec<Point>> {
    delimited(ws(char('(')), separated_list1(char(','), point), ws(char(')')))(input)
}

fn polygon_body(input: &str) -> IResult<&str, Polygon> {
    map(
        delimited(ws(char('(')), separated_list1(char(','), ring), ws(char(')'))),
        |mut rings| {
            let exterior = rings.remove(0);
            Polygon {
                exterior,
                holes: rings,
            }
        },
    )(input)
}

fn empty(input: &str) -> IResult<&str, Vec<Polygon>> {
    value(Vec::new(), ws(tag_no_case("EMPTY")))(input)
}

fn polygon(input: &str) -> IResult<&str, Vec<Polygon>> {
    preceded(
        terminated(tag_no_case("POLYGON"), opt(ws(tag_no_case("Z")))),
        alt((empty, map(polygon_body, |p| vec![p]))),
    )(input)
}

fn multipolygon(input: &str) -> IResult<&str, Vec<Polygon>> {
    preceded(
        terminated(tag_no_case("MULTIPOLYGON"), opt(ws(tag_no_case("Z")))),
        alt((
            empty,
            delimited(
                ws(char('(')),
                separated_list1(char(','), polygon_body),
                ws(char(')')),
            ),
        )),
    )(input)
}

fn ewkt(input: &str) -> IResult<&str, (Option<i32>, Vec<Polygon>)> {
    pair(opt(ws(srid)), alt((multipolygon, polygon)))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = "POLYGON((2595000 1119000, 2595100 1119000, 2595100 1119100, 2595000 1119100, 2595000 1119000))";

    #[test]
    fn test_parse_square_area_and_centroid() {
        let g = Geometry::parse_wkt(SQUARE).unwrap();
        assert_eq!(g.polygons.len(), 1);
        assert!((g.area() - 10_000.0).abs() < 1e-6);
        let c = g.centroid();
        assert!((c.x - 2_595_050.0).abs() < 1e-6);
        assert!((c.y - 1_119_050.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ewkt_and_case_insensitive() {
        let g = Geometry::parse_wkt("SRID=2056;polygon ((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
        assert_eq!(g.srid, Some(2056));
        assert!((g.area() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_polygon_with_hole() {
        let g = Geometry::parse_wkt(
            "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (2 2, 4 2, 4 4, 2 4, 2 2))",
        )
        .unwrap();
        assert!((g.area() - 96.0).abs() < 1e-9);
        assert!(!g.contains_point(&Point::new(3.0, 3.0)));
        assert!(g.contains_point(&Point::new(6.0, 6.0)));
    }

    #[test]
    fn test_parse_multipolygon() {
        let g = Geometry::parse_wkt(
            "MULTIPOLYGON (((0 0, 1 0, 1 1, 0 1, 0 0)), ((5 5, 7 5, 7 7, 5 7, 5 5)))",
        )
        .unwrap();
        assert_eq!(g.polygons.len(), 2);
        assert!((g.area() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        for wkt in [
            "",
            "   ",
            "POLYGON EMPTY",
            "POINT (1 1)",
            "POLYGON ((0 0, 1 0, 1 1, 0 1))",
            "POLYGON ((0 0, 1 0, 0 0))",
            "POLYGON ((0 0, 1 0, 2 0, 0 0))",
            "POLYGON ((0 0, 1 0, 1 1, 0 1, 0 0)) trailing",
        ] {
            assert!(
                matches!(Geometry::parse_wkt(wkt), Err(ParcelError::InvalidGeometry(_))),
                "expected rejection for {wkt:?}"
            );
        }
    }

    #[test]
    fn test_intersects_and_distance() {
        let a = Geometry::parse_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
        let overlapping = Geometry::parse_wkt("POLYGON ((5 5, 15 5, 15 15, 5 15, 5 5))").unwrap();
        let inside = Geometry::parse_wkt("POLYGON ((2 2, 3 2, 3 3, 2 3, 2 2))").unwrap();
        let far = Geometry::parse_wkt("POLYGON ((30 0, 40 0, 40 10, 30 10, 30 0))").unwrap();

        assert!(a.intersects(&overlapping));
        assert!(a.intersects(&inside));
        assert!(inside.intersects(&a));
        assert!(!a.intersects(&far));
        assert_eq!(a.distance(&overlapping), 0.0);
        assert!((a.distance(&far) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_wkt_round_trip_preserves_area() {
        let g = Geometry::parse_wkt(SQUARE).unwrap();
        let again = Geometry::parse_wkt(&g.to_wkt()).unwrap();
        assert!((g.area() - again.area()).abs() < 1e-6);
    }
}
