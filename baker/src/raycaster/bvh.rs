//! Bounding volume hierarchy over the triangles of one geometry.
//!
//! Built top-down with the surface area heuristic and stored flat, with
//! every child placed after its parent so that refitting is a single
//! reverse sweep.

use crate::misc::{Point3, Vector3};
use crate::raycaster::ray::Ray;

const NUM_SAH_BUCKETS: usize = 12;
const DET_EPSILON: f64 = 1e-14;

/// Which triangles a query is allowed to hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullMode {
    /// Triangles are hit from both sides.
    None,
    /// Triangles whose front side (counter-clockwise winding) faces away
    /// from the ray are skipped.
    Back,
}

pub type Triangle = [Point3; 3];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(
                f64::NEG_INFINITY,
                f64::NEG_INFINITY,
                f64::NEG_INFINITY,
            ),
        }
    }

    pub fn from_triangle(tri: &Triangle) -> Self {
        let mut aabb = Self::empty();
        tri.iter().for_each(|p| aabb.include(p));
        aabb
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn include(&mut self, p: &Point3) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn center(&self) -> Point3 {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn surface_area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Slab test returning the entry distance clipped to `[t_min, t_max]`.
    fn hit(&self, ray: &RayData, t_min: f64, t_max: f64) -> Option<f64> {
        let mut t0 = t_min;
        let mut t1 = t_max;
        for a in 0..3 {
            let mut ta = (self.min[a] - ray.origin[a]) * ray.inv_dir[a];
            let mut tb = (self.max[a] - ray.origin[a]) * ray.inv_dir[a];
            if ray.inv_dir[a] < 0.0 {
                std::mem::swap(&mut ta, &mut tb);
            }
            // NaN (origin on a slab of an axis-parallel ray) leaves the
            // range untouched.
            t0 = t0.max(ta);
            t1 = t1.min(tb);
            if t0 > t1 {
                return None;
            }
        }
        Some(t0)
    }
}

struct RayData {
    origin: Point3,
    inv_dir: Vector3,
}

impl RayData {
    fn new(ray: &Ray) -> Self {
        Self {
            origin: *ray.origin(),
            inv_dir: ray.dir().map(|d| 1.0 / d),
        }
    }
}

/// Nearest intersection found by `Bvh::closest`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleHit {
    pub tri: usize,
    pub t: f64,
    pub u: f64,
    pub v: f64,
    /// Unnormalized geometric normal `(p1 - p0) x (p2 - p0)`.
    pub normal: Vector3,
}

/// Möller-Trumbore ray/triangle test returning `(t, u, v)`, where `u` and
/// `v` weight the second and third vertex.
pub fn intersect_triangle(
    tri: &Triangle,
    ray: &Ray,
    cull: CullMode,
) -> Option<(f64, f64, f64)> {
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = ray.dir().cross(&e2);
    let det = e1.dot(&p);

    match cull {
        CullMode::Back if det < DET_EPSILON => return None,
        CullMode::None if det.abs() < DET_EPSILON => return None,
        _ => (),
    }

    let inv_det = 1.0 / det;
    let s = ray.origin() - tri[0];
    let u = s.dot(&p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&e1);
    let v = ray.dir().dot(&q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    Some((e2.dot(&q) * inv_det, u, v))
}

#[derive(Clone, Debug)]
enum Node {
    Leaf {
        bounds: Aabb,
        first: usize,
        count: usize,
    },
    Internal {
        bounds: Aabb,
        left: usize,
        right: usize,
    },
}

impl Node {
    fn bounds(&self) -> &Aabb {
        match self {
            Node::Leaf { bounds, .. } | Node::Internal { bounds, .. } => bounds,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Bvh {
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl Bvh {
    pub fn build(triangles: &[Triangle], max_leaf_size: usize) -> Self {
        let bounds: Vec<Aabb> =
            triangles.iter().map(Aabb::from_triangle).collect();
        let centers: Vec<Point3> = bounds.iter().map(Aabb::center).collect();
        let mut order: Vec<usize> = (0..triangles.len()).collect();
        let capacity = 2 * triangles.len() / max_leaf_size.max(1) + 1;
        let mut nodes = Vec::with_capacity(capacity);

        if !triangles.is_empty() {
            let builder = Builder {
                bounds: &bounds,
                centers: &centers,
                max_leaf_size: max_leaf_size.max(1),
            };
            builder.build(&mut nodes, &mut order, 0);
        }

        Self { nodes, order }
    }

    /// Recomputes node bounds after the triangles moved, keeping the tree
    /// topology.
    pub fn refit(&mut self, triangles: &[Triangle]) {
        for i in (0..self.nodes.len()).rev() {
            let new_bounds = match &self.nodes[i] {
                Node::Leaf { first, count, .. } => self.order
                    [*first..*first + *count]
                    .iter()
                    .fold(Aabb::empty(), |acc, &t| {
                        acc.union(&Aabb::from_triangle(&triangles[t]))
                    }),
                Node::Internal { left, right, .. } => self.nodes[*left]
                    .bounds()
                    .union(self.nodes[*right].bounds()),
            };
            match &mut self.nodes[i] {
                Node::Leaf { bounds, .. } | Node::Internal { bounds, .. } => {
                    *bounds = new_bounds
                }
            }
        }
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.nodes.first().map(|n| *n.bounds())
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Nearest hit with `t_min < t < t_max`.
    pub fn closest(
        &self,
        triangles: &[Triangle],
        ray: &Ray,
        t_min: f64,
        t_max: f64,
        cull: CullMode,
    ) -> Option<TriangleHit> {
        let data = RayData::new(ray);
        let mut best: Option<TriangleHit> = None;
        let mut t_best = t_max;

        let mut stack = Vec::with_capacity(32);
        let root_hit = self
            .nodes
            .first()
            .and_then(|n| n.bounds().hit(&data, t_min, t_best));
        if let Some(t) = root_hit {
            stack.push((0, t));
        }

        while let Some((idx, t_entry)) = stack.pop() {
            if t_entry > t_best {
                continue;
            }
            match &self.nodes[idx] {
                Node::Leaf { first, count, .. } => {
                    for &tri in &self.order[*first..*first + *count] {
                        let tri_hit =
                            intersect_triangle(&triangles[tri], ray, cull);
                        if let Some((t, u, v)) = tri_hit {
                            if t > t_min && t < t_best {
                                t_best = t;
                                let [p0, p1, p2] = triangles[tri];
                                best = Some(TriangleHit {
                                    tri,
                                    t,
                                    u,
                                    v,
                                    normal: (p1 - p0).cross(&(p2 - p0)),
                                });
                            }
                        }
                    }
                }
                Node::Internal { left, right, .. } => {
                    let hit = |i: usize| {
                        self.nodes[i].bounds().hit(&data, t_min, t_best)
                    };
                    match (hit(*left), hit(*right)) {
                        (Some(lt), Some(rt)) => {
                            // Near child goes on top of the stack.
                            if lt < rt {
                                stack.push((*right, rt));
                                stack.push((*left, lt));
                            } else {
                                stack.push((*left, lt));
                                stack.push((*right, rt));
                            }
                        }
                        (Some(lt), None) => stack.push((*left, lt)),
                        (None, Some(rt)) => stack.push((*right, rt)),
                        (None, None) => (),
                    }
                }
            }
        }

        best
    }

    /// Whether anything is hit with `t_min < t < t_max`.
    pub fn any(
        &self,
        triangles: &[Triangle],
        ray: &Ray,
        t_min: f64,
        t_max: f64,
        cull: CullMode,
    ) -> bool {
        let data = RayData::new(ray);
        let mut stack = Vec::with_capacity(32);
        if !self.nodes.is_empty() {
            stack.push(0);
        }

        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.bounds().hit(&data, t_min, t_max).is_none() {
                continue;
            }
            match node {
                Node::Leaf { first, count, .. } => {
                    let leaf = &self.order[*first..*first + *count];
                    let found = leaf.iter().any(|&tri| {
                        matches!(
                            intersect_triangle(&triangles[tri], ray, cull),
                            Some((t, _, _)) if t > t_min && t < t_max
                        )
                    });
                    if found {
                        return true;
                    }
                }
                Node::Internal { left, right, .. } => {
                    stack.push(*right);
                    stack.push(*left);
                }
            }
        }

        false
    }
}

struct Builder<'a> {
    bounds: &'a [Aabb],
    centers: &'a [Point3],
    max_leaf_size: usize,
}

impl<'a> Builder<'a> {
    fn build(
        &self,
        nodes: &mut Vec<Node>,
        order: &mut [usize],
        first: usize,
    ) -> usize {
        let bounds = order
            .iter()
            .fold(Aabb::empty(), |acc, &t| acc.union(&self.bounds[t]));

        let idx = nodes.len();
        if order.len() <= self.max_leaf_size {
            nodes.push(Node::Leaf {
                bounds,
                first,
                count: order.len(),
            });
            return idx;
        }

        // Placeholder, replaced once both children exist.
        nodes.push(Node::Leaf {
            bounds,
            first,
            count: 0,
        });

        let mut mid = match self.find_split(order) {
            Some((axis, pos)) => {
                partition(order, |t| self.centers[t][axis] < pos)
            }
            None => 0,
        };
        if mid == 0 || mid == order.len() {
            mid = order.len() / 2;
        }

        let (left_order, right_order) = order.split_at_mut(mid);
        let left = self.build(nodes, left_order, first);
        let right = self.build(nodes, right_order, first + mid);
        nodes[idx] = Node::Internal {
            bounds,
            left,
            right,
        };
        idx
    }

    /// Picks the bucket boundary with the lowest surface area cost.
    fn find_split(&self, order: &[usize]) -> Option<(usize, f64)> {
        let mut centroid_bounds = Aabb::empty();
        for &t in order {
            centroid_bounds.include(&self.centers[t]);
        }
        let extent = centroid_bounds.max - centroid_bounds.min;

        let mut best: Option<(usize, f64)> = None;
        let mut best_cost = f64::INFINITY;

        for axis in 0..3 {
            if extent[axis] < 1e-12 {
                continue;
            }
            let axis_min = centroid_bounds.min[axis];
            let bucket_of = |t: usize| {
                let rel = (self.centers[t][axis] - axis_min) / extent[axis];
                let bucket = (rel * NUM_SAH_BUCKETS as f64) as usize;
                bucket.min(NUM_SAH_BUCKETS - 1)
            };

            let mut counts = [0usize; NUM_SAH_BUCKETS];
            let mut boxes = [Aabb::empty(); NUM_SAH_BUCKETS];
            for &t in order {
                let b = bucket_of(t);
                counts[b] += 1;
                boxes[b] = boxes[b].union(&self.bounds[t]);
            }

            for split in 1..NUM_SAH_BUCKETS {
                let gather = |range: std::ops::Range<usize>| {
                    range.fold((0, Aabb::empty()), |(c, b), i| {
                        (c + counts[i], b.union(&boxes[i]))
                    })
                };
                let (lc, lb) = gather(0..split);
                let (rc, rb) = gather(split..NUM_SAH_BUCKETS);
                if lc == 0 || rc == 0 {
                    continue;
                }
                let cost = lc as f64 * lb.surface_area()
                    + rc as f64 * rb.surface_area();
                if cost < best_cost {
                    best_cost = cost;
                    let pos = axis_min
                        + extent[axis] * split as f64 / NUM_SAH_BUCKETS as f64;
                    best = Some((axis, pos));
                }
            }
        }

        best
    }
}

/// Moves elements matching `pred` to the front and returns their count.
fn partition<F: Fn(usize) -> bool>(order: &mut [usize], pred: F) -> usize {
    let mut mid = 0;
    for i in 0..order.len() {
        if pred(order[i]) {
            order.swap(i, mid);
            mid += 1;
        }
    }
    mid
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::mesh::test::new_cube_mesh;

    const INF: f64 = f64::INFINITY;

    fn cube_triangles() -> Vec<Triangle> {
        let mesh = new_cube_mesh(
            Point3::new(-1.0, -1.0, -1.0),
            Point3::new(1.0, 1.0, 1.0),
        );
        (0..mesh.faces.len()).map(|i| mesh.triangle(i)).collect()
    }

    fn random_triangles(rng: &mut StdRng, n: usize) -> Vec<Triangle> {
        (0..n)
            .map(|_| {
                let c = Point3::new(
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-5.0..5.0),
                );
                let mut offset = || {
                    Vector3::new(
                        rng.gen_range(-0.5..0.5),
                        rng.gen_range(-0.5..0.5),
                        rng.gen_range(-0.5..0.5),
                    )
                };
                [c + offset(), c + offset(), c + offset()]
            })
            .collect()
    }

    fn brute_force(
        triangles: &[Triangle],
        ray: &Ray,
        cull: CullMode,
    ) -> Option<(usize, f64)> {
        triangles
            .iter()
            .enumerate()
            .filter_map(|(i, tri)| {
                intersect_triangle(tri, ray, cull).map(|(t, _, _)| (i, t))
            })
            .filter(|&(_, t)| t > 0.0)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
    }

    #[test]
    fn test_intersect_triangle_culling() {
        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let front = Ray::new(Point3::new(0.25, 0.25, 1.0), -Vector3::z());
        let back = Ray::new(Point3::new(0.25, 0.25, -1.0), Vector3::z());

        let (t, u, v) =
            intersect_triangle(&tri, &front, CullMode::Back).unwrap();
        assert_eq!((t, u, v), (1.0, 0.25, 0.25));
        assert!(intersect_triangle(&tri, &back, CullMode::Back).is_none());
        assert!(intersect_triangle(&tri, &back, CullMode::None).is_some());

        let outside = Ray::new(Point3::new(0.75, 0.75, 1.0), -Vector3::z());
        assert!(intersect_triangle(&tri, &outside, CullMode::None).is_none());
    }

    #[test]
    fn test_cube_hits() {
        let triangles = cube_triangles();
        let bvh = Bvh::build(&triangles, 4);
        let bounds = bvh.bounds().unwrap();
        assert_eq!(bounds.min, Point3::new(-1.0, -1.0, -1.0));
        assert_eq!(bounds.max, Point3::new(1.0, 1.0, 1.0));

        let ray = Ray::new(Point3::new(0.1, 0.2, 5.0), -Vector3::z());
        let hit = bvh
            .closest(&triangles, &ray, 0.0, INF, CullMode::Back)
            .unwrap();
        assert!((hit.t - 4.0).abs() < 1e-12);
        assert!(hit.normal.normalize().dot(&Vector3::z()) > 0.999);

        // From inside, back faces are culled.
        let inside = Ray::new(Point3::origin(), Vector3::x());
        let culled = bvh.closest(&triangles, &inside, 0.0, INF, CullMode::Back);
        assert!(culled.is_none());
        assert!(bvh.any(&triangles, &inside, 0.0, INF, CullMode::None));
        assert!(!bvh.any(&triangles, &inside, 0.0, 0.5, CullMode::None));

        let miss = Ray::new(Point3::new(3.0, 0.0, 5.0), -Vector3::z());
        assert!(!bvh.any(&triangles, &miss, 0.0, INF, CullMode::None));
    }

    #[test]
    fn test_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(0);
        let triangles = random_triangles(&mut rng, 500);
        let bvh = Bvh::build(&triangles, 4);
        assert!(bvh.num_nodes() > 1);

        for _ in 0..500 {
            let origin = Point3::new(
                rng.gen_range(-8.0..8.0),
                rng.gen_range(-8.0..8.0),
                rng.gen_range(-8.0..8.0),
            );
            let target = Point3::new(
                rng.gen_range(-4.0..4.0),
                rng.gen_range(-4.0..4.0),
                rng.gen_range(-4.0..4.0),
            );
            let ray = Ray::new(origin, target - origin);
            for cull in [CullMode::None, CullMode::Back] {
                let expected = brute_force(&triangles, &ray, cull);
                let actual = bvh.closest(&triangles, &ray, 0.0, INF, cull);
                assert_eq!(expected.map(|e| e.1), actual.map(|a| a.t));
                assert_eq!(
                    expected.is_some(),
                    bvh.any(&triangles, &ray, 0.0, INF, cull)
                );
            }
        }
    }

    #[test]
    fn test_refit_after_translation() {
        let mut triangles = cube_triangles();
        let mut bvh = Bvh::build(&triangles, 2);
        let shift = Vector3::new(10.0, 0.0, 0.0);
        for tri in triangles.iter_mut() {
            for p in tri.iter_mut() {
                *p += shift;
            }
        }
        bvh.refit(&triangles);

        let bounds = bvh.bounds().unwrap();
        assert_eq!(bounds.min, Point3::new(9.0, -1.0, -1.0));
        let ray = Ray::new(Point3::new(10.0, 0.0, 5.0), -Vector3::z());
        let hit = bvh.closest(&triangles, &ray, 0.0, INF, CullMode::Back);
        assert!((hit.unwrap().t - 4.0).abs() < 1e-12);
    }
}
