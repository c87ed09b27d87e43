use crate::misc::{normalize_or_keep, Point3, Vector3};

/// Minimal length under which a hit normal is left unnormalized.
pub(crate) const MIN_NORMAL_LENGTH: f64 = 1e-10;

/// Opaque handle of a geometry registered in a `Raycaster`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeomId(pub(crate) usize);

impl GeomId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    origin: Point3,
    dir: Vector3,
}

impl Ray {
    /// The direction is normalized unless it is zero.
    pub fn new(origin: Point3, dir: Vector3) -> Self {
        Self {
            origin,
            dir: normalize_or_keep(dir, 0.0),
        }
    }

    pub fn origin(&self) -> &Point3 {
        &self.origin
    }

    pub fn dir(&self) -> &Vector3 {
        &self.dir
    }

    pub fn at(&self, t: f64) -> Point3 {
        self.origin + self.dir * t
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BarycentricCoord {
    pub u: f64,
    pub v: f64,
}

/// Triangle that was hit, identified within its geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Primitive {
    pub tri_id: usize,
    pub geom_id: GeomId,
    /// Instance the geometry was hit through, `Primitive::INVALID_ID` for
    /// geometry added directly to the scene.
    pub inst_id: usize,
}

impl Primitive {
    pub const INVALID_ID: usize = usize::MAX;

    pub fn new(tri_id: usize, geom_id: GeomId) -> Self {
        Self {
            tri_id,
            geom_id,
            inst_id: Self::INVALID_ID,
        }
    }

    pub fn is_instanced(&self) -> bool {
        self.inst_id != Self::INVALID_ID
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    ray: Ray,
    dist: f64,
    coord: BarycentricCoord,
    normal: Vector3,
    prim: Option<Primitive>,
}

impl RayHit {
    pub const INFINITE_DIST: f64 = f64::INFINITY;

    pub fn new(
        ray: Ray,
        dist: f64,
        coord: BarycentricCoord,
        normal: Vector3,
        prim: Primitive,
    ) -> Self {
        Self {
            ray,
            dist: dist.max(0.0),
            coord,
            normal: normalize_or_keep(normal, MIN_NORMAL_LENGTH),
            prim: Some(prim),
        }
    }

    pub fn miss(ray: Ray) -> Self {
        Self {
            ray,
            dist: Self::INFINITE_DIST,
            coord: BarycentricCoord { u: 0.0, v: 0.0 },
            normal: Vector3::zeros(),
            prim: None,
        }
    }

    pub fn hit_something(&self) -> bool {
        self.dist != Self::INFINITE_DIST
    }

    pub fn ray(&self) -> &Ray {
        &self.ray
    }

    pub fn dist(&self) -> f64 {
        self.dist
    }

    pub fn barycentric_coord(&self) -> &BarycentricCoord {
        &self.coord
    }

    pub fn normal(&self) -> &Vector3 {
        &self.normal
    }

    pub fn primitive(&self) -> Option<&Primitive> {
        self.prim.as_ref()
    }

    pub fn point(&self) -> Point3 {
        self.ray.at(self.dist)
    }

    /// Weights `(w, u, v)` of the three triangle vertices with `w` clamped
    /// at zero.
    pub fn interpolate_uv(&self) -> Vector3 {
        let BarycentricCoord { u, v } = self.coord;
        Vector3::new((1.0 - u - v).max(0.0), u, v)
    }
}
