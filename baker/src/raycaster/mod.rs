mod bvh;
mod camera_raycaster;
mod ray;

use std::sync::Arc;

use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::mesh::Mesh;
use crate::misc::{normalize_or_keep, Matrix4, Point3, Vector2, Vector3};
use base::defs::{Error, ErrorKind::*, Result};

pub use bvh::{intersect_triangle, Aabb, Bvh, CullMode, Triangle};
pub use camera_raycaster::*;
pub use ray::{BarycentricCoord, GeomId, Primitive, Ray, RayHit};

use ray::MIN_NORMAL_LENGTH;

pub const DEFAULT_MAX_LEAF_SIZE: usize = 4;

#[derive(Clone, Copy, Debug)]
pub struct DeviceParams {
    /// Worker threads for parallel passes, zero for one per core.
    pub num_threads: usize,
    /// Maximal number of triangles in a BVH leaf.
    pub max_leaf_size: usize,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            num_threads: 0,
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
        }
    }
}

/// Shared acceleration-structure context: the worker pool that runs the
/// parallel passes and the BVH build parameters. Every `Raycaster` keeps
/// the device alive.
pub struct Device {
    pool: ThreadPool,
    params: DeviceParams,
}

impl Device {
    pub fn new(params: DeviceParams) -> Result<Arc<Device>> {
        if params.max_leaf_size == 0 {
            let desc = "BVH leaf size must be positive".to_string();
            return Err(Error::new(InvalidArgument, desc));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(params.num_threads)
            .thread_name(|i| format!("baker-worker-{}", i))
            .build()
            .map_err(|e| {
                let desc = "failed to create ray casting device".to_string();
                Error::with_source(DeviceError, desc, e)
            })?;

        info!(
            "  ray casting device started with {} threads",
            pool.current_num_threads()
        );
        Ok(Arc::new(Self { pool, params }))
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the device's worker pool, so that rayon iterators
    /// it creates use the device threads.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

struct Geometry {
    faces: Vec<[usize; 3]>,
    triangles: Vec<Triangle>,
    bvh: Bvh,
    dynamic: bool,
    enabled: bool,
}

impl Geometry {
    fn set_positions(&mut self, positions: &[Point3]) {
        for (tri, face) in self.triangles.iter_mut().zip(&self.faces) {
            *tri = [positions[face[0]], positions[face[1]], positions[face[2]]];
        }
    }
}

/// Center and extent of a transformed geometry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct XformSummary {
    pub center: Point3,
    /// Largest distance from `center` to a vertex.
    pub radius: f64,
}

/// Scene of triangle meshes answering nearest-hit and occlusion queries.
/// Queries take `&self` and can run from many threads at once; geometry
/// changes take `&mut self`.
pub struct Raycaster {
    device: Arc<Device>,
    cull: CullMode,
    geoms: Vec<Option<Geometry>>,
}

impl Raycaster {
    pub fn new(device: &Arc<Device>, cull: CullMode) -> Self {
        Self {
            device: device.clone(),
            cull,
            geoms: vec![],
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn cull_mode(&self) -> CullMode {
        self.cull
    }

    pub fn num_geoms(&self) -> usize {
        self.geoms.iter().filter(|g| g.is_some()).count()
    }

    pub fn add_mesh(&mut self, mesh: &Mesh) -> Result<GeomId> {
        self.add_geometry(mesh, false)
    }

    /// Adds a mesh whose vertices are expected to move through
    /// `xform_mesh_only`, which then refits instead of rebuilding.
    pub fn add_dynamic_mesh(&mut self, mesh: &Mesh) -> Result<GeomId> {
        self.add_geometry(mesh, true)
    }

    fn add_geometry(&mut self, mesh: &Mesh, dynamic: bool) -> Result<GeomId> {
        mesh.validate()?;

        let triangles: Vec<Triangle> =
            (0..mesh.faces.len()).map(|i| mesh.triangle(i)).collect();
        let bvh = Bvh::build(&triangles, self.device.params.max_leaf_size);

        let id = GeomId(self.geoms.len());
        debug!(
            "added geometry {} with {} triangles ({} BVH nodes)",
            id.0,
            triangles.len(),
            bvh.num_nodes()
        );

        self.geoms.push(Some(Geometry {
            faces: mesh.faces.clone(),
            triangles,
            bvh,
            dynamic,
            enabled: true,
        }));
        Ok(id)
    }

    fn geom_mut(&mut self, id: GeomId) -> Result<&mut Geometry> {
        match self.geoms.get_mut(id.0) {
            Some(Some(geom)) => Ok(geom),
            _ => {
                let desc = format!("unknown geometry {}", id.0);
                Err(Error::new(InvalidArgument, desc))
            }
        }
    }

    /// Resets the geometry's vertices to the ones of `mesh` transformed by
    /// `xform`. `mesh` must have the topology the geometry was added with.
    pub fn xform_mesh_only(
        &mut self,
        mesh: &Mesh,
        id: GeomId,
        xform: &Matrix4,
    ) -> Result<XformSummary> {
        let max_leaf_size = self.device.params.max_leaf_size;
        let geom = self.geom_mut(id)?;
        if mesh.faces != geom.faces {
            let desc = format!("mesh topology differs from geometry {}", id.0);
            return Err(Error::new(InconsistentState, desc));
        }

        let positions: Vec<Point3> = mesh
            .vertices
            .iter()
            .map(|p| xform.transform_point(p))
            .collect();
        geom.set_positions(&positions);
        if geom.dynamic {
            geom.bvh.refit(&geom.triangles);
        } else {
            geom.bvh = Bvh::build(&geom.triangles, max_leaf_size);
        }

        let center = if positions.is_empty() {
            Point3::origin()
        } else {
            let sum: Vector3 = positions.iter().map(|p| p.coords).sum();
            Point3::from(sum / positions.len() as f64)
        };
        let radius = positions
            .iter()
            .map(|p| (p - center).norm())
            .fold(0.0, f64::max);

        Ok(XformSummary { center, radius })
    }

    pub fn enable_geom(&mut self, id: GeomId) -> Result<()> {
        self.geom_mut(id)?.enabled = true;
        Ok(())
    }

    pub fn disable_geom(&mut self, id: GeomId) -> Result<()> {
        self.geom_mut(id)?.enabled = false;
        Ok(())
    }

    pub fn delete_geom(&mut self, id: GeomId) -> Result<()> {
        self.geom_mut(id)?;
        self.geoms[id.0] = None;
        Ok(())
    }

    pub fn clear_geometry(&mut self) {
        self.geoms.clear();
    }

    fn active_geoms(&self) -> impl Iterator<Item = (usize, &Geometry)> {
        self.geoms
            .iter()
            .enumerate()
            .filter_map(|(i, g)| {
                g.as_ref().filter(|g| g.enabled).map(|g| (i, g))
            })
    }

    /// Nearest hit farther than `min_dist` along the ray.
    pub fn intersect(&self, ray: &Ray, min_dist: f64) -> RayHit {
        let mut best = None;
        let mut t_max = f64::INFINITY;
        for (i, geom) in self.active_geoms() {
            let hit = geom.bvh.closest(
                &geom.triangles,
                ray,
                min_dist,
                t_max,
                self.cull,
            );
            if let Some(hit) = hit {
                t_max = hit.t;
                best = Some((i, hit));
            }
        }

        match best {
            Some((i, hit)) => RayHit::new(
                *ray,
                hit.t,
                BarycentricCoord { u: hit.u, v: hit.v },
                hit.normal,
                Primitive::new(hit.tri, GeomId(i)),
            ),
            None => RayHit::miss(*ray),
        }
    }

    /// Occlusion query, equivalent to `intersect(..).hit_something()`.
    pub fn hit_something(&self, ray: &Ray, min_dist: f64) -> bool {
        self.active_geoms().any(|(_, geom)| {
            let t_max = f64::INFINITY;
            geom.bvh.any(&geom.triangles, ray, min_dist, t_max, self.cull)
        })
    }

    /// Batched `intersect`; lanes with `valid` unset report a miss.
    pub fn intersect8(
        &self,
        rays: &[Ray; 8],
        valid: [bool; 8],
        min_dist: f64,
    ) -> [RayHit; 8] {
        let mut hits = rays.map(RayHit::miss);
        for (i, hit) in hits.iter_mut().enumerate() {
            if valid[i] {
                *hit = self.intersect(&rays[i], min_dist);
            }
        }
        hits
    }

    pub fn hit_something8(&self, rays: &[Ray; 8], min_dist: f64) -> [bool; 8] {
        let mut hits = [false; 8];
        for (hit, ray) in hits.iter_mut().zip(rays) {
            *hit = self.hit_something(ray, min_dist);
        }
        hits
    }

    fn hit_face(mesh: &Mesh, hit: &RayHit) -> Option<[usize; 3]> {
        mesh.faces.get(hit.primitive()?.tri_id).copied()
    }

    /// Vertex normals of `mesh` interpolated at the hit point.
    pub fn smooth_normal(mesh: &Mesh, hit: &RayHit) -> Option<Vector3> {
        if !mesh.has_normals() {
            return None;
        }
        let [v0, v1, v2] = Self::hit_face(mesh, hit)?;
        let w = hit.interpolate_uv();
        let n = w[0] * mesh.normals[v0]
            + w[1] * mesh.normals[v1]
            + w[2] * mesh.normals[v2];
        Some(normalize_or_keep(n, MIN_NORMAL_LENGTH))
    }

    pub fn smooth_uv(mesh: &Mesh, hit: &RayHit) -> Option<Vector2> {
        if !mesh.has_uvs() {
            return None;
        }
        let [v0, v1, v2] = Self::hit_face(mesh, hit)?;
        let w = hit.interpolate_uv();
        Some(w[0] * mesh.uvs[v0] + w[1] * mesh.uvs[v1] + w[2] * mesh.uvs[v2])
    }

    pub fn smooth_position(mesh: &Mesh, hit: &RayHit) -> Option<Point3> {
        let [v0, v1, v2] = Self::hit_face(mesh, hit)?;
        let w = hit.interpolate_uv();
        let p = w[0] * mesh.vertices[v0].coords
            + w[1] * mesh.vertices[v1].coords
            + w[2] * mesh.vertices[v2].coords;
        Some(Point3::from(p))
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    use base::{assert_eq_f64, assert_eq_vector3};

    use crate::mesh::test::{new_cube_mesh, new_quad_mesh};

    pub fn new_device() -> Arc<Device> {
        let params = DeviceParams {
            num_threads: 2,
            ..Default::default()
        };
        Device::new(params).unwrap()
    }

    fn down_ray(x: f64, y: f64) -> Ray {
        Ray::new(Point3::new(x, y, 5.0), -Vector3::z())
    }

    #[test]
    fn test_device_rejects_zero_leaf_size() {
        let params = DeviceParams {
            max_leaf_size: 0,
            ..Default::default()
        };
        assert_eq!(Device::new(params).err().unwrap().kind, InvalidArgument);
    }

    #[test]
    fn test_add_invalid_mesh() {
        let mut rc = Raycaster::new(&new_device(), CullMode::None);
        let mut mesh = new_quad_mesh();
        mesh.faces.push([0, 1, 9]);
        assert!(rc.add_mesh(&mesh).is_err());
        assert_eq!(rc.num_geoms(), 0);
    }

    #[test]
    fn test_intersect_reports_primitive() {
        let mut rc = Raycaster::new(&new_device(), CullMode::Back);
        let quad = rc.add_mesh(&new_quad_mesh()).unwrap();

        let hit = rc.intersect(&down_ray(0.8, 0.2), 0.0);
        assert!(hit.hit_something());
        assert_eq_f64!(hit.dist(), 5.0);
        assert_eq!(hit.primitive().unwrap().geom_id, quad);
        assert_eq!(hit.primitive().unwrap().tri_id, 0);
        assert!(!hit.primitive().unwrap().is_instanced());
        assert_eq_vector3!(hit.normal(), Vector3::z());
        assert!(rc.hit_something(&down_ray(0.8, 0.2), 0.0));

        assert!(!rc.intersect(&down_ray(1.5, 0.2), 0.0).hit_something());
        assert!(!rc.intersect(&down_ray(0.8, 0.2), 5.5).hit_something());
    }

    #[test]
    fn test_nearest_geometry_wins() {
        let mut rc = Raycaster::new(&new_device(), CullMode::None);
        let far = rc.add_mesh(&new_quad_mesh()).unwrap();
        let cube = new_cube_mesh(
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 2.0),
        );
        let near = rc.add_mesh(&cube).unwrap();

        let hit = rc.intersect(&down_ray(0.3, 0.6), 0.0);
        assert_eq!(hit.primitive().unwrap().geom_id, near);
        assert_eq_f64!(hit.dist(), 3.0);

        rc.disable_geom(near).unwrap();
        let hit = rc.intersect(&down_ray(0.3, 0.6), 0.0);
        assert_eq!(hit.primitive().unwrap().geom_id, far);

        rc.enable_geom(near).unwrap();
        rc.delete_geom(near).unwrap();
        assert_eq!(rc.num_geoms(), 1);
        assert!(rc.enable_geom(near).is_err());
        let hit = rc.intersect(&down_ray(0.3, 0.6), 0.0);
        assert_eq!(hit.primitive().unwrap().geom_id, far);

        rc.clear_geometry();
        assert!(!rc.hit_something(&down_ray(0.3, 0.6), 0.0));
    }

    #[test]
    fn test_batched_queries_match_scalar() {
        let mut rc = Raycaster::new(&new_device(), CullMode::Back);
        rc.add_mesh(&new_quad_mesh()).unwrap();

        let rays = [
            down_ray(0.1, 0.1),
            down_ray(0.9, 0.1),
            down_ray(1.1, 0.1),
            down_ray(0.5, 0.5),
            Ray::new(Point3::new(0.5, 0.5, -5.0), Vector3::z()),
            down_ray(-0.1, 0.5),
            down_ray(0.2, 0.9),
            down_ray(0.7, 0.3),
        ];
        let valid = [true, true, true, true, true, true, false, true];

        let hits = rc.intersect8(&rays, valid, 0.0);
        let occluded = rc.hit_something8(&rays, 0.0);
        for i in 0..8 {
            let scalar = rc.intersect(&rays[i], 0.0);
            if valid[i] {
                assert_eq!(hits[i], scalar);
            } else {
                assert!(!hits[i].hit_something());
            }
            assert_eq!(occluded[i], scalar.hit_something());
        }
        assert!(!occluded[4]);
    }

    #[test]
    fn test_xform_mesh_only() {
        let mesh = new_quad_mesh();
        for dynamic in [false, true] {
            let mut rc = Raycaster::new(&new_device(), CullMode::Back);
            let id = if dynamic {
                rc.add_dynamic_mesh(&mesh).unwrap()
            } else {
                rc.add_mesh(&mesh).unwrap()
            };

            let xform = Matrix4::new_translation(&Vector3::new(2.0, 0.0, 1.0));
            let summary = rc.xform_mesh_only(&mesh, id, &xform).unwrap();
            assert_eq_vector3!(summary.center, Point3::new(2.5, 0.5, 1.0));
            assert_eq_f64!(summary.radius, 0.5f64.sqrt());

            assert!(!rc.hit_something(&down_ray(0.5, 0.5), 0.0));
            assert_eq_f64!(rc.intersect(&down_ray(2.7, 0.4), 0.0).dist(), 4.0);

            // Transforms always start from the caller's vertices.
            let summary = rc.xform_mesh_only(&mesh, id, &xform).unwrap();
            assert_eq_vector3!(summary.center, Point3::new(2.5, 0.5, 1.0));
        }
    }

    #[test]
    fn test_smooth_attributes() {
        let mut mesh = new_quad_mesh();
        mesh.generate_normals();
        let mut rc = Raycaster::new(&new_device(), CullMode::Back);
        rc.add_mesh(&mesh).unwrap();

        let hit = rc.intersect(&down_ray(0.75, 0.25), 0.0);
        let uv = Raycaster::smooth_uv(&mesh, &hit).unwrap();
        assert_eq_f64!(uv.x, 0.75);
        assert_eq_f64!(uv.y, 0.25);
        let p = Raycaster::smooth_position(&mesh, &hit).unwrap();
        assert_eq_vector3!(p, hit.point());
        let n = Raycaster::smooth_normal(&mesh, &hit).unwrap();
        assert_eq_vector3!(n, Vector3::z());

        let miss = rc.intersect(&down_ray(3.0, 0.0), 0.0);
        assert!(Raycaster::smooth_uv(&mesh, &miss).is_none());
    }

    #[test]
    fn test_smooth_normal_of_degenerate_normals() {
        let mut mesh = new_quad_mesh();
        mesh.normals = vec![Vector3::zeros(); 4];
        let mut rc = Raycaster::new(&new_device(), CullMode::Back);
        rc.add_mesh(&mesh).unwrap();

        let hit = rc.intersect(&down_ray(0.75, 0.25), 0.0);
        let n = Raycaster::smooth_normal(&mesh, &hit).unwrap();
        assert_eq!(n, Vector3::zeros());
    }
}
