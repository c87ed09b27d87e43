use std::sync::Arc;

use log::{info, warn};
use rayon::prelude::*;

use crate::camera::InputCamera;
use crate::mesh::Mesh;
use crate::misc::{Point3, Vector2, Vector3};
use crate::raycaster::{CullMode, Device, GeomId, Ray, RayHit, Raycaster};
use base::defs::Result;

/// Pixel stride of the grid sampled by `compute_clipping_planes`.
const CLIPPING_PIXEL_STRIDE: usize = 15;
const MIN_CLIPPING_RATIO: f64 = 100.0;

/// World-space steps between neighbouring pixels on the plane at unit
/// distance in front of a camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelDerivatives {
    pub dx: Vector3,
    pub dy: Vector3,
    /// World position of the top-left image corner on that plane.
    pub up_left_offset: Point3,
}

impl PixelDerivatives {
    pub fn new(cam: &InputCamera) -> Self {
        let dir = cam.dir();
        let up = cam.up();

        let height = 2.0 * (cam.fovy / 2.0).tan();
        let width = height * cam.aspect;

        let right = dir.cross(&up);
        let row = right * width;
        let col = -up * height;

        Self {
            dx: row / cam.w as f64,
            dy: col / cam.h as f64,
            up_left_offset: cam.position + dir - row / 2.0 - col / 2.0,
        }
    }

    pub fn world_pos(&self, pixel: &Vector2) -> Point3 {
        self.up_left_offset + self.dx * pixel.x + self.dy * pixel.y
    }
}

/// Receives the result of every ray cast by
/// `CameraRaycaster::cast_for_each_pixel`.
pub trait CameraRaycasterProcessor {
    fn on_cast(&mut self, px: u32, py: u32, hit: &RayHit);
}

/// Casts camera rays through image pixels against its own scene.
pub struct CameraRaycaster {
    raycaster: Raycaster,
}

impl CameraRaycaster {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            raycaster: Raycaster::new(device, CullMode::Back),
        }
    }

    pub fn raycaster(&self) -> &Raycaster {
        &self.raycaster
    }

    pub fn add_mesh(&mut self, mesh: &Mesh) -> Result<GeomId> {
        self.raycaster.add_mesh(mesh)
    }

    pub fn compute_pixel_derivatives(cam: &InputCamera) -> PixelDerivatives {
        PixelDerivatives::new(cam)
    }

    /// Unit direction from the camera center through image position `pixel`
    /// (integer coordinates are pixel corners).
    pub fn compute_ray_dir(cam: &InputCamera, pixel: &Vector2) -> Vector3 {
        let derivs = PixelDerivatives::new(cam);
        (derivs.world_pos(pixel) - cam.position).normalize()
    }

    /// Casts one ray per pixel, row by row, and hands each result to every
    /// processor.
    pub fn cast_for_each_pixel(
        &self,
        cam: &InputCamera,
        processors: &mut [&mut dyn CameraRaycasterProcessor],
    ) {
        let derivs = PixelDerivatives::new(cam);
        for py in 0..cam.h {
            for px in 0..cam.w {
                let pixel = Vector2::new(px as f64, py as f64);
                let dir = derivs.world_pos(&pixel) - cam.position;
                let ray = Ray::new(cam.position, dir);
                let hit = self.raycaster.intersect(&ray, 0.0);
                for processor in processors.iter_mut() {
                    processor.on_cast(px, py, &hit);
                }
            }
        }
    }

    /// Fits near and far planes of every camera to the visible part of
    /// `mesh` and returns them as `[znear, zfar]`. Cameras that see nothing
    /// keep their planes.
    pub fn compute_clipping_planes(
        device: &Arc<Device>,
        mesh: &Mesh,
        cams: &mut [InputCamera],
    ) -> Result<Vec<[f64; 2]>> {
        info!("  computing clipping planes of {} cameras...", cams.len());

        let mut raycaster = Raycaster::new(device, CullMode::None);
        raycaster.add_mesh(mesh)?;

        let planes: Vec<[f64; 2]> = device.install(|| {
            cams.par_iter_mut()
                .enumerate()
                .map(|(i, cam)| {
                    match fit_clipping_planes(&raycaster, cam) {
                        Some([znear, zfar]) => {
                            cam.set_clipping_planes(znear, zfar)
                        }
                        None => warn!("camera {} does not see the mesh", i),
                    }
                    [cam.znear, cam.zfar]
                })
                .collect()
        });

        Ok(planes)
    }
}

fn fit_clipping_planes(
    raycaster: &Raycaster,
    cam: &InputCamera,
) -> Option<[f64; 2]> {
    let derivs = PixelDerivatives::new(cam);
    let cam_z = cam.dir().normalize();

    let mut range: Option<(f64, f64)> = None;
    for i in (0..cam.h).step_by(CLIPPING_PIXEL_STRIDE) {
        for j in (0..cam.w).step_by(CLIPPING_PIXEL_STRIDE) {
            let pixel = Vector2::new(j as f64 + 0.5, i as f64 + 0.5);
            let dir = (derivs.world_pos(&pixel) - cam.position).normalize();
            let hit = raycaster.intersect(&Ray::new(cam.position, dir), 0.0);
            if !hit.hit_something() {
                continue;
            }

            let clip_dist = hit.dist() * dir.dot(&cam_z).abs();
            range = Some(match range {
                Some((lo, hi)) => (lo.min(clip_dist), hi.max(clip_dist)),
                None => (clip_dist, clip_dist),
            });
        }
    }

    let (lo, hi) = range?;
    let mut znear = 0.5 * lo;
    let mut zfar = 2.0 * hi;
    if znear <= 0.0 {
        return None;
    }
    while zfar / znear < MIN_CLIPPING_RATIO {
        zfar *= 1.1;
        znear *= 0.9;
    }
    Some([znear, zfar])
}
