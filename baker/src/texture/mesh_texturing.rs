use std::cmp::Ordering;
use std::sync::Arc;

use derive_more::{Add, AddAssign};
use image::{imageops, GrayImage, Luma, Rgb32FImage, RgbImage};
use log::{error, info, warn};
use rayon::prelude::*;

use crate::camera::InputCamera;
use crate::mesh::Mesh;
use crate::misc::{normalize_or_keep, Point3, Vector2, Vector3};
use crate::raycaster::{CullMode, Device, Ray, RayHit, Raycaster};
use crate::texture::{
    count_covered, flood_fill, sample_bilinear, to_rgb8, GapFill, MaskImage,
    PoissonParams, PoissonReconstruction, TextureOptions, COVERED, UNCOVERED,
};
use base::defs::{Error, ErrorKind::*, Result};

/// Slack below which an occluder in front of a surface point is ignored.
const OCCLUSION_EPSILON: f64 = 1e-4;

/// Texels visited, in order, when the texel itself lies outside every UV
/// triangle: first along rows and columns, then diagonally.
const NEIGHBOR_ORDER: [(i64, i64); 8] = [
    (0, -1),
    (0, 1),
    (-1, 0),
    (1, 0),
    (-1, -1),
    (-1, 1),
    (1, -1),
    (1, 1),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TexturingState {
    Uninitialized,
    MeshSet,
    Reprojected,
    Finalized,
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    color: Vector3,
    weight: f64,
}

#[derive(Add, AddAssign, Clone, Copy, Debug, Default)]
struct WeightedColor {
    color: Vector3,
    weight: f64,
}

/// Bakes a texture atlas for a UV-mapped mesh out of calibrated photos.
///
/// Every texel is traced back onto the mesh through its UV layout, the
/// resulting surface point is reprojected into each camera that sees it
/// unoccluded, and the samples are blended with weights favouring cameras
/// facing the surface.
pub struct MeshTexturing {
    device: Arc<Device>,
    accum: Rgb32FImage,
    mask: GrayImage,
    mesh: Option<Arc<Mesh>>,
    world_raycaster: Raycaster,
    uv_raycaster: Raycaster,
    poisson_params: PoissonParams,
    state: TexturingState,
}

impl MeshTexturing {
    pub fn new(device: &Arc<Device>, side: u32) -> Result<Self> {
        if side == 0 {
            let desc = "texture side must be positive".to_string();
            return Err(Error::new(InvalidArgument, desc));
        }

        Ok(Self {
            device: device.clone(),
            accum: Rgb32FImage::new(side, side),
            mask: GrayImage::new(side, side),
            mesh: None,
            world_raycaster: Raycaster::new(device, CullMode::None),
            uv_raycaster: Raycaster::new(device, CullMode::Back),
            poisson_params: PoissonParams::default(),
            state: TexturingState::Uninitialized,
        })
    }

    pub fn with_poisson_params(mut self, params: PoissonParams) -> Self {
        self.poisson_params = params;
        self
    }

    pub fn state(&self) -> TexturingState {
        self.state
    }

    pub fn side(&self) -> u32 {
        self.accum.width()
    }

    pub fn mesh(&self) -> Option<&Arc<Mesh>> {
        self.mesh.as_ref()
    }

    /// Blended colors in 0..255 space; uncovered texels are black.
    pub fn accumulator(&self) -> &Rgb32FImage {
        &self.accum
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Fraction of covered texels.
    pub fn coverage(&self) -> f64 {
        count_covered(&self.mask) as f64 / self.mask.as_raw().len() as f64
    }

    /// Sets the mesh to texture, which needs UV coordinates. Normals are
    /// generated on a private copy when missing. Resets the accumulator.
    pub fn set_mesh(&mut self, mesh: Arc<Mesh>) -> Result<()> {
        mesh.validate()?;
        if !mesh.has_uvs() {
            error!("the mesh to texture needs uv coordinates");
            let desc = "mesh has no uv coordinates".to_string();
            return Err(Error::new(InvalidArgument, desc));
        }

        let mesh = if mesh.has_normals() {
            mesh
        } else {
            let mut copy = Mesh::clone(&mesh);
            copy.generate_normals();
            Arc::new(copy)
        };

        info!("  generating uv mesh...");
        let uv_mesh = Mesh {
            vertices: mesh
                .uvs
                .iter()
                .map(|uv| Point3::new(uv.x, uv.y, 0.0))
                .collect(),
            faces: mesh.faces.clone(),
            ..Default::default()
        };

        let mut world_raycaster = Raycaster::new(&self.device, CullMode::None);
        world_raycaster.add_mesh(&mesh)?;
        let mut uv_raycaster = Raycaster::new(&self.device, CullMode::Back);
        uv_raycaster.add_mesh(&uv_mesh)?;

        self.world_raycaster = world_raycaster;
        self.uv_raycaster = uv_raycaster;
        self.mesh = Some(mesh);
        self.reset_accumulator();
        self.state = TexturingState::MeshSet;
        Ok(())
    }

    fn reset_accumulator(&mut self) {
        let side = self.side();
        self.accum = Rgb32FImage::new(side, side);
        self.mask = GrayImage::new(side, side);
    }

    /// Gathers color samples for every texel from `images`, taken by the
    /// matching `cameras`.
    pub fn reproject(
        &mut self,
        cameras: &[InputCamera],
        images: &[RgbImage],
    ) -> Result<()> {
        let mesh = match (&self.mesh, self.state) {
            (Some(mesh), s) if s != TexturingState::Uninitialized => {
                mesh.clone()
            }
            _ => {
                let desc = "no mesh to reproject onto".to_string();
                return Err(Error::new(InconsistentState, desc));
            }
        };

        if cameras.len() != images.len() {
            let desc = format!(
                "got {} images for {} cameras",
                images.len(),
                cameras.len()
            );
            return Err(Error::new(InvalidArgument, desc));
        }
        for (i, (cam, image)) in cameras.iter().zip(images).enumerate() {
            if image.dimensions() != (cam.w, cam.h) {
                let desc = format!(
                    "image {} is {:?} but camera expects {:?}",
                    i,
                    image.dimensions(),
                    (cam.w, cam.h)
                );
                return Err(Error::new(InvalidArgument, desc));
            }
        }

        if mesh.is_empty() {
            warn!("nothing to reproject: the mesh is empty");
            self.state = TexturingState::Reprojected;
            return Ok(());
        }

        info!(
            "  gathering color samples from {} cameras...",
            cameras.len()
        );

        let side = self.side() as usize;
        let reprojector = Reprojector {
            mesh: &mesh,
            world_raycaster: &self.world_raycaster,
            uv_raycaster: &self.uv_raycaster,
            side: side as f64,
            cameras,
            images,
        };
        let accum: &mut [f32] = &mut self.accum;
        let mask: &mut [u8] = &mut self.mask;

        self.device.install(|| {
            accum
                .par_chunks_mut(3 * side)
                .zip(mask.par_chunks_mut(side))
                .enumerate()
                .for_each(|(py, (accum_row, mask_row))| {
                    for px in 0..side {
                        let color =
                            reprojector.texel_color(px as i64, py as i64);
                        if let Some(color) = color {
                            for c in 0..3 {
                                accum_row[3 * px + c] = color[c] as f32;
                            }
                            mask_row[px] = COVERED;
                        }
                    }
                });
        });

        let coverage = self.coverage();
        if coverage == 0.0 {
            warn!("no texel is seen by any camera");
        }
        info!("  texture coverage: {:.1}%", coverage * 100.0);

        self.state = TexturingState::Reprojected;
        Ok(())
    }

    fn check_reprojected(&self) -> Result<()> {
        match self.state {
            TexturingState::Reprojected | TexturingState::Finalized => Ok(()),
            state => {
                let desc =
                    format!("texture is not reprojected yet ({:?})", state);
                Err(Error::new(InconsistentState, desc))
            }
        }
    }

    fn poisson_fill(&self) -> Result<(Rgb32FImage, Vec<usize>)> {
        info!("  poisson filling...");
        let (w, h) = self.mask.dimensions();
        let mask = MaskImage::from_fn(w, h, |x, y| {
            Luma([self.mask.get_pixel(x, y)[0] as f32 / 255.0])
        });
        let mut poisson = PoissonReconstruction::new(self.accum.clone(), mask)?
            .with_params(self.poisson_params);
        poisson.solve();
        let filled = poisson.pixels().to_vec();
        Ok((poisson.into_result(), filled))
    }

    fn filled_accumulator(
        &self,
        gap_fill: GapFill,
    ) -> Result<(Rgb32FImage, Vec<usize>)> {
        self.device.install(|| match gap_fill {
            GapFill::None => Ok((self.accum.clone(), vec![])),
            GapFill::Flood => {
                let filled = if count_covered(&self.mask) > 0 {
                    (0..self.mask.as_raw().len())
                        .filter(|&i| self.mask.as_raw()[i] == UNCOVERED)
                        .collect()
                } else {
                    vec![]
                };
                Ok((flood_fill(&self.accum, &self.mask), filled))
            }
            GapFill::Poisson => self.poisson_fill(),
        })
    }

    /// Final 8-bit atlas. Gap filling runs on a copy, so repeated calls give
    /// the same image.
    pub fn get_texture(&self, options: &TextureOptions) -> Result<RgbImage> {
        self.check_reprojected()?;

        let (filled, _) = self.filled_accumulator(options.gap_fill)?;
        let mut texture = to_rgb8(&filled);
        if options.flip_vertical {
            imageops::flip_vertical_in_place(&mut texture);
        }
        Ok(texture)
    }

    /// Fills gaps of the accumulator in place and marks filled texels
    /// covered.
    pub fn fill_gaps(&mut self, gap_fill: GapFill) -> Result<()> {
        self.check_reprojected()?;

        let (filled, pixels) = self.filled_accumulator(gap_fill)?;
        self.accum = filled;
        let mask: &mut [u8] = &mut self.mask;
        for i in pixels {
            mask[i] = COVERED;
        }

        info!(
            "  texture coverage after filling: {:.1}%",
            self.coverage() * 100.0
        );
        self.state = TexturingState::Finalized;
        Ok(())
    }
}

/// Read-only view of the scene used by the reprojection workers.
struct Reprojector<'a> {
    mesh: &'a Mesh,
    world_raycaster: &'a Raycaster,
    uv_raycaster: &'a Raycaster,
    side: f64,
    cameras: &'a [InputCamera],
    images: &'a [RgbImage],
}

impl<'a> Reprojector<'a> {
    /// Finds the UV triangle under texel `(px, py)`, probing from both sides
    /// of the UV plane.
    fn hit_test(&self, px: i64, py: i64) -> Option<RayHit> {
        let u = (px as f64 + 0.5) / self.side;
        let v = (py as f64 + 0.5) / self.side;

        let down = Ray::new(Point3::new(u, v, 1.0), -Vector3::z());
        let up = Ray::new(Point3::new(u, v, -1.0), Vector3::z());
        [down, up]
            .iter()
            .map(|ray| self.uv_raycaster.intersect(ray, 0.0))
            .find(RayHit::hit_something)
    }

    fn sample_neighborhood(&self, px: i64, py: i64) -> Option<RayHit> {
        self.hit_test(px, py).or_else(|| {
            NEIGHBOR_ORDER
                .iter()
                .find_map(|(dx, dy)| self.hit_test(px + dx, py + dy))
        })
    }

    /// Surface position and unit normal at a UV-space hit.
    fn interpolate(&self, hit: &RayHit) -> Option<(Point3, Vector3)> {
        let [v0, v1, v2] = self.mesh.faces[hit.primitive()?.tri_id];
        let u = hit.barycentric_coord().u;
        let v = hit.barycentric_coord().v;
        let w = (1.0 - u - v).clamp(0.0, 1.0);

        let vs = &self.mesh.vertices;
        let ns = &self.mesh.normals;
        let vertex = Point3::from(
            vs[v0].coords * w + vs[v1].coords * u + vs[v2].coords * v,
        );
        let normal =
            normalize_or_keep(ns[v0] * w + ns[v1] * u + ns[v2] * v, 1e-12);
        Some((vertex, normal))
    }

    fn sample_camera(
        &self,
        cam: &InputCamera,
        image: &RgbImage,
        vertex: &Point3,
        normal: &Vector3,
    ) -> Option<Sample> {
        if !cam.frustum_test(vertex) {
            return None;
        }

        let mut dir = vertex - cam.position;
        let dist = dir.norm();
        if dist > 0.0 {
            dir /= dist;
        }
        let occluder = self
            .world_raycaster
            .intersect(&Ray::new(cam.position, dir), 0.0);
        if occluder.hit_something()
            && occluder.dist() + OCCLUSION_EPSILON < dist
        {
            return None;
        }

        let pos: Vector2 = cam.project_img_space_invert_y(vertex);
        Some(Sample {
            color: sample_bilinear(image, &pos),
            weight: (-dir.dot(normal)).max(0.0),
        })
    }

    fn texel_color(&self, px: i64, py: i64) -> Option<Vector3> {
        let hit = self.sample_neighborhood(px, py)?;
        let (vertex, normal) = self.interpolate(&hit)?;

        let mut samples: Vec<Sample> = self
            .cameras
            .iter()
            .zip(self.images)
            .filter_map(|(cam, image)| {
                self.sample_camera(cam, image, &vertex, &normal)
            })
            .collect();
        if samples.is_empty() {
            return None;
        }

        // Weakest samples first.
        samples.sort_by(|a, b| {
            a.weight.partial_cmp(&b.weight).unwrap_or(Ordering::Equal)
        });

        let mut sum = WeightedColor::default();
        for s in &samples {
            let w = s.weight * s.weight;
            sum += WeightedColor {
                color: s.color * w,
                weight: w,
            };
        }

        if sum.weight > 0.0 {
            Some(sum.color / sum.weight)
        } else {
            None
        }
    }
}
