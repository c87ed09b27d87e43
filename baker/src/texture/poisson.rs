use image::{GrayImage, ImageBuffer, Luma, Rgb32FImage};
use log::{debug, info};
use petgraph::unionfind::UnionFind;
use rayon::prelude::*;

use crate::texture::{flood_fill, COVERED, UNCOVERED};
use base::defs::{Error, ErrorKind::*, Result};

type CooMatrix = nalgebra_sparse::coo::CooMatrix<f64>;
type CsrMatrix = nalgebra_sparse::csr::CsrMatrix<f64>;
type DVector = nalgebra::DVector<f64>;

/// Per-pixel role: 0 marks pixels to synthesize, positive values mark
/// constraints and negative values mark pixels left untouched.
pub type MaskImage = ImageBuffer<Luma<f32>, Vec<f32>>;

pub const IGNORED: f32 = -1.0;

const NO_ID: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
pub struct PoissonParams {
    /// Residual norm at which the solver stops, relative to the norm of the
    /// right-hand side.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PoissonParams {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 5000,
        }
    }
}

/// Gradient-domain integration of an RGB image over the pixels its mask
/// marks for synthesis, with the constraint pixels as Dirichlet boundary.
/// Without gradient fields this is harmonic inpainting.
pub struct PoissonReconstruction {
    target: Rgb32FImage,
    mask: MaskImage,
    gradients: Option<(Rgb32FImage, Rgb32FImage)>,
    params: PoissonParams,
    pixels: Vec<usize>,
    boundary_pixels: Vec<usize>,
    pixel_ids: Vec<u32>,
}

impl PoissonReconstruction {
    pub fn new(target: Rgb32FImage, mask: MaskImage) -> Result<Self> {
        if target.dimensions() != mask.dimensions() {
            let desc = format!(
                "poisson mask is {:?} but target is {:?}",
                mask.dimensions(),
                target.dimensions()
            );
            return Err(Error::new(InvalidArgument, desc));
        }
        if target.as_raw().len() / 3 >= NO_ID as usize {
            let desc = format!("image {:?} is too large", target.dimensions());
            return Err(Error::new(UnsupportedFeature, desc));
        }

        Ok(Self {
            target,
            mask,
            gradients: None,
            params: PoissonParams::default(),
            pixels: vec![],
            boundary_pixels: vec![],
            pixel_ids: vec![],
        })
    }

    /// Sets forward-difference gradients to integrate along:
    /// `grad_x(x, y) = f(x + 1, y) - f(x, y)` and likewise for `grad_y`.
    pub fn with_gradients(
        mut self,
        grad_x: Rgb32FImage,
        grad_y: Rgb32FImage,
    ) -> Result<Self> {
        let dims = self.target.dimensions();
        if grad_x.dimensions() != dims || grad_y.dimensions() != dims {
            let desc =
                format!("poisson gradients do not match image {:?}", dims);
            return Err(Error::new(InvalidArgument, desc));
        }
        self.gradients = Some((grad_x, grad_y));
        Ok(self)
    }

    pub fn with_params(mut self, params: PoissonParams) -> Self {
        self.params = params;
        self
    }

    /// In-image 4-neighbours of `(x, y)`.
    pub fn neighbors(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> impl Iterator<Item = (u32, u32)> {
        [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)]
            .into_iter()
            .filter_map(move |(dx, dy)| {
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                let inside = nx >= 0 && ny >= 0;
                if inside && nx < width as i64 && ny < height as i64 {
                    Some((nx as u32, ny as u32))
                } else {
                    None
                }
            })
    }

    fn neighbor_indices(&self, i: usize) -> impl Iterator<Item = usize> {
        let (w, h) = self.target.dimensions();
        let (x, y) = ((i % w as usize) as u32, (i / w as usize) as u32);
        Self::neighbors(x, y, w, h)
            .map(move |(nx, ny)| ny as usize * w as usize + nx as usize)
    }

    fn is_in_mask(&self, i: usize) -> bool {
        self.mask.as_raw()[i] == 0.0
    }

    fn is_ignored(&self, i: usize) -> bool {
        self.mask.as_raw()[i] < 0.0
    }

    fn parse_mask(&mut self) {
        let n = self.mask.as_raw().len();
        self.pixels = (0..n).filter(|&i| self.is_in_mask(i)).collect();
        self.boundary_pixels = (0..n)
            .filter(|&i| {
                !self.is_in_mask(i)
                    && !self.is_ignored(i)
                    && self.neighbor_indices(i).any(|j| self.is_in_mask(j))
            })
            .collect();
        self.assign_ids();
    }

    fn assign_ids(&mut self) {
        self.pixel_ids = vec![NO_ID; self.mask.as_raw().len()];
        for (id, &i) in self.pixels.iter().enumerate() {
            self.pixel_ids[i] = id as u32;
        }
    }

    /// Marks pixels to synthesize that no constraint can be reached from as
    /// ignored.
    fn check_connectivity(&mut self) {
        let n = self.pixels.len();
        // Node n stands for every constraint pixel.
        let mut components = UnionFind::<usize>::new(n + 1);
        for (id, &i) in self.pixels.iter().enumerate() {
            for j in self.neighbor_indices(i) {
                let other = self.pixel_ids[j];
                if other != NO_ID {
                    components.union(id, other as usize);
                } else if !self.is_ignored(j) {
                    components.union(id, n);
                }
            }
        }

        let anchor = components.find(n);
        let (kept, dropped): (Vec<(usize, usize)>, Vec<(usize, usize)>) = self
            .pixels
            .iter()
            .copied()
            .enumerate()
            .partition(|&(id, _)| components.find(id) == anchor);
        if dropped.is_empty() {
            return;
        }

        info!(
            "  {} pixels are not connected to any constraint, ignoring them",
            dropped.len()
        );
        let mask: &mut [f32] = &mut self.mask;
        for (_, i) in dropped {
            mask[i] = IGNORED;
        }
        self.pixels = kept.into_iter().map(|(_, i)| i).collect();
        self.assign_ids();
    }

    /// Guidance term `f(p) - f(q)` expected between neighbours `p` and `q`.
    fn guidance(&self, p: usize, q: usize, channel: usize) -> f64 {
        let (gx, gy) = match &self.gradients {
            Some(g) => g,
            None => return 0.0,
        };
        let w = self.target.width() as usize;
        let g =
            |img: &Rgb32FImage, i: usize| img.as_raw()[3 * i + channel] as f64;
        match (p / w == q / w, q > p) {
            (true, true) => -g(gx, p),
            (true, false) => g(gx, q),
            (false, true) => -g(gy, p),
            (false, false) => g(gy, q),
        }
    }

    fn build_system(&self) -> (CsrMatrix, [DVector; 3]) {
        let n = self.pixels.len();
        let mut coo = CooMatrix::new(n, n);
        let mut rhs = [DVector::zeros(n), DVector::zeros(n), DVector::zeros(n)];
        let target = self.target.as_raw();

        for (k, &p) in self.pixels.iter().enumerate() {
            let mut degree = 0.0;
            for q in self.neighbor_indices(p) {
                if self.is_ignored(q) {
                    continue;
                }
                degree += 1.0;
                let id = self.pixel_ids[q];
                if id != NO_ID {
                    coo.push(k, id as usize, -1.0);
                }
                for (c, b) in rhs.iter_mut().enumerate() {
                    if id == NO_ID {
                        b[k] += target[3 * q + c] as f64;
                    }
                    b[k] += self.guidance(p, q, c);
                }
            }
            coo.push(k, k, degree);
        }

        (CsrMatrix::from(&coo), rhs)
    }

    fn initial_guess(&self) -> Rgb32FImage {
        let (w, h) = self.mask.dimensions();
        let constraints = GrayImage::from_fn(w, h, |x, y| {
            Luma([if self.mask.get_pixel(x, y)[0] > 0.0 {
                COVERED
            } else {
                UNCOVERED
            }])
        });
        flood_fill(&self.target, &constraints)
    }

    pub fn solve(&mut self) {
        self.parse_mask();
        self.check_connectivity();

        let n = self.pixels.len();
        info!(
            "  poisson reconstruction of {} pixels with {} boundary pixels...",
            n,
            self.boundary_pixels.len()
        );
        if n == 0 {
            return;
        }

        let (a, rhs) = self.build_system();
        let guess = self.initial_guess();
        let params = self.params;

        let solutions: Vec<DVector> = rhs[..]
            .par_iter()
            .enumerate()
            .map(|(c, b)| {
                let x0 = DVector::from_iterator(
                    n,
                    self.pixels
                        .iter()
                        .map(|&i| guess.as_raw()[3 * i + c] as f64),
                );
                let (x, steps) = conjugate_gradients_solve(&a, b, x0, &params);
                debug!("channel {} converged after {} iterations", c, steps);
                x
            })
            .collect();

        let target: &mut [f32] = &mut self.target;
        for (k, &i) in self.pixels.iter().enumerate() {
            for (c, x) in solutions.iter().enumerate() {
                target[3 * i + c] = x[k] as f32;
            }
        }
    }

    pub fn result(&self) -> &Rgb32FImage {
        &self.target
    }

    pub fn into_result(self) -> Rgb32FImage {
        self.target
    }

    /// Pixels synthesized by the last `solve`.
    pub fn pixels(&self) -> &[usize] {
        &self.pixels
    }

    pub fn boundary_pixels(&self) -> &[usize] {
        &self.boundary_pixels
    }

    pub fn mask(&self) -> &MaskImage {
        &self.mask
    }
}

fn conjugate_gradients_solve(
    a: &CsrMatrix,
    b: &DVector,
    x0: DVector,
    params: &PoissonParams,
) -> (DVector, usize) {
    let threshold = params.tolerance * b.norm().max(1.0);
    let mut x = x0;
    let mut r = b - a * &x;
    let mut p = r.clone();
    let mut rsold = r.dot(&r);
    for step in 0..params.max_iterations {
        if rsold.sqrt() <= threshold {
            return (x, step);
        }
        let ap = a * &p;
        let alpha = rsold / p.dot(&ap);
        x += &p * alpha;
        r -= ap * alpha;
        let rsnew = r.dot(&r);
        p = &r + &p * (rsnew / rsold);
        rsold = rsnew;
    }
    (x, params.max_iterations)
}
