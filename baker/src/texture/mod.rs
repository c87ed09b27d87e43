mod flood_fill;
mod mesh_texturing;
mod poisson;

use image::{GrayImage, Rgb, Rgb32FImage, RgbImage};

use crate::misc::{Vector2, Vector3};

pub use flood_fill::*;
pub use mesh_texturing::*;
pub use poisson::*;

pub const COVERED: u8 = 255;
pub const UNCOVERED: u8 = 0;

/// Algorithm used to synthesize texels no camera could see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapFill {
    None,
    /// Copy the color of the nearest covered texel.
    Flood,
    /// Harmonic inpainting with covered texels as boundary conditions.
    Poisson,
}

impl GapFill {
    /// Poisson filling wins when both are requested.
    pub fn from_flags(flood: bool, poisson: bool) -> Self {
        if poisson {
            GapFill::Poisson
        } else if flood {
            GapFill::Flood
        } else {
            GapFill::None
        }
    }
}

impl Default for GapFill {
    fn default() -> Self {
        GapFill::None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureOptions {
    pub gap_fill: GapFill,
    /// Flip rows so that the UV origin ends up at the bottom of the image.
    pub flip_vertical: bool,
}

pub fn get_pixel_as_vector3(image: &RgbImage, x: u32, y: u32) -> Vector3 {
    let p = image.get_pixel(x, y);
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

/// Bilinear lookup at a continuous position where pixel centers sit at
/// half-integer coordinates. Lookups past the border clamp to the edge.
pub fn sample_bilinear(image: &RgbImage, pos: &Vector2) -> Vector3 {
    let (w, h) = image.dimensions();
    if w < 2 || h < 2 {
        return Vector3::zeros();
    }

    let corner = (pos - Vector2::new(0.5, 0.5)).map(f64::floor);
    let t = pos - (corner + Vector2::new(0.5, 0.5));
    let clamp_x = |x: f64| x.clamp(0.0, (w - 1) as f64) as u32;
    let clamp_y = |y: f64| y.clamp(0.0, (h - 1) as f64) as u32;
    let (x0, x1) = (clamp_x(corner.x), clamp_x(corner.x + 1.0));
    let (y0, y1) = (clamp_y(corner.y), clamp_y(corner.y + 1.0));

    get_pixel_as_vector3(image, x0, y0) * ((1.0 - t.x) * (1.0 - t.y))
        + get_pixel_as_vector3(image, x1, y0) * (t.x * (1.0 - t.y))
        + get_pixel_as_vector3(image, x0, y1) * ((1.0 - t.x) * t.y)
        + get_pixel_as_vector3(image, x1, y1) * (t.x * t.y)
}

/// Rounds and saturates every channel into 8 bits.
pub fn to_rgb8(image: &Rgb32FImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = RgbImage::new(w, h);
    for (src, dst) in image.pixels().zip(out.pixels_mut()) {
        *dst = Rgb(src.0.map(|c| c.round().clamp(0.0, 255.0) as u8));
    }
    out
}

pub fn count_covered(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&m| m != UNCOVERED).count()
}
