use std::path::PathBuf;
use std::sync::Arc;

use image::RgbImage;
use log::info;
use structopt::StructOpt;

use crate::camera::InputCamera;
use crate::dataset::Dataset;
use crate::mesh::Mesh;
use crate::raycaster::{
    CameraRaycaster, Device, DeviceParams, DEFAULT_MAX_LEAF_SIZE,
};
use crate::texture::{GapFill, MeshTexturing, TextureOptions};
use base::defs::{Error, ErrorKind::*, Result};

#[derive(Clone, Debug, StructOpt)]
pub struct TextureParams {
    #[structopt(
        help = "Side of the square texture atlas in pixels",
        long,
        default_value = "8192"
    )]
    pub size: u32,
    #[structopt(help = "Fill uncovered texels with the nearest color", long)]
    pub flood: bool,
    #[structopt(
        help = "Fill uncovered texels by Poisson reconstruction",
        long
    )]
    pub poisson: bool,
    #[structopt(
        help = "Fit camera clipping planes to the mesh before baking",
        long
    )]
    pub auto_clipping: bool,
}

#[derive(Clone, Debug, StructOpt)]
pub struct DeviceArgs {
    #[structopt(
        help = "Number of worker threads (one per core if zero)",
        long,
        default_value = "0"
    )]
    pub threads: usize,
    #[structopt(
        help = "Maximal number of triangles in a BVH leaf",
        long,
        default_value = "4"
    )]
    pub max_leaf_size: usize,
}

impl From<&DeviceArgs> for DeviceParams {
    fn from(args: &DeviceArgs) -> Self {
        Self {
            num_threads: args.threads,
            max_leaf_size: args.max_leaf_size,
        }
    }
}

#[derive(StructOpt)]
#[structopt(about = "Bake a texture atlas for a mesh from calibrated photos")]
pub struct TextureMeshParams {
    #[structopt(help = "Dataset directory holding scene.json", long)]
    path: Option<PathBuf>,
    #[structopt(help = "Output texture image", long, short = "o")]
    output: Option<PathBuf>,
    #[structopt(flatten)]
    texture_params: TextureParams,
    #[structopt(flatten)]
    device_args: DeviceArgs,
}

pub fn texture_mesh_with_params(params: &TextureMeshParams) -> Result<()> {
    let (path, output) = match (&params.path, &params.output) {
        (Some(path), Some(output)) => (path, output),
        _ => {
            TextureMeshParams::clap().print_help().map_err(|e| {
                let desc = "failed to print usage".to_string();
                Error::with_source(IoError, desc, e)
            })?;
            println!();
            return Ok(());
        }
    };

    let device = Device::new(DeviceParams::from(&params.device_args))?;
    let mut dataset = Dataset::load(path)?;
    let texture = texture_mesh(
        &device,
        dataset.mesh,
        &mut dataset.cameras,
        &dataset.images,
        &params.texture_params,
    )?;

    info!("  saving texture to {}...", output.display());
    texture.save(output).map_err(|e| {
        let desc = format!("failed to save texture '{}'", output.display());
        Error::with_source(ImageError, desc, e)
    })
}

/// Bakes the atlas of `mesh`. The result has its rows flipped, so that the
/// UV origin lands at the bottom-left corner of the image.
pub fn texture_mesh(
    device: &Arc<Device>,
    mesh: Mesh,
    cameras: &mut [InputCamera],
    images: &[RgbImage],
    params: &TextureParams,
) -> Result<RgbImage> {
    if params.auto_clipping {
        CameraRaycaster::compute_clipping_planes(device, &mesh, cameras)?;
    }

    let mut texturing = MeshTexturing::new(device, params.size)?;
    texturing.set_mesh(Arc::new(mesh))?;
    texturing.reproject(cameras, images)?;

    let options = TextureOptions {
        gap_fill: GapFill::from_flags(params.flood, params.poisson),
        flip_vertical: true,
    };
    texturing.get_texture(&options)
}

impl Default for TextureParams {
    fn default() -> Self {
        Self {
            size: 8192,
            flood: false,
            poisson: false,
            auto_clipping: false,
        }
    }
}

impl Default for DeviceArgs {
    fn default() -> Self {
        Self {
            threads: 0,
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::f64::consts::FRAC_PI_2;

    use image::Rgb;

    use crate::mesh::test::new_quad_mesh;
    use crate::misc::{Point3, Quaternion};
    use crate::raycaster::test::new_device;

    fn new_scene(position: Point3) -> (Vec<InputCamera>, Vec<RgbImage>) {
        let rotation = Quaternion::identity();
        let cam = InputCamera::new(64, 64, FRAC_PI_2, position, rotation);
        let image = RgbImage::from_pixel(64, 64, Rgb([0, 255, 0]));
        (vec![cam], vec![image])
    }

    #[test]
    fn test_parse_params() {
        let params = TextureMeshParams::from_iter([
            "texture-mesh",
            "--path",
            "data",
            "-o",
            "atlas.png",
            "--size",
            "512",
            "--flood",
            "--poisson",
            "--threads",
            "3",
        ]);
        assert_eq!(params.path, Some(PathBuf::from("data")));
        assert_eq!(params.output, Some(PathBuf::from("atlas.png")));
        assert_eq!(params.texture_params.size, 512);
        assert!(params.texture_params.flood && params.texture_params.poisson);
        assert!(!params.texture_params.auto_clipping);
        assert_eq!(params.device_args.threads, 3);
        assert_eq!(params.device_args.max_leaf_size, DEFAULT_MAX_LEAF_SIZE);
    }

    #[test]
    fn test_parse_default_params() {
        let params = TextureMeshParams::from_iter(["texture-mesh"]);
        assert!(params.path.is_none() && params.output.is_none());
        assert_eq!(params.texture_params.size, TextureParams::default().size);
    }

    #[test]
    fn test_missing_paths_print_usage() {
        let params =
            TextureMeshParams::from_iter(["texture-mesh", "--path", "data"]);
        assert!(texture_mesh_with_params(&params).is_ok());
    }

    #[test]
    fn test_texture_mesh_flips_rows() {
        // The camera only sees the upper half of the UV square.
        let (mut cameras, images) = new_scene(Point3::new(0.5, 1.5, 1.0));
        let params = TextureParams {
            size: 8,
            ..Default::default()
        };
        let mesh = new_quad_mesh();
        let texture =
            texture_mesh(&new_device(), mesh, &mut cameras, &images, &params)
                .unwrap();

        assert_eq!(texture.dimensions(), (8, 8));
        assert_eq!(*texture.get_pixel(0, 0), Rgb([0, 255, 0]));
        assert_eq!(*texture.get_pixel(0, 7), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_texture_mesh_with_auto_clipping() {
        let (mut cameras, images) = new_scene(Point3::new(0.5, 0.5, 2.0));
        let params = TextureParams {
            size: 8,
            flood: true,
            auto_clipping: true,
            ..Default::default()
        };
        let mesh = new_quad_mesh();
        let texture =
            texture_mesh(&new_device(), mesh, &mut cameras, &images, &params)
                .unwrap();

        assert!(cameras[0].znear < 2.0 && cameras[0].zfar > 2.0);
        assert!(cameras[0].zfar / cameras[0].znear >= 100.0);
        assert!(texture.pixels().all(|p| *p == Rgb([0, 255, 0])));
    }
}
