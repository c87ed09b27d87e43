use std::path::{Path, PathBuf};

use image::RgbImage;
use indexmap::IndexMap;
use log::info;
use serde::Deserialize;

use crate::camera::InputCamera;
use crate::import_obj::import_obj_file;
use crate::mesh::Mesh;
use crate::misc::{Point3, Quaternion, Vector3};
use base::defs::{Error, ErrorKind::*, IntoResult, Result};
use base::util::fs;

pub const SCENE_FILE_NAME: &str = "scene.json";

/// Contents of `scene.json`. Relative paths are resolved against the
/// dataset directory.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneDesc {
    pub mesh: PathBuf,
    pub cameras: IndexMap<String, CameraDesc>,
}

/// Calibration of a single photo. The orientation comes either from a
/// `rotation` quaternion `[w, x, y, z]` or from a `look_at` target; the
/// intrinsics from either `fovy` in degrees or `focal` in pixels.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraDesc {
    pub image: PathBuf,
    pub position: [f64; 3],
    #[serde(default)]
    pub rotation: Option<[f64; 4]>,
    #[serde(default)]
    pub look_at: Option<[f64; 3]>,
    #[serde(default = "default_up")]
    pub up: [f64; 3],
    #[serde(default)]
    pub fovy: Option<f64>,
    #[serde(default)]
    pub focal: Option<f64>,
    #[serde(default)]
    pub znear: Option<f64>,
    #[serde(default)]
    pub zfar: Option<f64>,
}

fn default_up() -> [f64; 3] {
    [0.0, 1.0, 0.0]
}

impl CameraDesc {
    /// Builds the camera for an image of `w` by `h` pixels.
    pub fn to_camera(&self, name: &str, w: u32, h: u32) -> Result<InputCamera> {
        let malformed = |what: &str| {
            let desc = format!("camera '{}' {}", name, what);
            Err(Error::new(MalformedData, desc))
        };

        let position = Point3::from(self.position);
        let rotation = Quaternion::identity();
        let mut cam = match (self.fovy, self.focal) {
            (Some(fovy), None) if fovy > 0.0 && fovy < 180.0 => {
                InputCamera::new(w, h, fovy.to_radians(), position, rotation)
            }
            (None, Some(focal)) if focal > 0.0 => {
                InputCamera::from_focal(focal, w, h, position, rotation)
            }
            _ => return malformed("needs either a valid fovy or a valid focal"),
        };

        match (self.rotation, self.look_at) {
            (Some([w, x, y, z]), None) => {
                let q = nalgebra::Quaternion::new(w, x, y, z);
                if q.norm() == 0.0 {
                    return malformed("has a zero rotation quaternion");
                }
                cam.rotation = Quaternion::from_quaternion(q);
            }
            (None, Some(target)) => {
                let target = Point3::from(target);
                let up = Vector3::from(self.up);
                let dir = target - position;
                if dir.cross(&up).norm() == 0.0 {
                    return malformed("looks along its up vector or at itself");
                }
                cam.set_look_at(&position, &target, &up);
            }
            _ => {
                return malformed("needs either a rotation or a look_at target")
            }
        }

        let znear = self.znear.unwrap_or(cam.znear);
        let zfar = self.zfar.unwrap_or(cam.zfar);
        if znear <= 0.0 || zfar <= znear {
            return malformed("has invalid clipping planes");
        }
        cam.set_clipping_planes(znear, zfar);

        Ok(cam)
    }
}

/// Mesh, cameras and photos ready for baking.
pub struct Dataset {
    pub mesh: Mesh,
    pub names: Vec<String>,
    pub cameras: Vec<InputCamera>,
    pub images: Vec<RgbImage>,
}

pub fn parse_scene(json: &str) -> Result<SceneDesc> {
    serde_json::from_str(json)
        .res(|| "failed to parse scene description".to_string())
}

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|e| {
        let desc = format!("failed to load image '{}'", path.display());
        Error::with_source(ImageError, desc, e)
    })?;
    Ok(image.into_rgb8())
}

impl Dataset {
    /// Loads a dataset directory holding `scene.json`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        info!("  loading dataset from {}...", dir.display());

        let json = fs::read_file_to_string(dir.join(SCENE_FILE_NAME))?;
        let scene = parse_scene(&json)?;
        if scene.cameras.is_empty() {
            let desc = "scene has no cameras".to_string();
            return Err(Error::new(MalformedData, desc));
        }

        let mesh = import_obj_file(dir.join(&scene.mesh))?;

        let mut dataset = Dataset {
            mesh,
            names: Vec::with_capacity(scene.cameras.len()),
            cameras: Vec::with_capacity(scene.cameras.len()),
            images: Vec::with_capacity(scene.cameras.len()),
        };
        for (name, desc) in &scene.cameras {
            let image = load_image(dir.join(&desc.image))?;
            let cam = desc.to_camera(name, image.width(), image.height())?;
            dataset.names.push(name.clone());
            dataset.cameras.push(cam);
            dataset.images.push(image);
        }

        info!("  loaded {} cameras", dataset.cameras.len());
        Ok(dataset)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::f64::consts::FRAC_PI_2;

    use image::Rgb;

    use base::{assert_eq_f64, assert_eq_vector3};

    const SCENE_JSON: &str = r#"{
        "mesh": "quad.obj",
        "cameras": {
            "top": {
                "image": "top.png",
                "position": [0.5, 0.5, 2.0],
                "rotation": [1.0, 0.0, 0.0, 0.0],
                "fovy": 90.0
            },
            "side": {
                "image": "side.png",
                "position": [2.5, 0.5, 2.0],
                "look_at": [0.5, 0.5, 0.0],
                "focal": 32.0,
                "znear": 0.1,
                "zfar": 10.0
            }
        }
    }"#;

    #[test]
    fn test_parse_scene_keeps_camera_order() {
        let scene = parse_scene(SCENE_JSON).unwrap();
        assert_eq!(scene.mesh, PathBuf::from("quad.obj"));
        let names: Vec<_> = scene.cameras.keys().cloned().collect();
        assert_eq!(names, vec!["top", "side"]);
        assert_eq!(scene.cameras["side"].up, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_parse_scene_rejects_unknown_fields() {
        let json = r#"{"mesh": "a.obj", "cameras": {}, "x": 1}"#;
        let err = parse_scene(json).unwrap_err();
        assert_eq!(err.kind, JsonError);
    }

    #[test]
    fn test_cameras_from_description() {
        let scene = parse_scene(SCENE_JSON).unwrap();

        let top = scene.cameras["top"].to_camera("top", 64, 64).unwrap();
        assert_eq_f64!(top.fovy, FRAC_PI_2);
        assert_eq_vector3!(top.dir(), -Vector3::z());

        let side = scene.cameras["side"].to_camera("side", 64, 64).unwrap();
        assert_eq_f64!(side.fovy, FRAC_PI_2);
        assert_eq_f64!(side.znear, 0.1);
        assert_eq_f64!(side.zfar, 10.0);
        let expected = Vector3::new(-1.0, 0.0, -1.0).normalize();
        assert_eq_vector3!(side.dir(), expected, 1e-9);
    }

    #[test]
    fn test_ambiguous_camera_is_malformed() {
        let mut desc = parse_scene(SCENE_JSON).unwrap().cameras["top"].clone();
        let kind = |d: &CameraDesc| d.to_camera("top", 8, 8).unwrap_err().kind;
        desc.focal = Some(30.0);
        assert_eq!(kind(&desc), MalformedData);

        desc.focal = None;
        desc.look_at = Some([0.0, 0.0, 0.0]);
        assert_eq!(kind(&desc), MalformedData);

        desc.look_at = None;
        desc.zfar = Some(0.001);
        assert_eq!(kind(&desc), MalformedData);
    }

    #[test]
    fn test_load_dataset() {
        let name = format!("baker-dataset-{}", std::process::id());
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SCENE_FILE_NAME), SCENE_JSON).unwrap();
        std::fs::write(
            dir.join("quad.obj"),
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             f 1/1 2/2 3/3 4/4\n",
        )
        .unwrap();
        RgbImage::from_pixel(64, 48, Rgb([255, 0, 0]))
            .save(dir.join("top.png"))
            .unwrap();
        RgbImage::from_pixel(64, 64, Rgb([0, 0, 255]))
            .save(dir.join("side.png"))
            .unwrap();

        let dataset = Dataset::load(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(dataset.names, vec!["top", "side"]);
        assert_eq!(dataset.mesh.faces.len(), 2);
        assert_eq!((dataset.cameras[0].w, dataset.cameras[0].h), (64, 48));
        assert_eq_f64!(dataset.cameras[0].aspect, 64.0 / 48.0);
        assert_eq!(*dataset.images[1].get_pixel(0, 0), Rgb([0, 0, 255]));
    }

    #[test]
    fn test_missing_image_is_image_error() {
        let err = load_image("/nonexistent/photo.png").unwrap_err();
        assert_eq!(err.kind, ImageError);
    }
}
