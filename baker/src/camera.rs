use nalgebra::Rotation3;

use crate::misc::{
    Matrix3, Matrix4, Point3, Quaternion, Vector2, Vector3, Vector4,
};

pub const DEFAULT_ZNEAR: f64 = 0.01;
pub const DEFAULT_ZFAR: f64 = 1000.0;

/// Orientation whose local axes are the columns of `basis`, which must be
/// orthonormal and right-handed.
fn rotation_from_basis(basis: Matrix3) -> Quaternion {
    Quaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(basis))
}

/// Calibrated pinhole camera with OpenGL conventions: it looks along its
/// local -Z axis, local +Y is up and local +X is right. Normalized device
/// coordinates span [-1, 1] on every axis.
#[derive(Clone, Debug, PartialEq)]
pub struct InputCamera {
    pub position: Point3,
    pub rotation: Quaternion,
    /// Vertical field of view, radians.
    pub fovy: f64,
    pub aspect: f64,
    pub znear: f64,
    pub zfar: f64,
    pub w: u32,
    pub h: u32,
}

impl InputCamera {
    pub fn new(
        w: u32,
        h: u32,
        fovy: f64,
        position: Point3,
        rotation: Quaternion,
    ) -> Self {
        Self {
            position,
            rotation,
            fovy,
            aspect: w as f64 / h as f64,
            znear: DEFAULT_ZNEAR,
            zfar: DEFAULT_ZFAR,
            w,
            h,
        }
    }

    /// Builds a camera from a focal length expressed in pixels.
    pub fn from_focal(
        focal: f64,
        w: u32,
        h: u32,
        position: Point3,
        rotation: Quaternion,
    ) -> Self {
        let fovy = 2.0 * (0.5 * h as f64 / focal).atan();
        Self::new(w, h, fovy, position, rotation)
    }

    /// Builds a camera from a bundler-style extrinsic pair, where `rotation`
    /// maps world into camera coordinates and `translation` is the world
    /// origin expressed in camera coordinates.
    pub fn from_bundler(
        focal: f64,
        w: u32,
        h: u32,
        rotation: &Matrix3,
        translation: &Vector3,
    ) -> Self {
        let orientation = rotation_from_basis(rotation.transpose());
        let position = Point3::from(-(rotation.transpose() * translation));
        Self::from_focal(focal, w, h, position, orientation)
    }

    pub fn set_look_at(&mut self, eye: &Point3, at: &Point3, up: &Vector3) {
        let z = (eye - at).normalize();
        let x = up.cross(&z).normalize();
        let y = z.cross(&x);
        let basis = Matrix3::from_columns(&[x, y, z]);
        self.rotation = rotation_from_basis(basis);
        self.position = *eye;
    }

    pub fn set_clipping_planes(&mut self, znear: f64, zfar: f64) {
        self.znear = znear;
        self.zfar = zfar;
    }

    pub fn dir(&self) -> Vector3 {
        self.rotation * -Vector3::z()
    }

    pub fn up(&self) -> Vector3 {
        self.rotation * Vector3::y()
    }

    pub fn right(&self) -> Vector3 {
        self.rotation * Vector3::x()
    }

    pub fn view(&self) -> Matrix4 {
        let rot = self.rotation.inverse();
        rot.to_homogeneous()
            * Matrix4::new_translation(&-self.position.coords)
    }

    pub fn proj(&self) -> Matrix4 {
        Matrix4::new_perspective(self.aspect, self.fovy, self.znear, self.zfar)
    }

    pub fn viewproj(&self) -> Matrix4 {
        self.proj() * self.view()
    }

    fn clip(&self, p: &Point3) -> Vector4 {
        self.viewproj() * p.to_homogeneous()
    }

    /// Projects a world point into normalized device coordinates.
    pub fn project(&self, p: &Point3) -> Point3 {
        let clip = self.clip(p);
        Point3::new(clip.x / clip.w, clip.y / clip.w, clip.z / clip.w)
    }

    /// Maps normalized device coordinates back to a world point.
    pub fn unproject(&self, ndc: &Point3) -> Option<Point3> {
        let inv = self.viewproj().try_inverse()?;
        let world = inv * ndc.to_homogeneous();
        Some(Point3::from(world.xyz() / world.w))
    }

    /// Whether `p` is in front of the camera and inside the view volume.
    pub fn frustum_test(&self, p: &Point3) -> bool {
        let clip = self.clip(p);
        if clip.w <= 0.0 {
            return false;
        }
        let ndc = clip.xyz() / clip.w;
        ndc.iter().all(|c| c.abs() <= 1.0)
    }

    /// Projects a world point into pixel coordinates with the row origin at
    /// the top of the image.
    pub fn project_img_space_invert_y(&self, p: &Point3) -> Vector2 {
        let ndc = self.project(p);
        Vector2::new(
            0.5 * (ndc.x + 1.0) * self.w as f64,
            0.5 * (-ndc.y + 1.0) * self.h as f64,
        )
    }

    /// Inverse of `project_img_space_invert_y` for a given NDC depth.
    pub fn unproject_img_space_invert_y(
        &self,
        pixel: &Vector2,
        ndc_depth: f64,
    ) -> Option<Point3> {
        let ndc = Point3::new(
            2.0 * pixel.x / self.w as f64 - 1.0,
            -(2.0 * pixel.y / self.h as f64 - 1.0),
            ndc_depth,
        );
        self.unproject(&ndc)
    }
}
