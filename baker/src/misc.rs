// Typedefs shared by the geometry, ray casting and texturing modules.

pub type Vector2 = nalgebra::Vector2<f64>;
pub type Vector3 = nalgebra::Vector3<f64>;
pub type Vector4 = nalgebra::Vector4<f64>;
pub type Point3 = nalgebra::Point3<f64>;
pub type Matrix3 = nalgebra::Matrix3<f64>;
pub type Matrix4 = nalgebra::Matrix4<f64>;
pub type Quaternion = nalgebra::UnitQuaternion<f64>;

/// Returns the unit vector along `v`, or `v` itself when it is too short to
/// be normalized.
pub fn normalize_or_keep(v: Vector3, min_len: f64) -> Vector3 {
    let len = v.norm();
    if len > min_len {
        v / len
    } else {
        v
    }
}
