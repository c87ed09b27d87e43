use log::info;

use crate::misc::{Point3, Vector2, Vector3};
use base::defs::{Error, ErrorKind::*, Result};

/// Indexed triangle mesh. `normals` and `uvs` are either empty or hold one
/// entry per vertex.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Point3>,
    pub normals: Vec<Vector3>,
    pub uvs: Vec<Vector2>,
    pub faces: Vec<[usize; 3]>,
}

impl Mesh {
    pub fn has_normals(&self) -> bool {
        !self.vertices.is_empty() && self.normals.len() == self.vertices.len()
    }

    pub fn has_uvs(&self) -> bool {
        !self.vertices.is_empty() && self.uvs.len() == self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let num_vertices = self.vertices.len();

        if !self.normals.is_empty() && self.normals.len() != num_vertices {
            let desc = format!(
                "mesh has {} normals for {} vertices",
                self.normals.len(),
                num_vertices
            );
            return Err(Error::new(InconsistentState, desc));
        }

        if !self.uvs.is_empty() && self.uvs.len() != num_vertices {
            let desc = format!(
                "mesh has {} uv coordinates for {} vertices",
                self.uvs.len(),
                num_vertices
            );
            return Err(Error::new(InconsistentState, desc));
        }

        for (i, face) in self.faces.iter().enumerate() {
            if let Some(v) = face.iter().find(|&&v| v >= num_vertices) {
                let desc = format!(
                    "face {} references unknown vertex {} (of {})",
                    i, v, num_vertices
                );
                return Err(Error::new(MalformedData, desc));
            }
        }

        Ok(())
    }

    pub fn triangle(&self, face_idx: usize) -> [Point3; 3] {
        let [v0, v1, v2] = self.faces[face_idx];
        [self.vertices[v0], self.vertices[v1], self.vertices[v2]]
    }

    /// Replaces normals with area-weighted averages of the adjacent face
    /// normals. Vertices not used by any face get a zero normal.
    pub fn generate_normals(&mut self) {
        info!("  generating {} vertex normals...", self.vertices.len());

        let mut normals = vec![Vector3::zeros(); self.vertices.len()];
        for &[v0, v1, v2] in &self.faces {
            let e1 = self.vertices[v1] - self.vertices[v0];
            let e2 = self.vertices[v2] - self.vertices[v0];
            // The cross product length is twice the face area.
            let n = e1.cross(&e2);
            normals[v0] += n;
            normals[v1] += n;
            normals[v2] += n;
        }

        for n in normals.iter_mut() {
            let len = n.norm();
            if len > 0.0 {
                *n /= len;
            }
        }

        self.normals = normals;
    }

    pub fn bounding_box(&self) -> Option<(Point3, Point3)> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(p), hi.sup(p))
        }))
    }
}
