use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use log::info;

use crate::mesh::Mesh;
use crate::misc::{Point3, Vector2, Vector3};
use base::defs::{Error, ErrorKind::*, Result};
use base::util::fs;

const MAX_NUM_FACE_VERTICES: usize = 10;

/// Position, texture and normal indices of a face corner, 1-based with zero
/// standing for an absent reference.
type Corner = (u32, u32, u32);

pub fn import_obj_file<P: AsRef<Path>>(path: P) -> Result<Mesh> {
    let path = path.as_ref();
    info!("  importing mesh from {}...", path.display());
    import_obj(fs::open_file(path)?)
}

/// Reads a Wavefront OBJ mesh. Polygons are fan-triangulated. Face corners
/// with distinct texture or normal references become distinct vertices, so
/// UV seams are preserved.
pub fn import_obj<R: Read>(obj_reader: R) -> Result<Mesh> {
    let mut state = ImportState::default();

    for line_res in BufReader::new(obj_reader).lines() {
        let line = line_res.map_err(|e| {
            let desc = format!("failed to read line {}", state.line + 1);
            Error::with_source(IoError, desc, e)
        })?;
        state.line += 1;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(&keyword) = parts.first() {
            match keyword {
                "f" => import_f(&mut state, &parts)?,
                "v" => import_v(&mut state, &parts)?,
                "vn" => import_vn(&mut state, &parts)?,
                "vt" => import_vt(&mut state, &parts)?,
                _ => (),
            }
        }
    }

    let mesh = state.into_mesh()?;
    info!(
        "  imported {} vertices and {} triangles",
        mesh.vertices.len(),
        mesh.faces.len()
    );
    Ok(mesh)
}

#[derive(Default)]
struct ImportState {
    line: usize,
    positions: Vec<Point3>,
    texture_points: Vec<Vector2>,
    normals: Vec<Vector3>,
    corners: Vec<Corner>,
    corner_ids: HashMap<Corner, usize>,
    faces: Vec<[usize; 3]>,
}

impl ImportState {
    fn corner_id(&mut self, corner: Corner) -> Result<usize> {
        let (v, t, n) = corner;
        let check = |index: u32, len: usize, what: &str| {
            if index as usize > len {
                let desc = format!(
                    "reference to unknown {} {} in f-statement at line {}",
                    what, index, self.line
                );
                Err(Error::new(InconsistentState, desc))
            } else {
                Ok(())
            }
        };
        check(v, self.positions.len(), "vertex")?;
        check(t, self.texture_points.len(), "texture point")?;
        check(n, self.normals.len(), "normal")?;

        let next_id = self.corners.len();
        let id = *self.corner_ids.entry(corner).or_insert(next_id);
        if id == next_id {
            self.corners.push(corner);
        }
        Ok(id)
    }

    fn into_mesh(self) -> Result<Mesh> {
        let with_texture = self.corners.iter().filter(|c| c.1 != 0).count();
        let with_normal = self.corners.iter().filter(|c| c.2 != 0).count();
        let check = |count: usize, what: &str| {
            if count != 0 && count != self.corners.len() {
                let desc = format!("only some face vertices have {}", what);
                Err(Error::new(InconsistentState, desc))
            } else {
                Ok(count != 0)
            }
        };
        let has_uvs = check(with_texture, "texture coordinates")?;
        let has_normals = check(with_normal, "normals")?;

        let mut mesh = Mesh {
            vertices: self
                .corners
                .iter()
                .map(|&(v, _, _)| self.positions[v as usize - 1])
                .collect(),
            faces: self.faces,
            ..Default::default()
        };
        if has_uvs {
            mesh.uvs = self
                .corners
                .iter()
                .map(|&(_, t, _)| self.texture_points[t as usize - 1])
                .collect();
        }
        if has_normals {
            mesh.normals = self
                .corners
                .iter()
                .map(|&(_, _, n)| self.normals[n as usize - 1])
                .collect();
        }
        Ok(mesh)
    }
}

fn import_f(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    let num_vertices_err_res = |kind, prop| {
        let msg = "number of vertices in f-statement at line";
        Err(Error::new(kind, format!("{} {} {}", prop, msg, state.line)))
    };
    if parts.len() < 4 {
        return num_vertices_err_res(MalformedData, "bad");
    } else if parts.len() > MAX_NUM_FACE_VERTICES + 1 {
        return num_vertices_err_res(UnsupportedFeature, "unsupported");
    }

    let mut ids = Vec::with_capacity(parts.len() - 1);
    for (i, part) in parts[1..].iter().enumerate() {
        let mut iter = part.split('/');
        let vertex = parse_f_component(state.line, &mut iter, i + 1, false)?;
        let texture = parse_f_component(state.line, &mut iter, i + 1, true)?;
        let normal = parse_f_component(state.line, &mut iter, i + 1, true)?;
        if iter.next().is_some() {
            let desc = format!(
                "malformed vertex {} in f-statement at line {}",
                i + 1,
                state.line
            );
            return Err(Error::new(MalformedData, desc));
        }
        ids.push(state.corner_id((vertex, texture, normal))?);
    }

    for i in 1..ids.len() - 1 {
        state.faces.push([ids[0], ids[i], ids[i + 1]]);
    }

    Ok(())
}

fn parse_f_component(
    line: usize,
    iter: &mut std::str::Split<char>,
    vnum: usize,
    optional: bool,
) -> Result<u32> {
    let component = iter.next().unwrap_or_default();
    if component.is_empty() && optional {
        return Ok(0);
    }

    let num = component.parse::<u32>().unwrap_or_default();
    if num != 0 {
        Ok(num)
    } else {
        let desc = format!(
            "malformed vertex {} in f-statement at line {}",
            vnum, line
        );
        Err(Error::new(MalformedData, desc))
    }
}

fn import_v(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    // An optional w-coordinate or vertex color may follow.
    if parts.len() != 4 && parts.len() != 5 && parts.len() != 7 {
        return Err(Error::new(
            MalformedData,
            format!("malformed v-statement at line {}", state.line),
        ));
    }

    let x = parse_coord("x-coordinate of v-statement", state.line, parts[1])?;
    let y = parse_coord("y-coordinate of v-statement", state.line, parts[2])?;
    let z = parse_coord("z-coordinate of v-statement", state.line, parts[3])?;

    state.positions.push(Point3::new(x, y, z));

    Ok(())
}

fn import_vn(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    if parts.len() != 4 {
        return Err(Error::new(
            MalformedData,
            format!("malformed vn-statement at line {}", state.line),
        ));
    }

    let x = parse_coord("x-coordinate of vn-statement", state.line, parts[1])?;
    let y = parse_coord("y-coordinate of vn-statement", state.line, parts[2])?;
    let z = parse_coord("z-coordinate of vn-statement", state.line, parts[3])?;

    state.normals.push(Vector3::new(x, y, z));

    Ok(())
}

fn import_vt(state: &mut ImportState, parts: &[&str]) -> Result<()> {
    if parts.len() < 3 || parts.len() > 4 {
        return Err(Error::new(
            MalformedData,
            format!("malformed vt-statement at line {}", state.line),
        ));
    }

    let u = parse_coord("u-coordinate of vt-statement", state.line, parts[1])?;
    let v = parse_coord("v-coordinate of vt-statement", state.line, parts[2])?;

    state.texture_points.push(Vector2::new(u, v));

    Ok(())
}

fn parse_coord(what: &str, line: usize, str: &str) -> Result<f64> {
    match str.parse::<f64>() {
        Ok(val) => Ok(val),
        Err(_) => Err(Error::new(
            MalformedData,
            format!("failed to parse {} at line {}", what, line),
        )),
    }
}
