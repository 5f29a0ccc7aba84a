// Model and texture loading
//
// Produces flat vertex/index lists and RGBA8 pixel buffers; the uploader
// treats both as opaque payloads. Decode failures are errors, never
// silently replaced by a placeholder.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::path::Path;

use crate::error::RenderError;

/// Interleaved vertex, matching the inputs of shaders/scene.vert.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// RGBA8 pixels, row-major, no padding.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

fn decode_error(path: &Path, reason: impl ToString) -> RenderError {
    RenderError::AssetDecode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Unit cube centered on the origin, four vertices per face.
pub fn cube() -> MeshData {
    // (normal, u, v) with u x v = normal so each face winds counter-clockwise
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut mesh = MeshData::default();
    for (normal, u, v) in FACES {
        let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
        let base = mesh.vertices.len() as u32;

        for (su, sv) in CORNERS {
            let position = (n + u * su + v * sv) * 0.5;
            mesh.vertices.push(Vertex {
                position: position.into(),
                normal,
                // Tint each face by its axis so orientation is visible
                color: (n.abs() * 0.5 + Vec3::splat(0.5)).into(),
                uv: [(su + 1.0) * 0.5, (1.0 - sv) * 0.5],
            });
        }
        mesh.indices
            .extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }
    mesh
}

/// Load every model in a Wavefront OBJ file into one mesh.
pub fn load_model(path: &Path) -> Result<MeshData> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| decode_error(path, e))?;

    if models.is_empty() {
        return Err(decode_error(path, "no models in file").into());
    }

    let mut data = MeshData::default();
    for model in &models {
        let mesh = &model.mesh;
        let base = data.vertices.len() as u32;
        let count = mesh.positions.len() / 3;

        for i in 0..count {
            let normal = if mesh.normals.len() >= (i + 1) * 3 {
                [mesh.normals[i * 3], mesh.normals[i * 3 + 1], mesh.normals[i * 3 + 2]]
            } else {
                [0.0; 3]
            };
            let color = if mesh.vertex_color.len() >= (i + 1) * 3 {
                [
                    mesh.vertex_color[i * 3],
                    mesh.vertex_color[i * 3 + 1],
                    mesh.vertex_color[i * 3 + 2],
                ]
            } else {
                [1.0; 3]
            };
            // OBJ puts the texture origin bottom-left
            let uv = if mesh.texcoords.len() >= (i + 1) * 2 {
                [mesh.texcoords[i * 2], 1.0 - mesh.texcoords[i * 2 + 1]]
            } else {
                [0.0; 2]
            };

            data.vertices.push(Vertex {
                position: [
                    mesh.positions[i * 3],
                    mesh.positions[i * 3 + 1],
                    mesh.positions[i * 3 + 2],
                ],
                normal,
                color,
                uv,
            });
        }

        if let Some(&bad) = mesh.indices.iter().find(|&&index| index as usize >= count) {
            return Err(decode_error(path, format!("index {} out of range in {:?}", bad, model.name)).into());
        }
        data.indices.extend(mesh.indices.iter().map(|&index| base + index));

        if mesh.normals.is_empty() {
            generate_normals(&mut data.vertices[base as usize..], &mesh.indices);
        }
    }

    if data.indices.is_empty() {
        return Err(decode_error(path, "model has no faces").into());
    }

    log::info!(
        "Loaded model {:?}: {} vertices, {} triangles",
        path,
        data.vertices.len(),
        data.indices.len() / 3
    );
    Ok(data)
}

/// Area-weighted smooth normals for meshes that ship without them.
fn generate_normals(vertices: &mut [Vertex], indices: &[u32]) {
    let mut sums = vec![Vec3::ZERO; vertices.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let pa = Vec3::from(vertices[a].position);
        let face = (Vec3::from(vertices[b].position) - pa).cross(Vec3::from(vertices[c].position) - pa);
        for i in [a, b, c] {
            sums[i] += face;
        }
    }
    for (vertex, sum) in vertices.iter_mut().zip(sums) {
        vertex.normal = sum.normalize_or_zero().into();
    }
}

pub fn load_texture(path: &Path) -> Result<TextureData> {
    let image = image::open(path).map_err(|e| decode_error(path, e))?.into_rgba8();
    let (width, height) = image.dimensions();

    log::info!("Loaded texture {:?}: {}x{}", path, width, height);
    Ok(TextureData {
        width,
        height,
        pixels: image.into_raw(),
    })
}

/// Light/dark grey checkerboard used when no texture is configured.
pub fn checkerboard(size: u32, cells: u32) -> TextureData {
    let cell = (size / cells.max(1)).max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let shade = if light { 0xe0 } else { 0x40 };
            pixels.extend_from_slice(&[shade, shade, shade, 0xff]);
        }
    }
    TextureData {
        width: size,
        height: size,
        pixels,
    }
}
