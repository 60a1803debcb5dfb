// Asset loading - OBJ meshes and RGBA textures
//
// Plain host-side data; the GPU upload happens in backend::upload.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::mem::{offset_of, size_of};
use std::path::Path;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, position) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, tex_coord) as u32)
                .build(),
        ]
    }

    /// Bitwise identity, so vertices that differ only in -0.0/0.0 or NaN
    /// payloads stay distinct.
    fn key(&self) -> [u32; 8] {
        let floats: [f32; 8] = bytemuck::cast(*self);
        floats.map(f32::to_bits)
    }
}

/// An indexed triangle list
#[derive(Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Build an indexed mesh from an unindexed vertex stream, sharing
    /// identical vertices.
    pub fn from_vertices(stream: impl IntoIterator<Item = Vertex>) -> Self {
        let mut mesh = Mesh::default();
        let mut unique: HashMap<[u32; 8], u32> = HashMap::new();

        for vertex in stream {
            let index = *unique.entry(vertex.key()).or_insert_with(|| {
                mesh.vertices.push(vertex);
                (mesh.vertices.len() - 1) as u32
            });
            mesh.indices.push(index);
        }

        mesh
    }
}

/// Load every model in an OBJ file into one mesh.
pub fn load_model(path: &Path) -> Result<Mesh> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .with_context(|| format!("Failed to load model {:?}", path))?;

    let stream = models.iter().flat_map(|model| {
        let mesh = &model.mesh;
        mesh.indices.iter().map(move |&index| {
            let i = index as usize;
            let position = [
                mesh.positions[3 * i],
                mesh.positions[3 * i + 1],
                mesh.positions[3 * i + 2],
            ];
            // OBJ puts the texture origin bottom-left, Vulkan top-left
            let tex_coord = if mesh.texcoords.len() >= 2 * i + 2 {
                [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
            } else {
                [0.0, 0.0]
            };
            Vertex {
                position,
                color: [1.0, 1.0, 1.0],
                tex_coord,
            }
        })
    });

    let mesh = Mesh::from_vertices(stream);
    if mesh.indices.is_empty() {
        anyhow::bail!("Model {:?} contains no triangles", path);
    }

    log::info!(
        "Loaded model {:?}: {} vertices, {} indices",
        path,
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

/// Decoded texture, always expanded to RGBA8
#[derive(Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    /// Channel count of the source file before expansion
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn from_image(image: image::DynamicImage) -> Self {
        let channels = image.color().channel_count();
        let rgba = image.into_rgba8();
        Self {
            width: rgba.width(),
            height: rgba.height(),
            channels,
            pixels: rgba.into_raw(),
        }
    }
}

pub fn load_texture(path: &Path) -> Result<TextureData> {
    let image = image::open(path).with_context(|| format!("Failed to load texture {:?}", path))?;
    let texture = TextureData::from_image(image);

    if texture.width == 0 || texture.height == 0 {
        anyhow::bail!("Texture {:?} is empty", path);
    }

    log::info!(
        "Loaded texture {:?}: {}x{} ({} channels)",
        path,
        texture.width,
        texture.height,
        texture.channels
    );
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, u: f32) -> Vertex {
        Vertex {
            position: [x, 0.0, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [u, 0.0],
        }
    }

    #[test]
    fn identical_vertices_are_shared() {
        // Two triangles sharing an edge, as a quad
        let a = vertex(0.0, 0.0);
        let b = vertex(1.0, 0.0);
        let c = vertex(1.0, 1.0);
        let d = vertex(0.0, 1.0);
        let mesh = Mesh::from_vertices([a, b, c, c, d, a]);

        assert_eq!(mesh.vertices, vec![a, b, c, d]);
        assert_eq!(mesh.indices, vec![0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn differing_attributes_stay_distinct() {
        let mesh = Mesh::from_vertices([vertex(0.0, 0.0), vertex(0.0, 0.5)]);
        assert_eq!(mesh.vertices.len(), 2);
        assert_eq!(mesh.indices, vec![0, 1]);
    }

    #[test]
    fn layout_matches_attribute_offsets() {
        assert_eq!(size_of::<Vertex>(), 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes.map(|a| a.offset), [0, 12, 24]);
        assert_eq!(attributes.map(|a| a.location), [0, 1, 2]);
        assert_eq!(Vertex::binding_description().stride, 32);
    }

    #[test]
    fn rgb_texture_expands_to_rgba() {
        let rgb = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        let texture = TextureData::from_image(image::DynamicImage::ImageRgb8(rgb));

        assert_eq!((texture.width, texture.height), (3, 2));
        assert_eq!(texture.channels, 3);
        assert_eq!(texture.pixels.len(), 3 * 2 * 4);
        assert_eq!(&texture.pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn missing_files_are_errors() {
        assert!(load_model(Path::new("no/such/model.obj")).is_err());
        assert!(load_texture(Path::new("no/such/texture.png")).is_err());
    }

    #[test]
    fn loads_obj_with_shared_corners() {
        let path =
            std::env::temp_dir().join(format!("model-viewer-quad-{}.obj", std::process::id()));
        std::fs::write(
            &path,
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             f 1/1 2/2 3/3 4/4\n",
        )
        .unwrap();

        let mesh = load_model(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        // V is flipped on load
        assert_eq!(mesh.vertices[0].tex_coord, [0.0, 1.0]);
    }
}
