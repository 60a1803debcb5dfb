// Per-frame transform block, laid out for a std140 uniform buffer

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
}

impl UniformBufferObject {
    /// Transforms for `elapsed` seconds since the first frame, rendered
    /// into a target of size `extent`.
    pub fn at(elapsed: f32, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z(elapsed * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;

        Self {
            model,
            view,
            projection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn layout_is_three_packed_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 192);
        assert_eq!(std::mem::align_of::<Mat4>(), 16);
        assert_eq!(std::mem::align_of::<UniformBufferObject>(), 16);

        let offsets = [
            std::mem::offset_of!(UniformBufferObject, model),
            std::mem::offset_of!(UniformBufferObject, view),
            std::mem::offset_of!(UniformBufferObject, projection),
        ];
        assert_eq!(offsets, [0, 64, 128]);
        assert!(offsets.iter().all(|offset| offset % 16 == 0));
    }

    #[test]
    fn contents_change_over_time() {
        let first = UniformBufferObject::at(0.0, EXTENT);
        let second = UniformBufferObject::at(1.0, EXTENT);

        assert_ne!(first, second);
        assert_eq!(first.view, second.view);
        assert_eq!(first.projection, second.projection);
        assert!(first.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn one_second_is_a_quarter_turn() {
        let ubo = UniformBufferObject::at(1.0, EXTENT);
        let x = ubo.model.transform_vector3(Vec3::X);
        assert!(x.abs_diff_eq(Vec3::Y, 1e-5), "{:?}", x);
    }

    #[test]
    fn projection_flips_y_and_tracks_aspect() {
        let wide = UniformBufferObject::at(0.0, EXTENT);
        assert!(wide.projection.y_axis.y < 0.0);

        let resized = UniformBufferObject::at(
            0.0,
            vk::Extent2D {
                width: 1024,
                height: 768,
            },
        );
        let square = UniformBufferObject::at(
            0.0,
            vk::Extent2D {
                width: 600,
                height: 600,
            },
        );
        assert_ne!(wide.projection, square.projection);
        assert!((resized.projection.x_axis.x - wide.projection.x_axis.x).abs() < 1e-6);
    }

    #[test]
    fn bytes_match_matrix_columns() {
        let ubo = UniformBufferObject::at(0.5, EXTENT);
        let bytes = bytemuck::bytes_of(&ubo);
        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(&floats[..16], &ubo.model.to_cols_array());
        assert_eq!(&floats[32..48], &ubo.projection.to_cols_array());
    }
}
