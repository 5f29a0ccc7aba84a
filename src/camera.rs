// Camera and per-frame uniforms

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Model/view/projection, written to one uniform buffer per swapchain image.
/// Layout matches the `FrameUniforms` block in shaders/scene.vert.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 0.0, 3.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 45f32.to_radians(),
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    /// Right-handed perspective with 0..1 depth and Y pointing down, as
    /// Vulkan clip space expects.
    pub fn projection(&self, width: u32, height: u32) -> Mat4 {
        let aspect = width as f32 / height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Uniforms for a model spinning about Y, `seconds` after start.
    pub fn uniforms(&self, seconds: f32, width: u32, height: u32) -> FrameUniforms {
        FrameUniforms {
            model: Mat4::from_rotation_y(seconds * 45f32.to_radians()),
            view: self.view(),
            proj: self.projection(width, height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn uniforms_are_three_packed_matrices() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 192);
        let u = Camera::default().uniforms(0.0, 1440, 900);
        assert_eq!(bytemuck::bytes_of(&u).len(), 192);
        assert_eq!(u.model, Mat4::IDENTITY);
    }

    #[test]
    fn origin_projects_to_screen_center() {
        let camera = Camera::default();
        let clip = camera.projection(1440, 900) * camera.view() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn world_up_is_screen_up_after_flip() {
        let camera = Camera::default();
        let clip = camera.projection(800, 600) * camera.view() * Vec4::new(0.0, 0.5, 0.0, 1.0);
        // Vulkan NDC has +Y down, so a point above the target lands at negative y
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let proj = Camera::default().projection(800, 0);
        assert!(proj.is_finite());
    }
}
