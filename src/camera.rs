// View camera: right-handed view space looking down -Z, clip depth 0..1

use glam::{Mat4, UVec2, Vec2, Vec3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewCamera {
    /// World to view transform
    pub view: Mat4,
    /// View to clip transform (wgpu depth range)
    pub projection: Mat4,
    /// Render target size in pixels
    pub viewport: UVec2,
}

impl ViewCamera {
    pub fn new(view: Mat4, projection: Mat4, viewport: UVec2) -> Self {
        Self {
            view,
            projection,
            viewport,
        }
    }

    /// Perspective camera at `eye` looking at `target`
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov_y: f32, viewport: UVec2) -> Self {
        let aspect = viewport.x.max(1) as f32 / viewport.y.max(1) as f32;
        Self {
            view: Mat4::look_at_rh(eye, target, up),
            projection: Mat4::perspective_rh(fov_y, aspect, 0.01, 1000.0),
            viewport,
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn position(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }

    pub fn forward(&self) -> Vec3 {
        -self.view.inverse().z_axis.truncate().normalize_or_zero()
    }

    pub fn up(&self) -> Vec3 {
        self.view.inverse().y_axis.truncate().normalize_or_zero()
    }

    /// Focal lengths in pixels
    pub fn focal(&self) -> Vec2 {
        Vec2::new(
            self.projection.x_axis.x * self.viewport.x as f32 * 0.5,
            self.projection.y_axis.y * self.viewport.y as f32 * 0.5,
        )
    }

    /// tan(fov / 2) per axis
    pub fn tan_half_fov(&self) -> Vec2 {
        Vec2::new(1.0 / self.projection.x_axis.x, 1.0 / self.projection.y_axis.y)
    }

    pub fn ndc_to_pixel(&self, ndc: Vec2) -> Vec2 {
        ndc_to_pixel(ndc, self.viewport)
    }
}

/// Pixel coordinate (y down) of a normalized device coordinate
#[inline]
pub fn ndc_to_pixel(ndc: Vec2, viewport: UVec2) -> Vec2 {
    let size = viewport.as_vec2();
    Vec2::new((ndc.x * 0.5 + 0.5) * size.x, (0.5 - ndc.y * 0.5) * size.y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_at_derived_values() {
        let camera = ViewCamera::look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
            std::f32::consts::FRAC_PI_2,
            UVec2::new(200, 100),
        );
        assert!((camera.position() - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-4);
        assert!((camera.forward() - Vec3::NEG_Z).length() < 1e-4);
        assert!((camera.up() - Vec3::Y).length() < 1e-4);
        // 90 degree vertical fov: focal_y = h / 2
        assert!((camera.focal().y - 50.0).abs() < 1e-3);
        assert!((camera.tan_half_fov().y - 1.0).abs() < 1e-4);
        assert_eq!(camera.ndc_to_pixel(Vec2::new(-1.0, 1.0)), Vec2::ZERO);
    }
}
