// View projection
// One lane per splat: cull, project the 3D covariance to a screen-space
// ellipse, resolve SH color toward the camera and emit sort keys. Visible
// splats claim a compact slot in the view record buffer with an atomic
// counter, so the visible count is only known on the device.

use std::sync::Arc;

use glam::{Mat3, Mat4, Quat, UVec2, Vec2, Vec3, Vec4, Vec4Swizzles};
use half::f16;
use tracing::warn;

use crate::buffer::{record_words, GpuBuffer};
use crate::camera::{ndc_to_pixel, ViewCamera};
use crate::config::ProjectionConfig;
use crate::device::{
    for_each_block, linear_workgroups, Capabilities, ComputeDevice, DrawArgs, Kernel, WorkgroupId,
    Workgroups, REQUIRED_INVOCATIONS_PER_WORKGROUP,
};
use crate::error::{ConfigurationError, Error, Result};
use crate::float_key::{depth_sort_key, SortOrder};
use crate::gaussian_splats::{PackedSplat, SplatBuffers, MAX_SH_DEGREE};
use crate::sh::eval_sh;
use crate::splat_state::is_renderable;
use crate::tile_binner::TileBinner;

// Frame counter words
pub const COUNTER_VISIBLE: usize = 0;
pub const COUNTER_ENTRIES: usize = 1;
pub const COUNTER_WORDS: usize = 2;

/// Projected axes are clamped to this many pixels.
pub const MAX_AXIS_PX: f32 = 1024.0;
const MIN_EIGENVALUE: f32 = 0.1;
/// View-space x/z and y/z are clamped to this multiple of tan(fov/2)
/// before building the projection Jacobian.
const JACOBIAN_FOV_CLAMP: f32 = 1.3;

const SOURCE_DERIVED: u32 = 1 << 31;
const SOURCE_ID_MASK: u32 = !SOURCE_DERIVED;

#[inline]
fn pack_half2(v: Vec2) -> u32 {
    f16::from_f32(v.x).to_bits() as u32 | ((f16::from_f32(v.y).to_bits() as u32) << 16)
}

#[inline]
fn unpack_half2(word: u32) -> Vec2 {
    Vec2::new(
        f16::from_bits(word as u16).to_f32(),
        f16::from_bits((word >> 16) as u16).to_f32(),
    )
}

/// Per-frame view data of one visible splat (8 words).
/// The rendered footprint is `{center + s*axis1 + t*axis2 : s^2 + t^2 <= 4}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ViewRecord {
    /// Pixel coordinates, y down
    pub center: [f32; 2],
    /// View-space distance along the camera axis
    pub depth: f32,
    pub axis1: u32,
    pub axis2: u32,
    pub color_rg: u32,
    pub color_ba: u32,
    /// Splat id in bits 0..31, derived flag in bit 31
    pub source: u32,
}

pub const VIEW_RECORD_WORDS: usize = record_words::<ViewRecord>();

impl ViewRecord {
    pub fn new(center: Vec2, depth: f32, axis1: Vec2, axis2: Vec2, color: Vec4, splat_id: u32, derived: bool) -> Self {
        Self {
            center: center.to_array(),
            depth,
            axis1: pack_half2(axis1),
            axis2: pack_half2(axis2),
            color_rg: pack_half2(color.xy()),
            color_ba: pack_half2(color.zw()),
            source: (splat_id & SOURCE_ID_MASK) | if derived { SOURCE_DERIVED } else { 0 },
        }
    }

    pub fn center(&self) -> Vec2 {
        Vec2::from_array(self.center)
    }

    pub fn axes(&self) -> (Vec2, Vec2) {
        (unpack_half2(self.axis1), unpack_half2(self.axis2))
    }

    pub fn color(&self) -> Vec4 {
        let rg = unpack_half2(self.color_rg);
        let ba = unpack_half2(self.color_ba);
        Vec4::new(rg.x, rg.y, ba.x, ba.y)
    }

    pub fn splat_id(&self) -> u32 {
        self.source & SOURCE_ID_MASK
    }

    pub fn is_derived(&self) -> bool {
        self.source & SOURCE_DERIVED != 0
    }

    /// Axis-aligned pixel bounds of the footprint, from the stored axes
    pub fn pixel_bounds(&self) -> (Vec2, Vec2) {
        let (a1, a2) = self.axes();
        let half = Vec2::new(
            2.0 * (a1.x * a1.x + a2.x * a2.x).sqrt(),
            2.0 * (a1.y * a1.y + a2.y * a2.y).sqrt(),
        );
        (self.center() - half, self.center() + half)
    }

    /// Ellipse coordinates (s, t) of a pixel position
    pub fn ellipse_coords(&self, p: Vec2) -> Vec2 {
        let (a1, a2) = self.axes();
        let d = p - self.center();
        Vec2::new(d.dot(a1) / a1.length_squared(), d.dot(a2) / a2.length_squared())
    }
}

/// Camera values every projection lane needs
#[derive(Debug, Clone, Copy)]
pub struct FrameCamera {
    pub view: Mat4,
    pub view_proj: Mat4,
    pub position: Vec3,
    pub focal: Vec2,
    pub tan_half_fov: Vec2,
    pub viewport: UVec2,
}

impl FrameCamera {
    pub fn new(camera: &ViewCamera) -> Result<Self> {
        if camera.viewport.x == 0 || camera.viewport.y == 0 {
            return Err(Error::EmptyViewport(camera.viewport.x, camera.viewport.y));
        }
        Ok(Self {
            view: camera.view,
            view_proj: camera.view_proj(),
            position: camera.position(),
            focal: camera.focal(),
            tan_half_fov: camera.tan_half_fov(),
            viewport: camera.viewport,
        })
    }
}

/// Screen-space covariance (a, b, c) of `[[a, b], [b, c]]` before dilation
fn project_covariance(splat: &PackedSplat, view_pos: Vec3, camera: &FrameCamera, splat_scale: f32) -> (f32, f32, f32) {
    let rotation = Quat::from_array(splat.rotation).normalize();
    let m = Mat3::from_quat(rotation) * Mat3::from_diagonal(Vec3::from_array(splat.scale) * splat_scale);
    let sigma = m * m.transpose();

    let z = -view_pos.z;
    let limit = camera.tan_half_fov * JACOBIAN_FOV_CLAMP;
    let tx = (view_pos.x / z).clamp(-limit.x, limit.x) * z;
    let ty = (view_pos.y / z).clamp(-limit.y, limit.y) * z;
    let (fx, fy) = (camera.focal.x, camera.focal.y);

    // rows: du = fx/z * dx + fx*tx/z^2 * dz, dv = -fy/z * dy - fy*ty/z^2 * dz
    let j = Mat3::from_cols(
        Vec3::new(fx / z, 0.0, 0.0),
        Vec3::new(0.0, -fy / z, 0.0),
        Vec3::new(fx * tx / (z * z), -fy * ty / (z * z), 0.0),
    );
    let t = j * Mat3::from_mat4(camera.view);
    let cov = t * sigma * t.transpose();
    (cov.x_axis.x, cov.y_axis.x, cov.y_axis.y)
}

/// Principal half axes `sqrt(2 * lambda) * e` of a 2x2 covariance
fn ellipse_axes(a: f32, b: f32, c: f32) -> (Vec2, Vec2) {
    let mid = 0.5 * (a + c);
    let radius = (0.25 * (a - c) * (a - c) + b * b).sqrt();
    let lambda1 = mid + radius;
    let lambda2 = (mid - radius).max(MIN_EIGENVALUE);

    let e1 = Vec2::new(b, lambda1 - a);
    let e1 = if e1.length_squared() > 1e-12 {
        e1.normalize()
    } else if a >= c {
        Vec2::X
    } else {
        Vec2::Y
    };
    let e2 = e1.perp();

    (
        e1 * (2.0 * lambda1).sqrt().min(MAX_AXIS_PX),
        e2 * (2.0 * lambda2).sqrt().min(MAX_AXIS_PX),
    )
}

/// Projects one splat. None when the splat is culled.
pub fn project_splat(
    splat: &PackedSplat,
    splat_id: u32,
    camera: &FrameCamera,
    config: &ProjectionConfig,
) -> Option<ViewRecord> {
    let position = Vec3::from_array(splat.position);
    let view_pos = camera.view.transform_point3(position);
    let depth = -view_pos.z;
    if depth.is_nan() || depth <= config.near_plane {
        return None;
    }

    let clip = camera.view_proj * position.extend(1.0);
    if clip.w <= 0.0 {
        return None;
    }
    let ndc = clip.xy() / clip.w;
    let limit = 1.0 + config.frustum_dilation;
    if ndc.x.abs() > limit || ndc.y.abs() > limit {
        return None;
    }

    let alpha = (splat.opacity * config.opacity_scale).min(1.0);
    if alpha.is_nan() || alpha < config.alpha_cull_threshold {
        return None;
    }

    let (a, b, c) = project_covariance(splat, view_pos, camera, config.splat_scale);
    let (axis1, axis2) = ellipse_axes(a + config.low_pass, b, c + config.low_pass);
    if !axis1.is_finite() || !axis2.is_finite() {
        return None;
    }
    if config.min_extent_px > 0.0 && 2.0 * axis1.length() < config.min_extent_px {
        return None;
    }

    let degree = config.sh_degree.min(splat.sh_degree).min(MAX_SH_DEGREE);
    let dir = (position - camera.position).normalize_or_zero();
    let rgb = eval_sh(&splat.sh, degree, dir);

    let record = ViewRecord::new(
        ndc_to_pixel(ndc, camera.viewport),
        depth,
        axis1,
        axis2,
        rgb.extend(alpha),
        splat_id,
        false,
    );

    let (min, max) = record.pixel_bounds();
    let size = camera.viewport.as_vec2();
    if max.x <= 0.0 || max.y <= 0.0 || min.x >= size.x || min.y >= size.y {
        return None;
    }
    Some(record)
}

/// Key generation mode of a projection dispatch
pub enum ProjectionMode<'a> {
    /// One depth key per visible splat; payload = view record index
    Depth {
        order: SortOrder,
        keys: &'a GpuBuffer,
        payloads: &'a GpuBuffer,
    },
    /// One composite (tile, depth) key per overlapped tile
    Tiles(TileBinner<'a>),
}

/// Buffers every projection writes
pub struct ProjectionTargets<'a> {
    /// `VIEW_RECORD_WORDS` words per visible splat
    pub records: &'a GpuBuffer,
    pub counters: &'a GpuBuffer,
}

pub struct ViewProjector {
    device: Arc<ComputeDevice>,
    config: ProjectionConfig,
    configuration_error: Option<ConfigurationError>,
}

impl ViewProjector {
    pub fn new(device: Arc<ComputeDevice>, config: ProjectionConfig) -> Self {
        let configuration_error = Capabilities::check(device.profile()).err();
        if let Some(err) = &configuration_error {
            warn!("View projector disabled: {}", err);
        }
        Self {
            device,
            config,
            configuration_error,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.configuration_error.is_none()
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Zeroes the visible and entry counters. Must precede the frame's projection.
    pub fn reset_counters(&self, counters: &GpuBuffer) {
        self.device.write_buffer(counters, 0, &[0; COUNTER_WORDS]);
    }

    pub fn project(
        &self,
        camera: &ViewCamera,
        splats: &SplatBuffers,
        targets: &ProjectionTargets<'_>,
        mode: ProjectionMode<'_>,
    ) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Invalid("view projector"));
        }
        let camera = FrameCamera::new(camera)?;
        let record_capacity = targets.records.len() / VIEW_RECORD_WORDS;
        if (splats.count as usize) > record_capacity {
            return Err(Error::CapacityExceeded {
                what: "view record buffer",
                required: splats.count as usize,
                capacity: record_capacity,
            });
        }
        if let ProjectionMode::Depth { keys, payloads, .. } = &mode {
            let available = keys.len().min(payloads.len());
            if (splats.count as usize) > available {
                return Err(Error::CapacityExceeded {
                    what: "depth key/payload buffers",
                    required: splats.count as usize,
                    capacity: available,
                });
            }
        }

        self.device.dispatch(
            &ProjectKernel {
                splats,
                camera,
                config: self.config,
                records: targets.records,
                counters: targets.counters,
                mode,
            },
            Workgroups::Direct(linear_workgroups(splats.count, REQUIRED_INVOCATIONS_PER_WORKGROUP)),
        );
        Ok(())
    }

    /// Writes `DrawArgs { vertex_count: 4, instance_count: visible }` on the device.
    pub fn build_draw_args(&self, counters: &GpuBuffer, draw_args: &GpuBuffer) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Invalid("view projector"));
        }
        self.device
            .dispatch(&DrawArgsKernel { counters, draw_args }, Workgroups::Direct(1));
        Ok(())
    }
}

struct ProjectKernel<'a> {
    splats: &'a SplatBuffers,
    camera: FrameCamera,
    config: ProjectionConfig,
    records: &'a GpuBuffer,
    counters: &'a GpuBuffer,
    mode: ProjectionMode<'a>,
}

impl Kernel for ProjectKernel<'_> {
    fn label(&self) -> &'static str {
        match self.mode {
            ProjectionMode::Depth { .. } => "view_projection_depth",
            ProjectionMode::Tiles(_) => "view_projection_tiles",
        }
    }

    fn execute(&self, group: WorkgroupId) {
        for_each_block(group, self.splats.count, REQUIRED_INVOCATIONS_PER_WORKGROUP, |range| {
            for id in range {
                if !is_renderable(self.splats.state_bits(id)) {
                    continue;
                }
                let splat = self.splats.splat(id);
                let Some(record) = project_splat(&splat, id, &self.camera, &self.config) else {
                    continue;
                };

                let slot = self.counters.atomic_add(COUNTER_VISIBLE, 1);
                self.records.write_record(slot as usize, &record);
                match &self.mode {
                    ProjectionMode::Depth {
                        order,
                        keys,
                        payloads,
                    } => {
                        keys.store(slot as usize, depth_sort_key(record.depth, *order));
                        payloads.store(slot as usize, slot);
                    }
                    ProjectionMode::Tiles(binner) => {
                        binner.emit(&record, slot);
                    }
                }
            }
        });
    }
}

struct DrawArgsKernel<'a> {
    counters: &'a GpuBuffer,
    draw_args: &'a GpuBuffer,
}

impl Kernel for DrawArgsKernel<'_> {
    fn label(&self) -> &'static str {
        "build_draw_args"
    }

    fn execute(&self, _group: WorkgroupId) {
        let visible = self.counters.atomic_load(COUNTER_VISIBLE);
        self.draw_args.write_record(
            0,
            &DrawArgs {
                vertex_count: 4,
                instance_count: visible,
                first_vertex: 0,
                first_instance: 0,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian_splats::GaussianSplats;
    use crate::splat_state::SplatState;

    fn camera() -> ViewCamera {
        ViewCamera::look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
            std::f32::consts::FRAC_PI_2,
            UVec2::new(256, 256),
        )
    }

    fn single(position: Vec3, scale: f32, opacity: f32) -> PackedSplat {
        let mut splats = GaussianSplats::default();
        splats.push(position, Quat::IDENTITY, Vec3::splat(scale), Vec3::splat(0.5), opacity);
        let device = ComputeDevice::default();
        SplatBuffers::upload(&device, &splats, None).unwrap().splat(0)
    }

    #[test]
    fn test_view_record_packing() {
        let record = ViewRecord::new(
            Vec2::new(10.5, 20.25),
            3.0,
            Vec2::new(4.0, -2.0),
            Vec2::new(1.0, 2.0),
            Vec4::new(0.25, 0.5, 0.75, 1.0),
            12345,
            true,
        );
        assert_eq!(VIEW_RECORD_WORDS, 8);
        assert_eq!(record.splat_id(), 12345);
        assert!(record.is_derived());
        assert_eq!(record.axes(), (Vec2::new(4.0, -2.0), Vec2::new(1.0, 2.0)));
        assert_eq!(record.color(), Vec4::new(0.25, 0.5, 0.75, 1.0));
        let (min, max) = record.pixel_bounds();
        let half_x = 2.0 * (16.0f32 + 1.0).sqrt();
        assert!((min.x - (10.5 - half_x)).abs() < 1e-4);
        assert!((max.y - (20.25 + 2.0 * 8.0f32.sqrt())).abs() < 1e-4);
    }

    #[test]
    fn test_isotropic_splat_projects_to_circle() {
        let camera = FrameCamera::new(&camera()).unwrap();
        let config = ProjectionConfig {
            low_pass: 0.0,
            ..Default::default()
        };
        let splat = single(Vec3::ZERO, 0.1, 0.9);
        let record = project_splat(&splat, 7, &camera, &config).unwrap();

        assert!((record.center() - Vec2::splat(128.0)).length() < 1e-3);
        assert!((record.depth - 5.0).abs() < 1e-4);
        assert_eq!(record.splat_id(), 7);

        // sigma_px = focal * scale / depth = 128 * 0.1 / 5
        let sigma = 128.0 * 0.1 / 5.0;
        let (a1, a2) = record.axes();
        let expected = (2.0f32).sqrt() * sigma;
        assert!((a1.length() - expected).abs() < 0.02, "{a1:?}");
        assert!((a2.length() - expected).abs() < 0.02, "{a2:?}");
        assert!(a1.dot(a2).abs() < 1e-2);
    }

    #[test]
    fn test_culling_rules() {
        let camera = FrameCamera::new(&camera()).unwrap();
        let config = ProjectionConfig::default();
        // behind the camera
        assert!(project_splat(&single(Vec3::new(0.0, 0.0, 6.0), 0.1, 0.9), 0, &camera, &config).is_none());
        // inside the near plane
        assert!(project_splat(&single(Vec3::new(0.0, 0.0, 4.9), 0.1, 0.9), 0, &camera, &config).is_none());
        // far outside the frustum
        assert!(project_splat(&single(Vec3::new(50.0, 0.0, 0.0), 0.1, 0.9), 0, &camera, &config).is_none());
        // transparent
        assert!(project_splat(&single(Vec3::ZERO, 0.1, 0.001), 0, &camera, &config).is_none());
        // tiny footprint with an extent threshold
        let strict = ProjectionConfig {
            min_extent_px: 4.0,
            ..config
        };
        assert!(project_splat(&single(Vec3::ZERO, 0.0001, 0.9), 0, &camera, &strict).is_none());
        assert!(project_splat(&single(Vec3::ZERO, 0.1, 0.9), 0, &camera, &strict).is_some());
    }

    #[test]
    fn test_depth_projection_counts_and_skips_deleted() {
        let device = Arc::new(ComputeDevice::default());
        let projector = ViewProjector::new(device.clone(), ProjectionConfig::default());

        let mut splats = GaussianSplats::default();
        for i in 0..10 {
            splats.push(Vec3::new(0.0, 0.0, -(i as f32)), Quat::IDENTITY, Vec3::splat(0.05), Vec3::ONE, 0.8);
        }
        let mut state = SplatState::new(10);
        state.select(&[3, 4]);
        state.delete_selected();
        let buffers = SplatBuffers::upload(&device, &splats, Some(&state)).unwrap();

        let records = device.create_buffer("records", 10 * VIEW_RECORD_WORDS);
        let counters = device.create_buffer_init("counters", &[99, 99]);
        let keys = device.create_buffer("keys", 10);
        let payloads = device.create_buffer("payloads", 10);
        let draw_args = device.create_buffer("draw_args", 4);

        projector.reset_counters(&counters);
        projector
            .project(
                &camera(),
                &buffers,
                &ProjectionTargets {
                    records: &records,
                    counters: &counters,
                },
                ProjectionMode::Depth {
                    order: SortOrder::BackToFront,
                    keys: &keys,
                    payloads: &payloads,
                },
            )
            .unwrap();
        projector.build_draw_args(&counters, &draw_args).unwrap();

        assert_eq!(counters.load(COUNTER_VISIBLE), 8);
        let args: DrawArgs = draw_args.read_record(0);
        assert_eq!((args.vertex_count, args.instance_count), (4, 8));

        let mut ids: Vec<u32> = (0..8)
            .map(|slot| records.read_record::<ViewRecord>(slot).splat_id())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 5, 6, 7, 8, 9]);
        for slot in 0..8 {
            let record: ViewRecord = records.read_record(slot);
            assert_eq!(payloads.load(slot), slot as u32);
            assert_eq!(keys.load(slot), depth_sort_key(record.depth, SortOrder::BackToFront));
        }
    }

    #[test]
    fn test_empty_viewport_is_rejected() {
        let mut camera = camera();
        camera.viewport = UVec2::new(0, 10);
        assert!(matches!(FrameCamera::new(&camera), Err(Error::EmptyViewport(0, 10))));
    }
}
