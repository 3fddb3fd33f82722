// Gaussian Splats data structure and device upload

use glam::{Quat, Vec3, Vec4};
use tracing::debug;

use crate::buffer::{record_words, GpuBuffer};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::splat_state::SplatState;

/// Highest SH degree carried on the device (16 coefficients per channel).
pub const MAX_SH_DEGREE: u32 = 3;
pub const MAX_SH_COEFFS: usize = 16;

/// A set of Gaussian splats (CPU side)
#[derive(Debug, Clone, Default)]
pub struct GaussianSplats {
    /// Positions of splats (N x 3)
    pub means: Vec<Vec3>,
    /// Rotation quaternions stored as (w, x, y, z) (N x 4)
    pub rotations: Vec<Vec4>,
    /// Log-space scales (N x 3)
    pub log_scales: Vec<Vec3>,
    /// Spherical harmonic coefficients (N x C x 3), C = number of SH coefficients
    pub sh_coeffs: Vec<Vec<Vec3>>,
    /// Raw opacity values (before sigmoid) (N)
    pub raw_opacities: Vec<f32>,
}

impl GaussianSplats {
    /// Create new Gaussian Splats from raw data
    pub fn new(
        means: Vec<Vec3>,
        rotations: Vec<Vec4>,
        log_scales: Vec<Vec3>,
        sh_coeffs: Vec<Vec<Vec3>>,
        raw_opacities: Vec<f32>,
    ) -> Result<Self> {
        let splats = Self {
            means,
            rotations,
            log_scales,
            sh_coeffs,
            raw_opacities,
        };
        splats.validate()?;
        Ok(splats)
    }

    /// Every per-splat field must have one entry per mean
    pub fn validate(&self) -> Result<()> {
        let expected = self.means.len();
        let fields = [
            ("rotations", self.rotations.len()),
            ("log_scales", self.log_scales.len()),
            ("sh_coeffs", self.sh_coeffs.len()),
            ("raw_opacities", self.raw_opacities.len()),
        ];
        match fields.into_iter().find(|&(_, found)| found != expected) {
            Some((field, found)) => Err(Error::InconsistentSplatData { field, expected, found }),
            None => Ok(()),
        }
    }

    /// Number of splats
    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// SH degree from the first splat's coefficient count
    pub fn sh_degree(&self) -> u32 {
        self.sh_coeffs
            .first()
            .map_or(0, |c| sh_degree_from_coeffs(c.len() as u32))
    }

    /// Axis-aligned bounding box of all splat centers
    pub fn bounding_box(&self) -> Option<(Vec3, Vec3)> {
        let first = *self.means.first()?;
        Some(
            self.means
                .iter()
                .fold((first, first), |(min, max), &p| (min.min(p), max.max(p))),
        )
    }

    pub fn center(&self) -> Vec3 {
        self.bounding_box()
            .map_or(Vec3::ZERO, |(min, max)| (min + max) * 0.5)
    }

    /// Extract a subset of splats based on indices
    /// Out of range indices are skipped
    pub fn extract_subset(&self, indices: &[usize]) -> Self {
        let mut subset = Self::default();
        for &idx in indices {
            if idx < self.means.len() {
                subset.means.push(self.means[idx]);
                subset.rotations.push(self.rotations[idx]);
                subset.log_scales.push(self.log_scales[idx]);
                subset.sh_coeffs.push(self.sh_coeffs[idx].clone());
                subset.raw_opacities.push(self.raw_opacities[idx]);
            }
        }
        subset
    }

    /// Append a single splat. `color` is the linear base color (SH band 0).
    pub fn push(&mut self, mean: Vec3, rotation: Quat, scale: Vec3, color: Vec3, opacity: f32) {
        self.means.push(mean);
        self.rotations
            .push(Vec4::new(rotation.w, rotation.x, rotation.y, rotation.z));
        self.log_scales.push(Vec3::new(scale.x.ln(), scale.y.ln(), scale.z.ln()));
        self.sh_coeffs.push(vec![rgb_to_sh(color)]);
        self.raw_opacities.push(inverse_sigmoid(opacity.clamp(1e-6, 1.0 - 1e-6)));
    }

    fn pack(&self, index: usize) -> PackedSplat {
        let r = self.rotations[index];
        let rotation = Quat::from_xyzw(r.y, r.z, r.w, r.x).normalize();
        let scale = Vec3::new(
            self.log_scales[index].x.exp(),
            self.log_scales[index].y.exp(),
            self.log_scales[index].z.exp(),
        );

        let coeffs = &self.sh_coeffs[index];
        let mut sh = [[0.0f32; 3]; MAX_SH_COEFFS];
        for (dst, src) in sh.iter_mut().zip(coeffs.iter()) {
            *dst = src.to_array();
        }

        PackedSplat {
            position: self.means[index].to_array(),
            opacity: sigmoid(self.raw_opacities[index]),
            rotation: rotation.to_array(),
            scale: scale.to_array(),
            sh_degree: sh_degree_from_coeffs(coeffs.len() as u32).min(MAX_SH_DEGREE),
            sh,
        }
    }
}

/// Device layout of one splat: activated opacity and scale, normalized
/// rotation (x, y, z, w), band-0..3 SH coefficients zero padded.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PackedSplat {
    pub position: [f32; 3],
    pub opacity: f32,
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
    pub sh_degree: u32,
    pub sh: [[f32; 3]; MAX_SH_COEFFS],
}

pub const PACKED_SPLAT_WORDS: usize = record_words::<PackedSplat>();

/// Splat data resident on the device
#[derive(Debug, Clone)]
pub struct SplatBuffers {
    pub splats: GpuBuffer,
    /// One state word per splat (see `splat_state::state_bits`); None = all valid
    pub state: Option<GpuBuffer>,
    pub count: u32,
}

impl SplatBuffers {
    pub fn upload(device: &ComputeDevice, splats: &GaussianSplats, state: Option<&SplatState>) -> Result<Self> {
        splats.validate()?;
        let packed: Vec<PackedSplat> = (0..splats.len()).map(|i| splats.pack(i)).collect();
        let mut buffers = Self {
            splats: device.create_buffer_from_records("gaussian_splats_packed", &packed),
            state: None,
            count: splats.len() as u32,
        };
        buffers.set_state(device, state);

        debug!(
            "Uploaded {} splats ({} words, state buffer: {})",
            buffers.count,
            buffers.splats.len(),
            buffers.state.is_some()
        );
        Ok(buffers)
    }

    /// Replace the state buffer after an edit (None = all valid)
    pub fn set_state(&mut self, device: &ComputeDevice, state: Option<&SplatState>) {
        self.state = state.map(|s| {
            let words: Vec<u32> = (0..self.count as usize)
                .map(|i| s.states.get(i).copied().unwrap_or(0) as u32)
                .collect();
            device.create_buffer_init("gaussian_splat_state_buffer", &words)
        });
    }

    pub fn splat(&self, index: u32) -> PackedSplat {
        self.splats.read_record(index as usize)
    }

    pub fn state_bits(&self, index: u32) -> u32 {
        self.state.as_ref().map_or(0, |s| s.load(index as usize))
    }
}

/// Calculate SH degree from number of coefficients
pub fn sh_degree_from_coeffs(num_coeffs: u32) -> u32 {
    // SH degree d has (d+1)^2 coefficients; a partial band is ignored
    let d = (num_coeffs as f32).sqrt() as u32;
    d.saturating_sub(1)
}

/// Calculate number of SH coefficients for a given degree
pub fn sh_coeffs_for_degree(degree: u32) -> u32 {
    (degree + 1) * (degree + 1)
}

pub fn rgb_to_sh(rgb: Vec3) -> Vec3 {
    (rgb - Vec3::splat(0.5)) / crate::sh::SH_C0
}

/// Inverse sigmoid function
pub fn inverse_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

/// Sigmoid function
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Create example/test Gaussian Splats on a dense grid
pub fn create_test_splats(count: usize) -> GaussianSplats {
    let mut splats = GaussianSplats::default();

    let grid_size = ((count as f32).cbrt().ceil() as usize).max(1);
    let spacing = 0.1;
    let offset = -(grid_size as f32 * spacing) / 2.0;

    for i in 0..count {
        let x = (i % grid_size) as f32 * spacing + offset;
        let y = ((i / grid_size) % grid_size) as f32 * spacing + offset;
        let z = (i / (grid_size * grid_size)) as f32 * spacing + offset;

        let axis = Vec3::new(x, y, z).normalize_or(Vec3::Y);
        let rotation = Quat::from_axis_angle(axis, (x + y + z) * 0.5);

        let extent = grid_size as f32 * spacing;
        let color = Vec3::new(
            (x - offset) / extent,
            (y - offset) / extent,
            (z - offset) / extent,
        );
        splats.push(Vec3::new(x, y, z), rotation, Vec3::splat((-4.0f32).exp()), color, 0.9);
    }

    splats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_degree_round_trip() {
        for degree in 0..=3 {
            assert_eq!(sh_degree_from_coeffs(sh_coeffs_for_degree(degree)), degree);
        }
        // incomplete band 2
        assert_eq!(sh_degree_from_coeffs(6), 1);
    }

    #[test]
    fn test_sigmoid_inverse() {
        for x in [0.01f32, 0.25, 0.5, 0.9, 0.99] {
            assert!((sigmoid(inverse_sigmoid(x)) - x).abs() < 1e-5);
        }
    }

    #[test]
    fn test_pack_activates_parameters() {
        let mut splats = GaussianSplats::default();
        splats.push(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_rotation_z(0.5),
            Vec3::new(0.5, 0.25, 2.0),
            Vec3::new(0.2, 0.4, 0.6),
            0.75,
        );
        let packed = splats.pack(0);
        assert_eq!(packed.position, [1.0, 2.0, 3.0]);
        assert!((packed.opacity - 0.75).abs() < 1e-5);
        assert!((packed.scale[0] - 0.5).abs() < 1e-5);
        assert!((packed.scale[2] - 2.0).abs() < 1e-5);
        let q = Quat::from_array(packed.rotation);
        assert!(q.angle_between(Quat::from_rotation_z(0.5)) < 1e-4);
        assert_eq!(packed.sh_degree, 0);
        let base = Vec3::from_array(packed.sh[0]) * crate::sh::SH_C0 + Vec3::splat(0.5);
        assert!((base - Vec3::new(0.2, 0.4, 0.6)).length() < 1e-5);
        assert_eq!(packed.sh[1], [0.0; 3]);
    }

    #[test]
    fn test_upload_without_state_treats_all_as_valid() {
        let device = ComputeDevice::default();
        let splats = create_test_splats(27);
        let buffers = SplatBuffers::upload(&device, &splats, None).unwrap();
        assert_eq!(buffers.count, 27);
        assert_eq!(buffers.splats.len(), 27 * PACKED_SPLAT_WORDS);
        assert_eq!(buffers.state_bits(3), 0);
        assert_eq!(buffers.splat(26).position, splats.means[26].to_array());
    }

    #[test]
    fn test_mismatched_fields_are_rejected() {
        let device = ComputeDevice::default();
        let mut splats = create_test_splats(2);
        splats.means.push(Vec3::ZERO);
        assert!(matches!(
            SplatBuffers::upload(&device, &splats, None),
            Err(Error::InconsistentSplatData {
                field: "rotations",
                expected: 3,
                found: 2
            })
        ));

        let splats = create_test_splats(2);
        let result = GaussianSplats::new(
            splats.means.clone(),
            splats.rotations.clone(),
            splats.log_scales.clone(),
            splats.sh_coeffs.clone(),
            vec![0.0],
        );
        assert!(matches!(
            result,
            Err(Error::InconsistentSplatData { field: "raw_opacities", .. })
        ));
        assert!(GaussianSplats::new(
            splats.means.clone(),
            splats.rotations.clone(),
            splats.log_scales.clone(),
            splats.sh_coeffs.clone(),
            splats.raw_opacities.clone(),
        )
        .is_ok());
    }

    #[test]
    fn test_bounding_box_and_subset() {
        let splats = create_test_splats(8);
        let (min, max) = splats.bounding_box().unwrap();
        assert!(min.cmple(max).all());
        let subset = splats.extract_subset(&[0, 7, 100]);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.means[1], splats.means[7]);
        assert!(GaussianSplats::default().bounding_box().is_none());
    }
}
