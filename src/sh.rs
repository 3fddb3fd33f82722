// Spherical harmonics color evaluation (degree 0-3)

use glam::Vec3;

pub const SH_C0: f32 = 0.282_094_8;
const SH_C1: f32 = 0.488_602_52;
const SH_C2: [f32; 5] = [1.092_548_4, -1.092_548_4, 0.315_391_57, -1.092_548_4, 0.546_274_2];
const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_33,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

/// Evaluates the SH color toward `dir` (unit vector from the camera to the
/// splat) using bands up to `degree`. The result is offset by 0.5 and
/// clamped at zero, matching the usual 3DGS convention.
pub fn eval_sh(coeffs: &[[f32; 3]], degree: u32, dir: Vec3) -> Vec3 {
    let c = |i: usize| coeffs.get(i).map_or(Vec3::ZERO, |v| Vec3::from_array(*v));

    let mut color = SH_C0 * c(0);
    if degree >= 1 {
        let (x, y, z) = (dir.x, dir.y, dir.z);
        color += -SH_C1 * y * c(1) + SH_C1 * z * c(2) - SH_C1 * x * c(3);

        if degree >= 2 {
            let (xx, yy, zz) = (x * x, y * y, z * z);
            let (xy, yz, xz) = (x * y, y * z, x * z);
            color += SH_C2[0] * xy * c(4)
                + SH_C2[1] * yz * c(5)
                + SH_C2[2] * (2.0 * zz - xx - yy) * c(6)
                + SH_C2[3] * xz * c(7)
                + SH_C2[4] * (xx - yy) * c(8);

            if degree >= 3 {
                color += SH_C3[0] * y * (3.0 * xx - yy) * c(9)
                    + SH_C3[1] * xy * z * c(10)
                    + SH_C3[2] * y * (4.0 * zz - xx - yy) * c(11)
                    + SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy) * c(12)
                    + SH_C3[4] * x * (4.0 * zz - xx - yy) * c(13)
                    + SH_C3[5] * z * (xx - yy) * c(14)
                    + SH_C3[6] * x * (xx - 3.0 * yy) * c(15);
            }
        }
    }
    (color + Vec3::splat(0.5)).max(Vec3::ZERO)
}
