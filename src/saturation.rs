//! Saturation policies: clamping configurations into variable bounds.
//!
//! A policy clamps a configuration into its admissible box and reports,
//! per tangent coordinate, which side of the box is active:
//! `-1` lower bound, `+1` upper bound, `0` interior. The solver uses the
//! signs to stop pushing against an already-active bound.

use std::fmt;
use std::sync::Arc;

use nalgebra::DVector;

/// Clamp one coordinate, reporting the active side in `sign`.
fn clamp(lb: f64, ub: f64, v: f64, vsat: &mut f64, sign: &mut i8) -> bool {
    if v <= lb {
        *vsat = lb;
        *sign = -1;
        true
    } else if v >= ub {
        *vsat = ub;
        *sign = 1;
        true
    } else {
        *vsat = v;
        *sign = 0;
        false
    }
}

/// Joint-limit description of a robot model, in flat address-array form.
///
/// Joints are described the way simulator models lay them out: per joint
/// a start index into the position vector (`jnt_qpos_adr`), a start index
/// into the velocity/tangent vector (`jnt_dof_adr`) and the two sizes.
/// For joints where `nq != nv` (unit-quaternion parameterizations) the
/// saturation sign of position coordinate `j` lands on tangent index
/// `jnt_dof_adr + min(j, nv − 1)`. Extra configuration dimensions are
/// appended after the model's `nq`/`nv` with their own bounds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceLimits {
    /// Number of generalized position coordinates of the model.
    pub nq: usize,
    /// Number of tangent (velocity) coordinates of the model.
    pub nv: usize,
    /// Start index in the position vector, per joint.
    pub jnt_qpos_adr: Vec<usize>,
    /// Start index in the tangent vector, per joint.
    pub jnt_dof_adr: Vec<usize>,
    /// Position size per joint.
    pub jnt_nq: Vec<usize>,
    /// Tangent size per joint.
    pub jnt_nv: Vec<usize>,
    /// Lower position limit per position coordinate (length `nq`).
    pub lower_position_limit: Vec<f64>,
    /// Upper position limit per position coordinate (length `nq`).
    pub upper_position_limit: Vec<f64>,
    /// Lower bounds of the extra configuration dimensions.
    pub extra_lower: Vec<f64>,
    /// Upper bounds of the extra configuration dimensions.
    pub extra_upper: Vec<f64>,
}

impl DeviceLimits {
    /// Number of joints.
    #[must_use]
    pub fn njnt(&self) -> usize {
        self.jnt_qpos_adr.len()
    }
}

/// Signature of a user-supplied saturation callable:
/// `(q, q_sat, sign) -> any coordinate clipped`.
pub type SaturationFn =
    dyn Fn(&DVector<f64>, &mut DVector<f64>, &mut [i8]) -> bool + Send + Sync;

/// A saturation policy.
#[derive(Clone, Default)]
pub enum Saturation {
    /// No bounds: the configuration passes through unchanged.
    #[default]
    None,
    /// Per-coordinate box bounds on a space where `nq == nv`.
    Bounds {
        /// Lower bounds, length `nq`.
        lower: DVector<f64>,
        /// Upper bounds, length `nq`.
        upper: DVector<f64>,
    },
    /// Joint limits of a robot model, quaternion-aware.
    Device(DeviceLimits),
    /// User-supplied callable with the same contract.
    Custom(Arc<SaturationFn>),
}

impl fmt::Debug for Saturation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Saturation::None"),
            Self::Bounds { lower, upper } => f
                .debug_struct("Saturation::Bounds")
                .field("lower", lower)
                .field("upper", upper)
                .finish(),
            Self::Device(limits) => f.debug_tuple("Saturation::Device").field(limits).finish(),
            Self::Custom(_) => f.write_str("Saturation::Custom(..)"),
        }
    }
}

impl Saturation {
    /// Clamp `q` into bounds, writing the clamped configuration into
    /// `q_sat` and the per-tangent-coordinate side into `sign`. Returns
    /// whether any coordinate was clipped.
    pub fn saturate(&self, q: &DVector<f64>, q_sat: &mut DVector<f64>, sign: &mut [i8]) -> bool {
        match self {
            Self::None => {
                q_sat.copy_from(q);
                sign.fill(0);
                false
            }
            Self::Bounds { lower, upper } => {
                let mut any = false;
                for i in 0..q.len() {
                    if clamp(lower[i], upper[i], q[i], &mut q_sat[i], &mut sign[i]) {
                        any = true;
                    }
                }
                any
            }
            Self::Device(limits) => limits_saturate(limits, q, q_sat, sign),
            Self::Custom(f) => f(q, q_sat, sign),
        }
    }
}

fn limits_saturate(
    m: &DeviceLimits,
    q: &DVector<f64>,
    q_sat: &mut DVector<f64>,
    sign: &mut [i8],
) -> bool {
    let mut any = false;
    sign.fill(0);
    q_sat.copy_from(q);

    for i in 0..m.njnt() {
        let nq = m.jnt_nq[i];
        let nv = m.jnt_nv[i];
        let idx_q = m.jnt_qpos_adr[i];
        let idx_v = m.jnt_dof_adr[i];
        for j in 0..nq {
            let iq = idx_q + j;
            let iv = idx_v + j.min(nv - 1);
            if clamp(
                m.lower_position_limit[iq],
                m.upper_position_limit[iq],
                q[iq],
                &mut q_sat[iq],
                &mut sign[iv],
            ) {
                any = true;
            }
        }
    }

    for k in 0..m.extra_lower.len() {
        let iq = m.nq + k;
        let iv = m.nv + k;
        if clamp(
            m.extra_lower[k],
            m.extra_upper[k],
            q[iq],
            &mut q_sat[iq],
            &mut sign[iv],
        ) {
            any = true;
        }
    }
    any
}
