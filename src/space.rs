//! Configuration-space arithmetic.
//!
//! A [`ConfigSpace`] describes the manifold a configuration vector lives
//! on: a Euclidean factor, SO(3) stored as a unit quaternion, or a
//! Cartesian product of factors. Ambient storage has `nq` entries,
//! tangent vectors have `nv` entries; the two differ exactly on the
//! quaternion factors.
//!
//! The operations are the ones the solver needs: integration `q ⊕ v`,
//! logarithmic difference `a ⊖ b` and the push of a function Jacobian
//! into tangent-of-error coordinates.

use nalgebra::{DMatrix, DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tolerance below which rotation formulas switch to their series
/// expansion.
const SMALL_ANGLE: f64 = 1e-8;

/// A configuration space, possibly a Cartesian product.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConfigSpace {
    /// The Euclidean space ℝⁿ; `nq == nv == dim`.
    Vector {
        /// Dimension of the space.
        dim: usize,
    },
    /// SO(3), stored as a unit quaternion `[w, x, y, z]`; `nq = 4`,
    /// `nv = 3`.
    Rotation3,
    /// Cartesian product of factor spaces, stored contiguously.
    Product {
        /// The factors, in storage order.
        factors: Vec<ConfigSpace>,
    },
}

impl ConfigSpace {
    /// ℝⁿ.
    #[must_use]
    pub const fn vector(dim: usize) -> Self {
        Self::Vector { dim }
    }

    /// Cartesian product of the given factors.
    #[must_use]
    pub const fn product(factors: Vec<ConfigSpace>) -> Self {
        Self::Product { factors }
    }

    /// Ambient storage size.
    #[must_use]
    pub fn nq(&self) -> usize {
        match self {
            Self::Vector { dim } => *dim,
            Self::Rotation3 => 4,
            Self::Product { factors } => factors.iter().map(Self::nq).sum(),
        }
    }

    /// Tangent dimension.
    #[must_use]
    pub fn nv(&self) -> usize {
        match self {
            Self::Vector { dim } => *dim,
            Self::Rotation3 => 3,
            Self::Product { factors } => factors.iter().map(Self::nv).sum(),
        }
    }

    /// The neutral element (zeros; identity quaternion on rotation
    /// factors).
    #[must_use]
    pub fn neutral(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.nq());
        self.write_neutral(&mut out, 0);
        out
    }

    fn write_neutral(&self, out: &mut DVector<f64>, iq: usize) {
        match self {
            Self::Vector { .. } => {}
            Self::Rotation3 => out[iq] = 1.0,
            Self::Product { factors } => {
                let mut off = iq;
                for f in factors {
                    f.write_neutral(out, off);
                    off += f.nq();
                }
            }
        }
    }

    /// Integration `out = q ⊕ v`: move from `q` along the tangent vector
    /// `v`. Quaternion factors compose with the exponential of their
    /// tangent block and stay normalized.
    pub fn integrate(&self, q: &DVector<f64>, v: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(q.len(), self.nq());
        debug_assert_eq!(v.len(), self.nv());
        debug_assert_eq!(out.len(), self.nq());
        self.integrate_block(q, v, out, 0, 0);
    }

    fn integrate_block(
        &self,
        q: &DVector<f64>,
        v: &DVector<f64>,
        out: &mut DVector<f64>,
        iq: usize,
        iv: usize,
    ) {
        match self {
            Self::Vector { dim } => {
                for k in 0..*dim {
                    out[iq + k] = q[iq + k] + v[iv + k];
                }
            }
            Self::Rotation3 => {
                let rot = quat_from_storage(q, iq);
                let inc = UnitQuaternion::from_scaled_axis(Vector3::new(
                    v[iv],
                    v[iv + 1],
                    v[iv + 2],
                ));
                quat_to_storage(&(rot * inc), out, iq);
            }
            Self::Product { factors } => {
                let (mut oq, mut ov) = (iq, iv);
                for f in factors {
                    f.integrate_block(q, v, out, oq, ov);
                    oq += f.nq();
                    ov += f.nv();
                }
            }
        }
    }

    /// Logarithmic difference `out = a ⊖ b`, the tangent vector at `b`
    /// pointing to `a`. Rotation factors yield `log(b⁻¹ ∘ a)`.
    pub fn difference(&self, a: &DVector<f64>, b: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(a.len(), self.nq());
        debug_assert_eq!(b.len(), self.nq());
        debug_assert_eq!(out.len(), self.nv());
        self.difference_block(a, b, out, 0, 0);
    }

    fn difference_block(
        &self,
        a: &DVector<f64>,
        b: &DVector<f64>,
        out: &mut DVector<f64>,
        iq: usize,
        iv: usize,
    ) {
        match self {
            Self::Vector { dim } => {
                for k in 0..*dim {
                    out[iv + k] = a[iq + k] - b[iq + k];
                }
            }
            Self::Rotation3 => {
                let ra = quat_from_storage(a, iq);
                let rb = quat_from_storage(b, iq);
                let w = (rb.inverse() * ra).scaled_axis();
                out[iv] = w.x;
                out[iv + 1] = w.y;
                out[iv + 2] = w.z;
            }
            Self::Product { factors } => {
                let (mut oq, mut ov) = (iq, iv);
                for f in factors {
                    f.difference_block(a, b, out, oq, ov);
                    oq += f.nq();
                    ov += f.nv();
                }
            }
        }
    }

    /// Push a function Jacobian into tangent-of-error coordinates.
    ///
    /// `jac` holds the derivative of the function output with respect to
    /// its input, expressed in the output's local tangent frame
    /// (`nv × input_nv`). After the call it is the derivative of
    /// `out ⊖ rhs` instead. Vector factors are unchanged; rotation
    /// factors are left-multiplied by the logarithm Jacobian of the
    /// error rotation.
    pub fn transform_jacobian(
        &self,
        rhs: &DVector<f64>,
        out: &DVector<f64>,
        jac: &mut DMatrix<f64>,
    ) {
        debug_assert_eq!(rhs.len(), self.nq());
        debug_assert_eq!(out.len(), self.nq());
        debug_assert_eq!(jac.nrows(), self.nv());
        self.transform_jacobian_block(rhs, out, jac, 0, 0);
    }

    fn transform_jacobian_block(
        &self,
        rhs: &DVector<f64>,
        out: &DVector<f64>,
        jac: &mut DMatrix<f64>,
        iq: usize,
        iv: usize,
    ) {
        match self {
            Self::Vector { .. } => {}
            Self::Rotation3 => {
                let rr = quat_from_storage(rhs, iq);
                let ro = quat_from_storage(out, iq);
                let jlog = jlog3((rr.inverse() * ro).scaled_axis());
                let block = jlog * jac.rows(iv, 3);
                jac.rows_mut(iv, 3).copy_from(&block);
            }
            Self::Product { factors } => {
                let (mut oq, mut ov) = (iq, iv);
                for f in factors {
                    f.transform_jacobian_block(rhs, out, jac, oq, ov);
                    oq += f.nq();
                    ov += f.nv();
                }
            }
        }
    }

    /// Whether the storage of `q` is admissible for this space (unit
    /// quaternions on rotation factors).
    #[must_use]
    pub fn is_normalized(&self, q: &DVector<f64>) -> bool {
        self.is_normalized_block(q, 0)
    }

    fn is_normalized_block(&self, q: &DVector<f64>, iq: usize) -> bool {
        match self {
            Self::Vector { .. } => true,
            Self::Rotation3 => {
                let n = (0..4).map(|k| q[iq + k] * q[iq + k]).sum::<f64>().sqrt();
                (n - 1.0).abs() < 1e-6
            }
            Self::Product { factors } => {
                let mut off = iq;
                factors.iter().all(|f| {
                    let ok = f.is_normalized_block(q, off);
                    off += f.nq();
                    ok
                })
            }
        }
    }
}

fn quat_from_storage(q: &DVector<f64>, iq: usize) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(q[iq], q[iq + 1], q[iq + 2], q[iq + 3]))
}

fn quat_to_storage(rot: &UnitQuaternion<f64>, out: &mut DVector<f64>, iq: usize) {
    out[iq] = rot.w;
    out[iq + 1] = rot.i;
    out[iq + 2] = rot.j;
    out[iq + 3] = rot.k;
}

/// Jacobian of the SO(3) logarithm at the rotation with rotation vector
/// `w`, i.e. the derivative of `log` composed with right translation.
fn jlog3(w: Vector3<f64>) -> Matrix3<f64> {
    let theta2 = w.norm_squared();
    let hat = skew(&w);
    let coeff = if theta2 < SMALL_ANGLE {
        // Series: 1/θ² − (1 + cos θ)/(2 θ sin θ) → 1/12 + θ²/720 + …
        1.0 / 12.0 + theta2 / 720.0
    } else {
        let theta = theta2.sqrt();
        1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
    };
    Matrix3::identity() + 0.5 * hat + coeff * hat * hat
}

fn skew(w: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -w.z, w.y, w.z, 0.0, -w.x, -w.y, w.x, 0.0)
}
