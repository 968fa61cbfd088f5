//! Block-structured normal equations of the ODR least-squares problem.
//!
//! Purpose
//! -------
//! Each observation couples the shared parameters `β` with its own errors
//! `δ_i` only, so the damped normal matrix has an arrowhead shape:
//!
//! ```text
//! [ Σ BᵢᵀBᵢ + λD_β²   B₁ᵀA₁   ⋯   BₙᵀAₙ ]
//! [ A₁ᵀB₁             H₁               ]
//! [   ⋮                     ⋱          ]
//! [ AₙᵀBₙ                         Hₙ   ]
//! ```
//!
//! with `Hᵢ = AᵢᵀAᵢ + VᵢᵀVᵢ + λD_i²`. Eliminating every `δ_i` leaves the
//! parameter system `S s = −g̃` with `S = Σ BᵢᵀBᵢ − KᵢHᵢ⁻¹Kᵢᵀ`,
//! `Kᵢ = BᵢᵀAᵢ`. A step costs one small factorization per observation plus
//! one `npar × npar` solve.
//!
//! Conventions
//! -----------
//! - Parameter columns are the parameters left free by `ifixb`; `active`
//!   masks select the ones allowed to move in a given solve.
//! - Inactive columns move by a fixed `shift` that enters through the
//!   residual (zero for frozen parameters, the distance to the bound for
//!   pinned ones).
//! - `D` holds the scales of the unknowns; the trust region is measured in
//!   `‖D s‖`.
use super::linalg::{pseudo_inverse, solve_damped, spd_inverse};
use nalgebra::{DMatrix, DVector};

/// Relative slack accepted around the trust-region radius.
const RADIUS_TOLERANCE: f64 = 0.1;
const MAX_LAMBDA_SEARCH: usize = 100;

/// Linearization of the residual rows of one observation.
#[derive(Debug, Clone)]
pub struct ObservationBlock {
    /// `U_i ∂f/∂β` over the parameter columns, `(nq, nb)`.
    pub b: DMatrix<f64>,
    /// `U_i ∂f/∂δ` over the free errors of this observation, `(nq, md)`.
    pub a: DMatrix<f64>,
    /// `V_i` restricted to the free error columns, `(d.len(), md)`.
    pub v: DMatrix<f64>,
    /// `U_i ε_i`.
    pub e: DVector<f64>,
    /// `V_i δ_i`; empty for OLS.
    pub d: DVector<f64>,
    /// Scales of the free errors.
    pub scale: DVector<f64>,
}

/// A step in the parameter columns and the free errors.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStep {
    pub beta: DVector<f64>,
    /// One vector per observation over its free errors.
    pub delta: Vec<DVector<f64>>,
}

#[derive(Debug, Clone)]
pub struct BlockSystem {
    pub blocks: Vec<ObservationBlock>,
    /// Scales of the parameter columns.
    pub beta_scale: DVector<f64>,
}

struct Elimination {
    inverse: DMatrix<f64>,
    /// `Kᵢ`, `(na, md)`.
    coupling: DMatrix<f64>,
    /// `AᵢᵀE + VᵢᵀdE` with the shifted residual.
    local: DVector<f64>,
}

struct Reduced {
    matrix: DMatrix<f64>,
    gradient: DVector<f64>,
    parts: Vec<Elimination>,
}

impl BlockSystem {
    pub fn columns(&self) -> usize {
        self.beta_scale.len()
    }

    /// `Σ Bᵢᵀ eᵢ`.
    pub fn gradient_beta(&self) -> DVector<f64> {
        let mut gradient = DVector::zeros(self.columns());
        for block in &self.blocks {
            gradient += block.b.tr_mul(&block.e);
        }
        gradient
    }

    /// Sum of squares of the linearized residual after `step`.
    pub fn predicted(&self, step: &BlockStep) -> f64 {
        self.blocks
            .iter()
            .zip(&step.delta)
            .map(|(block, t)| {
                let eps = &block.e + &block.b * &step.beta + &block.a * t;
                let err = &block.d + &block.v * t;
                eps.norm_squared() + err.norm_squared()
            })
            .sum()
    }

    /// `‖D s‖` over the active parameter columns and every free error.
    pub fn scaled_norm(&self, step: &BlockStep, active: &[bool]) -> f64 {
        let beta: f64 = (0..self.columns())
            .filter(|&c| active[c])
            .map(|c| (self.beta_scale[c] * step.beta[c]).powi(2))
            .sum();
        let delta: f64 =
            self.blocks.iter().zip(&step.delta).map(|(block, t)| t.component_mul(&block.scale).norm_squared()).sum();
        (beta + delta).sqrt()
    }

    /// `‖D⁻¹ Jᵀr‖` at a zero step of the active unknowns.
    fn scaled_gradient(&self, active: &[bool], shift: &DVector<f64>) -> f64 {
        let mut beta = DVector::zeros(self.columns());
        let mut total = 0.0;
        for block in &self.blocks {
            let e = &block.e + &block.b * shift;
            beta += block.b.tr_mul(&e);
            let local = block.a.tr_mul(&e) + block.v.tr_mul(&block.d);
            total += local.component_div(&block.scale).norm_squared();
        }
        total += (0..self.columns()).filter(|&c| active[c]).map(|c| (beta[c] / self.beta_scale[c]).powi(2)).sum::<f64>();
        total.sqrt()
    }

    fn reduce(&self, columns: &[usize], shift: &DVector<f64>, lambda: f64) -> Reduced {
        let na = columns.len();
        let mut matrix = DMatrix::zeros(na, na);
        let mut gradient = DVector::zeros(na);
        let mut parts = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let b = block.b.select_columns(columns.iter());
            let e = &block.e + &block.b * shift;
            let mut h = block.a.tr_mul(&block.a) + block.v.tr_mul(&block.v);
            for (p, s) in block.scale.iter().enumerate() {
                h[(p, p)] += lambda * s * s;
            }
            let inverse = spd_inverse(&h);
            let coupling = b.tr_mul(&block.a);
            let local = block.a.tr_mul(&e) + block.v.tr_mul(&block.d);
            let weighted = &coupling * &inverse;
            matrix += b.tr_mul(&b) - &weighted * coupling.transpose();
            gradient += b.tr_mul(&e) - &weighted * &local;
            parts.push(Elimination { inverse, coupling, local });
        }
        Reduced { matrix, gradient, parts }
    }

    /// Solve `(JᵀJ + λD²) s = −Jᵀr` for the active columns and the errors,
    /// with the inactive columns moved by `shift`.
    ///
    /// Returns `None` when the reduced parameter system does not factor.
    pub fn solve(&self, active: &[bool], shift: &DVector<f64>, lambda: f64) -> Option<BlockStep> {
        let columns = columns_of(active);
        let reduced = self.reduce(&columns, shift, lambda);
        let solved = if columns.is_empty() {
            DVector::zeros(0)
        } else {
            let damping = DVector::from_iterator(columns.len(), columns.iter().map(|&c| self.beta_scale[c].powi(2)));
            solve_damped(&reduced.matrix, &reduced.gradient, lambda, &damping)?
        };
        let mut beta = shift.clone();
        for (pos, &c) in columns.iter().enumerate() {
            beta[c] = solved[pos];
        }
        let delta: Vec<DVector<f64>> = reduced
            .parts
            .iter()
            .map(|part| -(&part.inverse * (&part.local + part.coupling.tr_mul(&solved))))
            .collect();
        delta.iter().all(|t| t.iter().all(|v| v.is_finite())).then_some(BlockStep { beta, delta })
    }

    /// Damped step whose scaled norm fits `radius`.
    ///
    /// The Gauss–Newton step is taken when it fits; otherwise `λ` is searched
    /// on a log scale between 0 and `‖D⁻¹Jᵀr‖ / radius`, where the step is
    /// guaranteed to fit. Returns the step and its `λ`.
    pub fn step_within(&self, active: &[bool], shift: &DVector<f64>, radius: f64) -> Option<(BlockStep, f64)> {
        if let Some(step) = self.solve(active, shift, 0.0) {
            if self.scaled_norm(&step, active) <= (1.0 + RADIUS_TOLERANCE) * radius {
                return Some((step, 0.0));
            }
        }
        let mut high = (self.scaled_gradient(active, shift) / radius.max(f64::MIN_POSITIVE)).clamp(f64::MIN_POSITIVE, f64::MAX);
        let mut low = high * 1e-12;
        let mut best = None;
        for _ in 0..MAX_LAMBDA_SEARCH {
            let lambda = (low * high).sqrt();
            match self.solve(active, shift, lambda) {
                Some(step) => {
                    let norm = self.scaled_norm(&step, active);
                    if (norm - radius).abs() <= RADIUS_TOLERANCE * radius {
                        return Some((step, lambda));
                    }
                    if norm > radius {
                        low = lambda;
                    } else {
                        high = lambda;
                        best = Some((step, lambda));
                    }
                }
                None => low = lambda,
            }
            if high / low < 1.0 + f64::EPSILON.sqrt() {
                break;
            }
        }
        best.or_else(|| self.solve(active, shift, high).map(|step| (step, high)))
    }

    /// Parameter block of `(JᵀJ)⁻¹` over the active columns and the number
    /// of eigenvalues treated as zero.
    pub fn covariance(&self, active: &[bool]) -> (DMatrix<f64>, usize) {
        let columns = columns_of(active);
        let reduced = self.reduce(&columns, &DVector::zeros(self.columns()), 0.0);
        pseudo_inverse(reduced.matrix)
    }
}

fn columns_of(active: &[bool]) -> Vec<usize> {
    active.iter().enumerate().filter_map(|(c, &on)| on.then_some(c)).collect()
}
