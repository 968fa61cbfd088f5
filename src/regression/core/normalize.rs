//! Parameter normalization: shape dispatch tables for optional arrays.
//!
//! Purpose
//! -------
//! Validate and canonicalize every optional array of an ODR call against the
//! broadcast rule for its role, producing the canonical descriptors
//! ([`WeightSpec`], [`Broadcast`]) that the workspace planner and the solver
//! consume.
//!
//! Key behaviors
//! -------------
//! - Weight and broadcast rules are ordered, data-driven tables
//!   ([`WEIGHT_RULES`], [`BROADCAST_RULES`]) evaluated top to bottom; the
//!   first structural match wins.
//! - Weights are stored as `(q, ld2, ld)` arrays (q = nq for `we`, m for
//!   `wd`); a scalar becomes a diagonal weight shared by all observations.
//! - `ifixx`/`stpd`/`scld` are stored as `(m, ld)` arrays with `ld ∈ {1, n}`;
//!   a per-observation vector is tiled across dimensions, a per-dimension
//!   vector stays reduced.
//! - Bounds must strictly enclose `beta0`; `delta0` must agree with job
//!   digit 4.
//!
//! Invariants & assumptions
//! ------------------------
//! - Dimensions come from the shape resolver and are all `>= 1`.
//! - Inputs are never mutated; every canonical array is an owned copy.
//!
//! Testing notes
//! -------------
//! - Unit tests enumerate both rule tables, check the reduced/materialized
//!   equivalence of broadcasts and the strict bound checks.
use crate::regression::{
    core::{
        job::JobFlags,
        options::{OdrOptions, Weight},
        shape::ProblemDimensions,
        validation::{validate_finite, validate_finite_weight, validate_non_negative},
    },
    errors::{OdrError, OdrResult},
};
use ndarray::{Array1, Array2, Array3, ArrayD};

/// Symbolic axis length used in shape patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    /// Number of weighted components: `nq` for `we`, `m` for `wd`.
    Q,
    N,
    One,
}

impl Dim {
    fn len(self, q: usize, n: usize) -> usize {
        match self {
            Dim::Q => q,
            Dim::N => n,
            Dim::One => 1,
        }
    }

    fn label(self, q_name: &str) -> String {
        match self {
            Dim::Q => q_name.to_string(),
            Dim::N => "n".to_string(),
            Dim::One => "1".to_string(),
        }
    }
}

/// How a matched weight array is read by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// One diagonal weight shared by all observations.
    SharedDiagonal,
    /// One full `q×q` block shared by all observations.
    SharedFull,
    /// A diagonal weight per observation.
    PerObservationDiagonal,
    /// Rank-3 array, `ld`/`ld2` read from its trailing axes.
    Explicit,
}

/// One row of the weight dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightRule {
    pub pattern: &'static [Dim],
    /// Rule applies only when `q == 1`.
    pub requires_single_q: bool,
    pub layout: WeightLayout,
}

/// Accepted weight shapes, in precedence order.
pub const WEIGHT_RULES: [WeightRule; 8] = [
    WeightRule { pattern: &[Dim::Q], requires_single_q: false, layout: WeightLayout::SharedDiagonal },
    WeightRule { pattern: &[Dim::Q, Dim::Q], requires_single_q: false, layout: WeightLayout::SharedFull },
    WeightRule {
        pattern: &[Dim::Q, Dim::N],
        requires_single_q: false,
        layout: WeightLayout::PerObservationDiagonal,
    },
    WeightRule { pattern: &[Dim::N], requires_single_q: true, layout: WeightLayout::PerObservationDiagonal },
    WeightRule { pattern: &[Dim::Q, Dim::One, Dim::One], requires_single_q: false, layout: WeightLayout::Explicit },
    WeightRule { pattern: &[Dim::Q, Dim::One, Dim::N], requires_single_q: false, layout: WeightLayout::Explicit },
    WeightRule { pattern: &[Dim::Q, Dim::Q, Dim::One], requires_single_q: false, layout: WeightLayout::Explicit },
    WeightRule { pattern: &[Dim::Q, Dim::Q, Dim::N], requires_single_q: false, layout: WeightLayout::Explicit },
];

impl WeightRule {
    pub fn matches(&self, shape: &[usize], q: usize, n: usize) -> bool {
        if self.requires_single_q && q != 1 {
            return false;
        }
        shape.len() == self.pattern.len()
            && self.pattern.iter().zip(shape).all(|(dim, &len)| dim.len(q, n) == len)
    }

    fn spec(&self, shape: &[usize], q: usize, n: usize) -> WeightSpec {
        match self.layout {
            WeightLayout::SharedDiagonal => WeightSpec { ld: 1, ld2: 1 },
            WeightLayout::SharedFull => WeightSpec { ld: 1, ld2: q },
            WeightLayout::PerObservationDiagonal => WeightSpec { ld: n, ld2: 1 },
            WeightLayout::Explicit => WeightSpec { ld: shape[2], ld2: shape[1] },
        }
    }

    fn describe(&self, q_name: &str) -> String {
        let axes: Vec<String> = self.pattern.iter().map(|dim| dim.label(q_name)).collect();
        let tuple = if axes.len() == 1 { format!("({},)", axes[0]) } else { format!("({})", axes.join(", ")) };
        if self.requires_single_q { format!("{tuple} when {q_name} == 1") } else { tuple }
    }
}

/// Canonical weight descriptor.
///
/// - `ld`: 1 when shared by all observations, `n` when per observation.
/// - `ld2`: 1 for diagonal weights, `q` for full blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightSpec {
    pub ld: usize,
    pub ld2: usize,
}

impl Default for WeightSpec {
    fn default() -> Self {
        Self { ld: 1, ld2: 1 }
    }
}

/// Normalized weight: descriptor plus `(q, ld2, ld)` values.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedWeight {
    pub spec: WeightSpec,
    pub values: Array3<f64>,
}

impl NormalizedWeight {
    /// Unit diagonal weights for `q` components.
    pub fn unit(q: usize) -> Self {
        Self { spec: WeightSpec::default(), values: Array3::ones((q, 1, 1)) }
    }

    pub fn q(&self) -> usize {
        self.values.shape()[0]
    }

    /// The `q×q` weight block of observation `i` (diagonals expanded).
    pub fn block(&self, i: usize) -> Array2<f64> {
        let q = self.q();
        let obs = if self.spec.ld == 1 { 0 } else { i };
        if self.spec.ld2 == 1 {
            Array2::from_shape_fn((q, q), |(a, b)| if a == b { self.values[[a, 0, obs]] } else { 0.0 })
        } else {
            Array2::from_shape_fn((q, q), |(a, b)| self.values[[a, b, obs]])
        }
    }
}

/// How a matched `ifixx`/`stpd`/`scld` array relates to `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastLayout {
    /// Same shape as `x`.
    Full,
    /// `(m,)`, shared by all observations.
    PerDimension,
    /// `(n,)`, repeated for every dimension.
    PerObservation,
}

/// Accepted per-element shapes, in precedence order.
pub const BROADCAST_RULES: [BroadcastLayout; 3] =
    [BroadcastLayout::Full, BroadcastLayout::PerDimension, BroadcastLayout::PerObservation];

impl BroadcastLayout {
    pub fn matches(&self, shape: &[usize], x_shape: &[usize], dims: &ProblemDimensions) -> bool {
        let reducible = dims.m > 1 && dims.n != dims.m;
        match self {
            BroadcastLayout::Full => shape == x_shape,
            BroadcastLayout::PerDimension => reducible && shape == [dims.m],
            BroadcastLayout::PerObservation => reducible && shape == [dims.n],
        }
    }

    fn ld(&self, n: usize) -> usize {
        match self {
            BroadcastLayout::PerDimension => 1,
            BroadcastLayout::Full | BroadcastLayout::PerObservation => n,
        }
    }
}

/// Canonical per-element array over `x`, stored as `(m, ld)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast<T> {
    pub ld: usize,
    pub values: Array2<T>,
}

impl<T: Copy> Broadcast<T> {
    /// Value for dimension `j` of observation `i`.
    pub fn get(&self, j: usize, i: usize) -> T {
        self.values[[j, if self.ld == 1 { 0 } else { i }]]
    }

    /// Full `(m, n)` expansion.
    pub fn materialize(&self, n: usize) -> Array2<T> {
        Array2::from_shape_fn((self.values.nrows(), n), |(j, i)| self.get(j, i))
    }
}

/// Leading dimension reported to the solver for an optional broadcast.
pub fn broadcast_ld<T>(broadcast: &Option<Broadcast<T>>) -> usize {
    broadcast.as_ref().map_or(1, |b| b.ld)
}

/// Every optional argument in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedParameters {
    pub we: NormalizedWeight,
    pub wd: NormalizedWeight,
    pub ifixb: Option<Array1<i32>>,
    pub stpb: Option<Array1<f64>>,
    pub sclb: Option<Array1<f64>>,
    pub ifixx: Option<Broadcast<i32>>,
    pub stpd: Option<Broadcast<f64>>,
    pub scld: Option<Broadcast<f64>>,
    pub lower: Option<Array1<f64>>,
    pub upper: Option<Array1<f64>>,
    /// Initial `delta`, `(m, n)`.
    pub delta0: Array2<f64>,
}

/// Normalize every optional argument of `options`.
///
/// Parameters
/// ----------
/// - `options`: caller options.
/// - `beta0`: initial parameters (already validated as rank 1).
/// - `x_shape`: caller's `x` shape.
/// - `dims`: resolved problem dimensions.
/// - `job`: decoded job flags (digit 4 gates `delta0`).
///
/// Errors
/// ------
/// - [`OdrError::ShapeMismatch`], [`OdrError::InvalidBounds`],
///   [`OdrError::InconsistentJobArgument`], [`OdrError::InvalidWeight`],
///   [`OdrError::NonFiniteInput`].
pub fn normalize_parameters(
    options: &OdrOptions, beta0: &Array1<f64>, x_shape: &[usize], dims: &ProblemDimensions, job: &JobFlags,
) -> OdrResult<NormalizedParameters> {
    let we = normalize_weight("we", options.we.as_ref(), dims.nq, dims.n)?;
    let wd = normalize_weight("wd", options.wd.as_ref(), dims.m, dims.n)?;

    let ifixb = normalize_per_parameter("ifixb", options.ifixb.as_ref(), dims.npar)?;
    let stpb = normalize_per_parameter("stpb", options.stpb.as_ref(), dims.npar)?;
    let sclb = normalize_per_parameter("sclb", options.sclb.as_ref(), dims.npar)?;
    if let Some(stpb) = &stpb {
        validate_finite("stpb", stpb.iter())?;
    }
    if let Some(sclb) = &sclb {
        validate_finite("sclb", sclb.iter())?;
    }

    let ifixx = normalize_broadcast("ifixx", options.ifixx.as_ref(), x_shape, dims)?;
    let stpd = normalize_broadcast("stpd", options.stpd.as_ref(), x_shape, dims)?;
    let scld = normalize_broadcast("scld", options.scld.as_ref(), x_shape, dims)?;
    if let Some(stpd) = &stpd {
        validate_finite("stpd", stpd.values.iter())?;
    }
    if let Some(scld) = &scld {
        validate_finite("scld", scld.values.iter())?;
    }

    let lower = normalize_bound("lower", options.lower.as_ref(), beta0)?;
    let upper = normalize_bound("upper", options.upper.as_ref(), beta0)?;
    let delta0 = normalize_delta0(options.delta0.as_ref(), x_shape, dims, job)?;

    log::debug!(
        "normalized weights we={:?} wd={:?}, ifixx ld={}, stpd ld={}, scld ld={}",
        we.spec,
        wd.spec,
        broadcast_ld(&ifixx),
        broadcast_ld(&stpd),
        broadcast_ld(&scld)
    );

    Ok(NormalizedParameters { we, wd, ifixb, stpb, sclb, ifixx, stpd, scld, lower, upper, delta0 })
}

/// Match a weight against [`WEIGHT_RULES`].
///
/// `q` is `nq` for `we` and `m` for `wd`. An absent weight yields unit
/// diagonal weights with `ld = ld2 = 1`.
///
/// # Errors
/// - [`OdrError::ShapeMismatch`] listing every accepted shape when no rule
///   matches.
/// - [`OdrError::InvalidWeight`] for non-finite entries, or negative entries
///   of a diagonal weight.
pub fn normalize_weight(
    argument: &'static str, weight: Option<&Weight>, q: usize, n: usize,
) -> OdrResult<NormalizedWeight> {
    let array = match weight {
        None => return Ok(NormalizedWeight::unit(q)),
        Some(Weight::Scalar(value)) => {
            validate_non_negative(argument, std::iter::once(value))?;
            return Ok(NormalizedWeight { spec: WeightSpec::default(), values: Array3::from_elem((q, 1, 1), *value) });
        }
        Some(Weight::Array(array)) => array,
    };

    let shape = array.shape();
    let Some(rule) = WEIGHT_RULES.iter().find(|rule| rule.matches(shape, q, n)) else {
        let q_name = if argument == "we" { "nq" } else { "m" };
        let accepted: Vec<String> = WEIGHT_RULES.iter().map(|rule| rule.describe(q_name)).collect();
        return Err(OdrError::ShapeMismatch {
            argument,
            expected: format!("one of {}", accepted.join(", ")),
            found: shape.to_vec(),
        });
    };

    let spec = rule.spec(shape, q, n);
    if spec.ld2 == 1 {
        validate_non_negative(argument, array.iter())?;
    } else {
        validate_finite_weight(argument, array.iter())?;
    }
    let flat: Vec<f64> = array.iter().copied().collect();
    let values = Array3::from_shape_vec((q, spec.ld2, spec.ld), flat).map_err(|_| OdrError::ShapeMismatch {
        argument,
        expected: format!("{} elements", q * spec.ld2 * spec.ld),
        found: shape.to_vec(),
    })?;
    Ok(NormalizedWeight { spec, values })
}

/// Match an `ifixx`/`stpd`/`scld` array against [`BROADCAST_RULES`].
///
/// # Errors
/// - [`OdrError::ShapeMismatch`] listing the accepted shapes when no rule
///   matches.
pub fn normalize_broadcast<T: Copy>(
    argument: &'static str, array: Option<&ArrayD<T>>, x_shape: &[usize], dims: &ProblemDimensions,
) -> OdrResult<Option<Broadcast<T>>> {
    let Some(array) = array else {
        return Ok(None);
    };
    let shape = array.shape();
    let Some(layout) = BROADCAST_RULES.iter().find(|layout| layout.matches(shape, x_shape, dims)) else {
        return Err(OdrError::ShapeMismatch {
            argument,
            expected: format!(
                "{x_shape:?} (same as 'x'), or ({},) / ({},) when m > 1 and n != m",
                dims.m, dims.n
            ),
            found: shape.to_vec(),
        });
    };

    let flat: Vec<T> = array.iter().copied().collect();
    let ld = layout.ld(dims.n);
    let values = match layout {
        BroadcastLayout::Full => Array2::from_shape_vec((dims.m, dims.n), flat),
        BroadcastLayout::PerDimension => Array2::from_shape_vec((dims.m, 1), flat),
        BroadcastLayout::PerObservation => {
            Ok(Array2::from_shape_fn((dims.m, dims.n), |(_, i)| flat[i]))
        }
    }
    .map_err(|_| OdrError::ShapeMismatch {
        argument,
        expected: format!("{} elements", dims.m * ld),
        found: shape.to_vec(),
    })?;
    Ok(Some(Broadcast { ld, values }))
}

/// Require a per-parameter array of shape `(npar,)`.
pub fn normalize_per_parameter<T: Copy>(
    argument: &'static str, array: Option<&ArrayD<T>>, npar: usize,
) -> OdrResult<Option<Array1<T>>> {
    let Some(array) = array else {
        return Ok(None);
    };
    if array.shape() != [npar] {
        return Err(OdrError::ShapeMismatch {
            argument,
            expected: format!("({npar},), the shape of 'beta0'"),
            found: array.shape().to_vec(),
        });
    }
    Ok(Some(array.iter().copied().collect()))
}

/// Validate a bound against `beta0`.
///
/// `lower` must be strictly below and `upper` strictly above `beta0` in every
/// component; NaN never satisfies either.
///
/// # Errors
/// - [`OdrError::ShapeMismatch`] if the bound is not `(npar,)`.
/// - [`OdrError::InvalidBounds`] at the first violating index.
pub fn normalize_bound(
    argument: &'static str, bound: Option<&ArrayD<f64>>, beta0: &Array1<f64>,
) -> OdrResult<Option<Array1<f64>>> {
    let Some(bound) = normalize_per_parameter(argument, bound, beta0.len())? else {
        return Ok(None);
    };
    let is_lower = argument == "lower";
    for (index, (&b, &beta)) in bound.iter().zip(beta0.iter()).enumerate() {
        let strict = if is_lower { b < beta } else { b > beta };
        if !strict {
            return Err(OdrError::InvalidBounds { argument, index, bound: b, beta0: beta });
        }
    }
    Ok(Some(bound))
}

/// Resolve the initial `delta` against job digit 4.
///
/// # Errors
/// - [`OdrError::InconsistentJobArgument`] when the flag and the argument
///   disagree.
/// - [`OdrError::ShapeMismatch`] when `delta0` is not `x`-shaped.
pub fn normalize_delta0(
    delta0: Option<&ArrayD<f64>>, x_shape: &[usize], dims: &ProblemDimensions, job: &JobFlags,
) -> OdrResult<Array2<f64>> {
    match (job.has_delta0, delta0) {
        (true, Some(delta0)) => {
            if delta0.shape() != x_shape {
                return Err(OdrError::ShapeMismatch {
                    argument: "delta0",
                    expected: format!("{x_shape:?}, the shape of 'x'"),
                    found: delta0.shape().to_vec(),
                });
            }
            validate_finite("delta0", delta0.iter())?;
            let flat: Vec<f64> = delta0.iter().copied().collect();
            Array2::from_shape_vec((dims.m, dims.n), flat).map_err(|_| OdrError::ShapeMismatch {
                argument: "delta0",
                expected: format!("{x_shape:?}, the shape of 'x'"),
                found: delta0.shape().to_vec(),
            })
        }
        (false, None) => Ok(Array2::zeros((dims.m, dims.n))),
        (true, None) => Err(OdrError::InconsistentJobArgument {
            argument: "delta0",
            reason: "job code requests a caller-supplied delta0 but none was given",
        }),
        (false, Some(_)) => Err(OdrError::InconsistentJobArgument {
            argument: "delta0",
            reason: "delta0 was given but job digit 4 is not set",
        }),
    }
}
