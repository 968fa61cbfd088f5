//! Workspace layout planner: flat solver buffers and their offset maps.
//!
//! Purpose
//! -------
//! Compute the exact lengths of the real (`work`) and integer (`iwork`)
//! solver buffers and the starting offset of every named field inside them,
//! then allocate fresh buffers or validate restart buffers against the plan.
//!
//! Key behaviors
//! -------------
//! - Offsets and lengths come from one [`LayoutCursor`] walk over the field
//!   list, so a buffer's length and its field offsets can never disagree.
//! - `lwork = lwkmn + 1` and `liwork = liwkmn = 20 + 2·npar + nq·(npar + m)`.
//! - ODR-only fields (`delts`, `deltn`, `t`, `tt`, `omega`, `fjacd`, `wrk1`)
//!   have zero extent in ordinary-least-squares mode.
//! - [`WorkspacePlan::prepare`] accepts exactly two situations: no buffers on
//!   a fresh run, or both buffers on a restart.
//!
//! Invariants & assumptions
//! ------------------------
//! - Planning is a pure function of `(n, m, npar, nq, is_odr, ld, ld2)`.
//! - Buffers are an arena: the crate reads and writes named fields only
//!   through the offsets computed here and copies values out when decoding.
//!
//! Conventions
//! -----------
//! - Offsets are 0-based. Field extents are implied by the dimensions and
//!   listed next to each field in [`WorkspacePlan::new`].
//!
//! Testing notes
//! -------------
//! - Unit tests pin the reference sizes (`lwork = 770`, `liwork = 46` for
//!   n=10, m=3, npar=5, nq=2 with per-observation full `we` blocks) and use
//!   `proptest` for determinism and the `liwork` closed form.
use crate::regression::{
    core::{job::JobFlags, normalize::WeightSpec, shape::ProblemDimensions, validation::validate_buffer_len},
    errors::{OdrError, OdrResult},
};
use ndarray::{Array1, ArrayView1, s};

macro_rules! offset_map {
    ($(#[$meta:meta])* $name:ident { $($field:ident => $key:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            $(pub $field: usize,)*
        }

        impl $name {
            /// Field names in layout order.
            pub const NAMES: &'static [&'static str] = &[$($key),*];

            /// `(name, offset)` pairs in layout order.
            pub fn entries(&self) -> Vec<(&'static str, usize)> {
                vec![$(($key, self.$field)),*]
            }

            pub fn get(&self, name: &str) -> Option<usize> {
                match name {
                    $($key => Some(self.$field),)*
                    _ => None,
                }
            }
        }
    };
}

offset_map! {
    /// Offsets into the real work buffer.
    WorkIndex {
        delta => "delta", eps => "eps", xplus => "xplus", fn_ => "fn", sd => "sd", vcv => "vcv",
        rvar => "rvar", wss => "wss", wssde => "wssde", wssep => "wssep", rcond => "rcond",
        eta => "eta", olmav => "olmav", tau => "tau", alpha => "alpha", actrs => "actrs",
        pnorm => "pnorm", rnors => "rnors", prers => "prers", partl => "partl", sstol => "sstol",
        taufc => "taufc", epsma => "epsma",
        beta0 => "beta0", betac => "betac", betas => "betas", betan => "betan", s => "s",
        ss => "ss", ssf => "ssf", qraux => "qraux", u => "u",
        fs => "fs", fjacb => "fjacb", we1 => "we1", diff => "diff",
        delts => "delts", deltn => "deltn", t => "t", tt => "tt", omega => "omega",
        fjacd => "fjacd", wrk1 => "wrk1", wrk2 => "wrk2", wrk3 => "wrk3", wrk4 => "wrk4",
        wrk5 => "wrk5", wrk6 => "wrk6", wrk7 => "wrk7", lower => "lower", upper => "upper",
        lwkmn => "lwkmn",
    }
}

offset_map! {
    /// Offsets into the integer work buffer.
    IWorkIndex {
        msgb => "msgb", msgd => "msgd", ifix2 => "ifix2", istop => "istop", nnzw => "nnzw",
        npp => "npp", idf => "idf", job => "job", iprin => "iprin", luner => "luner",
        lunrp => "lunrp", nrow => "nrow", ntol => "ntol", neta => "neta", maxit => "maxit",
        niter => "niter", nfev => "nfev", njev => "njev", int2 => "int2", irank => "irank",
        ldtt => "ldtt", bound => "bound", liwkmn => "liwkmn",
    }
}

/// Sequential allocator of field offsets.
#[derive(Debug, Default)]
struct LayoutCursor {
    next: usize,
}

impl LayoutCursor {
    /// Reserve `extent` slots and return the start of the reservation.
    fn take(&mut self, extent: usize) -> usize {
        let start = self.next;
        self.next += extent;
        start
    }
}

/// The solver's real and integer buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceBuffers {
    pub work: Array1<f64>,
    pub iwork: Array1<i32>,
}

impl WorkspaceBuffers {
    /// `len` real values starting at `offset`.
    pub fn real(&self, offset: usize, len: usize) -> ArrayView1<'_, f64> {
        self.work.slice(s![offset..offset + len])
    }

    pub fn real_scalar(&self, offset: usize) -> f64 {
        self.work[offset]
    }

    pub fn int_scalar(&self, offset: usize) -> i32 {
        self.iwork[offset]
    }
}

/// Buffer sizes and offset maps for one problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspacePlan {
    pub dims: ProblemDimensions,
    pub is_odr: bool,
    pub we: WeightSpec,
    pub work: WorkIndex,
    pub iwork: IWorkIndex,
    pub lwork: usize,
    pub liwork: usize,
}

impl WorkspacePlan {
    /// Plan both buffers.
    ///
    /// Parameters
    /// ----------
    /// - `dims`: problem dimensions.
    /// - `is_odr`: ODR (true) or ordinary least squares (false).
    /// - `we`: response-weight descriptor; `we1` holds `ld·ld2·nq` values.
    pub fn new(dims: ProblemDimensions, is_odr: bool, we: WeightSpec) -> Self {
        let ProblemDimensions { n, m, npar: np, nq } = dims;
        let odr = |extent: usize| if is_odr { extent } else { 0 };

        // Struct fields are evaluated in source order, which is the layout order.
        let mut c = LayoutCursor::default();
        let work = WorkIndex {
            delta: c.take(n * m),
            eps: c.take(n * nq),
            xplus: c.take(n * m),
            fn_: c.take(n * nq),
            sd: c.take(np),
            vcv: c.take(np * np),
            rvar: c.take(1),
            wss: c.take(1),
            wssde: c.take(1),
            wssep: c.take(1),
            rcond: c.take(1),
            eta: c.take(1),
            olmav: c.take(1),
            tau: c.take(1),
            alpha: c.take(1),
            actrs: c.take(1),
            pnorm: c.take(1),
            rnors: c.take(1),
            prers: c.take(1),
            partl: c.take(1),
            sstol: c.take(1),
            taufc: c.take(1),
            epsma: c.take(1),
            beta0: c.take(np),
            betac: c.take(np),
            betas: c.take(np),
            betan: c.take(np),
            s: c.take(np),
            ss: c.take(np),
            ssf: c.take(np),
            qraux: c.take(np),
            u: c.take(np),
            fs: c.take(n * nq),
            fjacb: c.take(n * np * nq),
            we1: c.take(we.ld * we.ld2 * nq),
            diff: c.take(nq * (np + m)),
            delts: c.take(odr(n * m)),
            deltn: c.take(odr(n * m)),
            t: c.take(odr(n * m)),
            tt: c.take(odr(n * m)),
            omega: c.take(odr(nq * nq)),
            fjacd: c.take(odr(n * m * nq)),
            wrk1: c.take(odr(n * m * nq)),
            wrk2: c.take(n * nq),
            wrk3: c.take(np),
            wrk4: c.take(m * m),
            wrk5: c.take(m),
            wrk6: c.take(n * nq * np),
            wrk7: c.take(5 * nq),
            lower: c.take(np),
            upper: c.take(np),
            lwkmn: c.take(0),
        };

        let mut c = LayoutCursor::default();
        let iwork = IWorkIndex {
            msgb: c.take(nq * np + 1),
            msgd: c.take(nq * m + 1),
            ifix2: c.take(np),
            istop: c.take(1),
            nnzw: c.take(1),
            npp: c.take(1),
            idf: c.take(1),
            job: c.take(1),
            iprin: c.take(1),
            luner: c.take(1),
            lunrp: c.take(1),
            nrow: c.take(1),
            ntol: c.take(1),
            neta: c.take(1),
            maxit: c.take(1),
            niter: c.take(1),
            nfev: c.take(1),
            njev: c.take(1),
            int2: c.take(1),
            irank: c.take(1),
            ldtt: c.take(1),
            bound: c.take(np),
            liwkmn: c.take(0),
        };

        Self { dims, is_odr, we, work, iwork, lwork: work.lwkmn + 1, liwork: iwork.liwkmn }
    }

    /// Zero-initialized buffers of the planned lengths.
    pub fn allocate(&self) -> WorkspaceBuffers {
        WorkspaceBuffers { work: Array1::zeros(self.lwork), iwork: Array1::zeros(self.liwork) }
    }

    /// Allocate fresh buffers or accept restart buffers.
    ///
    /// Valid combinations:
    /// - not restarting and no buffers supplied: zeroed buffers;
    /// - restarting and both buffers supplied: the buffers, after an exact
    ///   length check.
    ///
    /// # Errors
    /// - [`OdrError::RestartSizeMismatch`] if a restart buffer has the wrong
    ///   length (`work` is checked first).
    /// - [`OdrError::InconsistentJobArgument`] for any other combination.
    pub fn prepare(
        &self, job: &JobFlags, work: Option<Array1<f64>>, iwork: Option<Array1<i32>>,
    ) -> OdrResult<WorkspaceBuffers> {
        match (job.is_restart, work, iwork) {
            (false, None, None) => Ok(self.allocate()),
            (true, Some(work), Some(iwork)) => {
                validate_buffer_len("work", self.lwork, work.len())?;
                validate_buffer_len("iwork", self.liwork, iwork.len())?;
                Ok(WorkspaceBuffers { work, iwork })
            }
            (true, work, _) => Err(OdrError::InconsistentJobArgument {
                argument: if work.is_none() { "work" } else { "iwork" },
                reason: "a restart requires both 'work' and 'iwork' from a previous run",
            }),
            (false, work, _) => Err(OdrError::InconsistentJobArgument {
                argument: if work.is_some() { "work" } else { "iwork" },
                reason: "work buffers were supplied but job digit 5 (restart) is not set",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Reference sizes and field counts of both buffers.
    // - Contiguity of the offset maps and OLS zero-extent fields.
    // - Buffer preparation for fresh runs and restarts.
    // - Properties: determinism and the closed form of `liwork`.
    // -------------------------------------------------------------------------

    fn plan(n: usize, m: usize, npar: usize, nq: usize, is_odr: bool, we: WeightSpec) -> WorkspacePlan {
        WorkspacePlan::new(ProblemDimensions::new(n, m, npar, nq).unwrap(), is_odr, we)
    }

    #[test]
    // Purpose
    // -------
    // Pin the reference buffer sizes.
    //
    // Given
    // -----
    // - n = 10, m = 3, npar = 5, nq = 2, ODR, `we` of shape (2, 2, 10)
    //   (ld = 10, ld2 = 2).
    //
    // Expect
    // ------
    // - lwork = 770, liwork = 46.
    fn reference_problem_sizes() {
        // Act
        let p = plan(10, 3, 5, 2, true, WeightSpec { ld: 10, ld2: 2 });

        // Assert
        assert_eq!(p.lwork, 770);
        assert_eq!(p.liwork, 46);
        assert_eq!(p.work.lwkmn, 769);
    }

    #[test]
    fn offset_maps_have_expected_fields() {
        let p = plan(4, 1, 2, 1, true, WeightSpec::default());

        assert_eq!(WorkIndex::NAMES.len(), 52);
        assert_eq!(IWorkIndex::NAMES.len(), 23);
        assert_eq!(p.work.get("fn"), Some(p.work.fn_));
        assert_eq!(p.iwork.get("niter"), Some(p.iwork.niter));
        assert_eq!(p.work.get("missing"), None);
    }

    #[test]
    // Purpose
    // -------
    // Offsets must be non-decreasing and end exactly at the sentinel, and the
    // spacing of the first fields must match their extents.
    fn offsets_are_contiguous() {
        // Arrange
        let (n, m, np, nq) = (6, 2, 3, 2);
        let p = plan(n, m, np, nq, true, WeightSpec::default());

        // Act
        let entries = p.work.entries();

        // Assert
        assert!(entries.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(entries.last().map(|e| e.1), Some(p.lwork - 1));
        assert_eq!(p.work.eps - p.work.delta, n * m);
        assert_eq!(p.work.sd - p.work.fn_, n * nq);
        assert_eq!(p.work.rvar - p.work.vcv, np * np);
        assert_eq!(p.work.beta0 - p.work.rvar, 17);
        assert_eq!(p.iwork.bound - p.iwork.istop, 18);
    }

    #[test]
    // Purpose
    // -------
    // OLS removes exactly the ODR-only extents.
    //
    // Expect
    // ------
    // - lwork(ODR) − lwork(OLS) = 4·n·m + nq² + 2·n·m·nq.
    fn ols_drops_odr_only_fields() {
        // Arrange
        let (n, m, nq) = (7, 2, 3);

        // Act
        let odr = plan(n, m, 4, nq, true, WeightSpec::default());
        let ols = plan(n, m, 4, nq, false, WeightSpec::default());

        // Assert
        assert_eq!(odr.lwork - ols.lwork, 4 * n * m + nq * nq + 2 * n * m * nq);
        assert_eq!(ols.work.delts, ols.work.wrk1);
        assert_eq!(odr.liwork, ols.liwork);
    }

    #[test]
    fn we_descriptor_only_changes_we1_extent() {
        let shared = plan(10, 3, 5, 2, true, WeightSpec::default());
        let full = plan(10, 3, 5, 2, true, WeightSpec { ld: 10, ld2: 2 });

        assert_eq!(full.lwork - shared.lwork, 10 * 2 * 2 - 2);
        assert_eq!(full.work.we1, shared.work.we1);
    }

    #[test]
    // Purpose
    // -------
    // Exercise every branch of buffer preparation.
    fn prepare_accepts_only_consistent_combinations() {
        // Arrange
        let p = plan(5, 1, 2, 1, true, WeightSpec::default());
        let fresh = JobFlags::decode(0);
        let restart = JobFlags::decode(10000);

        // Act
        let allocated = p.prepare(&fresh, None, None).unwrap();
        let reused = p.prepare(&restart, Some(allocated.work.clone()), Some(allocated.iwork.clone()));
        let missing_iwork = p.prepare(&restart, Some(allocated.work.clone()), None);
        let missing_all = p.prepare(&restart, None, None);
        let unexpected = p.prepare(&fresh, None, Some(allocated.iwork.clone()));
        let short = p.prepare(&restart, Some(Array1::zeros(p.lwork - 1)), Some(allocated.iwork.clone()));
        let long_iwork = p.prepare(&restart, Some(allocated.work.clone()), Some(Array1::zeros(p.liwork + 1)));

        // Assert
        assert_eq!(allocated.work.len(), p.lwork);
        assert!(allocated.iwork.iter().all(|&v| v == 0));
        assert!(reused.is_ok());
        assert!(matches!(missing_iwork, Err(OdrError::InconsistentJobArgument { argument: "iwork", .. })));
        assert!(matches!(missing_all, Err(OdrError::InconsistentJobArgument { argument: "work", .. })));
        assert!(matches!(unexpected, Err(OdrError::InconsistentJobArgument { argument: "iwork", .. })));
        match short {
            Err(OdrError::RestartSizeMismatch { buffer: "work", expected, found }) => {
                assert_eq!(expected, p.lwork);
                assert_eq!(found, p.lwork - 1);
            }
            other => panic!("expected RestartSizeMismatch, got: {other:?}"),
        }
        assert!(matches!(long_iwork, Err(OdrError::RestartSizeMismatch { buffer: "iwork", .. })));
    }

    proptest! {
        #[test]
        fn liwork_has_closed_form(n in 1usize..40, m in 1usize..6, np in 1usize..8, nq in 1usize..5, odr in any::<bool>()) {
            let p = plan(n, m, np, nq, odr, WeightSpec::default());
            prop_assert_eq!(p.liwork, 20 + 2 * np + nq * (np + m));
        }

        #[test]
        fn planning_is_deterministic(
            n in 1usize..40, m in 1usize..6, np in 1usize..8, nq in 1usize..5, odr in any::<bool>(),
            per_obs in any::<bool>(), full in any::<bool>(),
        ) {
            let we = WeightSpec { ld: if per_obs { n } else { 1 }, ld2: if full { nq } else { 1 } };
            let first = plan(n, m, np, nq, odr, we);
            let second = plan(n, m, np, nq, odr, we);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first.work.entries(), second.work.entries());
        }

        #[test]
        fn lwork_matches_closed_form(n in 1usize..30, m in 1usize..5, np in 1usize..6, nq in 1usize..4, odr in any::<bool>()) {
            let p = plan(n, m, np, nq, odr, WeightSpec::default());
            let odr_terms = if odr { 6 * n * m + 2 * n * nq * m + nq * nq } else { 2 * n * m };
            let expected = 18 + 13 * np + np * np + m + m * m + 4 * n * nq + odr_terms
                + 2 * n * nq * np + 5 * nq + nq * (np + m) + nq;
            prop_assert_eq!(p.lwork, expected);
        }
    }
}
