//! Iteration and summary reports of the reference solver.
//!
//! `iprint` is read as four decimal digits, right to left:
//! - digit 4: initial report (0 none, 1 short, 2 long),
//! - digit 3: iteration report (0 none, 1 short, 2 long),
//! - digit 2: iteration report frequency (0 is read as 1),
//! - digit 1: final report (0 none, 1 short, 2 long).
//!
//! Reports go to the configured [`ReportDestination`]. A file is truncated
//! the first time one fit writes to it and appended to afterwards, so the
//! report and error files of a shared path hold one fit's output. A
//! destination that cannot be written is logged with `log::warn!` and
//! otherwise ignored; the fit itself never fails because of reporting.
use crate::regression::core::{job::digit, options::ReportDestination};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};
use ndarray::Array1;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
};

/// Detail level of one report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Detail {
    None,
    Short,
    Long,
}

impl Detail {
    fn from_digit(value: u32) -> Self {
        match value {
            0 => Detail::None,
            1 => Detail::Short,
            _ => Detail::Long,
        }
    }
}

/// Report sections decoded from `iprint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintControl {
    pub initial: Detail,
    pub iteration: Detail,
    pub frequency: usize,
    pub last: Detail,
}

impl PrintControl {
    pub fn decode(iprint: u32) -> Self {
        Self {
            initial: Detail::from_digit(digit(iprint, 4)),
            iteration: Detail::from_digit(digit(iprint, 3)),
            frequency: digit(iprint, 2).max(1) as usize,
            last: Detail::from_digit(digit(iprint, 1)),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.initial == Detail::None && self.iteration == Detail::None && self.last == Detail::None
    }
}

#[derive(Debug, Clone)]
pub struct StartReport {
    pub n: usize,
    pub m: usize,
    pub npar: usize,
    pub nq: usize,
    pub job: u32,
    pub is_odr: bool,
    pub restart: bool,
    pub beta: Array1<f64>,
    pub sum_square: f64,
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub nfev: usize,
    pub sum_square: f64,
    pub actual_reduction: f64,
    pub predicted_reduction: f64,
    pub ratio: f64,
    pub lambda: f64,
    pub step_norm: f64,
    pub beta: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct FinishReport {
    pub info: i32,
    pub niter: usize,
    pub nfev: usize,
    pub njev: usize,
    pub sum_square: f64,
    pub sum_square_delta: f64,
    pub sum_square_eps: f64,
    pub res_var: f64,
    pub inv_condnum: f64,
    pub beta: Array1<f64>,
    pub sd_beta: Array1<f64>,
}

/// Receives progress of one solve.
pub trait Reporter {
    fn on_start(&mut self, _report: &StartReport) {}
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self, _report: &FinishReport) {}
    fn on_error(&mut self, _message: &str) {}
}

/// Reporter writing tables to a [`ReportDestination`] under `iprint` control.
///
/// One reporter serves one fit. Error messages go to the error destination
/// whenever `iprint != 0`.
#[derive(Debug)]
pub struct DestinationReporter {
    control: PrintControl,
    errors: bool,
    destination: ReportDestination,
    error: ReportDestination,
    files: Files,
    rows: Vec<IterationReport>,
}

impl DestinationReporter {
    pub fn new(iprint: u32, destination: ReportDestination, error: ReportDestination) -> Self {
        Self {
            control: PrintControl::decode(iprint),
            errors: iprint != 0,
            destination,
            error,
            files: Files::default(),
            rows: Vec::new(),
        }
    }

    pub fn control(&self) -> PrintControl {
        self.control
    }

    fn flush_iterations(&mut self) -> Vec<String> {
        if self.rows.is_empty() {
            return Vec::new();
        }
        let long = self.control.iteration == Detail::Long;
        let mut table = Table::new();
        table.load_preset(presets::ASCII_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        let mut header = vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("nfev").set_alignment(CellAlignment::Right),
            Cell::new("wss").set_alignment(CellAlignment::Right),
            Cell::new("act. red.").set_alignment(CellAlignment::Right),
            Cell::new("pred. red.").set_alignment(CellAlignment::Right),
            Cell::new("ratio").set_alignment(CellAlignment::Right),
            Cell::new("lambda").set_alignment(CellAlignment::Right),
        ];
        if long {
            header.push(Cell::new("step").set_alignment(CellAlignment::Right));
            header.push(Cell::new("beta"));
        }
        table.set_header(header);
        for row in &self.rows {
            let mut cells = vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(row.nfev).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.6e}", row.sum_square)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.actual_reduction)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.predicted_reduction)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", row.ratio)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.lambda)).set_alignment(CellAlignment::Right),
            ];
            if long {
                cells.push(Cell::new(format!("{:.2e}", row.step_norm)).set_alignment(CellAlignment::Right));
                cells.push(Cell::new(format_vector(&row.beta)));
            }
            table.add_row(cells);
        }
        self.rows.clear();
        table.to_string().lines().map(str::to_string).collect()
    }
}

impl Reporter for DestinationReporter {
    fn on_start(&mut self, report: &StartReport) {
        if self.control.initial == Detail::None {
            return;
        }
        let mode = if report.is_odr { "orthogonal distance regression" } else { "ordinary least squares" };
        let mut lines = vec![
            String::new(),
            format!("ODR initial summary ({mode}{})", if report.restart { ", restart" } else { "" }),
            format!("  n = {}, m = {}, npar = {}, nq = {}, job = {:05}", report.n, report.m, report.npar, report.nq, report.job),
            format!("  initial weighted sum of squares = {:.8e}", report.sum_square),
        ];
        if self.control.initial == Detail::Long {
            lines.push(format!("  initial beta = {}", format_vector(&report.beta)));
        }
        self.files.write(&self.destination, &lines);
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        if self.control.iteration == Detail::None {
            return;
        }
        if report.iteration % self.control.frequency == 0 || report.iteration == 1 {
            self.rows.push(report.clone());
        }
    }

    fn on_finish(&mut self, report: &FinishReport) {
        let mut lines = self.flush_iterations();
        if self.control.last != Detail::None {
            lines.push(String::new());
            lines.push(format!("ODR final summary: info = {}", report.info));
            lines.push(format!(
                "  iterations = {}, function evaluations = {}, jacobian evaluations = {}",
                report.niter, report.nfev, report.njev
            ));
            lines.push(format!(
                "  wss = {:.8e} (delta {:.8e}, eps {:.8e}), residual variance = {:.8e}",
                report.sum_square, report.sum_square_delta, report.sum_square_eps, report.res_var
            ));
            lines.push(format!("  inverse condition number = {:.4e}", report.inv_condnum));
            if self.control.last == Detail::Long {
                let mut table = Table::new();
                table.load_preset(presets::ASCII_FULL);
                table.set_header(vec!["index", "beta", "std. error"]);
                for (k, (b, sd)) in report.beta.iter().zip(report.sd_beta.iter()).enumerate() {
                    table.add_row(vec![
                        Cell::new(k).set_alignment(CellAlignment::Right),
                        Cell::new(format!("{b:.8e}")).set_alignment(CellAlignment::Right),
                        Cell::new(format!("{sd:.4e}")).set_alignment(CellAlignment::Right),
                    ]);
                }
                lines.extend(table.to_string().lines().map(str::to_string));
            } else {
                lines.push(format!("  beta = {}", format_vector(&report.beta)));
            }
        }
        self.files.write(&self.destination, &lines);
    }

    fn on_error(&mut self, message: &str) {
        if self.errors {
            self.files.write(&self.error, &[message.to_string()]);
        }
    }
}

fn format_vector(values: &Array1<f64>) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{v:.6e}")).collect();
    format!("[{}]", parts.join(", "))
}

/// Files written so far by one fit.
#[derive(Debug, Default)]
struct Files {
    opened: Vec<PathBuf>,
}

impl Files {
    /// Write `lines` to `destination`; failures are logged, not returned.
    fn write(&mut self, destination: &ReportDestination, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let result = match destination {
            ReportDestination::Stdout => write_all(&mut io::stdout().lock(), lines),
            ReportDestination::Stderr => write_all(&mut io::stderr().lock(), lines),
            ReportDestination::File(path) => {
                let mut options = OpenOptions::new();
                if self.opened.contains(path) {
                    options.append(true);
                } else {
                    self.opened.push(path.clone());
                    options.write(true).create(true).truncate(true);
                }
                options.open(path).and_then(|mut file| write_all(&mut file, lines))
            }
        };
        if let Err(err) = result {
            log::warn!("could not write ODR report to {destination:?}: {err}");
        }
    }
}

fn write_all(out: &mut impl Write, lines: &[String]) -> io::Result<()> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}
