//! Particle identification from the charge profile of a track.
//!
//! The profile is compared with two models built from reference Bragg
//! curves: a single alpha stopping at one end, and an alpha plus a 12C
//! emitted back to back from a common vertex. Each model is fitted to the
//! profile as given and to its mirror image; the fit with the lowest sum of
//! squared residuals decides the event type.

use std::fmt;
use std::path::PathBuf;

use itertools::Itertools;
use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use statrs::function::erf::erf;

use crate::curve::{BraggKleeman, Curve};
use crate::error::{ConfigError, Result};
use crate::histogram::Histo1D;
use crate::minimize::{FitResult, Minimizer, Parameter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EventType {
    #[default]
    Unknown,
    Alpha,
    C12Alpha,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Unknown  => "unknown",
            EventType::Alpha    => "alpha",
            EventType::C12Alpha => "12C+alpha",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedxParams {
    /// Pressure (mbar) at which the reference curves were computed
    pub nominal_pressure: f64,
    /// Pressure (mbar) of the data being fitted
    pub pressure        : f64,
    /// Fits per hypothesis while the result is invalid or poor
    pub max_attempts    : usize,
    /// A fit is poor when χ² / (profile integral)² exceeds this
    pub max_chi2_ratio  : f64,
    /// mm
    pub min_carbon_range: f64,
    /// Two-column (mm, eV/mm) tables replacing the built-in reference curves
    pub alpha_curve     : Option<PathBuf>,
    pub carbon_curve    : Option<PathBuf>,
}

impl Default for DedxParams {
    fn default() -> Self {
        Self {
            nominal_pressure: 250.0,
            pressure        : 250.0,
            max_attempts    : 10,
            max_chi2_ratio  : 5e-4,
            min_carbon_range: 5.0,
            alpha_curve     : None,
            carbon_curve    : None,
        }
    }
}

/// Full ranges (mm) of the reference alpha and carbon at the nominal pressure
fn reference_ranges(nominal_pressure: f64) -> Result<(f64, f64)> {
    if (nominal_pressure - 250.0).abs() < 1e-3 { return Ok((297.23, 23.43)) } // 10 MeV alpha, 5 MeV 12C
    if (nominal_pressure - 190.0).abs() < 1e-3 { return Ok((385.99, 28.64)) } // 10 MeV alpha, 2.5 MeV 12C
    Err(ConfigError::NominalPressure(nominal_pressure))
}

/// Reference dE/dx curves in eV/mm against distance travelled in mm
fn builtin_curves(nominal_pressure: f64) -> Result<(Curve, Curve)> {
    let (alpha_range, carbon_range) = reference_ranges(nominal_pressure)?;
    let carbon_energy = if nominal_pressure > 200.0 { 5.0 } else { 2.5 };
    let alpha  = BraggKleeman::new(10.0e6       , alpha_range , 1.75, 1.0);
    let carbon = BraggKleeman::new(carbon_energy * 1e6, carbon_range, 1.30, 0.5);
    Ok((alpha.dedx_curve(600)?, carbon.dedx_curve(300)?))
}

const N_SIGMA_ALPHA : f64 = 3.0;
const N_SIGMA_CARBON: f64 = 20.0;
/// Boundary (mm) between the two quadratic pieces of the carbon edge
const CARBON_EDGE_SPLIT: f64 = 15.0;
/// Low edge (mm) of the fitted interval
const FIT_RANGE_MIN: f64 = -20.0;
const MIN_VERTEX_OFFSET: f64 = -5.0;

// Model parameter indices
const SIGMA : usize = 0;
const VERTEX: usize = 1;
const ALPHA_OFFSET : usize = 2;
const CARBON_OFFSET: usize = 3;
const ALPHA_SCALE  : usize = 4;
const CARBON_SCALE : usize = 5;
const COMMON_SCALE : usize = 6;

/// One of the four hypothesis/orientation combinations
#[derive(Clone, Debug, PartialEq)]
pub struct HypothesisFit {
    pub event_type: EventType,
    pub reflected : bool,
    pub result    : FitResult,
}

/// Bragg-curve fitter. Holds its own reference curves and the outcome of the
/// last call to `fit_histo`; use one instance per worker.
#[derive(Clone, Debug)]
pub struct DedxFitter {
    params           : DedxParams,
    alpha_curve      : Curve,
    carbon_curve     : Curve,
    /// Quadratic pieces of the carbon curve below and above the split
    carbon_edge      : [[f64; 3]; 2],
    max_alpha_offset : f64,
    max_carbon_offset: f64,
    minimizer        : Minimizer,
    hypotheses       : Vec<HypothesisFit>,
    best             : Option<usize>,
    fitted_histo     : Option<Histo1D>,
}

impl DedxFitter {

    pub fn new(params: DedxParams) -> Result<Self> {
        let (mut alpha, mut carbon) = builtin_curves(params.nominal_pressure)?;
        if let Some(path) = &params.alpha_curve  { alpha  = Curve::from_two_columns(path)?; }
        if let Some(path) = &params.carbon_curve { carbon = Curve::from_two_columns(path)?; }
        Self::with_curves(params, alpha, carbon)
    }

    pub fn with_curves(params: DedxParams, alpha_curve: Curve, carbon_curve: Curve) -> Result<Self> {
        let (alpha_range, carbon_range) = reference_ranges(params.nominal_pressure)?;
        let p = params.pressure;
        if !(p > 0.0 && p.is_finite()) { return Err(ConfigError::OutOfRange { what: "gas pressure [mbar]", value: p }) }
        let scale = params.nominal_pressure / p;
        let carbon_edge = [
            fit_quadratic(&carbon_curve, 0.0, CARBON_EDGE_SPLIT),
            fit_quadratic(&carbon_curve, CARBON_EDGE_SPLIT, carbon_curve.x_max()),
        ];
        Ok(Self {
            params,
            alpha_curve,
            carbon_curve,
            carbon_edge,
            max_alpha_offset : alpha_range  * scale,
            max_carbon_offset: carbon_range * scale,
            minimizer        : Minimizer::new(6_000, 1e-7),
            hypotheses       : vec![],
            best             : None,
            fitted_histo     : None,
        })
    }

    pub fn params(&self) -> &DedxParams { &self.params }

    /// Forget the last fit
    pub fn reset(&mut self) {
        self.hypotheses.clear();
        self.best = None;
        self.fitted_histo = None;
    }

    fn pressure_scale(&self) -> f64 { self.params.pressure / self.params.nominal_pressure }

    // ----- model ----------------------------------------------------------------

    fn bragg_alpha(&self, x: f64, par: &[f64]) -> f64 {
        let (sigma, vertex, shift) = (par[SIGMA], par[VERTEX], par[ALPHA_OFFSET]);
        let s      = self.pressure_scale();
        let from_v = x - vertex;
        let total  = self.alpha_curve.x_max();
        let a      = s * shift;
        let t      = s * from_v + a;
        if from_v < N_SIGMA_ALPHA * sigma {
            let p0 = self.alpha_curve.eval(a + N_SIGMA_ALPHA * sigma * s);
            smeared_edge(t, a, total, sigma, [p0, 0.0, 0.0])
        } else if t > 0.0 && t < total {
            self.alpha_curve.eval(t)
        } else { 0.0 }
    }

    fn bragg_carbon(&self, x: f64, par: &[f64]) -> f64 {
        let (sigma, vertex, shift) = (par[SIGMA], par[VERTEX], par[CARBON_OFFSET]);
        let s      = self.pressure_scale();
        let from_v = vertex - x;
        let total  = self.carbon_curve.x_max();
        let a      = s * shift;
        let t      = s * from_v + a;
        if from_v < N_SIGMA_CARBON * sigma {
            let poly = if t < CARBON_EDGE_SPLIT { self.carbon_edge[0] } else { self.carbon_edge[1] };
            smeared_edge(t, a, total, sigma, poly)
        } else if t > 0.0 && t < total {
            self.carbon_curve.eval(t)
        } else { 0.0 }
    }

    /// Model value at `x` (mm along the profile) for parameters `par`
    pub fn model_at(&self, x: f64, par: &[f64]) -> f64 {
        let mut value = 0.0;
        if par[ALPHA_SCALE ] != 0.0 { value += par[ALPHA_SCALE ] * self.bragg_alpha (x, par); }
        if par[CARBON_SCALE] != 0.0 { value += par[CARBON_SCALE] * self.bragg_carbon(x, par); }
        par[COMMON_SCALE] * value
    }

    /// Best fitted model evaluated at `x`; zero before any successful fit
    pub fn model(&self, x: f64) -> f64 {
        match self.best_fit() {
            Some(fit) if !fit.result.is_empty() => self.model_at(x, &fit.result.params),
            _ => 0.0,
        }
    }

    // ----- fitting --------------------------------------------------------------

    fn initial_parameters(&self, event_type: EventType, track_length: f64, attempt: usize) -> Vec<Parameter> {
        let max_vertex = self.max_carbon_offset;
        let min_alpha  = (self.max_alpha_offset  - track_length).max(0.0);
        let min_carbon = (self.max_carbon_offset - track_length).max(0.0);
        // Deterministic sequence of starting points inside the limits
        let f = [0.5, 0.25, 0.75, 0.1, 0.9, 0.4, 0.6, 0.05, 0.95, 0.3][attempt % 10];
        let within = |lo: f64, hi: f64| lo + f * (hi - lo);
        match event_type {
            EventType::C12Alpha => {
                let alpha_hi  = self.max_alpha_offset  - self.params.min_carbon_range;
                let carbon_hi = self.max_carbon_offset - self.params.min_carbon_range;
                vec![
                    Parameter::new("sigma"       , 1.0, 0.1).limits(1.0, 4.0),
                    Parameter::new("vertexOffset", within(0.0, max_vertex), 1.0).limits(0.0, max_vertex),
                    Parameter::new("alphaOffset" , within(min_alpha, alpha_hi), 2.0).limits(min_alpha, alpha_hi),
                    Parameter::new("carbonOffset", within(min_carbon, carbon_hi), 0.5).limits(min_carbon, carbon_hi),
                    Parameter::new("alphaScale"  , 1.0, 0.0).fixed(),
                    Parameter::new("carbonScale" , 1.0, 0.0).fixed(),
                    Parameter::new("commonScale" , 5e-3, 5e-4).limits(1e-4, 2e-2),
                ]
            }
            _ => vec![
                Parameter::new("sigma"       , 1.0, 0.1).limits(1.0, 4.0),
                Parameter::new("vertexOffset", within(MIN_VERTEX_OFFSET, max_vertex), 1.0).limits(MIN_VERTEX_OFFSET, max_vertex),
                Parameter::new("alphaOffset" , within(min_alpha, self.max_alpha_offset), 2.0).limits(min_alpha, self.max_alpha_offset),
                Parameter::new("carbonOffset", 0.0, 0.0).fixed(),
                Parameter::new("alphaScale"  , 1.0, 0.0).fixed(),
                Parameter::new("carbonScale" , 0.0, 0.0).fixed(),
                Parameter::new("commonScale" , 5e-3, 5e-4).limits(1e-4, 2e-2),
            ],
        }
    }

    fn fit_range_max(&self, event_type: EventType) -> f64 {
        match event_type {
            EventType::C12Alpha => self.max_alpha_offset + self.max_carbon_offset,
            _                   => self.max_alpha_offset,
        }
    }

    /// Least-squares fit of one model to `histo`, retried from different
    /// starting points while the fit is invalid or poor, or while the carbon
    /// range sits on one of its limits. The best attempt is returned.
    pub fn fit_hypothesis(&self, event_type: EventType, histo: &Histo1D) -> FitResult {
        if histo.is_empty() || event_type == EventType::Unknown { return FitResult::empty() }
        let track_length = histo.axis().max() / 1.2;
        let charge       = histo.integral_width();
        let x_max        = self.fit_range_max(event_type);
        let bins = histo.points()
            .filter(|&(x, _)| x >= FIT_RANGE_MIN && x <= x_max)
            .collect_vec();
        let loss = |par: &[f64]| -> f64 {
            bins.iter().map(|&(x, v)| (v - self.model_at(x, par)).powi(2)).sum()
        };

        let mut best = (FitResult::empty(), false);
        for attempt in 0..self.params.max_attempts.max(1) {
            let start  = self.initial_parameters(event_type, track_length, attempt);
            let result = self.minimizer.minimize(&loss, &start);
            let pinned = event_type == EventType::C12Alpha
                && result.params.get(CARBON_OFFSET).map_or(false, |&v| at_limit(&start[CARBON_OFFSET], v));
            if best.0.is_empty() || result.fval < best.0.fval { best = (result, pinned); }
            let ratio = best.0.fval / charge.powi(2);
            if best.0.valid && ratio <= self.params.max_chi2_ratio && !best.1 { break }
            log::debug!("{event_type} fit attempt {attempt}: χ²/Q² = {ratio:.3e}, carbon range at limit {}, retrying", best.1);
        }
        best.0
    }

    /// Fit all four hypothesis/orientation combinations and select the one
    /// with the lowest χ². An empty profile leaves the event type unknown.
    pub fn fit_histo(&mut self, histo: &Histo1D) -> &FitResult {
        self.reset();
        if histo.is_empty() {
            log::debug!("empty charge profile, event type unknown");
            self.hypotheses.push(HypothesisFit { event_type: EventType::Unknown, reflected: false, result: FitResult::empty() });
            self.best = Some(0);
            return &self.hypotheses[0].result
        }
        let reflected = histo.reflected();
        for event_type in [EventType::Alpha, EventType::C12Alpha] {
            for (is_reflected, h) in [(false, histo), (true, &reflected)] {
                let result = self.fit_hypothesis(event_type, h);
                self.hypotheses.push(HypothesisFit { event_type, reflected: is_reflected, result });
            }
        }
        let mut best = 0;
        for (i, fit) in self.hypotheses.iter().enumerate() {
            if fit.result.fval < self.hypotheses[best].result.fval { best = i; }
        }
        self.best = Some(best);
        let winner = &self.hypotheses[best];
        if !winner.result.valid {
            log::warn!("best dE/dx hypothesis ({}) did not converge", winner.event_type);
        }
        self.fitted_histo = Some(if winner.reflected { reflected } else { histo.clone() });
        &self.hypotheses[best].result
    }

    // ----- results --------------------------------------------------------------

    pub fn best_fit(&self) -> Option<&HypothesisFit> { self.best.map(|i| &self.hypotheses[i]) }

    pub fn hypotheses(&self) -> &[HypothesisFit] { &self.hypotheses }

    /// χ² of one hypothesis/orientation from the last fit
    pub fn hypothesis_chi2(&self, event_type: EventType, reflected: bool) -> Option<f64> {
        self.hypotheses.iter()
            .find(|h| h.event_type == event_type && h.reflected == reflected)
            .map(|h| h.result.fval)
    }

    pub fn event_type(&self) -> EventType { self.best_fit().map_or(EventType::Unknown, |f| f.event_type) }
    pub fn is_reflected(&self) -> bool { self.best_fit().map_or(false, |f| f.reflected) }
    pub fn chi2(&self) -> f64 { self.best_fit().map_or(f64::INFINITY, |f| f.result.fval) }
    pub fn fit_result(&self) -> Option<&FitResult> { self.best_fit().map(|f| &f.result) }
    /// Profile as fitted by the best hypothesis (reflected if it was)
    pub fn fitted_histo(&self) -> Option<&Histo1D> { self.fitted_histo.as_ref() }

    fn parameter(&self, index: usize) -> f64 {
        match self.best_fit() {
            Some(fit) if fit.event_type != EventType::Unknown => fit.result.params.get(index).copied().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn vertex_offset(&self) -> f64 { self.parameter(VERTEX) }
    pub fn diffusion    (&self) -> f64 { self.parameter(SIGMA) }

    /// mm
    pub fn alpha_range(&self) -> f64 {
        if self.event_type() == EventType::Unknown { return 0.0 }
        self.max_alpha_offset - self.parameter(ALPHA_OFFSET)
    }

    /// mm; zero unless the carbon hypothesis won
    pub fn carbon_range(&self) -> f64 {
        if self.event_type() != EventType::C12Alpha { return 0.0 }
        self.max_carbon_offset - self.parameter(CARBON_OFFSET)
    }

    /// MeV, integral of the reference curve over the fitted part of the track
    pub fn alpha_energy(&self) -> f64 {
        if self.event_type() == EventType::Unknown { return 0.0 }
        let start = self.pressure_scale() * self.parameter(ALPHA_OFFSET);
        self.alpha_curve.integrate(start, self.alpha_curve.x_max()) * 1e-6
    }

    /// MeV
    pub fn carbon_energy(&self) -> f64 {
        if self.event_type() != EventType::C12Alpha { return 0.0 }
        let start = self.pressure_scale() * self.parameter(CARBON_OFFSET);
        self.carbon_curve.integrate(start, self.carbon_curve.x_max()) * 1e-6
    }

    pub fn max_alpha_offset (&self) -> f64 { self.max_alpha_offset }
    pub fn max_carbon_offset(&self) -> f64 { self.max_carbon_offset }
}

/// Whether the fitted value of the free parameter `p` lies on one of its limits
fn at_limit(p: &Parameter, value: f64) -> bool {
    match p.limits {
        Some((lo, hi)) if !p.fixed => {
            let tolerance = 1e-6 * (1.0 + lo.abs().max(hi.abs()));
            value - lo <= tolerance || hi - value <= tolerance
        }
        _ => false,
    }
}

/// Quadratic `p0 + p1 t + p2 t²`, confined to `[a, b]`, convolved with a
/// Gaussian of width `sigma`, evaluated at `t`
fn smeared_edge(t: f64, a: f64, b: f64, sigma: f64, [p0, p1, p2]: [f64; 3]) -> f64 {
    let gauss = |edge: f64| (-(edge - t).powi(2) / (2.0 * sigma * sigma)).exp() * sigma / (2.0 * std::f64::consts::PI).sqrt();
    let cdf   = |edge: f64| 0.5 * erf((t - edge) / (std::f64::consts::SQRT_2 * sigma));
    let poly  = p2 * (t * t + sigma * sigma) + p1 * t + p0;
    cdf(a) * poly + gauss(a) * (p2 * (a + t) + p1)
        - cdf(b) * poly - gauss(b) * (p2 * (b + t) + p1)
}

/// Least-squares quadratic through the curve sampled over `[lo, hi]`.
/// Falls back to the mean value when the interval is too short.
fn fit_quadratic(curve: &Curve, lo: f64, hi: f64) -> [f64; 3] {
    let hi = hi.min(curve.x_max());
    let n  = 64;
    if hi - lo < 1e-3 { return [curve.eval(lo), 0.0, 0.0] }
    let samples = (0..n).map(|i| {
        let t = lo + (hi - lo) * (i as f64 + 0.5) / n as f64;
        (t, curve.eval(t))
    }).collect_vec();
    let mut ata = Matrix3::zeros();
    let mut atb = Vector3::zeros();
    for &(t, y) in &samples {
        let row = Vector3::new(1.0, t, t * t);
        ata += row * row.transpose();
        atb += row * y;
    }
    match ata.lu().solve(&atb) {
        Some(p) => [p[0], p[1], p[2]],
        None    => [samples.iter().map(|s| s.1).sum::<f64>() / n as f64, 0.0, 0.0],
    }
}
