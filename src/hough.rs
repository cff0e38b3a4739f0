//! Hough transform line finder working on the rec-hits of one projection.
//!
//! Every hit votes for all `(φ, ρ)` lines passing through it. The accumulator
//! maxima are extracted one after another, clearing a square neighbourhood of
//! each extracted peak, and each peak becomes one `TrackSegment2D` candidate
//! whose extent is given by the hits lying close to the peak line.

use std::f64::consts::PI;

use serde::Deserialize;

use geometry::{GeometryTPC, Projection};

use crate::histogram::{Axis, Histo2D};
use crate::hit::Hit2D;
use crate::segment2d::TrackSegment2D;
use crate::types::Vec2;

/// Which accumulator bin wins when several hold the same maximum
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum TiePolicy {
    /// First bin in (φ, ρ) scan order
    #[default]
    FirstEncountered,
    LastEncountered,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HoughParams {
    pub n_phi_bins: usize,
    pub n_rho_bins: usize,
    /// Shift of the voting origin (time, strip) below the lower corner of the
    /// projection plane, so that no line passes close to it
    pub offset: [f64; 2],
    /// Half size, in bins, of the neighbourhood cleared around an extracted peak
    pub suppression_radius: usize,
    /// Hits below this charge do not vote
    pub min_hit_charge: f64,
    /// Vote with the hit charge instead of 1
    pub charge_weighted: bool,
    /// Hits closer than this (mm) to a peak line belong to its segment
    pub line_band: f64,
    pub tie_policy: TiePolicy,
}

impl Default for HoughParams {
    fn default() -> Self {
        Self {
            n_phi_bins        : 100,
            n_rho_bins        : 100,
            offset            : [20.0, 40.0],
            suppression_radius: 5,
            min_hit_charge    : 1.0,
            charge_weighted   : false,
            line_band         : 3.0,
            tie_policy        : TiePolicy::FirstEncountered,
        }
    }
}

/// A local maximum of the accumulator
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HoughPeak {
    pub phi  : f64,
    pub rho  : f64,
    pub votes: f64,
}

/// Accumulator of one projection. Rebuilt for every event.
#[derive(Clone, Debug)]
pub struct HoughTransform {
    params     : HoughParams,
    dir        : Projection,
    origin     : Vec2,
    accumulator: Histo2D,
}

impl HoughTransform {

    pub fn new(geometry: &GeometryTPC, dir: Projection, params: HoughParams) -> Self {
        let (z, s) = (geometry.z_range(), geometry.strip_range(dir));
        let origin  = Vec2::new(z.min - params.offset[0], s.min - params.offset[1]);
        let rho_max = (Vec2::new(z.max, s.max) - origin).norm();
        let accumulator = Histo2D::new(
            Axis::new(params.n_phi_bins.max(1), -PI, PI),
            Axis::new(params.n_rho_bins.max(1), 0.0, rho_max),
        );
        Self { params, dir, origin, accumulator }
    }

    pub fn accumulator(&self) -> &Histo2D { &self.accumulator }
    pub fn dir(&self) -> Projection { self.dir }

    pub fn fill(&mut self, hits: &[Hit2D]) {
        let phi_axis = *self.accumulator.x_axis();
        let HoughParams { min_hit_charge, charge_weighted, .. } = self.params;
        for hit in hits.iter().filter(|h| h.charge() >= min_hit_charge) {
            let p = Vec2::new(hit.pos_time(), hit.pos_strip()) - self.origin;
            let weight = if charge_weighted { hit.charge() } else { 1.0 };
            for iphi in 0..phi_axis.n() {
                let phi = phi_axis.centre(iphi);
                let rho = p.x * phi.cos() + p.y * phi.sin();
                self.accumulator.fill(phi, rho, weight);
            }
        }
    }

    /// Up to `n` peaks in order of decreasing votes. Stops early when the
    /// accumulator has nothing left above zero.
    pub fn peaks(&self, n: usize) -> Vec<HoughPeak> {
        let mut work   = self.accumulator.clone();
        let (nx, ny)   = (work.x_axis().n(), work.y_axis().n());
        let radius     = self.params.suppression_radius as isize;
        let mut peaks  = vec![];
        for _ in 0..n {
            let (iphi, irho) = self.max_bin(&work);
            let votes = work.get(iphi, irho);
            if votes <= 0.0 { break }
            peaks.push(HoughPeak {
                phi: work.x_axis().centre(iphi),
                rho: work.y_axis().centre(irho),
                votes,
            });
            // φ is periodic, ρ is not
            for dphi in -radius..=radius {
                let jphi = (iphi as isize + dphi).rem_euclid(nx as isize) as usize;
                for drho in -radius..=radius {
                    let jrho = irho as isize + drho;
                    if jrho < 0 || jrho >= ny as isize { continue }
                    work.set(jphi, jrho as usize, 0.0);
                }
            }
        }
        peaks
    }

    fn max_bin(&self, histo: &Histo2D) -> (usize, usize) {
        match self.params.tie_policy {
            TiePolicy::FirstEncountered => histo.max_bin(),
            TiePolicy::LastEncountered  => {
                let mut best = ((0, 0), f64::NEG_INFINITY);
                for (index, &v) in histo.values().indexed_iter() {
                    if v >= best.1 { best = (index, v); }
                }
                best.0
            }
        }
    }

    /// Segment along the line of `peak`, spanning the hits within the line
    /// band. Oriented towards increasing time (increasing strip position for
    /// lines at constant time). Zero length when fewer than two hits are
    /// close to the line.
    pub fn segment(&self, peak: &HoughPeak, hits: &[Hit2D]) -> TrackSegment2D {
        let normal  = Vec2::new(peak.phi.cos(), peak.phi.sin());
        let mut tangent = Vec2::new(-normal.y, normal.x);
        if tangent.x < -1e-9 || (tangent.x.abs() <= 1e-9 && tangent.y < 0.0) { tangent = -tangent; }
        let point = self.origin + peak.rho * normal;

        let mut line = TrackSegment2D::new(self.dir);
        line.set_bias_tangent(point, tangent);

        let close = hits.iter()
            .filter(|h| h.charge() >= self.params.min_hit_charge)
            .filter(|h| line.point_lambda_and_distance(Vec2::new(h.pos_time(), h.pos_strip())).1.abs() < self.params.line_band)
            .copied()
            .collect::<Vec<_>>();

        let mut segment = TrackSegment2D::with_hits(self.dir, close);
        segment.set_n_accumulator_hits(peak.votes.round() as usize);
        let lambdas = segment.hits().iter()
            .map(|h| line.point_lambda_and_distance(Vec2::new(h.pos_time(), h.pos_strip())).0)
            .collect::<Vec<_>>();
        if lambdas.len() < 2 { return segment }
        let lo = lambdas.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = lambdas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let start = line.start();
        segment.set_start_end(start + lo * tangent, start + hi * tangent);
        segment
    }
}

/// Runs the transform over the hits of one projection and returns up to
/// `n_segments` candidates, strongest first. Degenerate input gives a single
/// null segment.
pub fn find_segments(
    geometry  : &GeometryTPC,
    dir       : Projection,
    params    : &HoughParams,
    hits      : &[Hit2D],
    n_segments: usize,
) -> Vec<TrackSegment2D> {
    let mut transform = HoughTransform::new(geometry, dir, params.clone());
    transform.fill(hits);
    let segments = transform.peaks(n_segments.max(1)).iter()
        .map(|peak| transform.segment(peak, hits))
        .collect::<Vec<_>>();
    if segments.is_empty() {
        log::debug!("no Hough peak in projection {dir}");
        return vec![TrackSegment2D::new(dir)]
    }
    segments
}
