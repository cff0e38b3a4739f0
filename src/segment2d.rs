//! Straight line segment in the (time, strip) plane of one projection.
//!
//! Positions are `Vector2<f64>` with `x` = drift position (mm) and `y` =
//! position along the strip pitch direction (mm).

use geometry::{GeometryTPC, Projection};

use crate::hit::{Hit2D, Hit2DCollection};
use crate::types::{Vec2, DUMMY_LOSS};

/// Half length used when a segment is built from a point and a direction
const BIAS_TANGENT_HALF_LENGTH: f64 = 100.0;

/// Which part of the parametrisation a loss is meant to constrain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossKind {
    /// Direction only: spread of hits around any parallel line
    Tangent,
    Bias,
    BiasTangent,
}

/// Distance bands (mm) used by the losses
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossBands {
    pub parallel_line: f64,
    pub hit_distance : f64,
    pub integrated_charge: f64,
    pub charge_profile: f64,
    /// Weight of the squared overhang of the segment ends beyond the hits
    pub endpoint_weight: f64,
}

impl Default for LossBands {
    fn default() -> Self {
        Self { parallel_line: 20.0, hit_distance: 10.0, integrated_charge: 4.0, charge_profile: 2.0, endpoint_weight: 0.1 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackSegment2D {
    dir    : Projection,
    bias   : Vec2,
    tangent: Vec2,
    start  : Vec2,
    end    : Vec2,
    length : f64,
    n_accumulator_hits: usize,
    hits   : Hit2DCollection,
    bands  : LossBands,
}

impl TrackSegment2D {

    /// Null segment: zero length, zero tangent, no hits
    pub fn new(dir: Projection) -> Self {
        Self {
            dir,
            bias   : Vec2::zeros(),
            tangent: Vec2::zeros(),
            start  : Vec2::zeros(),
            end    : Vec2::zeros(),
            length : 0.0,
            n_accumulator_hits: 0,
            hits   : vec![],
            bands  : LossBands::default(),
        }
    }

    pub fn with_hits(dir: Projection, hits: Hit2DCollection) -> Self {
        Self { hits, ..Self::new(dir) }
    }

    pub fn with_bands(mut self, bands: LossBands) -> Self { self.bands = bands; self }

    pub fn set_bias_tangent(&mut self, bias: Vec2, tangent: Vec2) {
        let tangent = unit_or_zero(tangent);
        self.bias    = bias;
        self.tangent = tangent;
        self.start   = bias - BIAS_TANGENT_HALF_LENGTH * tangent;
        self.end     = bias + BIAS_TANGENT_HALF_LENGTH * tangent;
        self.length  = (self.end - self.start).norm();
    }

    pub fn set_start_end(&mut self, start: Vec2, end: Vec2) {
        self.start   = start;
        self.end     = end;
        self.bias    = start;
        self.tangent = unit_or_zero(end - start);
        self.length  = (end - start).norm();
    }

    pub fn set_hits(&mut self, hits: Hit2DCollection) { self.hits = hits; }
    pub fn set_n_accumulator_hits(&mut self, n: usize) { self.n_accumulator_hits = n; }

    pub fn strip_dir(&self) -> Projection { self.dir }
    pub fn bias     (&self) -> Vec2 { self.bias }
    pub fn tangent  (&self) -> Vec2 { self.tangent }
    pub fn start    (&self) -> Vec2 { self.start }
    pub fn end      (&self) -> Vec2 { self.end }
    pub fn length   (&self) -> f64  { self.length }
    pub fn hits     (&self) -> &[Hit2D] { &self.hits }
    pub fn bands    (&self) -> &LossBands { &self.bands }
    pub fn n_accumulator_hits(&self) -> usize { self.n_accumulator_hits }

    /// Tangent scaled so that its time component is 1. Zero when the segment
    /// is (nearly) perpendicular to the time axis.
    pub fn tangent_with_t1(&self) -> Vec2 {
        let t = if self.tangent.x < 0.0 { -self.tangent } else { self.tangent };
        if t.x.abs() < 1e-5 { Vec2::zeros() } else { t / t.x }
    }

    /// Point of the line closest to the origin
    pub fn min_bias(&self) -> Vec2 {
        self.bias - self.bias.dot(&self.tangent) * self.tangent
    }

    /// Point of the line at drift position `time`
    pub fn bias_at_t(&self, time: f64) -> Vec2 {
        if self.tangent.x.abs() < 1e-3 { return self.min_bias() }
        self.bias + ((time - self.bias.x) / self.tangent.x) * self.tangent
    }

    /// Position along the line measured from `start`, and signed
    /// perpendicular distance from the line (positive on the right of the
    /// tangent).
    pub fn point_lambda_and_distance(&self, point: Vec2) -> (f64, f64) {
        let delta  = point - self.start;
        let lambda = delta.dot(&self.tangent);
        let transverse = delta - lambda * self.tangent;
        let distance   = transverse.norm();
        let sign = if transverse.perp(&self.tangent) > 0.0 { 1.0 } else { -1.0 };
        (lambda, sign * distance)
    }

    /// Distance from the finite segment, and position along it clamped to
    /// `[0, length]`
    pub fn point_segment_distance(&self, point: Vec2) -> (f64, f64) {
        let lambda = (point - self.start).dot(&self.tangent).clamp(0.0, self.length);
        let closest = self.start + lambda * self.tangent;
        (lambda, (point - closest).norm())
    }

    fn hit_point(hit: &Hit2D) -> Vec2 { Vec2::new(hit.pos_time(), hit.pos_strip()) }

    /// Charge of this segment's hits within the radius cut and with lambda in
    /// `(0, lambda_cut)`
    pub fn integrated_charge(&self, lambda_cut: f64) -> f64 { self.integrated_charge_for(lambda_cut, &self.hits) }

    pub fn integrated_charge_for(&self, lambda_cut: f64, hits: &[Hit2D]) -> f64 {
        let radius = self.bands.integrated_charge;
        hits.iter()
            .filter(|hit| {
                let (lambda, distance) = self.point_lambda_and_distance(Self::hit_point(hit));
                lambda > 0.0 && lambda < lambda_cut && distance.abs() > 0.0 && distance.abs() < radius
            })
            .map(Hit2D::charge)
            .sum()
    }

    /// Charge weighted spread of signed hit distances around the line.
    /// Invariant under translations of the line perpendicular to itself.
    pub fn parallel_line_loss(&self) -> f64 { self.parallel_line_loss_for(&self.hits) }

    pub fn parallel_line_loss_for(&self, hits: &[Hit2D]) -> f64 {
        if hits.is_empty() { return 0.0 }
        let (mut sum, mut mean, mut mean2) = (0.0, 0.0, 0.0);
        for hit in hits {
            let (_, distance) = self.point_lambda_and_distance(Self::hit_point(hit));
            if distance.abs() > self.bands.parallel_line { continue }
            let q = hit.charge().abs();
            sum   += q;
            mean  += q * distance;
            mean2 += q * distance * distance;
        }
        if sum < 1.0 { return DUMMY_LOSS }
        let (mean, mean2) = (mean / sum, mean2 / sum);
        (mean2 - mean * mean).max(0.0).sqrt()
    }

    /// Charge weighted mean squared distance of the hits in the band around
    /// the line
    pub fn hit_distance_loss(&self) -> f64 { self.hit_distance_loss_for(&self.hits) }

    pub fn hit_distance_loss_for(&self, hits: &[Hit2D]) -> f64 {
        if hits.is_empty() { return 0.0 }
        if self.tangent.norm() < 1e-3 { return DUMMY_LOSS }
        let (sum, weighted) = hits.iter()
            .map(|hit| (hit.charge(), self.point_lambda_and_distance(Self::hit_point(hit)).1))
            .filter(|&(_, distance)| distance.abs() < self.bands.hit_distance)
            .fold((0.0, 0.0), |(s, w), (q, d)| (s + q, w + q * d * d));
        if sum < 1.0 { return DUMMY_LOSS }
        weighted / sum
    }

    pub fn loss(&self, kind: LossKind) -> f64 { self.loss_for(kind, &self.hits) }

    pub fn loss_for(&self, kind: LossKind, hits: &[Hit2D]) -> f64 {
        match kind {
            LossKind::Tangent => self.parallel_line_loss_for(hits),
            LossKind::Bias | LossKind::BiasTangent => self.hit_distance_loss_for(hits),
        }
    }

    /// Goodness of fit of the finite segment to the hits.
    ///
    /// Charge weighted mean of the squared distance to the segment (capped at
    /// the hit-distance band), plus a penalty on the squared gap between each
    /// end and the outermost hit in the band. Ends short of the hits pay the
    /// same as ends beyond them. Null segments are treated as points.
    pub fn rec_hit_chi2(&self) -> f64 { self.rec_hit_chi2_for(&self.hits) }

    pub fn rec_hit_chi2_for(&self, hits: &[Hit2D]) -> f64 {
        if hits.is_empty() { return 0.0 }
        let band  = self.bands.hit_distance;
        let mut sum      = 0.0;
        let mut weighted = 0.0;
        let mut extent: Option<(f64, f64)> = None;
        for hit in hits {
            let q = hit.charge();
            let point = Self::hit_point(hit);
            let (_, distance) = self.point_segment_distance(point);
            let lambda = (point - self.start).dot(&self.tangent);
            sum      += q;
            weighted += q * distance.min(band).powi(2);
            if distance < band {
                extent = Some(match extent {
                    Some((lo, hi)) => (lo.min(lambda), hi.max(lambda)),
                    None           => (lambda, lambda),
                });
            }
        }
        if sum < 1.0 { return DUMMY_LOSS }
        let overhang = match extent {
            Some((lo, hi)) => lo.powi(2) + (self.length - hi).powi(2),
            None           => self.length.powi(2),
        };
        weighted / sum + self.bands.endpoint_weight * overhang
    }

    /// Extent of one (time cell, strip) bin along the segment, as a fraction
    /// of the segment length
    pub fn profile_bin_width(&self, geometry: &GeometryTPC) -> f64 {
        if self.length <= 0.0 { return 0.0 }
        let pitch = geometry.strip_pitch_mm();
        let cell  = geometry.time_bin_width_mm();
        [Vec2::new(cell, pitch), Vec2::new(cell, -pitch)].iter()
            .map(|d| d.dot(&self.tangent).abs())
            .fold(0.0, f64::max) / self.length
    }

    /// Charge density along the segment from hits within the profile radius.
    ///
    /// Points are `(lambda / length, charge / bin width)`, sorted, with a
    /// zero point added half a bin beyond each end. Empty for segments
    /// shorter than 1 mm.
    pub fn charge_profile(&self, geometry: &GeometryTPC) -> Vec<(f64, f64)> {
        self.charge_profile_for(geometry, &self.hits)
    }

    pub fn charge_profile_for(&self, geometry: &GeometryTPC, hits: &[Hit2D]) -> Vec<(f64, f64)> {
        if self.length < 1.0 { return vec![] }
        let bin_width = self.profile_bin_width(geometry);
        if bin_width <= 0.0 { return vec![] }

        let mut points: Vec<(f64, f64)> = hits.iter()
            .filter_map(|hit| {
                let (lambda, distance) = self.point_lambda_and_distance(Self::hit_point(hit));
                (distance.abs() < self.bands.charge_profile).then(|| (lambda / self.length, hit.charge() / bin_width))
            })
            .collect();
        if points.is_empty() { return points }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (first, last) = (points[0].0, points[points.len() - 1].0);
        points.push((last + 0.5 * bin_width, 0.0));
        points.insert(0, (first - 0.5 * bin_width, 0.0));
        points
    }
}

fn unit_or_zero(v: Vec2) -> Vec2 {
    let norm = v.norm();
    if norm > 1e-12 { v / norm } else { Vec2::zeros() }
}
