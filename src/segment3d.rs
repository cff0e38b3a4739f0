//! Straight 3-D track segment and its projections onto the U, V and W
//! (time, strip) planes.

use std::fmt;
use std::sync::Arc;

#[cfg(not(feature = "serial"))]
use rayon::prelude::*;

use geometry::{GeometryTPC, Projection};

use crate::histogram::{Axis, Histo1D};
use crate::hit::{Hit2D, Hit2DCollection};
use crate::segment2d::{LossBands, LossKind, TrackSegment2D};
use crate::types::{Pid, Vec2, Vec3};

/// Half length used when a segment is built from a point and a direction
const BIAS_TANGENT_HALF_LENGTH: f64 = 200.0;

const PROFILE_BINS      : usize = 1024;
const PROFILE_MAX_POINTS: usize = 256;

pub type RecHits = Arc<[Hit2DCollection; 3]>;

#[derive(Clone, Debug)]
pub struct TrackSegment3D {
    geometry  : Arc<GeometryTPC>,
    bias      : Vec3,
    tangent   : Vec3,
    bias_at_x0: Vec3,
    bias_at_y0: Vec3,
    bias_at_z0: Vec3,
    start     : Vec3,
    end       : Vec3,
    length    : f64,
    pid       : Pid,
    diffusion : f64,
    rec_hits  : RecHits,
    projection_chi2: [f64; 3],
    bands     : LossBands,
}

impl TrackSegment3D {

    pub fn new(geometry: Arc<GeometryTPC>) -> Self {
        Self {
            geometry,
            bias      : Vec3::zeros(),
            tangent   : Vec3::zeros(),
            bias_at_x0: Vec3::zeros(),
            bias_at_y0: Vec3::zeros(),
            bias_at_z0: Vec3::zeros(),
            start     : Vec3::zeros(),
            end       : Vec3::zeros(),
            length    : 0.0,
            pid       : Pid::Unknown,
            diffusion : 0.0,
            rec_hits  : Arc::new([vec![], vec![], vec![]]),
            projection_chi2: [0.0; 3],
            bands     : LossBands::default(),
        }
    }

    pub fn with_bands(mut self, bands: LossBands) -> Self {
        self.bands = bands;
        self.calculate_rec_hit_chi2();
        self
    }

    pub fn set_rec_hits(&mut self, rec_hits: [Hit2DCollection; 3]) {
        self.set_shared_rec_hits(Arc::new(rec_hits));
    }

    pub fn set_shared_rec_hits(&mut self, rec_hits: RecHits) {
        self.rec_hits = rec_hits;
        self.calculate_rec_hit_chi2();
    }

    pub fn set_bias_tangent(&mut self, bias: Vec3, tangent: Vec3) {
        let tangent = unit_or_zero(tangent);
        self.bias    = bias;
        self.tangent = tangent;
        self.start   = bias - BIAS_TANGENT_HALF_LENGTH * tangent;
        self.end     = bias + BIAS_TANGENT_HALF_LENGTH * tangent;
        self.initialize();
    }

    /// `[x, y, z, θ, φ]`
    pub fn set_bias_tangent_par(&mut self, par: &[f64]) {
        let (theta, phi) = (par[3], par[4]);
        let tangent = Vec3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos());
        self.set_bias_tangent(Vec3::new(par[0], par[1], par[2]), tangent);
    }

    pub fn set_start_end(&mut self, start: Vec3, end: Vec3) {
        self.start   = start;
        self.end     = end;
        self.tangent = unit_or_zero(end - start);
        self.bias    = 0.5 * (start + end);
        self.initialize();
    }

    /// `[x0, y0, z0, x1, y1, z1]`
    pub fn set_start_end_par(&mut self, par: &[f64]) {
        self.set_start_end(Vec3::new(par[0], par[1], par[2]), Vec3::new(par[3], par[4], par[5]));
    }

    pub fn set_pid      (&mut self, pid: Pid)  { self.pid = pid; }
    pub fn set_diffusion(&mut self, sigma: f64) { self.diffusion = sigma; }

    fn initialize(&mut self) {
        let at = |component: usize| -> Vec3 {
            let t = self.tangent[component];
            if t.abs() < 1e-12 { self.bias } else { self.bias - (self.bias[component] / t) * self.tangent }
        };
        self.bias_at_x0 = at(0);
        self.bias_at_y0 = at(1);
        self.bias_at_z0 = at(2);
        self.length     = (self.end - self.start).norm();
        self.calculate_rec_hit_chi2();
    }

    pub fn geometry  (&self) -> &Arc<GeometryTPC> { &self.geometry }
    pub fn bias      (&self) -> Vec3 { self.bias }
    pub fn tangent   (&self) -> Vec3 { self.tangent }
    pub fn bias_at_x0(&self) -> Vec3 { self.bias_at_x0 }
    pub fn bias_at_y0(&self) -> Vec3 { self.bias_at_y0 }
    pub fn bias_at_z0(&self) -> Vec3 { self.bias_at_z0 }
    pub fn start     (&self) -> Vec3 { self.start }
    pub fn end       (&self) -> Vec3 { self.end }
    pub fn length    (&self) -> f64  { self.length }
    pub fn pid       (&self) -> Pid  { self.pid }
    pub fn diffusion (&self) -> f64  { self.diffusion }
    pub fn rec_hits  (&self) -> &RecHits { &self.rec_hits }
    pub fn rec_hits_in(&self, dir: Projection) -> &[Hit2D] { &self.rec_hits[dir.index()] }

    pub fn start_end_xyz(&self) -> [f64; 6] {
        let (s, e) = (self.start, self.end);
        [s.x, s.y, s.z, e.x, e.y, e.z]
    }

    /// `[x, y, z, θ, φ]` of the bias and tangent
    pub fn bias_tangent_coords(&self) -> [f64; 5] {
        let (b, t) = (self.bias, self.tangent);
        [b.x, b.y, b.z, t.z.clamp(-1.0, 1.0).acos(), t.y.atan2(t.x)]
    }

    /// Polar and azimuthal angle of the tangent
    pub fn theta(&self) -> f64 { self.tangent.z.clamp(-1.0, 1.0).acos() }
    pub fn phi  (&self) -> f64 { self.tangent.y.atan2(self.tangent.x) }

    pub fn lambda_at_x(&self, x: f64) -> f64 { (x - self.start.x) / self.tangent.x }
    pub fn lambda_at_y(&self, y: f64) -> f64 { (y - self.start.y) / self.tangent.y }
    pub fn lambda_at_z(&self, z: f64) -> f64 { (z - self.start.z) / self.tangent.z }

    /// Point at `lambda` from the start, seen in the (time, strip) plane of `dir`
    pub fn point_on_2d_projection(&self, lambda: f64, dir: Projection) -> Vec2 {
        let p = self.start + lambda * self.tangent;
        Vec2::new(p.z, self.geometry.cartesian_to_strip_pos(p.xy(), dir))
    }

    pub fn projection_2d(&self, dir: Projection, lambda_start: f64, lambda_end: f64) -> TrackSegment2D {
        let mut projection = TrackSegment2D::new(dir).with_bands(self.bands);
        projection.set_start_end(
            self.point_on_2d_projection(lambda_start, dir),
            self.point_on_2d_projection(lambda_end  , dir),
        );
        projection
    }

    fn full_projection(&self, dir: Projection) -> TrackSegment2D { self.projection_2d(dir, 0.0, self.length) }

    /// Charge of the rec-hits within the first `lambda` mm of the segment,
    /// summed over projections
    pub fn integrated_charge(&self, lambda: f64) -> f64 {
        if lambda < 0.0 { return 0.0 }
        Projection::ALL.iter()
            .map(|&dir| {
                let projection = self.projection_2d(dir, 0.0, lambda);
                projection.integrated_charge_for(projection.length(), self.rec_hits_in(dir))
            })
            .sum()
    }

    /// Finite segment chi2 in one projection, or summed over all three
    pub fn rec_hit_chi2(&self, dir: Option<Projection>) -> f64 {
        match dir {
            Some(dir) => self.projection_chi2[dir.index()],
            None      => self.projection_chi2.iter().sum(),
        }
    }

    /// Infinite-line loss of the kind given, summed over projections
    pub fn loss(&self, kind: LossKind) -> f64 {
        self.per_projection(|dir| self.full_projection(dir).loss_for(kind, self.rec_hits_in(dir)))
            .iter().sum()
    }

    fn calculate_rec_hit_chi2(&mut self) {
        let chi2 = self.per_projection(|dir| self.full_projection(dir).rec_hit_chi2_for(self.rec_hits_in(dir)));
        self.projection_chi2 = chi2;
    }

    fn per_projection<F>(&self, f: F) -> [f64; 3]
    where
        F: Fn(Projection) -> f64 + Sync + Send,
    {
        #[cfg(not(feature = "serial"))]
        let values: Vec<f64> = Projection::ALL.as_slice().par_iter().map(|&dir| f(dir)).collect();
        #[cfg(feature = "serial")]
        let values: Vec<f64> = Projection::ALL.iter().map(|&dir| f(dir)).collect();
        [values[0], values[1], values[2]]
    }

    /// Charge per unit length along the segment, combining the three
    /// projections. Binned over `[-0.2 L, 1.2 L]`; empty for segments
    /// shorter than 1 mm.
    pub fn charge_profile(&self) -> Histo1D {
        let length = self.length;
        let axis   = Axis::new(PROFILE_BINS, -0.2 * length.max(1.0), 1.2 * length.max(1.0));
        if length < 1.0 { return Histo1D::new(axis) }

        let mut histogram = Histo1D::new(axis);
        let mut max_points = 1;
        for dir in Projection::ALL {
            let projection = self.full_projection(dir);
            let points     = projection.charge_profile_for(&self.geometry, self.rec_hits_in(dir));
            let half_width = 0.5 * projection.profile_bin_width(&self.geometry);
            max_points = max_points.max(points.len());
            for (x, y) in points {
                let (lo, hi) = ((x - half_width) * length, (x + half_width) * length);
                let density  = y * axis.width() / length;
                for (centre, coverage) in bin_coverage(&axis, lo, hi) {
                    histogram.fill(centre, density * coverage);
                }
            }
        }

        let n_bins = max_points.min(PROFILE_MAX_POINTS);
        let mut group = PROFILE_BINS / n_bins;
        while PROFILE_BINS % group != 0 && group < PROFILE_BINS { group += 1; }
        let mut profile = histogram.rebin(group);
        let width = profile.axis().width();
        profile.scale(1.0 / width);
        profile
    }
}

/// Bins overlapped by `[lo, hi]` with the fraction of each bin covered
fn bin_coverage(axis: &Axis, lo: f64, hi: f64) -> Vec<(f64, f64)> {
    let clamp = |x: f64| x.clamp(axis.min(), axis.max() - 1e-9 * axis.width());
    let (lo, hi) = (clamp(lo), clamp(hi));
    if hi <= lo { return vec![] }
    let (Some(first), Some(last)) = (axis.find_bin(lo), axis.find_bin(hi)) else { return vec![] };
    let width = axis.width();
    (first..=last)
        .map(|i| {
            let (low, up) = (axis.low_edge(i), axis.low_edge(i) + width);
            let covered = if first == last { hi - lo }
                else if i == first { up - lo }
                else if i == last  { hi - low }
                else               { width };
            (axis.centre(i), covered / width)
        })
        .collect()
}

fn unit_or_zero(v: Vec3) -> Vec3 {
    let norm = v.norm();
    if norm > 1e-12 { v / norm } else { Vec3::zeros() }
}

impl fmt::Display for TrackSegment3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (s, e, b) = (self.start, self.end, self.bias);
        writeln!(f, "segment [{}]", self.pid)?;
        writeln!(f, "    start -> end: ({:.2}, {:.2}, {:.2}) -> ({:.2}, {:.2}, {:.2})", s.x, s.y, s.z, e.x, e.y, e.z)?;
        writeln!(f, "    chi2: {:.4}  charge: {:.1}  length [mm]: {:.2}",
                 self.rec_hit_chi2(None), self.integrated_charge(self.length), self.length)?;
        write!  (f, "    bias: ({:.2}, {:.2}, {:.2})  tangent (θ, φ): ({:.4}, {:.4})", b.x, b.y, b.z, self.theta(), self.phi())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn geometry() -> Arc<GeometryTPC> { Arc::new(GeometryTPC::default()) }

    /// Rec-hits of a straight line sampled every `step` mm, one per projection point
    pub(crate) fn line_hits(geometry: &GeometryTPC, start: Vec3, end: Vec3, step: f64) -> [Hit2DCollection; 3] {
        let n = ((end - start).norm() / step).ceil().max(1.0) as usize;
        Projection::ALL.map(|dir| {
            (0..=n).map(|i| {
                let p = start + (end - start) * (i as f64 / n as f64);
                Hit2D::new(p.z, geometry.cartesian_to_strip_pos(p.xy(), dir), 100.0)
            }).collect()
        })
    }

    #[test]
    fn start_end_derives_everything() {
        let mut segment = TrackSegment3D::new(geometry());
        segment.set_start_end(Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 6.0, 3.0));
        assert_float_eq!(segment.length(), 5.0, abs <= 1e-12);
        assert_float_eq!(segment.tangent().norm(), 1.0, abs <= 1e-12);
        assert_float_eq!(segment.bias_at_x0().x, 0.0, abs <= 1e-12);
        assert_float_eq!(segment.bias_at_y0().y, 0.0, abs <= 1e-12);
        // Parallel to the z = 0 plane: bias is kept
        assert_eq!(segment.bias_at_z0(), segment.bias());
    }

    #[rstest(/**/ theta, phi ,
             case(0.3  ,  0.0),
             case(1.2  ,  2.0),
             case(2.5  , -1.0),
    )]
    fn bias_tangent_parameters(theta: f64, phi: f64) {
        let mut segment = TrackSegment3D::new(geometry());
        segment.set_bias_tangent_par(&[1.0, -2.0, 3.0, theta, phi]);
        let coords = segment.bias_tangent_coords();
        assert_float_eq!(coords[3], theta, abs <= 1e-12);
        assert_float_eq!(coords[4], phi  , abs <= 1e-12);
        assert_float_eq!(segment.length(), 400.0, abs <= 1e-9);
    }

    #[rstest(/**/ dir          ,
             case(Projection::U),
             case(Projection::V),
             case(Projection::W),
    )]
    fn projection_matches_geometry(dir: Projection) {
        let geometry = geometry();
        let mut segment = TrackSegment3D::new(geometry.clone());
        let (start, end) = (Vec3::new(-10.0, 5.0, -20.0), Vec3::new(20.0, -5.0, 30.0));
        segment.set_start_end(start, end);
        let projection = segment.projection_2d(dir, 0.0, segment.length());
        assert_float_eq!(projection.start().x, start.z, abs <= 1e-9);
        assert_float_eq!(projection.end  ().x, end.z  , abs <= 1e-9);
        assert_float_eq!(projection.end().y, geometry.cartesian_to_strip_pos(end.xy(), dir), abs <= 1e-9);
    }

    #[test]
    fn chi2_is_minimal_on_true_segment() {
        let geometry = geometry();
        let (start, end) = (Vec3::new(-20.0, -10.0, -15.0), Vec3::new(25.0, 15.0, 20.0));
        let mut segment = TrackSegment3D::new(geometry.clone());
        segment.set_rec_hits(line_hits(&geometry, start, end, 0.5));
        segment.set_start_end(start, end);
        let best = segment.rec_hit_chi2(None);
        assert_float_eq!(best, 0.0, abs <= 1e-9);

        segment.set_start_end(start + Vec3::new(0.0, 2.0, 0.0), end);
        assert!(segment.rec_hit_chi2(None) > best);
        let per_projection: f64 = Projection::ALL.iter().map(|&d| segment.rec_hit_chi2(Some(d))).sum();
        assert_float_eq!(per_projection, segment.rec_hit_chi2(None), abs <= 1e-12);
    }

    #[test]
    fn integrated_charge_grows_along_segment() {
        let geometry = geometry();
        let (start, end) = (Vec3::new(-20.0, 0.0, -20.0), Vec3::new(20.0, 0.0, 20.0));
        let mut segment = TrackSegment3D::new(geometry.clone());
        // Hits slightly off the line: exactly aligned hits are not counted
        let hits = line_hits(&geometry, start + Vec3::new(0.0, 0.0, 0.1), end + Vec3::new(0.0, 0.0, 0.1), 1.0);
        segment.set_rec_hits(hits);
        segment.set_start_end(start, end);
        let half = segment.integrated_charge(0.5 * segment.length());
        let full = segment.integrated_charge(segment.length());
        assert!(half > 0.0);
        assert!(full > half);
        assert_eq!(segment.integrated_charge(-1.0), 0.0);
    }

    #[test]
    fn charge_profile_covers_segment() {
        let geometry = geometry();
        let (start, end) = (Vec3::new(-30.0, 10.0, -10.0), Vec3::new(30.0, -10.0, 10.0));
        let mut segment = TrackSegment3D::new(geometry.clone());
        segment.set_rec_hits(line_hits(&geometry, start, end, 0.5));
        segment.set_start_end(start, end);
        let profile = segment.charge_profile();
        assert!(profile.n_bins() <= PROFILE_MAX_POINTS);
        assert_eq!(PROFILE_BINS % profile.n_bins(), 0);
        let peak_x = profile.axis().centre(profile.max_bin());
        assert!(peak_x > -0.1 * segment.length() && peak_x < 1.1 * segment.length());
        assert!(profile.integral() > 0.0);

        let mut short = TrackSegment3D::new(geometry);
        short.set_start_end(Vec3::zeros(), Vec3::new(0.5, 0.0, 0.0));
        assert!(short.charge_profile().is_empty());
    }

    #[test]
    fn bin_coverage_splits_interval() {
        let axis = Axis::new(10, 0.0, 10.0);
        let bins = bin_coverage(&axis, 1.5, 3.25);
        let coverage = bins.iter().map(|&(_, c)| c).collect::<Vec<_>>();
        assert_eq!(coverage.len(), 3);
        assert_float_eq!(coverage[0], 0.5 , abs <= 1e-12);
        assert_float_eq!(coverage[1], 1.0 , abs <= 1e-12);
        assert_float_eq!(coverage[2], 0.25, abs <= 1e-12);
    }

    proptest! {
        #[test]
        fn segment_invariants(
            x0 in -100.0..100.0_f64, y0 in -100.0..100.0_f64, z0 in -100.0..100.0_f64,
            x1 in -100.0..100.0_f64, y1 in -100.0..100.0_f64, z1 in -100.0..100.0_f64,
        ) {
            let (start, end) = (Vec3::new(x0, y0, z0), Vec3::new(x1, y1, z1));
            prop_assume!((end - start).norm() > 1e-3);
            let mut segment = TrackSegment3D::new(geometry());
            segment.set_start_end(start, end);
            prop_assert!((segment.tangent().norm() - 1.0).abs() < 1e-9);
            prop_assert_eq!(segment.length(), (segment.end() - segment.start()).norm());
            prop_assert!((segment.bias() - segment.start()).cross(&segment.tangent()).norm() < 1e-9);
        }

        #[test]
        fn bias_tangent_invariants(
            x in -100.0..100.0_f64, y in -100.0..100.0_f64, z in -100.0..100.0_f64,
            theta in 0.01..3.13_f64, phi in -3.14..3.14_f64,
        ) {
            let mut segment = TrackSegment3D::new(geometry());
            segment.set_bias_tangent_par(&[x, y, z, theta, phi]);
            prop_assert!((segment.tangent().norm() - 1.0).abs() < 1e-9);
            prop_assert!((segment.bias() - segment.start()).cross(&segment.tangent()).norm() < 1e-9);
        }
    }
}
