//! Event reconstruction driver.
//!
//! For each event the builder turns the raw charge of the three projections
//! into rec-hits, finds straight 2-D segments with the Hough transform, lifts
//! them to a 3-D seed and fits a `Track3D` in two stages: first as an
//! infinite line (bias and tangent), then with free end points. Further
//! prongs sharing the vertex are added while they explain otherwise unused
//! charge, and single tracks are optionally classified with the dE/dx fitter.
//!
//! A builder owns its working state; reconstruct concurrent events with one
//! builder each.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use nalgebra::{Matrix2, Matrix3};
#[cfg(not(feature = "serial"))]
use rayon::prelude::*;
use serde::Deserialize;

use geometry::{GeometryTPC, Projection};

use crate::dedx::{DedxFitter, EventType};
use crate::error::{ConfigError, Result};
use crate::event::ChargeSource;
use crate::histogram::{Histo1D, Histo2D};
use crate::hit::{Hit2D, Hit2DCollection};
use crate::hough::{self, HoughParams};
use crate::minimize::{FitResult, Minimizer, Parameter};
use crate::rechits::{RecHitBuilder, RecHitParams};
use crate::segment2d::TrackSegment2D;
use crate::segment3d::{RecHits, TrackSegment3D};
use crate::track::{FitMode, Track3D};
use crate::types::{Pid, Vec2, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStage {
    BiasTangent,
    StartEnd,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuilderState {
    #[default]
    Idle,
    RecHitsBuilt,
    SegmentsFound,
    Segment3DSeeded,
    Fitting(FitStage),
    Converged,
    /// No usable segment in the event: nothing to fit
    FailedDegenerate,
}

impl fmt::Display for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self:?}") }
}

/// How segments of a multi-prong track are labelled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum AlphaPolicy {
    /// The longest segment is the alpha; in two-prong events the other one is
    /// the carbon, in three-prong events all are alphas
    #[default]
    LongestIsAlpha,
    /// Keep the labels given by the dE/dx fit; geometric prongs stay unknown
    FromDedx,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderParams {
    /// Events whose projections are all shorter than these (mm) are dots
    pub min_strip_proj_length  : f64,
    pub min_time_proj_length   : f64,
    /// Hough peaks extracted per projection
    pub segments_per_projection: usize,
    pub max_prongs             : usize,
    /// Initial step of the position parameters (mm)
    pub fit_step               : f64,
    /// Half width (mm) of the box around the seed allowed to the fit
    pub fit_limit              : f64,
    /// Hits further than this (mm) from every segment are unexplained
    pub residual_distance      : f64,
    /// Smallest fraction of a projection's charge left unexplained that
    /// seeds another prong
    pub min_prong_charge_fraction: f64,
    /// Bins added on each side by `projection_edges`
    pub projection_margin      : usize,
    pub alpha_policy           : AlphaPolicy,
    /// Run the dE/dx fit on single-segment tracks
    pub identify               : bool,
}

impl Default for BuilderParams {
    fn default() -> Self {
        Self {
            min_strip_proj_length  : 20.0,
            min_time_proj_length   : 20.0,
            segments_per_projection: 3,
            max_prongs             : 3,
            fit_step               : 0.1,
            fit_limit              : 100.0,
            residual_distance      : 6.0,
            min_prong_charge_fraction: 0.1,
            projection_margin      : 10,
            alpha_policy           : AlphaPolicy::LongestIsAlpha,
            identify               : true,
        }
    }
}

const ANGLE_STEP: f64 = 0.01;

pub struct TrackBuilder {
    geometry       : Arc<GeometryTPC>,
    params         : BuilderParams,
    rec_hit_builder: RecHitBuilder,
    hough          : HoughParams,
    dedx           : Option<DedxFitter>,
    minimizer      : Minimizer,

    raw            : Option<[Histo2D; 3]>,
    rec_hits_2d    : [Histo2D; 3],
    rec_hits       : RecHits,
    segments_2d    : [Vec<TrackSegment2D>; 3],
    seed           : Option<TrackSegment3D>,
    track          : Track3D,
    fit_results    : Vec<(FitStage, FitResult)>,
    stage_chi2     : Vec<(FitStage, f64)>,
    state          : BuilderState,
}

impl TrackBuilder {

    pub fn new(geometry: Arc<GeometryTPC>, params: BuilderParams) -> Self {
        let rec_hits_2d = Projection::ALL.map(|dir| Histo2D::for_projection(&geometry, dir));
        Self {
            geometry,
            params,
            rec_hit_builder: RecHitBuilder::new(RecHitParams::default()),
            hough          : HoughParams::default(),
            dedx           : None,
            minimizer      : Minimizer::default(),
            raw            : None,
            rec_hits_2d,
            rec_hits       : Arc::new([vec![], vec![], vec![]]),
            segments_2d    : [vec![], vec![], vec![]],
            seed           : None,
            track          : Track3D::new(),
            fit_results    : vec![],
            stage_chi2     : vec![],
            state          : BuilderState::Idle,
        }
    }

    pub fn with_rec_hit_params(mut self, params: RecHitParams) -> Self { self.rec_hit_builder = RecHitBuilder::new(params); self }
    pub fn with_hough_params  (mut self, params: HoughParams ) -> Self { self.hough = params; self }
    pub fn with_dedx          (mut self, fitter: DedxFitter  ) -> Self { self.dedx = Some(fitter); self }

    pub fn geometry(&self) -> &Arc<GeometryTPC> { &self.geometry }
    pub fn params  (&self) -> &BuilderParams { &self.params }
    pub fn state   (&self) -> BuilderState { self.state }
    pub fn track   (&self) -> &Track3D { &self.track }
    pub fn seed    (&self) -> Option<&TrackSegment3D> { self.seed.as_ref() }
    pub fn dedx    (&self) -> Option<&DedxFitter> { self.dedx.as_ref() }

    pub fn rec_hits      (&self, dir: Projection) -> &Histo2D { &self.rec_hits_2d[dir.index()] }
    pub fn rec_hit_list  (&self, dir: Projection) -> &[Hit2D] { &self.rec_hits[dir.index()] }
    pub fn segments_2d   (&self, dir: Projection) -> &[TrackSegment2D] { &self.segments_2d[dir.index()] }
    pub fn fit_results   (&self) -> &[(FitStage, FitResult)] { &self.fit_results }

    /// Track chi2 at the end of a fit stage
    pub fn stage_chi2(&self, stage: FitStage) -> Option<f64> {
        self.stage_chi2.iter().find(|(s, _)| *s == stage).map(|&(_, chi2)| chi2)
    }

    /// All fit stages run so far reported convergence
    pub fn fit_valid(&self) -> bool { !self.fit_results.is_empty() && self.fit_results.iter().all(|(_, r)| r.valid) }

    fn set_state(&mut self, state: BuilderState) {
        log::debug!("track builder: {} -> {}", self.state, state);
        self.state = state;
    }

    // ----- input ----------------------------------------------------------------

    /// Materialise the charge of the next event. Clears all results.
    pub fn set_event<S: ChargeSource + ?Sized>(&mut self, source: &S) {
        let raw = Projection::ALL.map(|dir| source.to_histo2d(dir, &self.geometry));
        self.set_raw_histograms(raw);
    }

    pub fn set_raw_histograms(&mut self, raw: [Histo2D; 3]) {
        self.raw         = Some(raw);
        self.rec_hits_2d = Projection::ALL.map(|dir| Histo2D::for_projection(&self.geometry, dir));
        self.rec_hits    = Arc::new([vec![], vec![], vec![]]);
        self.segments_2d = [vec![], vec![], vec![]];
        self.seed        = None;
        self.track       = Track3D::new();
        self.fit_results.clear();
        self.stage_chi2.clear();
        self.state       = BuilderState::Idle;
    }

    // ----- pipeline ---------------------------------------------------------------

    /// Run the whole pipeline on the current event
    pub fn reconstruct(&mut self) -> BuilderState {
        self.make_rec_hits();
        self.find_segments();
        if self.state == BuilderState::FailedDegenerate { return self.state }
        if self.is_dot() {
            self.track = self.fit_dot();
            self.set_state(BuilderState::Converged);
            return self.state
        }
        self.seed_from_segments();
        self.fit_from_seed()
    }

    pub fn make_rec_hits(&mut self) {
        let Some(raw) = &self.raw else {
            log::debug!("no event set, rec-hits left empty");
            self.set_state(BuilderState::RecHitsBuilt);
            return
        };
        let builder = &self.rec_hit_builder;
        #[cfg(not(feature = "serial"))]
        let rec_hits: Vec<Histo2D> = raw.as_slice().par_iter().map(|h| builder.make_rec_hits(h)).collect();
        #[cfg(feature = "serial")]
        let rec_hits: Vec<Histo2D> = raw.iter().map(|h| builder.make_rec_hits(h)).collect();
        let hits = Projection::ALL.map(|dir| rec_hits[dir.index()].to_hits());
        for (dir, histo) in Projection::ALL.into_iter().zip(rec_hits) {
            self.rec_hits_2d[dir.index()] = histo;
        }
        self.rec_hits = Arc::new(hits);
        self.set_state(BuilderState::RecHitsBuilt);
    }

    /// Hough segments of each projection; degenerate when all are null
    pub fn find_segments(&mut self) {
        for dir in Projection::ALL {
            self.segments_2d[dir.index()] = hough::find_segments(
                &self.geometry, dir, &self.hough, &self.rec_hits[dir.index()], self.params.segments_per_projection,
            );
        }
        let all_null = self.segments_2d.iter()
            .all(|s| s.first().map_or(true, |s| s.length() == 0.0));
        if all_null {
            log::debug!("no 2-D segment in any projection");
            self.set_state(BuilderState::FailedDegenerate);
        } else {
            self.set_state(BuilderState::SegmentsFound);
        }
    }

    /// Events whose rec-hits span less than the minimal lengths in time and
    /// along the strips of every projection
    fn is_dot(&self) -> bool {
        let widest = |projection: fn(&Histo2D) -> Histo1D| {
            self.rec_hits_2d.iter()
                .filter_map(|h| projection_edges(&projection(h), 0))
                .map(|(lo, hi)| hi - lo)
                .fold(0.0, f64::max)
        };
        widest(Histo2D::projection_x) < self.params.min_time_proj_length &&
            widest(Histo2D::projection_y) < self.params.min_strip_proj_length
    }

    /// Point-like deposit: zero-length segment at the charge centroid
    pub fn fit_dot(&self) -> Track3D {
        let mut track = Track3D::new();
        let Some(centre) = charge_centroid(&self.geometry, self.hit_slices()) else { return track };
        let mut dot = TrackSegment3D::new(self.geometry.clone());
        dot.set_shared_rec_hits(self.rec_hits.clone());
        dot.set_start_end(centre, centre);
        dot.set_pid(Pid::Dot);
        track.add_segment(dot);
        track
    }

    fn hit_slices(&self) -> [&[Hit2D]; 3] {
        [&self.rec_hits[0], &self.rec_hits[1], &self.rec_hits[2]]
    }

    /// Lift the strongest 2-D segment of each projection to a 3-D seed
    fn seed_from_segments(&mut self) {
        let candidates = self.segments_2d.iter()
            .filter_map(|s| s.first())
            .filter(|s| s.length() > 0.0)
            .collect_vec();
        let z_ref = self.rec_hits.iter().flatten()
            .max_by(|a, b| a.charge().total_cmp(&b.charge()))
            .map_or(0.0, Hit2D::pos_time);
        self.seed = lift_segments(&self.geometry, &candidates, z_ref).map(|(bias, tangent, residual)| {
            log::debug!("3-D seed from {} projections, inconsistency {residual:.2e}", candidates.len());
            let mut seed = TrackSegment3D::new(self.geometry.clone());
            seed.set_shared_rec_hits(self.rec_hits.clone());
            seed.set_bias_tangent(bias, tangent);
            seed
        });
        if self.seed.is_some() { self.set_state(BuilderState::Segment3DSeeded) }
        else {
            log::debug!("fewer than two usable projections, cannot lift");
            self.set_state(BuilderState::FailedDegenerate);
        }
    }

    /// Replace the Hough stage with segments marked by hand and seed from
    /// them. `values` holds 12 numbers per segment: for U, V and W in turn,
    /// start (time, strip) and end (time, strip) in mm. Only the first
    /// segment of each projection takes part in the seed.
    pub fn segment2d_collection_from_gui(&mut self, values: &[f64]) -> Result<()> {
        if values.is_empty() || values.len() % 12 != 0 {
            return Err(ConfigError::Config(format!("expected 12 values per segment, got {}", values.len())))
        }
        if self.state == BuilderState::Idle { self.make_rec_hits(); }
        self.segments_2d = [vec![], vec![], vec![]];
        for chunk in values.chunks(12) {
            for dir in Projection::ALL {
                let v = &chunk[4 * dir.index()..4 * dir.index() + 4];
                let mut segment = TrackSegment2D::with_hits(dir, self.rec_hits[dir.index()].clone());
                segment.set_start_end(Vec2::new(v[0], v[1]), Vec2::new(v[2], v[3]));
                self.segments_2d[dir.index()].push(segment);
            }
        }
        self.set_state(BuilderState::SegmentsFound);
        self.seed_from_segments();
        Ok(())
    }

    /// Fit the current seed. Called by `reconstruct`, or after
    /// `segment2d_collection_from_gui`.
    pub fn fit_from_seed(&mut self) -> BuilderState {
        let Some(seed) = self.seed.clone() else {
            self.set_state(BuilderState::FailedDegenerate);
            return self.state
        };
        self.fit_results.clear();
        self.stage_chi2.clear();
        let mut track = self.fit_track_3d(seed);
        if track.is_empty() {
            self.track = track;
            self.set_state(BuilderState::FailedDegenerate);
            return self.state
        }

        while track.segments().len() < self.params.max_prongs {
            match self.add_prong(&track) {
                Some(more) => track = more,
                None       => break,
            }
        }

        if self.params.identify && track.segments().len() == 1 && self.dedx.is_some() {
            track = self.fit_event_hypothesis(&track);
        }
        self.label_segments(&mut track);
        if !self.fit_valid() { log::warn!("track fit did not converge:\n{track}"); }
        self.track = track;
        self.set_state(BuilderState::Converged);
        self.state
    }

    /// Two-stage fit of a single segment
    pub fn fit_track_3d(&mut self, seed: TrackSegment3D) -> Track3D {
        let mut track = Track3D::new();
        track.add_segment(seed);

        self.set_state(BuilderState::Fitting(FitStage::BiasTangent));
        track.set_fit_mode(FitMode::BiasTangent);
        let (mut track, result) = self.fit_nodes(&track);
        self.fit_results.push((FitStage::BiasTangent, result));

        // Re-anchor the infinite line inside the chamber and cut it to the hits
        self.anchor_at_centroid(&mut track);
        let (xy, z) = (self.geometry.xy_range(), self.geometry.z_range());
        track.extend_to_chamber_range(xy, z);
        track.shrink_to_hits();
        track.remove_empty_segments();
        if track.is_empty() { return track }
        track.set_fit_mode(FitMode::StartStop);
        self.stage_chi2.push((FitStage::BiasTangent, track.chi2()));

        self.set_state(BuilderState::Fitting(FitStage::StartEnd));
        let (mut track, result) = self.fit_nodes(&track);
        self.fit_results.push((FitStage::StartEnd, result));
        self.stage_chi2.push((FitStage::StartEnd, track.chi2()));

        self.orient_along_charge(&mut track);
        track
    }

    /// Minimise the track loss in its current fit mode, starting from its
    /// current nodes
    fn fit_nodes(&self, track: &Track3D) -> (Track3D, FitResult) {
        let start = track.fit_params();
        let (step, limit) = (self.params.fit_step, self.params.fit_limit);
        let parameters = match track.fit_mode() {
            FitMode::StartStop => start.iter()
                .map(|&v| Parameter::new("node", v, step).limits(v - limit, v + limit))
                .collect_vec(),
            FitMode::BiasTangent => start.chunks(5)
                .flat_map(|c| [
                    Parameter::new("x"    , c[0], step).limits(c[0] - limit, c[0] + limit),
                    Parameter::new("y"    , c[1], step).limits(c[1] - limit, c[1] + limit),
                    Parameter::new("z"    , c[2], step).limits(c[2] - limit, c[2] + limit),
                    Parameter::new("theta", c[3], ANGLE_STEP),
                    Parameter::new("phi"  , c[4], ANGLE_STEP),
                ])
                .collect_vec(),
        };
        let work   = RefCell::new(track.clone());
        let result = self.minimizer.minimize(|p| work.borrow_mut().chi2_from_nodes_list(p), &parameters);
        let mut fitted = work.into_inner();
        fitted.chi2_from_nodes_list(&result.params);
        (fitted, result)
    }

    /// Put the bias of a single-segment track at the point of its line
    /// closest to the charge centroid, as a short segment
    fn anchor_at_centroid(&self, track: &mut Track3D) {
        let Some(centre) = charge_centroid(&self.geometry, self.hit_slices()) else { return };
        if let [segment] = track.segments_mut() {
            let (bias, t) = (segment.bias(), segment.tangent());
            let anchor = bias + (centre - bias).dot(&t) * t;
            segment.set_start_end(anchor - t, anchor + t);
        }
        track.update();
    }

    /// Single segments run towards their charge maximum
    fn orient_along_charge(&self, track: &mut Track3D) {
        if let [segment] = track.segments_mut() {
            let profile = segment.charge_profile();
            if profile.is_empty() { return }
            let peak = profile.axis().centre(profile.max_bin());
            if peak < 0.5 * segment.length() {
                let (start, end) = (segment.start(), segment.end());
                segment.set_start_end(end, start);
            }
        }
        track.update();
    }

    // ----- prongs -------------------------------------------------------------------

    /// Share the rec-hits among the segments, each hit going to the segment
    /// closest to it in its projection
    fn assign_rec_hits(&self, track: &mut Track3D) {
        let n = track.segments().len();
        if n <= 1 {
            for segment in track.segments_mut() { segment.set_shared_rec_hits(self.rec_hits.clone()); }
            track.update();
            return
        }
        let mut shares: Vec<[Hit2DCollection; 3]> = vec![[vec![], vec![], vec![]]; n];
        for dir in Projection::ALL {
            let projections = track.segments().iter()
                .map(|s| s.projection_2d(dir, 0.0, s.length()))
                .collect_vec();
            for hit in self.rec_hits[dir.index()].iter() {
                let point = Vec2::new(hit.pos_time(), hit.pos_strip());
                let nearest = projections.iter()
                    .map(|p| p.point_segment_distance(point).1)
                    .position_min_by(|a, b| a.total_cmp(b))
                    .unwrap_or(0);
                shares[nearest][dir.index()].push(*hit);
            }
        }
        for (segment, share) in track.segments_mut().iter_mut().zip(shares) {
            segment.set_rec_hits(share);
        }
        track.update();
    }

    /// Rec-hits further than the residual distance from every segment
    fn unexplained_hits(&self, track: &Track3D) -> [Hit2DCollection; 3] {
        Projection::ALL.map(|dir| {
            let projections = track.segments().iter()
                .map(|s| s.projection_2d(dir, 0.0, s.length()))
                .collect_vec();
            self.rec_hits[dir.index()].iter()
                .filter(|hit| {
                    let point = Vec2::new(hit.pos_time(), hit.pos_strip());
                    projections.iter().all(|p| p.point_segment_distance(point).1 > self.params.residual_distance)
                })
                .copied()
                .collect()
        })
    }

    /// Add one segment from the vertex towards the charge the track leaves
    /// unexplained. `None` when there is not enough of it, or when the fit
    /// with the extra prong is no better.
    fn add_prong(&self, track: &Track3D) -> Option<Track3D> {
        let residual = self.unexplained_hits(track);
        let enough = Projection::ALL.iter().filter(|dir| {
            let total: f64 = self.rec_hits[dir.index()].iter().map(Hit2D::charge).sum();
            let left : f64 = residual[dir.index()].iter().map(Hit2D::charge).sum();
            left >= 1.0 && left >= self.params.min_prong_charge_fraction * total
        }).count();
        if enough < 2 { return None }
        let target = charge_centroid(&self.geometry, [&residual[0], &residual[1], &residual[2]])?;

        let segments = track.segments();
        let (vertex, mut ends) = if let [single] = segments {
            let (start, end) = (single.start(), single.end());
            if (start - target).norm() <= (end - target).norm() { (start, vec![end]) } else { (end, vec![start]) }
        } else {
            (segments[0].start(), segments.iter().map(TrackSegment3D::end).collect_vec())
        };
        ends.push(vertex + 2.0 * (target - vertex));

        let mut candidate = Track3D::new();
        for end in ends {
            let mut segment = TrackSegment3D::new(self.geometry.clone());
            segment.set_start_end(vertex, end);
            candidate.add_segment(segment);
        }
        candidate.set_fit_mode(FitMode::StartStop);
        for _ in 0..2 {
            self.assign_rec_hits(&mut candidate);
            candidate = self.fit_nodes(&candidate).0;
        }
        self.assign_rec_hits(&mut candidate);

        let mut reference = track.clone();
        self.assign_rec_hits(&mut reference);
        log::debug!("prong {} chi2 {:.3} vs {:.3}", candidate.segments().len(), candidate.chi2(), reference.chi2());
        let degenerate = candidate.segments().iter().any(|s| s.length() < 1.0);
        (!degenerate && candidate.chi2() < reference.chi2()).then_some(candidate)
    }

    // ----- identification -----------------------------------------------------------

    /// Classify a single-segment track with the dE/dx fitter. A 12C+alpha
    /// result splits the segment at the fitted vertex into back-to-back
    /// alpha and carbon segments.
    pub fn fit_event_hypothesis(&mut self, track: &Track3D) -> Track3D {
        let [segment] = track.segments() else { return track.clone() };
        let Some(fitter) = self.dedx.as_mut() else { return track.clone() };
        let profile = segment.charge_profile();
        fitter.fit_histo(&profile);
        let (event_type, reflected) = (fitter.event_type(), fitter.is_reflected());
        if event_type == EventType::Unknown { return track.clone() }

        let (start, t, length) = (segment.start(), segment.tangent(), segment.length());
        let offset  = fitter.vertex_offset();
        let along   = if reflected { length - offset } else { offset };
        let forward = if reflected { -t } else { t };
        let vertex  = start + along * t;

        let mut alpha = segment.clone();
        alpha.set_start_end(vertex, vertex + fitter.alpha_range() * forward);
        alpha.set_pid(Pid::Alpha);
        alpha.set_diffusion(fitter.diffusion());

        let mut result = Track3D::new();
        result.add_segment(alpha);
        if event_type == EventType::C12Alpha {
            let mut carbon = segment.clone();
            carbon.set_start_end(vertex, vertex - fitter.carbon_range() * forward);
            carbon.set_pid(Pid::C12);
            carbon.set_diffusion(fitter.diffusion());
            result.add_segment(carbon);
        }
        let chi2 = fitter.chi2();
        self.assign_rec_hits(&mut result);
        result.set_hypothesis_fit_chi2(chi2);
        result.set_charge_profile(profile);
        log::debug!("dE/dx: {event_type}, reflected {reflected}, chi2 {chi2:.3e}");
        result
    }

    fn label_segments(&self, track: &mut Track3D) {
        if self.params.alpha_policy != AlphaPolicy::LongestIsAlpha { return }
        let n = track.segments().len();
        if n < 2 { return }
        let longest = track.segments().iter()
            .position_max_by(|a, b| a.length().total_cmp(&b.length()))
            .unwrap_or(0);
        for (i, segment) in track.segments_mut().iter_mut().enumerate() {
            let pid = if i == longest || n > 2 { Pid::Alpha } else { Pid::C12 };
            segment.set_pid(pid);
        }
    }
}

/// Range of bins with non-zero content, widened by `margin` bins on each
/// side and clamped to the axis, as `(low edge, high edge)`. `None` for an
/// empty histogram.
pub fn projection_edges(histo: &Histo1D, margin: usize) -> Option<(f64, f64)> {
    let bins  = 0..=histo.n_bins() - 1;
    let first = histo.first_bin_above(0.0, bins.clone())?;
    let last  = histo.last_bin_above(0.0, bins)?;
    let axis  = histo.axis();
    let first = first.saturating_sub(margin);
    let last  = (last + margin).min(histo.n_bins() - 1);
    Some((axis.low_edge(first), axis.low_edge(last) + axis.width()))
}

/// 3-D line through the 2-D segments of two or three projections.
///
/// Each segment confines the line to a plane; the direction is the common
/// null vector of the plane normals and the returned point lies on the line
/// near drift position `z_ref`. Also returns the relative inconsistency of
/// the projections (zero for exactly compatible segments). `None` with fewer
/// than two usable segments or for parallel planes.
pub fn lift_segments(geometry: &GeometryTPC, segments: &[&TrackSegment2D], z_ref: f64) -> Option<(Vec3, Vec3, f64)> {
    let usable = segments.iter().filter(|s| s.tangent().norm() > 0.5).collect_vec();
    if usable.len() < 2 { return None }

    // Plane of segment a: n_t z + n_s (p_a . xy) = n . bias, with n normal to the 2-D tangent
    let planes = usable.iter().map(|s| {
        let (d, p) = (s.tangent(), geometry.strip_pitch_direction(s.strip_dir()));
        let n = Vec2::new(-d.y, d.x);
        (Vec3::new(n.y * p.x, n.y * p.y, n.x), n.dot(&s.bias()))
    }).collect_vec();

    let mut normals = Matrix3::zeros();
    for (row, (normal, _)) in planes.iter().take(3).enumerate() {
        normals.set_row(row, &normal.transpose());
    }
    let svd = normals.svd(false, true);
    let v_t = svd.v_t?;
    let (i_min, sigma_min) = svd.singular_values.iter().copied().enumerate()
        .min_by(|a, b| a.1.total_cmp(&b.1))?;
    let sigma_max = svd.singular_values.max();
    let mut tangent: Vec3 = v_t.row(i_min).transpose();
    if tangent.z < 0.0 || (tangent.z.abs() < 1e-12 && tangent.x < 0.0) { tangent = -tangent; }
    let rank_two = svd.singular_values.iter().filter(|&&s| s > 1e-6 * sigma_max).count() >= 2;
    if !rank_two { return None }

    // Least squares over the planes plus the condition t . point = t_z z_ref
    let mut ata = tangent * tangent.transpose();
    let mut atb = tangent * (tangent.z * z_ref);
    for (normal, value) in &planes {
        ata += normal * normal.transpose();
        atb += normal * *value;
    }
    let point = ata.lu().solve(&atb)?;
    let inconsistency = if usable.len() > 2 { sigma_min / sigma_max } else { 0.0 };
    Some((point, tangent, inconsistency))
}

/// Point whose projections best match the charge-weighted centroids of the
/// hits of each projection. Needs charge in at least two projections.
pub fn charge_centroid(geometry: &GeometryTPC, hits: [&[Hit2D]; 3]) -> Option<Vec3> {
    let (mut q_total, mut qz) = (0.0, 0.0);
    let mut ata = Matrix2::zeros();
    let mut atb = Vec2::zeros();
    let mut used = 0;
    for dir in Projection::ALL {
        let hits = hits[dir.index()];
        let q: f64 = hits.iter().map(Hit2D::charge).sum();
        if q <= 0.0 { continue }
        let strip = hits.iter().map(|h| h.charge() * h.pos_strip()).sum::<f64>() / q;
        qz      += hits.iter().map(|h| h.charge() * h.pos_time()).sum::<f64>();
        q_total += q;
        let p = geometry.strip_pitch_direction(dir);
        ata += q * p * p.transpose();
        atb += q * strip * p;
        used += 1;
    }
    if used < 2 { return None }
    let xy = ata.lu().solve(&atb)?;
    Some(Vec3::new(xy.x, xy.y, qz / q_total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn geometry() -> Arc<GeometryTPC> { Arc::new(GeometryTPC::default()) }

    fn segment_3d(start: Vec3, end: Vec3) -> TrackSegment3D {
        let mut s = TrackSegment3D::new(geometry());
        s.set_start_end(start, end);
        s
    }

    #[rstest(/**/ start                       , end                         ,
             case(Vec3::new(-20.0, -10.0, -30.0), Vec3::new( 25.0,  15.0,  35.0)),
             case(Vec3::new( 10.0, -30.0,   5.0), Vec3::new(-20.0,  30.0,  15.0)), // shallow
             case(Vec3::new(  3.0,   4.0, -40.0), Vec3::new(  3.0,   4.0,  40.0)), // along the drift
    )]
    fn lift_reproduces_tangent(start: Vec3, end: Vec3) {
        let geometry = geometry();
        let segment  = segment_3d(start, end);
        let projections = Projection::ALL.map(|dir| segment.projection_2d(dir, 0.0, segment.length()));
        let refs = projections.iter().collect_vec();
        let (point, tangent, inconsistency) = lift_segments(&geometry, &refs, 0.0).unwrap();
        assert_float_eq!(tangent.dot(&segment.tangent()).abs(), 1.0, abs <= 1e-9);
        assert_float_eq!((point - start).cross(&segment.tangent()).norm(), 0.0, abs <= 1e-6);
        assert!(inconsistency < 1e-9);
    }

    proptest! {
        #[test]
        fn lift_from_any_two_projections(
            theta in 0.1..1.3_f64,
            phi   in -3.1..3.1_f64,
            drop  in 0..3_usize,
        ) {
            let t = Vec3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos());
            let segment = segment_3d(Vec3::new(1.0, -2.0, 3.0) - 30.0 * t, Vec3::new(1.0, -2.0, 3.0) + 30.0 * t);
            let projections = Projection::ALL.iter()
                .filter(|dir| dir.index() != drop)
                .map(|&dir| segment.projection_2d(dir, 0.0, segment.length()))
                .collect_vec();
            let refs = projections.iter().collect_vec();
            let (point, tangent, _) = lift_segments(&geometry(), &refs, 3.0).unwrap();
            prop_assert!((tangent.dot(&t).abs() - 1.0).abs() < 1e-8);
            prop_assert!((point - Vec3::new(1.0, -2.0, 3.0)).cross(&t).norm() < 1e-6);
        }
    }

    #[test]
    fn horizontal_lines_cannot_be_lifted() {
        // Constant drift time in every projection leaves the direction in the readout plane free
        let segment = segment_3d(Vec3::new(10.0, -30.0, 5.0), Vec3::new(-20.0, 30.0, 5.0));
        let projections = Projection::ALL.map(|dir| segment.projection_2d(dir, 0.0, segment.length()));
        let refs = projections.iter().collect_vec();
        assert!(lift_segments(&geometry(), &refs, 0.0).is_none());
    }

    #[test]
    fn lift_needs_two_projections() {
        let segment = segment_3d(Vec3::new(0.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 10.0));
        let u = segment.projection_2d(Projection::U, 0.0, segment.length());
        let null = TrackSegment2D::new(Projection::V);
        assert!(lift_segments(&geometry(), &[&u], 0.0).is_none());
        assert!(lift_segments(&geometry(), &[&u, &null], 0.0).is_none());
    }

    #[test]
    fn centroid_of_point_charges() {
        let geometry = geometry();
        let p = Vec3::new(7.0, -12.0, 20.0);
        let hits = Projection::ALL.map(|dir| vec![Hit2D::new(p.z, geometry.cartesian_to_strip_pos(p.xy(), dir), 10.0)]);
        let c = charge_centroid(&geometry, [&hits[0], &hits[1], &hits[2]]).unwrap();
        assert_float_eq!((c - p).norm(), 0.0, abs <= 1e-9);
        assert!(charge_centroid(&geometry, [&hits[0], &[], &[]]).is_none());
    }

    #[rstest(/**/ margin, expected     ,
             case(0     , (3.0,  6.0)),
             case(2     , (1.0,  8.0)),
             case(10    , (0.0, 10.0)),
    )]
    fn edges(margin: usize, expected: (f64, f64)) {
        let axis = crate::histogram::Axis::new(10, 0.0, 10.0);
        let histo = Histo1D::from_values(axis, vec![0.0, 0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(projection_edges(&histo, margin), Some(expected));
        assert_eq!(projection_edges(&Histo1D::new(axis), margin), None);
    }

    #[test]
    fn empty_event_is_degenerate() {
        let geometry = geometry();
        let mut builder = TrackBuilder::new(geometry.clone(), BuilderParams::default());
        builder.set_raw_histograms(Projection::ALL.map(|dir| Histo2D::for_projection(&geometry, dir)));
        assert_eq!(builder.reconstruct(), BuilderState::FailedDegenerate);
        assert!(builder.track().is_empty());
        for dir in Projection::ALL {
            assert!(builder.rec_hits(dir).is_empty());
            assert_eq!(builder.segments_2d(dir)[0].length(), 0.0);
        }
    }

    #[test]
    fn gui_input_is_validated() {
        let mut builder = TrackBuilder::new(geometry(), BuilderParams::default());
        assert!(builder.segment2d_collection_from_gui(&[1.0; 11]).is_err());
        assert!(builder.segment2d_collection_from_gui(&[]).is_err());
    }

    #[test]
    fn gui_segments_seed_the_fit() {
        let geometry = geometry();
        let truth = segment_3d(Vec3::new(-20.0, -10.0, -30.0), Vec3::new(25.0, 15.0, 35.0));
        let mut values = vec![];
        for dir in Projection::ALL {
            let (s, e) = (truth.point_on_2d_projection(0.0, dir), truth.point_on_2d_projection(truth.length(), dir));
            values.extend([s.x, s.y, e.x, e.y]);
        }
        let mut builder = TrackBuilder::new(geometry, BuilderParams::default());
        builder.segment2d_collection_from_gui(&values).unwrap();
        assert_eq!(builder.state(), BuilderState::Segment3DSeeded);
        let seed = builder.seed().unwrap();
        assert_float_eq!(seed.tangent().dot(&truth.tangent()).abs(), 1.0, abs <= 1e-9);
    }
}
