//! Track made of 3-D segments sharing one vertex.

use std::fmt;

use geometry::Range;

use crate::histogram::{Axis, Histo1D};
use crate::segment2d::LossKind;
use crate::segment3d::TrackSegment3D;
use crate::types::{Vec3, DUMMY_LOSS};

/// Parametrisation used by `chi2_from_nodes_list`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FitMode {
    /// `[vertex xyz, end xyz of each segment]`: every segment starts at the vertex
    #[default]
    StartStop,
    /// `[x, y, z, θ, φ]` per segment, as infinite lines
    BiasTangent,
}

const DEFAULT_HYPOTHESIS_CHI2: f64 = 99.0;
const MERGED_PROFILE_BINS: usize = 256;

#[derive(Clone, Debug)]
pub struct Track3D {
    segments      : Vec<TrackSegment3D>,
    length        : f64,
    segment_chi2  : Vec<f64>,
    charge_profile: Option<Histo1D>,
    hypothesis_fit_chi2: f64,
    fit_mode      : FitMode,
}

impl Default for Track3D {
    fn default() -> Self {
        Self {
            segments      : vec![],
            length        : 0.0,
            segment_chi2  : vec![],
            charge_profile: None,
            hypothesis_fit_chi2: DEFAULT_HYPOTHESIS_CHI2,
            fit_mode      : FitMode::StartStop,
        }
    }
}

impl Track3D {

    pub fn new() -> Self { Self::default() }

    pub fn add_segment(&mut self, segment: TrackSegment3D) {
        self.segments.push(segment);
        self.update();
    }

    /// Recompute length and chi2 from the segments
    pub fn update(&mut self) {
        self.length       = self.segments.iter().map(TrackSegment3D::length).sum();
        self.segment_chi2 = self.segments.iter().map(|s| s.rec_hit_chi2(None)).collect();
    }

    pub fn segments    (&self) -> &[TrackSegment3D] { &self.segments }
    pub fn segments_mut(&mut self) -> &mut [TrackSegment3D] { &mut self.segments }
    pub fn is_empty    (&self) -> bool { self.segments.is_empty() }
    pub fn length      (&self) -> f64 { self.length }
    pub fn fit_mode    (&self) -> FitMode { self.fit_mode }
    pub fn set_fit_mode(&mut self, mode: FitMode) { self.fit_mode = mode; }

    pub fn hypothesis_fit_chi2    (&self) -> f64 { self.hypothesis_fit_chi2 }
    pub fn set_hypothesis_fit_chi2(&mut self, chi2: f64) { self.hypothesis_fit_chi2 = chi2; }

    /// Sum of the segment chi2
    pub fn chi2(&self) -> f64 { self.segment_chi2.iter().sum() }

    pub fn segment_chi2(&self) -> &[f64] { &self.segment_chi2 }

    /// Infinite-line loss summed over segments
    pub fn loss(&self, kind: LossKind) -> f64 { self.segments.iter().map(|s| s.loss(kind)).sum() }

    /// Quantity minimised when fitting in the current mode
    pub fn fit_loss(&self) -> f64 {
        match self.fit_mode {
            FitMode::StartStop   => self.chi2(),
            FitMode::BiasTangent => self.loss(LossKind::BiasTangent),
        }
    }

    /// Start of the first segment followed by the end of every segment
    pub fn segments_start_end_xyz(&self) -> Vec<f64> {
        let Some(first) = self.segments.first() else { return vec![] };
        let mut coordinates = first.start_end_xyz()[..3].to_vec();
        for segment in &self.segments {
            coordinates.extend_from_slice(&segment.start_end_xyz()[3..]);
        }
        coordinates
    }

    pub fn segments_bias_tangent_coords(&self) -> Vec<f64> {
        self.segments.iter().flat_map(|s| s.bias_tangent_coords()).collect()
    }

    /// Number of parameters `chi2_from_nodes_list` expects in the current mode
    pub fn n_fit_params(&self) -> usize {
        match self.fit_mode {
            FitMode::StartStop   => if self.segments.is_empty() { 0 } else { 3 * (self.segments.len() + 1) },
            FitMode::BiasTangent => 5 * self.segments.len(),
        }
    }

    /// Current values of the parameters of the current mode
    pub fn fit_params(&self) -> Vec<f64> {
        match self.fit_mode {
            FitMode::StartStop   => self.segments_start_end_xyz(),
            FitMode::BiasTangent => self.segments_bias_tangent_coords(),
        }
    }

    /// Move the segments to the parameters and return the fit loss
    pub fn chi2_from_nodes_list(&mut self, par: &[f64]) -> f64 {
        if par.len() < self.n_fit_params() { return f64::INFINITY }
        let mode = self.fit_mode;
        for (i, segment) in self.segments.iter_mut().enumerate() {
            match mode {
                FitMode::StartStop => {
                    let p = [par[0], par[1], par[2], par[3 * i + 3], par[3 * i + 4], par[3 * i + 5]];
                    segment.set_start_end_par(&p);
                }
                FitMode::BiasTangent => segment.set_bias_tangent_par(&par[5 * i..5 * i + 5]),
            }
        }
        self.update();
        self.fit_loss()
    }

    /// Position along segment `index` of the track-length coordinate `lambda`
    pub fn segment_lambda(&self, lambda: f64, index: usize) -> f64 {
        let before: f64 = self.segments.iter().take(index).map(TrackSegment3D::length).sum();
        (lambda - before).max(0.0)
    }

    /// Charge within the first `lambda` mm of the track, following the
    /// segments in order
    pub fn integrated_charge(&self, lambda: f64) -> f64 {
        let mut charge = 0.0;
        let mut past   = 0.0;
        for segment in &self.segments {
            let segment_lambda = (lambda - past).min(segment.length());
            charge += segment.integrated_charge(segment_lambda);
            past   += segment.length();
            if segment_lambda < segment.length() { break }
        }
        charge
    }

    /// Overrides the profile derived from the segments
    pub fn set_charge_profile(&mut self, profile: Histo1D) { self.charge_profile = Some(profile); }

    /// Charge per unit length along the track, with the segments laid end to
    /// end in insertion order
    pub fn charge_profile(&self) -> Histo1D {
        if let Some(profile) = &self.charge_profile { return profile.clone() }
        match self.segments.as_slice() {
            []        => Histo1D::new(Axis::new(1, 0.0, 1.0)),
            [segment] => segment.charge_profile(),
            segments  => {
                let total = self.length.max(1.0);
                let mut merged = Histo1D::new(Axis::new(MERGED_PROFILE_BINS, -0.2 * total, 1.2 * total));
                let mut offset = 0.0;
                for segment in segments {
                    let profile = segment.charge_profile();
                    let width   = profile.axis().width();
                    for (x, value) in profile.points().filter(|&(_, v)| v > 0.0) {
                        merged.fill(x + offset, value * width);
                    }
                    offset += segment.length();
                }
                let width = merged.axis().width();
                merged.scale(1.0 / width);
                merged
            }
        }
    }

    /// Split the segment with the largest chi2 at `fraction` of its length.
    /// Fractions outside `[0, 1]` split in the middle.
    pub fn split_worse_chi2_segment(&mut self, fraction: f64) {
        self.update();
        if self.segments.is_empty() { return }
        let fraction = if (0.0..=1.0).contains(&fraction) { fraction } else { 0.5 };
        let mut worst = (0, 0.0);
        for (i, &chi2) in self.segment_chi2.iter().enumerate() {
            if chi2 > worst.1 { worst = (i, chi2); }
        }
        self.split_segment(worst.0, fraction);
    }

    pub fn split_segment(&mut self, index: usize, fraction: f64) {
        let Some(segment) = self.segments.get_mut(index) else { return };
        let step  = segment.length() * segment.tangent();
        let start = segment.start();
        segment.set_start_end(start, start + fraction * step);
        let mut second = segment.clone();
        let middle = segment.end();
        second.set_start_end(middle, middle + (1.0 - fraction) * step);
        self.segments.insert(index + 1, second);
        self.update();
    }

    /// Extend the outer ends of the track up to the chamber boundary.
    /// Tracks shorter than 1 mm are left alone.
    pub fn extend_to_chamber_range(&mut self, xy_range: (Range, Range), z_range: Range) {
        if self.length < 1.0 || self.segments.is_empty() { return }
        let bounds = [xy_range.0, xy_range.1, z_range];
        let last = self.segments.len() - 1;

        let first = &mut self.segments[0];
        let (start, end, t) = (first.start(), first.end(), first.tangent());
        let back = exit_lambda(start, -t, &bounds);
        first.set_start_end(start - back * t, end);

        let last = &mut self.segments[last];
        let (start, end, t) = (last.start(), last.end(), last.tangent());
        let forward = exit_lambda(end, t, &bounds);
        last.set_start_end(start, end + forward * t);
        self.update();
    }

    /// Move the start of the first segment and the end of the last one onto
    /// the drift range limits. Refused (returns `false`) when either segment
    /// is nearly perpendicular to the drift axis.
    pub fn extend_to_z_range(&mut self, z_range: Range) -> bool {
        let (Some(first), Some(last)) = (self.segments.first(), self.segments.last()) else { return false };
        if first.tangent().z.abs() < 1e-3 || last.tangent().z.abs() < 1e-3 { return false }

        let limits = |t: Vec3| if t.z > 0.0 { (z_range.min, z_range.max) } else { (z_range.max, z_range.min) };
        let last_index = self.segments.len() - 1;

        let first = &mut self.segments[0];
        let (behind, _) = limits(first.tangent());
        let start = first.start() + first.lambda_at_z(behind) * first.tangent();
        let end   = first.end();
        first.set_start_end(start, end);

        let last = &mut self.segments[last_index];
        let (_, ahead) = limits(last.tangent());
        let start = last.start();
        let end   = start + last.lambda_at_z(ahead) * last.tangent();
        last.set_start_end(start, end);
        self.update();
        true
    }

    /// Move the outer ends of the track to the outermost non-empty bins of
    /// the charge profiles of the end segments. Ends may move outwards when
    /// the hits run past them.
    pub fn shrink_to_hits(&mut self) {
        if self.length < 1.0 || self.segments.is_empty() { return }
        let last_index = self.segments.len() - 1;

        let edges = |profile: &Histo1D| -> Option<(usize, usize)> {
            let bins = 0..=profile.n_bins() - 1;
            Some((profile.first_bin_above(0.0, bins.clone())?, profile.last_bin_above(0.0, bins)?))
        };
        let first_profile = self.segments[0].charge_profile();
        let last_profile  = self.segments[last_index].charge_profile();
        let (Some((mut start_bin, _)), Some((_, mut end_bin))) = (edges(&first_profile), edges(&last_profile)) else { return };
        if last_index == 0 && end_bin < start_bin + 2 {
            start_bin = start_bin.saturating_sub(1);
            end_bin  += 1;
        }
        let lambda_start = first_profile.axis().centre(start_bin).max(0.0);
        let lambda_end   = last_profile .axis().centre(end_bin).max(0.0);

        if last_index == 0 {
            let segment = &mut self.segments[0];
            let (start, t) = (segment.start(), segment.tangent());
            segment.set_start_end(start + lambda_start * t, start + lambda_end * t);
        } else {
            let first = &mut self.segments[0];
            let (start, end, t) = (first.start(), first.end(), first.tangent());
            first.set_start_end(start + lambda_start * t, end);
            let last = &mut self.segments[last_index];
            let (start, t) = (last.start(), last.tangent());
            last.set_start_end(start, start + lambda_end * t);
        }
        self.update();
    }

    /// Drop segments without rec-hits, or far from all of them
    pub fn remove_empty_segments(&mut self) {
        self.segments.retain(|s| {
            let empty = s.rec_hits().iter().all(Vec::is_empty);
            !(empty || s.rec_hit_chi2(None) > DUMMY_LOSS)
        });
        self.update();
    }
}

/// Distance from `point` along `dir` to the boundary of the box `bounds`
/// (x, y, z ranges); zero when already outside
fn exit_lambda(point: Vec3, dir: Vec3, bounds: &[Range; 3]) -> f64 {
    let lambda = (0..3)
        .filter(|&k| dir[k].abs() > 1e-9)
        .map(|k| {
            let limit = if dir[k] > 0.0 { bounds[k].max } else { bounds[k].min };
            (limit - point[k]) / dir[k]
        })
        .fold(f64::INFINITY, f64::min);
    if lambda.is_finite() { lambda.max(0.0) } else { 0.0 }
}

impl fmt::Display for Track3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "number of segments: {}", self.segments.len())?;
        for segment in &self.segments {
            writeln!(f, "{segment}")?;
        }
        writeln!(f, "total length [mm]: {:.2}", self.length)?;
        writeln!(f, "total charge: {:.1}", self.integrated_charge(self.length))?;
        write!  (f, "hit fit loss: {:.4}  hypothesis fit loss: {:.4}", self.chi2(), self.hypothesis_fit_chi2)
    }
}
