//! Per-event physics summaries of reconstructed tracks.

use std::collections::HashMap;

use crate::builder::AlphaPolicy;
use crate::ionrange::IonRangeCalculator;
use crate::segment3d::TrackSegment3D;
use crate::track::Track3D;
use crate::types::{Pid, Vec3};

/// Clock tick of the event timestamps, in seconds
pub const TIMESTAMP_TICK_S: f64 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Empty,
    Dot,
    /// Number of segments sharing the vertex
    Prongs(usize),
}

impl Topology {
    pub fn of(track: &Track3D) -> Self {
        match track.segments() {
            []                                  => Topology::Empty,
            [only] if only.pid() == Pid::Dot    => Topology::Dot,
            segments                            => Topology::Prongs(segments.len()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentSummary {
    pub pid        : Pid,
    pub end        : Vec3,
    /// mm
    pub length     : f64,
    /// Detector frame
    pub phi_det    : f64,
    pub cos_theta_det: f64,
    /// Beam frame: polar angle with respect to the beam, azimuth from the
    /// horizontal
    pub phi_beam   : f64,
    pub cos_theta_beam: f64,
    /// MeV, from the range of the particle; `None` for unidentified segments
    pub energy     : Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackSummary {
    pub event_id       : u64,
    pub timestamp      : u64,
    /// Seconds since the previous event of the same topology
    pub delta_timestamp: Option<f64>,
    pub topology       : Topology,
    pub vertex         : Vec3,
    /// Alpha candidates first, as given by the alpha policy
    pub segments       : Vec<SegmentSummary>,
    pub chi2           : f64,
    pub hypothesis_chi2: f64,
}

impl TrackSummary {
    pub fn n_prongs(&self) -> usize { self.segments.len() }

    /// Sum of the segment energies, if all segments are identified
    pub fn total_energy(&self) -> Option<f64> { self.segments.iter().map(|s| s.energy).sum() }
}

/// Delta-timestamp bookkeeping, one clock per topology. Deltas follow the
/// order in which events are recorded; the first event of each topology has
/// none.
#[derive(Clone, Debug, Default)]
pub struct TimestampTracker {
    last: HashMap<Topology, u64>,
}

impl TimestampTracker {

    pub fn new() -> Self { Self::default() }

    /// Seconds since the previous event of `topology`, negative when events
    /// arrive out of time order
    pub fn record(&mut self, topology: Topology, timestamp: u64) -> Option<f64> {
        let previous = self.last.insert(topology, timestamp)?;
        Some((timestamp as f64 - previous as f64) * TIMESTAMP_TICK_S)
    }

    pub fn reset(&mut self) { self.last.clear(); }
}

/// Session turning reconstructed tracks into summaries
pub struct TrackAnalysis {
    ranges    : IonRangeCalculator,
    beam      : Vec3,
    policy    : AlphaPolicy,
    timestamps: TimestampTracker,
}

impl TrackAnalysis {

    pub fn new(ranges: IonRangeCalculator, beam_direction: Vec3, policy: AlphaPolicy) -> Self {
        let beam = beam_direction.try_normalize(1e-12).unwrap_or_else(|| -Vec3::x());
        Self { ranges, beam, policy, timestamps: TimestampTracker::new() }
    }

    pub fn ranges(&self) -> &IonRangeCalculator { &self.ranges }

    pub fn summarise(&mut self, track: &Track3D, event_id: u64, timestamp: u64) -> TrackSummary {
        let topology = Topology::of(track);
        let delta_timestamp = self.timestamps.record(topology, timestamp);
        let ordered = order_segments(track.segments(), self.policy);
        let vertex  = ordered.first().map_or(Vec3::zeros(), |s| s.start());
        TrackSummary {
            event_id,
            timestamp,
            delta_timestamp,
            topology,
            vertex,
            segments       : ordered.iter().map(|s| self.segment_summary(s)).collect(),
            chi2           : track.chi2(),
            hypothesis_chi2: track.hypothesis_fit_chi2(),
        }
    }

    fn segment_summary(&self, segment: &TrackSegment3D) -> SegmentSummary {
        let t = segment.tangent();
        let energy = match segment.pid() {
            Pid::Alpha | Pid::C12 | Pid::C14 => self.ranges.energy_mev(segment.pid(), segment.length()).ok(),
            _ => None,
        };
        // Beam frame: z along the beam, horizontal axis from the detector y axis
        let vertical = Vec3::z();
        let side     = self.beam.cross(&vertical);
        SegmentSummary {
            pid           : segment.pid(),
            end           : segment.end(),
            length        : segment.length(),
            phi_det       : segment.phi(),
            cos_theta_det : segment.theta().cos(),
            phi_beam      : t.dot(&vertical).atan2(t.dot(&side)),
            cos_theta_beam: t.dot(&self.beam),
            energy,
        }
    }
}

/// Longest first under `LongestIsAlpha`; alphas first (each group longest
/// first) under `FromDedx`
pub fn order_segments(segments: &[TrackSegment3D], policy: AlphaPolicy) -> Vec<&TrackSegment3D> {
    let mut ordered = segments.iter().collect::<Vec<_>>();
    let by_length = |a: &&TrackSegment3D, b: &&TrackSegment3D| b.length().total_cmp(&a.length());
    match policy {
        AlphaPolicy::LongestIsAlpha => ordered.sort_by(by_length),
        AlphaPolicy::FromDedx => ordered.sort_by(|a, b| {
            (b.pid() == Pid::Alpha).cmp(&(a.pid() == Pid::Alpha)).then_with(|| by_length(a, b))
        }),
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use geometry::GeometryTPC;
    use units::{kelvin, mbar};

    use crate::ionrange::Gas;

    fn segment(start: Vec3, end: Vec3, pid: Pid) -> TrackSegment3D {
        let mut s = TrackSegment3D::new(Arc::new(GeometryTPC::default()));
        s.set_start_end(start, end);
        s.set_pid(pid);
        s
    }

    fn analysis(policy: AlphaPolicy) -> TrackAnalysis {
        let ranges = IonRangeCalculator::new(Gas::CO2, mbar(250.0), kelvin(293.15)).unwrap();
        TrackAnalysis::new(ranges, -Vec3::x(), policy)
    }

    #[test]
    fn deltas_are_per_topology() {
        let mut tracker = TimestampTracker::new();
        assert_eq!(tracker.record(Topology::Prongs(1), 1_000), None);
        assert_eq!(tracker.record(Topology::Prongs(2), 1_500), None);
        assert_float_eq!(tracker.record(Topology::Prongs(1), 3_000).unwrap(), 2e-5, r2nd <= 1e-12);
        assert_float_eq!(tracker.record(Topology::Prongs(1), 2_000).unwrap(), -1e-5, r2nd <= 1e-12);
        tracker.reset();
        assert_eq!(tracker.record(Topology::Prongs(1), 5_000), None);
    }

    #[test]
    fn two_prong_summary() {
        let vertex = Vec3::new(1.0, 2.0, 3.0);
        let mut track = Track3D::new();
        track.add_segment(segment(vertex, vertex + Vec3::new(0.0, 0.0, -10.0), Pid::C12));
        track.add_segment(segment(vertex, vertex + Vec3::new(-40.0, 0.0, 0.0), Pid::Alpha));
        let mut analysis = analysis(AlphaPolicy::LongestIsAlpha);
        let summary = analysis.summarise(&track, 11, 100);
        assert_eq!(summary.topology, Topology::Prongs(2));
        assert_eq!(summary.vertex, vertex);
        let alpha = &summary.segments[0];
        assert_eq!(alpha.pid, Pid::Alpha);
        assert_float_eq!(alpha.length, 40.0, abs <= 1e-12);
        assert_float_eq!(alpha.cos_theta_beam, 1.0, abs <= 1e-12);
        let expected = analysis.ranges().energy_mev(Pid::Alpha, 40.0).unwrap();
        assert_float_eq!(alpha.energy.unwrap(), expected, abs <= 1e-12);
        assert!(summary.total_energy().is_some());
        assert_eq!(summary.delta_timestamp, None);
    }

    #[test]
    fn dedx_ordering_puts_alphas_first() {
        let v = Vec3::zeros();
        let segments = [
            segment(v, Vec3::new(30.0, 0.0, 0.0), Pid::C12),
            segment(v, Vec3::new(0.0, 10.0, 0.0), Pid::Alpha),
        ];
        let ordered = order_segments(&segments, AlphaPolicy::FromDedx);
        assert_eq!(ordered.iter().map(|s| s.pid()).collect::<Vec<_>>(), vec![Pid::Alpha, Pid::C12]);
        let ordered = order_segments(&segments, AlphaPolicy::LongestIsAlpha);
        assert_eq!(ordered[0].pid(), Pid::C12);
    }

    #[test]
    fn unidentified_segments_have_no_energy() {
        let mut track = Track3D::new();
        track.add_segment(segment(Vec3::zeros(), Vec3::new(5.0, 5.0, 5.0), Pid::Unknown));
        let summary = analysis(AlphaPolicy::LongestIsAlpha).summarise(&track, 0, 0);
        assert_eq!(summary.segments[0].energy, None);
        assert_eq!(summary.total_energy(), None);
        assert_eq!(Topology::of(&Track3D::new()), Topology::Empty);
    }
}
