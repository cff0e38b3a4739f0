use nalgebra::{Vector2, Vector3};
use thiserror::Error;

use units::{Angle, Frequency, Length, Time, Velocity};
use units::{cm_us, degree, mhz, mm, mm_, radian_, us, us_, drift_per_cell_mm};

use crate::Projection;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("number of {0} must not be zero")]
    Empty(&'static str),

    #[error("strips of {0} and {1} are parallel")]
    Parallel(Projection, Projection),
}

/// Closed interval in mm
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self { Self { min, max } }
    pub fn width   (&self) -> f64 { self.max - self.min }
    pub fn centre  (&self) -> f64 { 0.5 * (self.max + self.min) }
    pub fn contains(&self, x: f64) -> bool { x >= self.min && x <= self.max }
}

/// Raw geometry parameters, as they come from configuration
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryParams {
    pub strip_pitch   : Length,
    pub drift_velocity: Velocity,
    pub sampling_rate : Frequency,
    pub trigger_delay : Time,
    pub n_strips      : [usize; 3],
    pub n_timecells   : usize,
    /// Direction along which strip numbers increase, for each family of strips
    pub pitch_angle   : [Angle; 3],
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            strip_pitch   : mm(1.5),
            drift_velocity: cm_us(0.646),
            sampling_rate : mhz(25.0),
            trigger_delay : us(0.0),
            n_strips      : [72, 92, 92],
            n_timecells   : 512,
            pitch_angle   : [degree(180.0), degree(60.0), degree(-60.0)],
        }
    }
}

/// Detector geometry, shared read-only by every reconstruction component.
///
/// Time positions are expressed as drift distance in mm, so the time axis of
/// each projection coincides with the detector Z axis. Strip positions are mm
/// along the strip pitch direction, with the strip plane centred on the drift
/// axis.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryTPC {
    params       : GeometryParams,
    pitch        : f64,
    cell_width   : f64,
    z_min        : f64,
    strip_dir    : [Vector2<f64>; 3],
    pitch_dir    : [Vector2<f64>; 3],
    strip_offset : [f64; 3],
}

impl Default for GeometryTPC {
    fn default() -> Self { Self::from_valid(GeometryParams::default()) }
}

impl GeometryTPC {

    pub fn new(params: GeometryParams) -> Result<Self, GeometryError> {
        fn positive(name: &'static str, value: f64) -> Result<(), GeometryError> {
            if value > 0.0 && value.is_finite() { Ok(()) }
            else { Err(GeometryError::NonPositive { name, value }) }
        }
        positive("strip pitch"   , mm_(params.strip_pitch))?;
        positive("drift velocity", units::cm_us_(params.drift_velocity))?;
        positive("sampling rate" , units::mhz_(params.sampling_rate))?;
        if params.n_timecells == 0 { return Err(GeometryError::Empty("time cells")) }
        if params.n_strips.iter().any(|&n| n == 0) { return Err(GeometryError::Empty("strips")) }
        let geometry = Self::from_valid(params);
        for a in Projection::ALL {
            for b in Projection::ALL.into_iter().filter(|b| b.index() > a.index()) {
                let cross = geometry.strip_dir[a.index()].perp(&geometry.strip_dir[b.index()]);
                if cross.abs() < 1e-6 { return Err(GeometryError::Parallel(a, b)) }
            }
        }
        Ok(geometry)
    }

    fn from_valid(params: GeometryParams) -> Self {
        let pitch      = mm_(params.strip_pitch);
        let cell_width = drift_per_cell_mm(params.drift_velocity, params.sampling_rate);
        let delay_mm   = us_(params.trigger_delay) * units::cm_us_(params.drift_velocity) * 10.0;
        let z_min      = -0.5 * params.n_timecells as f64 * cell_width + delay_mm;
        let angle      = |i: usize| radian_(params.pitch_angle[i]);
        let pitch_dir  = [0, 1, 2].map(|i| Vector2::new(angle(i).cos(), angle(i).sin()));
        // Strips run perpendicular to the pitch; orient them towards positive x
        let strip_dir  = pitch_dir.map(|p| {
            let s = Vector2::new(p.y, -p.x);
            if s.x < -1e-12 || (s.x.abs() <= 1e-12 && s.y < 0.0) { -s } else { s }
        });
        let strip_offset = params.n_strips.map(|n| -0.5 * (n as f64 - 1.0) * pitch);
        Self { params, pitch, cell_width, z_min, strip_dir, pitch_dir, strip_offset }
    }

    pub fn params           (&self) -> &GeometryParams { &self.params }
    pub fn strip_pitch_mm   (&self) -> f64 { self.pitch }
    pub fn drift_velocity   (&self) -> Velocity  { self.params.drift_velocity }
    pub fn sampling_rate    (&self) -> Frequency { self.params.sampling_rate }
    /// Drift distance covered during one sampling period
    pub fn time_bin_width_mm(&self) -> f64 { self.cell_width }
    pub fn n_timecells      (&self) -> usize { self.params.n_timecells }
    pub fn n_strips         (&self, dir: Projection) -> usize { self.params.n_strips[dir.index()] }

    pub fn strip_direction      (&self, dir: Projection) -> Vector2<f64> { self.strip_dir[dir.index()] }
    pub fn strip_pitch_direction(&self, dir: Projection) -> Vector2<f64> { self.pitch_dir[dir.index()] }
    /// Angle of the strips, in (-π/2, π/2]
    pub fn strip_phi            (&self, dir: Projection) -> f64 {
        let s = self.strip_dir[dir.index()];
        s.y.atan2(s.x)
    }

    /// Drift position of the centre of (possibly fractional) time cell `cell`
    pub fn timecell_to_pos(&self, cell: f64) -> f64 { self.z_min + (cell + 0.5) * self.cell_width }
    pub fn pos_to_timecell(&self, z: f64) -> f64 { (z - self.z_min) / self.cell_width - 0.5 }

    /// Position of the centre of (possibly fractional) strip `strip` along the pitch direction
    pub fn strip_to_pos(&self, dir: Projection, strip: f64) -> f64 {
        self.strip_offset[dir.index()] + strip * self.pitch
    }
    pub fn pos_to_strip(&self, dir: Projection, pos: f64) -> f64 {
        (pos - self.strip_offset[dir.index()]) / self.pitch
    }

    /// Position of a point in the readout plane, along the pitch direction of `dir`
    pub fn cartesian_to_strip_pos(&self, xy: Vector2<f64>, dir: Projection) -> f64 {
        xy.dot(&self.pitch_dir[dir.index()])
    }

    /// Bin edges of the drift axis
    pub fn z_range(&self) -> Range {
        Range::new(self.z_min, self.z_min + self.params.n_timecells as f64 * self.cell_width)
    }

    /// Bin edges of the strip axis of `dir`
    pub fn strip_range(&self, dir: Projection) -> Range {
        let half = 0.5 * self.pitch;
        let n    = self.n_strips(dir) as f64;
        Range::new(self.strip_to_pos(dir, 0.0) - half, self.strip_to_pos(dir, n - 1.0) + half)
    }

    /// Centred square spanned by the narrowest strip plane
    pub fn xy_range(&self) -> (Range, Range) {
        let half = Projection::ALL.iter()
            .map(|&dir| 0.5 * self.strip_range(dir).width())
            .fold(f64::INFINITY, f64::min);
        (Range::new(-half, half), Range::new(-half, half))
    }

    pub fn is_inside(&self, p: &Vector3<f64>) -> bool {
        let xy = p.xy();
        self.z_range().contains(p.z) &&
            Projection::ALL.iter().all(|&dir| self.strip_range(dir).contains(self.cartesian_to_strip_pos(xy, dir)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    #[rstest(/**/ dir         , x   ,  y  , expected,
             case(Projection::U, 1.0, 0.0, -1.0),
             case(Projection::U, 0.0, 1.0,  0.0),
             case(Projection::V, 0.0, 1.0,  3f64.sqrt() / 2.0),
             case(Projection::W, 0.0, 1.0, -3f64.sqrt() / 2.0),
             case(Projection::V, 1.0, 0.0,  0.5),
             case(Projection::W, 1.0, 0.0,  0.5),
    )]
    fn strip_positions(dir: Projection, x: f64, y: f64, expected: f64) {
        let geometry = GeometryTPC::default();
        let pos = geometry.cartesian_to_strip_pos(Vector2::new(x, y), dir);
        assert_float_eq!(pos, expected, abs <= 1e-12);
    }

    #[rstest(/**/ dir         , degrees,
             case(Projection::U,   90.0),
             case(Projection::V,  -30.0),
             case(Projection::W,   30.0),
    )]
    fn strip_angles(dir: Projection, degrees: f64) {
        let geometry = GeometryTPC::default();
        assert_float_eq!(geometry.strip_phi(dir).to_degrees(), degrees, abs <= 1e-9);
    }

    #[test]
    fn pitch_directions_sum_to_zero() {
        let geometry = GeometryTPC::default();
        let sum: Vector2<f64> = Projection::ALL.iter().map(|&d| geometry.strip_pitch_direction(d)).sum();
        assert_float_eq!(sum.norm(), 0.0, abs <= 1e-12);
    }

    #[test]
    fn timecell_round_trip() {
        let geometry = GeometryTPC::default();
        for cell in [0.0, 17.25, 511.0] {
            assert_float_eq!(geometry.pos_to_timecell(geometry.timecell_to_pos(cell)), cell, abs <= 1e-9);
        }
        let z = geometry.z_range();
        assert_float_eq!(z.centre(), 0.0, abs <= 1e-9);
        assert_float_eq!(z.width(), 512.0 * geometry.time_bin_width_mm(), r2nd <= 1e-12);
    }

    #[test]
    fn strip_plane_is_centred() {
        let geometry = GeometryTPC::default();
        for dir in Projection::ALL {
            assert_float_eq!(geometry.strip_range(dir).centre(), 0.0, abs <= 1e-9);
        }
        assert!( geometry.is_inside(&Vector3::new(  0.0, 0.0, 0.0)));
        assert!(!geometry.is_inside(&Vector3::new(500.0, 0.0, 0.0)));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let mut params = GeometryParams::default();
        params.strip_pitch = mm(0.0);
        assert!(matches!(GeometryTPC::new(params), Err(GeometryError::NonPositive { .. })));

        let mut params = GeometryParams::default();
        params.n_timecells = 0;
        assert_eq!(GeometryTPC::new(params), Err(GeometryError::Empty("time cells")));

        let mut params = GeometryParams::default();
        params.pitch_angle[2] = params.pitch_angle[1];
        assert_eq!(GeometryTPC::new(params), Err(GeometryError::Parallel(Projection::V, Projection::W)));
    }
}
