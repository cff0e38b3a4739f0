//! Toy Monte Carlo: straight prongs from a common vertex, ionising along
//! their path and drifting onto the three strip planes.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, UnitSphere};
use serde::Deserialize;
use statrs::function::erf::erf;

use geometry::{GeometryTPC, Projection};
use units::{kelvin, mbar};

use crate::curve::{BraggKleeman, Curve};
use crate::error::{ConfigError, Result};
use crate::event::{ChargeSource, EventCharges};
use crate::ionrange::{Gas, IonRangeCalculator};
use crate::types::{Pid, Vec3};

/// Ionisation density along a prong
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum DepositShape {
    /// Rising towards the stopping point
    #[default]
    Bragg,
    Uniform,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToyProng {
    pub pid      : Pid,
    /// Unit vector
    pub direction: Vec3,
    /// mm
    pub length   : f64,
    /// MeV deposited over the whole length
    pub energy   : f64,
    pub shape    : DepositShape,
}

/// True topology of a toy event
#[derive(Clone, Debug, PartialEq)]
pub struct ToyEvent {
    pub vertex: Vec3,
    pub prongs: Vec<ToyProng>,
}

impl ToyEvent {

    pub fn new(vertex: Vec3) -> Self { Self { vertex, prongs: vec![] } }

    /// Uniformly ionising alpha from `start` to `end`
    pub fn single(start: Vec3, end: Vec3, energy: f64) -> Self {
        Self::new(start).with_prong(Pid::Alpha, end, energy, DepositShape::Uniform)
    }

    /// Add a prong running from the vertex to `end`
    pub fn with_prong(mut self, pid: Pid, end: Vec3, energy: f64, shape: DepositShape) -> Self {
        let delta  = end - self.vertex;
        let length = delta.norm();
        let direction = if length > 0.0 { delta / length } else { Vec3::zeros() };
        self.prongs.push(ToyProng { pid, direction, length, energy, shape });
        self
    }

    pub fn end(&self, prong: usize) -> Option<Vec3> {
        self.prongs.get(prong).map(|p| self.vertex + p.length * p.direction)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToyParams {
    /// ADC counts per keV, in each projection
    pub gain         : f64,
    /// Transverse and longitudinal spread of the drifting charge, mm
    pub diffusion    : f64,
    /// Standard deviation of the electronic noise, ADC counts
    pub noise        : f64,
    /// Sampling step along the prongs, mm
    pub step         : f64,
    pub gas          : Gas,
    pub pressure     : f64, // mbar
    pub temperature  : f64, // K
    /// Alpha kinetic energy interval of random events, MeV
    pub alpha_energy : (f64, f64),
    pub max_prongs   : usize,
    /// Random vertices lie within this distance (mm) of the chamber centre
    /// in each coordinate
    pub vertex_spread: f64,
}

impl Default for ToyParams {
    fn default() -> Self {
        Self {
            gain         : 3.0,
            diffusion    : 0.7,
            noise        : 0.0,
            step         : 0.1,
            gas          : Gas::CO2,
            pressure     : 250.0,
            temperature  : 293.15,
            alpha_energy : (1.5, 3.0),
            max_prongs   : 3,
            vertex_spread: 15.0,
        }
    }
}

pub struct ToyGenerator {
    geometry: Arc<GeometryTPC>,
    params  : ToyParams,
    ranges  : IonRangeCalculator,
}

impl ToyGenerator {

    pub fn new(geometry: Arc<GeometryTPC>, params: ToyParams) -> Result<Self> {
        if !(params.step > 0.0) { return Err(ConfigError::OutOfRange { what: "toy sampling step [mm]", value: params.step }) }
        if params.diffusion < 0.0 { return Err(ConfigError::OutOfRange { what: "toy diffusion [mm]", value: params.diffusion }) }
        if params.noise < 0.0 { return Err(ConfigError::OutOfRange { what: "toy noise [ADC]", value: params.noise }) }
        let (e_lo, e_hi) = params.alpha_energy;
        if !(e_lo > 0.0 && e_hi >= e_lo) { return Err(ConfigError::OutOfRange { what: "toy alpha energy [MeV]", value: e_lo }) }
        let ranges = IonRangeCalculator::new(params.gas, mbar(params.pressure), kelvin(params.temperature))?;
        ranges.range_mm(Pid::Alpha, e_hi)?;
        ranges.range_mm(Pid::C12, e_hi)?;
        Ok(Self { geometry, params, ranges })
    }

    pub fn params(&self) -> &ToyParams { &self.params }

    /// Generator seeded for reproducible events
    pub fn rng(seed: u64) -> StdRng { StdRng::seed_from_u64(seed) }

    /// Random one-, two- or three-prong event. Two prongs are an alpha and a
    /// carbon nucleus back to back; three prongs are alphas at 120° in a
    /// random plane. Momentum balance fixes the partner energies.
    pub fn random_event<R: Rng>(&self, rng: &mut R) -> ToyEvent {
        let spread = self.params.vertex_spread;
        let vertex = Vec3::new(rng.gen_range(-spread..=spread), rng.gen_range(-spread..=spread), rng.gen_range(-spread..=spread));
        let (e_lo, e_hi) = self.params.alpha_energy;
        let energy = rng.gen_range(e_lo..=e_hi);
        let [x, y, z]: [f64; 3] = UnitSphere.sample(rng);
        let d = Vec3::new(x, y, z);
        let n = rng.gen_range(1..=self.params.max_prongs.clamp(1, 3));

        let mut event = ToyEvent::new(vertex);
        let add = |event: ToyEvent, pid: Pid, direction: Vec3, energy: f64| {
            let length = self.ranges.range_mm(pid, energy).unwrap_or(0.0);
            event.with_prong(pid, vertex + length * direction, energy, DepositShape::Bragg)
        };
        match n {
            1 => event = add(event, Pid::Alpha, d, energy),
            2 => {
                let mass_ratio = IonRangeCalculator::mass_mev(Pid::Alpha).unwrap_or(1.0) /
                                 IonRangeCalculator::mass_mev(Pid::C12  ).unwrap_or(1.0);
                event = add(event, Pid::Alpha,  d, energy);
                event = add(event, Pid::C12  , -d, energy * mass_ratio);
            }
            _ => {
                // Any vector not parallel to d gives the plane
                let helper = if d.x.abs() < 0.9 { Vec3::x() } else { Vec3::y() };
                let u = d.cross(&helper).normalize();
                let v = d.cross(&u);
                for k in 0..3 {
                    let angle = k as f64 * std::f64::consts::TAU / 3.0;
                    event = add(event, Pid::Alpha, angle.cos() * u + angle.sin() * v, energy);
                }
            }
        }
        event
    }

    /// dE/dx (MeV/mm) against distance from the vertex
    fn dedx_curve(prong: &ToyProng) -> Option<Curve> {
        let (exponent, softening): (f64, f64) = match prong.pid {
            Pid::C12 | Pid::C14 => (1.3, 0.5),
            _                   => (1.75, 1.0),
        };
        BraggKleeman::new(prong.energy, prong.length, exponent, softening.min(0.5 * prong.length))
            .dedx_curve(200)
            .ok()
    }

    /// Charge map of `event`, tagged with entry number `id`
    pub fn deposit<R: Rng>(&self, event: &ToyEvent, id: u64, rng: &mut R) -> EventCharges {
        let mut charges = EventCharges::new(id, id * 1_000_000);
        for prong in &event.prongs {
            if prong.length <= 0.0 { continue }
            let n_steps = (prong.length / self.params.step).ceil().max(1.0) as usize;
            let h = prong.length / n_steps as f64;
            let bragg = match prong.shape {
                DepositShape::Bragg   => Self::dedx_curve(prong),
                DepositShape::Uniform => None,
            };
            for k in 0..n_steps {
                let (x0, x1) = (k as f64 * h, (k + 1) as f64 * h);
                let energy = match &bragg {
                    Some(curve) => curve.integrate(x0, x1),
                    None        => prong.energy * h / prong.length,
                };
                let point = event.vertex + (0.5 * (x0 + x1)) * prong.direction;
                self.deposit_point(&mut charges, point, 1000.0 * energy * self.params.gain);
            }
        }
        if self.params.noise > 0.0 { self.add_noise(&mut charges, rng); }
        log::debug!("toy event {id}: {} prong(s), {} samples", event.prongs.len(), charges.len());
        charges
    }

    fn deposit_point(&self, charges: &mut EventCharges, point: Vec3, charge: f64) {
        let geometry = &self.geometry;
        let sigma    = self.params.diffusion;
        let cells = gaussian_shares(geometry.pos_to_timecell(point.z), sigma / geometry.time_bin_width_mm(), geometry.n_timecells());
        for dir in Projection::ALL {
            let s = geometry.pos_to_strip(dir, geometry.cartesian_to_strip_pos(point.xy(), dir));
            let strips = gaussian_shares(s, sigma / geometry.strip_pitch_mm(), geometry.n_strips(dir));
            for &(strip, fs) in &strips {
                for &(cell, fc) in &cells {
                    charges.add(dir, strip, cell, charge * fs * fc);
                }
            }
        }
    }

    /// Gaussian noise on every sample within 5 bins of the deposited charge,
    /// clipped at zero like pedestal-subtracted data
    fn add_noise<R: Rng>(&self, charges: &mut EventCharges, rng: &mut R) {
        let Ok(normal) = Normal::new(0.0, self.params.noise) else { return };
        let margin = 5;
        for dir in Projection::ALL {
            let keys = charges.projection(dir).map(|(k, _)| *k).collect::<Vec<_>>();
            let (Some(s_lo), Some(s_hi)) = (keys.iter().map(|k| k.strip).min(), keys.iter().map(|k| k.strip).max()) else { continue };
            let (Some(c_lo), Some(c_hi)) = (keys.iter().map(|k| k.cell ).min(), keys.iter().map(|k| k.cell ).max()) else { continue };
            let s_hi = (s_hi + margin).min(self.geometry.n_strips(dir) - 1);
            let c_hi = (c_hi + margin).min(self.geometry.n_timecells() - 1);
            for strip in s_lo.saturating_sub(margin)..=s_hi {
                for cell in c_lo.saturating_sub(margin)..=c_hi {
                    charges.add(dir, strip, cell, normal.sample(rng));
                    let value = charges.charge_at(dir, strip, cell);
                    if value < 0.0 { charges.insert(dir, strip, cell, 0.0); }
                }
            }
        }
    }
}

/// Fractions of a unit Gaussian charge centred at bin coordinate `centre`
/// (bin `i` spans `[i - 0.5, i + 0.5]`) falling into each of `n` bins.
/// A zero width puts everything into the nearest bin.
pub fn gaussian_shares(centre: f64, sigma: f64, n: usize) -> Vec<(usize, f64)> {
    if sigma <= 0.0 {
        let bin = centre.round();
        return if bin >= 0.0 && (bin as usize) < n { vec![(bin as usize, 1.0)] } else { vec![] }
    }
    let cdf = |x: f64| 0.5 * (1.0 + erf((x - centre) / (sigma * std::f64::consts::SQRT_2)));
    let lo = (centre - 4.0 * sigma).floor().max(0.0) as usize;
    let hi = (centre + 4.0 * sigma).ceil();
    if hi < 0.0 { return vec![] }
    let hi = (hi as usize).min(n.saturating_sub(1));
    (lo..=hi)
        .map(|i| (i, cdf(i as f64 + 0.5) - cdf(i as f64 - 0.5)))
        .filter(|&(_, share)| share > 1e-6)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;

    fn generator(params: ToyParams) -> ToyGenerator {
        ToyGenerator::new(Arc::new(GeometryTPC::default()), params).unwrap()
    }

    #[rstest(/**/ centre, sigma, total,
             case(50.0  , 1.0  , 1.0  ),
             case(50.3  , 0.0  , 1.0  ),
             case( 0.0  , 2.0  , 0.599),  // half of it below bin 0
             case(-20.0 , 1.0  , 0.0  ),
    )]
    fn shares(centre: f64, sigma: f64, total: f64) {
        let sum: f64 = gaussian_shares(centre, sigma, 100).iter().map(|(_, s)| s).sum();
        assert_float_eq!(sum, total, abs <= 1e-3);
    }

    #[test]
    fn deposit_conserves_charge() {
        let toy   = generator(ToyParams::default());
        let event = ToyEvent::single(Vec3::new(-10.0, 5.0, -20.0), Vec3::new(15.0, -5.0, 10.0), 2.0);
        let charges = toy.deposit(&event, 3, &mut ToyGenerator::rng(1));
        assert_eq!(charges.id(), 3);
        for dir in Projection::ALL {
            assert_float_eq!(charges.total_charge(Some(dir)), 2000.0 * 3.0, r2nd <= 1e-3);
        }
    }

    #[test]
    fn bragg_deposit_peaks_near_the_end() {
        let toy = generator(ToyParams { diffusion: 0.0, ..ToyParams::default() });
        let start = Vec3::new(0.0, 0.0, -30.0);
        let event = ToyEvent::new(start).with_prong(Pid::Alpha, Vec3::new(0.0, 0.0, 30.0), 3.0, DepositShape::Bragg);
        let charges = toy.deposit(&event, 0, &mut ToyGenerator::rng(1));
        let geometry = GeometryTPC::default();
        let cell  = |z: f64| geometry.pos_to_timecell(z).round() as usize;
        let strip = geometry.pos_to_strip(Projection::U, 0.0).round() as usize;
        let early = charges.charge_at(Projection::U, strip, cell(-20.0));
        let late  = charges.charge_at(Projection::U, strip, cell( 28.0));
        assert!(late > 2.0 * early, "late {late} early {early}");
        assert_float_eq!(charges.total_charge(Some(Projection::U)), 9000.0, r2nd <= 3e-2);
    }

    #[test]
    fn random_events_balance_momentum() {
        let toy = generator(ToyParams::default());
        let mut rng = ToyGenerator::rng(7);
        for _ in 0..20 {
            let event = toy.random_event(&mut rng);
            assert!((1..=3).contains(&event.prongs.len()));
            for p in &event.prongs { assert!(p.length > 0.0); }
            // A lone alpha carries the beam momentum
            if event.prongs.len() < 2 { continue }
            let momentum: Vec3 = event.prongs.iter()
                .map(|p| (2.0 * IonRangeCalculator::mass_mev(p.pid).unwrap() * p.energy).sqrt() * p.direction)
                .sum();
            assert!(momentum.norm() < 1e-6, "{} prongs, |p| = {}", event.prongs.len(), momentum.norm());
        }
    }

    #[test]
    fn noise_never_goes_negative() {
        let toy   = generator(ToyParams { noise: 5.0, ..ToyParams::default() });
        let event = ToyEvent::single(Vec3::new(0.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0), 1.0);
        let charges = toy.deposit(&event, 0, &mut ToyGenerator::rng(3));
        assert!(charges.charge_map_view().values().all(|&q| q >= 0.0));
    }

    #[test]
    fn invalid_parameters() {
        let geometry = Arc::new(GeometryTPC::default());
        assert!(ToyGenerator::new(geometry.clone(), ToyParams { step: 0.0, ..ToyParams::default() }).is_err());
        assert!(ToyGenerator::new(geometry, ToyParams { pressure: -1.0, ..ToyParams::default() }).is_err());
    }
}
