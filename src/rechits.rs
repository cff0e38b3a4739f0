//! Conversion of raw (time, strip) charge maps into rec-hits.
//!
//! The raw map is first reduced to the connected cluster around its maximum.
//! Each strip row of the cluster is then fitted in time with a single
//! Gaussian pulse; rows where a pulse describes the data clearly better than
//! a flat baseline contribute one hit. When this recovers too little of the
//! cluster charge, the same procedure is repeated along the strip axis.

use serde::Deserialize;

use crate::histogram::{Histo1D, Histo2D};
use crate::minimize::{Minimizer, Parameter};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecHitParams {
    /// Minimum peak height of a 1-D profile worth fitting
    pub max_value_thr          : f64,
    /// Minimum charge inside the fit window
    pub window_integral_thr    : f64,
    /// Half width, in bins, of the window searched around the peak
    pub projection_1d_half_size: usize,
    pub empty_bin_threshold    : f64,
    /// Minimum 3×3 neighbourhood charge for a bin to grow the cluster
    pub kernel_sum_threshold   : f64,
    /// Below this rec-hit/cluster charge ratio, strip-profile hits are added
    pub strip_fallback_ratio   : f64,
    /// Rec-hits below this fraction of the largest one are dropped
    pub clean_fraction         : f64,
    /// A pulse is accepted when MSE(pulse) / MSE(baseline) is below this
    pub noise_mse_ratio        : f64,
}

impl Default for RecHitParams {
    fn default() -> Self {
        Self {
            max_value_thr          :  20.0,
            window_integral_thr    :  40.0,
            projection_1d_half_size:  10,
            empty_bin_threshold    :   1.0,
            kernel_sum_threshold   : 150.0,
            strip_fallback_ratio   :   0.2,
            clean_fraction         :   0.1,
            noise_mse_ratio        :   0.9,
        }
    }
}

/// Outcome of fitting one 1-D profile
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProfileFit {
    /// Below thresholds: not fitted
    Empty,
    /// Flat baseline describes the window best
    Noise { level: f64 },
    /// Single Gaussian pulse
    Hit { amplitude: f64, mean: f64, sigma: f64 },
}

impl ProfileFit {
    /// Charge carried by a pulse, in units of the profile's content
    pub fn charge(&self, bin_width: f64) -> f64 {
        match *self {
            ProfileFit::Hit { amplitude, sigma, .. } => amplitude * sigma * std::f64::consts::TAU.sqrt() / bin_width,
            _ => 0.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecHitBuilder {
    params   : RecHitParams,
    minimizer: Minimizer,
}

impl RecHitBuilder {

    pub fn new(params: RecHitParams) -> Self { Self { params, minimizer: Minimizer::new(2_000, 1e-6) } }

    pub fn params(&self) -> &RecHitParams { &self.params }

    /// Rec-hit histogram with the same binning as `raw`. An empty or pure
    /// noise input gives an empty result.
    pub fn make_rec_hits(&self, raw: &Histo2D) -> Histo2D {
        let mut rec_hits = raw.zeroed();
        let cluster = self.make_clean_cluster(raw);
        self.add_time_profile_hits(&cluster, &mut rec_hits);
        let cluster_sum = raw.integral();
        if cluster_sum > 0.0 && rec_hits.integral() / cluster_sum < self.params.strip_fallback_ratio {
            log::debug!("rec-hits hold {:.3} of raw charge: adding strip-profile hits",
                        rec_hits.integral() / cluster_sum);
            self.add_strip_profile_hits(raw, &mut rec_hits);
        }
        self.clean_rec_hits(&mut rec_hits);
        rec_hits
    }

    /// Fit the time profile of every strip row
    pub fn add_time_profile_hits(&self, charges: &Histo2D, rec_hits: &mut Histo2D) {
        let width  = charges.x_axis().width();
        let sigma0 = 2.0 * width;
        for iy in 0..charges.y_axis().n() {
            let fit = self.fit_1d_projection(&charges.slice_x(iy), sigma0);
            if let ProfileFit::Hit { mean, .. } = fit {
                rec_hits.fill(mean, charges.y_axis().centre(iy), fit.charge(width));
            }
        }
    }

    /// Fit the strip profile of every time slice
    pub fn add_strip_profile_hits(&self, charges: &Histo2D, rec_hits: &mut Histo2D) {
        let width  = charges.y_axis().width();
        let sigma0 = width;
        for ix in 0..charges.x_axis().n() {
            let fit = self.fit_1d_projection(&charges.slice_y(ix), sigma0);
            if let ProfileFit::Hit { mean, .. } = fit {
                rec_hits.fill(charges.x_axis().centre(ix), mean, fit.charge(width));
            }
        }
    }

    pub fn fit_1d_projection(&self, profile: &Histo1D, sigma0: f64) -> ProfileFit {
        let p      = &self.params;
        let last   = profile.n_bins() - 1;
        let peak   = profile.max_bin();
        let max    = profile.value(peak);
        let search = (peak.saturating_sub(p.projection_1d_half_size), (peak + p.projection_1d_half_size).min(last));

        let low  = profile.first_bin_above(max / 4.0, search.0..=peak).unwrap_or(search.0);
        let high = profile.last_bin_above (max / 4.0, peak..=search.1).unwrap_or(search.1);
        let delta = (peak - low).max(high - peak);
        let (low, high) = (peak.saturating_sub(delta), (peak + delta).min(last));

        let window_integral = profile.integral_range(low..=high);
        if max < p.max_value_thr || window_integral < p.window_integral_thr { return ProfileFit::Empty }

        let axis   = profile.axis();
        let points = (low..=high).map(|i| (axis.centre(i), profile.value(i))).collect::<Vec<_>>();
        let (min_x, max_x) = (axis.centre(low), axis.centre(high));

        // Least-squares constant is the mean
        let level = points.iter().map(|&(_, v)| v).sum::<f64>() / points.len() as f64;
        let noise = ProfileFit::Noise { level };

        let mean0     = 0.5 * (min_x + max_x);
        let mean_span = 0.8 * 0.5 * (max_x - min_x);
        let gauss = |p: &[f64], x: f64| p[0] * (-0.5 * ((x - p[1]) / p[2]).powi(2)).exp();
        let loss  = |par: &[f64]| points.iter().map(|&(x, v)| (v - gauss(par, x)).powi(2)).sum::<f64>();
        let params = [
            Parameter::new("amplitude", max   , 0.1 * max   ).limits(0.5 * max, 1.5 * max),
            Parameter::new("mean"     , mean0 , 0.5 * sigma0).limits(mean0 - mean_span, mean0 + mean_span),
            Parameter::new("sigma"    , sigma0, 0.2 * sigma0).limits(sigma0, 2.0 * sigma0),
        ];
        let result = self.minimizer.minimize(loss, &params);
        let hit = ProfileFit::Hit { amplitude: result.params[0], mean: result.params[1], sigma: result.params[2] };

        let noise_mse = mse(&points, |_| level);
        let hit_mse   = mse(&points, |x| gauss(&result.params, x));
        if hit_mse / noise_mse < p.noise_mse_ratio { hit } else { noise }
    }

    /// Zero rec-hits that are small compared to the largest one
    pub fn clean_rec_hits(&self, rec_hits: &mut Histo2D) {
        let threshold = self.params.clean_fraction * rec_hits.max() + 1e-3;
        rec_hits.suppress_below(threshold);
    }

    /// Connected cluster grown from the maximum bin of `raw`. A bin extends
    /// the cluster to its 3×3 neighbourhood when the neighbourhood charge
    /// reaches `kernel_sum_threshold`; only neighbours above
    /// `empty_bin_threshold` join.
    pub fn make_clean_cluster(&self, raw: &Histo2D) -> Histo2D {
        let (nx, ny) = (raw.x_axis().n(), raw.y_axis().n());
        let empty    = self.params.empty_bin_threshold;
        let kernel   = |(ix, iy): (usize, usize)| {
            let xs = ix.saturating_sub(1)..=(ix + 1).min(nx - 1);
            xs.flat_map(move |x| (iy.saturating_sub(1)..=(iy + 1).min(ny - 1)).map(move |y| (x, y)))
        };

        let mut cluster  = raw.zeroed();
        let mut boundary = vec![raw.max_bin()];
        while !boundary.is_empty() {
            let mut next = vec![];
            for bin in boundary {
                let kernel_sum: f64 = kernel(bin).map(|(x, y)| raw.get(x, y)).sum();
                if kernel_sum < self.params.kernel_sum_threshold { continue }
                for (x, y) in kernel(bin) {
                    let value = raw.get(x, y);
                    if cluster.get(x, y) < empty && value > empty {
                        cluster.set(x, y, value);
                        next.push((x, y));
                    }
                }
            }
            boundary = next;
        }
        cluster
    }
}

/// Mean squared error over the window, counting only bins with content
fn mse(points: &[(f64, f64)], model: impl Fn(f64) -> f64) -> f64 {
    let sum = points.iter()
        .filter(|(_, v)| *v > 0.0)
        .map(|&(x, v)| (v - model(x)).powi(2))
        .sum::<f64>();
    sum / points.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Axis;
    use float_eq::assert_float_eq;

    fn gaussian_profile(n: usize, centre: f64, sigma: f64, amplitude: f64) -> Histo1D {
        let axis = Axis::new(n, 0.0, n as f64);
        Histo1D::from_values(axis, (0..n).map(|i| amplitude * (-0.5 * ((axis.centre(i) - centre) / sigma).powi(2)).exp()))
    }

    #[test]
    fn single_pulse_is_found() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let profile = gaussian_profile(100, 40.3, 2.5, 200.0);
        match builder.fit_1d_projection(&profile, 2.0) {
            ProfileFit::Hit { amplitude, mean, sigma } => {
                assert_float_eq!(mean     ,  40.3, abs <= 0.05);
                assert_float_eq!(sigma    ,   2.5, abs <= 0.05);
                assert_float_eq!(amplitude, 200.0, rmax <= 0.02);
            }
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn pulse_charge_matches_profile_integral() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let profile = gaussian_profile(100, 50.0, 3.0, 100.0);
        let fit = builder.fit_1d_projection(&profile, 2.0);
        assert_float_eq!(fit.charge(1.0), profile.integral(), rmax <= 0.02);
    }

    #[test]
    fn small_profiles_are_not_fitted() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let profile = gaussian_profile(100, 50.0, 3.0, 10.0);
        assert_eq!(builder.fit_1d_projection(&profile, 2.0), ProfileFit::Empty);
    }

    #[test]
    fn flat_profile_is_noise() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let axis = Axis::new(50, 0.0, 50.0);
        let profile = Histo1D::from_values(axis, vec![30.0; 50]);
        assert!(matches!(builder.fit_1d_projection(&profile, 2.0), ProfileFit::Noise { .. }));
    }

    #[test]
    fn empty_map_gives_no_rec_hits() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let raw = Histo2D::new(Axis::new(64, 0.0, 64.0), Axis::new(32, 0.0, 32.0));
        let rec_hits = builder.make_rec_hits(&raw);
        assert!(rec_hits.is_empty());
        assert_eq!(rec_hits.x_axis(), raw.x_axis());
    }

    #[test]
    fn isolated_spike_is_not_a_cluster() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let mut raw = Histo2D::new(Axis::new(64, 0.0, 64.0), Axis::new(32, 0.0, 32.0));
        raw.set(10, 10, 100.0);
        raw.set(40, 20,  30.0);
        assert!(builder.make_clean_cluster(&raw).is_empty());
    }

    #[test]
    fn cluster_follows_connected_charge() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let mut raw = Histo2D::new(Axis::new(64, 0.0, 64.0), Axis::new(32, 0.0, 32.0));
        for ix in 10..40 { raw.set(ix, 12, 80.0); raw.set(ix, 13, 80.0); }
        raw.set(60, 30, 50.0); // disconnected
        let cluster = builder.make_clean_cluster(&raw);
        assert_float_eq!(cluster.integral(), 30.0 * 160.0, ulps <= 4);
        assert_eq!(cluster.get(60, 30), 0.0);
    }

    #[test]
    fn line_gives_one_hit_per_strip() {
        let builder = RecHitBuilder::new(RecHitParams::default());
        let mut raw = Histo2D::new(Axis::new(128, 0.0, 128.0), Axis::new(32, 0.0, 32.0));
        // Time pulses of sigma 2 bins, drifting by 2 bins per strip
        for iy in 5..25 {
            let t0 = 20.0 + 2.0 * iy as f64;
            for ix in 0..128 {
                let t = raw.x_axis().centre(ix);
                raw.set(ix, iy, 150.0 * (-0.5 * ((t - t0) / 2.0).powi(2)).exp());
            }
        }
        let rec_hits = builder.make_rec_hits(&raw);
        let hits = rec_hits.to_hits();
        assert_eq!(hits.len(), 20);
        for hit in hits {
            let strip = hit.pos_strip() - 0.5;
            assert_float_eq!(hit.pos_time(), 20.0 + 2.0 * strip, abs <= 1.0);
        }
    }
}
