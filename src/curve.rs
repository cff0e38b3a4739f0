//! Tabulated one-dimensional curves: range-energy relations and reference
//! Bragg (dE/dx) curves.
//!
//! A `Curve` is a piecewise-linear interpolation through points sorted by
//! `x`. Outside the tabulated interval it holds the first or last value.

use std::path::Path;

use itertools::Itertools;

use crate::error::{ConfigError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Curve {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Curve {

    /// Points are sorted by `x`. Needs at least two points with distinct `x`.
    pub fn new(mut points: Vec<(f64, f64)>) -> Result<Self> {
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(ConfigError::Curve("non-finite point".into()))
        }
        if points.len() < 2 {
            return Err(ConfigError::Curve(format!("{} point(s), at least 2 needed", points.len())))
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.iter().tuple_windows().any(|(a, b)| a.0 == b.0) {
            return Err(ConfigError::Curve("repeated abscissa".into()))
        }
        let (x, y) = points.into_iter().unzip();
        Ok(Self { x, y })
    }

    /// Read columns `x_col` and `y_col` (0-based) of a whitespace-separated
    /// text table. Blank lines and lines starting with `#` are skipped.
    pub fn from_file(path: impl AsRef<Path>, x_col: usize, y_col: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, path, x_col, y_col)
    }

    /// Two-column (x, y) table
    pub fn from_two_columns(path: impl AsRef<Path>) -> Result<Self> { Self::from_file(path, 0, 1) }

    fn parse(text: &str, path: &Path, x_col: usize, y_col: usize) -> Result<Self> {
        let bad = |line: usize, reason: String| ConfigError::CurveFile { path: path.to_path_buf(), line, reason };
        let mut points = vec![];
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue }
            let fields = line.split_whitespace().collect_vec();
            let field = |col: usize| -> Result<f64> {
                let text = fields.get(col).ok_or_else(|| bad(n + 1, format!("missing column {col}")))?;
                text.parse().map_err(|_| bad(n + 1, format!("cannot parse `{text}` as a number")))
            };
            points.push((field(x_col)?, field(y_col)?));
        }
        Self::new(points).map_err(|e| match e {
            ConfigError::Curve(reason) => bad(0, reason),
            other                      => other,
        })
    }

    pub fn len(&self) -> usize { self.x.len() }
    pub fn is_empty(&self) -> bool { self.x.is_empty() }

    pub fn x_min(&self) -> f64 { self.x[0] }
    pub fn x_max(&self) -> f64 { self.x[self.x.len() - 1] }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }

    /// Index `i` of the segment `[x_i, x_{i+1}]` used for `x`
    fn segment(&self, x: f64) -> usize {
        let last = self.x.len() - 2;
        self.x.partition_point(|&xi| xi <= x).saturating_sub(1).min(last)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let last = self.len() - 1;
        if x <= self.x[0]    { return self.y[0] }
        if x >= self.x[last] { return self.y[last] }
        let i = self.segment(x);
        let (x0, x1, y0, y1) = (self.x[i], self.x[i + 1], self.y[i], self.y[i + 1]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }

    /// Integral of the interpolant over `[a, b]` restricted to the tabulated
    /// interval. Negative when `b < a`.
    pub fn integrate(&self, a: f64, b: f64) -> f64 {
        if b < a { return -self.integrate(b, a) }
        let (lo, hi) = (a.max(self.x_min()), b.min(self.x_max()));
        if hi <= lo { return 0.0 }
        let mut knots = vec![lo];
        knots.extend(self.x.iter().copied().filter(|&x| x > lo && x < hi));
        knots.push(hi);
        knots.iter().tuple_windows()
            .map(|(&x0, &x1)| 0.5 * (x1 - x0) * (self.eval(x0) + self.eval(x1)))
            .sum()
    }

    /// Swap the roles of `x` and `y`. Fails unless `y` is strictly monotonic.
    pub fn inverted(&self) -> Result<Curve> {
        let increasing = self.y.iter().tuple_windows().all(|(a, b)| b > a);
        let decreasing = self.y.iter().tuple_windows().all(|(a, b)| b < a);
        if !(increasing || decreasing) {
            return Err(ConfigError::Curve("cannot invert a non-monotonic curve".into()))
        }
        Curve::new(self.y.iter().copied().zip(self.x.iter().copied()).collect())
    }

    /// Same curve with `(0, 0)` included
    pub fn through_origin(&self) -> Result<Curve> {
        let mut points = self.points().filter(|&(x, _)| x != 0.0).collect_vec();
        points.push((0.0, 0.0));
        Curve::new(points)
    }
}

/// Bragg-Kleeman rule `R(E) = k E^p`, used to synthesise range-energy
/// relations and dE/dx profiles when no measured tables are supplied.
///
/// The dE/dx profile is softened at the stopping point by evaluating the
/// stopping power at `r + softening` instead of the residual range `r`, and
/// renormalised so that its integral over the full range equals the
/// reference energy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BraggKleeman {
    /// MeV
    pub energy   : f64,
    /// mm, range of a particle of `energy`
    pub range    : f64,
    pub exponent : f64,
    /// mm
    pub softening: f64,
}

impl BraggKleeman {

    pub fn new(energy: f64, range: f64, exponent: f64, softening: f64) -> Self {
        Self { energy, range, exponent, softening }
    }

    pub fn range_at(&self, energy: f64) -> f64 { self.range * (energy / self.energy).max(0.0).powf(self.exponent) }

    pub fn energy_at(&self, range: f64) -> f64 { self.energy * (range / self.range).max(0.0).powf(1.0 / self.exponent) }

    /// Range (mm) as a function of energy (MeV), from 0 up to `e_max`
    pub fn range_curve(&self, e_max: f64, n_points: usize) -> Result<Curve> {
        let n = n_points.max(2);
        Curve::new((0..n).map(|i| {
            let e = e_max * (i as f64 / (n - 1) as f64).powi(2);
            (e, self.range_at(e))
        }).collect())
    }

    /// dE/dx (MeV/mm) as a function of the distance travelled (mm) by a
    /// particle starting with the reference energy. Zero beyond the range.
    pub fn dedx_curve(&self, n_points: usize) -> Result<Curve> {
        let n   = n_points.max(3);
        let r0  = self.softening.max(1e-3);
        let raw = |residual: f64| self.energy_at(residual + r0) - self.energy_at(r0);
        let norm = self.energy / raw(self.range);
        let dedx = |residual: f64| {
            // derivative of energy_at at residual + r0
            let r = residual + r0;
            norm * self.energy_at(r) / (self.exponent * r)
        };
        let mut points = (0..n - 1).map(|i| {
            // Denser sampling towards the stopping point
            let f = 1.0 - (1.0 - i as f64 / (n - 2) as f64).powi(2);
            let x = self.range * f;
            (x, dedx(self.range - x))
        }).collect_vec();
        points.push((self.range * (1.0 + 1e-6) + 1e-6, 0.0));
        Curve::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;
    use std::io::Write;

    fn line() -> Curve { Curve::new(vec![(2.0, 4.0), (0.0, 0.0), (1.0, 2.0)]).unwrap() }

    #[rstest(/**/ x  , expected,
             case(0.0, 0.0),
             case(0.5, 1.0),
             case(1.5, 3.0),
             case(3.0, 4.0),
             case(-1.0, 0.0),
    )]
    fn evaluation(x: f64, expected: f64) {
        assert_float_eq!(line().eval(x), expected, abs <= 1e-12);
    }

    #[rstest(/**/ a  ,  b  , expected,
             case(0.0, 2.0,  4.0),
             case(0.5, 1.5,  2.0),
             case(2.0, 0.0, -4.0),
             case(-5.0, 1.0, 1.0),  // clipped to the table
             case(3.0, 5.0,  0.0),
    )]
    fn integration(a: f64, b: f64, expected: f64) {
        assert_float_eq!(line().integrate(a, b), expected, abs <= 1e-12);
    }

    #[test]
    fn too_few_points_is_an_error() {
        assert!(matches!(Curve::new(vec![(1.0, 1.0)]), Err(ConfigError::Curve(_))));
        assert!(matches!(Curve::new(vec![(1.0, 1.0), (1.0, 2.0)]), Err(ConfigError::Curve(_))));
    }

    #[test]
    fn inversion() {
        let inv = line().inverted().unwrap();
        assert_float_eq!(inv.eval(3.0), 1.5, abs <= 1e-12);
        let bump = Curve::new(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 0.0)]).unwrap();
        assert!(bump.inverted().is_err());
    }

    #[test]
    fn origin_is_added_once() {
        let c = Curve::new(vec![(1.0, 1.0), (2.0, 3.0)]).unwrap().through_origin().unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.points().next(), Some((0.0, 0.0)));
        assert_eq!(c.through_origin().unwrap().len(), 3);
    }

    #[test]
    fn read_table_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "# energy  unit  range")?;
        writeln!(file, "1.0  keV  10.0")?;
        writeln!(file)?;
        writeln!(file, "2.0  keV  30.0")?;
        let curve = Curve::from_file(file.path(), 0, 2)?;
        assert_eq!(curve.len(), 2);
        assert_float_eq!(curve.eval(1.5), 20.0, abs <= 1e-12);
        Ok(())
    }

    #[test]
    fn malformed_file_reports_line() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "1.0 2.0")?;
        writeln!(file, "2.0 oops")?;
        match Curve::from_two_columns(file.path()) {
            Err(ConfigError::CurveFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn bragg_kleeman_dedx_integrates_to_energy() -> Result<()> {
        let law  = BraggKleeman::new(10.0, 297.23, 1.75, 1.0);
        let dedx = law.dedx_curve(400)?;
        assert_float_eq!(dedx.integrate(0.0, law.range + 1.0), 10.0, r2nd <= 1e-2);
        // Peaks near the stopping point and vanishes beyond it
        assert!(dedx.eval(law.range - 1.0) > 3.0 * dedx.eval(10.0));
        assert_eq!(dedx.eval(law.range + 1.0), 0.0);
        let range = law.range_curve(10.0, 100)?;
        assert_float_eq!(range.eval(10.0), 297.23, r2nd <= 1e-9);
        Ok(())
    }
}
