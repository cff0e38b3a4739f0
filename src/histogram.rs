//! Fixed-binning 1-D and 2-D charge histograms.
//!
//! 1-D histograms are ndhistogram `Hist1D`s over a `Uniform` axis, so values
//! outside the axis land in the under/overflow bins rather than being lost.
//! A 2-D histogram is indexed `[time bin, strip bin]`, matching the (time,
//! strip) plane in which every projection is reconstructed.

use std::ops::RangeInclusive;

use ndarray::{Array2, Axis as NdAxis};
use ndhistogram::{axis::{Axis as _, Uniform}, ndhistogram, Hist1D, Histogram};

use geometry::{GeometryTPC, Projection};

use crate::hit::{Hit2D, Hit2DCollection};

/// Uniform binning of an interval
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Axis {
    n  : usize,
    min: f64,
    max: f64,
}

impl Axis {

    pub fn new(n: usize, min: f64, max: f64) -> Self {
        debug_assert!(n > 0 && max > min, "degenerate axis: {n} bins over [{min}, {max}]");
        Self { n, min, max }
    }

    /// Drift axis: one bin per time cell
    pub fn time(geometry: &GeometryTPC) -> Self {
        let z = geometry.z_range();
        Self::new(geometry.n_timecells(), z.min, z.max)
    }

    /// Strip axis of `dir`: one bin per strip
    pub fn strip(geometry: &GeometryTPC, dir: Projection) -> Self {
        let s = geometry.strip_range(dir);
        Self::new(geometry.n_strips(dir), s.min, s.max)
    }

    pub fn n    (&self) -> usize { self.n }
    pub fn min  (&self) -> f64 { self.min }
    pub fn max  (&self) -> f64 { self.max }
    pub fn width(&self) -> f64 { (self.max - self.min) / self.n as f64 }

    pub fn centre  (&self, i: usize) -> f64 { self.min + (i as f64 + 0.5) * self.width() }
    pub fn low_edge(&self, i: usize) -> f64 { self.min +  i as f64        * self.width() }

    /// The same binning as an ndhistogram axis, with under/overflow bins
    pub fn uniform(&self) -> Uniform<f64> { Uniform::new(self.n, self.min, self.max) }

    /// Bin holding `x`; `None` in the under/overflow bins
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if x.is_nan() { return None }
        match self.uniform().index(&x)? {
            0                 => None,
            i if i > self.n   => None,
            i                 => Some(i - 1),
        }
    }
}

// ----- 1D ------------------------------------------------------------------------
/// Bin `i` of the axis is ndhistogram index `i + 1`: index 0 is the underflow
/// and `n + 1` the overflow.
#[derive(Clone, Debug, PartialEq)]
pub struct Histo1D {
    axis     : Axis,
    histogram: Hist1D<Uniform<f64>, f64>,
}

impl Histo1D {

    pub fn new(axis: Axis) -> Self { Self { axis, histogram: ndhistogram!(axis.uniform(); f64) } }

    /// Values beyond the number of bins are dropped; missing ones are zero.
    pub fn from_values(axis: Axis, values: impl IntoIterator<Item = f64>) -> Self {
        let mut histo = Self::new(axis);
        for (i, v) in values.into_iter().take(axis.n()).enumerate() { histo.set(i, v); }
        histo
    }

    pub fn axis  (&self) -> &Axis  { &self.axis }
    pub fn n_bins(&self) -> usize  { self.axis.n() }

    /// Contents of the bins within the axis
    pub fn values(&self) -> Vec<f64> { self.in_range().collect() }

    fn in_range(&self) -> impl Iterator<Item = f64> + '_ {
        self.histogram.values().skip(1).take(self.n_bins()).copied()
    }

    pub fn value(&self, i: usize) -> f64 {
        if i >= self.n_bins() { return 0.0 }
        self.histogram.value_at_index(i + 1).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, i: usize, value: f64) {
        if i >= self.n_bins() { return }
        if let Some(v) = self.histogram.value_at_index_mut(i + 1) { *v = value; }
    }

    /// Weight below and above the axis
    pub fn underflow(&self) -> f64 { self.histogram.value_at_index(0).copied().unwrap_or(0.0) }
    pub fn overflow (&self) -> f64 { self.histogram.value_at_index(self.n_bins() + 1).copied().unwrap_or(0.0) }

    /// Returns `false` when `x` lies outside the axis. NaN is not recorded.
    pub fn fill(&mut self, x: f64, weight: f64) -> bool {
        if x.is_nan() { return false }
        self.histogram.fill_with(&x, weight);
        self.axis.find_bin(x).is_some()
    }

    pub fn max(&self) -> f64 { self.in_range().fold(0.0_f64, f64::max) }

    /// Index of the maximum; ties resolved in favour of the lowest index
    pub fn max_bin(&self) -> usize {
        let mut best = (0, f64::NEG_INFINITY);
        for (i, v) in self.in_range().enumerate() {
            if v > best.1 { best = (i, v); }
        }
        best.0
    }

    pub fn integral(&self) -> f64 { self.in_range().sum() }

    /// Sum of `value × bin width`
    pub fn integral_width(&self) -> f64 { self.integral() * self.axis.width() }

    pub fn integral_range(&self, bins: RangeInclusive<usize>) -> f64 {
        let (lo, hi) = self.clamp(bins);
        (lo..=hi).map(|i| self.value(i)).sum()
    }

    pub fn first_bin_above(&self, threshold: f64, bins: RangeInclusive<usize>) -> Option<usize> {
        let (lo, hi) = self.clamp(bins);
        (lo..=hi).find(|&i| self.value(i) > threshold)
    }

    pub fn last_bin_above(&self, threshold: f64, bins: RangeInclusive<usize>) -> Option<usize> {
        let (lo, hi) = self.clamp(bins);
        (lo..=hi).rev().find(|&i| self.value(i) > threshold)
    }

    fn clamp(&self, bins: RangeInclusive<usize>) -> (usize, usize) {
        let last = self.n_bins() - 1;
        ((*bins.start()).min(last), (*bins.end()).min(last))
    }

    /// Merge groups of `group` neighbouring bins; trailing bins that do not
    /// fill a whole group are dropped.
    pub fn rebin(&self, group: usize) -> Histo1D {
        let group  = group.max(1);
        let n      = (self.n_bins() / group).max(1);
        let max    = self.axis.low_edge((n * group).min(self.n_bins()));
        let values = self.values();
        Histo1D::from_values(Axis::new(n, self.axis.min(), max), values.chunks(group).map(|c| c.iter().sum::<f64>()))
    }

    pub fn scale(&mut self, factor: f64) { self.histogram.values_mut().for_each(|v| *v *= factor); }

    /// Same binning, contents reversed end to end
    pub fn reflected(&self) -> Histo1D {
        let mut values = self.values();
        values.reverse();
        Histo1D::from_values(self.axis, values)
    }

    pub fn is_empty(&self) -> bool { self.in_range().all(|v| v == 0.0) }

    /// `(bin centre, value)` pairs
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.in_range().enumerate().map(|(i, v)| (self.axis.centre(i), v))
    }
}

// ----- 2D ------------------------------------------------------------------------
#[derive(Clone, Debug, PartialEq)]
pub struct Histo2D {
    x     : Axis,
    y     : Axis,
    values: Array2<f64>,
}

impl Histo2D {

    pub fn new(x: Axis, y: Axis) -> Self {
        Self { x, y, values: Array2::zeros((x.n(), y.n())) }
    }

    /// Empty (time, strip) histogram covering the whole of projection `dir`
    pub fn for_projection(geometry: &GeometryTPC, dir: Projection) -> Self {
        Self::new(Axis::time(geometry), Axis::strip(geometry, dir))
    }

    pub fn x_axis(&self) -> &Axis { &self.x }
    pub fn y_axis(&self) -> &Axis { &self.y }
    pub fn values(&self) -> &Array2<f64> { &self.values }

    pub fn zeroed(&self) -> Self { Self::new(self.x, self.y) }

    pub fn get(&self, ix: usize, iy: usize) -> f64 { self.values.get((ix, iy)).copied().unwrap_or(0.0) }

    pub fn set(&mut self, ix: usize, iy: usize, value: f64) {
        if let Some(v) = self.values.get_mut((ix, iy)) { *v = value; }
    }

    pub fn add(&mut self, ix: usize, iy: usize, weight: f64) {
        if let Some(v) = self.values.get_mut((ix, iy)) { *v += weight; }
    }

    /// Returns `false` when the point lies outside the histogram
    pub fn fill(&mut self, x: f64, y: f64, weight: f64) -> bool {
        match (self.x.find_bin(x), self.y.find_bin(y)) {
            (Some(ix), Some(iy)) => { self.values[(ix, iy)] += weight; true }
            _ => false,
        }
    }

    pub fn bin_centre(&self, ix: usize, iy: usize) -> (f64, f64) { (self.x.centre(ix), self.y.centre(iy)) }

    pub fn max(&self) -> f64 { self.values.iter().copied().fold(0.0_f64, f64::max) }

    /// Bin holding the maximum. Scan order is time-major; the first maximum
    /// encountered wins.
    pub fn max_bin(&self) -> (usize, usize) {
        let mut best = ((0, 0), f64::NEG_INFINITY);
        for (index, &v) in self.values.indexed_iter() {
            if v > best.1 { best = (index, v); }
        }
        best.0
    }

    pub fn integral(&self) -> f64 { self.values.sum() }

    pub fn is_empty(&self) -> bool { self.values.iter().all(|&v| v == 0.0) }

    /// Charge vs time, summed over strips
    pub fn projection_x(&self) -> Histo1D {
        Histo1D::from_values(self.x, self.values.sum_axis(NdAxis(1)).to_vec())
    }

    /// Charge vs strip, summed over time
    pub fn projection_y(&self) -> Histo1D {
        Histo1D::from_values(self.y, self.values.sum_axis(NdAxis(0)).to_vec())
    }

    /// Charge vs time on strip bin `iy`
    pub fn slice_x(&self, iy: usize) -> Histo1D {
        Histo1D::from_values(self.x, self.values.column(iy).to_vec())
    }

    /// Charge vs strip in time bin `ix`
    pub fn slice_y(&self, ix: usize) -> Histo1D {
        Histo1D::from_values(self.y, self.values.row(ix).to_vec())
    }

    /// Zero every bin whose content is below `threshold`
    pub fn suppress_below(&mut self, threshold: f64) {
        self.values.mapv_inplace(|v| if v < threshold { 0.0 } else { v });
    }

    /// One hit per bin with positive content, at the bin centre
    pub fn to_hits(&self) -> Hit2DCollection {
        self.values.indexed_iter()
            .filter(|&(_, &charge)| charge > 0.0)
            .map(|((ix, iy), &charge)| Hit2D::new(self.x.centre(ix), self.y.centre(iy), charge))
            .collect()
    }

    /// Bin indices of all bins above `threshold`
    pub fn bins_above(&self, threshold: f64) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.values.indexed_iter().filter(move |&(_, &v)| v > threshold).map(|(index, _)| index)
    }
}
