//! Derivative-free, box-constrained minimisation (Nelder-Mead simplex).
//!
//! The losses minimised during reconstruction are piecewise (hits enter and
//! leave distance bands as parameters move), so no gradients are used.

use std::cell::Cell;

use itertools::Itertools;

/// One fit parameter: starting value, initial step, optional limits.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name  : &'static str,
    pub value : f64,
    pub step  : f64,
    pub limits: Option<(f64, f64)>,
    pub fixed : bool,
}

impl Parameter {

    pub fn new(name: &'static str, value: f64, step: f64) -> Self {
        Self { name, value, step, limits: None, fixed: false }
    }

    pub fn limits(mut self, lo: f64, hi: f64) -> Self {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self.limits = Some((lo, hi));
        self.value  = self.clamp(self.value);
        self
    }

    pub fn fixed(mut self) -> Self { self.fixed = true; self }

    pub fn clamp(&self, x: f64) -> f64 {
        match self.limits {
            Some((lo, hi)) => x.clamp(lo, hi),
            None           => x,
        }
    }
}

/// Outcome of a minimisation. `valid == false` signals non-convergence; the
/// parameters are then the best point seen, which callers may still use.
#[derive(Clone, Debug, PartialEq)]
pub struct FitResult {
    pub params : Vec<f64>,
    pub fval   : f64,
    pub valid  : bool,
    pub n_calls: usize,
}

impl FitResult {
    /// Result standing in for a fit that was never attempted
    pub fn empty() -> Self { Self { params: vec![], fval: f64::INFINITY, valid: false, n_calls: 0 } }
    pub fn is_empty(&self) -> bool { self.params.is_empty() }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Minimizer {
    pub max_calls: usize,
    /// Convergence: spread of the simplex function values below
    /// `tolerance * (|f_best| + tolerance)`
    pub tolerance: f64,
    /// Number of times the simplex is rebuilt around the best point after
    /// convergence, to escape premature collapse
    pub restarts : usize,
}

impl Default for Minimizer {
    fn default() -> Self { Self { max_calls: 20_000, tolerance: 1e-8, restarts: 2 } }
}

impl Minimizer {

    pub fn new(max_calls: usize, tolerance: f64) -> Self { Self { max_calls, tolerance, ..Self::default() } }

    pub fn minimize<F>(&self, f: F, params: &[Parameter]) -> FitResult
    where
        F: Fn(&[f64]) -> f64,
    {
        let free  = params.iter().positions(|p| !p.fixed).collect_vec();
        let calls = Cell::new(0_usize);

        // Evaluate the loss at a point in the space of free parameters
        let eval = |x: &[f64]| -> f64 {
            calls.set(calls.get() + 1);
            let v = f(&full_params(params, &free, x));
            if v.is_nan() { f64::INFINITY } else { v }
        };
        let project = |x: &mut Vec<f64>| {
            for (&i, xi) in free.iter().zip(x.iter_mut()) { *xi = params[i].clamp(*xi); }
        };

        let start = free.iter().map(|&i| params[i].value).collect_vec();
        if free.is_empty() {
            let fval = eval(&start);
            return FitResult { params: full_params(params, &free, &start), fval, valid: fval.is_finite(), n_calls: calls.get() };
        }

        let n = free.len();
        let mut best = (start.clone(), eval(&start));
        let mut converged = false;
        let mut scale = 1.0;

        for attempt in 0..=self.restarts {
            // Build the simplex around the current best point
            let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
            simplex.push(best.clone());
            for (k, &i) in free.iter().enumerate() {
                let mut x = best.0.clone();
                let step = if params[i].step != 0.0 { params[i].step } else { 0.1 * x[k].abs().max(1.0) };
                x[k] += scale * step;
                project(&mut x);
                if x[k] == best.0[k] { x[k] -= scale * step; project(&mut x); }
                let fx = eval(&x);
                simplex.push((x, fx));
            }

            converged = false;
            loop {
                simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
                let (f_best, f_worst) = (simplex[0].1, simplex[n].1);
                if (f_worst - f_best).abs() <= self.tolerance * (f_best.abs() + self.tolerance) {
                    converged = true;
                    break;
                }
                if calls.get() >= self.max_calls { break }

                let centroid = (0..n).map(|k| simplex[..n].iter().map(|v| v.0[k]).sum::<f64>() / n as f64).collect_vec();
                let along = |t: f64, from: &[f64]| -> Vec<f64> {
                    let mut x = centroid.iter().zip(from).map(|(c, w)| c + t * (c - w)).collect_vec();
                    project(&mut x);
                    x
                };

                let worst = simplex[n].0.clone();
                let xr = along(1.0, &worst);
                let fr = eval(&xr);
                if fr < f_best {
                    let xe = along(2.0, &worst);
                    let fe = eval(&xe);
                    simplex[n] = if fe < fr { (xe, fe) } else { (xr, fr) };
                } else if fr < simplex[n - 1].1 {
                    simplex[n] = (xr, fr);
                } else {
                    let (xc, fc) = if fr < f_worst {
                        let xc = along(0.5, &worst);
                        let fc = eval(&xc);
                        (xc, fc)
                    } else {
                        let xc = along(-0.5, &worst);
                        let fc = eval(&xc);
                        (xc, fc)
                    };
                    if fc < fr.min(f_worst) {
                        simplex[n] = (xc, fc);
                    } else {
                        // Shrink towards the best vertex
                        let x0 = simplex[0].0.clone();
                        for vertex in simplex.iter_mut().skip(1) {
                            let mut x = x0.iter().zip(&vertex.0).map(|(b, v)| b + 0.5 * (v - b)).collect_vec();
                            project(&mut x);
                            let fx = eval(&x);
                            *vertex = (x, fx);
                        }
                    }
                }
            }

            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
            let improved = simplex[0].1 < best.1;
            let gain = best.1 - simplex[0].1;
            if improved { best = simplex[0].clone(); }
            if calls.get() >= self.max_calls { break }
            // A restart that gains nothing confirms the minimum
            if converged && gain <= self.tolerance * (best.1.abs() + self.tolerance) && attempt > 0 { break }
            scale *= 0.5;
        }

        let fval = best.1;
        FitResult {
            params : full_params(params, &free, &best.0),
            fval,
            valid  : converged && fval.is_finite(),
            n_calls: calls.get(),
        }
    }
}

fn full_params(params: &[Parameter], free: &[usize], x: &[f64]) -> Vec<f64> {
    let mut full = params.iter().map(|p| p.value).collect_vec();
    for (&i, &xi) in free.iter().zip(x) { full[i] = params[i].clamp(xi); }
    full
}
