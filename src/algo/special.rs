//! Special functions for the sinc-aperture integrals.
//!
//! The coefficient integrals reduce to the sine integral
//! `Si(x) = ∫₀ˣ sin(t)/t dt`, evaluated here by a Taylor series for small
//! arguments and the auxiliary-function asymptotic expansion above that.
//! Absolute accuracy is better than 1e-7 everywhere, far below the
//! quadrature error of the callers.

use std::f64::consts::{FRAC_PI_2, PI};

// Series/asymptotic crossover. The Taylor terms peak near x^x/x! here,
// which still leaves ~1e-10 of cancellation headroom in f64.
const SERIES_LIMIT: f64 = 16.0;

/// Sine integral `Si(x)`.
pub fn sine_integral(x: f64) -> f64 {
    if x < 0.0 {
        return -sine_integral(-x);
    }
    if x <= SERIES_LIMIT {
        si_series(x)
    } else {
        si_asymptotic(x)
    }
}

/// Integral of the normalized sinc, `∫₀ᵘ sin(πt)/(πt) dt = Si(πu)/π`.
pub fn sinc_integral(u: f64) -> f64 {
    sine_integral(PI * u) / PI
}

fn si_series(x: f64) -> f64 {
    // Si(x) = Σ (-1)^k x^(2k+1) / ((2k+1)·(2k+1)!)
    let x2 = x * x;
    let mut power = x; // (-1)^k x^(2k+1) / (2k+1)!
    let mut sum = x;
    for k in 1..=60 {
        let two_k = (2 * k) as f64;
        power *= -x2 / (two_k * (two_k + 1.0));
        let term = power / (two_k + 1.0);
        sum += term;
        if term.abs() < 1e-17 * sum.abs() {
            break;
        }
    }
    sum
}

fn si_asymptotic(x: f64) -> f64 {
    // Si(x) = π/2 - f(x)·cos(x) - g(x)·sin(x) with the auxiliary functions
    //   f(x) ~ (1/x)  Σ (-1)^k (2k)!   / x^(2k)
    //   g(x) ~ (1/x²) Σ (-1)^k (2k+1)! / x^(2k)
    // truncated at their smallest term for x ≥ 16.
    let inv_x2 = 1.0 / (x * x);
    let mut f = 0.0;
    let mut g = 0.0;
    let mut fact_even = 1.0; // (2k)!
    let mut pow = 1.0; // (-1)^k / x^(2k)
    for k in 0..=8u32 {
        if k > 0 {
            let two_k = (2 * k) as f64;
            fact_even *= (two_k - 1.0) * two_k;
            pow *= -inv_x2;
        }
        f += fact_even * pow;
        g += fact_even * (2 * k + 1) as f64 * pow;
    }
    f /= x;
    g *= inv_x2;
    FRAC_PI_2 - f * x.cos() - g * x.sin()
}
