//! Ikeda-Carpenter moderator pulse shape and the instrument response it is convolved with.
//!
//! Reference: S. Ikeda and J. M. Carpenter, NIM A239 (1985) 536-544.

use crate::config::ModeratorCoefficients;

/// Neutron TOF per unit wavelength per unit path, µs / (Å · m).
pub const TOF_PER_ANGSTROM_METER: f64 = 252.7784;
/// `E[meV] = ENERGY_WAVELENGTH / λ[Å]²`.
pub const ENERGY_WAVELENGTH: f64 = 81.8042;

pub fn wavelength_from_tof(tof_us: f64, flight_path_m: f64) -> f64 {
    tof_us / (TOF_PER_ANGSTROM_METER * flight_path_m)
}

pub fn energy_from_wavelength(wavelength: f64) -> f64 {
    ENERGY_WAVELENGTH / (wavelength * wavelength)
}

pub fn wavelength_from_energy(energy_mev: f64) -> f64 {
    (ENERGY_WAVELENGTH / energy_mev).sqrt()
}

/// Initial `(A, B, R)` for a neutron of the given incident energy.
pub fn seed_from_energy(moderator: &ModeratorCoefficients, energy_mev: f64) -> (f64, f64, f64) {
    let wl = wavelength_from_energy(energy_mev);
    let a = 1.0 / (moderator.alpha0 + moderator.alpha1 * wl);
    let b = 1.0 / moderator.beta0;
    let r = (-81.799 / (moderator.kappa * wl * wl)).exp();
    (a, b, r)
}

/// Normalized Ikeda-Carpenter function at time `t` after emission.
///
/// `a` is the fast (slowing-down) rate, `b` the slow (storage) decay rate and
/// `r` the fraction of the storage term. Integrates to one over `t >= 0`.
pub fn ikeda_carpenter(t: f64, a: f64, b: f64, r: f64) -> f64 {
    if t < 0.0 || a <= 0.0 || b <= 0.0 {
        return 0.0;
    }
    let at = a * t;
    let fast = (1.0 - r) * at * at * (-at).exp();
    let amb = a - b;
    let x = amb * t;
    let storage = if x.abs() < 1e-2 {
        // e^x - 1 - x - x²/2 = x³ (1/3! + x/4! + x²/5! + x³/6!), avoids the 1/(a-b)³ cancellation
        let series = 1.0 / 6.0 + x / 24.0 + x * x / 120.0 + x * x * x / 720.0;
        2.0 * r * a * a * b * t * t * t * (-at).exp() * series
    } else {
        2.0 * r * a * a * b / (amb * amb * amb)
            * ((-b * t).exp() - (-at).exp() * (1.0 + x + 0.5 * x * x))
    };
    let out = 0.5 * a * (fast + storage);
    if out.is_finite() {
        out.max(0.0)
    } else {
        0.0
    }
}

/// Top-hat of full width `hat_width` convolved with `exp(-kconv·|τ|)`, sampled every `dt`.
///
/// Returned kernel has odd length, is centred on its middle element and sums to one.
/// `max_half_len` caps the number of samples on each side.
pub fn response_kernel(dt: f64, hat_width: f64, kconv: f64, max_half_len: usize) -> Vec<f64> {
    let h = 0.5 * hat_width.max(0.0);
    let has_exp = kconv > 1e-12;
    let reach = h + if has_exp { 8.0 / kconv } else { 0.0 };
    let half_len = ((reach / dt).ceil() as usize).min(max_half_len);

    let value = |tau: f64| -> f64 {
        let tau = tau.abs();
        match (h > 0.0, has_exp) {
            (false, false) => {
                if tau < 0.5 * dt {
                    1.0
                } else {
                    0.0
                }
            }
            (true, false) => {
                if tau <= h {
                    1.0
                } else {
                    0.0
                }
            }
            (false, true) => (-kconv * tau).exp(),
            (true, true) => {
                if tau >= h {
                    ((-kconv * (tau - h)).exp() - (-kconv * (tau + h)).exp()) / kconv
                } else {
                    (2.0 - (-kconv * (h - tau)).exp() - (-kconv * (h + tau)).exp()) / kconv
                }
            }
        }
    };

    let mut kernel: Vec<f64> = (0..=2 * half_len)
        .map(|i| value((i as f64 - half_len as f64) * dt))
        .collect();
    let sum: f64 = kernel.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        kernel.iter_mut().for_each(|k| *k /= sum);
    } else {
        kernel = vec![1.0];
    }
    kernel
}

/// Discrete convolution with output the same length as `signal` (kernel centred).
pub fn convolve_same(signal: &[f64], kernel: &[f64], out: &mut [f64]) {
    let n = signal.len() as isize;
    let half = (kernel.len() / 2) as isize;
    for (i, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (j, &k) in kernel.iter().enumerate() {
            let src = i as isize - (j as isize - half);
            if src < 0 || src >= n {
                continue;
            }
            acc += k * signal[src as usize];
        }
        *o = acc;
    }
}
