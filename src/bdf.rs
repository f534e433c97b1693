//! Backward differentiation formula coefficients.
//!
//! Step `k` of order `o` reads
//!
//! ```text
//! x_k = Σ_j alphas(o)[j] · x_{k-1-j}  +  beta(o) · dt · v_k
//! ```
//!
//! The tables match the forward integrator exactly; the adjoint recursion
//! indexes them the same way the forward pass did.

use crate::types::MAX_BDF_ORDER;

const ALPHAS: [&[f64]; MAX_BDF_ORDER] = [
    &[1.0],
    &[4.0 / 3.0, -1.0 / 3.0],
    &[18.0 / 11.0, -9.0 / 11.0, 2.0 / 11.0],
    &[48.0 / 25.0, -36.0 / 25.0, 16.0 / 25.0, -3.0 / 25.0],
    &[300.0 / 137.0, -300.0 / 137.0, 200.0 / 137.0, -75.0 / 137.0, 12.0 / 137.0],
    &[
        360.0 / 147.0,
        -450.0 / 147.0,
        400.0 / 147.0,
        -225.0 / 147.0,
        72.0 / 147.0,
        -10.0 / 147.0,
    ],
];

const BETAS: [f64; MAX_BDF_ORDER] = [
    1.0,
    2.0 / 3.0,
    6.0 / 11.0,
    12.0 / 25.0,
    60.0 / 137.0,
    60.0 / 147.0,
];

/// History weights for BDF of order `order` (1-based).
///
/// # Panics
/// If `order` is 0 or above [`MAX_BDF_ORDER`]; callers validate the order
/// through [`crate::config::TimeIntegration::validate`].
#[inline]
pub fn alphas(order: usize) -> &'static [f64] {
    ALPHAS[order - 1]
}

/// Implicit weight for BDF of order `order` (1-based), `NaN` for order 0.
#[inline]
pub fn beta(order: usize) -> f64 {
    if order == 0 {
        f64::NAN
    } else {
        BETAS[order - 1]
    }
}

/// Order actually used by forward step `step` under a warm-up schedule
/// capped at `max_order`.
#[inline]
pub fn order_at(max_order: usize, step: usize) -> usize {
    max_order.min(step)
}
