//! Explicit integrators
//!
//! Fixed-step integration used by the reference adapters. All operators are
//! deterministic and take the interval in simulation time units.

use serde::{Deserialize, Serialize};

/// Integration methods for numerical integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    /// Simple Euler integration (first-order)
    #[default]
    Euler,
    /// Midpoint method (second-order)
    Midpoint,
    /// Classic Runge-Kutta (fourth-order)
    Rk4,
}

/// Integrate a rate over time
///
/// # Example
/// ```
/// use multisim_processes::operators::integrate;
///
/// let mass = integrate(1.0, 0.5, 0.1);
/// assert!((mass - 1.05).abs() < 1e-12);
/// ```
#[inline]
pub fn integrate(prev: f64, rate: f64, dt: f64) -> f64 {
    prev + rate * dt
}

/// Advance a coupled system of `N` variables by one step of `dt`.
///
/// `rate_fn` returns the time derivative of every variable at a point.
pub fn integrate_system<const N: usize, F>(
    prev: [f64; N],
    rate_fn: F,
    dt: f64,
    method: IntegrationMethod,
) -> [f64; N]
where
    F: Fn(&[f64; N]) -> [f64; N],
{
    let offset = |base: &[f64; N], k: &[f64; N], scale: f64| -> [f64; N] {
        std::array::from_fn(|i| base[i] + k[i] * scale)
    };
    match method {
        IntegrationMethod::Euler => offset(&prev, &rate_fn(&prev), dt),
        IntegrationMethod::Midpoint => {
            let k1 = rate_fn(&prev);
            let mid = offset(&prev, &k1, dt * 0.5);
            offset(&prev, &rate_fn(&mid), dt)
        }
        IntegrationMethod::Rk4 => {
            let k1 = rate_fn(&prev);
            let k2 = rate_fn(&offset(&prev, &k1, dt * 0.5));
            let k3 = rate_fn(&offset(&prev, &k2, dt * 0.5));
            let k4 = rate_fn(&offset(&prev, &k3, dt));
            std::array::from_fn(|i| prev[i] + (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]) * dt / 6.0)
        }
    }
}

/// Split `interval` into equal substeps no longer than `max_dt`.
///
/// Returns `(count, dt)`. A non-positive interval yields no steps.
pub fn substeps(interval: f64, max_dt: f64) -> (usize, f64) {
    if interval.is_nan() || interval <= 0.0 {
        return (0, 0.0);
    }
    if max_dt.is_nan() || max_dt <= 0.0 || interval <= max_dt {
        return (1, interval);
    }
    let count = (interval / max_dt).ceil() as usize;
    (count, interval / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decay(x: &[f64; 1]) -> [f64; 1] {
        [-x[0]]
    }

    #[test]
    fn test_integrate() {
        assert_eq!(integrate(10.0, 5.0, 0.1), 10.5);
    }

    #[test]
    fn test_methods_order() {
        let exact = (-0.5_f64).exp();
        let error = |method| {
            let [x] = integrate_system([1.0], decay, 0.5, method);
            (x - exact).abs()
        };
        let euler = error(IntegrationMethod::Euler);
        let midpoint = error(IntegrationMethod::Midpoint);
        let rk4 = error(IntegrationMethod::Rk4);
        assert!(euler > midpoint);
        assert!(midpoint > rk4);
        assert!(rk4 < 1e-3);
    }

    #[test]
    fn test_coupled_system() {
        // rotation: x' = -y, y' = x
        let rotate = |s: &[f64; 2]| [-s[1], s[0]];
        let mut state = [1.0, 0.0];
        for _ in 0..100 {
            state = integrate_system(state, rotate, std::f64::consts::PI / 100.0, IntegrationMethod::Rk4);
        }
        assert!((state[0] + 1.0).abs() < 1e-6);
        assert!(state[1].abs() < 1e-6);
    }

    #[test]
    fn test_substeps() {
        assert_eq!(substeps(1.0, 0.25), (4, 0.25));
        assert_eq!(substeps(0.1, 0.25), (1, 0.1));
        assert_eq!(substeps(1.0, 0.0), (1, 1.0));
        assert_eq!(substeps(0.0, 0.25), (0, 0.0));
        let (n, dt) = substeps(1.0, 0.3);
        assert_eq!(n, 4);
        assert!((dt - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_method_config_names() {
        let method: IntegrationMethod = serde_json::from_str("\"rk4\"").unwrap();
        assert_eq!(method, IntegrationMethod::Rk4);
    }
}
