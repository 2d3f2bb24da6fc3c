//! Low-dimensional similarity curve.
//!
//! Embedded distances are scored with `1 / (1 + a·d^(2b))`. The pair `(a, b)`
//! is fitted by least squares to the target curve
//!
//! ```text
//! ψ(d) = 1                              d < min_dist
//!        exp(−(d − min_dist) / spread)  otherwise
//! ```
//!
//! sampled on 300 evenly spaced points of `[0, 3·spread]`.

const SAMPLES: usize = 300;
const MAX_ITER: usize = 200;

/// Fitted `(a, b)` curve parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveParams {
    /// Scale of the kernel.
    pub a: f32,
    /// Exponent of the kernel.
    pub b: f32,
}

impl CurveParams {
    /// Fit `(a, b)` by Levenberg–Marquardt.
    pub fn fit(spread: f32, min_dist: f32) -> Self {
        let (spread, min_dist) = (spread as f64, min_dist as f64);
        let xs: Vec<f64> = (0..SAMPLES)
            .map(|i| 3.0 * spread * i as f64 / (SAMPLES - 1) as f64)
            .collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| {
                if x < min_dist {
                    1.0
                } else {
                    (-(x - min_dist) / spread).exp()
                }
            })
            .collect();

        let cost = |a: f64, b: f64| -> f64 {
            xs.iter()
                .zip(&ys)
                .map(|(&x, &y)| {
                    let r = 1.0 / (1.0 + a * x.powf(2.0 * b)) - y;
                    r * r
                })
                .sum()
        };

        let (mut a, mut b) = (1.0f64, 1.0f64);
        let mut current = cost(a, b);
        let mut lambda = 1e-3;
        for _ in 0..MAX_ITER {
            // Normal equations of the 2-parameter problem.
            let (mut jtj, mut jtr) = ([[0.0f64; 2]; 2], [0.0f64; 2]);
            for (&x, &y) in xs.iter().zip(&ys) {
                if x <= 0.0 {
                    continue;
                }
                let p = x.powf(2.0 * b);
                let denom = 1.0 + a * p;
                let f = 1.0 / denom;
                let da = -p / (denom * denom);
                let db = -a * p * 2.0 * x.ln() / (denom * denom);
                let r = f - y;
                jtj[0][0] += da * da;
                jtj[0][1] += da * db;
                jtj[1][1] += db * db;
                jtr[0] += da * r;
                jtr[1] += db * r;
            }
            jtj[1][0] = jtj[0][1];

            let m00 = jtj[0][0] * (1.0 + lambda);
            let m11 = jtj[1][1] * (1.0 + lambda);
            let det = m00 * m11 - jtj[0][1] * jtj[1][0];
            if det.abs() < 1e-300 {
                break;
            }
            let step_a = -(m11 * jtr[0] - jtj[0][1] * jtr[1]) / det;
            let step_b = -(m00 * jtr[1] - jtj[1][0] * jtr[0]) / det;

            let (na, nb) = (a + step_a, b + step_b);
            let candidate = if na > 0.0 && nb > 0.0 {
                cost(na, nb)
            } else {
                f64::INFINITY
            };
            if candidate < current {
                let improvement = current - candidate;
                a = na;
                b = nb;
                current = candidate;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement < 1e-14 {
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
            }
        }

        Self {
            a: a as f32,
            b: b as f32,
        }
    }
}
