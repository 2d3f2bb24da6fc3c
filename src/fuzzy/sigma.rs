//! Per-point local scale fitting.
//!
//! For a point with sorted neighbor distances `d_1 ≤ … ≤ d_k`, find σ with
//!
//! ```text
//! Σ_j exp(−max(0, d_j − ρ) / σ) = log2(k)
//! ```
//!
//! where ρ is the smallest non-zero distance. The left side grows
//! monotonically with σ, so a bisection that doubles its upper bound until
//! the target is bracketed always terminates.

/// Bisection iteration cap.
pub const SIGMA_ITERATIONS: usize = 64;

/// Absolute tolerance on the membership sum.
pub const SIGMA_TOLERANCE: f32 = 1e-5;

const MIN_SCALE: f32 = 1e-3;

/// Outcome of fitting one σ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SigmaFit {
    /// The membership sum reached the target within tolerance.
    Converged {
        /// Fitted scale.
        sigma: f32,
        /// Bisection steps used.
        iterations: usize,
    },
    /// The target could not be bracketed; a floor value is used instead.
    Fallback {
        /// Scale actually used.
        sigma: f32,
    },
    /// Distances were non-finite; no usable scale exists.
    Failed,
}

impl SigmaFit {
    /// The usable scale, if any.
    pub fn sigma(&self) -> Option<f32> {
        match *self {
            SigmaFit::Converged { sigma, .. } | SigmaFit::Fallback { sigma } => Some(sigma),
            SigmaFit::Failed => None,
        }
    }

    /// True when the fallback path was taken.
    pub fn is_fallback(&self) -> bool {
        matches!(self, SigmaFit::Fallback { .. })
    }
}

/// Smallest non-zero distance (0 when all distances are zero).
pub fn local_connectivity(distances: &[f32]) -> f32 {
    distances
        .iter()
        .copied()
        .find(|&d| d > 0.0)
        .unwrap_or(0.0)
}

/// Fit σ for one point's ascending neighbor distances.
///
/// Returns `(rho, fit)`.
pub fn smooth_knn(distances: &[f32], target: f32) -> (f32, SigmaFit) {
    if distances.is_empty() || distances.iter().any(|d| !d.is_finite() || *d < 0.0) {
        return (0.0, SigmaFit::Failed);
    }
    let rho = local_connectivity(distances);
    let mean = distances.iter().sum::<f32>() / distances.len() as f32;
    let floor = if mean > 0.0 { MIN_SCALE * mean } else { MIN_SCALE };

    if distances.iter().all(|&d| d == 0.0) {
        return (rho, SigmaFit::Fallback { sigma: floor });
    }

    let membership_sum = |sigma: f32| -> f32 {
        distances
            .iter()
            .map(|&d| {
                let gap = d - rho;
                if gap <= 0.0 {
                    1.0
                } else {
                    (-gap / sigma).exp()
                }
            })
            .sum()
    };

    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut mid = 1.0f32;
    for iteration in 0..SIGMA_ITERATIONS {
        let psum = membership_sum(mid);
        if (psum - target).abs() < SIGMA_TOLERANCE {
            let sigma = mid.max(floor);
            return (
                rho,
                SigmaFit::Converged {
                    sigma,
                    iterations: iteration + 1,
                },
            );
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() {
                mid * 2.0
            } else {
                (lo + hi) / 2.0
            };
        }
        if !mid.is_finite() {
            break;
        }
    }

    let sigma = if mid.is_finite() { mid.max(floor) } else { floor };
    (rho, SigmaFit::Fallback { sigma })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_converges_to_target() {
        let d = [0.5f32, 0.7, 0.9, 1.2, 1.3, 1.8, 2.0, 2.4];
        let target = (d.len() as f32).log2();
        let (rho, fit) = smooth_knn(&d, target);
        assert_eq!(rho, 0.5);
        let SigmaFit::Converged { sigma, .. } = fit else {
            panic!("expected convergence, got {fit:?}");
        };
        let sum: f32 = d.iter().map(|&x| (-(x - rho).max(0.0) / sigma).exp()).sum();
        assert_relative_eq!(sum, target, epsilon = 1e-4);
    }

    #[test]
    fn test_all_zero_distances_fall_back() {
        let (rho, fit) = smooth_knn(&[0.0; 6], 6f32.log2());
        assert_eq!(rho, 0.0);
        assert_eq!(fit, SigmaFit::Fallback { sigma: 1e-3 });
    }

    #[test]
    fn test_duplicates_skip_zero_for_rho() {
        let (rho, _) = smooth_knn(&[0.0, 0.0, 0.3, 0.4], 2.0);
        assert_eq!(rho, 0.3);
    }

    #[test]
    fn test_non_finite_fails() {
        let (_, fit) = smooth_knn(&[0.1, f32::NAN, 0.3], 1.5);
        assert_eq!(fit, SigmaFit::Failed);
        assert!(fit.sigma().is_none());
    }

    #[test]
    fn test_single_neighbor_uses_fallback() {
        // log2(1) = 0 can never be reached: the nearest neighbor always contributes 1.
        let (_, fit) = smooth_knn(&[2.0], 0.0);
        assert!(fit.is_fallback());
        assert!(fit.sigma().is_some_and(|s| s > 0.0));
    }

    proptest! {
        #[test]
        fn sigma_is_positive_and_finite(
            mut d in proptest::collection::vec(0.0f32..100.0, 2..40),
        ) {
            d.sort_by(f32::total_cmp);
            let target = (d.len() as f32).log2();
            let (_, fit) = smooth_knn(&d, target);
            let sigma = fit.sigma().unwrap();
            prop_assert!(sigma.is_finite() && sigma > 0.0);
        }
    }
}
