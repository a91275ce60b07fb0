// ========================================================================================
//
//                      THE INCREMENTAL REGRESSION ENGINE
//
// ========================================================================================
//
// ### Purpose ###
//
// Fits Y = Xβ + ε over chunked data without ever materializing X, Y, or XᵀX.
// The accumulator state is an upper-triangular factor R of order p+2 (columns:
// p predictors, intercept, response) such that RᵀR equals the augmented
// cross-product matrix of every row absorbed so far. Each incoming row is
// eliminated into R by a sequence of Givens rotations at O(p²) per row, the
// same asymptotic cost as batch QR, but with bounded memory and without the
// cancellation risk of forming and inverting XᵀX.
//
// Two independently built factors merge by eliminating the rows of one into
// the other, which re-establishes a single valid factor equivalent to having
// processed both row sets in either order. That is exactly the associativity
// the executor's combine contract demands.

use crate::aggregate::{Accumulator, AccumulatorError};
use crate::executor::ChunkBlock;
use ndarray::Array2;

/// Relative pivot tolerance: a diagonal entry below this fraction of the
/// largest diagonal is treated as a dead (collinear) column.
const PIVOT_RTOL: f64 = 1e-12;

/// The result of a finalized fit.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    /// Intercept first, then one slope per predictor in caller order.
    pub coefficients: Vec<f64>,
    /// Residual sum of squares, read off the final diagonal entry of R.
    pub rss: f64,
    pub observations: u64,
}

/// Accumulated factor plus the number of rows it has seen.
#[derive(Debug, Clone)]
pub struct CholeskyState {
    /// Upper-triangular, order p+2, diagonal non-negative by construction.
    r: Array2<f64>,
    n: u64,
}

impl CholeskyState {
    /// Diagonal entry, exposed for invariant checks in tests.
    #[cfg(test)]
    fn diag(&self, k: usize) -> f64 {
        self.r[[k, k]]
    }
}

/// The regression engine as an executor accumulator. Expects blocks that are
/// `p + 1` columns wide: the predictors in order, then the response.
pub struct LinearFitAccumulator {
    predictors: usize,
    ridge: f64,
}

impl LinearFitAccumulator {
    /// `ridge` adds λ·I to the coefficient block of the cross-product matrix.
    /// Zero means ordinary least squares.
    pub fn new(predictors: usize, ridge: f64) -> Self {
        Self { predictors, ridge }
    }

    /// Order of R: p predictors + intercept + response.
    #[inline]
    fn order(&self) -> usize {
        self.predictors + 2
    }
}

/// Eliminates one row into the factor via Givens rotations. `v` is destroyed.
fn eliminate_row(r: &mut Array2<f64>, v: &mut [f64]) {
    let m = v.len();
    for k in 0..m {
        let vk = v[k];
        if vk == 0.0 {
            continue;
        }
        let rkk = r[[k, k]];
        let rad = rkk.hypot(vk);
        let c = rkk / rad;
        let s = vk / rad;
        r[[k, k]] = rad;
        for j in (k + 1)..m {
            let rkj = r[[k, j]];
            let vj = v[j];
            r[[k, j]] = c * rkj + s * vj;
            v[j] = c * vj - s * rkj;
        }
    }
}

impl Accumulator for LinearFitAccumulator {
    type State = CholeskyState;
    type Output = LinearFit;

    fn initial_state(&self) -> CholeskyState {
        CholeskyState {
            r: Array2::zeros((self.order(), self.order())),
            n: 0,
        }
    }

    fn absorb(
        &self,
        mut state: CholeskyState,
        block: &ChunkBlock,
    ) -> Result<CholeskyState, AccumulatorError> {
        let m = self.order();
        debug_assert_eq!(block.cols(), self.predictors + 1);

        let mut v = vec![0.0f64; m];
        for row in block.rows() {
            let (xs, y) = row.split_at(self.predictors);
            v[..self.predictors].copy_from_slice(xs);
            v[self.predictors] = 1.0; // intercept column
            v[self.predictors + 1] = y[0];
            eliminate_row(&mut state.r, &mut v);
            state.n += 1;
        }
        Ok(state)
    }

    fn combine(
        &self,
        mut a: CholeskyState,
        b: CholeskyState,
    ) -> Result<CholeskyState, AccumulatorError> {
        let m = self.order();
        // Stacking Ra over Rb and re-triangularizing is the same as feeding
        // Rb's rows through the rotation sequence one by one.
        let mut v = vec![0.0f64; m];
        for i in 0..m {
            for j in 0..m {
                v[j] = b.r[[i, j]];
            }
            eliminate_row(&mut a.r, &mut v);
        }
        a.n += b.n;
        Ok(a)
    }

    fn finalize(&self, state: CholeskyState) -> Result<LinearFit, AccumulatorError> {
        if state.n == 0 {
            return Err(AccumulatorError::EmptyInput);
        }
        let m = self.order();
        let coeffs = self.predictors + 1; // predictors + intercept
        let mut r = state.r;

        // The ridge rows are folded in exactly once, here, so that combine
        // stays associative no matter how many partial states existed.
        if self.ridge > 0.0 {
            let lambda = self.ridge.sqrt();
            let mut v = vec![0.0f64; m];
            for k in 0..coeffs {
                v.fill(0.0);
                v[k] = lambda;
                eliminate_row(&mut r, &mut v);
            }
        }

        let max_diag = (0..coeffs).map(|k| r[[k, k]]).fold(0.0f64, f64::max);
        let tol = max_diag * PIVOT_RTOL;
        for k in 0..coeffs {
            if r[[k, k]] <= tol {
                return Err(AccumulatorError::SingularDesign { column: k });
            }
        }

        // Back-substitute R[0..coeffs, 0..coeffs] β = R[0..coeffs, response].
        let response = coeffs;
        let mut beta = vec![0.0f64; coeffs];
        for k in (0..coeffs).rev() {
            let mut acc = r[[k, response]];
            for j in (k + 1)..coeffs {
                acc -= r[[k, j]] * beta[j];
            }
            beta[k] = acc / r[[k, k]];
        }

        // Reorder to intercept-first for the caller.
        let mut coefficients = Vec::with_capacity(coeffs);
        coefficients.push(beta[self.predictors]);
        coefficients.extend_from_slice(&beta[..self.predictors]);

        let rss = r[[response, response]] * r[[response, response]];
        Ok(LinearFit {
            coefficients,
            rss,
            observations: state.n,
        })
    }
}
