use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A comprehensive error type for knot placement and basis construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasisError {
    #[error("A restricted cubic spline needs at least 3 knots, but {0} were given.")]
    TooFewKnots(usize),

    #[error("Knot {index} is not finite (found {value}).")]
    NonFiniteKnot { index: usize, value: f64 },

    #[error(
        "Knots must be strictly increasing, but knot {index} ({value}) does not exceed the previous knot ({previous}). The exposure has too few distinct values for this knot set."
    )]
    DegenerateKnots {
        index: usize,
        value: f64,
        previous: f64,
    },

    #[error("Knot percentile {0} lies outside [0, 100].")]
    InvalidPercentile(f64),

    #[error(
        "Only {non_missing} of {total} exposure values are present; at least {required_percent:.0}% are required to place knots."
    )]
    MissingData {
        non_missing: usize,
        total: usize,
        required_percent: f64,
    },

    #[error("No default knot percentiles exist for {0} knots; list the percentiles explicitly.")]
    NoDefaultPercentiles(usize),
}

/// An ordered, strictly increasing set of spline knots.
///
/// The invariants are checked once at construction, so every `KnotSet` in the
/// program is usable by [`build_basis`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct KnotSet(Vec<f64>);

impl KnotSet {
    pub fn new(knots: Vec<f64>) -> Result<Self, BasisError> {
        if knots.len() < 3 {
            return Err(BasisError::TooFewKnots(knots.len()));
        }
        for (index, &value) in knots.iter().enumerate() {
            if !value.is_finite() {
                return Err(BasisError::NonFiniteKnot { index, value });
            }
        }
        for index in 1..knots.len() {
            let previous = knots[index - 1];
            let value = knots[index];
            if value <= previous {
                return Err(BasisError::DegenerateKnots {
                    index,
                    value,
                    previous,
                });
            }
        }
        Ok(Self(knots))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of basis columns generated by this knot set: `k - 1`.
    pub fn num_basis_columns(&self) -> usize {
        self.0.len() - 1
    }
}

impl TryFrom<Vec<f64>> for KnotSet {
    type Error = BasisError;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KnotSet> for Vec<f64> {
    fn from(value: KnotSet) -> Self {
        value.0
    }
}

/// Harrell's recommended knot percentiles for 3 to 7 knots.
pub fn default_percentiles(num_knots: usize) -> Result<Vec<f64>, BasisError> {
    let percentiles = match num_knots {
        3 => vec![10.0, 50.0, 90.0],
        4 => vec![5.0, 35.0, 65.0, 95.0],
        5 => vec![5.0, 27.5, 50.0, 72.5, 95.0],
        6 => vec![5.0, 23.0, 41.0, 59.0, 77.0, 95.0],
        7 => vec![2.5, 18.3333, 34.1667, 50.0, 65.8333, 81.6667, 97.5],
        other => return Err(BasisError::NoDefaultPercentiles(other)),
    };
    Ok(percentiles)
}

/// Places knots at empirical percentiles of an exposure series.
///
/// Missing (non-finite) observations are ignored for the quantiles, but the
/// series must be at least `min_non_missing_fraction` complete. Quantiles use
/// linear interpolation between order statistics (R type 7). A series with too
/// few distinct values yields [`BasisError::DegenerateKnots`] instead of a basis
/// with tied columns.
pub fn compute_knots(
    values: ArrayView1<f64>,
    percentiles: &[f64],
    min_non_missing_fraction: f64,
) -> Result<KnotSet, BasisError> {
    for &p in percentiles {
        if !(0.0..=100.0).contains(&p) {
            return Err(BasisError::InvalidPercentile(p));
        }
    }
    if percentiles.len() < 3 {
        return Err(BasisError::TooFewKnots(percentiles.len()));
    }

    let total = values.len();
    let sorted = internal::sorted_finite(values);
    let required = min_non_missing_fraction * total as f64;
    if sorted.is_empty() || (sorted.len() as f64) < required {
        return Err(BasisError::MissingData {
            non_missing: sorted.len(),
            total,
            required_percent: min_non_missing_fraction * 100.0,
        });
    }

    let knots = percentiles
        .iter()
        .map(|&p| internal::quantile_sorted(&sorted, p / 100.0))
        .collect();
    KnotSet::new(knots)
}

/// Empirical quantiles (type 7) of the finite entries of `values`.
///
/// Returns `None` when no finite value exists.
pub fn quantiles(values: ArrayView1<f64>, probabilities: &[f64]) -> Option<Vec<f64>> {
    let sorted = internal::sorted_finite(values);
    if sorted.is_empty() {
        return None;
    }
    Some(
        probabilities
            .iter()
            .map(|&p| internal::quantile_sorted(&sorted, p))
            .collect(),
    )
}

/// Builds the restricted cubic spline design matrix for `values`.
///
/// Column 0 is the raw value. Column `j` (for `j = 1..k-1`) is
///
/// ```text
/// [ (x - t_j)+^3 - (x - t_{k-1})+^3 (t_k - t_j) / (t_k - t_{k-1})
///               + (x - t_k)+^3     (t_{k-1} - t_j) / (t_k - t_{k-1}) ] / (t_k - t_1)^2
/// ```
///
/// using the knots `t_1 < ... < t_k`. Every linear combination of the columns is
/// linear below `t_1` and above `t_k`. Rows with a missing value are all `NaN`;
/// no row is ever dropped, so the caller keeps control of the exclusion policy.
pub fn build_basis(values: ArrayView1<f64>, knots: &KnotSet) -> Array2<f64> {
    let mut basis = Array2::zeros((values.len(), knots.num_basis_columns()));
    for (i, &x) in values.iter().enumerate() {
        internal::fill_row(x, knots.as_slice(), basis.row_mut(i));
    }
    basis
}

/// Evaluates the basis at a single point.
pub fn basis_row(x: f64, knots: &KnotSet) -> ndarray::Array1<f64> {
    let mut row = ndarray::Array1::zeros(knots.num_basis_columns());
    internal::fill_row(x, knots.as_slice(), row.view_mut());
    row
}

/// Column names for the basis of `exposure`: `x`, `x'`, `x''`, ...
pub fn basis_column_names(exposure: &str, knots: &KnotSet) -> Vec<String> {
    (0..knots.num_basis_columns())
        .map(|j| format!("{exposure}{}", "'".repeat(j)))
        .collect()
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn sorted_finite(values: ArrayView1<f64>) -> Vec<f64> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_unstable_by(f64::total_cmp);
        sorted
    }

    /// Linear-interpolation quantile of pre-sorted data, `p` in `[0, 1]`.
    pub(super) fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
        let n = sorted.len();
        let float_idx = (n as f64 - 1.0) * p;
        let lower_idx = float_idx.floor() as usize;
        let upper_idx = (float_idx.ceil() as usize).min(n - 1);

        if lower_idx == upper_idx {
            sorted[lower_idx]
        } else {
            let fraction = float_idx - lower_idx as f64;
            sorted[lower_idx] * (1.0 - fraction) + sorted[upper_idx] * fraction
        }
    }

    #[inline]
    fn cube_pos(v: f64) -> f64 {
        if v > 0.0 { v * v * v } else { 0.0 }
    }

    pub(super) fn fill_row(x: f64, t: &[f64], mut row: ArrayViewMut1<f64>) {
        if !x.is_finite() {
            row.fill(f64::NAN);
            return;
        }
        let k = t.len();
        let t_first = t[0];
        let t_penult = t[k - 2];
        let t_last = t[k - 1];
        let norm = (t_last - t_first) * (t_last - t_first);
        let tail_span = t_last - t_penult;
        let tail_penult = cube_pos(x - t_penult);
        let tail_last = cube_pos(x - t_last);

        row[0] = x;
        for j in 0..k - 2 {
            let tj = t[j];
            let value = cube_pos(x - tj) - tail_penult * (t_last - tj) / tail_span
                + tail_last * (t_penult - tj) / tail_span;
            row[j + 1] = value / norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    fn knots(values: &[f64]) -> KnotSet {
        KnotSet::new(values.to_vec()).unwrap()
    }

    #[test]
    fn column_count_is_knots_minus_one() {
        for k in 3..=7 {
            let set = KnotSet::new((0..k).map(|i| i as f64 * 2.5).collect()).unwrap();
            for n in [1usize, 2, 17] {
                let values = Array1::linspace(-1.0, 20.0, n);
                let basis = build_basis(values.view(), &set);
                assert_eq!(basis.shape(), &[n, k - 1]);
            }
        }
    }

    #[test]
    fn basis_is_bit_identical_across_calls() {
        let set = knots(&[1.3, 4.7, 9.1, 22.0]);
        let values = Array1::linspace(-3.0, 30.0, 257);
        let first = build_basis(values.view(), &set);
        let second = build_basis(values.view(), &set);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn nonlinear_columns_vanish_below_first_knot() {
        let set = knots(&[1.0, 3.0, 6.0, 10.0]);
        let row = basis_row(0.5, &set);
        assert_eq!(row[0], 0.5);
        assert_eq!(row[1], 0.0);
        assert_eq!(row[2], 0.0);
    }

    #[test]
    fn spline_is_linear_beyond_last_knot() {
        let set = knots(&[1.0, 3.0, 6.0, 10.0]);
        let xs = [12.0, 14.0, 16.0, 18.0];
        let rows: Vec<_> = xs.iter().map(|&x| basis_row(x, &set)).collect();
        for col in 0..3 {
            let first_diff_a = rows[1][col] - rows[0][col];
            let first_diff_b = rows[2][col] - rows[1][col];
            let first_diff_c = rows[3][col] - rows[2][col];
            assert!((first_diff_b - first_diff_a).abs() < 1e-9);
            assert!((first_diff_c - first_diff_b).abs() < 1e-9);
        }
    }

    #[test]
    fn hand_computed_value_matches() {
        // k = 3, knots 0, 1, 2: column 1 at x = 1.5 is (1.5^3 - 0.5^3 * 2 / 1) / 4.
        let set = knots(&[0.0, 1.0, 2.0]);
        let row = basis_row(1.5, &set);
        let expected = (1.5f64.powi(3) - 0.5f64.powi(3) * 2.0) / 4.0;
        assert!((row[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn missing_values_propagate_as_nan_rows() {
        let set = knots(&[1.0, 2.0, 3.0, 4.0]);
        let basis = build_basis(array![1.5, f64::NAN, 3.5].view(), &set);
        assert_eq!(basis.nrows(), 3);
        assert!(basis.row(1).iter().all(|v| v.is_nan()));
        assert!(basis.row(0).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn quantile_knots_follow_type_seven_interpolation() {
        let data = array![0., 1., 2., 5., 8., 9., 10.];
        let set = compute_knots(data.view(), &[25.0, 50.0, 75.0], 0.9).unwrap();
        assert_eq!(set.as_slice(), &[1.5, 5.0, 8.5]);
    }

    #[test]
    fn constant_exposure_yields_degenerate_knots() {
        let data = Array1::from_elem(40, 3.0);
        let err = compute_knots(data.view(), &[5.0, 35.0, 65.0, 95.0], 0.9).unwrap_err();
        assert!(matches!(err, BasisError::DegenerateKnots { .. }));
    }

    #[test]
    fn sparse_series_is_rejected_as_missing() {
        let mut data = Array1::linspace(0.0, 10.0, 20);
        for i in 0..3 {
            data[i] = f64::NAN;
        }
        let err = compute_knots(data.view(), &[5.0, 35.0, 65.0, 95.0], 0.9).unwrap_err();
        match err {
            BasisError::MissingData {
                non_missing, total, ..
            } => {
                assert_eq!(non_missing, 17);
                assert_eq!(total, 20);
            }
            other => panic!("expected MissingData, got {other:?}"),
        }
        assert!(compute_knots(data.view(), &[5.0, 35.0, 65.0, 95.0], 0.8).is_ok());
    }

    #[test]
    fn knot_set_validation() {
        assert!(matches!(
            KnotSet::new(vec![1.0, 2.0]),
            Err(BasisError::TooFewKnots(2))
        ));
        assert!(matches!(
            KnotSet::new(vec![1.0, 2.0, 2.0]),
            Err(BasisError::DegenerateKnots { index: 2, .. })
        ));
        assert!(matches!(
            KnotSet::new(vec![1.0, f64::INFINITY, 3.0]),
            Err(BasisError::NonFiniteKnot { index: 1, .. })
        ));
    }

    #[test]
    fn default_percentiles_cover_harrell_table() {
        assert_eq!(default_percentiles(4).unwrap(), vec![5.0, 35.0, 65.0, 95.0]);
        assert_eq!(default_percentiles(3).unwrap().len(), 3);
        assert!(matches!(
            default_percentiles(9),
            Err(BasisError::NoDefaultPercentiles(9))
        ));
    }

    #[test]
    fn column_names_use_prime_suffixes() {
        let set = knots(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(basis_column_names("antho", &set), vec!["antho", "antho'", "antho''"]);
    }
}
