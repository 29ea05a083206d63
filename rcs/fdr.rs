//! Multiple-testing correction across the pairs of a batch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// Benjamini-Hochberg false discovery rate.
    #[default]
    BenjaminiHochberg,
    Bonferroni,
    None,
}

/// Benjamini-Hochberg step-up adjustment.
///
/// Returns adjusted values in the input order. For ascending p-values
/// `p_(1) <= ... <= p_(n)`, `q_(i) = min_{j >= i} min(1, p_(j) n / j)`. Ties
/// share the adjusted value of the highest rank in the tie.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0f64;
    for (rank0, &i) in order.iter().enumerate().rev() {
        let rank = (rank0 + 1) as f64;
        running_min = running_min.min(p_values[i] * n as f64 / rank);
        adjusted[i] = running_min;
    }
    adjusted
}

/// Bonferroni adjustment, capped at 1.
pub fn bonferroni(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len() as f64;
    p_values.iter().map(|&p| (p * n).min(1.0)).collect()
}

/// Applies `correction` to the present p-values only.
///
/// Missing entries are excluded from the family size and stay missing.
pub fn adjust_with_missing(p_values: &[Option<f64>], correction: Correction) -> Vec<Option<f64>> {
    let (positions, present): (Vec<usize>, Vec<f64>) = p_values
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.filter(|v| v.is_finite()).map(|v| (i, v)))
        .unzip();
    let adjusted = match correction {
        Correction::BenjaminiHochberg => benjamini_hochberg(&present),
        Correction::Bonferroni => bonferroni(&present),
        Correction::None => present,
    };
    let mut out = vec![None; p_values.len()];
    for (i, q) in positions.into_iter().zip(adjusted) {
        out[i] = Some(q);
    }
    out
}
