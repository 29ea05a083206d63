//! # Complex Survey Design
//!
//! Sampling weights, strata and primary sampling units (PSUs) for one analysis
//! unit, plus the Taylor-linearization variance of estimated totals that the
//! regression solver sandwiches around its information matrix.
//!
//! The lonely-PSU rule is a field of [`SurveyDesign`] rather than process-wide
//! state, so concurrently analyzed pairs never share a toggle.

use crate::matrix::add_scaled_outer;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use thiserror::Error;

/// How a stratum that contains a single PSU contributes to the variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LonelyPsu {
    /// Centre the lonely PSU total at the grand mean of all PSU totals.
    #[default]
    Adjust,
    /// Scale the variance by (number of strata) / (strata with more than one PSU).
    Average,
    /// Treat the lonely PSU as sampled with certainty (zero contribution).
    Certainty,
    /// Refuse to compute a variance.
    Fail,
}

/// Malformed survey-design inputs. These are configuration errors: no valid
/// design can be built from them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DesignError {
    #[error(
        "Survey design vectors disagree in length: {weights} weights, {strata} strata ids, {psus} PSU ids."
    )]
    LengthMismatch {
        weights: usize,
        strata: usize,
        psus: usize,
    },

    #[error("The survey design has no observations.")]
    Empty,

    #[error("Sampling weight at row {row} must be finite and strictly positive, but was {value}.")]
    InvalidWeight { row: usize, value: f64 },

    #[error(
        "PSU '{psu}' appears in strata '{first}' and '{second}'. Set nest = true if PSU ids are reused across strata."
    )]
    PsuNotNested {
        psu: String,
        first: String,
        second: String,
    },

    #[error("Stratum '{0}' contains a single PSU and the lonely-PSU policy is 'fail'.")]
    LonelyPsu(String),

    #[error("Expected {expected} rows of estimating-function contributions, found {found}.")]
    ScoreRowMismatch { found: usize, expected: usize },

    #[error("Domain mask has {found} entries, but the design has {expected} observations.")]
    MaskLengthMismatch { found: usize, expected: usize },
}

/// A stratified, clustered, weighted sample.
///
/// PSU bookkeeping is kept separately from the rows: a domain restriction drops
/// rows but keeps every PSU of the parent design, so PSUs without domain members
/// contribute a zero total instead of vanishing from the variance.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    weights: Array1<f64>,
    row_psu: Vec<usize>,
    psu_stratum: Vec<usize>,
    stratum_labels: Vec<String>,
    nest: bool,
    lonely_psu: LonelyPsu,
}

/// Builds a design from per-observation weights, stratum ids and PSU ids.
///
/// With `nest = true` PSU ids are only meaningful within their stratum (the
/// NHANES convention of PSU 1 and 2 in every stratum). With `nest = false` a PSU
/// id reused across strata is an error. The lonely-PSU policy defaults to
/// [`LonelyPsu::Adjust`]; see [`SurveyDesign::with_lonely_psu`].
pub fn make_design<S: Display, P: Display>(
    weights: Array1<f64>,
    strata: &[S],
    psu_ids: &[P],
    nest: bool,
) -> Result<SurveyDesign, DesignError> {
    let n = weights.len();
    if strata.len() != n || psu_ids.len() != n {
        return Err(DesignError::LengthMismatch {
            weights: n,
            strata: strata.len(),
            psus: psu_ids.len(),
        });
    }
    if n == 0 {
        return Err(DesignError::Empty);
    }
    if let Some((row, &value)) = weights
        .iter()
        .enumerate()
        .find(|(_, w)| !(w.is_finite() && **w > 0.0))
    {
        return Err(DesignError::InvalidWeight { row, value });
    }

    let strata: Vec<String> = strata.iter().map(|s| s.to_string()).collect();
    let psus: Vec<String> = psu_ids.iter().map(|p| p.to_string()).collect();

    let stratum_labels: Vec<String> = strata
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let stratum_index: AHashMap<&str, usize> = stratum_labels
        .iter()
        .enumerate()
        .map(|(i, label)| (label.as_str(), i))
        .collect();
    let row_stratum: Vec<usize> = strata.iter().map(|s| stratum_index[s.as_str()]).collect();

    if !nest {
        let mut owner: AHashMap<&str, usize> = AHashMap::new();
        for (psu, &h) in psus.iter().zip(row_stratum.iter()) {
            let first = *owner.entry(psu.as_str()).or_insert(h);
            if first != h {
                return Err(DesignError::PsuNotNested {
                    psu: psu.clone(),
                    first: stratum_labels[first].clone(),
                    second: stratum_labels[h].clone(),
                });
            }
        }
    }

    // Sorted keys make PSU numbering independent of row order.
    let keys: BTreeSet<(usize, &str)> = row_stratum
        .iter()
        .zip(psus.iter())
        .map(|(&h, psu)| (h, psu.as_str()))
        .collect();
    let psu_index: BTreeMap<(usize, &str), usize> =
        keys.iter().enumerate().map(|(i, &key)| (key, i)).collect();
    let psu_stratum: Vec<usize> = keys.iter().map(|&(h, _)| h).collect();
    let row_psu: Vec<usize> = row_stratum
        .iter()
        .zip(psus.iter())
        .map(|(&h, psu)| psu_index[&(h, psu.as_str())])
        .collect();

    let design = SurveyDesign {
        weights,
        row_psu,
        psu_stratum,
        stratum_labels,
        nest,
        lonely_psu: LonelyPsu::default(),
    };

    let lonely = design.lonely_strata();
    if !lonely.is_empty() {
        log::warn!(
            "{} of {} strata contain a single PSU ({}); lonely-PSU policy: {:?}",
            lonely.len(),
            design.num_strata(),
            lonely.join(", "),
            design.lonely_psu
        );
    }
    Ok(design)
}

impl SurveyDesign {
    /// Replaces the lonely-PSU policy.
    pub fn with_lonely_psu(mut self, policy: LonelyPsu) -> Self {
        self.lonely_psu = policy;
        self
    }

    pub fn lonely_psu(&self) -> LonelyPsu {
        self.lonely_psu
    }

    pub fn nest(&self) -> bool {
        self.nest
    }

    pub fn num_observations(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    pub fn num_strata(&self) -> usize {
        self.stratum_labels.len()
    }

    pub fn num_psus(&self) -> usize {
        self.psu_stratum.len()
    }

    /// Design degrees of freedom: number of PSUs minus number of strata.
    pub fn degrees_of_freedom(&self) -> usize {
        self.num_psus().saturating_sub(self.num_strata())
    }

    /// Labels of strata that contain exactly one PSU.
    pub fn lonely_strata(&self) -> Vec<&str> {
        self.psus_per_stratum()
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 1)
            .map(|(h, _)| self.stratum_labels[h].as_str())
            .collect()
    }

    fn psus_per_stratum(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.stratum_labels.len()];
        for &h in &self.psu_stratum {
            counts[h] += 1;
        }
        counts
    }

    /// Restricts the design to the rows where `keep` is true.
    ///
    /// Strata and PSUs of the full design are retained, which is the correct
    /// treatment of a subpopulation: variance is computed as if excluded rows had
    /// zero contribution.
    pub fn domain(&self, keep: &[bool]) -> Result<SurveyDesign, DesignError> {
        if keep.len() != self.num_observations() {
            return Err(DesignError::MaskLengthMismatch {
                found: keep.len(),
                expected: self.num_observations(),
            });
        }
        let rows: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| k.then_some(i))
            .collect();
        if rows.is_empty() {
            return Err(DesignError::Empty);
        }
        Ok(SurveyDesign {
            weights: self.weights.select(Axis(0), &rows),
            row_psu: rows.iter().map(|&i| self.row_psu[i]).collect(),
            psu_stratum: self.psu_stratum.clone(),
            stratum_labels: self.stratum_labels.clone(),
            nest: self.nest,
            lonely_psu: self.lonely_psu,
        })
    }

    /// Taylor-linearization covariance of the estimated total `sum_i u_i`.
    ///
    /// `contributions` holds one already-weighted row `u_i` per observation. Per
    /// stratum `h` with `n_h` PSU totals `U_hj`:
    /// `V_h = n_h / (n_h - 1) * sum_j (U_hj - mean_h)(U_hj - mean_h)'`.
    /// Single-PSU strata follow the design's [`LonelyPsu`] policy.
    pub fn total_variance(&self, contributions: ArrayView2<f64>) -> Result<Array2<f64>, DesignError> {
        if contributions.nrows() != self.num_observations() {
            return Err(DesignError::ScoreRowMismatch {
                found: contributions.nrows(),
                expected: self.num_observations(),
            });
        }
        let p = contributions.ncols();
        let mut totals = Array2::<f64>::zeros((self.num_psus(), p));
        for (row, &psu) in contributions.rows().into_iter().zip(self.row_psu.iter()) {
            let mut total = totals.row_mut(psu);
            total += &row;
        }

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); self.num_strata()];
        for (j, &h) in self.psu_stratum.iter().enumerate() {
            members[h].push(j);
        }

        let grand_mean = totals.sum_axis(Axis(0)) / self.num_psus() as f64;
        let mut variance = Array2::<f64>::zeros((p, p));
        let mut lonely = 0usize;
        let mut multi = 0usize;

        for (h, psus) in members.iter().enumerate() {
            match psus.len() {
                0 => {}
                1 => {
                    lonely += 1;
                    match self.lonely_psu {
                        LonelyPsu::Adjust => {
                            let deviation = &totals.row(psus[0]) - &grand_mean;
                            add_scaled_outer(&mut variance, deviation.view(), 1.0);
                        }
                        LonelyPsu::Average | LonelyPsu::Certainty => {}
                        LonelyPsu::Fail => {
                            return Err(DesignError::LonelyPsu(self.stratum_labels[h].clone()));
                        }
                    }
                }
                n_h => {
                    multi += 1;
                    let stratum_totals = totals.select(Axis(0), psus);
                    let mean = stratum_totals.sum_axis(Axis(0)) / n_h as f64;
                    let scale = n_h as f64 / (n_h as f64 - 1.0);
                    for total in stratum_totals.rows() {
                        let deviation = &total - &mean;
                        add_scaled_outer(&mut variance, deviation.view(), scale);
                    }
                }
            }
        }

        if self.lonely_psu == LonelyPsu::Average && lonely > 0 && multi > 0 {
            variance *= (lonely + multi) as f64 / multi as f64;
        }
        if lonely > 0 {
            log::debug!(
                "Variance used lonely-PSU policy {:?} for {} strata",
                self.lonely_psu,
                lonely
            );
        }
        Ok(variance)
    }
}
