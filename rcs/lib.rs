#![deny(unused_variables)]
//! Survey-weighted restricted-cubic-spline dose-response analysis.
//!
//! The pipeline for one (outcome, exposure) pair runs
//! [`basis`] (knots and spline columns) → [`model`] (model matrix) →
//! [`design`] (domain of the survey design) → [`irls`] (weighted logistic fit
//! with sandwich covariance) → [`wald`] (overall and nonlinearity tests) →
//! [`predict`] (odds-ratio curve). [`batch`] runs every pair in parallel and
//! [`fdr`] corrects the p-values across the batch.

pub mod basis;
pub mod batch;
pub mod config;
pub mod data;
pub mod design;
pub mod fdr;
pub mod irls;
pub mod matrix;
pub mod model;
pub mod predict;
pub mod report;
pub mod types;
pub mod wald;
