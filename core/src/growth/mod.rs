//! Growth reference tables and percentile curves.

pub mod curve;
pub mod lms;
pub mod tables;

pub use curve::{CurvePoint, PercentileReading, build_who_curve, build_who_curve_data, percentile_for};
pub use lms::{GrowthReferenceRow, LmsParams, PercentileBand, interpolate_lms, lms_inverse, z_score};
pub use tables::{GrowthMetric, ReferenceSet, Sex};
