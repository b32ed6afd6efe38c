use serde::Serialize;

use super::lms::{LmsParams, PERCENTILE_Z, PercentileBand, interpolate_lms, lms_inverse, z_score};
use super::tables::{GrowthMetric, ReferenceSet, Sex};
use crate::units::{UnitSystem, cm_to_in, in_to_cm, kg_to_lb, lb_to_kg, round2};

/// Average month length used to map chart months onto reference-table days.
pub const DAYS_PER_MONTH: f64 = 30.4375;

/// Charts always span at least this many months when the table reaches that far.
pub const MIN_CHART_MONTHS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurvePoint {
    pub age_months: u32,
    pub p3: Option<f64>,
    pub p15: Option<f64>,
    pub p50: Option<f64>,
    pub p85: Option<f64>,
    pub p97: Option<f64>,
}

/// A measurement placed on the reference distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileReading {
    pub z: f64,
    pub band: PercentileBand,
    pub median: f64,
}

/// Build the 3/15/50/85/97 percentile curves from month 0 through
/// `max(min(max_months, last_table_month), min(12, last_table_month))`.
///
/// A missing table yields an empty series; undefined or non-finite points are `None`.
#[must_use]
pub fn build_who_curve(
    reference: &ReferenceSet,
    metric: GrowthMetric,
    sex: Sex,
    max_months: u32,
    units: UnitSystem,
) -> Vec<CurvePoint> {
    let Some(rows) = reference.table(metric, sex) else {
        tracing::debug!(%metric, %sex, "no reference table, returning empty curve");
        return Vec::new();
    };
    let Some(last) = rows.last() else {
        return Vec::new();
    };

    let last_table_month = (f64::from(last.age_days) / DAYS_PER_MONTH).round() as u32;
    let end = max_months
        .min(last_table_month)
        .max(MIN_CHART_MONTHS.min(last_table_month));

    (0..=end)
        .map(|month| {
            let age_days = f64::from(month) * DAYS_PER_MONTH;
            let params = interpolate_lms(rows, age_days);
            let at = |z: f64| {
                params
                    .and_then(|p| lms_inverse(p, z))
                    .map(|raw| round2(to_display(metric, raw, units)))
                    .filter(|v| v.is_finite())
            };
            let [p3, p15, p50, p85, p97] = PERCENTILE_Z.map(|(_, z)| at(z));
            CurvePoint {
                age_months: month,
                p3,
                p15,
                p50,
                p85,
                p97,
            }
        })
        .collect()
}

/// [`build_who_curve`] over the bundled WHO tables.
#[must_use]
pub fn build_who_curve_data(
    metric: GrowthMetric,
    sex: Sex,
    max_months: u32,
    units: UnitSystem,
) -> Vec<CurvePoint> {
    build_who_curve(ReferenceSet::who(), metric, sex, max_months, units)
}

/// Place a measurement (in `units`) taken at `age_days` on the reference distribution.
#[must_use]
pub fn percentile_for(
    reference: &ReferenceSet,
    metric: GrowthMetric,
    sex: Sex,
    age_days: f64,
    value: f64,
    units: UnitSystem,
) -> Option<PercentileReading> {
    let rows = reference.table(metric, sex)?;
    let params: LmsParams = interpolate_lms(rows, age_days)?;
    let raw = from_display(metric, value, units);
    let z = z_score(params, raw)?;
    Some(PercentileReading {
        z,
        band: PercentileBand::from_z(z),
        median: round2(to_display(metric, params.m, units)),
    })
}

fn to_display(metric: GrowthMetric, raw: f64, units: UnitSystem) -> f64 {
    match (metric, units) {
        (_, UnitSystem::Metric) => raw,
        (GrowthMetric::Weight, UnitSystem::Imperial) => kg_to_lb(raw),
        (GrowthMetric::Length | GrowthMetric::Head, UnitSystem::Imperial) => cm_to_in(raw),
    }
}

fn from_display(metric: GrowthMetric, value: f64, units: UnitSystem) -> f64 {
    match (metric, units) {
        (_, UnitSystem::Metric) => value,
        (GrowthMetric::Weight, UnitSystem::Imperial) => lb_to_kg(value),
        (GrowthMetric::Length | GrowthMetric::Head, UnitSystem::Imperial) => in_to_cm(value),
    }
}
