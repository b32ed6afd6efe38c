//! LMS (Box-Cox) growth reference math.

use serde::{Deserialize, Serialize};

/// |L| below this is treated as zero and the log-normal form is used.
pub const L_EPSILON: f64 = 1e-7;

/// z-scores of the standard chart percentiles (inverse normal CDF at 3/15/50/85/97 %).
pub const PERCENTILE_Z: [(u8, f64); 5] = [
    (3, -1.880_793_608),
    (15, -1.036_433_389),
    (50, 0.0),
    (85, 1.036_433_389),
    (97, 1.880_793_608),
];

/// One row of a growth reference table for a single metric and sex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthReferenceRow {
    pub age_days: u32,
    pub l: f64,
    pub m: f64,
    pub s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmsParams {
    pub l: f64,
    pub m: f64,
    pub s: f64,
}

impl From<&GrowthReferenceRow> for LmsParams {
    fn from(row: &GrowthReferenceRow) -> Self {
        Self {
            l: row.l,
            m: row.m,
            s: row.s,
        }
    }
}

/// Interpolate L, M and S at `age_days` from rows sorted ascending by age.
///
/// Ages outside the table clamp to the first or last row. Returns `None` for an
/// empty table.
#[must_use]
pub fn interpolate_lms(rows: &[GrowthReferenceRow], age_days: f64) -> Option<LmsParams> {
    let first = rows.first()?;
    let last = rows.last()?;

    if age_days <= f64::from(first.age_days) {
        return Some(first.into());
    }
    if age_days >= f64::from(last.age_days) {
        return Some(last.into());
    }

    // First row strictly older than the query; the one before it brackets from below.
    let upper_idx = rows.partition_point(|r| f64::from(r.age_days) <= age_days);
    let lower = &rows[upper_idx - 1];
    if (f64::from(lower.age_days) - age_days).abs() < f64::EPSILON {
        return Some(lower.into());
    }
    let upper = &rows[upper_idx];

    let span = f64::from(upper.age_days) - f64::from(lower.age_days);
    let t = (age_days - f64::from(lower.age_days)) / span;
    let lerp = |a: f64, b: f64| a + (b - a) * t;

    Some(LmsParams {
        l: lerp(lower.l, upper.l),
        m: lerp(lower.m, upper.m),
        s: lerp(lower.s, upper.s),
    })
}

/// Measurement value at z-score `z` (the LMS inverse transform).
///
/// Returns `None` when `1 + L*S*z <= 0`, where the transform has no real value.
#[must_use]
pub fn lms_inverse(params: LmsParams, z: f64) -> Option<f64> {
    let LmsParams { l, m, s } = params;
    if l.abs() < L_EPSILON {
        return Some(m * (s * z).exp());
    }
    let base = 1.0 + l * s * z;
    if base <= 0.0 {
        return None;
    }
    Some(m * base.powf(1.0 / l))
}

/// z-score of a measured `value` (the LMS forward transform).
#[must_use]
pub fn z_score(params: LmsParams, value: f64) -> Option<f64> {
    let LmsParams { l, m, s } = params;
    if value <= 0.0 || m <= 0.0 || s <= 0.0 {
        return None;
    }
    let z = if l.abs() < L_EPSILON {
        (value / m).ln() / s
    } else {
        ((value / m).powf(l) - 1.0) / (l * s)
    };
    z.is_finite().then_some(z)
}

/// Where a measurement falls relative to the five standard percentile curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileBand {
    Below3,
    From3To15,
    From15To50,
    From50To85,
    From85To97,
    Above97,
}

impl PercentileBand {
    #[must_use]
    pub fn from_z(z: f64) -> Self {
        let [p3, p15, p50, p85, p97] = PERCENTILE_Z.map(|(_, z)| z);
        if z < p3 {
            Self::Below3
        } else if z < p15 {
            Self::From3To15
        } else if z < p50 {
            Self::From15To50
        } else if z < p85 {
            Self::From50To85
        } else if z <= p97 {
            Self::From85To97
        } else {
            Self::Above97
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Below3 => "below 3rd percentile",
            Self::From3To15 => "3rd–15th percentile",
            Self::From15To50 => "15th–50th percentile",
            Self::From50To85 => "50th–85th percentile",
            Self::From85To97 => "85th–97th percentile",
            Self::Above97 => "above 97th percentile",
        }
    }
}
