use anyhow::{Result, bail};
use serde_json::json;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nestling_core::growth::{
    GrowthMetric, ReferenceSet, Sex, build_who_curve_data, curve::DAYS_PER_MONTH, percentile_for,
};
use nestling_core::units::{
    UnitSystem, format_length, format_weight, parse_length_cm, parse_weight_kg,
};

use super::helpers::{format_opt, parse_date};

#[derive(Tabled)]
struct CurveRow {
    #[tabled(rename = "Month")]
    month: u32,
    #[tabled(rename = "P3")]
    p3: String,
    #[tabled(rename = "P15")]
    p15: String,
    #[tabled(rename = "P50")]
    p50: String,
    #[tabled(rename = "P85")]
    p85: String,
    #[tabled(rename = "P97")]
    p97: String,
}

fn display_unit(metric: GrowthMetric, units: UnitSystem) -> &'static str {
    match (metric, units) {
        (GrowthMetric::Weight, UnitSystem::Metric) => "kg",
        (GrowthMetric::Weight, UnitSystem::Imperial) => "lb",
        (_, UnitSystem::Metric) => "cm",
        (_, UnitSystem::Imperial) => "in",
    }
}

pub(crate) fn cmd_growth_curve(
    metric: &str,
    sex: &str,
    months: u32,
    units: &str,
    json: bool,
) -> Result<()> {
    let metric: GrowthMetric = metric.parse()?;
    let sex: Sex = sex.parse()?;
    let units: UnitSystem = units.parse()?;

    let points = build_who_curve_data(metric, sex, months, units);

    if json {
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }
    if points.is_empty() {
        bail!("No reference data for {metric} ({sex})");
    }

    let rows: Vec<CurveRow> = points
        .iter()
        .map(|p| CurveRow {
            month: p.age_months,
            p3: format_opt(p.p3),
            p15: format_opt(p.p15),
            p50: format_opt(p.p50),
            p85: format_opt(p.p85),
            p97: format_opt(p.p97),
        })
        .collect();

    println!(
        "WHO {metric}-for-age, {sex} ({})",
        display_unit(metric, units)
    );
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

/// Age in days from either an explicit count or a birth date and measurement date.
fn resolve_age_days(
    age_days: Option<f64>,
    birth_date: Option<String>,
    measured_on: Option<String>,
) -> Result<f64> {
    match (age_days, birth_date) {
        (Some(days), _) => {
            if !days.is_finite() || days < 0.0 {
                bail!("Age must be zero or more days");
            }
            Ok(days)
        }
        (None, Some(birth)) => {
            let birth = parse_date(Some(birth))?;
            let measured = parse_date(measured_on)?;
            let days = (measured - birth).num_days();
            if days < 0 {
                bail!("Measurement date is before the birth date");
            }
            Ok(days as f64)
        }
        (None, None) => bail!("Give either --age-days or --birth-date"),
    }
}

/// Measurement in the reference table's unit (kg or cm), accepting any supported input unit.
fn parse_measurement(metric: GrowthMetric, value: &str) -> Result<f64> {
    let raw = match metric {
        GrowthMetric::Weight => parse_weight_kg(value)?,
        GrowthMetric::Length | GrowthMetric::Head => parse_length_cm(value)?,
    };
    if !raw.is_finite() || raw <= 0.0 {
        bail!("Measurement must be greater than 0");
    }
    Ok(raw)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_growth_percentile(
    metric: &str,
    sex: &str,
    value: &str,
    age_days: Option<f64>,
    birth_date: Option<String>,
    measured_on: Option<String>,
    units: &str,
    json: bool,
) -> Result<()> {
    let metric: GrowthMetric = metric.parse()?;
    let sex: Sex = sex.parse()?;
    let units: UnitSystem = units.parse()?;
    let age_days = resolve_age_days(age_days, birth_date, measured_on)?;
    let raw = parse_measurement(metric, value)?;

    let reference = ReferenceSet::who();
    let last_age = reference
        .table(metric, sex)
        .and_then(<[_]>::last)
        .map(|row| row.age_days);
    match last_age {
        Some(last) if age_days <= f64::from(last) => {}
        _ => bail!("Age {age_days:.0} days is outside the {metric} reference range"),
    }

    let Some(reading) = percentile_for(reference, metric, sex, age_days, raw, UnitSystem::Metric)
    else {
        bail!("Could not place {value} on the {metric} reference curve");
    };

    let (measured, median) = match metric {
        GrowthMetric::Weight => (
            format_weight(raw * 1000.0, units),
            format_weight(reading.median * 1000.0, units),
        ),
        GrowthMetric::Length | GrowthMetric::Head => {
            (format_length(raw, units), format_length(reading.median, units))
        }
    };

    if json {
        println!(
            "{}",
            json!({
                "metric": metric,
                "sex": sex,
                "age_days": age_days,
                "age_months": age_days / DAYS_PER_MONTH,
                "value": raw,
                "unit": metric.raw_unit(),
                "z": reading.z,
                "band": reading.band,
                "median": reading.median,
            })
        );
    } else {
        println!(
            "{measured} at {:.1} months: z = {:.2}, {}",
            age_days / DAYS_PER_MONTH,
            reading.z,
            reading.band.label()
        );
        println!("  Median for age: {median}");
    }
    Ok(())
}
