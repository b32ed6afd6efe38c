use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const LB_PER_KG: f64 = 2.204_622_621_8;
pub const IN_PER_CM: f64 = 0.393_700_787_4;
/// US customary fluid ounce.
pub const ML_PER_FL_OZ: f64 = 29.573_529_562_5;
pub const OZ_PER_LB: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

impl FromStr for UnitSystem {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "metric" | "si" => Ok(Self::Metric),
            "imperial" | "us" => Ok(Self::Imperial),
            _ => bail!("Invalid unit system '{s}'. Use 'metric' or 'imperial'"),
        }
    }
}

impl fmt::Display for UnitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metric => f.write_str("metric"),
            Self::Imperial => f.write_str("imperial"),
        }
    }
}

#[must_use]
pub fn kg_to_lb(kg: f64) -> f64 {
    kg * LB_PER_KG
}

#[must_use]
pub fn lb_to_kg(lb: f64) -> f64 {
    lb / LB_PER_KG
}

#[must_use]
pub fn cm_to_in(cm: f64) -> f64 {
    cm * IN_PER_CM
}

#[must_use]
pub fn in_to_cm(inches: f64) -> f64 {
    inches / IN_PER_CM
}

#[must_use]
pub fn ml_to_fl_oz(ml: f64) -> f64 {
    ml / ML_PER_FL_OZ
}

#[must_use]
pub fn fl_oz_to_ml(fl_oz: f64) -> f64 {
    fl_oz * ML_PER_FL_OZ
}

/// Round to two decimal places.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Split a gram weight into whole pounds plus remaining ounces.
///
/// The sign is carried on both parts so `-(lb + oz/16)` reconstructs the input.
#[must_use]
pub fn grams_to_lb_oz(grams: f64) -> (i64, f64) {
    let total_lb = kg_to_lb(grams / 1000.0);
    let whole = total_lb.trunc();
    let ounces = (total_lb - whole) * OZ_PER_LB;
    (whole as i64, ounces)
}

#[must_use]
pub fn format_weight(grams: f64, units: UnitSystem) -> String {
    match units {
        UnitSystem::Metric => {
            if grams.abs() < 1000.0 {
                format!("{grams:.0} g")
            } else {
                format!("{:.2} kg", grams / 1000.0)
            }
        }
        UnitSystem::Imperial => {
            // Round to the printed tenth of an ounce first so 15.96 oz carries into the pound.
            let tenths_per_lb = OZ_PER_LB * 10.0;
            let tenths = (kg_to_lb(grams.abs() / 1000.0) * tenths_per_lb).round();
            let lb = (tenths / tenths_per_lb).trunc();
            let oz = (tenths - lb * tenths_per_lb) / 10.0;
            let sign = if grams < 0.0 && tenths > 0.0 { "-" } else { "" };
            if tenths < tenths_per_lb {
                format!("{sign}{oz:.1} oz")
            } else {
                format!("{sign}{lb:.0} lb {oz:.1} oz")
            }
        }
    }
}

#[must_use]
pub fn format_length(cm: f64, units: UnitSystem) -> String {
    match units {
        UnitSystem::Metric => format!("{cm:.1} cm"),
        UnitSystem::Imperial => format!("{:.1} in", cm_to_in(cm)),
    }
}

#[must_use]
pub fn format_volume(ml: f64, units: UnitSystem) -> String {
    match units {
        UnitSystem::Metric => format!("{ml:.0} ml"),
        UnitSystem::Imperial => format!("{:.1} fl oz", ml_to_fl_oz(ml)),
    }
}

/// Parse a weight like "3.4kg", "3400 g", "7 lb 4 oz", "7lb4oz" or "12 oz" into kilograms.
/// A bare number is taken as kilograms.
pub fn parse_weight_kg(s: &str) -> Result<f64> {
    let parts = split_quantities(s)?;
    let mut kg = 0.0;
    for (qty, unit) in parts {
        kg += match unit.as_str() {
            "" | "kg" | "kgs" | "kilogram" | "kilograms" => qty,
            "g" | "gram" | "grams" => qty / 1000.0,
            "lb" | "lbs" | "pound" | "pounds" => lb_to_kg(qty),
            "oz" | "ounce" | "ounces" => lb_to_kg(qty / OZ_PER_LB),
            _ => bail!("Unknown weight unit '{unit}' in '{s}'. Supported: kg, g, lb, oz"),
        };
    }
    Ok(kg)
}

/// Parse a length like "52cm", "520 mm" or "21.5 in" into centimeters.
/// A bare number is taken as centimeters.
pub fn parse_length_cm(s: &str) -> Result<f64> {
    let parts = split_quantities(s)?;
    let mut cm = 0.0;
    for (qty, unit) in parts {
        cm += match unit.as_str() {
            "" | "cm" | "centimeter" | "centimeters" => qty,
            "mm" | "millimeter" | "millimeters" => qty / 10.0,
            "in" | "inch" | "inches" | "\"" => in_to_cm(qty),
            "ft" | "foot" | "feet" | "'" => in_to_cm(qty * 12.0),
            _ => bail!("Unknown length unit '{unit}' in '{s}'. Supported: cm, mm, in, ft"),
        };
    }
    Ok(cm)
}

/// Parse a volume like "120ml", "4 fl oz" or "4oz" into milliliters.
/// A bare number is taken as milliliters.
pub fn parse_volume_ml(s: &str) -> Result<f64> {
    let normalized = s.to_lowercase().replace("fl oz", "floz").replace("fl. oz", "floz");
    let parts = split_quantities(&normalized)?;
    let mut ml = 0.0;
    for (qty, unit) in parts {
        ml += match unit.as_str() {
            "" | "ml" | "milliliter" | "milliliters" | "millilitre" | "millilitres" => qty,
            "l" | "liter" | "liters" | "litre" | "litres" => qty * 1000.0,
            "floz" | "oz" => fl_oz_to_ml(qty),
            _ => bail!("Unknown volume unit '{unit}' in '{s}'. Supported: ml, l, fl oz"),
        };
    }
    Ok(ml)
}

/// Split "7 lb 4 oz" / "7lb4oz" / "120" into `[(7.0, "lb"), (4.0, "oz")]`.
fn split_quantities(s: &str) -> Result<Vec<(f64, String)>> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Empty quantity");
    }

    let mut parts = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            bail!("Invalid quantity '{s}': expected a number before '{rest}'");
        }
        let qty: f64 = rest[..num_end]
            .parse()
            .with_context(|| format!("Invalid quantity: '{s}'"))?;
        rest = rest[num_end..].trim_start();

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '-' || c == '+' || c.is_whitespace())
            .unwrap_or(rest.len());
        let unit = rest[..unit_end].to_lowercase();
        rest = rest[unit_end..].trim_start();
        parts.push((qty, unit));
    }

    if parts.len() > 1 && parts.iter().any(|(_, u)| u.is_empty()) {
        bail!("Invalid quantity '{s}': every part of a compound quantity needs a unit");
    }
    Ok(parts)
}
