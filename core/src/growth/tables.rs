use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::lms::GrowthReferenceRow;

/// WHO Child Growth Standards, 0–24 months, one row per month.
const WHO_LMS_CSV: &str = include_str!("../../data/who_lms.csv");

static WHO: LazyLock<ReferenceSet> = LazyLock::new(|| {
    ReferenceSet::from_csv_reader(WHO_LMS_CSV.as_bytes()).unwrap_or_else(|e| {
        tracing::error!("failed to load WHO growth reference tables: {e:#}");
        ReferenceSet::default()
    })
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthMetric {
    Weight,
    Length,
    Head,
}

impl GrowthMetric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weight => "weight",
            Self::Length => "length",
            Self::Head => "head",
        }
    }

    /// Unit the reference tables are expressed in.
    #[must_use]
    pub fn raw_unit(self) -> &'static str {
        match self {
            Self::Weight => "kg",
            Self::Length | Self::Head => "cm",
        }
    }
}

impl fmt::Display for GrowthMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthMetric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "weight" => Ok(Self::Weight),
            "length" | "height" => Ok(Self::Length),
            "head" | "head_circumference" | "hc" => Ok(Self::Head),
            _ => bail!("Invalid metric '{s}'. Must be one of: weight, length, head"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "male" | "m" | "boy" => Ok(Self::Male),
            "female" | "f" | "girl" => Ok(Self::Female),
            _ => bail!("Invalid sex '{s}'. Must be 'male' or 'female'"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    metric: GrowthMetric,
    sex: Sex,
    age_days: u32,
    l: f64,
    m: f64,
    s: f64,
}

/// Immutable growth reference tables keyed by (metric, sex), each sorted by age.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    tables: HashMap<(GrowthMetric, Sex), Vec<GrowthReferenceRow>>,
}

impl ReferenceSet {
    /// The bundled WHO tables, parsed on first use.
    #[must_use]
    pub fn who() -> &'static ReferenceSet {
        &WHO
    }

    /// Load tables from CSV with header `metric,sex,age_days,l,m,s`.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut tables: HashMap<(GrowthMetric, Sex), Vec<GrowthReferenceRow>> = HashMap::new();
        for (line_num, result) in rdr.deserialize::<CsvRow>().enumerate() {
            // +2: header line plus 1-based numbering
            let row = result.with_context(|| format!("Invalid reference row {}", line_num + 2))?;
            if !(row.m > 0.0 && row.s > 0.0 && row.l.is_finite()) {
                bail!(
                    "Invalid LMS values on row {}: L={} M={} S={}",
                    line_num + 2,
                    row.l,
                    row.m,
                    row.s
                );
            }
            tables
                .entry((row.metric, row.sex))
                .or_default()
                .push(GrowthReferenceRow {
                    age_days: row.age_days,
                    l: row.l,
                    m: row.m,
                    s: row.s,
                });
        }

        for rows in tables.values_mut() {
            rows.sort_by_key(|r| r.age_days);
            rows.dedup_by_key(|r| r.age_days);
        }

        Ok(Self { tables })
    }

    #[must_use]
    pub fn table(&self, metric: GrowthMetric, sex: Sex) -> Option<&[GrowthReferenceRow]> {
        self.tables
            .get(&(metric, sex))
            .map(Vec::as_slice)
            .filter(|rows| !rows.is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_who_tables_load() {
        let who = ReferenceSet::who();
        for metric in [GrowthMetric::Weight, GrowthMetric::Length, GrowthMetric::Head] {
            for sex in [Sex::Male, Sex::Female] {
                let rows = who.table(metric, sex).unwrap();
                assert_eq!(rows.len(), 25, "{metric} {sex}");
                assert_eq!(rows[0].age_days, 0);
                assert!(rows.windows(2).all(|w| w[0].age_days < w[1].age_days));
            }
        }
    }

    #[test]
    fn test_who_birth_medians() {
        let who = ReferenceSet::who();
        let boys = who.table(GrowthMetric::Weight, Sex::Male).unwrap();
        assert!((boys[0].m - 3.3464).abs() < 1e-9);
        let girls = who.table(GrowthMetric::Length, Sex::Female).unwrap();
        assert!((girls[0].m - 49.1477).abs() < 1e-9);
    }

    #[test]
    fn test_from_csv_sorts_rows() {
        let csv = "metric,sex,age_days,l,m,s\n\
                   weight,female,60,0.1,5.0,0.1\n\
                   weight,female,0,0.3,3.0,0.1\n\
                   weight,female,30,0.2,4.0,0.1\n";
        let set = ReferenceSet::from_csv_reader(csv.as_bytes()).unwrap();
        let rows = set.table(GrowthMetric::Weight, Sex::Female).unwrap();
        let ages: Vec<u32> = rows.iter().map(|r| r.age_days).collect();
        assert_eq!(ages, vec![0, 30, 60]);
        assert!(set.table(GrowthMetric::Weight, Sex::Male).is_none());
    }

    #[test]
    fn test_from_csv_rejects_bad_rows() {
        let bad_metric = "metric,sex,age_days,l,m,s\nbmi,male,0,1,1,1\n";
        assert!(ReferenceSet::from_csv_reader(bad_metric.as_bytes()).is_err());

        let bad_median = "metric,sex,age_days,l,m,s\nweight,male,0,1,0,0.1\n";
        assert!(ReferenceSet::from_csv_reader(bad_median.as_bytes()).is_err());
    }

    #[test]
    fn test_metric_and_sex_from_str() {
        assert_eq!("Height".parse::<GrowthMetric>().unwrap(), GrowthMetric::Length);
        assert_eq!("hc".parse::<GrowthMetric>().unwrap(), GrowthMetric::Head);
        assert_eq!("girl".parse::<Sex>().unwrap(), Sex::Female);
        assert!("other".parse::<Sex>().is_err());
    }
}
