//! # Summary-Statistics Loading
//!
//! Reads a tab-separated GWAS summary-statistics table into a [`VariantSet`]. Upstream
//! munging tools disagree on column names, so each field is located through a list of
//! accepted aliases, matched case-insensitively. All columns are read as text and parsed
//! here, which keeps error messages specific to the offending row and column.
//!
//! Per-row invariants enforced on load:
//! - `position > 0`
//! - `se > 0` and finite whenever present
//! - `z` is finite; when `z`, `beta` and `se` are all supplied they must agree
//! - identifiers are unique

use crate::shared::files::{is_compressed, read_all_bytes};
use crate::types::{Chromosome, Variant, VariantSet, VariantSetError};
use polars::prelude::*;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Relative tolerance when checking a supplied z-score against `beta / se`.
pub const Z_AGREEMENT_TOLERANCE: f64 = 1.0e-2;

const ID_ALIASES: &[&str] = &["SNP", "ID", "RSID", "VARIANT_ID", "MARKERNAME"];
const CHR_ALIASES: &[&str] = &["CHR", "CHROM", "CHROMOSOME", "#CHROM"];
const POS_ALIASES: &[&str] = &["BP", "POS", "POSITION"];
const EFFECT_ALLELE_ALIASES: &[&str] = &["A1", "EA", "EFFECT_ALLELE", "ALT"];
const OTHER_ALLELE_ALIASES: &[&str] = &["A2", "NEA", "OA", "OTHER_ALLELE", "REF"];
const BETA_ALIASES: &[&str] = &["BETA", "B", "EFFECT"];
const SE_ALIASES: &[&str] = &["SE", "STDERR"];
const Z_ALIASES: &[&str] = &["Z", "ZSCORE"];
const N_ALIASES: &[&str] = &["N", "NSAMPLE"];
const P_ALIASES: &[&str] = &["P", "PVAL", "PVALUE"];

#[derive(Error, Debug)]
pub enum SumstatsError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("No column for '{field}' was found. Accepted names: {}.", aliases.join(", "))]
    ColumnNotFound {
        field: &'static str,
        aliases: &'static [&'static str],
    },
    #[error("Summary statistics need either a Z column or both BETA and SE columns.")]
    NoEffectColumns,
    #[error("Row {row}: missing value in required column '{column}'.")]
    MissingValue { row: usize, column: String },
    #[error("Row {row}: invalid value '{value}' in column '{column}': {reason}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        reason: String,
    },
    #[error(
        "Row {row}: variant '{id}' has Z = {z} but BETA/SE = {implied}; the supplied values conflict."
    )]
    InconsistentZ {
        row: usize,
        id: String,
        z: f64,
        implied: f64,
    },
    #[error("Invalid variant set: {0}")]
    VariantSet(#[from] VariantSetError),
    #[error("The summary statistics file contains no data rows.")]
    Empty,
}

/// Loads summary statistics from a plain or gzip-compressed TSV file.
pub fn load_sumstats(path: &Path) -> Result<VariantSet, SumstatsError> {
    log::info!("Loading summary statistics from '{}'", path.display());

    let options = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .with_parse_options(CsvParseOptions::default().with_separator(b'\t'));

    let df = if is_compressed(path) {
        let bytes = read_all_bytes(path)?;
        CsvReader::new(Cursor::new(bytes))
            .with_options(options)
            .finish()?
    } else {
        CsvReader::new(File::open(path)?)
            .with_options(options)
            .finish()?
    };

    let variants = internal::frame_to_variants(&df)?;
    log::info!(
        "Loaded {} variants from '{}'",
        variants.len(),
        path.display()
    );
    Ok(variants)
}

mod internal {
    use super::*;

    /// Resolved physical column names for each logical field.
    struct ColumnLayout {
        id: String,
        chromosome: String,
        position: String,
        effect_allele: String,
        other_allele: String,
        beta: Option<String>,
        se: Option<String>,
        z: Option<String>,
        n: Option<String>,
        p: Option<String>,
    }

    fn find_column(names: &[String], aliases: &[&str]) -> Option<String> {
        aliases.iter().find_map(|alias| {
            names
                .iter()
                .find(|name| name.trim().eq_ignore_ascii_case(alias))
                .cloned()
        })
    }

    fn require_column(
        names: &[String],
        field: &'static str,
        aliases: &'static [&'static str],
    ) -> Result<String, SumstatsError> {
        find_column(names, aliases).ok_or(SumstatsError::ColumnNotFound { field, aliases })
    }

    fn resolve_layout(df: &DataFrame) -> Result<ColumnLayout, SumstatsError> {
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let layout = ColumnLayout {
            id: require_column(&names, "variant identifier", ID_ALIASES)?,
            chromosome: require_column(&names, "chromosome", CHR_ALIASES)?,
            position: require_column(&names, "position", POS_ALIASES)?,
            effect_allele: require_column(&names, "effect allele", EFFECT_ALLELE_ALIASES)?,
            other_allele: require_column(&names, "other allele", OTHER_ALLELE_ALIASES)?,
            beta: find_column(&names, BETA_ALIASES),
            se: find_column(&names, SE_ALIASES),
            z: find_column(&names, Z_ALIASES),
            n: find_column(&names, N_ALIASES),
            p: find_column(&names, P_ALIASES),
        };

        let has_estimate = layout.beta.is_some() && layout.se.is_some();
        if layout.z.is_none() && !has_estimate {
            return Err(SumstatsError::NoEffectColumns);
        }
        Ok(layout)
    }

    fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, SumstatsError> {
        let casted = df.column(name)?.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|value| {
                value
                    .map(str::trim)
                    .filter(|v| !is_missing_marker(v))
                    .map(str::to_string)
            })
            .collect();
        Ok(values)
    }

    fn optional_text_column(
        df: &DataFrame,
        name: Option<&String>,
    ) -> Result<Option<Vec<Option<String>>>, SumstatsError> {
        name.map(|n| text_column(df, n)).transpose()
    }

    pub(super) fn is_missing_marker(value: &str) -> bool {
        value.is_empty()
            || value == "."
            || value.eq_ignore_ascii_case("NA")
            || value.eq_ignore_ascii_case("NaN")
    }

    fn required<'a>(
        values: &'a [Option<String>],
        row: usize,
        column: &str,
    ) -> Result<&'a str, SumstatsError> {
        values[row]
            .as_deref()
            .ok_or_else(|| SumstatsError::MissingValue {
                row: row + 1,
                column: column.to_string(),
            })
    }

    fn invalid(row: usize, column: &str, value: &str, reason: impl Into<String>) -> SumstatsError {
        SumstatsError::InvalidValue {
            row: row + 1,
            column: column.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_float(
        values: &[Option<String>],
        row: usize,
        column: &str,
    ) -> Result<Option<f64>, SumstatsError> {
        match values[row].as_deref() {
            None => Ok(None),
            Some(text) => match text.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v)),
                Ok(_) => Err(invalid(row, column, text, "value must be finite")),
                Err(_) => Err(invalid(row, column, text, "expected a number")),
            },
        }
    }

    pub(super) fn frame_to_variants(df: &DataFrame) -> Result<VariantSet, SumstatsError> {
        if df.height() == 0 {
            return Err(SumstatsError::Empty);
        }
        let layout = resolve_layout(df)?;

        let ids = text_column(df, &layout.id)?;
        let chroms = text_column(df, &layout.chromosome)?;
        let positions = text_column(df, &layout.position)?;
        let effect_alleles = text_column(df, &layout.effect_allele)?;
        let other_alleles = text_column(df, &layout.other_allele)?;
        let betas = optional_text_column(df, layout.beta.as_ref())?;
        let ses = optional_text_column(df, layout.se.as_ref())?;
        let zs = optional_text_column(df, layout.z.as_ref())?;
        let ns = optional_text_column(df, layout.n.as_ref())?;
        let ps = optional_text_column(df, layout.p.as_ref())?;

        let mut variants = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let id = required(&ids, row, &layout.id)?.to_string();

            let chr_text = required(&chroms, row, &layout.chromosome)?;
            let chromosome: Chromosome = chr_text
                .parse()
                .map_err(|reason: String| invalid(row, &layout.chromosome, chr_text, reason))?;

            let pos_text = required(&positions, row, &layout.position)?;
            let position = match pos_text.parse::<u64>() {
                Ok(p) if p > 0 => p,
                Ok(_) => return Err(invalid(row, &layout.position, pos_text, "position must be positive")),
                Err(_) => {
                    return Err(invalid(
                        row,
                        &layout.position,
                        pos_text,
                        "expected a positive integer",
                    ));
                }
            };

            let effect_allele = required(&effect_alleles, row, &layout.effect_allele)?.to_string();
            let other_allele = required(&other_alleles, row, &layout.other_allele)?.to_string();

            let beta = match (&betas, &layout.beta) {
                (Some(values), Some(name)) => parse_float(values, row, name)?,
                _ => None,
            };
            let se = match (&ses, &layout.se) {
                (Some(values), Some(name)) => parse_float(values, row, name)?,
                _ => None,
            };
            if let (Some(value), Some(name)) = (se, &layout.se) {
                if value <= 0.0 {
                    return Err(invalid(
                        row,
                        name,
                        &value.to_string(),
                        "standard error must be positive",
                    ));
                }
            }
            let supplied_z = match (&zs, &layout.z) {
                (Some(values), Some(name)) => parse_float(values, row, name)?,
                _ => None,
            };

            let implied_z = match (beta, se) {
                (Some(b), Some(s)) => Some(b / s),
                _ => None,
            };
            let z = match (supplied_z, implied_z) {
                (Some(z), Some(implied)) => {
                    if (z - implied).abs() > Z_AGREEMENT_TOLERANCE * z.abs().max(1.0) {
                        return Err(SumstatsError::InconsistentZ {
                            row: row + 1,
                            id,
                            z,
                            implied,
                        });
                    }
                    z
                }
                (Some(z), None) => z,
                (None, Some(implied)) => implied,
                (None, None) => {
                    let column = layout.z.as_deref().or(layout.beta.as_deref()).unwrap_or("Z");
                    return Err(SumstatsError::MissingValue {
                        row: row + 1,
                        column: column.to_string(),
                    });
                }
            };

            let sample_size = match (&ns, &layout.n) {
                (Some(values), Some(name)) => match values[row].as_deref() {
                    None => None,
                    Some(text) => match text.parse::<f64>() {
                        Ok(n) if n.is_finite() && n >= 1.0 => Some(n.round() as u64),
                        _ => return Err(invalid(row, name, text, "sample size must be a positive number")),
                    },
                },
                _ => None,
            };

            let p_value = match (&ps, &layout.p) {
                (Some(values), Some(name)) => match parse_float(values, row, name)? {
                    Some(p) if !(0.0..=1.0).contains(&p) => {
                        return Err(invalid(row, name, &p.to_string(), "p-value must lie in [0, 1]"));
                    }
                    other => other,
                },
                _ => None,
            };

            variants.push(Variant {
                id,
                chromosome,
                position,
                effect_allele,
                other_allele,
                beta,
                se,
                z,
                sample_size,
                p_value,
                pip: None,
            });
        }

        Ok(VariantSet::new(variants)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::{Builder, NamedTempFile};

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = Builder::new().suffix(".tsv").tempfile()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn loads_beta_se_and_derives_z() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tBETA\tSE\tN\tP\n\
             rs1\t1\t100\tA\tG\t0.2\t0.1\t1000\t0.04\n\
             rs2\tchr1\t200\tC\tT\t-0.3\t0.1\t1000\t0.002",
        )
        .unwrap();
        let set = load_sumstats(file.path()).unwrap();
        assert_eq!(set.len(), 2);
        let rs2 = set.get_by_id("rs2").unwrap();
        assert_eq!(rs2.chromosome, Chromosome::Autosome(1));
        assert_eq!(rs2.position, 200);
        assert_eq!(rs2.sample_size, Some(1000));
        assert_abs_diff_eq!(rs2.z, -3.0, epsilon = 1e-12);
        assert_eq!(set.ids(), vec!["rs1", "rs2"]);
    }

    #[test]
    fn header_matching_is_case_insensitive_and_accepts_aliases() {
        let file = create_test_tsv(
            "id\tchrom\tpos\tea\tnea\tz\n\
             1:100:A:G\tX\t100\tA\tG\t2.5",
        )
        .unwrap();
        let set = load_sumstats(file.path()).unwrap();
        let v = set.get(0).unwrap();
        assert_eq!(v.chromosome, Chromosome::X);
        assert_abs_diff_eq!(v.z, 2.5, epsilon = 1e-12);
        assert!(v.beta.is_none());
        assert!(v.sample_size.is_none());
    }

    #[test]
    fn rejects_non_positive_standard_error() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tBETA\tSE\n\
             rs1\t1\t100\tA\tG\t0.2\t0",
        )
        .unwrap();
        match load_sumstats(file.path()).unwrap_err() {
            SumstatsError::InvalidValue { row, column, .. } => {
                assert_eq!(row, 1);
                assert_eq!(column, "SE");
            }
            other => panic!("Expected InvalidValue(SE), got {:?}", other),
        }
    }

    #[test]
    fn rejects_conflicting_z() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tBETA\tSE\tZ\n\
             rs1\t1\t100\tA\tG\t0.2\t0.1\t5.0",
        )
        .unwrap();
        assert!(matches!(
            load_sumstats(file.path()).unwrap_err(),
            SumstatsError::InconsistentZ { .. }
        ));
    }

    #[test]
    fn accepts_rounded_z() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tBETA\tSE\tZ\n\
             rs1\t1\t100\tA\tG\t0.2\t0.1\t2.001",
        )
        .unwrap();
        let set = load_sumstats(file.path()).unwrap();
        assert_abs_diff_eq!(set.get(0).unwrap().z, 2.001, epsilon = 1e-12);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tZ\n\
             rs1\t1\t100\tA\tG\t1.0\n\
             rs1\t1\t200\tA\tG\t2.0",
        )
        .unwrap();
        assert!(matches!(
            load_sumstats(file.path()).unwrap_err(),
            SumstatsError::VariantSet(VariantSetError::DuplicateId(_))
        ));
    }

    #[test]
    fn requires_an_effect_column() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tBETA\n\
             rs1\t1\t100\tA\tG\t1.0",
        )
        .unwrap();
        assert!(matches!(
            load_sumstats(file.path()).unwrap_err(),
            SumstatsError::NoEffectColumns
        ));
    }

    #[test]
    fn reports_missing_required_values_with_row_numbers() {
        let file = create_test_tsv(
            "SNP\tCHR\tBP\tA1\tA2\tZ\n\
             rs1\t1\t100\tA\tG\t1.0\n\
             rs2\t1\tNA\tA\tG\t1.0",
        )
        .unwrap();
        match load_sumstats(file.path()).unwrap_err() {
            SumstatsError::MissingValue { row, column } => {
                assert_eq!(row, 2);
                assert_eq!(column, "BP");
            }
            other => panic!("Expected MissingValue, got {:?}", other),
        }
    }

    #[test]
    fn missing_markers_are_recognised() {
        assert!(internal::is_missing_marker(""));
        assert!(internal::is_missing_marker("NA"));
        assert!(internal::is_missing_marker("nan"));
        assert!(internal::is_missing_marker("."));
        assert!(!internal::is_missing_marker("0"));
    }
}
