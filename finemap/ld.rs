//! # Linkage-Disequilibrium Matrices
//!
//! An [`LdProvider`] turns the variants of a region into a correlation matrix. Genotype
//! reference panels never contain every requested variant, so a provider returns the
//! *reduced* variant set it actually used, ordered exactly as the matrix rows. Everything
//! downstream (z-scores, sample sizes, engine output) is interpreted in that order.
//!
//! Two providers exist:
//! - [`PlinkLdProvider`] computes the matrix with `plink2 --r-unphased square` against a
//!   per-population, per-chromosome PLINK fileset.
//! - [`PrecomputedLdProvider`] reads a matrix and its variant list produced earlier.

use crate::shared::files::open_text_source;
use crate::shared::process::{ToolError, ToolInvocation};
use crate::types::{
    Chromosome, LD_SYMMETRY_TOLERANCE, LdMatrix, LdMatrixError, VariantSet, VariantSetError,
};
use itertools::Itertools;
use ndarray::Array2;
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Message PLINK prints when `--extract` leaves nothing to work with.
const PLINK_NO_VARIANTS_MESSAGE: &str = "No variants remain";

/// Default layout of a reference panel below its root directory.
pub const DEFAULT_PREFIX_TEMPLATE: &str = "{population}/{population}.{chr}";

#[derive(Error, Debug)]
pub enum LdError {
    #[error("None of the {requested} requested variants were found in the LD reference panel.")]
    NoOverlap { requested: usize },
    #[error("External LD tool failed: {0}")]
    ExternalTool(#[from] ToolError),
    #[error("Malformed LD output in '{path}': {message}")]
    MalformedOutput { path: String, message: String },
    #[error("LD output is inconsistent with the requested variants: {0}")]
    Alignment(#[from] VariantSetError),
    #[error("LD matrix failed validation: {0}")]
    InvalidMatrix(#[from] LdMatrixError),
    #[error("Variants span several chromosomes ({0}); LD is computed per chromosome.")]
    MixedChromosomes(String),
    #[error("No variants were supplied for LD computation.")]
    NoVariants,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A variant set together with the LD matrix whose rows follow its order.
#[derive(Debug, Clone)]
pub struct LdOutcome {
    pub variants: VariantSet,
    pub matrix: LdMatrix,
}

/// Location of a genotype reference panel split by population and chromosome.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePanel {
    pub root: PathBuf,
    pub population: String,
    /// Fileset prefix below `root`; `{population}` and `{chr}` are substituted.
    pub prefix_template: String,
}

impl ReferencePanel {
    pub fn new(root: impl Into<PathBuf>, population: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            population: population.into(),
            prefix_template: DEFAULT_PREFIX_TEMPLATE.to_string(),
        }
    }

    pub fn with_prefix_template(mut self, template: impl Into<String>) -> Self {
        self.prefix_template = template.into();
        self
    }

    /// PLINK `--bfile` prefix for `chromosome`.
    pub fn bfile_prefix(&self, chromosome: Chromosome) -> PathBuf {
        let relative = self
            .prefix_template
            .replace("{population}", &self.population)
            .replace("{chr}", &chromosome.to_string());
        self.root.join(relative)
    }
}

/// Supplies an LD matrix for a set of variants.
pub trait LdProvider {
    /// Computes LD for `variants`. The returned set may be a strict subset of the request
    /// and is ordered like the matrix.
    fn compute(&self, variants: &VariantSet, panel: &ReferencePanel) -> Result<LdOutcome, LdError>;
}

/// Re-aligns `requested` to the reference tool's variant order and validates the matrix.
///
/// The reference order is ground truth. Missing correlations (NaN, typically monomorphic
/// variants) become 0, the diagonal is set to exactly 1, asymmetry beyond
/// [`LD_SYMMETRY_TOLERANCE`] is rejected and smaller rounding differences are averaged
/// away. Values within the same tolerance outside `[-1, 1]` are clamped.
pub fn align_to_reference(
    requested: &VariantSet,
    reference_ids: Vec<String>,
    mut values: Array2<f64>,
    source: &str,
) -> Result<LdOutcome, LdError> {
    if reference_ids.is_empty() {
        return Err(LdError::NoOverlap {
            requested: requested.len(),
        });
    }
    let (rows, cols) = values.dim();
    if rows != cols || rows != reference_ids.len() {
        return Err(LdError::MalformedOutput {
            path: source.to_string(),
            message: format!(
                "matrix is {rows}x{cols} but the variant list has {} entries",
                reference_ids.len()
            ),
        });
    }

    let variants = requested.reorder(&reference_ids)?;

    let n = rows;
    for i in 0..n {
        values[[i, i]] = 1.0;
        for j in 0..i {
            let upper = nan_to_zero(values[[j, i]]);
            let lower = nan_to_zero(values[[i, j]]);
            if (upper - lower).abs() > LD_SYMMETRY_TOLERANCE {
                return Err(LdMatrixError::NotSymmetric {
                    row: j,
                    col: i,
                    upper,
                    lower,
                }
                .into());
            }
            let mut r = 0.5 * (upper + lower);
            if r.abs() > 1.0 && r.abs() <= 1.0 + LD_SYMMETRY_TOLERANCE {
                r = r.signum();
            }
            values[[j, i]] = r;
            values[[i, j]] = r;
        }
    }

    let dropped = requested.len() - variants.len();
    if dropped > 0 {
        log::warn!(
            "{dropped} of {} requested variants are absent from the LD reference and were dropped",
            requested.len()
        );
    }

    let matrix = LdMatrix::new(reference_ids, values)?;
    Ok(LdOutcome { variants, matrix })
}

fn nan_to_zero(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value }
}

fn single_chromosome(variants: &VariantSet) -> Result<Chromosome, LdError> {
    let chromosomes: HashSet<Chromosome> = variants.iter().map(|v| v.chromosome).collect();
    let mut iter = chromosomes.iter();
    match (iter.next(), iter.next()) {
        (None, _) => Err(LdError::NoVariants),
        (Some(&chromosome), None) => Ok(chromosome),
        (Some(_), Some(_)) => Err(LdError::MixedChromosomes(
            chromosomes.iter().sorted().join(", "),
        )),
    }
}

/// Reads a whitespace-delimited square matrix. `nan`, `NA` and `.` become NaN.
pub fn read_square_matrix(path: &Path) -> Result<Array2<f64>, LdError> {
    let mut source = open_text_source(path)?;
    let display = source.path_display().to_string();
    let malformed = |message: String| LdError::MalformedOutput {
        path: display.clone(),
        message,
    };

    let mut data = Vec::new();
    let mut width: Option<usize> = None;
    let mut rows = 0usize;
    while let Some(raw) = source.next_line()? {
        let line = std::str::from_utf8(raw)
            .map_err(|e| malformed(format!("line {} is not valid UTF-8: {e}", rows + 1)))?;
        if line.trim().is_empty() {
            continue;
        }
        let before = data.len();
        for token in line.split_whitespace() {
            let value = if token.eq_ignore_ascii_case("nan")
                || token.eq_ignore_ascii_case("na")
                || token == "."
            {
                f64::NAN
            } else {
                token
                    .parse::<f64>()
                    .map_err(|_| malformed(format!("row {}: '{token}' is not a number", rows + 1)))?
            };
            data.push(value);
        }
        let row_width = data.len() - before;
        match width {
            None => width = Some(row_width),
            Some(w) if w != row_width => {
                return Err(malformed(format!(
                    "row {} has {row_width} columns, expected {w}",
                    rows + 1
                )));
            }
            Some(_) => {}
        }
        rows += 1;
    }

    let cols = width.unwrap_or(0);
    if rows != cols {
        return Err(malformed(format!("matrix is {rows}x{cols}, expected a square matrix")));
    }
    Array2::from_shape_vec((rows, cols), data).map_err(|e| malformed(e.to_string()))
}

/// Reads a variant list: the first whitespace-separated token of each non-empty line. A
/// leading `SNP`/`ID` header is skipped.
pub fn read_variant_list(path: &Path) -> Result<Vec<String>, LdError> {
    let mut source = open_text_source(path)?;
    let mut ids = Vec::new();
    let mut first = true;
    while let Some(raw) = source.next_line()? {
        let line = String::from_utf8_lossy(raw);
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let is_header = first && (token.eq_ignore_ascii_case("SNP") || token.eq_ignore_ascii_case("ID"));
        first = false;
        if !is_header {
            ids.push(token.to_string());
        }
    }
    Ok(ids)
}

// ========================================================================================
//                                   PLINK provider
// ========================================================================================

/// Computes LD with PLINK 2 in a scratch directory that is removed afterwards.
#[derive(Debug, Clone)]
pub struct PlinkLdProvider {
    pub executable: PathBuf,
    pub timeout: Option<Duration>,
}

impl Default for PlinkLdProvider {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("plink2"),
            timeout: None,
        }
    }
}

impl PlinkLdProvider {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl LdProvider for PlinkLdProvider {
    fn compute(&self, variants: &VariantSet, panel: &ReferencePanel) -> Result<LdOutcome, LdError> {
        let chromosome = single_chromosome(variants)?;
        let bfile = panel.bfile_prefix(chromosome);
        let scratch = tempfile::Builder::new().prefix("finemap-ld-").tempdir()?;

        let extract_path = scratch.path().join("extract.txt");
        {
            let mut writer = BufWriter::new(fs::File::create(&extract_path)?);
            for variant in variants {
                writeln!(writer, "{}", variant.id)?;
            }
            writer.flush()?;
        }

        let out_prefix = scratch.path().join("ld");
        log::info!(
            "Computing LD for {} variants against {}",
            variants.len(),
            bfile.display()
        );
        let run = ToolInvocation::new(&self.executable, scratch.path())
            .arg("--bfile")
            .path_arg(&bfile)
            .arg("--keep-allele-order")
            .arg("--r-unphased")
            .arg("square")
            .arg("--extract")
            .path_arg(&extract_path)
            .arg("--out")
            .path_arg(&out_prefix)
            .timeout(self.timeout)
            .run();

        match run {
            Ok(output) => log::debug!("PLINK finished in {:.2?}", output.elapsed),
            Err(err) => {
                if err
                    .diagnostic()
                    .is_some_and(|d| d.contains(PLINK_NO_VARIANTS_MESSAGE))
                {
                    return Err(LdError::NoOverlap {
                        requested: variants.len(),
                    });
                }
                return Err(err.into());
            }
        }

        let matrix_path = scratch.path().join("ld.unphased.vcor1");
        let vars_path = scratch.path().join("ld.unphased.vcor1.vars");
        for expected in [&matrix_path, &vars_path] {
            if !expected.exists() {
                return Err(LdError::MalformedOutput {
                    path: expected.display().to_string(),
                    message: "PLINK did not produce the expected output file".into(),
                });
            }
        }

        let reference_ids = read_variant_list(&vars_path)?;
        let values = read_square_matrix(&matrix_path)?;
        align_to_reference(
            variants,
            reference_ids,
            values,
            &matrix_path.display().to_string(),
        )
    }
}

// ========================================================================================
//                                Precomputed provider
// ========================================================================================

/// Serves LD from a matrix file computed beforehand, restricted to the requested variants.
#[derive(Debug, Clone)]
pub struct PrecomputedLdProvider {
    pub matrix_path: PathBuf,
    pub variants_path: PathBuf,
}

impl PrecomputedLdProvider {
    pub fn new(matrix_path: impl Into<PathBuf>, variants_path: impl Into<PathBuf>) -> Self {
        Self {
            matrix_path: matrix_path.into(),
            variants_path: variants_path.into(),
        }
    }
}

impl LdProvider for PrecomputedLdProvider {
    fn compute(&self, variants: &VariantSet, panel: &ReferencePanel) -> Result<LdOutcome, LdError> {
        log::info!(
            "Reading precomputed LD from '{}' (population {} not consulted)",
            self.matrix_path.display(),
            panel.population
        );
        let file_ids = read_variant_list(&self.variants_path)?;
        let full = read_square_matrix(&self.matrix_path)?;
        if full.nrows() != file_ids.len() {
            return Err(LdError::MalformedOutput {
                path: self.matrix_path.display().to_string(),
                message: format!(
                    "matrix has {} rows but '{}' lists {} variants",
                    full.nrows(),
                    self.variants_path.display(),
                    file_ids.len()
                ),
            });
        }

        let keep: Vec<usize> = file_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| variants.contains_id(id))
            .map(|(i, _)| i)
            .collect();
        let reference_ids: Vec<String> = keep.iter().map(|&i| file_ids[i].clone()).collect();
        let values = Array2::from_shape_fn((keep.len(), keep.len()), |(r, c)| full[[keep[r], keep[c]]]);

        align_to_reference(
            variants,
            reference_ids,
            values,
            &self.matrix_path.display().to_string(),
        )
    }
}
