// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum deviation tolerated between `M[i][j]` and `M[j][i]` in an LD matrix.
pub const LD_SYMMETRY_TOLERANCE: f64 = 1.0e-6;

// ========================================================================================
//                                   Chromosomes
// ========================================================================================

/// A chromosome label. Autosomes sort numerically, followed by X, Y and MT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Chromosome {
    Autosome(u8),
    X,
    Y,
    Mt,
}

impl FromStr for Chromosome {
    type Err = String;

    fn from_str(chr_str: &str) -> Result<Self, Self::Err> {
        let mut trimmed = chr_str.trim();

        if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("chr")) {
            trimmed = &trimmed[3..];
        }

        if trimmed.eq_ignore_ascii_case("X") || trimmed == "23" {
            return Ok(Self::X);
        }
        if trimmed.eq_ignore_ascii_case("Y") || trimmed == "24" {
            return Ok(Self::Y);
        }
        if trimmed.eq_ignore_ascii_case("MT") || trimmed.eq_ignore_ascii_case("M") || trimmed == "25"
        {
            return Ok(Self::Mt);
        }

        match trimmed.parse::<u8>() {
            Ok(n) if (1..=22).contains(&n) => Ok(Self::Autosome(n)),
            _ => Err(format!(
                "Invalid chromosome '{}'. Expected 1-22, 'X', 'Y', 'MT', optionally with a 'chr' prefix.",
                chr_str.trim()
            )),
        }
    }
}

impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Autosome(n) => write!(f, "{n}"),
            Self::X => f.write_str("X"),
            Self::Y => f.write_str("Y"),
            Self::Mt => f.write_str("MT"),
        }
    }
}

// ========================================================================================
//                                     Variants
// ========================================================================================

/// One row of GWAS summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Identifier, typically `chr:pos:ref:alt` or an rsID.
    pub id: String,
    pub chromosome: Chromosome,
    /// 1-based genomic coordinate.
    pub position: u64,
    pub effect_allele: String,
    pub other_allele: String,
    pub beta: Option<f64>,
    /// Standard error of `beta`; strictly positive whenever present.
    pub se: Option<f64>,
    /// Z-score. Equals `beta / se` when both of those are present.
    pub z: f64,
    pub sample_size: Option<u64>,
    pub p_value: Option<f64>,
    /// Posterior inclusion probability, filled in once a region has been fine-mapped.
    pub pip: Option<f64>,
}

impl Variant {
    /// Builds a variant from an effect estimate, deriving `z = beta / se`.
    pub fn from_estimate(
        id: impl Into<String>,
        chromosome: Chromosome,
        position: u64,
        beta: f64,
        se: f64,
    ) -> Self {
        Self {
            id: id.into(),
            chromosome,
            position,
            effect_allele: String::new(),
            other_allele: String::new(),
            beta: Some(beta),
            se: Some(se),
            z: beta / se,
            sample_size: None,
            p_value: None,
            pip: None,
        }
    }

    /// Builds a variant from a z-score alone.
    pub fn from_z(id: impl Into<String>, chromosome: Chromosome, position: u64, z: f64) -> Self {
        Self {
            id: id.into(),
            chromosome,
            position,
            effect_allele: String::new(),
            other_allele: String::new(),
            beta: None,
            se: None,
            z,
            sample_size: None,
            p_value: None,
            pip: None,
        }
    }

    pub fn with_alleles(mut self, effect: impl Into<String>, other: impl Into<String>) -> Self {
        self.effect_allele = effect.into();
        self.other_allele = other.into();
        self
    }

    pub fn with_sample_size(mut self, n: u64) -> Self {
        self.sample_size = Some(n);
        self
    }

    pub fn with_p_value(mut self, p: f64) -> Self {
        self.p_value = Some(p);
        self
    }
}

// ========================================================================================
//                                      Regions
// ========================================================================================

/// A window of `window` base pairs on either side of `center`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub chromosome: Chromosome,
    pub center: u64,
    pub window: u64,
}

impl Region {
    pub fn new(chromosome: Chromosome, center: u64, window: u64) -> Self {
        Self {
            chromosome,
            center,
            window,
        }
    }

    /// Region whose radius is given in kilobases.
    pub fn from_kb(chromosome: Chromosome, center: u64, window_kb: u64) -> Self {
        Self::new(chromosome, center, window_kb.saturating_mul(1000))
    }

    /// Inclusive lower bound, clamped at zero.
    #[inline]
    pub fn start(&self) -> u64 {
        self.center.saturating_sub(self.window)
    }

    /// Inclusive upper bound.
    #[inline]
    pub fn end(&self) -> u64 {
        self.center.saturating_add(self.window)
    }

    #[inline]
    pub fn contains(&self, variant: &Variant) -> bool {
        variant.chromosome == self.chromosome
            && variant.position >= self.start()
            && variant.position <= self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chr{}:{}-{}", self.chromosome, self.start(), self.end())
    }
}

// ========================================================================================
//                                    Variant sets
// ========================================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariantSetError {
    #[error("Variant identifier '{0}' appears more than once.")]
    DuplicateId(String),
    #[error("Variant identifier '{0}' is not part of this variant set.")]
    UnknownId(String),
}

/// An ordered collection of variants with unique identifiers.
///
/// The order defines the index space shared with the LD matrix and the fine-mapping
/// engine's output, so every operation here preserves it.
#[derive(Debug, Clone, Default)]
pub struct VariantSet {
    variants: Vec<Variant>,
    index: HashMap<String, usize>,
}

impl VariantSet {
    pub fn new(variants: Vec<Variant>) -> Result<Self, VariantSetError> {
        let mut index = HashMap::with_capacity(variants.len());
        for (i, variant) in variants.iter().enumerate() {
            if index.insert(variant.id.clone(), i).is_some() {
                return Err(VariantSetError::DuplicateId(variant.id.clone()));
            }
        }
        Ok(Self { variants, index })
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        self.variants.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Variant> {
        self.variants.get(index)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Variant> {
        self.index.get(id).map(|&i| &self.variants[i])
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.id.clone()).collect()
    }

    pub fn z_scores(&self) -> Array1<f64> {
        self.variants.iter().map(|v| v.z).collect()
    }

    /// A new set holding the variants that satisfy `keep`, in their original order.
    pub fn filter<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&Variant) -> bool,
    {
        let variants: Vec<Variant> = self.variants.iter().filter(|v| keep(v)).cloned().collect();
        let index = variants
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id.clone(), i))
            .collect();
        Self { variants, index }
    }

    /// Re-orders (and possibly reduces) this set to exactly the identifiers in `ids`.
    pub fn reorder(&self, ids: &[String]) -> Result<Self, VariantSetError> {
        let mut variants = Vec::with_capacity(ids.len());
        for id in ids {
            let variant = self
                .get_by_id(id)
                .ok_or_else(|| VariantSetError::UnknownId(id.clone()))?;
            variants.push(variant.clone());
        }
        Self::new(variants)
    }

    /// A copy of this set with `pips[i]` recorded on the `i`-th variant.
    pub fn with_pips(&self, pips: &[f64]) -> Self {
        let mut annotated = self.clone();
        for (variant, &pip) in annotated.variants.iter_mut().zip(pips) {
            variant.pip = Some(pip);
        }
        annotated
    }
}

impl<'a> IntoIterator for &'a VariantSet {
    type Item = &'a Variant;
    type IntoIter = std::slice::Iter<'a, Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.variants.iter()
    }
}

// ========================================================================================
//                                     LD matrices
// ========================================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LdMatrixError {
    #[error("LD matrix is {rows}x{cols} but must be square.")]
    NotSquare { rows: usize, cols: usize },
    #[error("LD matrix has dimension {matrix} but {variants} variant identifiers were supplied.")]
    DimensionMismatch { matrix: usize, variants: usize },
    #[error("LD matrix entry ({row}, {col}) is not finite.")]
    NonFinite { row: usize, col: usize },
    #[error("LD matrix entry ({row}, {col}) = {value} lies outside [-1, 1].")]
    OutOfRange { row: usize, col: usize, value: f64 },
    #[error("LD matrix is not symmetric at ({row}, {col}): {upper} vs {lower}.")]
    NotSymmetric {
        row: usize,
        col: usize,
        upper: f64,
        lower: f64,
    },
    #[error("LD matrix diagonal entry {index} is {value}, expected 1.")]
    NonUnitDiagonal { index: usize, value: f64 },
}

/// A symmetric, unit-diagonal correlation matrix aligned to a list of variant identifiers.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct LdMatrix {
    ids: Vec<String>,
    values: Array2<f64>,
}

impl LdMatrix {
    /// Validates and wraps `values`. Every invariant is checked; nothing is repaired here.
    pub fn new(ids: Vec<String>, values: Array2<f64>) -> Result<Self, LdMatrixError> {
        let (rows, cols) = values.dim();
        if rows != cols {
            return Err(LdMatrixError::NotSquare { rows, cols });
        }
        if rows != ids.len() {
            return Err(LdMatrixError::DimensionMismatch {
                matrix: rows,
                variants: ids.len(),
            });
        }
        for i in 0..rows {
            let diagonal = values[[i, i]];
            if diagonal != 1.0 {
                return Err(LdMatrixError::NonUnitDiagonal {
                    index: i,
                    value: diagonal,
                });
            }
            for j in 0..i {
                let upper = values[[j, i]];
                let lower = values[[i, j]];
                if !upper.is_finite() {
                    return Err(LdMatrixError::NonFinite { row: j, col: i });
                }
                if !lower.is_finite() {
                    return Err(LdMatrixError::NonFinite { row: i, col: j });
                }
                if upper != lower {
                    return Err(LdMatrixError::NotSymmetric {
                        row: j,
                        col: i,
                        upper,
                        lower,
                    });
                }
                if !(-1.0..=1.0).contains(&upper) {
                    return Err(LdMatrixError::OutOfRange {
                        row: j,
                        col: i,
                        value: upper,
                    });
                }
            }
        }
        Ok(Self { ids, values })
    }

    pub fn dim(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[[row, col]]
    }
}

// ========================================================================================
//                                 Fine-mapping results
// ========================================================================================

/// Raw output of one fine-mapping engine run for a given `l`.
///
/// `credible_sets` hold 1-based indices into the variant order the engine was given;
/// they are only ever converted in `translate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFit {
    pub l: usize,
    pub elbo: f64,
    pub converged: bool,
    pub credible_sets: Vec<Vec<usize>>,
    pub pips: Vec<f64>,
    pub iterations: Option<usize>,
}

/// One credible set expressed in variant identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredibleSet {
    /// 1-based number of the set in the engine's output order.
    pub number: usize,
    pub variant_ids: Vec<String>,
}

/// Final per-region fine-mapping output.
#[derive(Debug, Clone)]
pub struct FineMapResult {
    pub credible_sets: Vec<CredibleSet>,
    pub pips: HashMap<String, f64>,
    /// The variants the model saw, in LD order, with `pip` filled in.
    pub variants: VariantSet,
    pub l: usize,
    pub elbo: f64,
    pub converged: bool,
}

impl FineMapResult {
    pub fn pip(&self, id: &str) -> Option<f64> {
        self.pips.get(id).copied()
    }

    /// Credible set number containing `id`, if any.
    pub fn credible_set_of(&self, id: &str) -> Option<usize> {
        self.credible_sets
            .iter()
            .find(|cs| cs.variant_ids.iter().any(|v| v == id))
            .map(|cs| cs.number)
    }
}
