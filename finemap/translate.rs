//! Conversion of raw engine output into variant identifiers.
//!
//! This is the only place where the engine's 1-based indices are turned into 0-based
//! positions of a [`VariantSet`].

use crate::types::{CredibleSet, FineMapResult, ModelFit, VariantSet};
use std::collections::HashMap;
use thiserror::Error;

/// PIPs this far outside `[0, 1]` are treated as rounding noise and clamped.
const PIP_TOLERANCE: f64 = 1.0e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslateError {
    #[error("Credible set {set} refers to variant index {index}, but only {len} variants were fine-mapped (indices are 1-based).")]
    IndexOutOfRange { set: usize, index: usize, len: usize },
    #[error("The engine returned {pips} PIPs for {variants} variants.")]
    PipLengthMismatch { pips: usize, variants: usize },
    #[error("PIP of variant '{id}' is {value}, outside [0, 1].")]
    InvalidPip { id: String, value: f64 },
}

/// Converts a 1-based engine index into a 0-based position, if it addresses one of `len`
/// variants.
#[inline]
pub fn to_zero_based(index: usize, len: usize) -> Option<usize> {
    if index == 0 || index > len {
        None
    } else {
        Some(index - 1)
    }
}

fn checked_pip(id: &str, value: f64) -> Result<f64, TranslateError> {
    if value.is_finite() && value >= -PIP_TOLERANCE && value <= 1.0 + PIP_TOLERANCE {
        Ok(value.clamp(0.0, 1.0))
    } else {
        Err(TranslateError::InvalidPip {
            id: id.to_string(),
            value,
        })
    }
}

/// Builds the final result for `variants`, which must be in the order the engine saw.
pub fn translate(fit: &ModelFit, variants: &VariantSet) -> Result<FineMapResult, TranslateError> {
    let len = variants.len();
    if fit.pips.len() != len {
        return Err(TranslateError::PipLengthMismatch {
            pips: fit.pips.len(),
            variants: len,
        });
    }

    let mut credible_sets = Vec::with_capacity(fit.credible_sets.len());
    for (k, raw) in fit.credible_sets.iter().enumerate() {
        let number = k + 1;
        let mut variant_ids = Vec::with_capacity(raw.len());
        for &index in raw {
            let position = to_zero_based(index, len).ok_or(TranslateError::IndexOutOfRange {
                set: number,
                index,
                len,
            })?;
            if let Some(variant) = variants.get(position) {
                variant_ids.push(variant.id.clone());
            }
        }
        credible_sets.push(CredibleSet {
            number,
            variant_ids,
        });
    }

    let mut pips = HashMap::with_capacity(len);
    let mut checked = Vec::with_capacity(len);
    for (variant, &raw_pip) in variants.iter().zip(&fit.pips) {
        let pip = checked_pip(&variant.id, raw_pip)?;
        pips.insert(variant.id.clone(), pip);
        checked.push(pip);
    }
    let variants = variants.with_pips(&checked);

    Ok(FineMapResult {
        credible_sets,
        pips,
        variants,
        l: fit.l,
        elbo: fit.elbo,
        converged: fit.converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chromosome, Variant};

    fn five_variants() -> VariantSet {
        VariantSet::new(
            (1..=5)
                .map(|i| Variant::from_z(format!("rs{i}"), Chromosome::Autosome(1), i * 100, 1.0))
                .collect(),
        )
        .unwrap()
    }

    fn fit(credible_sets: Vec<Vec<usize>>, pips: Vec<f64>) -> ModelFit {
        ModelFit {
            l: 2,
            elbo: -10.0,
            converged: true,
            credible_sets,
            pips,
            iterations: None,
        }
    }

    #[test]
    fn one_based_indices_map_to_the_right_variants() {
        let variants = five_variants();
        let result = translate(&fit(vec![vec![1, 3, 5]], vec![0.2; 5]), &variants).unwrap();
        assert_eq!(result.credible_sets.len(), 1);
        assert_eq!(result.credible_sets[0].number, 1);
        assert_eq!(
            result.credible_sets[0].variant_ids,
            vec![
                variants.get(0).unwrap().id.clone(),
                variants.get(2).unwrap().id.clone(),
                variants.get(4).unwrap().id.clone(),
            ]
        );
        assert_eq!(result.credible_set_of("rs3"), Some(1));
        assert_eq!(result.credible_set_of("rs2"), None);
    }

    #[test]
    fn zero_and_overflowing_indices_are_rejected() {
        let variants = five_variants();
        assert_eq!(
            translate(&fit(vec![vec![0]], vec![0.0; 5]), &variants).unwrap_err(),
            TranslateError::IndexOutOfRange {
                set: 1,
                index: 0,
                len: 5
            }
        );
        assert!(matches!(
            translate(&fit(vec![vec![2], vec![6]], vec![0.0; 5]), &variants),
            Err(TranslateError::IndexOutOfRange { set: 2, index: 6, .. })
        ));
    }

    #[test]
    fn pips_are_attached_and_bounded() {
        let variants = five_variants();
        let pips = vec![0.9, 1.0 + 1e-12, -1e-12, 0.0, 0.5];
        let result = translate(&fit(Vec::new(), pips), &variants).unwrap();
        assert_eq!(result.pip("rs1"), Some(0.9));
        assert_eq!(result.pip("rs2"), Some(1.0));
        assert_eq!(result.pip("rs3"), Some(0.0));
        assert!(result.pips.values().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(result.variants.get(4).unwrap().pip, Some(0.5));
        assert_eq!(result.variants.ids(), variants.ids());
        assert_eq!((result.l, result.elbo, result.converged), (2, -10.0, true));
    }

    #[test]
    fn pip_problems_are_errors() {
        let variants = five_variants();
        assert!(matches!(
            translate(&fit(Vec::new(), vec![0.1; 4]), &variants),
            Err(TranslateError::PipLengthMismatch { pips: 4, variants: 5 })
        ));
        assert!(matches!(
            translate(&fit(Vec::new(), vec![0.1, 0.1, 1.5, 0.1, 0.1]), &variants),
            Err(TranslateError::InvalidPip { .. })
        ));
    }

    #[test]
    fn zero_based_conversion() {
        assert_eq!(to_zero_based(1, 5), Some(0));
        assert_eq!(to_zero_based(5, 5), Some(4));
        assert_eq!(to_zero_based(0, 5), None);
        assert_eq!(to_zero_based(6, 5), None);
    }
}
