//! Detection of independent lead variants from genome-wide summary statistics.
//!
//! Significant variants are clumped purely by distance: walking each chromosome in position
//! order, a significant variant joins the current cluster when it lies within `window_kb` of
//! the previous significant variant. Each cluster contributes its strongest variant.

use crate::types::{Variant, VariantSet};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::cmp::Ordering;
use std::f64::consts::SQRT_2;

/// Genome-wide significance threshold.
pub const DEFAULT_SIG_LEVEL: f64 = 5.0e-8;
pub const DEFAULT_LEAD_WINDOW_KB: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadOptions {
    pub sig_level: f64,
    pub window_kb: u64,
}

impl Default for LeadOptions {
    fn default() -> Self {
        Self {
            sig_level: DEFAULT_SIG_LEVEL,
            window_kb: DEFAULT_LEAD_WINDOW_KB,
        }
    }
}

/// Two-sided p-value, preferring the supplied one over the z-derived one.
pub fn p_value(variant: &Variant) -> f64 {
    variant
        .p_value
        .unwrap_or_else(|| erfc(variant.z.abs() / SQRT_2))
}

/// Orders two variants by strength of association: smaller p first, then larger |z|, then
/// smaller position.
fn stronger(a: &Variant, b: &Variant) -> Ordering {
    p_value(a)
        .total_cmp(&p_value(b))
        .then_with(|| b.z.abs().total_cmp(&a.z.abs()))
        .then_with(|| a.position.cmp(&b.position))
}

/// Returns one lead variant per distance cluster of significant variants, ordered by
/// chromosome and position.
pub fn find_leads(sumstats: &VariantSet, options: &LeadOptions) -> Vec<Variant> {
    let window = options.window_kb.saturating_mul(1000);

    let mut significant: Vec<&Variant> = sumstats
        .iter()
        .filter(|v| p_value(v) <= options.sig_level)
        .collect();
    significant.sort_by(|a, b| {
        a.chromosome
            .cmp(&b.chromosome)
            .then_with(|| a.position.cmp(&b.position))
    });

    let mut leads = Vec::new();
    let mut cluster: Vec<&Variant> = Vec::new();
    for variant in significant {
        let extends_cluster = cluster.last().is_some_and(|previous| {
            previous.chromosome == variant.chromosome
                && variant.position - previous.position <= window
        });
        if !extends_cluster {
            if let Some(lead) = cluster.iter().copied().min_by(|a, b| stronger(a, b)) {
                leads.push(lead.clone());
            }
            cluster.clear();
        }
        cluster.push(variant);
    }
    if let Some(lead) = cluster.iter().copied().min_by(|a, b| stronger(a, b)) {
        leads.push(lead.clone());
    }

    log::info!(
        "Found {} lead variants at p <= {:e} with a {} kb clumping window",
        leads.len(),
        options.sig_level,
        options.window_kb
    );
    leads
}
