//! Extraction of the variants around a lead variant.

use crate::types::{Chromosome, Region, Variant, VariantSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegionError {
    #[error("No variants were found in region {0}.")]
    RegionNotFound(Region),
    #[error("Lead variant '{0}' was not found in the summary statistics.")]
    LeadVariantNotFound(String),
    #[error("Lead variant '{id}' is on chromosome {found}, but chromosome {expected} was requested.")]
    ChromosomeMismatch {
        id: String,
        found: Chromosome,
        expected: Chromosome,
    },
}

/// Returns the variants of `sumstats` lying in `[center - window_kb*1000, center + window_kb*1000]`
/// on `chromosome`.
pub fn select(
    sumstats: &VariantSet,
    chromosome: Chromosome,
    center: u64,
    window_kb: u64,
) -> Result<VariantSet, RegionError> {
    select_region(sumstats, &Region::from_kb(chromosome, center, window_kb))
}

/// Returns the variants of `sumstats` inside `region`, bounds inclusive, in their original
/// order. An empty selection is an error: there is nothing to compute LD for.
pub fn select_region(sumstats: &VariantSet, region: &Region) -> Result<VariantSet, RegionError> {
    let selected = sumstats.filter(|variant| region.contains(variant));
    if selected.is_empty() {
        return Err(RegionError::RegionNotFound(*region));
    }
    log::info!("Selected {} variants in {}", selected.len(), region);
    Ok(selected)
}

/// Finds a lead variant by identifier, ignoring case. When `expected` is given, the lead
/// must sit on that chromosome.
pub fn locate_lead<'a>(
    sumstats: &'a VariantSet,
    lead_id: &str,
    expected: Option<Chromosome>,
) -> Result<&'a Variant, RegionError> {
    let lead = match sumstats.get_by_id(lead_id) {
        Some(variant) => variant,
        None => sumstats
            .iter()
            .find(|v| v.id.eq_ignore_ascii_case(lead_id))
            .ok_or_else(|| RegionError::LeadVariantNotFound(lead_id.to_string()))?,
    };

    if let Some(expected) = expected {
        if lead.chromosome != expected {
            return Err(RegionError::ChromosomeMismatch {
                id: lead.id.clone(),
                found: lead.chromosome,
                expected,
            });
        }
    }
    Ok(lead)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sumstats() -> VariantSet {
        let mut variants: Vec<Variant> = [100u64, 200, 300, 400, 500]
            .iter()
            .map(|&pos| Variant::from_z(format!("1:{pos}:A:G"), Chromosome::Autosome(1), pos, 1.0))
            .collect();
        variants.push(Variant::from_z("rs2_300", Chromosome::Autosome(2), 300, 1.0));
        VariantSet::new(variants).unwrap()
    }

    #[test]
    fn selects_inclusive_window_on_matching_chromosome() {
        let region = Region::new(Chromosome::Autosome(1), 300, 150);
        let selected = select_region(&sumstats(), &region).unwrap();
        let positions: Vec<u64> = selected.iter().map(|v| v.position).collect();
        assert_eq!(positions, vec![200, 300, 400]);
        assert!(selected.iter().all(|v| v.chromosome == Chromosome::Autosome(1)));
    }

    #[test]
    fn boundary_positions_are_included() {
        let region = Region::new(Chromosome::Autosome(1), 300, 200);
        let selected = select_region(&sumstats(), &region).unwrap();
        assert_eq!(selected.len(), 5);
    }

    #[test]
    fn window_in_kilobases_is_converted() {
        let selected = select(&sumstats(), Chromosome::Autosome(2), 1000, 1).unwrap();
        assert_eq!(selected.ids(), vec!["rs2_300"]);
    }

    #[test]
    fn empty_window_is_an_error() {
        let region = Region::new(Chromosome::Autosome(1), 10_000, 100);
        assert_eq!(
            select_region(&sumstats(), &region).unwrap_err(),
            RegionError::RegionNotFound(region)
        );
        assert!(select(&sumstats(), Chromosome::X, 300, 500).is_err());
    }

    #[test]
    fn selection_does_not_mutate_source() {
        let source = sumstats();
        let region = Region::new(Chromosome::Autosome(1), 300, 0);
        let selected = select_region(&source, &region).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(source.len(), 6);
    }

    #[test]
    fn lead_lookup_ignores_case_and_checks_chromosome() {
        let set = VariantSet::new(vec![Variant::from_z(
            "rs123",
            Chromosome::Autosome(16),
            53_802_494,
            8.0,
        )])
        .unwrap();
        assert_eq!(locate_lead(&set, "RS123", None).unwrap().position, 53_802_494);
        assert!(matches!(
            locate_lead(&set, "rs123", Some(Chromosome::Autosome(1))),
            Err(RegionError::ChromosomeMismatch { .. })
        ));
        assert_eq!(
            locate_lead(&set, "rs999", None).unwrap_err(),
            RegionError::LeadVariantNotFound("rs999".into())
        );
    }
}
