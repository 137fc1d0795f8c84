// ========================================================================================
//                               Region fine-mapping pipeline
// ========================================================================================

// Region selection -> LD -> model selection -> translation, for one locus at a time. The LD
// provider decides which variants survive; z-scores and sample sizes are always taken from
// the variant set it returns, never from the requested one.

use crate::config::ConfigError;
use crate::engine::FineMappingEngine;
use crate::ld::{LdError, LdProvider, ReferencePanel};
use crate::output::OutputError;
use crate::progress::SearchProgressObserver;
use crate::region::{self, RegionError};
use crate::search::Trial;
use crate::select::{LSelection, SelectionError, select_model};
use crate::sumstats::SumstatsError;
use crate::translate::{TranslateError, translate};
use crate::types::{Chromosome, FineMapResult, Region, Variant, VariantSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FineMapError {
    #[error(transparent)]
    Sumstats(#[from] SumstatsError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Ld(#[from] LdError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "No sample size available: the summary statistics have no N for variant '{0}' and none was configured."
    )]
    MissingSampleSize(String),
    #[error("The selected model (L = {l}) did not converge and convergence is required.")]
    NotConverged { l: usize, elbo: f64 },
}

/// Where to center a fine-mapping window.
#[derive(Debug, Clone, PartialEq)]
pub enum LeadSpec {
    /// A variant identifier, optionally with the chromosome it must be on.
    Variant {
        id: String,
        chromosome: Option<Chromosome>,
    },
    Position {
        chromosome: Chromosome,
        position: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocusRequest {
    pub lead: LeadSpec,
    pub window_kb: u64,
    pub selection: LSelection,
}

/// Everything produced for one region.
#[derive(Debug, Clone)]
pub struct RegionReport {
    pub region: Region,
    pub lead_id: Option<String>,
    /// Variants inside the window before LD filtering.
    pub requested_variants: usize,
    pub sample_size: u64,
    pub result: FineMapResult,
    pub trials: Vec<Trial>,
}

/// Outcome of fine-mapping one detected lead.
#[derive(Debug)]
pub struct LeadOutcome {
    pub lead: Variant,
    pub outcome: Result<RegionReport, FineMapError>,
}

pub struct FineMapper {
    ld: Box<dyn LdProvider>,
    engine: Box<dyn FineMappingEngine>,
    panel: ReferencePanel,
    sample_size: Option<u64>,
    require_convergence: bool,
}

impl FineMapper {
    pub fn new(
        ld: Box<dyn LdProvider>,
        engine: Box<dyn FineMappingEngine>,
        panel: ReferencePanel,
    ) -> Self {
        Self {
            ld,
            engine,
            panel,
            sample_size: None,
            require_convergence: false,
        }
    }

    /// Uses `n` for every region instead of the N column.
    pub fn with_sample_size(mut self, n: Option<u64>) -> Self {
        self.sample_size = n;
        self
    }

    /// Turns a non-converged final fit into [`FineMapError::NotConverged`].
    pub fn with_require_convergence(mut self, require: bool) -> Self {
        self.require_convergence = require;
        self
    }

    fn resolve_region(
        &self,
        sumstats: &VariantSet,
        request: &LocusRequest,
    ) -> Result<(Region, Option<String>), FineMapError> {
        match &request.lead {
            LeadSpec::Variant { id, chromosome } => {
                let lead = region::locate_lead(sumstats, id, *chromosome)?;
                Ok((
                    Region::from_kb(lead.chromosome, lead.position, request.window_kb),
                    Some(lead.id.clone()),
                ))
            }
            LeadSpec::Position {
                chromosome,
                position,
            } => Ok((Region::from_kb(*chromosome, *position, request.window_kb), None)),
        }
    }

    fn sample_size_for(&self, variants: &VariantSet) -> Result<u64, FineMapError> {
        if let Some(n) = self.sample_size {
            return Ok(n);
        }
        let first = variants.get(0).map(|v| v.id.clone()).unwrap_or_default();
        variants
            .get(0)
            .and_then(|v| v.sample_size)
            .ok_or(FineMapError::MissingSampleSize(first))
    }

    /// Fine-maps one locus of `sumstats`.
    pub fn finemap_region(
        &self,
        sumstats: &VariantSet,
        request: &LocusRequest,
        observer: &mut dyn SearchProgressObserver,
    ) -> Result<RegionReport, FineMapError> {
        let (region, lead_id) = self.resolve_region(sumstats, request)?;
        let selected = region::select_region(sumstats, &region)?;

        let ld = self.ld.compute(&selected, &self.panel)?;
        log::info!(
            "LD available for {} of {} variants in {}",
            ld.variants.len(),
            selected.len(),
            region
        );

        let n = self.sample_size_for(&ld.variants)?;
        let z = ld.variants.z_scores();
        let model = select_model(
            self.engine.as_ref(),
            z.view(),
            &ld.matrix,
            n,
            &request.selection,
            observer,
        )?;

        if !model.fit.converged {
            if self.require_convergence {
                return Err(FineMapError::NotConverged {
                    l: model.fit.l,
                    elbo: model.fit.elbo,
                });
            }
            log::warn!(
                "Reporting a non-converged fit for {region}; treat its credible sets with caution"
            );
        }

        let result = translate(&model.fit, &ld.variants)?;
        log::info!(
            "{}: L = {}, {} credible set(s)",
            region,
            result.l,
            result.credible_sets.len()
        );

        Ok(RegionReport {
            region,
            lead_id,
            requested_variants: selected.len(),
            sample_size: n,
            result,
            trials: model.trials,
        })
    }

    /// Fine-maps a window around each lead. A failure only affects its own lead.
    pub fn finemap_leads(
        &self,
        sumstats: &VariantSet,
        leads: &[Variant],
        window_kb: u64,
        selection: LSelection,
        observer: &mut dyn SearchProgressObserver,
    ) -> Vec<LeadOutcome> {
        leads
            .iter()
            .map(|lead| {
                let request = LocusRequest {
                    lead: LeadSpec::Variant {
                        id: lead.id.clone(),
                        chromosome: Some(lead.chromosome),
                    },
                    window_kb,
                    selection,
                };
                let outcome = self.finemap_region(sumstats, &request, observer);
                if let Err(e) = &outcome {
                    log::error!("Fine-mapping around {} failed: {e}", lead.id);
                }
                LeadOutcome {
                    lead: lead.clone(),
                    outcome,
                }
            })
            .collect()
    }
}
