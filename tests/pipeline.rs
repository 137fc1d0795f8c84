use finemap::engine::{EngineError, FineMappingEngine};
use finemap::ld::{LdError, LdOutcome, LdProvider, ReferencePanel, align_to_reference};
use finemap::leads::{LeadOptions, find_leads};
use finemap::pipeline::{FineMapError, FineMapper, LeadSpec, LocusRequest};
use finemap::progress::NoopSearchProgress;
use finemap::region::{RegionError, select};
use finemap::select::{LSelection, SearchSettings};
use finemap::sumstats::load_sumstats;
use finemap::types::{Chromosome, LdMatrix, ModelFit, Variant, VariantSet};
use ndarray::{Array2, ArrayView1};
use std::io::Write;

/// LD from a fixed correlation `rho ^ |i - j|` over the requested variants, optionally
/// dropping some identifiers the way a reference panel would.
struct DecayingLd {
    rho: f64,
    missing: Vec<&'static str>,
    reversed: bool,
}

impl LdProvider for DecayingLd {
    fn compute(&self, variants: &VariantSet, panel: &ReferencePanel) -> Result<LdOutcome, LdError> {
        assert_eq!(panel.population, "EUR");
        let mut ids: Vec<String> = variants
            .iter()
            .map(|v| v.id.clone())
            .filter(|id| !self.missing.iter().any(|m| *m == id.as_str()))
            .collect();
        if self.reversed {
            ids.reverse();
        }
        let n = ids.len();
        let values = Array2::from_shape_fn((n, n), |(i, j)| {
            self.rho.powi((i as i32 - j as i32).abs())
        });
        align_to_reference(variants, ids, values, "in-memory")
    }
}

/// Puts all posterior mass on the variant with the largest |z|.
struct PeakEngine {
    converges: bool,
}

impl PeakEngine {
    fn new(converges: bool) -> Self {
        Self { converges }
    }
}

impl FineMappingEngine for PeakEngine {
    fn fit(
        &self,
        z: ArrayView1<f64>,
        ld: &LdMatrix,
        n: u64,
        l: usize,
    ) -> Result<ModelFit, EngineError> {
        finemap::engine::check_inputs(z, ld, n, l)?;
        let peak = z
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap();
        let mut pips = vec![0.0; z.len()];
        pips[peak] = 0.97;
        Ok(ModelFit {
            l,
            elbo: -(l as f64),
            converged: self.converges,
            credible_sets: vec![vec![peak + 1]],
            pips,
            iterations: Some(3),
        })
    }
}

fn five_variant_sumstats() -> VariantSet {
    VariantSet::new(
        [100u64, 200, 300, 400, 500]
            .iter()
            .zip([1.0, 2.5, 8.0, 3.0, 0.5])
            .map(|(&pos, z)| {
                Variant::from_z(format!("1:{pos}:A:G"), Chromosome::Autosome(1), pos, z)
                    .with_alleles("G", "A")
                    .with_sample_size(5000)
            })
            .collect(),
    )
    .unwrap()
}

fn mapper(ld: DecayingLd, engine: PeakEngine) -> FineMapper {
    FineMapper::new(
        Box::new(ld),
        Box::new(engine),
        ReferencePanel::new("/reference", "EUR"),
    )
}

fn ld(missing: Vec<&'static str>, reversed: bool) -> DecayingLd {
    DecayingLd {
        rho: 0.6,
        missing,
        reversed,
    }
}

#[test]
fn region_selection_example_keeps_inner_three_variants() {
    let sumstats = five_variant_sumstats();
    let region = finemap::types::Region::new(Chromosome::Autosome(1), 300, 150);
    let selected = finemap::region::select_region(&sumstats, &region).unwrap();
    let positions: Vec<u64> = selected.iter().map(|v| v.position).collect();
    assert_eq!(positions, vec![200, 300, 400]);
    assert!(selected.iter().all(|v| v.chromosome == Chromosome::Autosome(1)
        && v.position >= 150
        && v.position <= 450));
}

#[test]
fn empty_region_is_an_error_not_an_empty_result() {
    let sumstats = five_variant_sumstats();
    assert!(matches!(
        select(&sumstats, Chromosome::Autosome(2), 300, 500),
        Err(RegionError::RegionNotFound(_))
    ));
}

#[test]
fn end_to_end_search_picks_smallest_l_and_maps_credible_sets() {
    let sumstats = five_variant_sumstats();
    let mapper = mapper(ld(Vec::new(), false), PeakEngine::new(true));
    let request = LocusRequest {
        lead: LeadSpec::Variant {
            id: "1:300:A:G".into(),
            chromosome: Some(Chromosome::Autosome(1)),
        },
        window_kb: 1,
        selection: LSelection::Search(SearchSettings::default()),
    };

    let report = mapper
        .finemap_region(&sumstats, &request, &mut NoopSearchProgress)
        .unwrap();
    let result = &report.result;

    assert_eq!(report.requested_variants, 5);
    assert_eq!(report.sample_size, 5000);
    assert_eq!(result.l, 1);
    assert!(result.converged);
    assert_eq!(result.credible_sets.len(), 1);
    assert_eq!(result.credible_sets[0].variant_ids, vec!["1:300:A:G"]);
    assert_eq!(result.pip("1:300:A:G"), Some(0.97));
    assert!(result.pips.values().all(|p| (0.0..=1.0).contains(p)));
    // L is capped at the number of variants, so all five candidates are tried.
    assert_eq!(report.trials.len(), 5);
}

#[test]
fn reduced_and_reordered_ld_drives_downstream_alignment() {
    let sumstats = five_variant_sumstats();
    let mapper = mapper(ld(vec!["1:100:A:G", "1:500:A:G"], true), PeakEngine::new(true));
    let request = LocusRequest {
        lead: LeadSpec::Variant {
            id: "1:300:A:G".into(),
            chromosome: None,
        },
        window_kb: 1,
        selection: LSelection::Fixed(2),
    };

    let report = mapper
        .finemap_region(&sumstats, &request, &mut NoopSearchProgress)
        .unwrap();
    let result = &report.result;

    assert_eq!(
        result.variants.ids(),
        vec!["1:400:A:G", "1:300:A:G", "1:200:A:G"]
    );
    // The engine's 1-based index 2 is the second variant of the LD order.
    assert_eq!(result.credible_sets[0].variant_ids, vec!["1:300:A:G"]);
    assert_eq!(result.pips.len(), 3);
    assert_eq!(result.variants.get(1).unwrap().pip, Some(0.97));
    assert_eq!(result.l, 2);
}

#[test]
fn ld_matrices_are_symmetric_with_unit_diagonal() {
    let sumstats = five_variant_sumstats();
    let outcome = ld(vec!["1:200:A:G"], true)
        .compute(&sumstats, &ReferencePanel::new("/reference", "EUR"))
        .unwrap();
    let m = &outcome.matrix;
    assert_eq!(m.dim(), outcome.variants.len());
    for i in 0..m.dim() {
        assert_eq!(m.get(i, i), 1.0);
        for j in 0..m.dim() {
            assert_eq!(m.get(i, j), m.get(j, i));
            assert!((-1.0..=1.0).contains(&m.get(i, j)));
        }
    }
}

#[test]
fn non_convergence_is_flagged_unless_required() {
    let sumstats = five_variant_sumstats();
    let request = LocusRequest {
        lead: LeadSpec::Variant {
            id: "1:300:A:G".into(),
            chromosome: None,
        },
        window_kb: 1,
        selection: LSelection::Search(SearchSettings::default()),
    };

    let lenient = mapper(ld(Vec::new(), false), PeakEngine::new(false));
    let report = lenient
        .finemap_region(&sumstats, &request, &mut NoopSearchProgress)
        .unwrap();
    assert!(!report.result.converged);

    let strict = mapper(ld(Vec::new(), false), PeakEngine::new(false)).with_require_convergence(true);
    assert!(matches!(
        strict.finemap_region(&sumstats, &request, &mut NoopSearchProgress),
        Err(FineMapError::NotConverged { .. })
    ));
}

#[test]
fn sample_size_override_and_missing_sample_size() {
    let without_n = VariantSet::new(vec![
        Variant::from_z("a", Chromosome::Autosome(1), 1_000, 5.0),
        Variant::from_z("b", Chromosome::Autosome(1), 1_200, 2.0),
    ])
    .unwrap();
    let request = LocusRequest {
        lead: LeadSpec::Variant {
            id: "a".into(),
            chromosome: None,
        },
        window_kb: 1,
        selection: LSelection::Fixed(1),
    };

    let missing = mapper(ld(Vec::new(), false), PeakEngine::new(true));
    assert!(matches!(
        missing.finemap_region(&without_n, &request, &mut NoopSearchProgress),
        Err(FineMapError::MissingSampleSize(_))
    ));

    let overridden =
        mapper(ld(Vec::new(), false), PeakEngine::new(true)).with_sample_size(Some(777));
    let report = overridden
        .finemap_region(&without_n, &request, &mut NoopSearchProgress)
        .unwrap();
    assert_eq!(report.sample_size, 777);
}

#[test]
fn no_overlap_with_reference_aborts_the_region() {
    let sumstats = five_variant_sumstats();
    let everything_missing = ld(
        vec!["1:100:A:G", "1:200:A:G", "1:300:A:G", "1:400:A:G", "1:500:A:G"],
        false,
    );
    let mapper = mapper(everything_missing, PeakEngine::new(true));
    let request = LocusRequest {
        lead: LeadSpec::Position {
            chromosome: Chromosome::Autosome(1),
            position: 300,
        },
        window_kb: 1,
        selection: LSelection::Fixed(1),
    };
    assert!(matches!(
        mapper.finemap_region(&sumstats, &request, &mut NoopSearchProgress),
        Err(FineMapError::Ld(LdError::NoOverlap { requested: 5 }))
    ));
}

#[test]
fn batch_over_detected_leads_isolates_failures() {
    let tsv = "SNP\tCHR\tBP\tA1\tA2\tZ\tN\n\
               a\t1\t1000000\tA\tG\t7.5\t10000\n\
               b\t1\t1000200\tA\tG\t3.0\t10000\n\
               c\t2\t5000000\tC\tT\t-8.0\t10000\n\
               d\t3\t100\tC\tT\t1.0\t10000\n";
    let mut file = tempfile::Builder::new().suffix(".tsv").tempfile().unwrap();
    file.write_all(tsv.as_bytes()).unwrap();
    file.flush().unwrap();
    let sumstats = load_sumstats(file.path()).unwrap();

    let leads = find_leads(&sumstats, &LeadOptions::default());
    let ids: Vec<&str> = leads.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);

    // The panel lacks every chromosome 2 variant.
    let mapper = mapper(ld(vec!["c"], false), PeakEngine::new(true));
    let outcomes = mapper.finemap_leads(
        &sumstats,
        &leads,
        500,
        LSelection::Fixed(1),
        &mut NoopSearchProgress,
    );
    assert_eq!(outcomes.len(), 2);
    let first = outcomes[0].outcome.as_ref().unwrap();
    assert_eq!(first.lead_id.as_deref(), Some("a"));
    assert_eq!(first.result.credible_sets[0].variant_ids, vec!["a"]);
    assert!(matches!(
        outcomes[1].outcome,
        Err(FineMapError::Ld(LdError::NoOverlap { .. }))
    ));
}
