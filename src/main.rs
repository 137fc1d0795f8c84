// ========================================================================================
//
//                          THE COMMAND-LINE FRONT END: FINEMAP
//
// ========================================================================================
//
// Thin orchestration over the `finemap` library. It owns argument parsing, merges
// command-line flags over the optional TOML configuration, renders search progress and
// writes result files. No statistical decision is made here.

use clap::{Args, CommandFactory, Parser, Subcommand, error::ErrorKind};
use finemap::config::FineMapConfig;
use finemap::leads::{LeadOptions, find_leads};
use finemap::output::{write_leads, write_region_outputs};
use finemap::pipeline::{FineMapError, FineMapper, LeadSpec, LocusRequest, RegionReport};
use finemap::progress::SearchProgressObserver;
use finemap::search::Trial;
use finemap::sumstats::load_sumstats;
use finemap::types::{Chromosome, VariantSet};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashSet;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "finemap",
    version,
    about = "Fine-map GWAS loci with SuSiE using summary statistics and reference LD"
)]
struct Cli {
    /// TOML configuration file; command-line flags take precedence over its values
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that fine-maps a region.
#[derive(Args, Debug, Default)]
struct ModelArgs {
    /// Radius of the fine-mapping window around the lead, in kilobases
    #[arg(long, value_name = "KB")]
    window_kb: Option<u64>,

    /// Number of causal effects; 0 or a negative value searches for the best L
    #[arg(long, allow_hyphen_values = true)]
    l: Option<i64>,

    /// Directory holding the per-population PLINK reference panel
    #[arg(long, value_name = "DIR")]
    reference_dir: Option<PathBuf>,

    /// Reference population code (e.g. EUR)
    #[arg(long)]
    population: Option<String>,

    /// Precomputed square LD matrix, used instead of the reference panel
    #[arg(long, value_name = "FILE", requires = "ld_variants")]
    ld_matrix: Option<PathBuf>,

    /// Variant list matching the rows of --ld-matrix
    #[arg(long, value_name = "FILE", requires = "ld_matrix")]
    ld_variants: Option<PathBuf>,

    /// GWAS sample size, overriding the N column
    #[arg(long, value_name = "N")]
    sample_size: Option<u64>,

    /// Fail a region whose selected model did not converge
    #[arg(long)]
    require_convergence: bool,

    /// Number of L values to try when searching
    #[arg(long)]
    trials: Option<usize>,

    /// Evaluate the initial L candidates concurrently
    #[arg(long)]
    parallel_trials: bool,
}

impl ModelArgs {
    fn apply(&self, config: &mut FineMapConfig) {
        if let Some(window_kb) = self.window_kb {
            config.region.window_kb = window_kb;
        }
        if let Some(l) = self.l {
            config.search.l = l;
        }
        if let Some(dir) = &self.reference_dir {
            config.ld.reference_dir = Some(dir.clone());
        }
        if let Some(population) = &self.population {
            config.ld.population = population.clone();
        }
        if self.ld_matrix.is_some() {
            config.ld.matrix = self.ld_matrix.clone();
            config.ld.variants = self.ld_variants.clone();
        }
        if self.sample_size.is_some() {
            config.sample_size = self.sample_size;
        }
        if self.require_convergence {
            config.require_convergence = true;
        }
        if let Some(trials) = self.trials {
            config.search.search.trials = trials;
        }
        if self.parallel_trials {
            config.search.search.parallel = true;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-map a single region around a lead variant or position
    #[command(about = "Fine-map one region (outputs: <prefix>.cs.tsv, .pip.tsv, .summary.toml)")]
    Region {
        /// Tab-separated summary statistics (plain or gzip)
        #[arg(long, value_name = "FILE")]
        sumstats: PathBuf,

        /// Identifier of the lead variant at the center of the window
        #[arg(long, conflicts_with = "position", required_unless_present = "position")]
        lead_variant: Option<String>,

        /// Chromosome of the window (checked against the lead when both are given)
        #[arg(long)]
        chromosome: Option<Chromosome>,

        /// Center of the window, used instead of a lead variant
        #[arg(long, requires = "chromosome")]
        position: Option<u64>,

        #[command(flatten)]
        model: ModelArgs,

        /// Prefix for the output files
        #[arg(long, value_name = "PREFIX")]
        out_prefix: PathBuf,
    },

    /// Detect independent lead variants
    #[command(about = "Detect lead variants (outputs: leads TSV)")]
    Leads {
        #[arg(long, value_name = "FILE")]
        sumstats: PathBuf,

        /// Genome-wide significance threshold
        #[arg(long)]
        sig_level: Option<f64>,

        /// Distance within which significant variants are clumped, in kilobases
        #[arg(long, value_name = "KB")]
        window_kb: Option<u64>,

        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },

    /// Detect leads and fine-map a region around each of them
    #[command(about = "Fine-map every detected lead (outputs: one file set per lead)")]
    Batch {
        #[arg(long, value_name = "FILE")]
        sumstats: PathBuf,

        #[arg(long)]
        sig_level: Option<f64>,

        /// Clumping distance used for lead detection, in kilobases
        #[arg(long, value_name = "KB")]
        lead_window_kb: Option<u64>,

        #[command(flatten)]
        model: ModelArgs,

        /// Directory receiving leads.tsv and the per-lead results
        #[arg(long, value_name = "DIR")]
        out_dir: PathBuf,
    },
}

// ========================================================================================
//                                  SEARCH PROGRESS
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Renders L-search trials on a progress bar.
#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl SearchProgressObserver for BarProgress {
    fn on_search_start(&mut self, total_trials: usize) {
        self.bar = Some(create_progress_bar(total_trials as u64, "searching L"));
    }

    fn on_trial_finished(&mut self, trial: &Trial) {
        if let Some(bar) = &self.bar {
            bar.set_message(if trial.value.is_finite() {
                format!("L = {} (ELBO {:.2})", trial.param, trial.value)
            } else {
                format!("L = {} (not converged)", trial.param)
            });
            bar.inc(1);
        }
    }

    fn on_search_finish(&mut self, best: &Trial) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        eprintln!("> Best L = {}", best.param);
    }
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let start_time = Instant::now();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match FineMapConfig::load(path) {
            Ok(config) => {
                eprintln!("> Using configuration from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Error reading configuration '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => FineMapConfig::default(),
    };

    let result = match cli.command {
        Commands::Region {
            sumstats,
            lead_variant,
            chromosome,
            position,
            model,
            out_prefix,
        } => {
            model.apply(&mut config);
            let lead = match (lead_variant, chromosome, position) {
                (Some(id), chromosome, _) => LeadSpec::Variant { id, chromosome },
                (None, Some(chromosome), Some(position)) => LeadSpec::Position {
                    chromosome,
                    position,
                },
                _ => Cli::command()
                    .error(
                        ErrorKind::MissingRequiredArgument,
                        "either --lead-variant or --chromosome with --position is required",
                    )
                    .exit(),
            };
            region_command(&config, &sumstats, lead, &out_prefix).map(|()| true)
        }
        Commands::Leads {
            sumstats,
            sig_level,
            window_kb,
            out,
        } => {
            let options = lead_options(&config, sig_level, window_kb);
            leads_command(&sumstats, &options, &out).map(|()| true)
        }
        Commands::Batch {
            sumstats,
            sig_level,
            lead_window_kb,
            model,
            out_dir,
        } => {
            model.apply(&mut config);
            let options = lead_options(&config, sig_level, lead_window_kb);
            batch_command(&config, &sumstats, &options, &out_dir)
        }
    };

    match result {
        Ok(all_succeeded) => {
            eprintln!("> Finished in {:.2?}", start_time.elapsed());
            if !all_succeeded {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn lead_options(config: &FineMapConfig, sig_level: Option<f64>, window_kb: Option<u64>) -> LeadOptions {
    LeadOptions {
        sig_level: sig_level.unwrap_or(config.leads.sig_level),
        window_kb: window_kb.unwrap_or(config.leads.window_kb),
    }
}

fn load(path: &Path) -> Result<VariantSet, FineMapError> {
    eprintln!("> Loading summary statistics from {}", path.display());
    let sumstats = load_sumstats(path)?;
    eprintln!("> Loaded {} variants.", sumstats.len());
    Ok(sumstats)
}

fn build_mapper(config: &FineMapConfig) -> Result<FineMapper, FineMapError> {
    Ok(FineMapper::new(
        config.ld_provider()?,
        Box::new(config.engine()),
        config.panel(),
    )
    .with_sample_size(config.sample_size)
    .with_require_convergence(config.require_convergence))
}

fn report_written(report: &RegionReport, prefix: &Path) -> Result<(), FineMapError> {
    let outputs = write_region_outputs(prefix, report)?;
    eprintln!(
        "> {}: L = {}, ELBO {:.3}, converged = {}, {} credible set(s) over {} variants",
        report.region,
        report.result.l,
        report.result.elbo,
        report.result.converged,
        report.result.credible_sets.len(),
        report.result.variants.len()
    );
    eprintln!(
        "> Wrote {}, {} and {}",
        outputs.credible_sets.display(),
        outputs.pips.display(),
        outputs.summary.display()
    );
    Ok(())
}

fn region_command(
    config: &FineMapConfig,
    sumstats_path: &Path,
    lead: LeadSpec,
    out_prefix: &Path,
) -> Result<(), FineMapError> {
    let sumstats = load(sumstats_path)?;
    let mapper = build_mapper(config)?;
    let request = LocusRequest {
        lead,
        window_kb: config.region.window_kb,
        selection: config.selection(),
    };
    let report = mapper.finemap_region(&sumstats, &request, &mut BarProgress::default())?;
    report_written(&report, out_prefix)
}

fn leads_command(sumstats_path: &Path, options: &LeadOptions, out: &Path) -> Result<(), FineMapError> {
    let sumstats = load(sumstats_path)?;
    let leads = find_leads(&sumstats, options);
    write_leads(out, &leads)?;
    eprintln!("> Wrote {} lead variants to {}", leads.len(), out.display());
    Ok(())
}

/// Returns whether every lead was fine-mapped successfully.
fn batch_command(
    config: &FineMapConfig,
    sumstats_path: &Path,
    options: &LeadOptions,
    out_dir: &Path,
) -> Result<bool, FineMapError> {
    let sumstats = load(sumstats_path)?;
    let mapper = build_mapper(config)?;
    fs::create_dir_all(out_dir)?;

    let leads = find_leads(&sumstats, options);
    let leads_path = out_dir.join("leads.tsv");
    write_leads(&leads_path, &leads)?;
    eprintln!("> Found {} lead variants; list written to {}", leads.len(), leads_path.display());

    let outcomes = mapper.finemap_leads(
        &sumstats,
        &leads,
        config.region.window_kb,
        config.selection(),
        &mut BarProgress::default(),
    );

    let mut failures = 0usize;
    let mut stems = HashSet::new();
    for outcome in &outcomes {
        let written = outcome.outcome.as_ref().map_err(|e| e.to_string()).and_then(|report| {
            let prefix = out_dir.join(unique_file_stem(&outcome.lead.id, &mut stems));
            report_written(report, &prefix).map_err(|e| e.to_string())
        });
        if let Err(e) = written {
            failures += 1;
            eprintln!("> {} failed: {}", outcome.lead.id, e);
        }
    }
    eprintln!(
        "> Fine-mapped {} of {} regions.",
        outcomes.len() - failures,
        outcomes.len()
    );
    Ok(failures == 0)
}

/// File-name-safe form of a variant identifier.
fn file_stem_for(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Like [`file_stem_for`], with a numeric suffix when the stem was already handed out.
fn unique_file_stem(id: &str, used: &mut HashSet<String>) -> String {
    let base = file_stem_for(id);
    let mut stem = base.clone();
    let mut copy = 1usize;
    while !used.insert(stem.clone()) {
        copy += 1;
        stem = format!("{base}.{copy}");
    }
    stem
}
