//! # Fine-Mapping Engines
//!
//! A [`FineMappingEngine`] fits the sum-of-single-effects regression for one value of `L`.
//! All inputs travel through [`FineMappingEngine::fit`]; an engine keeps no state between
//! calls, so independent fits may run concurrently.
//!
//! Credible-set indices in the returned [`ModelFit`] are 1-based positions in the variant
//! order of `z`. They are only converted by the translation step.

use crate::shared::process::{ToolError, ToolInvocation};
use crate::types::{LdMatrix, ModelFit};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COVERAGE: f64 = 0.95;
pub const DEFAULT_MIN_ABS_CORR: f64 = 0.5;
pub const DEFAULT_MAX_ITER: usize = 100;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Fine-mapping engine failed: {0}")]
    ExternalTool(#[from] ToolError),
    #[error("Fine-mapping engine produced malformed output in '{path}': {message}")]
    MalformedOutput { path: String, message: String },
    #[error("Invalid fine-mapping input: {0}")]
    InvalidInput(String),
    #[error("IO error while preparing fine-mapping input: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fits the fine-mapping model for a single number of causal effects `l`.
pub trait FineMappingEngine: Sync {
    fn fit(
        &self,
        z: ArrayView1<f64>,
        ld: &LdMatrix,
        n: u64,
        l: usize,
    ) -> Result<ModelFit, EngineError>;
}

/// Shared precondition check for engine implementations.
pub fn check_inputs(z: ArrayView1<f64>, ld: &LdMatrix, n: u64, l: usize) -> Result<(), EngineError> {
    if z.len() != ld.dim() {
        return Err(EngineError::InvalidInput(format!(
            "{} z-scores supplied for an LD matrix of dimension {}",
            z.len(),
            ld.dim()
        )));
    }
    if z.is_empty() {
        return Err(EngineError::InvalidInput("no variants to fine-map".into()));
    }
    if let Some(i) = z.iter().position(|v| !v.is_finite()) {
        return Err(EngineError::InvalidInput(format!(
            "z-score of variant {} ({}) is not finite",
            ld.ids()[i],
            z[i]
        )));
    }
    if n == 0 {
        return Err(EngineError::InvalidInput("sample size must be positive".into()));
    }
    if l == 0 {
        return Err(EngineError::InvalidInput("L must be at least 1".into()));
    }
    Ok(())
}

/// Parameters of a susieR fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SusieSettings {
    pub rscript: PathBuf,
    /// Posterior coverage of each credible set.
    pub coverage: f64,
    /// Credible sets whose minimum absolute pairwise correlation falls below this are dropped.
    pub min_abs_corr: f64,
    pub max_iter: usize,
    /// Random seed set before every fit.
    pub seed: u64,
    pub timeout_secs: Option<u64>,
}

impl Default for SusieSettings {
    fn default() -> Self {
        Self {
            rscript: PathBuf::from("Rscript"),
            coverage: DEFAULT_COVERAGE,
            min_abs_corr: DEFAULT_MIN_ABS_CORR,
            max_iter: DEFAULT_MAX_ITER,
            seed: DEFAULT_SEED,
            timeout_secs: None,
        }
    }
}

const SUSIE_RSS_SCRIPT: &str = r#"
args <- commandArgs(trailingOnly = TRUE)
suppressPackageStartupMessages({
  library(susieR)
  library(jsonlite)
})
z <- scan(args[1], quiet = TRUE)
R <- as.matrix(read.table(args[2], header = FALSE, colClasses = "numeric"))
n <- as.numeric(args[3])
L <- as.integer(args[4])
coverage <- as.numeric(args[5])
min_abs_corr <- as.numeric(args[6])
max_iter <- as.integer(args[7])
set.seed(as.integer(args[8]))

fit <- susie_rss(z = z, R = R, n = n, L = L, max_iter = max_iter)
cs <- susie_get_cs(fit, coverage = coverage, min_abs_corr = min_abs_corr, Xcorr = R)
sets <- if (is.null(cs$cs)) list() else unname(lapply(cs$cs, function(s) I(as.integer(s))))

elbo <- NULL
if (length(fit$elbo) > 0) {
  last <- fit$elbo[length(fit$elbo)]
  if (is.finite(last)) elbo <- last
}

out <- list(
  elbo = elbo,
  converged = isTRUE(fit$converged),
  pip = I(as.numeric(susie_get_pip(fit))),
  sets = sets,
  iterations = as.integer(fit$niter)
)
writeLines(toJSON(out, auto_unbox = TRUE, digits = NA, null = "null"), args[9])
"#;

/// Document written by the embedded R script.
#[derive(Debug, Deserialize)]
struct SusieOutput {
    #[serde(default)]
    elbo: Option<f64>,
    converged: bool,
    pip: Vec<f64>,
    #[serde(default)]
    sets: Vec<Vec<usize>>,
    #[serde(default)]
    iterations: Option<usize>,
}

/// Runs `susieR::susie_rss` through `Rscript`, one process per fit.
#[derive(Debug, Clone, Default)]
pub struct SusieRssEngine {
    settings: SusieSettings,
}

impl SusieRssEngine {
    pub fn new(settings: SusieSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SusieSettings {
        &self.settings
    }

    fn write_inputs(dir: &Path, z: ArrayView1<f64>, ld: &LdMatrix) -> Result<(), EngineError> {
        let mut z_out = BufWriter::new(fs::File::create(dir.join("z.txt"))?);
        for value in z.iter() {
            writeln!(z_out, "{value}")?;
        }
        z_out.flush()?;

        let mut r_out = BufWriter::new(fs::File::create(dir.join("R.txt"))?);
        for row in ld.view().rows() {
            let mut first = true;
            for value in row.iter() {
                if !first {
                    r_out.write_all(b"\t")?;
                }
                write!(r_out, "{value}")?;
                first = false;
            }
            r_out.write_all(b"\n")?;
        }
        r_out.flush()?;
        Ok(())
    }
}

impl FineMappingEngine for SusieRssEngine {
    fn fit(
        &self,
        z: ArrayView1<f64>,
        ld: &LdMatrix,
        n: u64,
        l: usize,
    ) -> Result<ModelFit, EngineError> {
        check_inputs(z, ld, n, l)?;

        let scratch = tempfile::Builder::new().prefix("finemap-susie-").tempdir()?;
        let dir = scratch.path();
        Self::write_inputs(dir, z, ld)?;
        let script = dir.join("susie_rss.R");
        fs::write(&script, SUSIE_RSS_SCRIPT)?;
        let output_path = dir.join("fit.json");

        let s = &self.settings;
        let run = ToolInvocation::new(&s.rscript, dir)
            .path_arg(&script)
            .path_arg(&dir.join("z.txt"))
            .path_arg(&dir.join("R.txt"))
            .arg(n.to_string())
            .arg(l.to_string())
            .arg(s.coverage.to_string())
            .arg(s.min_abs_corr.to_string())
            .arg(s.max_iter.to_string())
            .arg(s.seed.to_string())
            .path_arg(&output_path)
            .timeout(s.timeout_secs.map(Duration::from_secs))
            .run()?;
        log::debug!("susie_rss with L = {l} finished in {:.2?}", run.elapsed);

        let text = fs::read_to_string(&output_path).map_err(|e| EngineError::MalformedOutput {
            path: output_path.display().to_string(),
            message: format!("fit result was not written: {e}"),
        })?;
        parse_fit(&text, l, &output_path.display().to_string())
    }
}

/// Decodes the engine's JSON document. A missing ELBO becomes negative infinity.
fn parse_fit(text: &str, l: usize, source: &str) -> Result<ModelFit, EngineError> {
    let raw: SusieOutput = serde_json::from_str(text).map_err(|e| EngineError::MalformedOutput {
        path: source.to_string(),
        message: e.to_string(),
    })?;
    Ok(ModelFit {
        l,
        elbo: raw.elbo.unwrap_or(f64::NEG_INFINITY),
        converged: raw.converged,
        credible_sets: raw.sets,
        pips: raw.pip,
        iterations: raw.iterations,
    })
}
