//! Writers for fine-mapping results and detected leads.
//!
//! Tables are tab-separated with a header line, which is written even when there are no rows.

use crate::leads::p_value;
use crate::pipeline::RegionReport;
use crate::search::Trial;
use crate::types::{FineMapResult, Variant};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CREDIBLE_SET_HEADER: [&str; 2] = ["Credible_Set_ID", "SNPs"];
pub const PIP_HEADER: [&str; 8] = ["SNP", "CHR", "BP", "A1", "A2", "Z", "PIP", "CS"];
pub const LEAD_HEADER: [&str; 5] = ["SNP", "CHR", "BP", "P", "Z"];

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize run summary: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Writes `header` followed by one serialized record per row.
fn write_table<T, I>(path: &Path, header: &[&str], rows: I) -> Result<(), OutputError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let display = path.display().to_string();
    let csv_err = |source: csv::Error| OutputError::Csv {
        path: display.clone(),
        source,
    };
    let mut writer = csv::WriterBuilder::default()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)
        .map_err(csv_err)?;
    writer.write_record(header).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| OutputError::Io {
        path: display.clone(),
        source,
    })
}

/// `Credible_Set_ID\tSNPs`, with the identifiers of each set comma-joined.
pub fn write_credible_sets(path: &Path, result: &FineMapResult) -> Result<(), OutputError> {
    let rows = result
        .credible_sets
        .iter()
        .map(|cs| (cs.number, cs.variant_ids.join(",")));
    write_table(path, &CREDIBLE_SET_HEADER, rows)
}

/// One row per fine-mapped variant in LD order; `CS` is `.` outside every credible set.
pub fn write_pips(path: &Path, result: &FineMapResult) -> Result<(), OutputError> {
    let rows = result.variants.iter().map(|v| {
        let cs = result
            .credible_set_of(&v.id)
            .map_or_else(|| ".".to_string(), |n| n.to_string());
        (
            v.id.as_str(),
            v.chromosome.to_string(),
            v.position,
            v.effect_allele.as_str(),
            v.other_allele.as_str(),
            v.z,
            v.pip.or_else(|| result.pip(&v.id)).unwrap_or(0.0),
            cs,
        )
    });
    write_table(path, &PIP_HEADER, rows)
}

/// `SNP CHR BP P Z` for each lead.
pub fn write_leads(path: &Path, leads: &[Variant]) -> Result<(), OutputError> {
    let rows = leads.iter().map(|v| {
        (
            v.id.as_str(),
            v.chromosome.to_string(),
            v.position,
            p_value(v),
            v.z,
        )
    });
    write_table(path, &LEAD_HEADER, rows)
}

/// Machine-readable summary of one region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub region: String,
    pub lead: Option<String>,
    pub selected_l: usize,
    pub elbo: f64,
    pub converged: bool,
    pub variants_in_window: usize,
    pub variants_with_ld: usize,
    pub sample_size: u64,
    pub credible_sets: usize,
    pub trials: Vec<TrialSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrialSummary {
    pub l: usize,
    /// Absent when the trial did not converge.
    pub objective: Option<f64>,
}

impl From<&Trial> for TrialSummary {
    fn from(trial: &Trial) -> Self {
        Self {
            l: trial.param,
            objective: trial.value.is_finite().then_some(trial.value),
        }
    }
}

impl From<&RegionReport> for RunSummary {
    fn from(report: &RegionReport) -> Self {
        Self {
            region: report.region.to_string(),
            lead: report.lead_id.clone(),
            selected_l: report.result.l,
            elbo: report.result.elbo,
            converged: report.result.converged,
            variants_in_window: report.requested_variants,
            variants_with_ld: report.result.variants.len(),
            sample_size: report.sample_size,
            credible_sets: report.result.credible_sets.len(),
            trials: report.trials.iter().map(TrialSummary::from).collect(),
        }
    }
}

pub fn write_summary(path: &Path, report: &RegionReport) -> Result<(), OutputError> {
    let summary = RunSummary::from(report);
    let toml_string = toml::to_string_pretty(&summary)?;
    let io_err = |source: std::io::Error| OutputError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = BufWriter::new(fs::File::create(path).map_err(io_err)?);
    file.write_all(toml_string.as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)
}

/// Paths of the files written for one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOutputs {
    pub credible_sets: PathBuf,
    pub pips: PathBuf,
    pub summary: PathBuf,
}

impl RegionOutputs {
    /// `<prefix>.cs.tsv`, `<prefix>.pip.tsv` and `<prefix>.summary.toml`.
    pub fn for_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            credible_sets: with_suffix(".cs.tsv"),
            pips: with_suffix(".pip.tsv"),
            summary: with_suffix(".summary.toml"),
        }
    }
}

pub fn write_region_outputs(prefix: &Path, report: &RegionReport) -> Result<RegionOutputs, OutputError> {
    let outputs = RegionOutputs::for_prefix(prefix);
    if let Some(parent) = prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| OutputError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    write_credible_sets(&outputs.credible_sets, &report.result)?;
    write_pips(&outputs.pips, &report.result)?;
    write_summary(&outputs.summary, report)?;
    Ok(outputs)
}
