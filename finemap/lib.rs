#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

//! Fine-mapping of GWAS loci: region selection, LD retrieval, choice of the number of
//! causal effects and translation of the model output back to variant identifiers.

#[path = "../shared/files.rs"]
pub mod files;

#[path = "../shared/process.rs"]
pub mod process;

pub mod shared {
    pub use super::files;
    pub use super::process;
}

pub mod config;
pub mod engine;
pub mod ld;
pub mod leads;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod region;
pub mod search;
pub mod select;
pub mod sumstats;
pub mod translate;
pub mod types;
