//! Choice of the number of causal effects `L`.
//!
//! A fixed `L` runs the engine once and hands back whatever it produced. In search mode every
//! trial's objective is the engine's final ELBO when the fit converged and negative infinity
//! otherwise, so a non-converged fit can only win when nothing converged at all.

use crate::engine::{EngineError, FineMappingEngine};
use crate::progress::SearchProgressObserver;
use crate::search::{IntegerSpace, SearchSpaceError, Trial, search};
use crate::types::{LdMatrix, ModelFit};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const DEFAULT_L_MIN: usize = 1;
pub const DEFAULT_L_MAX: usize = 20;
pub const DEFAULT_TRIALS: usize = 10;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Invalid L search range: {0}")]
    InvalidRange(#[from] SearchSpaceError),
    #[error("A fixed L must be at least 1.")]
    ZeroL,
}

/// Bounds and budget of the L search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub l_min: usize,
    pub l_max: usize,
    pub trials: usize,
    /// Evaluate the initial grid of trials concurrently.
    pub parallel: bool,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            l_min: DEFAULT_L_MIN,
            l_max: DEFAULT_L_MAX,
            trials: DEFAULT_TRIALS,
            parallel: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LSelection {
    Fixed(usize),
    Search(SearchSettings),
}

impl LSelection {
    /// Interprets a user-supplied L: anything `<= 0` means "search".
    pub fn from_requested(l: i64, settings: SearchSettings) -> Self {
        if l <= 0 {
            Self::Search(settings)
        } else {
            Self::Fixed(usize::try_from(l).unwrap_or(usize::MAX))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectedModel {
    pub fit: ModelFit,
    /// Every evaluated L with its objective, in evaluation order.
    pub trials: Vec<Trial>,
}

/// Search objective for a fit.
pub fn objective(fit: &ModelFit) -> f64 {
    if fit.converged && !fit.elbo.is_nan() {
        fit.elbo
    } else {
        f64::NEG_INFINITY
    }
}

pub fn select_model(
    engine: &dyn FineMappingEngine,
    z: ArrayView1<f64>,
    ld: &LdMatrix,
    n: u64,
    selection: &LSelection,
    observer: &mut dyn SearchProgressObserver,
) -> Result<SelectedModel, SelectionError> {
    match *selection {
        LSelection::Fixed(0) => Err(SelectionError::ZeroL),
        LSelection::Fixed(l) => {
            let fit = engine.fit(z, ld, n, l)?;
            if !fit.converged {
                log::warn!("Fit with fixed L = {l} did not converge");
            }
            let trial = Trial {
                param: l,
                value: objective(&fit),
            };
            Ok(SelectedModel {
                fit,
                trials: vec![trial],
            })
        }
        LSelection::Search(settings) => search_l(engine, z, ld, n, &settings, observer),
    }
}

fn search_l(
    engine: &dyn FineMappingEngine,
    z: ArrayView1<f64>,
    ld: &LdMatrix,
    n: u64,
    settings: &SearchSettings,
    observer: &mut dyn SearchProgressObserver,
) -> Result<SelectedModel, SelectionError> {
    let configured = IntegerSpace::new(settings.l_min.max(1), settings.l_max)?;
    // More effects than variants cannot be identified.
    let l_max = configured.high().min(ld.dim());
    if configured.low() > l_max {
        log::warn!(
            "l_min = {} exceeds the {} variants with LD; searching L = {} only",
            configured.low(),
            ld.dim(),
            l_max
        );
    }
    let space = IntegerSpace::new(configured.low().min(l_max), l_max)?;
    log::info!(
        "Searching L in [{}, {}] with {} trials over {} variants",
        space.low(),
        space.high(),
        settings.trials,
        ld.dim()
    );

    let fits: Mutex<HashMap<usize, ModelFit>> = Mutex::new(HashMap::new());
    let outcome = search(
        |l| -> Result<f64, SelectionError> {
            let fit = engine.fit(z, ld, n, l)?;
            let value = objective(&fit);
            if fit.converged {
                log::debug!("L = {l}: converged, ELBO {:.4}", fit.elbo);
            } else {
                log::debug!("L = {l}: did not converge");
            }
            fits.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(l, fit);
            Ok(value)
        },
        space,
        settings.trials,
        settings.parallel,
        observer,
    )?;

    let best = outcome.best;
    let cached = fits
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&best.param);
    let fit = match cached {
        Some(fit) => fit,
        None => engine.fit(z, ld, n, best.param)?,
    };

    if fit.converged {
        log::info!("Selected L = {} with ELBO {:.4}", best.param, fit.elbo);
    } else {
        log::warn!(
            "None of the {} trials converged; returning the non-converged fit at L = {}",
            outcome.trials.len(),
            best.param
        );
    }
    Ok(SelectedModel {
        fit,
        trials: outcome.trials,
    })
}
