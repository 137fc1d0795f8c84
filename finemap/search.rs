//! # Bounded Integer Search
//!
//! Maximizes an objective over an inclusive integer interval with a fixed trial budget. The
//! objective is treated as a black box; every evaluation is assumed to be expensive, so no
//! parameter is ever evaluated twice.
//!
//! When the interval fits inside the budget it is searched exhaustively. Otherwise an evenly
//! spaced coarse grid (both bounds included) spends half of the budget, and the remainder is
//! spent one point at a time on the unevaluated integer closest to the best value so far.
//!
//! The result depends only on the objective values, never on evaluation order: `NaN` counts
//! as negative infinity and ties go to the smaller parameter.

use crate::progress::SearchProgressObserver;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchSpaceError {
    #[error("Search interval [{low}, {high}] is empty.")]
    Empty { low: usize, high: usize },
}

/// Inclusive integer interval `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerSpace {
    low: usize,
    high: usize,
}

impl IntegerSpace {
    pub fn new(low: usize, high: usize) -> Result<Self, SearchSpaceError> {
        if low > high {
            return Err(SearchSpaceError::Empty { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn size(&self) -> usize {
        self.high - self.low + 1
    }

    pub fn contains(&self, value: usize) -> bool {
        (self.low..=self.high).contains(&value)
    }
}

/// One evaluated parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trial {
    pub param: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub best: Trial,
    /// Every trial, in the order it was reported.
    pub trials: Vec<Trial>,
}

#[inline]
fn score(value: f64) -> f64 {
    if value.is_nan() { f64::NEG_INFINITY } else { value }
}

/// `Ordering::Greater` when `a` beats `b`.
fn compare(a: &Trial, b: &Trial) -> Ordering {
    score(a.value)
        .total_cmp(&score(b.value))
        .then_with(|| b.param.cmp(&a.param))
}

fn best_of(trials: &[Trial]) -> Option<Trial> {
    trials.iter().copied().max_by(compare)
}

/// Evenly spaced points of `space`, both bounds included, at most `count` of them.
fn coarse_grid(space: IntegerSpace, count: usize) -> Vec<usize> {
    let count = count.clamp(1, space.size());
    if count == 1 {
        return vec![space.low];
    }
    let span = space.high - space.low;
    let steps = count - 1;
    let mut grid: Vec<usize> = (0..count)
        .map(|i| space.low + (i * span + steps / 2) / steps)
        .collect();
    grid.dedup();
    grid
}

/// The unevaluated parameter nearest `center`; on equal distance the smaller one.
fn nearest_unevaluated(
    space: IntegerSpace,
    center: usize,
    evaluated: &BTreeSet<usize>,
) -> Option<usize> {
    for distance in 1..space.size() {
        if let Some(below) = center.checked_sub(distance) {
            if space.contains(below) && !evaluated.contains(&below) {
                return Some(below);
            }
        }
        let above = center + distance;
        if space.contains(above) && !evaluated.contains(&above) {
            return Some(above);
        }
    }
    None
}

/// Maximizes `objective` over `space` using at most `budget` evaluations.
///
/// With `parallel`, the initial grid is evaluated on the rayon pool. The first error in grid
/// order aborts the search.
pub fn search<F, E>(
    objective: F,
    space: IntegerSpace,
    budget: usize,
    parallel: bool,
    observer: &mut dyn SearchProgressObserver,
) -> Result<SearchOutcome, E>
where
    F: Fn(usize) -> Result<f64, E> + Sync,
    E: Send,
{
    let budget = budget.max(1);
    let total = budget.min(space.size());
    observer.on_search_start(total);

    let initial = if space.size() <= budget {
        (space.low..=space.high).collect()
    } else {
        coarse_grid(space, (budget / 2).max(2).min(total))
    };

    let mut trials: Vec<Trial> = Vec::with_capacity(total);
    let mut evaluated: BTreeSet<usize> = BTreeSet::new();

    if parallel {
        let results: Vec<(usize, Result<f64, E>)> = initial
            .par_iter()
            .map(|&param| (param, objective(param)))
            .collect();
        for (param, result) in results {
            let trial = Trial {
                param,
                value: result?,
            };
            evaluated.insert(param);
            observer.on_trial_finished(&trial);
            trials.push(trial);
        }
    } else {
        for param in initial {
            let trial = Trial {
                param,
                value: objective(param)?,
            };
            evaluated.insert(param);
            observer.on_trial_finished(&trial);
            trials.push(trial);
        }
    }

    while trials.len() < total {
        let Some(current) = best_of(&trials) else {
            break;
        };
        let Some(param) = nearest_unevaluated(space, current.param, &evaluated) else {
            break;
        };
        let trial = Trial {
            param,
            value: objective(param)?,
        };
        evaluated.insert(param);
        observer.on_trial_finished(&trial);
        trials.push(trial);
    }

    // `initial` is never empty, so neither is `trials`.
    let best = best_of(&trials).unwrap_or(Trial {
        param: space.low,
        value: f64::NEG_INFINITY,
    });
    observer.on_search_finish(&best);
    Ok(SearchOutcome { best, trials })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NoopSearchProgress, RecordingProgress};
    use std::convert::Infallible;
    use std::sync::Mutex;

    fn run<F>(objective: F, low: usize, high: usize, budget: usize, parallel: bool) -> SearchOutcome
    where
        F: Fn(usize) -> f64 + Sync,
    {
        search::<_, Infallible>(
            |p| Ok(objective(p)),
            IntegerSpace::new(low, high).unwrap(),
            budget,
            parallel,
            &mut NoopSearchProgress,
        )
        .unwrap()
    }

    #[test]
    fn decreasing_objective_selects_lower_bound() {
        let outcome = run(|l| -(l as f64), 1, 20, 10, false);
        assert_eq!(outcome.best.param, 1);
        assert_eq!(outcome.best.value, -1.0);
        assert_eq!(outcome.trials.len(), 10);
    }

    #[test]
    fn finds_interior_peak() {
        let outcome = run(|l| -((l as f64) - 7.0).powi(2), 1, 20, 10, false);
        assert_eq!(outcome.best.param, 7);
    }

    #[test]
    fn small_spaces_are_searched_exhaustively() {
        let outcome = run(|l| l as f64, 1, 4, 10, false);
        let params: Vec<usize> = outcome.trials.iter().map(|t| t.param).collect();
        assert_eq!(params, vec![1, 2, 3, 4]);
        assert_eq!(outcome.best.param, 4);
    }

    #[test]
    fn parameters_are_never_evaluated_twice() {
        let seen = Mutex::new(Vec::new());
        run(
            |l| {
                seen.lock().unwrap().push(l);
                0.0
            },
            1,
            20,
            10,
            false,
        );
        let mut calls = seen.into_inner().unwrap();
        assert_eq!(calls.len(), 10);
        calls.sort();
        calls.dedup();
        assert_eq!(calls.len(), 10);
    }

    #[test]
    fn all_negative_infinity_prefers_smallest_parameter() {
        let outcome = run(|_| f64::NEG_INFINITY, 1, 20, 10, false);
        assert_eq!(outcome.best.param, 1);
        let nan = run(|_| f64::NAN, 3, 8, 10, false);
        assert_eq!(nan.best.param, 3);
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let objective = |l: usize| ((l * 37) % 11) as f64;
        let sequential = run(objective, 1, 20, 10, false);
        let parallel = run(objective, 1, 20, 10, true);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn errors_abort_the_search() {
        let result = search(
            |l| if l == 11 { Err("engine exploded") } else { Ok(0.0) },
            IntegerSpace::new(1, 20).unwrap(),
            10,
            false,
            &mut NoopSearchProgress,
        );
        assert_eq!(result.unwrap_err(), "engine exploded");
    }

    #[test]
    fn observer_sees_every_trial() {
        let mut progress = RecordingProgress::default();
        let outcome = search::<_, Infallible>(
            |l| Ok(-(l as f64)),
            IntegerSpace::new(1, 20).unwrap(),
            6,
            false,
            &mut progress,
        )
        .unwrap();
        assert_eq!(progress.total, Some(6));
        assert_eq!(progress.finished, outcome.trials);
        assert_eq!(progress.best, Some(outcome.best));
    }

    #[test]
    fn tiny_budgets_are_never_exceeded() {
        for budget in [0, 1, 2] {
            let mut progress = RecordingProgress::default();
            let outcome = search::<_, Infallible>(
                |l| Ok(-(l as f64)),
                IntegerSpace::new(1, 20).unwrap(),
                budget,
                false,
                &mut progress,
            )
            .unwrap();
            assert!(outcome.trials.len() <= budget.max(1));
            assert_eq!(progress.total, Some(outcome.trials.len()));
            assert_eq!(outcome.best.param, 1);
        }
    }

    #[test]
    fn grid_includes_both_bounds() {
        let space = IntegerSpace::new(1, 20).unwrap();
        assert_eq!(coarse_grid(space, 5), vec![1, 6, 11, 15, 20]);
        assert_eq!(coarse_grid(space, 1), vec![1]);
        assert!(IntegerSpace::new(5, 4).is_err());
    }
}
