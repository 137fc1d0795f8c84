use crate::search::Trial;

/// Observer for reporting incremental progress while searching over L.
///
/// Callbacks are always made from the thread driving the search, even when trials are
/// evaluated in parallel.
pub trait SearchProgressObserver {
    fn on_search_start(&mut self, total_trials: usize) {
        let _ = total_trials;
    }
    fn on_trial_finished(&mut self, trial: &Trial) {
        let _ = trial;
    }
    fn on_search_finish(&mut self, best: &Trial) {
        let _ = best;
    }
}

#[derive(Default)]
pub struct NoopSearchProgress;

impl SearchProgressObserver for NoopSearchProgress {}

/// Observer that records every callback, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingProgress {
    pub total: Option<usize>,
    pub finished: Vec<Trial>,
    pub best: Option<Trial>,
}

#[cfg(test)]
impl SearchProgressObserver for RecordingProgress {
    fn on_search_start(&mut self, total_trials: usize) {
        self.total = Some(total_trials);
    }
    fn on_trial_finished(&mut self, trial: &Trial) {
        self.finished.push(*trial);
    }
    fn on_search_finish(&mut self, best: &Trial) {
        self.best = Some(*best);
    }
}
