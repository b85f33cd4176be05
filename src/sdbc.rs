//! Bookkeeping for strong Dirichlet conditions across time steps and coupled applications.
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Decides when a strong Dirichlet fill must be reassembled with the post-BC solution.
///
/// A reassembly pass is required at the start of every time step: whenever the time differs
/// from the time of the previous fill of the same application, or when a different application
/// filled last. Coupled applications share a single tracker through [`SharedSdbcTracker`].
#[derive(Debug, Clone, Default)]
pub struct SdbcTracker {
    previous_times: FxHashMap<usize, f64>,
    previous_app: Option<usize>,
}

/// A tracker shared by the applications of a coupled problem.
pub type SharedSdbcTracker = Arc<Mutex<SdbcTracker>>;

impl SdbcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSdbcTracker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Whether a fill of application `app` at `time` begins a new time step.
    pub fn begins_time_step(&self, app: usize, time: f64) -> bool {
        let time_changed = self
            .previous_times
            .get(&app)
            .map(|&previous| previous != time)
            .unwrap_or(true);
        let app_changed = self.previous_app != Some(app);
        debug!(
            "SDBC fill of application {} at t = {}: time changed = {}, application changed = {}",
            app, time, time_changed, app_changed
        );
        time_changed || app_changed
    }

    /// Records a completed fill. Called at the end of every fill, whether it reassembled or not.
    pub fn record(&mut self, app: usize, time: f64) {
        self.previous_times.insert(app, time);
        self.previous_app = Some(app);
    }

    pub fn previous_time(&self, app: usize) -> Option<f64> {
        self.previous_times.get(&app).copied()
    }

    pub fn previous_app(&self) -> Option<usize> {
        self.previous_app
    }
}
