use api::recording::RecordingState;

/// Client side countdown to the end of the recording budget
#[derive(Debug, Clone)]
pub struct Countdown {
    /// Warning thresholds in ms, most distant first
    thresholds: Vec<u64>,
    fired: Vec<bool>,
    version: Option<String>,
    started_at_ms: i64,
    budget_ms: u64,
    fresh: bool,
}

impl Countdown {
    pub fn new(mut thresholds_ms: Vec<u64>) -> Self {
        thresholds_ms.sort_unstable_by(|a, b| b.cmp(a));
        thresholds_ms.dedup();
        Self {
            fired: vec![false; thresholds_ms.len()],
            thresholds: thresholds_ms,
            version: None,
            started_at_ms: 0,
            budget_ms: 0,
            fresh: false,
        }
    }

    /// Take start time and budget from the server; a new version re-arms
    /// every threshold
    pub fn sync(&mut self, state: &RecordingState) {
        match (state.is_recording, &state.version, state.started_at) {
            (true, Some(version), Some(started_at)) => {
                if self.version.as_deref() != Some(version.as_str()) {
                    self.version = Some(version.clone());
                    self.fired.iter_mut().for_each(|f| *f = false);
                    self.fresh = true;
                }
                self.started_at_ms = started_at;
                self.budget_ms = state.budget_ms;
            }
            _ => {
                self.version = None;
                self.fresh = false;
            }
        }
    }

    pub fn remaining_ms(&self, now_ms: i64) -> Option<u64> {
        self.version.as_ref()?;
        let elapsed = (now_ms - self.started_at_ms).max(0) as u64;
        Some(self.budget_ms.saturating_sub(elapsed))
    }

    /// The threshold to warn about now, if any. Each fires once per
    /// recording; when several passed at once (first look after a reload)
    /// only the most urgent is reported.
    pub fn check(&mut self, now_ms: i64) -> Option<u64> {
        let remaining = self.remaining_ms(now_ms)?;
        let mut warn = None;
        for (threshold, fired) in self.thresholds.iter().zip(self.fired.iter_mut()) {
            if remaining <= *threshold && !*fired {
                *fired = true;
                warn = Some(*threshold);
            }
        }
        self.fresh = false;
        warn
    }

    /// Nothing checked yet since the recording was picked up
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}
