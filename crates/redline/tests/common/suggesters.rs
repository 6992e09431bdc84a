//! Scripted suggestion services.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use redline::ai::{AnalysisError, AnalysisResponse};
use redline::{RuleSuggester, SuggestionCategory, SuggestionService, TextUnit};

/// Delegates to the rule suggester but stalls on any unit containing
/// `marker`.
pub struct SlowWhen {
    pub marker: &'static str,
    pub delay: Duration,
    inner: RuleSuggester,
}

impl SlowWhen {
    pub fn new(marker: &'static str, delay: Duration) -> Self {
        Self {
            marker,
            delay,
            inner: RuleSuggester::new(),
        }
    }
}

impl SuggestionService for SlowWhen {
    fn analyze(
        &self,
        units: &[TextUnit],
        categories: &[SuggestionCategory],
    ) -> Result<AnalysisResponse, AnalysisError> {
        if units.iter().any(|u| u.text.contains(self.marker)) {
            thread::sleep(self.delay);
        }
        self.inner.analyze(units, categories)
    }
}

/// Records how many analysis calls were ever in flight at once.
pub struct ConcurrencyMeter {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    hold: Duration,
}

impl ConcurrencyMeter {
    pub fn new(hold: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            hold,
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SuggestionService for ConcurrencyMeter {
    fn analyze(
        &self,
        _units: &[TextUnit],
        _categories: &[SuggestionCategory],
    ) -> Result<AnalysisResponse, AnalysisError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.hold);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(AnalysisResponse::default())
    }
}
