//! Per-epoch progress tracking: abort, duration estimate and inspection.
//!
//! The tracker is triggered once after every epoch. It polls an
//! [`AbortSignal`], produces a one-shot estimate of the total run time and
//! periodically evaluates the inspection metric on test data. Everything
//! it reports goes through a [`ProgressObserver`].
//!
//! ```text
//! Uninitialized ──trigger──▶ Running ──abort──▶ Aborted
//!                               │
//!                               └──epoch == total──▶ Exhausted
//! ```

use crate::config::OptimizationConfig;
use crate::core::ParameterStore;
use crate::eval::Metric;
use chrono::{DateTime, Local};
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of user abort requests, polled once per epoch.
pub trait AbortSignal {
    /// Return a pending key press, if any. `'q'` aborts the run.
    fn poll(&mut self) -> Option<char>;
}

/// Signal that never aborts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAbort;

impl AbortSignal for NoAbort {
    fn poll(&mut self) -> Option<char> {
        None
    }
}

/// Shared flag that aborts a run once cancelled, e.g. from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl AbortSignal for CancellationToken {
    fn poll(&mut self) -> Option<char> {
        self.is_cancelled().then_some('q')
    }
}

/// Receiver of progress notifications.
///
/// All methods default to doing nothing.
pub trait ProgressObserver {
    fn on_start(&mut self, _total_updates: usize) {}
    fn on_estimate_started(&mut self) {}
    fn on_estimate(&mut self, _seconds: f64, _finish: DateTime<Local>) {}
    fn on_inspection(&mut self, _progress: f32, _metric: Metric, _value: f32) {}
    fn on_final(&mut self, _metric: Metric, _value: f32) {}
    fn on_abort(&mut self, _epoch: usize) {}
    fn on_warning(&mut self, _message: &str) {}
}

/// Observer writing every notification to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_start(&mut self, total_updates: usize) {
        log::info!("press 'q' to abort the optimization ({total_updates} updates)");
    }

    fn on_estimate_started(&mut self) {
        log::info!("estimating time");
    }

    fn on_estimate(&mut self, seconds: f64, finish: DateTime<Local>) {
        log::info!(
            "estimated duration: {:.1}s (until {})",
            seconds,
            finish.format("%Y-%m-%d %H:%M:%S")
        );
    }

    fn on_inspection(&mut self, progress: f32, metric: Metric, value: f32) {
        log::info!("finished {progress:.1}%: {metric} = {value:.4}");
    }

    fn on_final(&mut self, metric: Metric, value: f32) {
        log::info!("final {metric} = {value:.4}");
    }

    fn on_abort(&mut self, epoch: usize) {
        log::info!("aborting optimization after {epoch} updates");
    }

    fn on_warning(&mut self, message: &str) {
        log::warn!("{message}");
    }
}

/// Result of one [`ProgressTracker::trigger`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Keep training
    Continue,
    /// Stop training, the update count was truncated
    Abort,
    /// The configured number of updates is reached
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Uninitialized,
    Running,
    Aborted,
    Exhausted,
}

/// Settings read from the optimization config.
#[derive(Debug, Clone)]
struct TrackerSettings {
    total_updates: usize,
    planned_updates: usize,
    inspect: bool,
    metric: Metric,
    inspect_interval: f64,
    estimate_time: bool,
    estimate_wait: f64,
}

#[derive(Debug, Clone)]
struct TrackerState {
    epoch: usize,
    start: Instant,
    last_inspection: Instant,
    estimate_started: bool,
    estimate_ended: bool,
}

/// Progress tracker of one optimization run.
pub struct ProgressTracker<'a> {
    settings: TrackerSettings,
    test_data: Option<Array2<f32>>,
    abort: &'a mut dyn AbortSignal,
    observer: &'a mut dyn ProgressObserver,
    state: Option<TrackerState>,
    phase: TrackerPhase,
    /// `(progress in percent, metric value)` per inspection
    log: Vec<(f32, f32)>,
}

impl<'a> ProgressTracker<'a> {
    /// Tracker over `updates × iterations` epochs.
    pub fn new(
        config: &OptimizationConfig,
        abort: &'a mut dyn AbortSignal,
        observer: &'a mut dyn ProgressObserver,
    ) -> Self {
        let total = config.updates.saturating_mul(config.iterations);
        Self {
            settings: TrackerSettings {
                total_updates: total,
                planned_updates: total,
                inspect: config.inspect,
                metric: config.inspect_function,
                inspect_interval: config.inspect_interval,
                estimate_time: config.estimate_time,
                estimate_wait: config.estimate_wait,
            },
            test_data: None,
            abort,
            observer,
            state: None,
            phase: TrackerPhase::Uninitialized,
            log: Vec::new(),
        }
    }

    /// Data used to evaluate the inspection metric.
    pub fn with_test_data(mut self, data: Array2<f32>) -> Self {
        self.test_data = Some(data);
        self
    }

    /// Epochs counted so far.
    pub fn epoch(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.epoch)
    }

    /// Current total of updates; truncated to the abort epoch on abort.
    pub fn total_updates(&self) -> usize {
        self.settings.total_updates
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn is_aborted(&self) -> bool {
        self.phase == TrackerPhase::Aborted
    }

    /// Inspection results as `(progress in percent, metric value)`.
    pub fn inspection_log(&self) -> &[(f32, f32)] {
        &self.log
    }

    pub fn into_inspection_log(self) -> Vec<(f32, f32)> {
        self.log
    }

    /// Count one finished epoch.
    ///
    /// # Algorithm
    /// 1. initialize timers on the first call
    /// 2. poll the abort signal; `'q'` truncates the total to the current epoch
    /// 3. after `estimate_wait` seconds, estimate the run time once
    /// 4. evaluate the metric every `inspect_interval` seconds, except while
    ///    the estimate is pending, and always at the last epoch
    pub fn trigger(&mut self, params: &ParameterStore) -> TrackerEvent {
        match self.phase {
            TrackerPhase::Aborted => return TrackerEvent::Abort,
            TrackerPhase::Exhausted => return TrackerEvent::Finished,
            TrackerPhase::Uninitialized => {
                let now = Instant::now();
                self.state = Some(TrackerState {
                    epoch: 0,
                    start: now,
                    last_inspection: now,
                    estimate_started: false,
                    estimate_ended: false,
                });
                self.phase = TrackerPhase::Running;
                self.observer.on_start(self.settings.total_updates);
            }
            TrackerPhase::Running => {}
        }

        let Some(mut state) = self.state.take() else {
            return TrackerEvent::Abort;
        };
        state.epoch += 1;

        if self.abort.poll() == Some('q') {
            self.settings.total_updates = state.epoch;
            self.phase = TrackerPhase::Aborted;
            self.observer.on_abort(state.epoch);
        }

        if self.settings.estimate_time && !state.estimate_ended && !self.is_aborted() {
            self.estimate(&mut state);
        }

        if self.settings.inspect {
            self.inspect(&mut state, params);
        }

        let last = state.epoch >= self.settings.total_updates;
        self.state = Some(state);
        if self.is_aborted() {
            TrackerEvent::Abort
        } else if last {
            self.phase = TrackerPhase::Exhausted;
            TrackerEvent::Finished
        } else {
            TrackerEvent::Continue
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn estimate(&mut self, state: &mut TrackerState) {
        if !state.estimate_started {
            state.estimate_started = true;
            self.observer.on_estimate_started();
        }
        let elapsed = state.start.elapsed().as_secs_f64();
        if elapsed < self.settings.estimate_wait {
            return;
        }
        let seconds = elapsed / (state.epoch + 1) as f64 * self.settings.planned_updates as f64;
        let finish = Local::now() + chrono::Duration::milliseconds((seconds * 1000.0) as i64);
        state.estimate_ended = true;
        self.observer.on_estimate(seconds, finish);
    }

    #[allow(clippy::cast_precision_loss)]
    fn inspect(&mut self, state: &mut TrackerState, params: &ParameterStore) {
        let Some(data) = self.test_data.as_ref() else {
            self.observer
                .on_warning("inspection requires test data; inspection disabled");
            self.settings.inspect = false;
            return;
        };

        if state.epoch >= self.settings.total_updates {
            match self.settings.metric.evaluate(params, data) {
                Ok(value) if value.is_finite() => {
                    self.log.push((100.0, value));
                    self.observer.on_final(self.settings.metric, value);
                }
                Ok(value) => self
                    .observer
                    .on_warning(&format!("final inspection is not finite: {value}")),
                Err(err) => self.observer.on_warning(&format!("final inspection failed: {err}")),
            }
            return;
        }

        let estimate_pending =
            self.settings.estimate_time && state.estimate_started && !state.estimate_ended;
        if estimate_pending
            || state.last_inspection.elapsed().as_secs_f64() <= self.settings.inspect_interval
        {
            return;
        }

        match self.settings.metric.evaluate(params, data) {
            Ok(value) if value.is_finite() => {
                let progress = state.epoch as f32 / self.settings.total_updates as f32 * 100.0;
                self.log.push((progress, value));
                self.observer.on_inspection(progress, self.settings.metric, value);
            }
            Ok(value) => {
                self.observer
                    .on_warning(&format!("inspection is not finite: {value}"));
            }
            Err(err) => {
                self.observer
                    .on_warning(&format!("inspection failed: {err}; inspection disabled"));
                self.settings.inspect = false;
            }
        }
        state.last_inspection = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::core::{UnitGroup, UnitKind};

    struct AbortAt {
        call: usize,
        at: usize,
    }

    impl AbortSignal for AbortAt {
        fn poll(&mut self) -> Option<char> {
            self.call += 1;
            (self.call == self.at).then_some('q')
        }
    }

    #[derive(Default)]
    struct Recorder {
        finals: Vec<f32>,
        warnings: Vec<String>,
        aborts: Vec<usize>,
    }

    impl ProgressObserver for Recorder {
        fn on_final(&mut self, _metric: Metric, value: f32) {
            self.finals.push(value);
        }
        fn on_abort(&mut self, epoch: usize) {
            self.aborts.push(epoch);
        }
        fn on_warning(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }
    }

    fn params() -> ParameterStore {
        let v = UnitGroup::new("visible", true, UnitKind::Sigmoid, vec!["a".into()]).unwrap();
        let h = UnitGroup::new("hidden", false, UnitKind::Sigmoid, vec!["b".into()]).unwrap();
        ParameterStore::dense(v, h).unwrap()
    }

    fn config(updates: usize) -> OptimizationConfig {
        let mut cfg = OptimizationConfig::defaults(ModelKind::Rbm);
        cfg.updates = updates;
        cfg.inspect = false;
        cfg.estimate_time = false;
        cfg
    }

    #[test]
    fn test_counts_epochs_until_finished() {
        let cfg = config(5);
        let mut abort = NoAbort;
        let mut obs = Recorder::default();
        let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs);
        let p = params();
        assert_eq!(t.phase(), TrackerPhase::Uninitialized);
        for _ in 0..4 {
            assert_eq!(t.trigger(&p), TrackerEvent::Continue);
        }
        assert_eq!(t.trigger(&p), TrackerEvent::Finished);
        assert_eq!(t.epoch(), 5);
        assert_eq!(t.phase(), TrackerPhase::Exhausted);
        // terminal state is not left again
        assert_eq!(t.trigger(&p), TrackerEvent::Finished);
        assert_eq!(t.epoch(), 5);
    }

    #[test]
    fn test_abort_truncates_total() {
        let cfg = config(100);
        let mut abort = AbortAt { call: 0, at: 7 };
        let mut obs = Recorder::default();
        let p = params();
        {
            let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs);
            for _ in 0..6 {
                assert_eq!(t.trigger(&p), TrackerEvent::Continue);
            }
            assert_eq!(t.trigger(&p), TrackerEvent::Abort);
            assert!(t.is_aborted());
            assert_eq!(t.total_updates(), 7);
            assert_eq!(t.epoch(), 7);
            assert_eq!(t.trigger(&p), TrackerEvent::Abort);
        }
        assert_eq!(obs.aborts, vec![7]);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let mut signal = token.clone();
        assert_eq!(signal.poll(), None);
        token.cancel();
        assert_eq!(signal.poll(), Some('q'));
    }

    #[test]
    fn test_final_epoch_is_always_inspected() {
        let mut cfg = config(3);
        cfg.inspect = true;
        cfg.inspect_interval = 1.0e6;
        let mut abort = NoAbort;
        let mut obs = Recorder::default();
        let p = params();
        let log = {
            let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs)
                .with_test_data(ndarray::arr2(&[[1.0], [0.0]]));
            while t.trigger(&p) == TrackerEvent::Continue {}
            t.into_inspection_log()
        };
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 100.0);
        assert_eq!(obs.finals.len(), 1);
    }

    #[test]
    fn test_abort_runs_final_inspection() {
        let mut cfg = config(50);
        cfg.inspect = true;
        cfg.inspect_interval = 1.0e6;
        let mut abort = AbortAt { call: 0, at: 2 };
        let mut obs = Recorder::default();
        let p = params();
        {
            let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs)
                .with_test_data(ndarray::arr2(&[[1.0]]));
            t.trigger(&p);
            assert_eq!(t.trigger(&p), TrackerEvent::Abort);
        }
        assert_eq!(obs.finals.len(), 1);
    }

    #[test]
    fn test_inspection_without_data_is_disabled() {
        let mut cfg = config(3);
        cfg.inspect = true;
        let mut abort = NoAbort;
        let mut obs = Recorder::default();
        let p = params();
        {
            let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs);
            while t.trigger(&p) == TrackerEvent::Continue {}
        }
        assert_eq!(obs.warnings.len(), 1);
        assert!(obs.finals.is_empty());
    }

    fn inspected_log(cfg: &OptimizationConfig, obs: &mut Recorder) -> Vec<(f32, f32)> {
        let mut abort = NoAbort;
        let p = params();
        let mut t = ProgressTracker::new(cfg, &mut abort, obs)
            .with_test_data(ndarray::arr2(&[[1.0], [0.0]]));
        while t.trigger(&p) == TrackerEvent::Continue {}
        t.into_inspection_log()
    }

    #[test]
    fn test_inspection_waits_for_pending_estimate() {
        let mut cfg = config(5);
        cfg.inspect = true;
        cfg.inspect_interval = 0.0;
        cfg.estimate_time = true;
        cfg.estimate_wait = 1.0e6;
        let mut obs = Recorder::default();
        let log = inspected_log(&cfg, &mut obs);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 100.0);
    }

    #[test]
    fn test_inspection_runs_between_epochs() {
        let mut cfg = config(5);
        cfg.inspect = true;
        cfg.inspect_interval = 0.0;
        let mut obs = Recorder::default();
        let log = inspected_log(&cfg, &mut obs);
        assert!(log.len() > 1);
        assert!(log[..log.len() - 1].iter().all(|&(progress, _)| progress < 100.0));
        assert_eq!(log[log.len() - 1].0, 100.0);
        assert!(obs.warnings.is_empty());
    }

    #[test]
    fn test_non_finite_inspection_is_warned() {
        let mut cfg = config(3);
        cfg.inspect = true;
        cfg.inspect_interval = 0.0;
        let mut abort = NoAbort;
        let mut obs = Recorder::default();
        let mut p = params();
        p.links.weight[[0, 0]] = f32::NAN;
        let log = {
            let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs)
                .with_test_data(ndarray::arr2(&[[1.0], [0.0]]));
            while t.trigger(&p) == TrackerEvent::Continue {}
            t.into_inspection_log()
        };
        assert!(log.is_empty());
        assert!(obs.finals.is_empty());
        assert!(!obs.warnings.is_empty());
    }

    #[test]
    fn test_estimate_waits_for_warmup() {
        let mut cfg = config(10);
        cfg.estimate_time = true;
        cfg.estimate_wait = 0.0;

        struct Estimates(Vec<f64>);
        impl ProgressObserver for Estimates {
            fn on_estimate(&mut self, seconds: f64, _finish: DateTime<Local>) {
                self.0.push(seconds);
            }
        }

        let mut abort = NoAbort;
        let mut obs = Estimates(Vec::new());
        let p = params();
        {
            let mut t = ProgressTracker::new(&cfg, &mut abort, &mut obs);
            while t.trigger(&p) == TrackerEvent::Continue {}
        }
        // one-shot estimate
        assert_eq!(obs.0.len(), 1);
        assert!(obs.0[0] >= 0.0);
    }
}
