use std::{
    fmt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attributes::{AttributeExtractor, Attributes};
use crate::config::{RunConfig, WaitMode};
use crate::device::{DeviceChannel, InstallFlags, with_retry};
use crate::error::DeviceError;
use crate::events::{AttemptEvent, TransitionSink};
use crate::payload::RawPayload;
use crate::scrape::{LogScraper, ScrapeOutcome};

/// A build artifact under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub path: PathBuf,
    pub name: String,
}

impl Build {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// States of a single install–launch–wait attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Clearing,
    Installing,
    Launching,
    Waiting,
    Success,
    Timeout,
    Skipped,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttemptState::Clearing => "clearing",
            AttemptState::Installing => "installing",
            AttemptState::Launching => "launching",
            AttemptState::Waiting => "waiting",
            AttemptState::Success => "success",
            AttemptState::Timeout => "timeout",
            AttemptState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Terminal result of driving one (build, cycle) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success {
        payload: RawPayload,
        attributes: Attributes,
        /// Time to first marker; only measured in startup mode.
        startup: Option<Duration>,
    },
    ExhaustedRetries { attempts: u32 },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }
}

/// One (build, cycle) attempt and how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub build: String,
    pub cycle: u32,
    /// Index of the final try, starting at zero.
    pub retry: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

impl Attempt {
    /// Payload for the correlator; exhausted attempts become the skip sentinel.
    pub fn payload(&self) -> RawPayload {
        match &self.outcome {
            AttemptOutcome::Success { payload, .. } => payload.clone(),
            AttemptOutcome::ExhaustedRetries { attempts } => {
                RawPayload::skipped(self.cycle, *attempts)
            }
        }
    }

    /// Human-readable result recorded in the result file.
    pub fn result_value(&self) -> String {
        match &self.outcome {
            AttemptOutcome::Success {
                startup: Some(elapsed),
                ..
            } => format!("{:.3}", elapsed.as_secs_f64()),
            AttemptOutcome::Success { payload, .. } => payload.to_string(),
            AttemptOutcome::ExhaustedRetries { .. } => self.payload().to_string(),
        }
    }
}

struct WaitSuccess {
    payload: RawPayload,
    attributes: Attributes,
    startup: Option<Duration>,
}

/// Drives clear → install → launch → wait for one build, retrying on timeout.
pub struct AttemptOrchestrator<'a, D: DeviceChannel + ?Sized> {
    device: &'a D,
    config: &'a RunConfig,
    sink: &'a dyn TransitionSink,
    run_id: Uuid,
}

impl<'a, D: DeviceChannel + ?Sized> AttemptOrchestrator<'a, D> {
    pub fn new(
        device: &'a D,
        config: &'a RunConfig,
        sink: &'a dyn TransitionSink,
        run_id: Uuid,
    ) -> Self {
        Self {
            device,
            config,
            sink,
            run_id,
        }
    }

    /// Run up to `retry_budget + 1` tries; never fails, exhaustion is an outcome.
    pub fn run(&self, build: &Build, cycle: u32) -> Attempt {
        let started_at = Utc::now();
        let max_attempts = self.config.max_attempts();

        for retry in 0..max_attempts {
            let remaining = max_attempts - retry - 1;
            match self.try_once(build, cycle, retry) {
                Ok(Some(success)) => {
                    self.transition(build, cycle, retry, AttemptState::Success, None);
                    return Attempt {
                        build: build.name.clone(),
                        cycle,
                        retry,
                        started_at,
                        outcome: AttemptOutcome::Success {
                            payload: success.payload,
                            attributes: success.attributes,
                            startup: success.startup,
                        },
                    };
                }
                Ok(None) => {
                    self.transition(
                        build,
                        cycle,
                        retry,
                        AttemptState::Timeout,
                        Some("no completion marker before deadline".into()),
                    );
                    info!(build = %build.name, cycle, remaining, "did not get result");
                }
                Err(err) => {
                    warn!(
                        build = %build.name,
                        cycle,
                        remaining,
                        error = %err,
                        "attempt aborted by device failure"
                    );
                    self.transition(
                        build,
                        cycle,
                        retry,
                        AttemptState::Timeout,
                        Some(err.to_string()),
                    );
                }
            }
        }

        self.transition(
            build,
            cycle,
            max_attempts - 1,
            AttemptState::Skipped,
            Some(format!("skipped after {max_attempts} attempts")),
        );
        Attempt {
            build: build.name.clone(),
            cycle,
            retry: max_attempts - 1,
            started_at,
            outcome: AttemptOutcome::ExhaustedRetries {
                attempts: max_attempts,
            },
        }
    }

    fn try_once(
        &self,
        build: &Build,
        cycle: u32,
        retry: u32,
    ) -> Result<Option<WaitSuccess>, DeviceError> {
        let tries = self.config.device_retry_count;

        self.transition(build, cycle, retry, AttemptState::Clearing, None);
        if let Err(err) = with_retry(tries, || self.device.clear_app_data(&self.config.package)) {
            // The package may never have been installed on this device.
            debug!(package = %self.config.package, error = %err, "app data not cleared");
        }
        thread::sleep(self.config.settle_delay);

        self.transition(build, cycle, retry, AttemptState::Installing, None);
        with_retry(tries, || {
            self.device
                .install(build.path(), InstallFlags::REPLACE_ALLOW_DOWNGRADE)
        })?;
        with_retry(tries, || self.device.sync_storage())?;
        with_retry(tries, || self.device.clear_log())?;
        thread::sleep(self.config.settle_delay);

        self.transition(build, cycle, retry, AttemptState::Launching, None);
        let component = self.config.component();
        with_retry(tries, || self.device.launch_activity(&component))?;

        self.transition(build, cycle, retry, AttemptState::Waiting, None);
        Ok(self.wait())
    }

    fn wait(&self) -> Option<WaitSuccess> {
        let entered = Instant::now();
        let deadline = entered + self.config.wait;
        let attribute_deadline = entered + self.config.attribute_timeout;
        let scraper = LogScraper::new(
            self.device,
            &self.config.log_tags,
            self.config.poll_interval,
        );
        let extractor = AttributeExtractor::new(
            self.device,
            &self.config.attribute_tags,
            self.config.poll_interval,
        );
        let mode = self.config.mode;

        let (scraped, attributes) = thread::scope(|scope| {
            let attributes = scope.spawn(|| extractor.extract(attribute_deadline));
            let scraped = match mode {
                WaitMode::Startup => {
                    let outcome = scraper.scrape(deadline);
                    sleep_until(deadline);
                    outcome
                }
                WaitMode::SteadyState => {
                    sleep_until(deadline);
                    scraper.scrape(deadline)
                }
            };
            (scraped, attributes.join().unwrap_or_default())
        });

        match scraped {
            ScrapeOutcome::Found { payload, elapsed } => Some(WaitSuccess {
                payload,
                attributes,
                startup: (mode == WaitMode::Startup).then_some(elapsed),
            }),
            ScrapeOutcome::Timeout => None,
        }
    }

    fn transition(
        &self,
        build: &Build,
        cycle: u32,
        retry: u32,
        state: AttemptState,
        detail: Option<String>,
    ) {
        debug!(build = %build.name, cycle, retry, state = %state, "attempt transition");
        let event = AttemptEvent::new(self.run_id, &build.name, cycle, retry, state);
        let event = match detail {
            Some(detail) => event.with_detail(detail),
            None => event,
        };
        self.sink.record(&event);
    }
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Device double counting every command it receives.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        /// Scrape dumps (tagged) needed before the marker shows up; `None` never emits it.
        pub(crate) marker_after: Option<usize>,
        pub(crate) payload: String,
        pub(crate) boot_log: String,
        pub(crate) fail_install: bool,
        pub(crate) fail_clear: bool,
        /// Host directory deleted on the first install, to break local output mid-run.
        pub(crate) remove_on_install: Mutex<Option<std::path::PathBuf>>,
        pub(crate) calls: Mutex<HashMap<&'static str, usize>>,
    }

    impl FakeDevice {
        pub(crate) fn emitting(payload: &str) -> Self {
            Self {
                marker_after: Some(1),
                payload: payload.into(),
                boot_log: "CPU = arm64-v8a\nAPP_STARTED".into(),
                ..Self::default()
            }
        }

        pub(crate) fn silent() -> Self {
            Self::default()
        }

        fn bump(&self, name: &'static str) -> usize {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(name).or_default();
            *count += 1;
            *count
        }

        pub(crate) fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
        }

        fn fail(name: &str) -> DeviceError {
            DeviceError::Exit {
                command: format!("adb {name}"),
                code: Some(1),
                stderr: "device offline".into(),
            }
        }
    }

    impl DeviceChannel for FakeDevice {
        fn clear_app_data(&self, _package: &str) -> Result<(), DeviceError> {
            self.bump("clear_app_data");
            if self.fail_clear {
                return Err(Self::fail("shell pm clear"));
            }
            Ok(())
        }
        fn install(&self, _apk: &Path, flags: InstallFlags) -> Result<(), DeviceError> {
            assert_eq!(flags, InstallFlags::REPLACE_ALLOW_DOWNGRADE);
            self.bump("install");
            if let Some(dir) = self.remove_on_install.lock().unwrap().take() {
                std::fs::remove_dir_all(dir).unwrap();
            }
            if self.fail_install {
                return Err(Self::fail("install"));
            }
            Ok(())
        }
        fn sync_storage(&self) -> Result<(), DeviceError> {
            self.bump("sync_storage");
            Ok(())
        }
        fn launch_activity(&self, _component: &str) -> Result<(), DeviceError> {
            self.bump("launch_activity");
            Ok(())
        }
        fn clear_log(&self) -> Result<(), DeviceError> {
            self.bump("clear_log");
            Ok(())
        }
        fn dump_log(&self, tags: &[String]) -> Result<Vec<u8>, DeviceError> {
            if tags.is_empty() {
                self.bump("dump_attributes");
                return Ok(self.boot_log.clone().into_bytes());
            }
            let seen = self.bump("dump_scrape");
            match self.marker_after {
                Some(after) if seen >= after => {
                    Ok(format!("I/Unity: ZZRES>>{}", self.payload).into_bytes())
                }
                _ => Ok(b"I/Unity: running".to_vec()),
            }
        }
        fn set_log_buffer_size(&self, _size: &str) -> Result<(), DeviceError> {
            self.bump("set_log_buffer_size");
            Ok(())
        }
        fn pull_file(&self, _remote_path: &str) -> Result<Vec<u8>, DeviceError> {
            self.bump("pull_file");
            Ok(b"\x89PNG".to_vec())
        }
        fn remove_file(&self, _remote_path: &str) -> Result<(), DeviceError> {
            self.bump("remove_file");
            Ok(())
        }
        fn screenshot(&self, _remote_path: &str) -> Result<(), DeviceError> {
            self.bump("screenshot");
            Ok(())
        }
        fn battery_level(&self) -> Result<Option<u8>, DeviceError> {
            Ok(Some(90))
        }
        fn serial(&self) -> Result<String, DeviceError> {
            Ok("FAKE123".into())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: RefCell<Vec<AttemptEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn states(&self) -> Vec<AttemptState> {
            self.events.borrow().iter().map(|event| event.state).collect()
        }
    }

    impl TransitionSink for RecordingSink {
        fn record(&self, event: &AttemptEvent) {
            self.events.borrow_mut().push(event.clone());
        }
    }

    pub(crate) fn fast_config(retry_budget: u32) -> RunConfig {
        let mut config = RunConfig::from_settings("com.acme.game", &Settings::default());
        config.retry_budget = retry_budget;
        config.wait = Duration::from_millis(5);
        config.settle_delay = Duration::ZERO;
        config.poll_interval = Duration::from_millis(1);
        config.attribute_timeout = Duration::from_millis(5);
        config
    }

    fn build() -> Build {
        Build::from_path("/builds/game-il2cpp.apk")
    }

    #[test]
    fn build_name_is_file_name() {
        assert_eq!(build().name, "game-il2cpp.apk");
    }

    #[test]
    fn always_timing_out_runs_budget_plus_one_cycles() {
        for budget in 0..=3 {
            let device = FakeDevice::silent();
            let sink = RecordingSink::default();
            let config = fast_config(budget);
            let orchestrator = AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil());

            let attempt = orchestrator.run(&build(), 0);

            assert_eq!(
                attempt.outcome,
                AttemptOutcome::ExhaustedRetries {
                    attempts: budget + 1
                }
            );
            assert_eq!(attempt.retry, budget);
            assert_eq!(device.count("install"), (budget + 1) as usize);
            assert_eq!(device.count("launch_activity"), (budget + 1) as usize);
            assert_eq!(device.count("clear_log"), (budget + 1) as usize);
            let states = sink.states();
            assert_eq!(
                states.iter().filter(|s| **s == AttemptState::Timeout).count(),
                (budget + 1) as usize
            );
            assert_eq!(states.last(), Some(&AttemptState::Skipped));
        }
    }

    #[test]
    fn exhausted_attempt_renders_skip_sentinel() {
        let device = FakeDevice::silent();
        let sink = RecordingSink::default();
        let config = fast_config(2);
        let attempt =
            AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil()).run(&build(), 4);
        assert_eq!(attempt.result_value(), "Test #5 Skipped after 3 attempts");
        assert!(attempt.payload().is_skip_sentinel());
    }

    #[test]
    fn success_walks_every_state_once() {
        let device = FakeDevice::emitting("scene_name:Forest|data:58.2");
        let sink = RecordingSink::default();
        let config = fast_config(2);
        let attempt =
            AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil()).run(&build(), 0);

        match &attempt.outcome {
            AttemptOutcome::Success {
                payload,
                attributes,
                startup,
            } => {
                assert_eq!(payload.as_str(), "scene_name:Forest|data:58.2");
                assert_eq!(attributes.architecture, "arm64-v8a");
                assert!(attributes.stopped);
                assert!(startup.is_none());
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(attempt.retry, 0);
        assert_eq!(
            sink.states(),
            vec![
                AttemptState::Clearing,
                AttemptState::Installing,
                AttemptState::Launching,
                AttemptState::Waiting,
                AttemptState::Success,
            ]
        );
        assert_eq!(device.count("install"), 1);
        assert_eq!(device.count("dump_scrape"), 1);
    }

    #[test]
    fn marker_on_second_try_succeeds_after_one_timeout() {
        let mut device = FakeDevice::emitting("scene_name:City|data:31");
        // Steady-state mode scrapes once per try, so the second try sees the marker.
        device.marker_after = Some(2);
        let sink = RecordingSink::default();
        let config = fast_config(3);
        let attempt =
            AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil()).run(&build(), 0);
        assert!(attempt.outcome.is_success());
        assert_eq!(attempt.retry, 1);
        assert_eq!(device.count("install"), 2);
        assert_eq!(
            sink.states()
                .iter()
                .filter(|s| **s == AttemptState::Timeout)
                .count(),
            1
        );
    }

    #[test]
    fn install_failure_feeds_retry_edge() {
        let mut device = FakeDevice::emitting("scene_name:A|data:1");
        device.fail_install = true;
        let sink = RecordingSink::default();
        let config = fast_config(1);
        let attempt =
            AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil()).run(&build(), 0);

        assert_eq!(attempt.outcome, AttemptOutcome::ExhaustedRetries { attempts: 2 });
        assert_eq!(
            device.count("install"),
            2 * config.device_retry_count as usize
        );
        assert_eq!(device.count("launch_activity"), 0);
        let events = sink.events.borrow();
        let timeout = events
            .iter()
            .find(|event| event.state == AttemptState::Timeout)
            .unwrap();
        assert!(timeout.detail.as_deref().unwrap().contains("install"));
    }

    #[test]
    fn clear_failure_is_not_fatal() {
        let mut device = FakeDevice::emitting("scene_name:A|data:1");
        device.fail_clear = true;
        let sink = RecordingSink::default();
        let config = fast_config(0);
        let attempt =
            AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil()).run(&build(), 0);
        assert!(attempt.outcome.is_success());
        assert_eq!(
            device.count("clear_app_data"),
            config.device_retry_count as usize
        );
    }

    #[test]
    fn startup_mode_measures_time_and_fills_wait() {
        let device = FakeDevice::emitting("scene_name:A|data:1");
        let sink = RecordingSink::default();
        let mut config = fast_config(0);
        config.mode = WaitMode::Startup;
        config.wait = Duration::from_millis(40);
        let orchestrator = AttemptOrchestrator::new(&device, &config, &sink, Uuid::nil());

        let begun = Instant::now();
        let attempt = orchestrator.run(&build(), 0);

        assert!(begun.elapsed() >= Duration::from_millis(40));
        match &attempt.outcome {
            AttemptOutcome::Success { startup, .. } => {
                let startup = startup.expect("startup time recorded");
                assert!(startup < Duration::from_millis(40));
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(attempt.result_value().parse::<f64>().is_ok());
    }
}
