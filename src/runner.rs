use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Local, Utc};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::attributes::Attributes;
use crate::config::{RunConfig, WaitMode};
use crate::correlate::{CorrelationContext, CorrelationOutcome, ResultCorrelator};
use crate::device::{DeviceChannel, with_retry};
use crate::events::TransitionSink;
use crate::orchestrator::{Attempt, AttemptOrchestrator, AttemptOutcome, Build};
use crate::results::ResultFile;
use crate::store::{DeviceIdentity, MetricsStore, StoreHttp};

/// UTC timestamp shared by every record created in one run.
pub const DATE_OF_TEST_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One (build, cycle) pass and everything recorded alongside it.
#[derive(Debug, Clone)]
pub struct BuildRun {
    pub attempt: Attempt,
    pub battery_before: Option<u8>,
    pub screenshot: Option<PathBuf>,
    /// `None` when no index was configured or the run measured startup time.
    pub correlation: Option<CorrelationOutcome>,
}

/// Outcomes for one build, ordered by cycle.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub build: Build,
    pub runs: Vec<BuildRun>,
}

impl ResultSet {
    pub fn values(&self) -> impl Iterator<Item = String> + '_ {
        self.runs.iter().map(|run| run.attempt.result_value())
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub date_of_test: String,
    pub device: DeviceIdentity,
    pub battery_start: Option<u8>,
    pub battery_end: Option<u8>,
    pub sets: Vec<ResultSet>,
    pub result_file: PathBuf,
}

impl RunReport {
    pub fn attempts(&self) -> usize {
        self.sets.iter().map(|set| set.runs.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.runs()
            .filter(|run| !run.attempt.outcome.is_success())
            .count()
    }

    pub fn ambiguous(&self) -> usize {
        self.runs()
            .filter_map(|run| run.correlation.as_ref())
            .filter(|outcome| outcome.has_ambiguity())
            .count()
    }

    fn runs(&self) -> impl Iterator<Item = &BuildRun> {
        self.sets.iter().flat_map(|set| set.runs.iter())
    }
}

/// Builds from `folder` (every `*.apk`, sorted) or else the explicit list.
pub fn discover_builds(apks: &[PathBuf], folder: Option<&Path>) -> Result<Vec<Build>> {
    let paths = match folder {
        Some(folder) => {
            let mut found: Vec<PathBuf> = fs::read_dir(folder)
                .with_context(|| format!("Unable to read build folder {}", folder.display()))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    path.is_file()
                        && path
                            .extension()
                            .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
                })
                .collect();
            found.sort();
            found
        }
        None => apks.to_vec(),
    };
    if paths.is_empty() {
        bail!("Input a list of APKs or a folder containing APKs");
    }
    Ok(paths.into_iter().map(Build::from_path).collect())
}

/// Drives cycles × builds sequentially and reconciles every result.
pub struct RunController<'a, D: DeviceChannel + ?Sized, H: StoreHttp> {
    device: &'a D,
    config: &'a RunConfig,
    sink: &'a dyn TransitionSink,
    store: Option<&'a MetricsStore<H>>,
    identity: &'a DeviceIdentity,
    output_dir: &'a Path,
}

impl<'a, D: DeviceChannel + ?Sized, H: StoreHttp> RunController<'a, D, H> {
    pub fn new(
        device: &'a D,
        config: &'a RunConfig,
        sink: &'a dyn TransitionSink,
        store: Option<&'a MetricsStore<H>>,
        identity: &'a DeviceIdentity,
        output_dir: &'a Path,
    ) -> Self {
        Self {
            device,
            config,
            sink,
            store,
            identity,
            output_dir,
        }
    }

    /// Exhausted attempts are outcomes; only failing to create the result file aborts the run.
    pub fn run(&self, builds: &[Build]) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let date_of_test = Utc::now().format(DATE_OF_TEST_FORMAT).to_string();
        let span = info_span!("run", run = %run_id, device = %self.identity.serial);
        let _guard = span.enter();

        let results = ResultFile::create(self.output_dir)?;
        info!(
            path = %results.path().display(),
            builds = builds.len(),
            cycles = self.config.cycles,
            "starting run"
        );

        let tries = self.config.device_retry_count;
        if let Err(err) = with_retry(tries, || {
            self.device.set_log_buffer_size(&self.config.log_buffer_size)
        }) {
            warn!(error = %err, "log buffer size unchanged");
        }
        if let Some(store) = self.store {
            if let Err(err) = store.ensure_index() {
                warn!(index = store.index(), error = %err, "unable to create metrics index");
            }
        }
        let battery_start = self.battery();

        let orchestrator = AttemptOrchestrator::new(self.device, self.config, self.sink, run_id);
        let correlator = self.store.map(ResultCorrelator::new);
        let mut sets: Vec<ResultSet> = builds
            .iter()
            .map(|build| ResultSet {
                build: build.clone(),
                runs: Vec::with_capacity(self.config.cycles as usize),
            })
            .collect();

        for cycle in 0..self.config.cycles {
            info!(cycle, "cycle started");
            keep_going(results.cycle(cycle));
            for (index, set) in sets.iter_mut().enumerate() {
                let build = &set.build;
                let battery_before = self.battery();
                keep_going(results.battery_before(index, battery_before));
                info!(build = %build.name, cycle, "running build");

                let attempt = orchestrator.run(build, cycle);
                let (screenshot, image) =
                    if attempt.outcome.is_success() && self.config.capture_screenshots {
                        self.capture_screenshot(build, cycle)
                    } else {
                        (None, None)
                    };

                let correlation = match (&correlator, self.config.mode) {
                    (Some(correlator), WaitMode::SteadyState) => {
                        let attributes = match &attempt.outcome {
                            AttemptOutcome::Success { attributes, .. } => attributes.clone(),
                            AttemptOutcome::ExhaustedRetries { .. } => Attributes::default(),
                        };
                        let context = CorrelationContext {
                            date_of_test: &date_of_test,
                            apk_name: &build.name,
                            device: self.identity,
                            image: image.as_deref(),
                        };
                        let outcome =
                            correlator.correlate(&attempt.payload(), &attributes, &context);
                        info!(build = %build.name, cycle, outcome = %outcome, "correlated result");
                        Some(outcome)
                    }
                    _ => None,
                };

                let value = attempt.result_value();
                info!(
                    build = %build.name,
                    cycle,
                    result = %value,
                    "result set {index}"
                );
                keep_going(results.result(index, &value));
                set.runs.push(BuildRun {
                    attempt,
                    battery_before,
                    screenshot,
                    correlation,
                });
            }
        }

        let battery_end = self.battery();
        keep_going(results.finish(&sets, battery_start, battery_end));

        Ok(RunReport {
            run_id,
            date_of_test,
            device: self.identity.clone(),
            battery_start,
            battery_end,
            sets,
            result_file: results.path().to_path_buf(),
        })
    }

    fn battery(&self) -> Option<u8> {
        match self.device.battery_level() {
            Ok(level) => level,
            Err(err) => {
                warn!(error = %err, "battery level unavailable");
                None
            }
        }
    }

    /// Saves the picture under `pictures/` and returns it base64-encoded for the store.
    fn capture_screenshot(&self, build: &Build, cycle: u32) -> (Option<PathBuf>, Option<String>) {
        let name = format!(
            "{}_Cycle-{cycle}_{}_{}_{}.png",
            build.name,
            self.identity.name.replace(' ', "_"),
            self.identity.serial,
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let remote = format!("/sdcard/{name}");
        let tries = self.config.device_retry_count;

        let bytes = match with_retry(tries, || self.device.screenshot(&remote))
            .and_then(|()| with_retry(tries, || self.device.pull_file(&remote)))
        {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(build = %build.name, cycle, error = %err, "screenshot unavailable");
                return (None, None);
            }
        };
        if let Err(err) = self.device.remove_file(&remote) {
            warn!(path = %remote, error = %err, "screenshot left on device");
        }

        let encoded = STANDARD.encode(&bytes);
        let local = self.output_dir.join("pictures").join(&name);
        let saved = local
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(&local, &bytes));
        match saved {
            Ok(()) => (Some(local), Some(encoded)),
            Err(err) => {
                warn!(path = %local.display(), error = %err, "failed to save screenshot");
                (None, Some(encoded))
            }
        }
    }
}

/// Result-file appends are best effort; the report still carries every outcome.
fn keep_going(written: Result<()>) {
    if let Err(err) = written {
        warn!(error = %format!("{err:#}"), "result file not updated");
    }
}
