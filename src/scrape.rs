use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::device::DeviceChannel;
use crate::payload::RawPayload;

/// Prefix of the log line carrying a run's results.
pub const COMPLETION_MARKER: &str = "ZZRES>>";

/// Result of polling the log for the completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    Found {
        payload: RawPayload,
        /// Time from the start of polling to the dump that held the marker.
        elapsed: Duration,
    },
    Timeout,
}

/// Return the text after the first completion marker in `dump`.
pub fn find_marker(dump: &str) -> Option<&str> {
    dump.lines().find_map(|line| {
        line.find(COMPLETION_MARKER)
            .map(|idx| line[idx + COMPLETION_MARKER.len()..].trim_end())
    })
}

/// Polls a device's filtered log buffer for the completion marker.
pub struct LogScraper<'a, D: DeviceChannel + ?Sized> {
    device: &'a D,
    tags: &'a [String],
    interval: Duration,
}

impl<'a, D: DeviceChannel + ?Sized> LogScraper<'a, D> {
    pub fn new(device: &'a D, tags: &'a [String], interval: Duration) -> Self {
        Self {
            device,
            tags,
            interval,
        }
    }

    /// Poll until the marker appears or `deadline` passes; always polls at least once.
    pub fn scrape(&self, deadline: Instant) -> ScrapeOutcome {
        let started = Instant::now();
        loop {
            match self.device.dump_log(self.tags) {
                Ok(raw) => {
                    let dump = String::from_utf8_lossy(&raw);
                    if let Some(found) = find_marker(&dump) {
                        let elapsed = started.elapsed();
                        debug!(elapsed_ms = elapsed.as_millis() as u64, "completion marker found");
                        return ScrapeOutcome::Found {
                            payload: RawPayload::new(found),
                            elapsed,
                        };
                    }
                }
                Err(err) => warn!(error = %err, "log dump failed while scraping"),
            }

            let now = Instant::now();
            if now >= deadline {
                return ScrapeOutcome::Timeout;
            }
            thread::sleep(self.interval.min(deadline - now));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::InstallFlags;
    use crate::error::DeviceError;
    use std::path::Path;
    use std::sync::Mutex;

    /// Device whose log dumps are served from a script, repeating the last entry.
    /// A `None` entry makes that dump fail.
    #[derive(Default)]
    pub(crate) struct ScriptedLog {
        dumps: Mutex<Vec<Option<String>>>,
        pub(crate) dump_calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedLog {
        pub(crate) fn new(dumps: &[&str]) -> Self {
            let dumps: Vec<Option<&str>> = dumps.iter().copied().map(Some).collect();
            Self::with_failures(&dumps)
        }

        pub(crate) fn with_failures(dumps: &[Option<&str>]) -> Self {
            Self {
                dumps: Mutex::new(dumps.iter().rev().map(|d| d.map(str::to_string)).collect()),
                dump_calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.dump_calls.lock().unwrap().len()
        }
    }

    impl DeviceChannel for ScriptedLog {
        fn clear_app_data(&self, _package: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        fn install(&self, _apk: &Path, _flags: InstallFlags) -> Result<(), DeviceError> {
            Ok(())
        }
        fn sync_storage(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn launch_activity(&self, _component: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        fn clear_log(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn dump_log(&self, tags: &[String]) -> Result<Vec<u8>, DeviceError> {
            self.dump_calls.lock().unwrap().push(tags.to_vec());
            let mut dumps = self.dumps.lock().unwrap();
            let next = if dumps.len() > 1 {
                dumps.pop().flatten()
            } else {
                dumps.last().cloned().unwrap_or(Some(String::new()))
            };
            next.map(String::into_bytes).ok_or_else(|| DeviceError::Exit {
                command: "adb logcat -d".into(),
                code: Some(1),
                stderr: "error: device offline".into(),
            })
        }
        fn set_log_buffer_size(&self, _size: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        fn pull_file(&self, _remote_path: &str) -> Result<Vec<u8>, DeviceError> {
            Ok(Vec::new())
        }
        fn remove_file(&self, _remote_path: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        fn screenshot(&self, _remote_path: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        fn battery_level(&self) -> Result<Option<u8>, DeviceError> {
            Ok(None)
        }
        fn serial(&self) -> Result<String, DeviceError> {
            Ok("TEST".into())
        }
    }

    fn tags() -> Vec<String> {
        vec!["Unity".to_string()]
    }

    #[test]
    fn first_marker_line_wins() {
        let dump = "I/Unity: loading\nI/Unity: ZZRES>>scene_name:A|data:1\nI/Unity: ZZRES>>scene_name:B|data:2\n";
        assert_eq!(find_marker(dump), Some("scene_name:A|data:1"));
        assert_eq!(find_marker("I/Unity: nothing here"), None);
    }

    #[test]
    fn marker_found_on_later_poll() {
        let device = ScriptedLog::new(&[
            "I/Unity: warming up",
            "I/Unity: still running",
            "01-01 I/Unity( 123): ZZRES>>scene_name:Forest|data:58.2\r",
        ]);
        let tags = tags();
        let scraper = LogScraper::new(&device, &tags, Duration::from_millis(1));
        let outcome = scraper.scrape(Instant::now() + Duration::from_secs(5));
        match outcome {
            ScrapeOutcome::Found { payload, .. } => {
                assert_eq!(payload.as_str(), "scene_name:Forest|data:58.2")
            }
            ScrapeOutcome::Timeout => panic!("expected marker"),
        }
        assert_eq!(device.calls(), 3);
        assert_eq!(device.dump_calls.lock().unwrap()[0], tags);
    }

    #[test]
    fn failed_dump_does_not_end_scraping() {
        let device = ScriptedLog::with_failures(&[
            Some("I/Unity: warming up"),
            None,
            Some("I/Unity: ZZRES>>scene_name:Forest|data:58.2"),
        ]);
        let tags = tags();
        let scraper = LogScraper::new(&device, &tags, Duration::from_millis(1));
        let outcome = scraper.scrape(Instant::now() + Duration::from_secs(5));
        match outcome {
            ScrapeOutcome::Found { payload, .. } => {
                assert_eq!(payload.as_str(), "scene_name:Forest|data:58.2")
            }
            ScrapeOutcome::Timeout => panic!("expected marker after the failed dump"),
        }
        assert_eq!(device.calls(), 3);
    }

    #[test]
    fn failing_device_times_out() {
        let device = ScriptedLog::with_failures(&[None]);
        let tags = tags();
        let scraper = LogScraper::new(&device, &tags, Duration::from_millis(5));
        let outcome = scraper.scrape(Instant::now() + Duration::from_millis(20));
        assert_eq!(outcome, ScrapeOutcome::Timeout);
        assert!(device.calls() >= 2);
    }

    #[test]
    fn expired_deadline_still_polls_once() {
        let device = ScriptedLog::new(&["I/Unity: ZZRES>>scene_name:A|data:1"]);
        let tags = tags();
        let scraper = LogScraper::new(&device, &tags, Duration::from_millis(1));
        let outcome = scraper.scrape(Instant::now());
        assert!(matches!(outcome, ScrapeOutcome::Found { .. }));
        assert_eq!(device.calls(), 1);
    }

    #[test]
    fn times_out_without_marker() {
        let device = ScriptedLog::new(&["I/Unity: no results"]);
        let tags = tags();
        let scraper = LogScraper::new(&device, &tags, Duration::from_millis(5));
        let started = Instant::now();
        let outcome = scraper.scrape(started + Duration::from_millis(30));
        assert_eq!(outcome, ScrapeOutcome::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(device.calls() >= 2);
    }
}
