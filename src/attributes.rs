//! Environment metadata scraped from the engine's startup log lines.
//!
//! The app prints its build details (architecture, scripting backend, engine version and
//! changeset, build type, graphics API) while booting, then `APP_STARTED` once it is ready.

use std::{
    thread,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::DeviceChannel;

pub const UNKNOWN: &str = "UNKNOWN";
pub const STOP_MARKER: &str = "APP_STARTED";

static ARCHITECTURE: Lazy<Regex> = Lazy::new(|| compile(r"CPU =\s+(\S+)"));
static SCRIPTING_BACKEND: Lazy<Regex> = Lazy::new(|| compile(r"Scripting Backend\s*'([^']*)'"));
static ENGINE_VERSION: Lazy<Regex> =
    Lazy::new(|| compile(r"Built from.*?Version\s*'([^'(]*)\(([^)]*)\)"));
static BUILD_TYPE: Lazy<Regex> = Lazy::new(|| compile(r"Build type\s*'([^']*)'"));
static GLES_CONTEXT: Lazy<Regex> = Lazy::new(|| compile(r"OpenGL ES.*?Context level\s*<([^>]*)>"));
static GRAPHICS_API: Lazy<Regex> = Lazy::new(|| compile(r"Graphics API = (.*)$"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("attribute patterns are valid regexes")
}

/// Build and runtime environment reported by the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub architecture: String,
    pub scripting_backend: String,
    pub build_type: String,
    pub unity_version: String,
    pub changeset: String,
    pub graphics_api: String,
    /// The stop marker was seen; no further scanning is needed.
    pub stopped: bool,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            architecture: UNKNOWN.into(),
            scripting_backend: UNKNOWN.into(),
            build_type: UNKNOWN.into(),
            unity_version: UNKNOWN.into(),
            changeset: UNKNOWN.into(),
            graphics_api: UNKNOWN.into(),
            stopped: false,
        }
    }
}

/// Fields found in a single dump; `None` means the marker was absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeScan {
    pub architecture: Option<String>,
    pub scripting_backend: Option<String>,
    pub build_type: Option<String>,
    pub unity_version: Option<String>,
    pub changeset: Option<String>,
    pub graphics_api: Option<String>,
    pub stopped: bool,
}

impl AttributeScan {
    /// Scan every line of `dump`; later lines overwrite earlier ones.
    pub fn from_dump(dump: &str) -> Self {
        let mut scan = Self::default();
        for line in dump.lines() {
            scan.scan_line(line);
        }
        scan
    }

    fn scan_line(&mut self, line: &str) {
        if let Some(arch) = capture(&ARCHITECTURE, line, 1) {
            self.architecture = Some(arch);
        }
        if let Some(backend) = capture(&SCRIPTING_BACKEND, line, 1) {
            self.scripting_backend = Some(backend);
        }
        if let Some(caps) = ENGINE_VERSION.captures(line) {
            self.unity_version = Some(caps[1].trim().to_string());
            self.changeset = Some(caps[2].trim().to_string());
        }
        if let Some(build_type) = capture(&BUILD_TYPE, line, 1) {
            self.build_type = Some(build_type);
        }
        // Graphics markers are ordered so the explicit `Graphics API =` line wins.
        if line.contains("Vulkan API version") {
            self.graphics_api = Some("Vulkan".into());
        }
        if let Some(level) = capture(&GLES_CONTEXT, line, 1) {
            self.graphics_api = Some(level);
        }
        if let Some(api) = capture(&GRAPHICS_API, line, 1) {
            self.graphics_api = Some(api);
        }
        if line.contains(STOP_MARKER) {
            self.stopped = true;
        }
    }
}

fn capture(regex: &Regex, line: &str, group: usize) -> Option<String> {
    let value = regex.captures(line)?.get(group)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Attributes {
    /// Fold a newer dump's findings in; absent fields keep their previous value.
    pub fn merge(&mut self, scan: AttributeScan) {
        let AttributeScan {
            architecture,
            scripting_backend,
            build_type,
            unity_version,
            changeset,
            graphics_api,
            stopped,
        } = scan;
        for (slot, found) in [
            (&mut self.architecture, architecture),
            (&mut self.scripting_backend, scripting_backend),
            (&mut self.build_type, build_type),
            (&mut self.unity_version, unity_version),
            (&mut self.changeset, changeset),
            (&mut self.graphics_api, graphics_api),
        ] {
            if let Some(value) = found {
                *slot = value;
            }
        }
        self.stopped |= stopped;
    }

    #[cfg(test)]
    pub fn from_dump(dump: &str) -> Self {
        let mut attributes = Self::default();
        attributes.merge(AttributeScan::from_dump(dump));
        attributes
    }
}

/// Polls the log until the stop marker appears or the deadline passes.
pub struct AttributeExtractor<'a, D: DeviceChannel + ?Sized> {
    device: &'a D,
    tags: &'a [String],
    interval: Duration,
}

impl<'a, D: DeviceChannel + ?Sized> AttributeExtractor<'a, D> {
    pub fn new(device: &'a D, tags: &'a [String], interval: Duration) -> Self {
        Self {
            device,
            tags,
            interval,
        }
    }

    /// Never fails: unreadable dumps are skipped and unresolved fields stay `UNKNOWN`.
    pub fn extract(&self, deadline: Instant) -> Attributes {
        let mut attributes = Attributes::default();
        loop {
            match self.device.dump_log(self.tags) {
                Ok(raw) => {
                    let dump = String::from_utf8_lossy(&raw);
                    attributes.merge(AttributeScan::from_dump(&dump));
                }
                Err(err) => warn!(error = %err, "log dump failed while reading attributes"),
            }
            if attributes.stopped {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.interval.min(deadline - now));
        }
        debug!(
            architecture = %attributes.architecture,
            scripting_backend = %attributes.scripting_backend,
            graphics_api = %attributes.graphics_api,
            stopped = attributes.stopped,
            "attribute extraction finished"
        );
        attributes
    }
}
