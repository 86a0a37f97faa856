use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;

use crate::runner::ResultSet;

const SEPARATOR: &str = "--------------------------------";

/// Human-readable per-run result file, appended to as the run progresses.
#[derive(Debug, Clone)]
pub struct ResultFile {
    path: PathBuf,
}

impl ResultFile {
    /// Create `<n>_Test_run_<timestamp>.txt` in `device_dir`, numbered after existing runs.
    pub fn create(device_dir: &Path) -> Result<Self> {
        fs::create_dir_all(device_dir).with_context(|| {
            format!("Failed to create result directory {}", device_dir.display())
        })?;
        let previous = fs::read_dir(device_dir)
            .with_context(|| format!("Unable to list {}", device_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "txt"))
            .count();
        let name = format!(
            "{}_Test_run_{}.txt",
            previous + 1,
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let file = Self {
            path: device_dir.join(name),
        };
        file.append("BEGIN")?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cycle(&self, cycle: u32) -> Result<()> {
        self.append(&format!("Cycle {cycle}"))
    }

    pub fn battery_before(&self, build_index: usize, level: Option<u8>) -> Result<()> {
        self.append(&format!(
            "Battery level before test # {build_index} is {}",
            battery(level)
        ))
    }

    pub fn result(&self, build_index: usize, value: &str) -> Result<()> {
        self.append(&format!("Result set {build_index}: {value}"))
    }

    /// Raw values, battery summary, then one labelled block per build.
    pub fn finish(
        &self,
        sets: &[ResultSet],
        battery_start: Option<u8>,
        battery_end: Option<u8>,
    ) -> Result<()> {
        let mut body = String::new();
        for set in sets {
            for value in set.values() {
                body.push_str(&value);
                body.push('\n');
            }
        }
        body.push_str(SEPARATOR);
        body.push('\n');
        body.push_str(&format!("Battery on start {}\n", battery(battery_start)));
        body.push_str(&format!("Battery on finish {}\n", battery(battery_end)));
        for (index, set) in sets.iter().enumerate() {
            body.push_str(&format!("Result set {index}\n"));
            body.push_str(&format!("APK Name:{}\n", set.build.name));
            for value in set.values() {
                body.push_str(&value);
                body.push('\n');
            }
        }
        self.append(body.trim_end())
    }

    fn append(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open result file {}", self.path.display()))?;
        writeln!(file, "{text}")
            .with_context(|| format!("Failed to write result file {}", self.path.display()))
    }
}

fn battery(level: Option<u8>) -> String {
    match level {
        Some(level) => format!("level: {level}"),
        None => "level: unknown".into(),
    }
}
