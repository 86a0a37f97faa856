use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::error::DeviceError;

/// Flags passed to `adb install`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallFlags {
    /// Replace an existing install, keeping its data (`-r`).
    pub reinstall: bool,
    /// Permit a lower version code than the installed one (`-d`).
    pub allow_downgrade: bool,
}

impl InstallFlags {
    pub const REPLACE_ALLOW_DOWNGRADE: Self = Self {
        reinstall: true,
        allow_downgrade: true,
    };

    fn to_args(self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.reinstall {
            args.push("-r");
        }
        if self.allow_downgrade {
            args.push("-d");
        }
        args
    }
}

/// Commands the harness needs from an attached device.
///
/// Every call may fail transiently; callers decide whether to retry via [`with_retry`].
pub trait DeviceChannel: Sync {
    fn clear_app_data(&self, package: &str) -> Result<(), DeviceError>;
    fn install(&self, apk: &Path, flags: InstallFlags) -> Result<(), DeviceError>;
    /// Flush pending writes on the device filesystem.
    fn sync_storage(&self) -> Result<(), DeviceError>;
    fn launch_activity(&self, component: &str) -> Result<(), DeviceError>;
    fn clear_log(&self) -> Result<(), DeviceError>;
    /// Dump the log buffer; an empty tag list dumps every source.
    fn dump_log(&self, tags: &[String]) -> Result<Vec<u8>, DeviceError>;
    fn set_log_buffer_size(&self, size: &str) -> Result<(), DeviceError>;
    fn pull_file(&self, remote_path: &str) -> Result<Vec<u8>, DeviceError>;
    fn remove_file(&self, remote_path: &str) -> Result<(), DeviceError>;
    fn screenshot(&self, remote_path: &str) -> Result<(), DeviceError>;
    fn battery_level(&self) -> Result<Option<u8>, DeviceError>;
    fn serial(&self) -> Result<String, DeviceError>;
}

/// Run `op` up to `attempts` times, returning the first success.
pub fn with_retry<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T, DeviceError>,
) -> Result<T, DeviceError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    command = err.command(),
                    error = %err,
                    "device command failed; retrying"
                );
                attempt += 1;
            }
            Err(err) => {
                return Err(DeviceError::RetriesExhausted {
                    command: err.command().to_string(),
                    attempts,
                    last: Box::new(err),
                });
            }
        }
    }
}

/// Locate the adb binary: explicit path, then the SDK root, then `PATH`.
pub fn resolve_adb_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    let executable = if cfg!(windows) { "adb.exe" } else { "adb" };
    for var in ["ANDROID_SDK_ROOT", "ANDROID_HOME"] {
        if let Ok(root) = env::var(var) {
            let candidate = PathBuf::from(root).join("platform-tools").join(executable);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    if let Ok(path) = which::which("adb") {
        return Ok(path);
    }
    bail!("adb binary not found; set ANDROID_SDK_ROOT or configure adb_path")
}

/// [`DeviceChannel`] backed by the `adb` command-line bridge.
#[derive(Debug, Clone)]
pub struct AdbChannel {
    binary: PathBuf,
    serial: Option<String>,
}

impl AdbChannel {
    pub fn new(binary: PathBuf, serial: Option<String>) -> Self {
        Self { binary, serial }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|arg| arg.to_string()));
        full
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, DeviceError> {
        let args = self.args(args);
        let command = self.describe(&args);
        debug!(command = %command, "running device command");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|source| DeviceError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(DeviceError::Exit {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl DeviceChannel for AdbChannel {
    fn clear_app_data(&self, package: &str) -> Result<(), DeviceError> {
        self.run(&["shell", "pm", "clear", package]).map(drop)
    }

    fn install(&self, apk: &Path, flags: InstallFlags) -> Result<(), DeviceError> {
        let apk = apk.to_string_lossy();
        let mut args = vec!["install"];
        args.extend(flags.to_args());
        args.push(&apk);
        self.run(&args).map(drop)
    }

    fn sync_storage(&self) -> Result<(), DeviceError> {
        self.run(&["shell", "sync"]).map(drop)
    }

    fn launch_activity(&self, component: &str) -> Result<(), DeviceError> {
        self.run(&["shell", "am", "start", "-n", component]).map(drop)
    }

    fn clear_log(&self) -> Result<(), DeviceError> {
        self.run(&["logcat", "-c"]).map(drop)
    }

    fn dump_log(&self, tags: &[String]) -> Result<Vec<u8>, DeviceError> {
        let mut args = vec!["logcat", "-d"];
        if !tags.is_empty() {
            args.push("-s");
            args.extend(tags.iter().map(String::as_str));
        }
        self.run(&args)
    }

    fn set_log_buffer_size(&self, size: &str) -> Result<(), DeviceError> {
        self.run(&["logcat", "-G", size]).map(drop)
    }

    fn pull_file(&self, remote_path: &str) -> Result<Vec<u8>, DeviceError> {
        self.run(&["exec-out", "cat", remote_path])
    }

    fn remove_file(&self, remote_path: &str) -> Result<(), DeviceError> {
        self.run(&["shell", "rm", "-f", remote_path]).map(drop)
    }

    fn screenshot(&self, remote_path: &str) -> Result<(), DeviceError> {
        self.run(&["shell", "screencap", remote_path]).map(drop)
    }

    fn battery_level(&self) -> Result<Option<u8>, DeviceError> {
        let raw = self.run(&["shell", "dumpsys", "battery"])?;
        Ok(parse_battery_level(&String::from_utf8_lossy(&raw)))
    }

    fn serial(&self) -> Result<String, DeviceError> {
        if let Some(serial) = &self.serial {
            return Ok(serial.clone());
        }
        let raw = self.run(&["shell", "getprop", "ro.boot.serialno"])?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

/// Extract `level: NN` from `dumpsys battery` output.
pub fn parse_battery_level(dump: &str) -> Option<u8> {
    dump.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() != "level" {
            return None;
        }
        value.trim().parse().ok()
    })
}
