//! Worker process launch specification.
//!
//! A launch spec is the full recipe for starting one interpreter worker:
//! program, fixed startup arguments, working directory, extra environment
//! and the installation directories that must be prepended to the platform
//! library search path so dynamic libraries resolve correctly.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

/// Immutable description of how to start a worker process. Used as part of
/// the pool key, so equality and hash are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub library_paths: Vec<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            library_paths: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Installation directory to prepend to the platform library search
    /// path of the spawned process.
    pub fn with_library_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.library_paths.push(dir.into());
        self
    }

    /// Name of the platform-specific dynamic library search variable.
    pub fn library_search_var() -> &'static str {
        if cfg!(target_os = "windows") {
            "PATH"
        } else if cfg!(target_os = "macos") {
            "DYLD_LIBRARY_PATH"
        } else {
            "LD_LIBRARY_PATH"
        }
    }

    /// Search-path value with our installation directories in front of the
    /// inherited value, if any prefixing is configured.
    fn search_path_value(&self) -> Option<OsString> {
        if self.library_paths.is_empty() {
            return None;
        }
        let separator = if cfg!(target_os = "windows") { ";" } else { ":" };
        let mut value = OsString::new();
        for (i, dir) in self.library_paths.iter().enumerate() {
            if i > 0 {
                value.push(separator);
            }
            value.push(dir.as_os_str());
        }
        if let Some(inherited) = std::env::var_os(Self::library_search_var()) {
            if !inherited.is_empty() {
                value.push(separator);
                value.push(inherited);
            }
        }
        Some(value)
    }

    /// Build the ready-to-spawn command: piped stdio (stdin/stdout carry the
    /// framed protocol, stderr carries out-of-band chatter) and the library
    /// search path prefixed.
    pub(crate) fn command(&self, extra_args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(search_path) = self.search_path_value() {
            cmd.env(Self::library_search_var(), search_path);
        }
        cmd
    }
}
