//! Resolution of the worker's runtime environment: interpreter, script,
//! working directory, and accelerator env vars.
//!
//! Env overrides:
//! - VERSE_PYTHON: Python interpreter (else PATH search for python3/python)
//! - VERSE_WORKER_SCRIPT: worker wrapper script path
//! - VERSE_WORKER_DIR: working directory for the child
//! - VERSE_DEVICE: auto|cpu|cuda|metal (forwarded as KOKORO_DEVICE)

use crate::{Result, SynthError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const DEFAULT_SCRIPT: &str = "kokoro_local/kokoro_wrapper.py";

/// Accelerator preference forwarded to the worker. One supervisor type covers
/// every device; the worker does its own detection under `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DevicePreference {
    pub fn as_env_value(&self) -> &'static str {
        match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Metal => "metal",
        }
    }

    pub fn from_env() -> Self {
        match std::env::var("VERSE_DEVICE").as_deref() {
            Ok("cpu") => DevicePreference::Cpu,
            Ok("cuda") => DevicePreference::Cuda,
            Ok("metal") | Ok("mps") => DevicePreference::Metal,
            _ => DevicePreference::Auto,
        }
    }
}

/// Resolved runtime for spawning the worker process.
#[derive(Clone, Debug)]
pub struct WorkerRuntime {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub working_dir: PathBuf,
    /// Extra environment passed to the child (model cache paths etc.).
    pub extra_env: Vec<(String, String)>,
}

impl WorkerRuntime {
    /// Validate that the interpreter and script actually exist; a missing
    /// runtime must fail fast here, not at first synthesis.
    pub fn new(interpreter: PathBuf, script: PathBuf, working_dir: PathBuf) -> Result<Self> {
        if !interpreter.exists() {
            return Err(SynthError::Runtime(format!(
                "worker interpreter not found at {}",
                interpreter.display()
            )));
        }
        if !script.exists() {
            return Err(SynthError::Runtime(format!(
                "worker script not found at {}",
                script.display()
            )));
        }
        Ok(Self {
            interpreter,
            script,
            working_dir,
            extra_env: Vec::new(),
        })
    }

    pub fn from_env() -> Result<Self> {
        let interpreter = std::env::var("VERSE_PYTHON")
            .map(PathBuf::from)
            .ok()
            .filter(|p| p.exists())
            .or_else(|| find_in_path("python3"))
            .or_else(|| find_in_path("python"))
            .ok_or_else(|| {
                SynthError::Runtime(
                    "no Python interpreter found; set VERSE_PYTHON or install python3".into(),
                )
            })?;

        let script = std::env::var("VERSE_WORKER_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SCRIPT));

        let working_dir = std::env::var("VERSE_WORKER_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        Self::new(interpreter, script, working_dir)
    }

    /// Build the spawn command: piped stdio, unbuffered child output, device
    /// preference exported for the worker's own detection logic.
    pub fn command(&self, device: DevicePreference) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&self.script)
            .current_dir(&self.working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .env("KOKORO_DEVICE", device.as_env_value())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.extra_env {
            cmd.env(k, v);
        }
        cmd
    }
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = Path::new(bin);
        return p.exists().then(|| p.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.exists())
}
