//! YAML configuration and file watching for hot reload.

use crate::control::OverlayContext;
use crate::error::{CrtError, Result};
use crate::shader::uniforms::CrtParams;
use crate::shader::GpuDevice;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{error, info, warn};

/// A named uniform value from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniformOverride {
    Int(i32),
    Float(f32),
}

/// Overlay settings as read from YAML.
///
/// ```yaml
/// display: 1
/// shader: shaders/crt.wgsl
/// fps: 60
/// effect:
///   mask_type: slot_mask
///   scanline_weight: 5.0
/// uniforms:
///   curvature: 0.1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display to capture; the main display when absent
    pub display: Option<u32>,
    /// Shader file; the built-in CRT effect when absent
    pub shader: Option<PathBuf>,
    /// Capture rate
    pub fps: u32,
    /// Watch the shader and config files and apply edits live
    pub hot_reload: bool,
    pub effect: CrtParams,
    /// Extra named uniforms for custom shaders
    pub uniforms: BTreeMap<String, UniformOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display: None,
            shader: None,
            fps: 60,
            hot_reload: true,
            effect: CrtParams::default(),
            uniforms: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| CrtError::Config(e.to_string()))
    }

    /// Reads a config file. A relative shader path is resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| CrtError::io(path, e))?;
        let mut config = Self::from_yaml(&text)?;
        if let (Some(shader), Some(dir)) = (&config.shader, path.parent()) {
            if shader.is_relative() {
                config.shader = Some(dir.join(shader));
            }
        }
        Ok(config)
    }

    /// Pushes the effect block and named overrides into a running context.
    pub fn apply<D: GpuDevice>(&self, context: &OverlayContext<D>) {
        context.update_uniforms(self.effect);
        for (name, value) in &self.uniforms {
            match *value {
                UniformOverride::Int(v) => context.set_uniform_int(name, v),
                UniformOverride::Float(v) => context.set_uniform_float(name, v),
            }
        }
    }
}

/// Reports modifications of one file.
///
/// Watches the parent directory so editors that replace the file on save
/// are still seen.
pub struct FileWatcher {
    path: PathBuf,
    file_name: OsString,
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| CrtError::Config(format!("{} is not a file path", path.display())))?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())
            .map_err(|e| CrtError::Config(format!("Failed to create file watcher: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| CrtError::Config(format!("Failed to watch {}: {e}", dir.display())))?;
        info!("Watching {:?} for changes", path);

        Ok(Self {
            path,
            file_name,
            _watcher: watcher,
            rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drains pending events; true if any touched the watched file.
    pub fn changed(&self) -> bool {
        let mut changed = false;
        while let Ok(res) = self.rx.try_recv() {
            match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
                    if relevant && event.paths.iter().any(|p| p.file_name() == Some(self.file_name.as_os_str())) {
                        changed = true;
                    }
                }
                Err(e) => warn!("File watch error: {}", e),
            }
        }
        changed
    }
}

/// Reloads the config file when it changes.
pub struct ConfigWatcher {
    watcher: FileWatcher,
    current: Config,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, current: Config) -> Result<Self> {
        Ok(Self {
            watcher: FileWatcher::new(path)?,
            current,
        })
    }

    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Returns `(old, new)` when the file changed and still parses.
    pub fn check_for_changes(&mut self) -> Option<(Config, Config)> {
        if !self.watcher.changed() {
            return None;
        }
        info!("Config file changed, reloading");
        match Config::load(self.watcher.path()) {
            Ok(new) if new != self.current => {
                let old = std::mem::replace(&mut self.current, new.clone());
                Some((old, new))
            }
            Ok(_) => None,
            Err(e) => {
                error!("Keeping previous config: {}", e);
                None
            }
        }
    }
}
