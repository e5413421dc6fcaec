//! The render engine: shader hot-swap, uniform snapshots and the per-frame pass.

mod telemetry;

pub use telemetry::{Clock, SystemClock, Telemetry, TelemetrySnapshot};

use crate::error::{CrtError, Result};
use crate::frame::{CapturedFrame, Placement};
use crate::shader::uniforms::{CrtParams, UniformLayout, UniformState, UniformValue};
use crate::shader::{CompiledProgram, FramePass, GpuDevice, RenderTarget, ShaderSource};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a frame was not presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No program has compiled yet
    NotReady,
    /// The target reported a zero width or height
    EmptyTarget,
    /// Texture import or drawable acquisition failed for this frame
    Resource,
    /// The device is gone; every later frame drops too
    DeviceLost,
}

/// Result of one `process_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    Dropped(DropReason),
}

/// Owns the GPU device, the active program and the uniform block.
///
/// Control-thread calls (`load_shader_*`, `set_uniform_*`) and delivery-thread
/// calls (`process_frame`) may overlap. A frame reads the active program once
/// at the top of its pass, so a swap lands between frames.
pub struct RenderEngine<D: GpuDevice> {
    device: D,
    active: RwLock<Option<Arc<D::Program>>>,
    last_good: Mutex<Option<ShaderSource>>,
    compile_lock: Mutex<()>,
    uniforms: Mutex<UniformState>,
    // Snapshot the previous frame rendered with; only the delivery thread locks it
    frame_uniforms: Mutex<UniformState>,
    telemetry: Telemetry,
    clock: Arc<dyn Clock>,
    lost: AtomicBool,
}

impl<D: GpuDevice> RenderEngine<D> {
    pub fn new(device: D) -> Self {
        Self::with_clock(device, Arc::new(SystemClock))
    }

    /// Creates an engine whose telemetry timestamps come from `clock`.
    pub fn with_clock(device: D, clock: Arc<dyn Clock>) -> Self {
        Self {
            device,
            active: RwLock::new(None),
            last_good: Mutex::new(None),
            compile_lock: Mutex::new(()),
            uniforms: Mutex::new(UniformState::default()),
            frame_uniforms: Mutex::new(UniformState::default()),
            telemetry: Telemetry::new(),
            clock,
            lost: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// True once a program has compiled, and until the device is lost.
    pub fn is_ready(&self) -> bool {
        !self.is_lost() && self.active.read().is_some()
    }

    pub fn is_lost(&self) -> bool {
        if self.lost.load(Ordering::Acquire) {
            return true;
        }
        if self.device.is_lost() {
            self.lost.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Compiles `source` and makes it the active program.
    ///
    /// On failure the previously active program keeps rendering.
    pub fn load_shader_from_source(&self, source: ShaderSource) -> Result<()> {
        if self.is_lost() {
            return Err(CrtError::DeviceLost("cannot compile on a lost device".into()));
        }

        let _compiling = self.compile_lock.lock();
        let program = match self.device.compile(&source) {
            Ok(program) => program,
            Err(e) => {
                warn!("Shader {} failed to compile, keeping the active program: {}", source.label(), e);
                return Err(e);
            }
        };

        *self.active.write() = Some(Arc::new(program));
        info!("Activated shader {}", source.label());
        *self.last_good.lock() = Some(source);
        Ok(())
    }

    /// Reads and compiles a shader file; the extension selects WGSL or GLSL.
    pub fn load_shader_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let source = ShaderSource::from_file(path)?;
        self.load_shader_from_source(source)
    }

    /// Recompiles the most recently successful shader.
    ///
    /// File-backed shaders are re-read first. If the file no longer reads or
    /// compiles, the cached text that last compiled is used instead.
    pub fn reload_shader(&self) -> Result<()> {
        let cached = self.last_good.lock().clone().ok_or(CrtError::NoSourceToReload)?;

        if let Some(path) = &cached.origin {
            match ShaderSource::from_file(path).and_then(|fresh| self.load_shader_from_source(fresh)) {
                Ok(()) => return Ok(()),
                Err(e @ CrtError::DeviceLost(_)) => return Err(e),
                Err(e) => warn!("Reload of {} failed ({}), restoring last good source", path.display(), e),
            }
        }
        self.load_shader_from_source(cached)
    }

    /// Replaces the whole parameter block. Named overrides are kept.
    pub fn update_uniforms(&self, params: CrtParams) {
        self.uniforms.lock().params = params;
    }

    pub fn uniforms(&self) -> CrtParams {
        self.uniforms.lock().params
    }

    /// Sets one named uniform. Unknown names are ignored.
    pub fn set_uniform_float(&self, name: &str, value: f32) {
        self.set_uniform(name, UniformValue::Float(value));
    }

    /// Sets one named uniform. Unknown names and out-of-range mask types are ignored.
    pub fn set_uniform_int(&self, name: &str, value: i32) {
        self.set_uniform(name, UniformValue::Int(value));
    }

    fn set_uniform(&self, name: &str, value: UniformValue) {
        let active = self.active.read().clone();
        let layout = active.as_deref().map(|program| program.uniform_layout());
        if !self.uniforms.lock().set_named(name, value, layout) {
            debug!("Ignoring uniform {} = {:?}", name, value);
        }
    }

    /// Renders one captured frame into `target` and presents it.
    ///
    /// Never blocks on the control thread and never retains `frame`.
    pub fn process_frame(&self, frame: &CapturedFrame<'_>, target: &mut D::Target) -> FrameOutcome {
        let received = self.clock.now();

        if self.is_lost() {
            return self.drop_frame(DropReason::DeviceLost);
        }
        let Some(program) = self.active.read().clone() else {
            return self.drop_frame(DropReason::NotReady);
        };
        let (width, height) = target.size();
        if width == 0 || height == 0 {
            return self.drop_frame(DropReason::EmptyTarget);
        }

        let uniforms = self.snapshot_uniforms(program.uniform_layout());

        let texture = match self.device.import_frame(frame) {
            Ok(texture) => texture,
            Err(e) => return self.fail_frame(e),
        };

        let pass = FramePass {
            program: &*program,
            uniforms: &uniforms,
            texture: &texture,
            placement: Placement::fit(frame, width, height),
        };
        if let Err(e) = self.device.render(pass, target) {
            return self.fail_frame(e);
        }

        let presented = self.clock.now();
        self.telemetry.record_presented(received, presented);
        debug!(
            "Presented {}x{} frame in {:.2}ms",
            frame.width,
            frame.height,
            presented.saturating_duration_since(received).as_secs_f32() * 1000.0
        );
        FrameOutcome::Presented
    }

    /// Packs this frame's uniforms, reusing the previous frame's values if an
    /// update is in progress.
    fn snapshot_uniforms(&self, layout: &UniformLayout) -> Vec<u8> {
        let mut snapshot = self.frame_uniforms.lock();
        if let Some(current) = self.uniforms.try_lock() {
            snapshot.clone_from(&current);
        }
        snapshot.pack(layout)
    }

    fn fail_frame(&self, err: CrtError) -> FrameOutcome {
        match err {
            CrtError::DeviceLost(msg) => {
                if !self.lost.swap(true, Ordering::AcqRel) {
                    error!("Rendering disabled, GPU device lost: {}", msg);
                }
                self.drop_frame(DropReason::DeviceLost)
            }
            other => {
                warn!("Dropped frame: {}", other);
                self.drop_frame(DropReason::Resource)
            }
        }
    }

    fn drop_frame(&self, reason: DropReason) -> FrameOutcome {
        self.telemetry.record_dropped();
        FrameOutcome::Dropped(reason)
    }

    /// Frames per second; 0 before the first frame.
    pub fn current_fps(&self) -> f32 {
        self.telemetry.fps()
    }

    /// Smoothed latency in milliseconds; 0 before the first frame.
    pub fn current_latency_ms(&self) -> f32 {
        self.telemetry.latency_ms()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }
}
