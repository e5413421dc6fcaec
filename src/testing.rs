//! In-memory stand-ins for the GPU and the clock, shared by unit tests.

use crate::engine::Clock;
use crate::error::{CrtError, Result};
use crate::frame::{CapturedFrame, Placement};
use crate::shader::uniforms::UniformLayout;
use crate::shader::{compiler, CompiledProgram, FramePass, GpuDevice, RenderTarget, ShaderSource};
use crate::surface::PresentationSurface;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

pub struct FakeProgram {
    code: String,
    layout: UniformLayout,
}

impl CompiledProgram for FakeProgram {
    fn uniform_layout(&self) -> &UniformLayout {
        &self.layout
    }
}

pub struct FakeTexture {
    pub width: u32,
    pub height: u32,
}

/// What one successful render saw.
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    /// Source text of the program that drew the frame
    pub program: String,
    pub uniforms: Vec<u8>,
    pub placement: Placement,
    pub frame_size: (u32, u32),
}

/// Render target recording every presented frame.
#[derive(Clone)]
pub struct FakeTarget {
    size: Arc<Mutex<(u32, u32)>>,
    log: Arc<Mutex<Vec<PresentedFrame>>>,
}

impl FakeTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Arc::new(Mutex::new((width, height))),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.size.lock() = (width, height);
    }

    pub fn presented(&self) -> Vec<PresentedFrame> {
        self.log.lock().clone()
    }
}

impl RenderTarget for FakeTarget {
    fn size(&self) -> (u32, u32) {
        *self.size.lock()
    }
}

/// GPU device that validates shaders with naga but renders nothing.
///
/// Each render advances the shared clock by `render_cost`.
pub struct FakeDevice {
    clock: Arc<ManualClock>,
    render_cost: Duration,
    fail_imports: AtomicBool,
    lost: AtomicBool,
    gate: Mutex<()>,
    renders_started: AtomicU64,
}

impl FakeDevice {
    pub fn new(clock: Arc<ManualClock>, render_cost: Duration) -> Self {
        Self {
            clock,
            render_cost,
            fail_imports: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            gate: Mutex::new(()),
            renders_started: AtomicU64::new(0),
        }
    }

    /// Renders block until the returned guard is dropped.
    pub fn hold_renders(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    pub fn renders_started(&self) -> u64 {
        self.renders_started.load(Ordering::SeqCst)
    }

    pub fn fail_imports(&self, fail: bool) {
        self.fail_imports.store(fail, Ordering::SeqCst);
    }

    pub fn lose(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }
}

impl GpuDevice for FakeDevice {
    type Program = FakeProgram;
    type Texture = FakeTexture;
    type Target = FakeTarget;

    fn compile(&self, source: &ShaderSource) -> Result<FakeProgram> {
        let checked = compiler::check(source)?;
        Ok(FakeProgram {
            code: source.code.clone(),
            layout: checked.layout,
        })
    }

    fn import_frame(&self, frame: &CapturedFrame<'_>) -> Result<FakeTexture> {
        if self.fail_imports.load(Ordering::SeqCst) || !frame.is_well_formed() {
            return Err(CrtError::Resource("import refused".into()));
        }
        Ok(FakeTexture {
            width: frame.width,
            height: frame.height,
        })
    }

    fn render(&self, pass: FramePass<'_, FakeProgram, FakeTexture>, target: &mut FakeTarget) -> Result<()> {
        self.renders_started.fetch_add(1, Ordering::SeqCst);
        let _gate = self.gate.lock();
        if self.lost.load(Ordering::SeqCst) {
            return Err(CrtError::DeviceLost("fake device lost".into()));
        }
        self.clock.advance(self.render_cost);
        target.log.lock().push(PresentedFrame {
            program: pass.program.code.clone(),
            uniforms: pass.uniforms.to_vec(),
            placement: pass.placement,
            frame_size: (pass.texture.width, pass.texture.height),
        });
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// Surface that only tracks visibility.
pub struct FakeSurface {
    visible: AtomicBool,
    handle: Option<u64>,
}

impl FakeSurface {
    pub fn new(handle: Option<u64>) -> Self {
        Self {
            visible: AtomicBool::new(true),
            handle,
        }
    }
}

impl PresentationSurface for FakeSurface {
    fn show(&self) {
        self.visible.store(true, Ordering::SeqCst);
    }

    fn hide(&self) {
        self.visible.store(false, Ordering::SeqCst);
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    fn window_handle(&self) -> Option<u64> {
        self.handle
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
