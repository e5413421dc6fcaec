//! GPU shader pipeline: shader sources, the device seam, and the wgpu backend.

pub mod compiler;
mod gpu_context;
pub mod uniforms;
mod wgpu_pipeline;

pub use gpu_context::GpuContext;
pub use wgpu_pipeline::{FrameTexture, SurfaceTarget, WgpuDevice, WgpuProgram};

use crate::error::{CrtError, Result};
use crate::frame::{CapturedFrame, Placement};
use std::path::{Path, PathBuf};
use uniforms::UniformLayout;

/// The shipped CRT effect.
pub const CRT_SHADER: &str = include_str!("../../shaders/crt.wgsl");

/// Samples the input unchanged.
pub const PASSTHROUGH_SHADER: &str = r#"
@group(0) @binding(0) var t_texture: texture_2d<f32>;
@group(0) @binding(1) var s_sampler: sampler;

@fragment
fn fs_main(@location(0) tex_coords: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(t_texture, s_sampler, tex_coords);
}
"#;

/// Solid orange, for checking that the overlay window composites at all.
pub const TEST_CARD_SHADER: &str = r#"
@fragment
fn fs_main(@location(0) tex_coords: vec2<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.5, 0.0, 1.0);
}
"#;

/// Source languages the compiler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderLanguage {
    /// WGSL, fragment entry point `fs_main`
    Wgsl,
    /// GLSL 450 fragment shader, entry point `main`
    Glsl,
}

impl ShaderLanguage {
    pub fn fragment_entry_point(self) -> &'static str {
        match self {
            ShaderLanguage::Wgsl => "fs_main",
            ShaderLanguage::Glsl => "main",
        }
    }

    /// Picks the language from a file extension, defaulting to WGSL.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("glsl" | "frag" | "fs") => ShaderLanguage::Glsl,
            _ => ShaderLanguage::Wgsl,
        }
    }
}

/// Shader source with language specification.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderSource {
    pub language: ShaderLanguage,
    pub code: String,
    /// File the code was read from, if any
    pub origin: Option<PathBuf>,
}

impl ShaderSource {
    pub fn wgsl(code: impl Into<String>) -> Self {
        Self {
            language: ShaderLanguage::Wgsl,
            code: code.into(),
            origin: None,
        }
    }

    pub fn glsl(code: impl Into<String>) -> Self {
        Self {
            language: ShaderLanguage::Glsl,
            code: code.into(),
            origin: None,
        }
    }

    /// Reads a shader file; the extension selects the language.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let code = std::fs::read_to_string(path).map_err(|e| CrtError::io(path, e))?;
        Ok(Self {
            language: ShaderLanguage::from_path(path),
            code,
            origin: Some(path.to_path_buf()),
        })
    }

    /// Short name for logs.
    pub fn label(&self) -> String {
        match &self.origin {
            Some(path) => path.display().to_string(),
            None => format!("<inline {:?}>", self.language),
        }
    }
}

/// A compiled program the engine can make active.
pub trait CompiledProgram: Send + Sync {
    /// Where each uniform lives in this program's uniform buffer.
    fn uniform_layout(&self) -> &UniformLayout;
}

/// A drawable the engine renders into.
pub trait RenderTarget {
    /// Current size in pixels. Read every frame; may change between calls.
    fn size(&self) -> (u32, u32);
}

/// Everything one frame's pass binds.
pub struct FramePass<'a, P, T> {
    pub program: &'a P,
    /// Uniform buffer contents packed for `program`'s layout
    pub uniforms: &'a [u8],
    pub texture: &'a T,
    pub placement: Placement,
}

/// GPU capabilities the render engine needs.
///
/// `compile` runs on the control thread while `import_frame`/`render` run on
/// the delivery thread, so implementations must tolerate both concurrently.
pub trait GpuDevice: Send + Sync + 'static {
    type Program: CompiledProgram + 'static;
    type Texture;
    type Target: RenderTarget + Send + 'static;

    /// Compiles `source` into a program. Never touches the active program.
    fn compile(&self, source: &ShaderSource) -> Result<Self::Program>;

    /// Uploads the frame's pixels; the frame is not read after this returns.
    fn import_frame(&self, frame: &CapturedFrame<'_>) -> Result<Self::Texture>;

    /// Draws `pass` over the full target and presents it.
    fn render(&self, pass: FramePass<'_, Self::Program, Self::Texture>, target: &mut Self::Target) -> Result<()>;

    /// True once the backend has reported the device as lost.
    fn is_lost(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_extension() {
        assert_eq!(ShaderLanguage::from_path(Path::new("crt.frag")), ShaderLanguage::Glsl);
        assert_eq!(ShaderLanguage::from_path(Path::new("crt.wgsl")), ShaderLanguage::Wgsl);
        assert_eq!(ShaderLanguage::from_path(Path::new("crt")), ShaderLanguage::Wgsl);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ShaderSource::from_file("/nonexistent/crt.wgsl").unwrap_err();
        assert!(matches!(err, CrtError::Io { .. }));
    }

    #[test]
    fn test_builtin_shaders_compile() {
        for code in [CRT_SHADER, PASSTHROUGH_SHADER, TEST_CARD_SHADER] {
            compiler::check(&ShaderSource::wgsl(code)).unwrap();
        }
    }
}
