//! wgpu implementation of the GPU device seam.

use super::compiler::{self, SAMPLER_BINDING, TEXTURE_BINDING, UNIFORM_BINDING};
use super::uniforms::UniformLayout;
use super::{CompiledProgram, FramePass, GpuContext, GpuDevice, RenderTarget, ShaderSource};
use crate::error::{CrtError, Result};
use crate::frame::{CapturedFrame, PixelFormat, QuadVertex};
use crate::surface::SharedSize;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info};
use naga::valid::Capabilities;
use wgpu::util::DeviceExt;

/// Vertex stage shared by every program: the presentation quad.
const VERTEX_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Shader capabilities backed by the device's enabled features.
fn shader_capabilities(features: wgpu::Features) -> Capabilities {
    let mut capabilities = Capabilities::default();
    let mapping = [
        (wgpu::Features::SHADER_F64, Capabilities::FLOAT64),
        (wgpu::Features::SHADER_INT64, Capabilities::SHADER_INT64),
        (wgpu::Features::SHADER_F16, Capabilities::SHADER_FLOAT16),
        (wgpu::Features::SHADER_PRIMITIVE_INDEX, Capabilities::PRIMITIVE_INDEX),
        (wgpu::Features::DUAL_SOURCE_BLENDING, Capabilities::DUAL_SOURCE_BLENDING),
    ];
    for (feature, capability) in mapping {
        if features.contains(feature) {
            capabilities |= capability;
        }
    }
    capabilities
}

/// A linked render pipeline plus the uniform buffer sized for its layout.
pub struct WgpuProgram {
    pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
    layout: UniformLayout,
}

impl CompiledProgram for WgpuProgram {
    fn uniform_layout(&self) -> &UniformLayout {
        &self.layout
    }
}

/// Input texture reused across frames of the same size and format.
pub struct FrameTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

impl FrameTexture {
    fn matches(&self, width: u32, height: u32, format: wgpu::TextureFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

/// The overlay window's swapchain.
pub struct SurfaceTarget {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    size: SharedSize,
}

impl SurfaceTarget {
    /// Configures `surface` for presenting with a non-sRGB format and a
    /// transparent-capable alpha mode where the platform offers one.
    pub fn new(ctx: &GpuContext, surface: wgpu::Surface<'static>, size: SharedSize) -> Self {
        let caps = surface.get_capabilities(&ctx.adapter);
        // Gamma is applied by the shader's output_gamma
        let format = caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0]);
        let alpha_mode = caps
            .alpha_modes
            .iter()
            .find(|m| {
                matches!(
                    m,
                    wgpu::CompositeAlphaMode::PreMultiplied | wgpu::CompositeAlphaMode::PostMultiplied
                )
            })
            .copied()
            .unwrap_or(caps.alpha_modes[0]);

        let (width, height) = size.get();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&ctx.device, &config);
        info!("Surface configured: {}x{} {:?} {:?}", config.width, config.height, format, alpha_mode);

        Self { surface, config, size }
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    /// Reconfigures the swapchain if the window size changed since the last frame.
    fn sync_size(&mut self, device: &wgpu::Device) {
        let (width, height) = self.size.get();
        if width > 0 && height > 0 && (width != self.config.width || height != self.config.height) {
            debug!("Surface resized to {}x{}", width, height);
            self.config.width = width;
            self.config.height = height;
            self.surface.configure(device, &self.config);
        }
    }
}

impl RenderTarget for SurfaceTarget {
    fn size(&self) -> (u32, u32) {
        self.size.get()
    }
}

/// GPU device seam backed by wgpu.
pub struct WgpuDevice {
    ctx: GpuContext,
    target_format: wgpu::TextureFormat,
    vertex_module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    input: Mutex<Option<Arc<FrameTexture>>>,
}

impl WgpuDevice {
    /// Creates the fixed pipeline state; programs compiled later render into `target_format`.
    pub fn new(ctx: GpuContext, target_format: wgpu::TextureFormat) -> Self {
        let device = &ctx.device;

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Quad Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: TEXTURE_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: SAMPLER_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: UNIFORM_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("CRT Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let vertex_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Quad Vertex Buffer"),
            size: (std::mem::size_of::<QuadVertex>() * 4) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Self {
            ctx,
            target_format,
            vertex_module,
            bind_group_layout,
            pipeline_layout,
            vertex_buffer,
            index_buffer,
            sampler,
            input: Mutex::new(None),
        }
    }

    /// Returns the cached input texture, recreating it if the frame geometry changed.
    fn input_texture(&self, width: u32, height: u32, format: wgpu::TextureFormat) -> Arc<FrameTexture> {
        let mut cache = self.input.lock();
        if let Some(texture) = cache.as_ref().filter(|t| t.matches(width, height, format)) {
            return Arc::clone(texture);
        }

        info!("Creating input texture ({}x{}, {:?})", width, height, format);
        let texture = self.ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Captured Frame Texture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let entry = Arc::new(FrameTexture {
            texture,
            view,
            width,
            height,
            format,
        });
        *cache = Some(Arc::clone(&entry));
        entry
    }
}

impl GpuDevice for WgpuDevice {
    type Program = WgpuProgram;
    type Texture = Arc<FrameTexture>;
    type Target = SurfaceTarget;

    fn compile(&self, source: &ShaderSource) -> Result<WgpuProgram> {
        let device = &self.ctx.device;
        let checked = compiler::check_with(source, shader_capabilities(device.features()))?;
        let label = source.label();

        // Anything naga accepted but the backend still rejects is reported here
        // instead of reaching the uncaptured-error handler.
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("Fragment Shader {}", label)),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(checked.wgsl)),
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("Render Pipeline {}", label)),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.vertex_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(checked.entry_point),
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.target_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });
        if let Some(e) = pollster::block_on(scope.pop()) {
            return Err(CrtError::Compile(format!("{label}: {e}")));
        }

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Uniform Buffer"),
            size: checked.layout.buffer_size(),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(WgpuProgram {
            pipeline,
            uniform_buffer,
            layout: checked.layout,
        })
    }

    fn import_frame(&self, frame: &CapturedFrame<'_>) -> Result<Arc<FrameTexture>> {
        if !frame.is_well_formed() {
            return Err(CrtError::Resource(format!(
                "frame buffer too small for {}x{} stride {}",
                frame.width, frame.height, frame.stride
            )));
        }
        let max = self.ctx.device.limits().max_texture_dimension_2d;
        if frame.width > max || frame.height > max {
            return Err(CrtError::Resource(format!(
                "frame {}x{} exceeds the {} texel texture limit",
                frame.width, frame.height, max
            )));
        }

        // BGRA and RGBA upload straight from the capture buffer; RGB needs expanding
        let (format, expanded) = match frame.format {
            PixelFormat::Bgra => (wgpu::TextureFormat::Bgra8Unorm, None),
            PixelFormat::Rgba => (wgpu::TextureFormat::Rgba8Unorm, None),
            PixelFormat::Rgb => (wgpu::TextureFormat::Rgba8Unorm, Some(frame.to_rgba())),
        };
        let (data, bytes_per_row) = match &expanded {
            Some(rgba) => (rgba.as_slice(), frame.width * 4),
            None => (frame.data, frame.stride),
        };

        let input = self.input_texture(frame.width, frame.height, format);
        self.ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &input.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(input)
    }

    fn render(&self, pass: FramePass<'_, WgpuProgram, Arc<FrameTexture>>, target: &mut SurfaceTarget) -> Result<()> {
        if self.ctx.is_lost() {
            return Err(CrtError::DeviceLost("device reported lost".into()));
        }
        let device = &self.ctx.device;
        target.sync_size(device);

        let output = match target.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                target.surface.configure(device, &target.config);
                return Err(CrtError::Resource("surface outdated, reconfigured".into()));
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                self.ctx.mark_lost();
                return Err(CrtError::DeviceLost("out of memory acquiring drawable".into()));
            }
            Err(e) => return Err(CrtError::Resource(format!("failed to acquire drawable: {e}"))),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        self.ctx.queue.write_buffer(&pass.program.uniform_buffer, 0, pass.uniforms);
        self.ctx
            .queue
            .write_buffer(&self.vertex_buffer, 0, bytemuck::cast_slice(&pass.placement.vertices()));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: TEXTURE_BINDING,
                    resource: wgpu::BindingResource::TextureView(&pass.texture.view),
                },
                wgpu::BindGroupEntry {
                    binding: SAMPLER_BINDING,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: UNIFORM_BINDING,
                    resource: pass.program.uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("CRT Render Encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("CRT Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&pass.program.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
        }

        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.ctx.is_lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_follow_device_features() {
        assert_eq!(shader_capabilities(wgpu::Features::empty()), Capabilities::default());

        let capabilities = shader_capabilities(wgpu::Features::SHADER_F64 | wgpu::Features::SHADER_PRIMITIVE_INDEX);
        assert!(capabilities.contains(Capabilities::FLOAT64 | Capabilities::PRIMITIVE_INDEX));
        assert!(!capabilities.contains(Capabilities::SHADER_INT64));
    }

    #[test]
    fn test_f64_shader_needs_device_feature() {
        let source = ShaderSource::wgsl(
            "var<private> scale: f64;\n@fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(f32(scale)); }",
        );
        let without = compiler::check_with(&source, shader_capabilities(wgpu::Features::empty()));
        assert!(matches!(without, Err(CrtError::Compile(_))));
        assert!(compiler::check_with(&source, shader_capabilities(wgpu::Features::SHADER_F64)).is_ok());
    }
}
