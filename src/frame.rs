//! Captured frame types, content-rectangle math and the presentation quad.

use bytemuck::{Pod, Zeroable};
use std::time::Instant;

/// Pixel layouts delivered by capture backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA with 8 bits per channel, the native layout of most desktop compositors
    Bgra,
    /// RGBA with 8 bits per channel
    Rgba,
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra | PixelFormat::Rgba => 4,
            PixelFormat::Rgb => 3,
        }
    }
}

/// Region of a captured buffer holding valid pixels, in logical points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ContentRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering a whole `width` x `height` pixel buffer at `scale`.
    pub fn full(width: u32, height: u32, scale: f32) -> Self {
        let scale = sanitize_scale(scale);
        Self::new(0.0, 0.0, width as f32 / scale, height as f32 / scale)
    }
}

/// Integer pixel rectangle inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A frame as seen by the delivery handler.
///
/// Borrowed from the capture backend for the duration of one handler call;
/// anything that needs the pixels afterwards has to copy or upload them.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * bytes_per_pixel`
    pub stride: u32,
    pub format: PixelFormat,
    pub content_rect: ContentRect,
    /// Device pixels per logical point
    pub scale_factor: f32,
}

impl<'a> CapturedFrame<'a> {
    /// True if `data` is large enough for the declared geometry.
    pub fn is_well_formed(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let row = self.width as usize * self.format.bytes_per_pixel();
        let stride = self.stride as usize;
        stride >= row && self.data.len() >= stride * (self.height as usize - 1) + row
    }

    /// The content rectangle in buffer pixels, clamped to the buffer.
    ///
    /// Falls back to the whole buffer when the rectangle is empty or not finite.
    pub fn content_pixels(&self) -> PixelRect {
        let full = PixelRect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        };
        let scale = sanitize_scale(self.scale_factor);
        let r = self.content_rect;
        if ![r.x, r.y, r.width, r.height].iter().all(|v| v.is_finite()) {
            return full;
        }

        let x0 = (r.x * scale).round().clamp(0.0, self.width as f32) as u32;
        let y0 = (r.y * scale).round().clamp(0.0, self.height as f32) as u32;
        let x1 = ((r.x + r.width) * scale).round().clamp(0.0, self.width as f32) as u32;
        let y1 = ((r.y + r.height) * scale).round().clamp(0.0, self.height as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return full;
        }

        PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// Copies the visible `width` x `height` pixels into a tightly packed RGBA buffer.
    pub fn to_rgba(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let bpp = self.format.bytes_per_pixel();
        let stride = self.stride as usize;
        let mut rgba = vec![0u8; width * height * 4];

        for y in 0..height {
            let src = &self.data[y * stride..y * stride + width * bpp];
            let dst = &mut rgba[y * width * 4..(y + 1) * width * 4];
            match self.format {
                PixelFormat::Rgba => dst.copy_from_slice(src),
                PixelFormat::Bgra => {
                    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                        d[0] = s[2];
                        d[1] = s[1];
                        d[2] = s[0];
                        d[3] = s[3];
                    }
                }
                PixelFormat::Rgb => {
                    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                        d[..3].copy_from_slice(s);
                        d[3] = 255;
                    }
                }
            }
        }
        rgba
    }
}

/// A frame owned by a producer while it waits in the delivery slot.
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub content_rect: ContentRect,
    pub scale_factor: f32,
    pub captured_at: Instant,
}

impl OwnedFrame {
    /// Creates a tightly packed frame whose content rectangle covers the whole buffer.
    pub fn packed(width: u32, height: u32, format: PixelFormat, scale_factor: f32, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            content_rect: ContentRect::full(width, height, scale_factor),
            scale_factor,
            captured_at: Instant::now(),
        }
    }

    /// Creates a black frame of the given size.
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        let size = width as usize * height as usize * format.bytes_per_pixel();
        Self::packed(width, height, format, 1.0, vec![0; size])
    }

    pub fn view(&self) -> CapturedFrame<'_> {
        CapturedFrame {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            content_rect: self.content_rect,
            scale_factor: self.scale_factor,
        }
    }
}

fn sanitize_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}

/// Vertex for rendering the presentation quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

/// Where the content rectangle lands on the target, letterboxed to keep its aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    /// Half extents of the drawn quad in normalized device coordinates (1.0 = full axis)
    pub extent: [f32; 2],
    /// Texture coordinates of the content rectangle: `[u0, v0, u1, v1]`
    pub uv: [f32; 4],
}

impl Placement {
    /// Fits `frame`'s content rectangle into a `target_width` x `target_height` drawable.
    pub fn fit(frame: &CapturedFrame<'_>, target_width: u32, target_height: u32) -> Self {
        let content = frame.content_pixels();
        let (fw, fh) = (frame.width as f32, frame.height as f32);
        let uv = [
            content.x as f32 / fw,
            content.y as f32 / fh,
            (content.x + content.width) as f32 / fw,
            (content.y + content.height) as f32 / fh,
        ];

        let (tw, th) = (target_width.max(1) as f32, target_height.max(1) as f32);
        let (cw, ch) = (content.width as f32, content.height as f32);
        let scale = (tw / cw).min(th / ch);
        let extent = [((cw * scale) / tw).min(1.0), ((ch * scale) / th).min(1.0)];

        Self { extent, uv }
    }

    pub fn vertices(&self) -> [QuadVertex; 4] {
        let [sx, sy] = self.extent;
        let [u0, v0, u1, v1] = self.uv;
        [
            QuadVertex { position: [-sx, -sy], tex_coords: [u0, v1] },
            QuadVertex { position: [sx, -sy], tex_coords: [u1, v1] },
            QuadVertex { position: [sx, sy], tex_coords: [u1, v0] },
            QuadVertex { position: [-sx, sy], tex_coords: [u0, v0] },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(width: u32, height: u32, rect: ContentRect, scale: f32) -> OwnedFrame {
        let mut frame = OwnedFrame::blank(width, height, PixelFormat::Bgra);
        frame.content_rect = rect;
        frame.scale_factor = scale;
        frame
    }

    #[test]
    fn test_rgb_to_rgba_conversion() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = OwnedFrame::packed(2, 2, PixelFormat::Rgb, 1.0, rgb_data);
        let rgba = frame.view().to_rgba();

        assert_eq!(rgba.len(), 16);
        assert_eq!(&rgba[0..4], &[255, 0, 0, 255]);
        assert_eq!(&rgba[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_bgra_with_row_padding_to_rgba() {
        // 1x2 image, stride 8 (4 bytes of padding per row)
        let data = vec![10, 20, 30, 40, 0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0];
        let mut frame = OwnedFrame::packed(1, 2, PixelFormat::Bgra, 1.0, data);
        frame.stride = 8;

        assert!(frame.view().is_well_formed());
        assert_eq!(frame.view().to_rgba(), vec![30, 20, 10, 40, 3, 2, 1, 4]);
    }

    #[test]
    fn test_short_buffer_is_not_well_formed() {
        let mut frame = OwnedFrame::blank(4, 4, PixelFormat::Rgba);
        frame.data.truncate(20);
        assert!(!frame.view().is_well_formed());
    }

    #[test]
    fn test_content_pixels_applies_scale() {
        // Retina-style: 1440x900 points captured into an over-allocated 3000x1900 buffer
        let frame = frame_with(3000, 1900, ContentRect::new(0.0, 0.0, 1440.0, 900.0), 2.0);
        assert_eq!(
            frame.view().content_pixels(),
            PixelRect { x: 0, y: 0, width: 2880, height: 1800 }
        );
    }

    #[test]
    fn test_invalid_content_rect_falls_back_to_full_buffer() {
        let frame = frame_with(640, 480, ContentRect::new(0.0, 0.0, f32::NAN, 10.0), 1.0);
        assert_eq!(frame.view().content_pixels().width, 640);

        let frame = frame_with(640, 480, ContentRect::new(700.0, 0.0, 10.0, 10.0), 1.0);
        assert_eq!(frame.view().content_pixels().height, 480);
    }

    #[test]
    fn test_placement_matching_aspect_fills_target() {
        let frame = frame_with(1920, 1080, ContentRect::full(1920, 1080, 1.0), 1.0);
        let placement = Placement::fit(&frame.view(), 1280, 720);
        assert_eq!(placement.extent, [1.0, 1.0]);
        assert_eq!(placement.uv, [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_placement_crops_padding_and_letterboxes() {
        // 4:3 content inside a padded buffer, shown on a 16:9 target
        let frame = frame_with(1100, 800, ContentRect::new(0.0, 0.0, 1024.0, 768.0), 1.0);
        let placement = Placement::fit(&frame.view(), 1920, 1080);

        assert!((placement.uv[2] - 1024.0 / 1100.0).abs() < 1e-6);
        assert!((placement.uv[3] - 768.0 / 800.0).abs() < 1e-6);
        assert!((placement.extent[0] - 0.75).abs() < 1e-6);
        assert_eq!(placement.extent[1], 1.0);
    }

    #[test]
    fn test_placement_vertices_flip_v() {
        let placement = Placement { extent: [1.0, 0.5], uv: [0.0, 0.0, 1.0, 1.0] };
        let v = placement.vertices();
        assert_eq!(v[0], QuadVertex { position: [-1.0, -0.5], tex_coords: [0.0, 1.0] });
        assert_eq!(v[2], QuadVertex { position: [1.0, 0.5], tex_coords: [1.0, 0.0] });
    }
}
