//! Shared GPU context for wgpu resources.

use crate::error::{CrtError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use winit::window::Window;

/// GPU device, queue and the objects they came from.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    /// Initializes a device able to present to `window` and returns the window's surface.
    pub fn with_surface(window: Arc<Window>) -> Result<(Self, wgpu::Surface<'static>)> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| CrtError::Unready(format!("Failed to create surface: {e}")))?;

        let context = Self::request(instance, &surface)?;
        Ok((context, surface))
    }

    fn request(instance: wgpu::Instance, surface: &wgpu::Surface<'static>) -> Result<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| CrtError::Unready(format!("Failed to obtain GPU adapter: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("CRT Overlay Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| CrtError::Unready(format!("Failed to create GPU device: {e}")))?;

        let info = adapter.get_info();
        info!("Using GPU adapter {} ({:?})", info.name, info.backend);

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            error!("GPU device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::Release);
        });

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
            lost,
        })
    }

    /// True once the driver has reported the device as lost.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}
