//! GPU rendering into the encoder's input surface
//!
//! The worker owns a context that shares textures with the producer's
//! context, plus a window surface wrapping the video encoder's input. Each
//! frame is drawn as a full-viewport textured quad, stamped with the capture
//! time and swapped into the encoder.

use crate::errors::{RelayError, Result};
use crate::types::{EncoderSurface, GpuContextHandle, Orientation, TextureId, TransformMatrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Platform graphics API as seen by the encoder worker.
///
/// Every call happens on the worker thread that created the context.
pub trait GpuBackend: Send {
    /// Create a recordable context sharing textures with `shared`
    fn create_context(&mut self, shared: GpuContextHandle) -> Result<ContextId>;

    fn create_window_surface(
        &mut self,
        context: ContextId,
        target: EncoderSurface,
    ) -> Result<SurfaceId>;

    fn make_current(&mut self, context: ContextId, surface: SurfaceId) -> Result<()>;

    /// Clear color and depth of the current surface
    fn clear(&mut self) -> Result<()>;

    fn set_viewport(&mut self, width: u32, height: u32) -> Result<()>;

    /// Draw `texture` as a full-viewport quad
    fn draw_texture(
        &mut self,
        texture: TextureId,
        transform: &TransformMatrix,
        orientation: Orientation,
    ) -> Result<()>;

    fn set_presentation_time(&mut self, surface: SurfaceId, timestamp_ns: i64) -> Result<()>;

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<()>;

    fn release_surface(&mut self, surface: SurfaceId);

    fn release_context(&mut self, context: ContextId);
}

/// Worker-side context and surface bound to one encoder input
#[derive(Debug)]
pub struct RenderTarget {
    context: Option<ContextId>,
    surface: Option<SurfaceId>,
    target: EncoderSurface,
    width: u32,
    height: u32,
    orientation: Orientation,
    frames_rendered: u64,
}

impl RenderTarget {
    pub fn create(
        gpu: &mut dyn GpuBackend,
        shared: GpuContextHandle,
        target: EncoderSurface,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut render_target = Self {
            context: None,
            surface: None,
            target,
            width,
            height,
            orientation: Orientation::default(),
            frames_rendered: 0,
        };
        render_target.bind(gpu, shared)?;
        Ok(render_target)
    }

    fn bind(&mut self, gpu: &mut dyn GpuBackend, shared: GpuContextHandle) -> Result<()> {
        let context = gpu.create_context(shared)?;
        self.context = Some(context);

        let surface = match gpu.create_window_surface(context, self.target) {
            Ok(surface) => surface,
            Err(e) => {
                self.release(gpu);
                return Err(e);
            }
        };
        self.surface = Some(surface);

        if let Err(e) = gpu.make_current(context, surface) {
            self.release(gpu);
            return Err(e);
        }

        log::debug!(
            "Render target bound: ctx={:?} surface={:?} {}x{}",
            context,
            surface,
            self.width,
            self.height
        );
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.context.is_some() && self.surface.is_some()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
    }

    /// Draw one frame and hand it to the encoder with `timestamp_ns` as its
    /// presentation time.
    pub fn render(
        &mut self,
        gpu: &mut dyn GpuBackend,
        texture: TextureId,
        transform: &TransformMatrix,
        timestamp_ns: i64,
    ) -> Result<()> {
        let surface = match (self.context, self.surface) {
            (Some(_), Some(surface)) => surface,
            _ => return Err(RelayError::Gpu("render target not bound".to_string())),
        };

        gpu.clear()?;
        gpu.set_viewport(self.width, self.height)?;
        gpu.draw_texture(texture, transform, self.orientation)?;
        gpu.set_presentation_time(surface, timestamp_ns)?;
        gpu.swap_buffers(surface)?;
        self.frames_rendered += 1;
        Ok(())
    }

    /// Move to a new shared context. The old surface and context are fully
    /// released before the replacements are created.
    pub fn rebind(&mut self, gpu: &mut dyn GpuBackend, shared: GpuContextHandle) -> Result<()> {
        self.release(gpu);
        self.bind(gpu, shared)
    }

    /// Release the surface and context. Safe to call more than once.
    pub fn release(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(surface) = self.surface.take() {
            gpu.release_surface(surface);
        }
        if let Some(context) = self.context.take() {
            gpu.release_context(context);
        }
    }
}
