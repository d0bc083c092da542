//! GPU color path: frame textures, conversion pipelines, presentation.
//!
//! Everything here hangs off an explicit [`RenderContext`] handed in by the
//! embedder; nothing is process-global. Pipeline construction is two-phase:
//! [`VideoPipelines::create`] builds every GPU object up front and
//! [`VideoPipelines::is_ready`] reports the outcome before the first frame
//! is rendered.

use std::borrow::Cow;

use crate::color::{self, ColorUniform};
use crate::display::{DisplayModel, DisplayVertex};
use crate::error::RenderError;
use crate::frame::{PixelFormat, VideoFrame};

/// The GPU objects the pipeline renders with, dependency-injected by the
/// embedder.
#[derive(Clone)]
pub struct RenderContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Format of the surface or texture frames are rendered into
    pub target_format: wgpu::TextureFormat,
}

impl RenderContext {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        target_format: wgpu::TextureFormat,
    ) -> Self {
        Self {
            device,
            queue,
            target_format,
        }
    }
}

/// Which render pipeline a frame uses, selected purely by plane count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Packed single-plane BGRA
    Bgra,
    /// Semi-planar Y + interleaved CbCr
    BiPlanar,
    /// Planar Y, Cb, Cr
    TriPlanar,
}

impl PipelineKind {
    /// Plane count decides the pipeline; anything unexpected falls back to
    /// the packed path.
    pub fn from_plane_count(planes: usize) -> Self {
        match planes {
            3 => PipelineKind::TriPlanar,
            2 => PipelineKind::BiPlanar,
            _ => PipelineKind::Bgra,
        }
    }
}

/// Compiled render pipelines for every plane layout, one set per context.
pub struct VideoPipelines {
    bgra: wgpu::RenderPipeline,
    bi_planar: wgpu::RenderPipeline,
    tri_planar: wgpu::RenderPipeline,
    frame_layout: wgpu::BindGroupLayout,
    model_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    ready: bool,
}

impl VideoPipelines {
    /// Builds the shader module, layouts, sampler, and the three pipelines.
    ///
    /// Fails fast on a target format frames cannot be rendered into, so the
    /// error surfaces at session setup rather than at first present.
    pub fn create(ctx: &RenderContext) -> Result<Self, RenderError> {
        if ctx.target_format.is_compressed() {
            return Err(RenderError::TargetFormat(ctx.target_format));
        }

        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/video.wgsl"))),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video_frame_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                texture_entry(2),
                texture_entry(3),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let model_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video_model_layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("video_pipeline_layout"),
            bind_group_layouts: &[&frame_layout, &model_layout],
            push_constant_ranges: &[],
        });

        let create_pipeline = |entry_point: &str, label: &str| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[DisplayVertex::LAYOUT],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(entry_point),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: ctx.target_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        Ok(Self {
            bgra: create_pipeline("fs_bgra", "video_pipeline_bgra"),
            bi_planar: create_pipeline("fs_nv12", "video_pipeline_nv12"),
            tri_planar: create_pipeline("fs_yuv", "video_pipeline_yuv"),
            frame_layout,
            model_layout,
            sampler,
            ready: true,
        })
    }

    /// True once every pipeline exists; rendering refuses to run otherwise.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn pipeline(&self, kind: PipelineKind) -> &wgpu::RenderPipeline {
        match kind {
            PipelineKind::Bgra => &self.bgra,
            PipelineKind::BiPlanar => &self.bi_planar,
            PipelineKind::TriPlanar => &self.tri_planar,
        }
    }
}

/// Cached per-frame-geometry textures, one per plane at plane dimensions.
struct PlaneTextures {
    width: u32,
    height: u32,
    format: PixelFormat,
    textures: Vec<wgpu::Texture>,
    bind_group: wgpu::BindGroup,
}

/// Renders converted frames through the pipeline matching their layout.
pub struct ColorConverter {
    pipelines: VideoPipelines,
    color_uniform: wgpu::Buffer,
    model_uniform: wgpu::Buffer,
    model_bind_group: wgpu::BindGroup,
    textures: Option<PlaneTextures>,
}

impl ColorConverter {
    pub fn new(ctx: &RenderContext) -> Result<Self, RenderError> {
        let pipelines = VideoPipelines::create(ctx)?;
        let color_uniform = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("video_color_uniform"),
            size: std::mem::size_of::<ColorUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let model_uniform = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("video_model_uniform"),
            size: std::mem::size_of::<[[f32; 4]; 4]>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let model_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("video_model_bind_group"),
            layout: &pipelines.model_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: model_uniform.as_entire_binding(),
            }],
        });
        Ok(Self {
            pipelines,
            color_uniform,
            model_uniform,
            model_bind_group,
            textures: None,
        })
    }

    /// Renders one frame into `target_view` and schedules `presented` for
    /// when the GPU finishes the submission.
    ///
    /// Presentation is never synchronous: the caller's completion runs via
    /// the queue's submitted-work callback.
    pub fn render(
        &mut self,
        ctx: &RenderContext,
        frame: &VideoFrame,
        display: &dyn DisplayModel,
        target_view: &wgpu::TextureView,
        presented: impl FnOnce() + Send + 'static,
    ) -> Result<(), RenderError> {
        if !self.pipelines.is_ready() {
            return Err(RenderError::NotReady);
        }
        let buffer = &frame.buffer;
        if buffer.planes.is_empty() {
            return Err(RenderError::EmptyFrame);
        }
        let kind = PipelineKind::from_plane_count(buffer.planes.len());

        self.ensure_textures(ctx, buffer.width, buffer.height, buffer.format);
        self.upload_planes(ctx, frame);

        // Packed frames bind no conversion; the uniform is left untouched
        if let Some((matrix, offset)) = color::conversion(buffer.format, buffer.colorimetry) {
            let uniform = ColorUniform::new(matrix, offset);
            ctx.queue
                .write_buffer(&self.color_uniform, 0, bytemuck::bytes_of(&uniform));
        }
        ctx.queue.write_buffer(
            &self.model_uniform,
            0,
            bytemuck::bytes_of(&display.model_matrix()),
        );

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("video_render"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("video_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(self.pipelines.pipeline(kind));
            if let Some(textures) = &self.textures {
                pass.set_bind_group(0, &textures.bind_group, &[]);
            }
            pass.set_bind_group(1, &self.model_bind_group, &[]);
            display.encode(&mut pass);
        }
        ctx.queue.submit(Some(encoder.finish()));
        ctx.queue.on_submitted_work_done(presented);
        Ok(())
    }

    /// Recreates plane textures and the frame bind group when the frame
    /// geometry or layout changes.
    fn ensure_textures(&mut self, ctx: &RenderContext, width: u32, height: u32, format: PixelFormat) {
        if let Some(t) = &self.textures {
            if t.width == width && t.height == height && t.format == format {
                return;
            }
            tracing::debug!(
                from = format!("{}x{} {:?}", t.width, t.height, t.format),
                to = format!("{width}x{height} {format:?}"),
                "recreating plane textures"
            );
        }

        let plane_format = |plane: usize| match (format, plane) {
            (PixelFormat::Bgra, _) => wgpu::TextureFormat::Bgra8Unorm,
            (PixelFormat::Nv12, 1) => wgpu::TextureFormat::Rg8Unorm,
            _ => wgpu::TextureFormat::R8Unorm,
        };
        let textures: Vec<wgpu::Texture> = (0..format.num_planes())
            .map(|plane| {
                let (w, h) = format.plane_dimensions(plane, width, height);
                ctx.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("video_plane"),
                    size: wgpu::Extent3d {
                        width: w,
                        height: h,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: plane_format(plane),
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .collect();
        let views: Vec<wgpu::TextureView> = textures
            .iter()
            .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();

        // The layout always carries three texture slots; missing planes
        // re-bind an existing view, which the fragment never samples
        let view_for = |slot: usize| views.get(slot).unwrap_or(&views[views.len() - 1]);
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("video_frame_bind_group"),
            layout: &self.pipelines.frame_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.color_uniform.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view_for(0)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(view_for(1)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(view_for(2)),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(&self.pipelines.sampler),
                },
            ],
        });

        self.textures = Some(PlaneTextures {
            width,
            height,
            format,
            textures,
            bind_group,
        });
    }

    fn upload_planes(&self, ctx: &RenderContext, frame: &VideoFrame) {
        let Some(cache) = &self.textures else {
            return;
        };
        let buffer = &frame.buffer;
        for (plane_index, texture) in cache.textures.iter().enumerate() {
            let Some(plane) = buffer.plane(plane_index) else {
                continue;
            };
            let (w, h) = buffer
                .format
                .plane_dimensions(plane_index, buffer.width, buffer.height);
            let row_bytes = buffer.format.plane_row_bytes(plane_index, buffer.width);
            let (bytes_per_row, data) = pad_plane_data(&plane.data, plane.stride, row_bytes, h);
            ctx.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(h),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
            );
        }
    }
}

/// wgpu requires texture copy rows padded to 256 bytes.
const ROW_ALIGNMENT: usize = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;

/// Returns `(bytes_per_row, data)` for a texture upload, repacking rows
/// only when the source stride is not already the aligned row width.
fn pad_plane_data<'a>(
    data: &'a [u8],
    stride: usize,
    row_bytes: usize,
    rows: u32,
) -> (u32, Cow<'a, [u8]>) {
    let aligned = row_bytes.next_multiple_of(ROW_ALIGNMENT);
    let rows = rows as usize;
    if stride == aligned && data.len() >= aligned * rows {
        return (aligned as u32, Cow::Borrowed(data));
    }
    let mut packed = vec![0u8; aligned * rows];
    for row in 0..rows {
        let src = row * stride;
        let dst = row * aligned;
        packed[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
    }
    (aligned as u32, Cow::Owned(packed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_kind_by_plane_count() {
        assert_eq!(PipelineKind::from_plane_count(3), PipelineKind::TriPlanar);
        assert_eq!(PipelineKind::from_plane_count(2), PipelineKind::BiPlanar);
        assert_eq!(PipelineKind::from_plane_count(1), PipelineKind::Bgra);
        // Unexpected counts fall back to the packed path
        assert_eq!(PipelineKind::from_plane_count(0), PipelineKind::Bgra);
        assert_eq!(PipelineKind::from_plane_count(7), PipelineKind::Bgra);
    }

    #[test]
    fn test_pad_plane_data_repacks_unaligned_rows() {
        let rows = 2u32;
        let stride = 300;
        let row_bytes = 300;
        let mut data = vec![0u8; stride * rows as usize];
        data[0] = 7;
        data[stride] = 9;
        let (bytes_per_row, packed) = pad_plane_data(&data, stride, row_bytes, rows);
        assert_eq!(bytes_per_row, 512);
        assert_eq!(packed.len(), 1024);
        assert_eq!(packed[0], 7);
        assert_eq!(packed[512], 9);
    }

    #[test]
    fn test_pad_plane_data_borrows_when_aligned() {
        let data = vec![1u8; 256 * 4];
        let (bytes_per_row, packed) = pad_plane_data(&data, 256, 200, 4);
        assert_eq!(bytes_per_row, 256);
        assert!(matches!(packed, Cow::Borrowed(_)));
    }
}
