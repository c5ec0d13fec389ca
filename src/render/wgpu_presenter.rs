//! wgpu presentation backend.

use std::sync::Arc;

use wgpu::*;
use winit::window::Window;

use crate::media::{FramePixels, Plane, VideoFrame};
use crate::render::shader::{bgra_source, compile_shader, nv12_source, LetterboxUniform};
use crate::render::{PresentationBackend, RenderError};

/// Textures of the frame currently uploaded
enum FrameTextures {
    Nv12 {
        luma: Texture,
        chroma: Texture,
        bind_group: BindGroup,
    },
    Bgra {
        image: Texture,
        bind_group: BindGroup,
    },
}

impl FrameTextures {
    fn size(&self) -> (u32, u32) {
        let texture = match self {
            FrameTextures::Nv12 { luma, .. } => luma,
            FrameTextures::Bgra { image, .. } => image,
        };
        (texture.width(), texture.height())
    }

    fn bind_group(&self) -> &BindGroup {
        match self {
            FrameTextures::Nv12 { bind_group, .. } | FrameTextures::Bgra { bind_group, .. } => {
                bind_group
            }
        }
    }
}

/// Presents frames to a winit window through wgpu.
pub struct WgpuPresenter {
    device: Device,
    queue: Queue,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    nv12_pipeline: RenderPipeline,
    nv12_layout: BindGroupLayout,
    bgra_pipeline: RenderPipeline,
    bgra_layout: BindGroupLayout,
    uniform_buffer: Buffer,
    sampler: Sampler,
    textures: Option<FrameTextures>,
    frame_size: (u32, u32),
}

fn uniform_entry() -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding: 0,
        visibility: ShaderStages::VERTEX,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::FRAGMENT,
        ty: BindingType::Texture {
            multisampled: false,
            view_dimension: TextureViewDimension::D2,
            sample_type: TextureSampleType::Float { filterable: true },
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::FRAGMENT,
        ty: BindingType::Sampler(SamplerBindingType::Filtering),
        count: None,
    }
}

impl WgpuPresenter {
    /// Create a presenter drawing into `window`
    pub fn new(window: Arc<Window>) -> Result<Self, RenderError> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let size = window.inner_size();
        let surface = instance
            .create_surface(window)
            .map_err(|e| RenderError::Surface(e.to_string()))?;

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::default(),
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::Wgpu("No adapter found".to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("floatplay device"),
                required_features: Features::empty(),
                required_limits: Limits::default(),
            },
            None,
        ))
        .map_err(|e| RenderError::Wgpu(e.to_string()))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| RenderError::Surface("surface reports no formats".to_string()))?;
        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: PresentMode::Fifo,
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let nv12_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("NV12 Bind Group Layout"),
            entries: &[uniform_entry(), texture_entry(1), texture_entry(2), sampler_entry(3)],
        });
        let bgra_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("BGRA Bind Group Layout"),
            entries: &[uniform_entry(), texture_entry(1), sampler_entry(2)],
        });

        let nv12_pipeline = Self::pipeline(&device, "NV12", &nv12_source(), &nv12_layout, format);
        let bgra_pipeline = Self::pipeline(&device, "BGRA", &bgra_source(), &bgra_layout, format);

        let uniform_buffer = device.create_buffer(&BufferDescriptor {
            label: Some("Letterbox Uniform Buffer"),
            size: std::mem::size_of::<LetterboxUniform>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        tracing::info!("wgpu presenter ready: {:?}, {:?}", adapter.get_info().backend, format);

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            nv12_pipeline,
            nv12_layout,
            bgra_pipeline,
            bgra_layout,
            uniform_buffer,
            sampler,
            textures: None,
            frame_size: (0, 0),
        })
    }

    fn pipeline(
        device: &Device,
        label: &str,
        source: &str,
        layout: &BindGroupLayout,
        format: TextureFormat,
    ) -> RenderPipeline {
        let module = compile_shader(device, label, source);
        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });
        device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &module,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: PipelineCompilationOptions::default(),
            },
            fragment: Some(FragmentState {
                module: &module,
                entry_point: "fs_main",
                targets: &[Some(ColorTargetState {
                    format,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
                compilation_options: PipelineCompilationOptions::default(),
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: MultisampleState::default(),
            multiview: None,
        })
    }

    fn texture(&self, label: &str, width: u32, height: u32, format: TextureFormat) -> Texture {
        self.device.create_texture(&TextureDescriptor {
            label: Some(label),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn write(&self, texture: &Texture, plane: &Plane) {
        self.queue.write_texture(
            ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &plane.data,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(plane.stride as u32),
                rows_per_image: Some(texture.height()),
            },
            texture.size(),
        );
    }

    /// Build textures and bind group matching `frame`'s layout and size.
    fn allocate(&self, frame: &VideoFrame) -> FrameTextures {
        let view = |t: &Texture| t.create_view(&TextureViewDescriptor::default());
        match &frame.pixels {
            FramePixels::Nv12 { .. } => {
                let luma = self.texture("Luma", frame.width, frame.height, TextureFormat::R8Unorm);
                let chroma = self.texture(
                    "Chroma",
                    frame.width.div_ceil(2),
                    frame.height.div_ceil(2),
                    TextureFormat::Rg8Unorm,
                );
                let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
                    label: Some("NV12 Bind Group"),
                    layout: &self.nv12_layout,
                    entries: &[
                        BindGroupEntry {
                            binding: 0,
                            resource: self.uniform_buffer.as_entire_binding(),
                        },
                        BindGroupEntry {
                            binding: 1,
                            resource: BindingResource::TextureView(&view(&luma)),
                        },
                        BindGroupEntry {
                            binding: 2,
                            resource: BindingResource::TextureView(&view(&chroma)),
                        },
                        BindGroupEntry {
                            binding: 3,
                            resource: BindingResource::Sampler(&self.sampler),
                        },
                    ],
                });
                FrameTextures::Nv12 {
                    luma,
                    chroma,
                    bind_group,
                }
            }
            FramePixels::Bgra(_) => {
                let image = self.texture("Image", frame.width, frame.height, TextureFormat::Bgra8Unorm);
                let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
                    label: Some("BGRA Bind Group"),
                    layout: &self.bgra_layout,
                    entries: &[
                        BindGroupEntry {
                            binding: 0,
                            resource: self.uniform_buffer.as_entire_binding(),
                        },
                        BindGroupEntry {
                            binding: 1,
                            resource: BindingResource::TextureView(&view(&image)),
                        },
                        BindGroupEntry {
                            binding: 2,
                            resource: BindingResource::Sampler(&self.sampler),
                        },
                    ],
                });
                FrameTextures::Bgra { image, bind_group }
            }
        }
    }

    fn write_letterbox(&self) {
        let uniform = LetterboxUniform::fit(
            self.frame_size.0,
            self.frame_size.1,
            self.surface_config.width,
            self.surface_config.height,
        );
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));
    }

    fn upload(&mut self, frame: &VideoFrame) {
        let matches = match (&self.textures, &frame.pixels) {
            (Some(textures @ FrameTextures::Nv12 { .. }), FramePixels::Nv12 { .. })
            | (Some(textures @ FrameTextures::Bgra { .. }), FramePixels::Bgra(_)) => {
                textures.size() == (frame.width, frame.height)
            }
            _ => false,
        };
        if !matches {
            tracing::debug!("allocating {:?} textures {}x{}", frame.layout(), frame.width, frame.height);
            self.textures = Some(self.allocate(frame));
            self.frame_size = (frame.width, frame.height);
            self.write_letterbox();
        }

        match (&self.textures, &frame.pixels) {
            (Some(FrameTextures::Nv12 { luma, chroma, .. }), FramePixels::Nv12 { luma: y, chroma: uv }) => {
                self.write(luma, y);
                self.write(chroma, uv);
            }
            (Some(FrameTextures::Bgra { image, .. }), FramePixels::Bgra(plane)) => {
                self.write(image, plane);
            }
            _ => {}
        }
    }
}

impl PresentationBackend for WgpuPresenter {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn present(&mut self, frame: &VideoFrame) -> Result<(), RenderError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(RenderError::InvalidFrame(format!(
                "{}x{} frame",
                frame.width, frame.height
            )));
        }
        self.upload(frame);

        let output = self
            .surface
            .get_current_texture()
            .map_err(|e| RenderError::Surface(e.to_string()))?;
        let view = output.texture.create_view(&TextureViewDescriptor::default());

        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Present Encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let Some(textures) = &self.textures {
                let pipeline = match textures {
                    FrameTextures::Nv12 { .. } => &self.nv12_pipeline,
                    FrameTextures::Bgra { .. } => &self.bgra_pipeline,
                };
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, textures.bind_group(), &[]);
                pass.draw(0..6, 0..1);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
            self.write_letterbox();
        }
    }
}
