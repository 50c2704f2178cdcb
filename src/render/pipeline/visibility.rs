//! Visibility memory compute pipeline

use crate::core::error::Error;
use crate::render::buffer::{FrameUniform, PointBuffers};
use crate::render::context::GpuDevice;
use crate::visibility::DepthSnapshot;

/// Invocations per workgroup (must match @workgroup_size in the shader)
pub const WORKGROUP_SIZE: u32 = 64;

/// Number of workgroups covering `count` points
pub fn workgroup_count(count: u32) -> u32 {
    count.div_ceil(WORKGROUP_SIZE)
}

/// Per-point visibility kernel: frustum filter, depth-snapshot occlusion,
/// memory integration and drift, one invocation per point.
///
/// Group 0 is per cloud ([`PointBuffers`]); group 1 holds the frame's depth
/// snapshot and is shared by every cloud dispatched in that frame.
pub struct VisibilityPipeline {
    pipeline: wgpu::ComputePipeline,
    point_bind_group_layout: wgpu::BindGroupLayout,
    depth_bind_group_layout: wgpu::BindGroupLayout,
    depth_buffer: wgpu::Buffer,
    depth_bind_group: wgpu::BindGroup,
    /// Depth values the buffer can hold
    depth_capacity: usize,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl VisibilityPipeline {
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("visibility_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../../shaders/visibility.wgsl").into()),
        });

        // Bind group 0: params + per-point buffers
        let point_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("visibility_points_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),  // positions
                storage_entry(2, false), // memory
                storage_entry(3, false), // visibility
                storage_entry(4, false), // final positions
            ],
        });

        // Bind group 1: scene depth
        let depth_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("visibility_depth_layout"),
            entries: &[storage_entry(0, true)],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("visibility_pipeline_layout"),
            bind_group_layouts: &[&point_bind_group_layout, &depth_bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("visibility_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let (depth_buffer, depth_bind_group) = Self::create_depth(device, &depth_bind_group_layout, 1);

        Self {
            pipeline,
            point_bind_group_layout,
            depth_bind_group_layout,
            depth_buffer,
            depth_bind_group,
            depth_capacity: 1,
        }
    }

    fn create_depth(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        capacity: usize,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("visibility_scene_depth"),
            size: (capacity * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("visibility_depth_bind_group"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });
        (buffer, bind_group)
    }

    /// Layout [`PointBuffers`] bind groups are created against
    pub fn point_bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.point_bind_group_layout
    }

    /// Upload this frame's depth snapshot, growing the buffer when needed.
    /// Without a snapshot the kernel never reads depth, so nothing is written.
    pub fn upload_depth(&mut self, gpu: &GpuDevice, depth: Option<&DepthSnapshot>) {
        let Some(depth) = depth else {
            return;
        };
        let needed = depth.values().len();
        if needed > self.depth_capacity {
            self.depth_buffer.destroy();
            let (buffer, bind_group) = Self::create_depth(&gpu.device, &self.depth_bind_group_layout, needed);
            self.depth_buffer = buffer;
            self.depth_bind_group = bind_group;
            self.depth_capacity = needed;
            log::debug!("Scene depth buffer grown to {}x{}", depth.width(), depth.height());
        }
        gpu.queue.write_buffer(&self.depth_buffer, 0, bytemuck::cast_slice(depth.values()));
    }

    /// Record the kernel for one cloud
    pub fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, buffers: &PointBuffers) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("visibility_pass"),
            timestamp_writes: None,
        });

        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, buffers.bind_group(), &[]);
        pass.set_bind_group(1, &self.depth_bind_group, &[]);
        pass.dispatch_workgroups(workgroup_count(buffers.len()), 1, 1);
    }

    /// Write the uniform, run the kernel and stage its outputs for readback.
    /// The depth snapshot must already be uploaded for this frame.
    pub fn run(&self, gpu: &GpuDevice, buffers: &PointBuffers, uniform: &FrameUniform) -> Result<(), Error> {
        if uniform.point_count != buffers.len() {
            return Err(Error::Gpu(format!(
                "uniform point count {} does not match buffer length {}",
                uniform.point_count,
                buffers.len()
            )));
        }

        buffers.write_uniform(&gpu.queue, uniform);

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("visibility_encoder"),
        });
        self.dispatch(&mut encoder, buffers);
        buffers.encode_readback(&mut encoder);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        Ok(())
    }
}

impl Drop for VisibilityPipeline {
    fn drop(&mut self) {
        self.depth_buffer.destroy();
    }
}
