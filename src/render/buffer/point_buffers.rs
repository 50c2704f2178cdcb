//! Per-cloud point state: host mirror plus optional GPU storage buffers

use bytemuck::Pod;
use std::sync::Arc;

use crate::cloud::PointCloudAsset;
use crate::core::error::Error;
use crate::core::types::{Vec3, Vec4};
use crate::render::context::GpuDevice;
use super::frame_uniform::FrameUniform;

/// GPU storage for one active cloud (layout matches shaders/visibility.wgsl group 0)
pub struct PointBuffers {
    position: wgpu::Buffer,
    normal: wgpu::Buffer,
    memory: wgpu::Buffer,
    visibility: wgpu::Buffer,
    /// Only allocated when drift is enabled
    final_position: Option<wgpu::Buffer>,
    /// Bound in place of `final_position` when drift is off
    final_placeholder: Option<wgpu::Buffer>,
    uniform: wgpu::Buffer,
    memory_staging: wgpu::Buffer,
    visibility_staging: wgpu::Buffer,
    final_staging: Option<wgpu::Buffer>,
    bind_group: wgpu::BindGroup,
    count: u32,
}

fn storage_buffer(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn staging_buffer(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Map `len` elements of a MAP_READ buffer, blocking until the GPU is done with it
fn map_read<T: Pod>(device: &wgpu::Device, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<T>, Error> {
    let size = (len * std::mem::size_of::<T>()) as u64;
    let slice = buffer.slice(..size);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
        .map_err(|e| Error::Gpu(format!("device poll failed: {:?}", e)))?;

    rx.recv()
        .map_err(|_| Error::Gpu("readback callback dropped".to_string()))?
        .map_err(|e| Error::Gpu(format!("buffer map failed: {:?}", e)))?;

    let data = slice.get_mapped_range();
    let values = bytemuck::pod_collect_to_vec::<u8, T>(&data);
    drop(data);
    buffer.unmap();

    Ok(values)
}

impl PointBuffers {
    /// Allocate and upload buffers for `asset`
    pub fn new(
        gpu: &GpuDevice,
        layout: &wgpu::BindGroupLayout,
        asset: &PointCloudAsset,
        memory: &[f32],
        drift_enabled: bool,
    ) -> Result<Self, Error> {
        let count = asset.len();
        let vec4_bytes = (count * std::mem::size_of::<Vec4>()) as u64;
        let f32_bytes = (count * std::mem::size_of::<f32>()) as u64;

        if count == 0 {
            return Err(Error::Gpu(format!("'{}': cannot allocate buffers for zero points", asset.name())));
        }
        if vec4_bytes > gpu.max_storage_binding() {
            return Err(Error::Gpu(format!(
                "'{}': {} points need {}MB per buffer, device binding limit is {}MB",
                asset.name(),
                count,
                vec4_bytes / 1024 / 1024,
                gpu.max_storage_binding() / 1024 / 1024
            )));
        }

        let device = &gpu.device;
        let queue = &gpu.queue;

        let position = storage_buffer(device, "point_positions", vec4_bytes);
        let normal = storage_buffer(device, "point_normals", vec4_bytes);
        let memory_buffer = storage_buffer(device, "point_memory", f32_bytes);
        let visibility = storage_buffer(device, "point_visibility", f32_bytes);
        let final_position = drift_enabled.then(|| storage_buffer(device, "point_final_positions", vec4_bytes));
        let final_placeholder = (!drift_enabled).then(|| storage_buffer(device, "point_final_placeholder", 16));

        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("point_frame_uniform"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let memory_staging = staging_buffer(device, "point_memory_staging", f32_bytes);
        let visibility_staging = staging_buffer(device, "point_visibility_staging", f32_bytes);
        let final_staging = drift_enabled.then(|| staging_buffer(device, "point_final_staging", vec4_bytes));

        let positions: Vec<Vec4> = asset.positions().iter().map(|p| p.extend(1.0)).collect();
        let normals: Vec<Vec4> = match asset.normals() {
            Some(normals) => normals.iter().map(|n| n.extend(0.0)).collect(),
            None => vec![Vec3::Y.extend(0.0); count],
        };
        queue.write_buffer(&position, 0, bytemuck::cast_slice(&positions));
        queue.write_buffer(&normal, 0, bytemuck::cast_slice(&normals));
        queue.write_buffer(&memory_buffer, 0, bytemuck::cast_slice(memory));
        queue.write_buffer(&visibility, 0, bytemuck::cast_slice(&vec![0.0f32; count]));
        if let Some(buffer) = &final_position {
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(&positions));
        }

        let final_binding = match (&final_position, &final_placeholder) {
            (Some(buffer), _) | (None, Some(buffer)) => buffer,
            (None, None) => return Err(Error::Gpu("final position binding missing".to_string())),
        };

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("point_buffers_bind_group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: position.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: memory_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: visibility.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: final_binding.as_entire_binding(),
                },
            ],
        });

        log::debug!(
            "Allocated GPU buffers for '{}': {} points ({}KB)",
            asset.name(),
            count,
            (vec4_bytes * if drift_enabled { 3 } else { 2 } + f32_bytes * 2) / 1024
        );

        Ok(Self {
            position,
            normal,
            memory: memory_buffer,
            visibility,
            final_position,
            final_placeholder,
            uniform,
            memory_staging,
            visibility_staging,
            final_staging,
            bind_group,
            count: count as u32,
        })
    }

    /// Number of points
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn write_uniform(&self, queue: &wgpu::Queue, uniform: &FrameUniform) {
        queue.write_buffer(&self.uniform, 0, bytemuck::bytes_of(uniform));
    }

    /// Push host-computed state (CPU dispatch path)
    pub fn upload_state(&self, queue: &wgpu::Queue, memory: &[f32], visibility: &[f32], final_positions: Option<&[Vec4]>) {
        queue.write_buffer(&self.memory, 0, bytemuck::cast_slice(memory));
        queue.write_buffer(&self.visibility, 0, bytemuck::cast_slice(visibility));
        if let (Some(buffer), Some(values)) = (&self.final_position, final_positions) {
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(values));
        }
    }

    /// Record copies of the kernel outputs into the staging buffers
    pub fn encode_readback(&self, encoder: &mut wgpu::CommandEncoder) {
        let f32_bytes = self.count as u64 * std::mem::size_of::<f32>() as u64;
        encoder.copy_buffer_to_buffer(&self.memory, 0, &self.memory_staging, 0, f32_bytes);
        encoder.copy_buffer_to_buffer(&self.visibility, 0, &self.visibility_staging, 0, f32_bytes);
        if let (Some(src), Some(dst)) = (&self.final_position, &self.final_staging) {
            let vec4_bytes = self.count as u64 * std::mem::size_of::<Vec4>() as u64;
            encoder.copy_buffer_to_buffer(src, 0, dst, 0, vec4_bytes);
        }
    }

    /// Copy staged kernel outputs into the host mirror.
    /// Call after the submission containing `encode_readback`.
    pub fn read_back(
        &self,
        device: &wgpu::Device,
        memory: &mut [f32],
        visibility: &mut [f32],
        final_positions: Option<&mut [Vec4]>,
    ) -> Result<(), Error> {
        let n = self.count as usize;
        memory.copy_from_slice(&map_read::<f32>(device, &self.memory_staging, n)?);
        visibility.copy_from_slice(&map_read::<f32>(device, &self.visibility_staging, n)?);
        if let (Some(staging), Some(out)) = (&self.final_staging, final_positions) {
            out.copy_from_slice(&map_read::<Vec4>(device, staging, n)?);
        }
        Ok(())
    }

    /// Read the first `n` memory values after all submitted work completes
    pub fn read_memory_prefix(&self, gpu: &GpuDevice, n: usize) -> Result<Vec<f32>, Error> {
        let n = n.min(self.count as usize);
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("memory_sample_readback"),
        });
        encoder.copy_buffer_to_buffer(
            &self.memory,
            0,
            &self.memory_staging,
            0,
            (n * std::mem::size_of::<f32>()) as u64,
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        map_read::<f32>(&gpu.device, &self.memory_staging, n)
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn position_buffer(&self) -> &wgpu::Buffer {
        &self.position
    }

    pub fn normal_buffer(&self) -> &wgpu::Buffer {
        &self.normal
    }

    pub fn memory_buffer(&self) -> &wgpu::Buffer {
        &self.memory
    }

    pub fn visibility_buffer(&self) -> &wgpu::Buffer {
        &self.visibility
    }

    pub fn final_position_buffer(&self) -> Option<&wgpu::Buffer> {
        self.final_position.as_ref()
    }
}

impl Drop for PointBuffers {
    fn drop(&mut self) {
        self.position.destroy();
        self.normal.destroy();
        self.memory.destroy();
        self.visibility.destroy();
        self.uniform.destroy();
        self.memory_staging.destroy();
        self.visibility_staging.destroy();
        for buffer in [&self.final_position, &self.final_placeholder, &self.final_staging]
            .into_iter()
            .flatten()
        {
            buffer.destroy();
        }
    }
}

/// Authoritative per-point state of one active cloud.
///
/// The host mirror is always present; GPU buffers exist only when the engine
/// runs with a device. Slot `i` of every buffer belongs to point `i` of the asset.
pub struct BufferStreamer {
    asset: Arc<PointCloudAsset>,
    memory: Vec<f32>,
    visibility: Vec<f32>,
    final_positions: Option<Vec<Vec4>>,
    gpu: Option<PointBuffers>,
}

impl BufferStreamer {
    /// Allocate host state for `asset`; refuses empty assets
    pub fn new(asset: Arc<PointCloudAsset>, initial_memory: f32, drift_enabled: bool) -> Result<Self, Error> {
        if asset.is_empty() {
            return Err(Error::Asset(format!("'{}' has no points", asset.name())));
        }
        let count = asset.len();
        let final_positions =
            drift_enabled.then(|| asset.positions().iter().map(|p| p.extend(1.0)).collect::<Vec<Vec4>>());

        Ok(Self {
            memory: vec![initial_memory.clamp(0.0, 1.0); count],
            visibility: vec![0.0; count],
            final_positions,
            gpu: None,
            asset,
        })
    }

    /// Create GPU storage mirroring the current host state
    pub fn attach_gpu(&mut self, gpu: &GpuDevice, layout: &wgpu::BindGroupLayout) -> Result<(), Error> {
        let buffers = PointBuffers::new(gpu, layout, &self.asset, &self.memory, self.final_positions.is_some())?;
        self.gpu = Some(buffers);
        Ok(())
    }

    pub fn asset(&self) -> &Arc<PointCloudAsset> {
        &self.asset
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn memory(&self) -> &[f32] {
        &self.memory
    }

    pub fn visibility(&self) -> &[f32] {
        &self.visibility
    }

    pub fn final_positions(&self) -> Option<&[Vec4]> {
        self.final_positions.as_deref()
    }

    pub fn gpu_buffers(&self) -> Option<&PointBuffers> {
        self.gpu.as_ref()
    }

    /// Mutable view of the host state for one update pass
    pub(crate) fn state_mut(&mut self) -> (&mut [f32], &mut [f32], Option<&mut [Vec4]>) {
        (&mut self.memory, &mut self.visibility, self.final_positions.as_deref_mut())
    }

    /// Push the host mirror to the GPU buffers, if any
    pub fn upload(&self, queue: &wgpu::Queue) {
        if let Some(buffers) = &self.gpu {
            buffers.upload_state(queue, &self.memory, &self.visibility, self.final_positions.as_deref());
        }
    }

    /// Pull kernel outputs into the host mirror
    pub fn sync_from_gpu(&mut self, device: &wgpu::Device) -> Result<(), Error> {
        let Some(buffers) = &self.gpu else {
            return Err(Error::Gpu("cloud has no GPU buffers".to_string()));
        };
        buffers.read_back(device, &mut self.memory, &mut self.visibility, self.final_positions.as_deref_mut())
    }

    /// First `n` memory values, read from the GPU when buffers exist
    pub fn read_memory_sample(&self, gpu: Option<&GpuDevice>, n: usize) -> Result<Vec<f32>, Error> {
        match (&self.gpu, gpu) {
            (Some(buffers), Some(gpu)) => buffers.read_memory_prefix(gpu, n),
            _ => Ok(self.memory.iter().take(n).copied().collect()),
        }
    }

    /// Mean memory over all points
    pub fn mean_memory(&self) -> f32 {
        self.memory.iter().sum::<f32>() / self.memory.len().max(1) as f32
    }
}
