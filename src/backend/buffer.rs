// Resource Uploader - buffers, images and the staging transfer path
//
// Device-local resources are never written from the host directly:
// staging buffer (host-visible + coherent) -> one-shot copy -> device-local
// destination, then the staging allocation is released. Uniform buffers are
// the exception; they are rewritten every frame and live in host-visible
// memory.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::tracker::{self, HandleKind};
use super::DeviceContext;
use crate::error::RenderError;

const HOST_VISIBLE_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Find a memory type allowed by `type_filter` that has every flag in `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            type_filter & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(RenderError::NoSuitableMemoryType {
            type_filter,
            properties,
        })
}

/// Access masks and pipeline stages for one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, RenderError> {
    let masks = match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            }
        }
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => {
            TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            }
        }
        (from, to) => return Err(RenderError::UnsupportedLayoutTransition { from, to }),
    };
    Ok(masks)
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

fn aspect_for_layout(format: vk::Format, layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    if layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if has_stencil(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Buffer plus the memory bound to it. Freed on drop.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    device: Arc<DeviceContext>,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;
        tracker::created(HandleKind::Buffer, 1);

        // Owned from here on: any later failure is cleaned up by Drop, and
        // freeing the still-null memory handle is a no-op
        let mut gpu = Self {
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            device,
        };

        let mem_requirements = unsafe { gpu.device.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = find_memory_type(
            &gpu.device.memory_properties,
            mem_requirements.memory_type_bits,
            memory_properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        gpu.memory = unsafe { gpu.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        unsafe { gpu.device.device.bind_buffer_memory(buffer, gpu.memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(gpu)
    }

    /// Host-visible, coherent buffer for data the CPU rewrites every frame.
    pub fn host_visible(
        device: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, size, usage, HOST_VISIBLE_COHERENT)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copy `data` to the start of the buffer. Buffer must be host-visible.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "write of {} bytes overflows {}-byte buffer",
            data.len(),
            self.size
        );
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy the whole buffer out. Buffer must be host-visible.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *const u8;
            ptr.copy_to_nonoverlapping(out.as_mut_ptr(), out.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
        tracker::destroyed(HandleKind::Buffer, 1);
    }
}

/// Device-local 2D image with its memory and a full view.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    memory: vk::DeviceMemory,
    device: Arc<DeviceContext>,
}

impl GpuImage {
    pub fn new(
        device: Arc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;
        tracker::created(HandleKind::Image, 1);

        let mut gpu = Self {
            image,
            view: vk::ImageView::null(),
            format,
            extent,
            memory: vk::DeviceMemory::null(),
            device,
        };

        let mem_requirements = unsafe { gpu.device.device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            &gpu.device.memory_properties,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        gpu.memory = unsafe { gpu.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate image memory")?;

        unsafe { gpu.device.device.bind_image_memory(image, gpu.memory, 0) }
            .context("Failed to bind image memory")?;

        gpu.view = create_image_view(&gpu.device, image, format, aspect)?;
        tracker::created(HandleKind::ImageView, 1);

        Ok(gpu)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
        if self.view != vk::ImageView::null() {
            tracker::destroyed(HandleKind::ImageView, 1);
        }
        tracker::destroyed(HandleKind::Image, 1);
    }
}

/// 2D view over a single mip/layer.
pub fn create_image_view(
    device: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

/// Sampled texture: image plus sampler.
pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.image.device.device.destroy_sampler(self.sampler, None);
        }
        tracker::destroyed(HandleKind::Sampler, 1);
    }
}

/// Indexed triangle mesh in device-local memory.
pub struct Mesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
}

/// Owns a transient command pool for staging transfers.
pub struct ResourceUploader {
    pool: CommandPool,
    device: Arc<DeviceContext>,
}

impl ResourceUploader {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let pool = CommandPool::new(device.clone(), vk::CommandPoolCreateFlags::TRANSIENT)?;
        Ok(Self { pool, device })
    }

    /// Stage `data` and copy it into a new device-local buffer with `usage`.
    pub fn upload_buffer(&self, data: &[u8], usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        anyhow::ensure!(!data.is_empty(), "cannot upload an empty buffer");
        let size = data.len() as vk::DeviceSize;

        let staging = self.stage(data)?;
        let buffer = GpuBuffer::new(
            self.device.clone(),
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        self.pool.one_shot(|device, cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            device.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
        })?;

        log::debug!("Uploaded {} bytes ({:?})", size, usage);
        Ok(buffer)
    }

    pub fn upload_mesh<V: bytemuck::Pod>(&self, vertices: &[V], indices: &[u32]) -> Result<Mesh> {
        let vertex_buffer = self
            .upload_buffer(bytemuck::cast_slice(vertices), vk::BufferUsageFlags::VERTEX_BUFFER)
            .context("Failed to upload vertex buffer")?;
        let index_buffer = self
            .upload_buffer(bytemuck::cast_slice(indices), vk::BufferUsageFlags::INDEX_BUFFER)
            .context("Failed to upload index buffer")?;

        Ok(Mesh {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        })
    }

    /// Stage RGBA8 pixels into a shader-readable sampled texture.
    pub fn upload_texture(&self, pixels: &[u8], width: u32, height: u32) -> Result<Texture> {
        anyhow::ensure!(
            pixels.len() == (width as usize) * (height as usize) * 4,
            "texture payload of {} bytes does not match {}x{} RGBA8",
            pixels.len(),
            width,
            height
        );
        let format = vk::Format::R8G8B8A8_SRGB;
        let extent = vk::Extent2D { width, height };

        let staging = self.stage(pixels)?;
        let image = GpuImage::new(
            self.device.clone(),
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        let to_transfer = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        let to_shader = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        self.pool.one_shot(|device, cmd| unsafe {
            record_transition(
                device,
                cmd,
                image.image,
                format,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                to_transfer,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            record_transition(
                device,
                cmd,
                image.image,
                format,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                to_shader,
            );
        })?;

        let sampler = self.create_sampler()?;
        log::debug!("Uploaded {}x{} texture", width, height);

        Ok(Texture { image, sampler })
    }

    /// Depth attachment already transitioned to its attachment layout.
    pub fn create_depth_image(&self, extent: vk::Extent2D, format: vk::Format) -> Result<GpuImage> {
        let image = GpuImage::new(
            self.device.clone(),
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
        .context("Failed to create depth image")?;

        let masks = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;
        self.pool.one_shot(|device, cmd| unsafe {
            record_transition(
                device,
                cmd,
                image.image,
                format,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                masks,
            );
        })?;

        Ok(image)
    }

    /// Copy a device-local buffer back to the host.
    ///
    /// `source` must have been created with `TRANSFER_SRC` usage.
    pub fn read_back(&self, source: &GpuBuffer) -> Result<Vec<u8>> {
        let readback = GpuBuffer::host_visible(
            self.device.clone(),
            source.size(),
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        self.pool.one_shot(|device, cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: source.size(),
            };
            device.cmd_copy_buffer(cmd, source.buffer, readback.buffer, &[region]);
        })?;

        readback.read_bytes()
    }

    fn stage(&self, data: &[u8]) -> Result<GpuBuffer> {
        let staging = GpuBuffer::host_visible(
            self.device.clone(),
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )
        .context("Failed to create staging buffer")?;
        staging.write_bytes(data)?;
        Ok(staging)
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let max_anisotropy = self
            .device
            .properties
            .limits
            .max_sampler_anisotropy
            .min(16.0);

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(self.device.anisotropy_enabled)
            .max_anisotropy(if self.device.anisotropy_enabled { max_anisotropy } else { 1.0 })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = unsafe { self.device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create texture sampler")?;
        tracker::created(HandleKind::Sampler, 1);
        Ok(sampler)
    }
}

unsafe fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    masks: TransitionMasks,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_for_layout(format, new),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    device.cmd_pipeline_barrier(
        cmd,
        masks.src_stage,
        masks.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    #[test]
    fn memory_type_must_satisfy_filter_and_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST_VISIBLE_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST_VISIBLE_COHERENT,
        ]);

        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
        assert_eq!(find_memory_type(&props, 0b1111, HOST_VISIBLE_COHERENT).unwrap(), 2);
        // Type 2 filtered out by the resource's requirements
        assert_eq!(find_memory_type(&props, 0b1010, HOST_VISIBLE_COHERENT).unwrap(), 3);
    }

    #[test]
    fn no_matching_memory_type_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, HOST_VISIBLE_COHERENT).unwrap_err();
        assert!(matches!(err, RenderError::NoSuitableMemoryType { type_filter: 1, .. }));

        // Types beyond memory_type_count are never considered
        assert!(find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::empty()).is_err());
    }

    #[test]
    fn supported_layout_transitions() {
        let upload = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(upload.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let sample = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let depth = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert!(depth
            .dst_access
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn unknown_layout_transition_is_rejected() {
        let err = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedLayoutTransition { .. }));
    }

    #[test]
    fn stencil_aspect_only_for_stencil_formats() {
        let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        assert_eq!(
            aspect_for_layout(vk::Format::D32_SFLOAT, layout),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_layout(vk::Format::D24_UNORM_S8_UINT, layout),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_layout(vk::Format::R8G8B8A8_SRGB, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    #[ignore = "requires a Vulkan-capable GPU"]
    fn failed_buffer_allocation_releases_the_buffer() {
        let _gpu = tracker::lock_for_test();
        let device = DeviceContext::new("alloc-failure-test", false, None).unwrap();
        let baseline = tracker::snapshot();

        // No implementation exposes memory that is both protected and host-visible
        let result = GpuBuffer::new(
            device.clone(),
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::PROTECTED | vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        let err = result.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::NoSuitableMemoryType { .. })
        ));
        assert_eq!(tracker::snapshot(), baseline);

        // The same path succeeds with satisfiable flags and is released on drop
        let buffer = GpuBuffer::host_visible(device.clone(), 256, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        assert_eq!(tracker::live(HandleKind::Buffer), baseline[HandleKind::Buffer as usize] + 1);
        drop(buffer);
        assert_eq!(tracker::snapshot(), baseline);
    }
}
