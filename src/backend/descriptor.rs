// Descriptor pool and per-image descriptor sets

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{GpuBuffer, Texture};
use super::tracker::{self, HandleKind};
use super::DeviceContext;

/// One descriptor set per swapchain image, each pointing at that image's
/// uniform buffer and the shared texture. Sets are freed with the pool.
pub struct DescriptorSets {
    pub sets: Vec<vk::DescriptorSet>,
    pool: vk::DescriptorPool,
    device: Arc<DeviceContext>,
}

impl DescriptorSets {
    pub fn new(
        device: Arc<DeviceContext>,
        layout: vk::DescriptorSetLayout,
        uniform_buffers: &[GpuBuffer],
        texture: &Texture,
    ) -> Result<Self> {
        let count = uniform_buffers.len() as u32;
        anyhow::ensure!(count > 0, "descriptor sets need at least one uniform buffer");

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(count);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;
        tracker::created(HandleKind::DescriptorPool, 1);

        // From here on Drop owns the pool
        let mut descriptors = Self {
            sets: Vec::new(),
            pool,
            device,
        };

        let layouts = vec![layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        descriptors.sets = unsafe { descriptors.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        for (&set, uniform) in descriptors.sets.iter().zip(uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniform.buffer,
                offset: 0,
                range: uniform.size(),
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.image.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];
            unsafe { descriptors.device.device.update_descriptor_sets(&writes, &[]) };
        }

        log::debug!("Allocated {} descriptor sets", count);
        Ok(descriptors)
    }
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_pool(self.pool, None);
        }
        tracker::destroyed(HandleKind::DescriptorPool, 1);
    }
}
