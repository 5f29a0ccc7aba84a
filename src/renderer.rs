// Frame scheduler
//
// FrameScheduler owns the per-frame protocol and the slot bookkeeping;
// GpuFrames carries each step out against Vulkan. Stale or out-of-date
// presentation is healed by rebuilding the swapchain and everything derived
// from it; it never surfaces to the caller as an error.
//
// FRAME FLOW:
// 1. Wait on the current slot's fence (at most N frames in flight)
// 2. Acquire swapchain image (signals image_available)
// 3. Wait for any other slot still rendering into that image
// 4. Write this image's uniforms, record the draw
// 5. Reset fence, submit (waits image_available, signals render_finished)
// 6. Present (waits render_finished), recreate if stale or resized
// 7. Advance to the next slot

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::assets::{self, MeshData, TextureData};
use crate::backend::buffer::{GpuBuffer, Mesh, ResourceUploader, Texture};
use crate::backend::command::CommandPool;
use crate::backend::descriptor::DescriptorSets;
use crate::backend::pipeline::{ColorTargets, PipelineState};
use crate::backend::swapchain::{wait_for_nonzero_extent, AcquireOutcome, PresentOutcome};
use crate::backend::sync::{FrameSlots, FrameSync};
use crate::backend::watch::ShaderWatcher;
use crate::backend::{DeviceContext, Swapchain};
use crate::camera::{Camera, FrameUniforms};
use crate::config::{AssetConfig, Config};
use crate::error::RenderError;
use crate::window::PresentTarget;

/// Where the scheduler is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

impl FrameState {
    /// Legal moves within a frame. `Acquiring -> Idle` is an aborted frame.
    pub fn can_enter(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Recording)
                | (Acquiring, Idle)
                | (Recording, Submitted)
                | (Submitted, Presenting)
                | (Presenting, Idle)
        )
    }
}

/// Whether the swapchain must be rebuilt once the current frame is presented.
///
/// A suboptimal acquire or present still delivers the frame; the rebuild
/// happens before the next acquire.
pub fn should_recreate(acquire_suboptimal: bool, present: PresentOutcome, resized: bool) -> bool {
    acquire_suboptimal || present.is_stale() || resized
}

/// GPU side of a frame, driven one step at a time by `FrameScheduler`.
pub trait FrameBackend {
    /// Block until `slot`'s submission of `frame` has finished executing.
    fn wait_for_slot(&mut self, slot: usize, frame: u64) -> Result<()>;

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Write per-frame data for `image` and record the slot's commands.
    fn record(&mut self, slot: usize, image: u32) -> Result<()>;

    /// Reset the slot's fence and submit its commands.
    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome>;

    /// Rebuild every swapchain-derived resource and return the new image
    /// count. `None` means the window closed while minimized and nothing
    /// was rebuilt.
    fn recreate(&mut self, target: &mut impl PresentTarget) -> Result<Option<usize>>;
}

/// Frame protocol: which fences to wait on, when to rebuild, when a frame
/// counts as done.
#[derive(Debug)]
pub struct FrameScheduler {
    slots: FrameSlots,
    state: FrameState,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        let mut slots = FrameSlots::new(frames_in_flight);
        slots.reset_images(image_count);
        Self {
            slots,
            state: FrameState::Idle,
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.slots.frame_number()
    }

    fn enter(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_enter(next),
            "illegal frame transition {:?} -> {:?}",
            self.state,
            next
        );
        log::trace!("Frame {}: {:?} -> {:?}", self.slots.frame_number(), self.state, next);
        self.state = next;
    }

    fn wait_for(&self, backend: &mut impl FrameBackend, slot: usize) -> Result<()> {
        match self.slots.pending_for(slot) {
            Some(frame) => backend.wait_for_slot(slot, frame),
            None => Ok(()),
        }
    }

    /// Rebuild the swapchain outside the normal present path.
    pub fn recreate(&mut self, backend: &mut impl FrameBackend, target: &mut impl PresentTarget) -> Result<()> {
        if let Some(image_count) = backend.recreate(target)? {
            self.slots.reset_images(image_count);
            // Resizes delivered while the rebuild pumped events are already
            // reflected in the new extent
            target.clear_resize_signal();
        }
        Ok(())
    }

    /// Run one frame. `resized` is the window's resize signal for this tick.
    pub fn run_frame(
        &mut self,
        backend: &mut impl FrameBackend,
        target: &mut impl PresentTarget,
        resized: bool,
    ) -> Result<()> {
        let slot = self.slots.current();

        // Admission control: blocks while this slot's previous submission is
        // still on the GPU
        self.enter(FrameState::Acquiring);
        self.wait_for(backend, slot)?;

        let (image, acquire_suboptimal) = match backend.acquire(slot)? {
            AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date at acquire");
                self.recreate(backend, target)?;
                // Frame aborted: same slot, same frame number next time
                self.enter(FrameState::Idle);
                return Ok(());
            }
        };

        // Another slot may still be rendering into this image
        if let Some(owner) = self.slots.claim_image(image as usize) {
            self.wait_for(backend, owner)?;
        }

        self.enter(FrameState::Recording);
        backend.record(slot, image)?;

        self.enter(FrameState::Submitted);
        backend.submit(slot)?;
        self.slots.mark_submitted();

        self.enter(FrameState::Presenting);
        let outcome = backend.present(slot, image)?;

        if should_recreate(acquire_suboptimal, outcome, resized) {
            log::debug!(
                "Recreating swapchain after present ({:?}, acquire suboptimal: {}, resized: {})",
                outcome,
                acquire_suboptimal,
                resized
            );
            self.recreate(backend, target)?;
        }

        self.slots.advance();
        self.enter(FrameState::Idle);
        Ok(())
    }
}

/// Everything invalidated by a swapchain rebuild.
///
/// Fields drop in declaration order: framebuffers, pipeline, render pass and
/// depth buffer, then image views and swapchain, then uniform buffers, then
/// the descriptor pool.
struct SwapchainResources {
    pipeline: PipelineState,
    swapchain: Swapchain,
    /// One per swapchain image; host-visible, rewritten every frame
    uniforms: Vec<GpuBuffer>,
    descriptors: DescriptorSets,
}

impl SwapchainResources {
    fn new(
        device: &Arc<DeviceContext>,
        uploader: &ResourceUploader,
        texture: &Texture,
        assets: &AssetConfig,
        framebuffer: (u32, u32),
    ) -> Result<Self> {
        let swapchain = Swapchain::new(device.clone(), framebuffer)?;
        let pipeline = PipelineState::new(
            device.clone(),
            uploader,
            ColorTargets::presentable(&swapchain),
            assets,
        )?;

        let uniforms = (0..swapchain.image_count())
            .map(|_| {
                GpuBuffer::host_visible(
                    device.clone(),
                    std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                )
            })
            .collect::<Result<Vec<_>>>()
            .context("Failed to create uniform buffers")?;

        let descriptors =
            DescriptorSets::new(device.clone(), pipeline.descriptor_set_layout, &uniforms, texture)?;

        Ok(Self {
            pipeline,
            swapchain,
            uniforms,
            descriptors,
        })
    }
}

/// Vulkan side of the frame loop: swapchain-derived resources, per-slot
/// sync and command buffers, and the scene they draw.
struct GpuFrames {
    // Drop order: swapchain-derived state, per-frame sync, command pool,
    // scene resources, uploader. The device outlives all of them via Arc.
    resources: Option<SwapchainResources>,
    frames: Vec<FrameSync>,
    command_buffers: Vec<vk::CommandBuffer>,
    command_pool: CommandPool,
    mesh: Mesh,
    texture: Texture,
    uploader: ResourceUploader,

    camera: Camera,
    clear_color: [f32; 4],
    assets: AssetConfig,
    start: Instant,
    device: Arc<DeviceContext>,
}

impl GpuFrames {
    fn new(device: Arc<DeviceContext>, target: &mut impl PresentTarget, config: &Config) -> Result<Self> {
        let uploader = ResourceUploader::new(device.clone())?;

        let mesh_data = match config.assets.model {
            Some(ref path) => assets::load_model(path)?,
            None => assets::cube(),
        };
        let texture_data = match config.assets.texture {
            Some(ref path) => assets::load_texture(path)?,
            None => assets::checkerboard(256, 8),
        };
        let (mesh, texture) = upload_scene(&uploader, &mesh_data, &texture_data)?;

        let frames_in_flight = config.graphics.max_frames_in_flight;
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut command_pool = CommandPool::new(
            device.clone(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = command_pool.allocate(frames_in_flight as u32)?;

        let framebuffer = wait_for_nonzero_extent(target)
            .context("Window closed before the first frame")?;
        let resources = SwapchainResources::new(&device, &uploader, &texture, &config.assets, framebuffer)?;

        Ok(Self {
            resources: Some(resources),
            frames,
            command_buffers,
            command_pool,
            mesh,
            texture,
            uploader,
            camera: Camera::default(),
            clear_color: config.graphics.clear_color,
            assets: config.assets.clone(),
            start: Instant::now(),
            device,
        })
    }

    fn resources(&self) -> Result<&SwapchainResources> {
        self.resources
            .as_ref()
            .context("Swapchain resources are missing after a failed rebuild")
    }

    fn update_uniforms(&self, image_index: usize) -> Result<()> {
        let resources = self.resources()?;
        let extent = resources.swapchain.extent;
        let uniforms = self.camera.uniforms(
            self.start.elapsed().as_secs_f32(),
            extent.width,
            extent.height,
        );
        resources.uniforms[image_index].write_bytes(bytemuck::bytes_of(&uniforms))
    }

    fn record_commands(&self, slot: usize, image_index: usize) -> Result<()> {
        let resources = self.resources()?;
        let device = &self.device.device;
        let cmd = self.command_buffers[slot];

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(resources.pipeline.render_pass)
            .framebuffer(resources.pipeline.framebuffers[image_index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: resources.swapchain.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .context("Failed to begin command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, resources.pipeline.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.mesh.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                resources.pipeline.pipeline_layout,
                0,
                &[resources.descriptors.sets[image_index]],
                &[],
            );
            device.cmd_draw_indexed(cmd, self.mesh.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }
        Ok(())
    }
}

impl FrameBackend for GpuFrames {
    fn wait_for_slot(&mut self, slot: usize, frame: u64) -> Result<()> {
        log::trace!("Waiting on slot {} for frame {}", slot, frame);
        self.frames[slot].wait()
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.resources()?
            .swapchain
            .acquire_next_image(self.frames[slot].image_available)
    }

    fn record(&mut self, slot: usize, image: u32) -> Result<()> {
        self.update_uniforms(image as usize)?;
        self.record_commands(slot, image as usize)
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.frames[slot];
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [self.command_buffers[slot]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        // Reset only now: an aborted frame must leave the fence signaled
        frame.reset()?;
        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], frame.in_flight_fence)
                .map_err(RenderError::vulkan("vkQueueSubmit"))?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<PresentOutcome> {
        self.resources()?.swapchain.present(
            self.device.present_queue,
            image,
            &[self.frames[slot].render_finished],
        )
    }

    /// Blocks while the framebuffer is 0x0. If the window closes during that
    /// wait the old resources are kept and the caller's close check ends
    /// the loop.
    fn recreate(&mut self, target: &mut impl PresentTarget) -> Result<Option<usize>> {
        let Some(framebuffer) = wait_for_nonzero_extent(target) else {
            return Ok(None);
        };

        self.device.wait_idle()?;

        // All-or-nothing: drop everything before building anything
        self.resources = None;
        let resources = SwapchainResources::new(
            &self.device,
            &self.uploader,
            &self.texture,
            &self.assets,
            framebuffer,
        )
        .context("Failed to recreate swapchain")?;

        let image_count = resources.swapchain.image_count();
        log::info!(
            "Swapchain recreated at {}x{} with {} images",
            resources.swapchain.extent.width,
            resources.swapchain.extent.height,
            image_count
        );
        self.resources = Some(resources);
        Ok(Some(image_count))
    }
}

impl Drop for GpuFrames {
    fn drop(&mut self) {
        // Nothing may be destroyed while the GPU still reads it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {:#}", e);
        }
    }
}

pub struct Renderer {
    scheduler: FrameScheduler,
    watcher: Option<ShaderWatcher>,
    gpu: GpuFrames,
}

impl Renderer {
    pub fn new(device: Arc<DeviceContext>, target: &mut impl PresentTarget, config: &Config) -> Result<Self> {
        let gpu = GpuFrames::new(device, target, config)?;
        let image_count = gpu.resources()?.swapchain.image_count();
        let frames_in_flight = config.graphics.max_frames_in_flight;

        let watcher = if config.debug.watch_shaders {
            let shaders = [
                config.assets.vertex_shader.as_path(),
                config.assets.fragment_shader.as_path(),
            ];
            match ShaderWatcher::new(&shaders) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        log::info!("Renderer ready: {} frame(s) in flight", frames_in_flight);

        Ok(Self {
            scheduler: FrameScheduler::new(frames_in_flight, image_count),
            watcher,
            gpu,
        })
    }

    pub fn frame_number(&self) -> u64 {
        self.scheduler.frame_number()
    }

    /// Run one frame. `resized` is the window's resize signal for this tick.
    pub fn draw_frame(&mut self, target: &mut impl PresentTarget, resized: bool) -> Result<()> {
        if self.watcher.as_ref().is_some_and(|w| w.poll_changed()) {
            self.scheduler.recreate(&mut self.gpu, target)?;
        }
        self.scheduler.run_frame(&mut self.gpu, target, resized)
    }
}

fn upload_scene(
    uploader: &ResourceUploader,
    mesh: &MeshData,
    texture: &TextureData,
) -> Result<(Mesh, Texture)> {
    let mesh = uploader
        .upload_mesh(&mesh.vertices, &mesh.indices)
        .context("Failed to upload mesh")?;
    let texture = uploader
        .upload_texture(&texture.pixels, texture.width, texture.height)
        .context("Failed to upload texture")?;
    Ok((mesh, texture))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pipeline::create_descriptor_set_layout;
    use crate::backend::tracker;

    /// Window whose event pump always reports a resize.
    #[derive(Default)]
    struct TestWindow {
        resized: bool,
        pumped: usize,
    }

    impl PresentTarget for TestWindow {
        fn framebuffer_size(&self) -> (u32, u32) {
            (1440, 900)
        }

        fn wait_events(&mut self) {
            self.pumped += 1;
            self.resized = true;
        }

        fn clear_resize_signal(&mut self) {
            self.resized = false;
        }
    }

    /// Backend that executes nothing. A submitted frame stays busy until its
    /// slot is waited on, so a skipped wait shows up as an overlap.
    struct ScriptedGpu {
        image_count: usize,
        /// Frame each slot is still executing
        busy: Vec<Option<u64>>,
        /// Slot that last rendered into each image
        image_user: Vec<Option<usize>>,
        image_order: Vec<u32>,
        acquires: u64,
        images_handed_out: usize,
        submits: u64,
        out_of_date_acquires: Vec<u64>,
        suboptimal_presents: Vec<u64>,
        max_busy: usize,
        log: Vec<String>,
    }

    impl ScriptedGpu {
        fn new(slots: usize, image_count: usize) -> Self {
            Self {
                image_count,
                busy: vec![None; slots],
                image_user: vec![None; image_count],
                image_order: (0..image_count as u32).collect(),
                acquires: 0,
                images_handed_out: 0,
                submits: 0,
                out_of_date_acquires: Vec::new(),
                suboptimal_presents: Vec::new(),
                max_busy: 0,
                log: Vec::new(),
            }
        }

        fn waits(&self) -> Vec<&str> {
            self.log
                .iter()
                .filter(|event| event.starts_with("wait"))
                .map(String::as_str)
                .collect()
        }

        fn count(&self, event: &str) -> usize {
            self.log.iter().filter(|e| *e == event).count()
        }

        fn at(&self, event: &str) -> usize {
            self.log
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("{:?} not in {:?}", event, self.log))
        }
    }

    impl FrameBackend for ScriptedGpu {
        fn wait_for_slot(&mut self, slot: usize, frame: u64) -> Result<()> {
            assert!(
                self.busy[slot].is_none() || self.busy[slot] == Some(frame),
                "waited for frame {} but slot {} runs {:?}",
                frame,
                slot,
                self.busy[slot]
            );
            self.log.push(format!("wait slot {} frame {}", slot, frame));
            self.busy[slot] = None;
            Ok(())
        }

        fn acquire(&mut self, _slot: usize) -> Result<AcquireOutcome> {
            let attempt = self.acquires;
            self.acquires += 1;
            if self.out_of_date_acquires.contains(&attempt) {
                self.log.push(format!("acquire {} out of date", self.submits));
                return Ok(AcquireOutcome::OutOfDate);
            }

            let index = self.image_order[self.images_handed_out % self.image_order.len()];
            self.images_handed_out += 1;
            self.log.push(format!("acquire {}", self.submits));
            Ok(AcquireOutcome::Acquired {
                index,
                suboptimal: false,
            })
        }

        fn record(&mut self, slot: usize, image: u32) -> Result<()> {
            assert!(self.busy[slot].is_none(), "slot {} recorded while still executing", slot);
            if let Some(user) = self.image_user[image as usize] {
                assert!(
                    self.busy[user].is_none(),
                    "image {} recorded while slot {} still renders into it",
                    image,
                    user
                );
            }
            self.image_user[image as usize] = Some(slot);
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.busy[slot] = Some(self.submits);
            self.max_busy = self.max_busy.max(self.busy.iter().flatten().count());
            self.log.push(format!("submit {}", self.submits));
            self.submits += 1;
            Ok(())
        }

        fn present(&mut self, _slot: usize, _image: u32) -> Result<PresentOutcome> {
            let frame = self.submits - 1;
            self.log.push(format!("present {}", frame));
            if self.suboptimal_presents.contains(&frame) {
                Ok(PresentOutcome::Suboptimal)
            } else {
                Ok(PresentOutcome::Optimal)
            }
        }

        fn recreate(&mut self, target: &mut impl PresentTarget) -> Result<Option<usize>> {
            target.wait_events();
            self.log.push("recreate".to_string());
            // Device idle, then fresh images
            self.busy.iter_mut().for_each(|frame| *frame = None);
            self.image_user = vec![None; self.image_count];
            Ok(Some(self.image_count))
        }
    }

    fn run(scheduler: &mut FrameScheduler, gpu: &mut ScriptedGpu, window: &mut TestWindow, frames: usize) {
        for _ in 0..frames {
            scheduler.run_frame(gpu, window, false).unwrap();
        }
    }

    #[test]
    fn optimal_present_without_resize_keeps_swapchain() {
        assert!(!should_recreate(false, PresentOutcome::Optimal, false));
    }

    #[test]
    fn stale_presentation_or_resize_recreates() {
        assert!(should_recreate(false, PresentOutcome::OutOfDate, false));
        assert!(should_recreate(false, PresentOutcome::Suboptimal, false));
        assert!(should_recreate(false, PresentOutcome::Optimal, true));
        assert!(should_recreate(true, PresentOutcome::Optimal, false));
    }

    #[test]
    fn frame_states_follow_the_frame_flow() {
        use FrameState::*;
        let flow = [Idle, Acquiring, Recording, Submitted, Presenting, Idle];
        for pair in flow.windows(2) {
            assert!(pair[0].can_enter(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(Acquiring.can_enter(Idle));
        assert!(!Idle.can_enter(Recording));
        assert!(!Recording.can_enter(Presenting));
        assert!(!Submitted.can_enter(Idle));
    }

    #[test]
    fn third_frame_waits_on_first_frame() {
        let mut scheduler = FrameScheduler::new(2, 3);
        let mut gpu = ScriptedGpu::new(2, 3);
        let mut window = TestWindow::default();

        run(&mut scheduler, &mut gpu, &mut window, 2);
        assert!(gpu.waits().is_empty());

        run(&mut scheduler, &mut gpu, &mut window, 1);
        assert_eq!(gpu.waits(), vec!["wait slot 0 frame 0"]);
        assert_eq!(scheduler.frame_number(), 3);
    }

    #[test]
    fn frames_in_flight_never_exceed_slot_count() {
        for slots in 1..=4 {
            let mut scheduler = FrameScheduler::new(slots, 3);
            let mut gpu = ScriptedGpu::new(slots, 3);
            let mut window = TestWindow::default();

            run(&mut scheduler, &mut gpu, &mut window, 20);
            assert_eq!(gpu.submits, 20);
            // Three images also cap overlap: a fourth slot has to wait for
            // the image it was handed
            assert_eq!(gpu.max_busy, slots.min(3), "{} slot(s)", slots);
        }
    }

    #[test]
    fn image_held_by_other_slot_is_waited_for() {
        let mut scheduler = FrameScheduler::new(2, 3);
        let mut gpu = ScriptedGpu::new(2, 3);
        gpu.image_order = vec![0, 1, 1];
        let mut window = TestWindow::default();

        run(&mut scheduler, &mut gpu, &mut window, 3);
        // Frame 2 runs in slot 0 but was handed the image frame 1 uses
        assert_eq!(gpu.waits(), vec!["wait slot 0 frame 0", "wait slot 1 frame 1"]);
    }

    #[test]
    fn suboptimal_frame_presents_then_recreates_before_next_acquire() {
        let mut scheduler = FrameScheduler::new(2, 3);
        let mut gpu = ScriptedGpu::new(2, 3);
        gpu.suboptimal_presents = vec![10];
        let mut window = TestWindow::default();

        run(&mut scheduler, &mut gpu, &mut window, 12);

        assert_eq!(gpu.count("recreate"), 1);
        assert!(gpu.at("present 10") < gpu.at("recreate"));
        assert!(gpu.at("recreate") < gpu.at("acquire 11"));
        assert_eq!(scheduler.frame_number(), 12);
    }

    #[test]
    fn out_of_date_acquire_recreates_without_advancing() {
        let mut scheduler = FrameScheduler::new(2, 3);
        let mut gpu = ScriptedGpu::new(2, 3);
        gpu.out_of_date_acquires = vec![3];
        let mut window = TestWindow::default();

        run(&mut scheduler, &mut gpu, &mut window, 4);
        assert_eq!(scheduler.frame_number(), 3);
        assert_eq!(scheduler.state, FrameState::Idle);
        assert_eq!(gpu.submits, 3);
        let aborted = gpu.at("acquire 3 out of date");
        assert_eq!(gpu.log[aborted + 1], "recreate");

        // Retried in the same slot with the same frame number
        run(&mut scheduler, &mut gpu, &mut window, 1);
        assert_eq!(scheduler.frame_number(), 4);
        assert!(gpu.at("recreate") < gpu.at("acquire 3"));
        assert_eq!(gpu.waits().last(), Some(&"wait slot 1 frame 1"));
    }

    #[test]
    fn resize_seen_during_rebuild_does_not_rebuild_again() {
        let mut scheduler = FrameScheduler::new(2, 3);
        let mut gpu = ScriptedGpu::new(2, 3);
        let mut window = TestWindow::default();

        scheduler.run_frame(&mut gpu, &mut window, true).unwrap();
        assert_eq!(gpu.count("recreate"), 1);
        assert!(window.pumped > 0);
        assert!(!window.resized);

        for _ in 0..3 {
            let resized = std::mem::take(&mut window.resized);
            scheduler.run_frame(&mut gpu, &mut window, resized).unwrap();
        }
        assert_eq!(gpu.count("recreate"), 1);
    }

    #[test]
    #[ignore = "requires a Vulkan-capable GPU"]
    fn staged_upload_reads_back_identical() {
        let _gpu = tracker::lock_for_test();
        let device = DeviceContext::new("upload-test", false, None).unwrap();
        let uploader = ResourceUploader::new(device.clone()).unwrap();

        let payload: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let buffer = uploader
            .upload_buffer(&payload, vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        assert_eq!(uploader.read_back(&buffer).unwrap(), payload);
    }

    #[test]
    #[ignore = "requires a Vulkan-capable GPU"]
    fn scene_and_frame_resources_release_every_handle() {
        let _gpu = tracker::lock_for_test();
        let baseline = tracker::snapshot();

        {
            let device = DeviceContext::new("leak-test", false, None).unwrap();
            let uploader = ResourceUploader::new(device.clone()).unwrap();
            let (_mesh, texture) =
                upload_scene(&uploader, &assets::cube(), &assets::checkerboard(64, 4)).unwrap();

            let _depth = uploader
                .create_depth_image(
                    vk::Extent2D {
                        width: 1440,
                        height: 900,
                    },
                    vk::Format::D32_SFLOAT,
                )
                .unwrap();

            let frames: Vec<FrameSync> = (0..2).map(|_| FrameSync::new(device.clone()).unwrap()).collect();
            let mut pool = CommandPool::new(device.clone(), vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER).unwrap();
            pool.allocate(frames.len() as u32).unwrap();

            let layout = create_descriptor_set_layout(&device).unwrap();
            let uniforms: Vec<GpuBuffer> = (0..3)
                .map(|_| {
                    GpuBuffer::host_visible(
                        device.clone(),
                        std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                    )
                    .unwrap()
                })
                .collect();
            let descriptors = DescriptorSets::new(device.clone(), layout, &uniforms, &texture).unwrap();
            assert_eq!(descriptors.sets.len(), 3);

            assert!(tracker::snapshot() != baseline);
            drop(descriptors);
            unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
        }

        assert_eq!(tracker::snapshot(), baseline);
    }

    #[test]
    #[ignore = "requires a Vulkan-capable GPU"]
    fn frame_fence_blocks_until_submission_completes() {
        let _gpu = tracker::lock_for_test();
        let device = DeviceContext::new("fence-test", false, None).unwrap();
        let frame = FrameSync::new(device.clone()).unwrap();

        // Created signaled: the first wait on a fresh slot returns at once
        frame.wait().unwrap();

        frame.reset().unwrap();
        let status = unsafe { device.device.get_fence_status(frame.in_flight_fence) };
        assert_eq!(status, Ok(false));

        unsafe {
            device
                .device
                .queue_submit(device.graphics_queue, &[], frame.in_flight_fence)
                .unwrap();
        }
        frame.wait().unwrap();
        let status = unsafe { device.device.get_fence_status(frame.in_flight_fence) };
        assert_eq!(status, Ok(true));
    }
}
