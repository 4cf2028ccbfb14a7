// =============================================================================
// VKBASE DEMO - Clears the window through the device/presentation core
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire swapchain image (the core recreates a stale swapchain)
// 2. Wait for the frame that last used this sync slot, and for any other
//    frame still rendering to the acquired image
// 3. Submit the clear commands recorded for that image
// 4. Present
//
// The demo owns its command pool and buffers. It learns about device and
// swapchain changes only through the lifecycle callbacks.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::Window,
};

use vkbase::backend::{AshDriver, FramesInFlight, GraphicsContext, ImagesInFlight, RecreateOutcome};
use vkbase::config::Config;
use vkbase::window::{native_fullscreen, window_attributes, WindowSurface};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vkbase demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    vkbase::backend::set_escalation_handler(|result| {
        log::error!("Vulkan result dropped without being checked: {:?}", result);
    });

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Level from config; `RUST_LOG` still wins.
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// CLEAR PASS - renderer-owned GPU objects
// =============================================================================

#[derive(Default)]
struct ClearPass {
    command_pool: vk::CommandPool,
    /// One per swapchain image
    command_buffers: Vec<vk::CommandBuffer>,
    frames: FramesInFlight,
    /// Frame fence that last submitted each command buffer
    images_in_flight: ImagesInFlight,
    needs_recording: bool,
}

impl ClearPass {
    fn ensure_device_objects(&mut self, driver: &AshDriver, queue_family: u32, frames: usize) -> Result<()> {
        if self.command_pool != vk::CommandPool::null() {
            return Ok(());
        }
        let device = driver.device()?;
        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(queue_family);
        self.command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        self.frames = FramesInFlight::new(driver, frames)?;
        self.needs_recording = true;
        Ok(())
    }

    fn free_command_buffers(&mut self, driver: &AshDriver) {
        if self.command_buffers.is_empty() {
            return;
        }
        if let Ok(device) = driver.device() {
            unsafe { device.free_command_buffers(self.command_pool, &self.command_buffers) };
        }
        self.command_buffers.clear();
        self.images_in_flight.clear();
    }

    fn destroy_device_objects(&mut self, driver: &AshDriver) {
        self.free_command_buffers(driver);
        self.frames.destroy(driver);
        if let Ok(device) = driver.device() {
            if self.command_pool != vk::CommandPool::null() {
                unsafe { device.destroy_command_pool(self.command_pool, None) };
            }
        }
        self.command_pool = vk::CommandPool::null();
    }

    /// Record clear -> present for every swapchain image.
    fn record(&mut self, driver: &AshDriver, images: &[vk::Image], color: [f32; 4]) -> Result<()> {
        self.free_command_buffers(driver);
        let device = driver.device()?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(images.len() as u32);
        self.command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        let clear_color = vk::ClearColorValue { float32: color };
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        for (&cmd, &image) in self.command_buffers.iter().zip(images) {
            unsafe {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                device.begin_command_buffer(cmd, &begin_info)?;

                // UNDEFINED -> TRANSFER_DST, old contents are discarded
                let to_transfer = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subresource_range)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );

                device.cmd_clear_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear_color,
                    &[subresource_range],
                );

                let to_present = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::empty())
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subresource_range)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_present],
                );

                device.end_command_buffer(cmd)?;
            }
        }

        self.images_in_flight.reset(self.command_buffers.len());
        self.needs_recording = false;
        log::debug!("Recorded {} clear command buffers", self.command_buffers.len());
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the context (and its surface) must go
/// before the window.
struct App {
    config: Config,
    context: Option<GraphicsContext>,
    pass: Rc<RefCell<ClearPass>>,
    window: Option<Window>,
    is_fullscreen: bool,
    /// Set on resize, handled at the start of the next frame
    needs_resize: bool,
    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            context: None,
            pass: Rc::new(RefCell::new(ClearPass::default())),
            window: None,
            is_fullscreen,
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_graphics(&mut self, window: &Window) -> Result<()> {
        let mut context = GraphicsContext::with_surface(self.config.context_settings(), &WindowSurface::new(window))
            .context("Failed to create Vulkan instance and surface")?;

        let callbacks = context.callbacks_mut();
        let pass = self.pass.clone();
        callbacks.on_device_destroying(move |driver: &AshDriver| pass.borrow_mut().destroy_device_objects(driver));
        let pass = self.pass.clone();
        callbacks.on_swapchain_destroying(move |driver: &AshDriver| pass.borrow_mut().free_command_buffers(driver));
        let pass = self.pass.clone();
        callbacks.on_swapchain_created(move |_: &AshDriver| pass.borrow_mut().needs_recording = true);

        context.initialize().context("Failed to initialize graphics context")?;
        self.context = Some(context);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let context = self.context.as_mut().context("Graphics context not initialized")?;

        if self.needs_resize {
            self.needs_resize = false;
            let size = self.window.as_ref().map(|w| w.inner_size()).unwrap_or_default();
            if context.resize(size.width, size.height)? == RecreateOutcome::Deferred {
                return Ok(false);
            }
        }

        let queue_family = context.queues().graphics.context("No graphics queue")?.family;
        let sync = {
            let mut pass = self.pass.borrow_mut();
            pass.ensure_device_objects(
                context.driver(),
                queue_family,
                self.config.graphics.max_frames_in_flight,
            )?;
            *pass.frames.current().context("No frame sync objects")?
        };

        // Callbacks may run in here, so the pass must not be borrowed.
        let Some(image_index) = context.acquire_next_image(sync.image_available, vk::Fence::null())? else {
            return Ok(false);
        };

        context.wait_for_fence(sync.in_flight_fence).into_result()?;

        let (cmd, image_fence) = {
            let mut pass = self.pass.borrow_mut();
            if pass.needs_recording {
                let images = context.swapchain().map(|s| s.images()).unwrap_or_default();
                pass.record(context.driver(), images, self.config.graphics.clear_color)?;
            }
            let cmd = *pass
                .command_buffers
                .get(image_index as usize)
                .context("No command buffer for swapchain image")?;
            (cmd, pass.images_in_flight.claim(image_index as usize, sync.in_flight_fence))
        };

        // Another frame slot may still be executing this image's commands.
        if let Some(fence) = image_fence {
            context.wait_for_fence(fence).into_result()?;
        }
        context.reset_fence(sync.in_flight_fence).into_result()?;

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [cmd];
        let signal_semaphores = [sync.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        context
            .submit_graphics(&[submit_info], sync.in_flight_fence)
            .into_result()?;

        context.present(image_index, &signal_semaphores)?;

        self.pass.borrow_mut().frames.advance();
        Ok(true)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(native_fullscreen(window.current_monitor())));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            self.needs_resize = true;
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let settings = self.config.context_settings();
        let attributes = window_attributes(event_loop, &self.config.window.title, &settings);
        let window = match event_loop.create_window(attributes) {
            Ok(w) => w,
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_graphics(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref context) = self.context {
                    context.wait_idle().ignore();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                if !self.is_minimized {
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:?}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            // Exercise the full device rebuild path
                            KeyCode::F5 => {
                                if let Some(ref mut context) = self.context {
                                    if let Err(e) = context.rebuild_device() {
                                        log::error!("Device rebuild failed: {:?}", e);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Device-destroy callbacks release the pass while the device is alive.
        self.context = None;
        log::info!("Cleanup complete");
    }
}
