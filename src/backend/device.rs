// Device Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layer + debug messenger
// - Presentation surface for the window (absent for headless contexts)
// - Physical device selection: first suitable adapter in enumeration order
// - Logical device + graphics/present queues
//
// Queue family indices are resolved once here and never change afterwards.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;
use winit::window::Window;

use crate::error::RenderError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Graphics and present queue family indices (may coincide).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Resolve families from the adapter's queue properties.
    ///
    /// The graphics family is shared with presentation when it can present;
    /// otherwise the first present-capable family is used.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Option<Self> {
        let graphics = families
            .iter()
            .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))?
            as u32;

        let present = if supports_present(graphics) {
            graphics
        } else {
            (0..families.len() as u32).find(|&i| supports_present(i))?
        };

        Some(Self { graphics, present })
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Everything the suitability predicate looks at for one adapter.
#[derive(Debug, Clone, Default)]
pub struct DeviceCandidate {
    pub queue_families: Option<QueueFamilies>,
    pub has_swapchain_extension: bool,
    pub has_surface_formats: bool,
    pub has_present_modes: bool,
}

impl DeviceCandidate {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_some()
            && self.has_swapchain_extension
            && self.has_surface_formats
            && self.has_present_modes
    }
}

/// Index of the first suitable candidate. No scoring: enumeration order wins.
pub fn pick_first_suitable(candidates: &[DeviceCandidate]) -> Option<usize> {
    candidates.iter().position(DeviceCandidate::is_suitable)
}

pub fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
}

pub fn has_layer(available: &[vk::LayerProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == name)
}

/// Window surface and the loader that owns its entry points.
pub struct PresentSurface {
    pub loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

/// Vulkan device wrapper with automatic cleanup
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    surface: Option<PresentSurface>,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub validation_enabled: bool,
    pub anisotropy_enabled: bool,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Create the device context.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Require the Khronos validation layer
    /// * `window` - Window to present to; `None` builds a headless context
    pub fn new(app_name: &str, enable_validation: bool, window: Option<&Window>) -> Result<Arc<Self>> {
        log::info!("Creating device context: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        if enable_validation {
            let layers = unsafe { entry.enumerate_instance_layer_properties() }
                .context("Failed to enumerate instance layers")?;
            if !has_layer(&layers, VALIDATION_LAYER) {
                return Err(RenderError::LayerUnavailable(
                    VALIDATION_LAYER.to_string_lossy().into_owned(),
                )
                .into());
            }
        }

        let instance = Self::create_instance(&entry, app_name, enable_validation, window)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = match window {
            Some(window) => Some(Self::create_surface(&entry, &instance, window)?),
            None => None,
        };

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, surface.as_ref())?;

        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let anisotropy_enabled = features.sampler_anisotropy == vk::TRUE;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            queue_families,
            surface.is_some(),
            anisotropy_enabled,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}, anisotropy {}",
            queue_families.graphics,
            queue_families.present,
            if anisotropy_enabled { "enabled" } else { "unavailable" }
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            queue_families,
            graphics_queue,
            present_queue,
            surface,
            debug_utils,
            validation_enabled: enable_validation,
            anisotropy_enabled,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        window: Option<&Window>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Fission Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Platform surface extensions come from the window's display handle
        let mut extensions = match window {
            Some(window) => ash_window::enumerate_required_extensions(window.raw_display_handle())
                .context("Window system is not supported by Vulkan")?
                .to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn create_surface(entry: &Entry, instance: &ash::Instance, window: &Window) -> Result<PresentSurface> {
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok(PresentSurface {
            loader: khr::Surface::new(entry, instance),
            handle,
        })
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<&PresentSurface>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        let mut candidates = Vec::with_capacity(devices.len());
        for &device in &devices {
            let candidate = Self::inspect_device(instance, surface, device)?;
            if !candidate.is_suitable() {
                let props = unsafe { instance.get_physical_device_properties(device) };
                log::debug!(
                    "Skipping {}: {:?}",
                    unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy(),
                    candidate
                );
            }
            candidates.push(candidate);
        }

        let index = pick_first_suitable(&candidates).ok_or(RenderError::NoCompatibleAdapter)?;
        let families = candidates[index]
            .queue_families
            .ok_or(RenderError::NoCompatibleAdapter)?;

        Ok((devices[index], families))
    }

    fn inspect_device(
        instance: &ash::Instance,
        surface: Option<&PresentSurface>,
        device: vk::PhysicalDevice,
    ) -> Result<DeviceCandidate> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let Some(surface) = surface else {
            // Headless: presentation is never exercised
            return Ok(DeviceCandidate {
                queue_families: QueueFamilies::find(&families, |_| true),
                has_swapchain_extension: true,
                has_surface_formats: true,
                has_present_modes: true,
            });
        };

        let queue_families = QueueFamilies::find(&families, |index| unsafe {
            surface
                .loader
                .get_physical_device_surface_support(device, index, surface.handle)
                .unwrap_or(false)
        });

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")?;
        let has_swapchain_extension = has_extension(&extensions, khr::Swapchain::name());

        // Surface support is only queried on adapters that can present at all
        let (has_surface_formats, has_present_modes) = if has_swapchain_extension {
            unsafe {
                let formats = surface
                    .loader
                    .get_physical_device_surface_formats(device, surface.handle)
                    .unwrap_or_default();
                let modes = surface
                    .loader
                    .get_physical_device_surface_present_modes(device, surface.handle)
                    .unwrap_or_default();
                (!formats.is_empty(), !modes.is_empty())
            }
        } else {
            (false, false)
        };

        Ok(DeviceCandidate {
            queue_families,
            has_swapchain_extension,
            has_surface_formats,
            has_present_modes,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
        presentable: bool,
        anisotropy: bool,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presentable {
            vec![khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(anisotropy);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Surface owned by this context; headless contexts have none.
    pub fn surface(&self) -> Result<&PresentSurface> {
        self.surface
            .as_ref()
            .context("Device context was created without a presentation surface")
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle (e.g., before teardown)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.handle, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Validation messages are logged, never fatal
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn layer(name: &str) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::ffi::c_char;
        }
        props
    }

    fn suitable() -> DeviceCandidate {
        DeviceCandidate {
            queue_families: Some(QueueFamilies { graphics: 0, present: 0 }),
            has_swapchain_extension: true,
            has_surface_formats: true,
            has_present_modes: true,
        }
    }

    #[test]
    fn graphics_family_is_reused_for_present_when_possible() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let found = QueueFamilies::find(&families, |_| true).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 1, present: 1 });
        assert_eq!(found.unique(), vec![1]);
    }

    #[test]
    fn separate_present_family_is_found() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilies::find(&families, |index| index == 2).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 0, present: 2 });
        assert_eq!(found.unique(), vec![0, 2]);
    }

    #[test]
    fn missing_graphics_or_present_fails() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert!(QueueFamilies::find(&compute_only, |_| true).is_none());

        let graphics = [family(vk::QueueFlags::GRAPHICS)];
        assert!(QueueFamilies::find(&graphics, |_| false).is_none());
    }

    #[test]
    fn every_requirement_is_mandatory() {
        assert!(suitable().is_suitable());

        let mut no_ext = suitable();
        no_ext.has_swapchain_extension = false;
        assert!(!no_ext.is_suitable());

        let mut no_formats = suitable();
        no_formats.has_surface_formats = false;
        assert!(!no_formats.is_suitable());

        let mut no_modes = suitable();
        no_modes.has_present_modes = false;
        assert!(!no_modes.is_suitable());

        let mut no_queues = suitable();
        no_queues.queue_families = None;
        assert!(!no_queues.is_suitable());
    }

    #[test]
    fn ties_go_to_the_first_enumerated_adapter() {
        let mut rejected = suitable();
        rejected.has_present_modes = false;
        let candidates = [rejected, suitable(), suitable()];
        assert_eq!(pick_first_suitable(&candidates), Some(1));
        assert_eq!(pick_first_suitable(&[DeviceCandidate::default()]), None);
    }

    #[test]
    fn validation_layer_lookup_matches_exact_name() {
        let layers = [layer("VK_LAYER_LUNARG_monitor"), layer("VK_LAYER_KHRONOS_validation")];
        assert!(has_layer(&layers, VALIDATION_LAYER));
        assert!(!has_layer(&layers[..1], VALIDATION_LAYER));
    }
}
