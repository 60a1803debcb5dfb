// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for the target window
// - Physical device selection (first adapter that qualifies)
// - Logical device + graphics/present/transfer queues
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::window::AppWindow;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices for one (adapter, surface) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
    /// Dedicated transfer family, or the graphics family when none exists.
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Scan queue families in order. `present_support[i]` says whether family
    /// `i` can present to the surface. Returns `None` unless both a graphics
    /// and a present family are found.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        present_support: &[bool],
    ) -> Option<Self> {
        let mut graphics = None;
        let mut present = None;
        let mut transfer = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let is_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let is_transfer = family.queue_flags.contains(vk::QueueFlags::TRANSFER);

            if is_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if is_transfer && !is_graphics && transfer.is_none() {
                transfer = Some(index);
            }
            if present_support.get(index as usize).copied().unwrap_or(false) && present.is_none() {
                present = Some(index);
            }
        }

        let graphics = graphics?;
        Some(Self {
            graphics,
            present: present?,
            transfer: transfer.unwrap_or(graphics),
        })
    }

    pub fn unique(&self) -> BTreeSet<u32> {
        [self.graphics, self.present, self.transfer].into_iter().collect()
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }
}

/// Everything adapter selection needs to know about one candidate
#[derive(Debug, Default, Clone)]
pub struct AdapterReport {
    pub queue_families: Option<QueueFamilyIndices>,
    pub missing_extensions: Vec<String>,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
    pub sampler_anisotropy: bool,
}

impl AdapterReport {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_some()
            && self.missing_extensions.is_empty()
            && self.surface_format_count > 0
            && self.present_mode_count > 0
            && self.sampler_anisotropy
    }
}

/// Surface queries made once during selection. Adapter and surface are
/// fixed for the lifetime of the device, so these never go stale.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the logical device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    pub surface_support: SurfaceSupport,

    // Queue handles (present may alias graphics)
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: vk::Queue,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub msaa_samples: vk::SampleCountFlags,
}

impl VulkanDevice {
    /// Create the device context for `window`.
    ///
    /// Runs once at startup; any failure is fatal.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        max_samples: u32,
        window: &AppWindow,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        if enable_validation && !Self::validation_layer_available(&entry)? {
            anyhow::bail!(
                "Validation layers requested, but {} is not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }

        let instance = Self::create_instance(&entry, app_name, enable_validation, window)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = window.create_surface(&entry, &instance)?;

        let (physical_device, queue_families, surface_support) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue, transfer_queue) =
            Self::create_logical_device(&instance, physical_device, &queue_families)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let msaa_samples = max_usable_sample_count(&properties.limits, max_samples);

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
        log::info!("Queue families: {:?}, MSAA: {:?}", queue_families, msaa_samples);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            surface_support,
            queue_families,
            graphics_queue,
            present_queue,
            transfer_queue,
            debug_utils,
            properties,
            msaa_samples,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        Ok(layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        window: &AppWindow,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("No Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = window.required_extensions()?.to_vec();
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

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
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

    /// Take the first adapter, in enumeration order, that satisfies every
    /// requirement. No scoring.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, SurfaceSupport)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        for device in devices {
            let (report, support) =
                Self::inspect_adapter(instance, surface_loader, surface, device)?;
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            match (report.is_suitable(), report.queue_families) {
                (true, Some(families)) => return Ok((device, families, support)),
                _ => log::debug!("Skipping adapter {}: {:?}", name, report),
            }
        }

        anyhow::bail!("No suitable GPU found")
    }

    fn inspect_adapter(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<(AdapterReport, SurfaceSupport)> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let present_support = (0..families.len() as u32)
            .map(|index| unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
            })
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query surface support")?;

        let available = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")?;
        let missing_extensions = required_device_extensions()
            .iter()
            .filter(|required| {
                !available.iter().any(|ext| {
                    (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == *required
                })
            })
            .map(|name| name.to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        // Surface queries are only meaningful once the swapchain extension is there
        let support = if missing_extensions.is_empty() {
            unsafe {
                SurfaceSupport {
                    formats: surface_loader
                        .get_physical_device_surface_formats(device, surface)
                        .context("Failed to query surface formats")?,
                    present_modes: surface_loader
                        .get_physical_device_surface_present_modes(device, surface)
                        .context("Failed to query present modes")?,
                }
            }
        } else {
            SurfaceSupport {
                formats: Vec::new(),
                present_modes: Vec::new(),
            }
        };

        let features = unsafe { instance.get_physical_device_features(device) };

        let report = AdapterReport {
            queue_families: QueueFamilyIndices::find(&families, &present_support),
            missing_extensions,
            surface_format_count: support.formats.len(),
            present_mode_count: support.present_modes.len(),
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
        };

        Ok((report, support))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect::<Vec<_>>();

        let extensions = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let (graphics_queue, present_queue, transfer_queue) = unsafe {
            (
                device.get_device_queue(families.graphics, 0),
                device.get_device_queue(families.present, 0),
                device.get_device_queue(families.transfer, 0),
            )
        };

        Ok((device, graphics_queue, present_queue, transfer_queue))
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .context("Failed to query surface capabilities")
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Highest sample count both colour and depth framebuffers support,
/// capped at `max_samples`.
pub fn max_usable_sample_count(
    limits: &vk::PhysicalDeviceLimits,
    max_samples: u32,
) -> vk::SampleCountFlags {
    let counts =
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;

    [
        (64, vk::SampleCountFlags::TYPE_64),
        (32, vk::SampleCountFlags::TYPE_32),
        (16, vk::SampleCountFlags::TYPE_16),
        (8, vk::SampleCountFlags::TYPE_8),
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
    ]
    .into_iter()
    .find(|&(samples, flag)| samples <= max_samples && counts.contains(flag))
    .map_or(vk::SampleCountFlags::TYPE_1, |(_, flag)| flag)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
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

    #[test]
    fn finds_dedicated_transfer_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING),
        ];
        let indices = QueueFamilyIndices::find(&families, &[true, false, false]).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                present: 0,
                transfer: 2,
            }
        );
        assert!(indices.has_dedicated_transfer());
        assert_eq!(indices.unique().len(), 2);
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::find(&families, &[true]).unwrap();
        assert_eq!(indices.transfer, indices.graphics);
        assert!(!indices.has_dedicated_transfer());
        assert_eq!(indices.unique().len(), 1);
    }

    #[test]
    fn present_family_may_differ_from_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::COMPUTE)];
        let indices = QueueFamilyIndices::find(&families, &[false, true]).unwrap();
        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, 1);
    }

    #[test]
    fn no_present_support_is_incomplete() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(QueueFamilyIndices::find(&families, &[false]).is_none());
        assert!(QueueFamilyIndices::find(&[], &[]).is_none());
    }

    #[test]
    fn adapter_needs_every_capability() {
        let good = AdapterReport {
            queue_families: Some(QueueFamilyIndices {
                graphics: 0,
                present: 0,
                transfer: 0,
            }),
            missing_extensions: Vec::new(),
            surface_format_count: 2,
            present_mode_count: 1,
            sampler_anisotropy: true,
        };
        assert!(good.is_suitable());

        let no_aniso = AdapterReport {
            sampler_anisotropy: false,
            ..good.clone()
        };
        let no_formats = AdapterReport {
            surface_format_count: 0,
            ..good.clone()
        };
        let no_modes = AdapterReport {
            present_mode_count: 0,
            ..good.clone()
        };
        let missing_ext = AdapterReport {
            missing_extensions: vec!["VK_KHR_swapchain".into()],
            ..good.clone()
        };
        let no_queues = AdapterReport {
            queue_families: None,
            ..good.clone()
        };

        for report in [no_aniso, no_formats, no_modes, missing_ext, no_queues] {
            assert!(!report.is_suitable(), "{:?}", report);
        }
    }

    #[test]
    fn sample_count_respects_both_limits_and_cap() {
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        };
        assert_eq!(max_usable_sample_count(&limits, 64), vk::SampleCountFlags::TYPE_4);
        assert_eq!(max_usable_sample_count(&limits, 2), vk::SampleCountFlags::TYPE_2);
        assert_eq!(max_usable_sample_count(&limits, 1), vk::SampleCountFlags::TYPE_1);
    }
}
