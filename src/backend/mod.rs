// Backend module - Vulkan abstraction layer
//
// Design: Thin owning wrappers around ash handles. Every type holds an
// Arc<VulkanDevice> and destroys its handles in Drop.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod recorder;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod upload;

pub use device::VulkanDevice;
