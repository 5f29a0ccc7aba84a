// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc<DeviceContext>,
// so the device and instance outlive everything created from them.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod tracker;
pub mod watch;

pub use device::DeviceContext;
pub use swapchain::Swapchain;
