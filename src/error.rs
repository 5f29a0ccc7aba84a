// Error taxonomy and the fatal reporting path
//
// Setup failures and API failures all end up in `or_fatal`: one log line naming
// the call site, then a non-zero exit. Presentation staleness never reaches
// this module, the frame scheduler heals it by recreating the swapchain.

use ash::vk;
use std::panic::Location;
use std::path::PathBuf;
use thiserror::Error;

/// Unrecoverable renderer conditions that have a name of their own.
///
/// Anything else is carried as `anyhow::Error` with context attached at the
/// failing call.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no GPU satisfies the swapchain, presentation and surface requirements")]
    NoCompatibleAdapter,

    #[error("instance layer {0} was requested but is not installed")]
    LayerUnavailable(String),

    #[error("cannot open shader blob {path:?}: {source}")]
    ShaderUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no memory type matches filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("unsupported image layout transition {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    #[error("no supported depth attachment format")]
    NoDepthFormat,

    #[error("failed to decode asset {path:?}: {reason}")]
    AssetDecode { path: PathBuf, reason: String },

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

impl RenderError {
    pub fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Vulkan { call, result }
    }
}

/// Format the single diagnostic line emitted before a fatal exit.
pub fn fatal_message(location: &Location<'_>, err: &anyhow::Error) -> String {
    format!("FATAL at {}:{}: {:#}", location.file(), location.line(), err)
}

/// Log `err` at error level with `location` and terminate.
fn exit_fatal(location: &Location<'_>, err: anyhow::Error) -> ! {
    log::error!("{}", fatal_message(location, &err));
    log::logger().flush();
    std::process::exit(1);
}

/// Terminal handling for results the process cannot continue without.
pub trait OrFatal<T> {
    /// Unwrap, or log the error with the caller's location and exit.
    fn or_fatal(self) -> T;

    /// Unwrap, or pass the error and the caller's location to `handler`.
    fn or_report(self, handler: impl FnOnce(&'static Location<'static>, anyhow::Error) -> T) -> T;
}

impl<T> OrFatal<T> for anyhow::Result<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        self.or_report(|location, err| exit_fatal(location, err))
    }

    #[track_caller]
    fn or_report(self, handler: impl FnOnce(&'static Location<'static>, anyhow::Error) -> T) -> T {
        match self {
            Ok(value) => value,
            Err(err) => handler(Location::caller(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn fatal_message_is_one_line_with_call_site() {
        let err = Err::<(), _>(RenderError::NoCompatibleAdapter)
            .context("Failed to initialize device context")
            .unwrap_err();
        let location = Location::caller();
        let message = fatal_message(location, &err);

        assert!(message.starts_with("FATAL at "));
        assert!(message.contains("error.rs:"));
        assert!(message.contains("Failed to initialize device context"));
        assert!(message.contains("no GPU satisfies"));
        assert!(!message.contains('\n'));
    }

    fn failing_setup() -> anyhow::Result<u32> {
        Err(RenderError::NoDepthFormat).context("Failed to create pipeline state")
    }

    #[test]
    fn report_names_the_line_that_consumed_the_error() {
        let expected = line!() + 1;
        let line = failing_setup().or_report(|location, err| {
            let message = fatal_message(location, &err);
            assert!(message.contains(&format!("error.rs:{}:", expected)), "{}", message);
            assert!(message.contains("no supported depth attachment format"));
            location.line()
        });
        assert_eq!(line, expected);
    }

    #[test]
    fn successful_result_passes_through() {
        let value = Ok::<_, anyhow::Error>(7).or_report(|_, _| unreachable!());
        assert_eq!(value, 7);
        assert_eq!(Ok::<_, anyhow::Error>(3).or_fatal(), 3);
    }

    #[test]
    fn vulkan_error_names_the_call() {
        let err = RenderError::vulkan("vkQueueSubmit")(vk::Result::ERROR_DEVICE_LOST);
        assert!(err.to_string().starts_with("vkQueueSubmit failed: "));
        assert!(matches!(
            err,
            RenderError::Vulkan { result: vk::Result::ERROR_DEVICE_LOST, .. }
        ));
    }
}
