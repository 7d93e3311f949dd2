// Renderer error types
//
// Every fallible GPU call surfaces here. The kind() split tells the caller
// whether to abort, whether the surface went stale, or whether it broke a
// usage contract (resource lifetimes, frame ordering).

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

use crate::backend::device::DeviceCapability;
use crate::renderer::FramePhase;

/// Broad classification of a [`RenderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device, driver or setup failure. The process cannot continue.
    Fatal,
    /// The swapchain no longer matches the surface (resize, minimize).
    /// Swapchain re-creation is not supported, so callers report and stop.
    SurfaceInvalidated,
    /// The caller broke an ordering or lifetime rule.
    ContractViolation,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("No Vulkan-capable GPU found")]
    NoDevice,

    #[error("Missing required capability: {0}")]
    MissingCapability(DeviceCapability),

    #[error("{operation} failed: {result}")]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },

    #[error("Window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("Swapchain is out of date with its surface")]
    SwapchainOutOfDate,

    #[error("Swapchain is suboptimal for its surface")]
    SwapchainSuboptimal,

    #[error("Swapchain has {images} images, need at least {frames_in_flight} for the frames in flight")]
    InsufficientImages {
        images: usize,
        frames_in_flight: usize,
    },

    #[error("Invalid shader bytecode: {0}")]
    InvalidShader(String),

    #[error("Failed to read shader {path:?}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{resource} is still referenced by {holders} other owner(s)")]
    ResourceInUse {
        resource: &'static str,
        holders: usize,
    },

    #[error("{operation} called while frame is {phase:?}")]
    InvalidFrameState {
        operation: &'static str,
        phase: FramePhase,
    },
}

impl RenderError {
    /// Wrap a raw Vulkan result with the name of the call that produced it.
    pub fn vulkan(operation: &'static str, result: vk::Result) -> Self {
        RenderError::Vulkan { operation, result }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderError::SwapchainOutOfDate | RenderError::SwapchainSuboptimal => {
                ErrorKind::SurfaceInvalidated
            }
            RenderError::ResourceInUse { .. } | RenderError::InvalidFrameState { .. } => {
                ErrorKind::ContractViolation
            }
            _ => ErrorKind::Fatal,
        }
    }
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
