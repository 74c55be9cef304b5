use std::fmt;

#[derive(Debug)]
pub enum CaptureError {
    /// The window handle is null or no longer refers to a live window.
    InvalidHandle(String),

    /// The GPU device could not be created.
    DeviceCreation(anyhow::Error),

    /// The GPU device was removed or hung. Capture cannot continue on
    /// this device; the caller must start a new session.
    DeviceLost { reason: String },

    /// The capture item was closed by the OS (for example the target
    /// window was destroyed).
    ItemClosed,

    /// The compute shader used by the GPU tone-mapper failed to compile.
    ShaderCompilation(String),

    UnsupportedFormat(String),

    BufferOverflow,

    InvalidConfig(String),

    BackendUnavailable(String),

    /// A capture session is already running on this capturer.
    AlreadyCapturing,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureErrorClass {
    /// Synchronous and fatal to the `start` call only.
    Configuration,
    Unsupported,
    /// A single frame failed; the session continues.
    Transient,
    /// The session stops and requires an explicit restart.
    GpuFatal,
}

impl CaptureError {
    pub fn class(&self) -> CaptureErrorClass {
        match self {
            Self::InvalidHandle(_)
            | Self::DeviceCreation(_)
            | Self::InvalidConfig(_)
            | Self::AlreadyCapturing => CaptureErrorClass::Configuration,
            Self::UnsupportedFormat(_) | Self::BackendUnavailable(_) => {
                CaptureErrorClass::Unsupported
            }
            Self::ShaderCompilation(_) | Self::BufferOverflow | Self::Platform(_) => {
                CaptureErrorClass::Transient
            }
            Self::DeviceLost { .. } | Self::ItemClosed => CaptureErrorClass::GpuFatal,
        }
    }

    /// `true` when the error ends the session and capture must be
    /// restarted explicitly.
    pub fn is_terminal(&self) -> bool {
        matches!(self.class(), CaptureErrorClass::GpuFatal)
    }

    pub fn device_lost(reason: impl Into<String>) -> Self {
        Self::DeviceLost {
            reason: reason.into(),
        }
    }

    /// Create a string-based copy of this error suitable for storing in
    /// shared state. The `anyhow`-carrying variants keep their formatted
    /// chain but lose the source objects.
    pub fn to_sendable(&self) -> Self {
        match self {
            Self::InvalidHandle(s) => Self::InvalidHandle(s.clone()),
            Self::DeviceCreation(inner) => Self::DeviceCreation(anyhow::anyhow!("{inner:#}")),
            Self::DeviceLost { reason } => Self::DeviceLost {
                reason: reason.clone(),
            },
            Self::ItemClosed => Self::ItemClosed,
            Self::ShaderCompilation(s) => Self::ShaderCompilation(s.clone()),
            Self::UnsupportedFormat(s) => Self::UnsupportedFormat(s.clone()),
            Self::BufferOverflow => Self::BufferOverflow,
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::BackendUnavailable(s) => Self::BackendUnavailable(s.clone()),
            Self::AlreadyCapturing => Self::AlreadyCapturing,
            Self::Platform(inner) => Self::Platform(anyhow::anyhow!("{inner:#}")),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle(handle) => write!(f, "invalid window handle: {handle}"),
            Self::DeviceCreation(inner) => write!(f, "failed to create GPU device: {inner:#}"),
            Self::DeviceLost { reason } => write!(f, "GPU device lost: {reason}"),
            Self::ItemClosed => write!(f, "capture item was closed"),
            Self::ShaderCompilation(message) => {
                write!(f, "tone-map shader compilation failed: {message}")
            }
            Self::UnsupportedFormat(fmt_name) => {
                write!(f, "unsupported capture surface format: {fmt_name}")
            }
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::InvalidConfig(message) => write!(f, "invalid capture configuration: {message}"),
            Self::BackendUnavailable(message) => {
                write!(f, "no available backend implementation: {message}")
            }
            Self::AlreadyCapturing => write!(f, "capture is already running"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) | Self::DeviceCreation(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
