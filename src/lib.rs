pub mod backend;
pub mod capture_session;
mod capturer;
pub mod convert;
pub mod device;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod logging;
mod platform;
pub mod region;
#[cfg(test)]
pub(crate) mod testing;
mod triple_buffer;
pub mod window;

pub use backend::{CaptureBackend, SurfaceSize};
pub use capture_session::{CaptureOptions, CaptureStats, SessionState};
pub use capturer::{FrameGuard, WindowCapturer};
pub use convert::{ToneMapLut, ToneMapStrategy};
pub use error::{CaptureError, CaptureErrorClass, CaptureResult};
pub use frame::{ColorSpace, Frame, FrameData, FrameMetadata};
pub use logging::{LoggingConfig, init_logging};
pub use region::Region;
pub use window::WindowId;
