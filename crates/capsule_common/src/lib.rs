//! Capsule Common - types shared between the capsuled daemon and capsulectl.

pub mod error;
pub mod image;
pub mod ipc;
pub mod session;

pub use error::{CapsuleError, Result};
pub use image::CapsuleImage;
pub use session::{SessionState, SessionSummary};
