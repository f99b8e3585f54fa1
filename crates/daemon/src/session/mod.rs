//! Device session management.

pub mod device;
pub mod dispatch;

pub use device::{
    DeviceAttributes, DeviceSession, Owner, SessionEvent, SessionStatus, SessionTimings,
};
pub use dispatch::{Dispatch, EventKey};
