//! The editor side of the bridge.

pub mod editor;
pub mod services;
pub mod value;
