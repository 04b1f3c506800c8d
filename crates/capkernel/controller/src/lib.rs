//! Host surface for the capkernel.
//!
//! A [`ControllerBuilder`] collects genesis vats and devices (directly, or
//! from a [`ControllerConfig`] through a [`ModuleRegistry`]), starts the
//! kernel over the chosen storage, and hands back a [`Controller`] for
//! driving cranks, injecting input and inspecting state.

pub mod config;
pub mod controller;
pub mod demo;
pub mod devices;
pub mod error;
pub mod registry;

pub use config::{ControllerConfig, LoggingConfig, StorageConfig, VatConfig};
pub use controller::{Controller, ControllerBuilder};
pub use devices::{builtin_device, BridgeDevice, BridgeState, ClockDevice, BUILTIN_DEVICES};
pub use error::{ControllerError, ControllerResult};
pub use registry::ModuleRegistry;
