//! Service declarations and instances
//!
//! This module provides the declarative description of a dependency
//! and the state of a provisioned instance of it.

pub mod instance;
pub mod presets;
pub mod spec;

pub use instance::{InstanceState, ServiceInstance};
pub use spec::{BindMode, FileBinding, ServiceSpec, ServiceSpecBuilder, INIT_SCRIPT_DIR};
