// ABOUTME: Isolated environment management backed by Docker containers
// Driver trait, Bollard implementation, in-memory mock and the stream/archive helpers they share

pub mod archive;
pub mod container_manager;
pub mod environment;
pub mod error;
pub mod frames;
pub mod image;
#[cfg(any(test, feature = "test-support"))]
pub mod mock_driver;

pub use container_manager::ContainerManager;
pub use environment::{EnvironmentDriver, EnvironmentHandle, EnvironmentLimits};
pub use error::EnvironmentError;
#[cfg(any(test, feature = "test-support"))]
pub use mock_driver::MockDriver;
