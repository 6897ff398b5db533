//! Container runtime seam.
//!
//! The lifecycle manager drives containers exclusively through
//! [`ContainerRuntime`]; the crate ships a Docker implementation and an
//! in-process fake for tests.

pub mod docker;
pub mod fake;
pub mod traits;

pub use docker::DockerRuntime;
pub use fake::{FakeContainerState, FakeRuntime};
pub use traits::{ContainerRuntime, ContainerStats};
