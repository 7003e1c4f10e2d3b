//! Provisioner implementations for cluster machines.
//!
//! This crate provides implementations of the `Provisioner` trait:
//! - `MockProvisioner`: In-memory mock for testing (`mock-provisioner` feature)
//! - `DockerMachineProvisioner`: drives the `docker-machine` and
//!   `docker-compose` binaries (`docker-machine` feature)

#[cfg(feature = "mock-provisioner")]
pub mod mock;

#[cfg(feature = "docker-machine")]
pub mod docker_machine;

// Re-export common types
pub use provisioning_interface::{
    ComposeScale, MachineLabel, MachineSpec, Provisioner, ProvisioningError,
};

#[cfg(feature = "mock-provisioner")]
pub use mock::MockProvisioner;

#[cfg(feature = "docker-machine")]
pub use docker_machine::{DockerMachineConfig, DockerMachineProvisioner};
