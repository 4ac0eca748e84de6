//! Generated protobuf types for the core plugin inventory API

#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
pub mod plugins {
    tonic::include_proto!("portico.core.plugins.v1alpha1");
}

/// Encoded descriptor set for the core API, served through reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("portico_descriptor");
