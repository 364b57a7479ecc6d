//! Domain layer
//!
//! Core types and the gateway ports the orphan engine is written against.

pub mod ports;

pub use ports::{
    BackendEntity, BackendGateway, BackendGatewayRef, BackendKind, ClusterGateway,
    ClusterGatewayRef, DriverHealth, DriverPod, PoolInfo, ResourceIdentity, ResourceKind,
    ResourcePhase,
};
