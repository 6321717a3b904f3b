//! Container client implementations.
//!
//! Each client implements [`ContainerClient`](crate::runtime::ContainerClient)
//! against one container runtime. Only the in-process libcontainer client
//! ships today.

pub mod native;

pub use self::native::NativeClient;
