//! skymount: mount local or remote storage as virtual drives
//!
//! This library bridges generic filesystem operations onto pluggable
//! storage backends and manages several concurrently running mounts
//! behind a loopback-only control API.
//!
//! # Architecture
//!
//! - **Backends**: Storage implementations (local passthrough, remote SFTP
//!   session) that implement the `Backend` trait for path-based operations
//!   and handle IO.
//! - **Metadata Cache**: Decorator that wraps backends with expensive
//!   metadata queries and keeps a background-refreshed attribute cache.
//! - **Policies**: Name mapping and permission rules between the virtual
//!   namespace and the backend (passthrough, extension buckets).
//! - **Operation Router**: The filesystem-operation contract a mount driver
//!   calls into; maps every failure to a `DriverStatus`.
//! - **FUSE Adapter**: The shipped mount driver, translating kernel
//!   callbacks into router calls.
//! - **Instance Manager**: Lifecycle of running mounts, persistence and
//!   autostart.
//! - **Control API**: HTTP/1.1 endpoint driving the instance manager.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skymount::config::{InstanceConfig, ServiceConfig};
//! use skymount::fuse::FuseDriver;
//! use skymount::instance::{InstanceManager, InstanceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::from_file("skymount.yaml".as_ref())?;
//! let driver = Arc::new(FuseDriver::new(
//!     tokio::runtime::Handle::current(),
//!     config.mount.clone(),
//! ));
//! let manager = InstanceManager::new(
//!     InstanceStore::new(config.state_dir.clone()),
//!     driver,
//!     config.instances.clone(),
//! );
//!
//! let id = manager.create(InstanceConfig::local("/srv/data", "/mnt/data")).await?;
//! manager.stop(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod control;
pub mod env;
pub mod error;
pub mod fuse;
pub mod instance;
pub mod mount;
pub mod path;
pub mod policy;
pub mod router;
pub mod session;

pub use error::{DriverStatus, Result, SkymountError};
