//! tsn-coreconf - CORECONF client for TSN switches
//!
//! Configures a switch over CoAP carried in MUP1 frames on a serial line or
//! through a UDP bridge. Configuration trees are RFC 7951 JSON on the caller
//! side and SID-keyed CBOR (RFC 9254) on the wire; the YANG and SID files
//! needed for the conversion come from a catalog cached per device checksum.
//!
//! # Example
//!
//! ```no_run
//! use tsn_coreconf::{Config, Device, OutputFormat};
//! use serde_json::json;
//!
//! # async fn run() -> tsn_coreconf::Result<()> {
//! let device = Device::open(Config::default()).await?;
//!
//! let ports = device
//!     .fetch(&json!(["/ietf-interfaces:interfaces"]), OutputFormat::Rfc7951)
//!     .await?;
//! println!("{ports:#}");
//!
//! device
//!     .patch(&json!([{"/ietf-system:system/hostname": "tsn-sw1"}]))
//!     .await?;
//! device.close();
//! # Ok(())
//! # }
//! ```

mod bimap;
pub mod catalog;
pub mod client;
pub mod coap_types;
pub mod config;
mod coreconf;
mod device;
mod error;
pub mod frame;
pub mod instance_id;
pub mod path;
pub mod request_builder;
pub mod schema;
mod sid;
pub mod transport;
mod types;

pub use bimap::BiMap;
pub use catalog::{CatalogInfo, CatalogManager};
pub use client::CoapClient;
pub use config::{Config, SortMode};
pub use coreconf::{CoreconfModel, OutputFormat};
pub use device::Device;
pub use error::{CoreconfError, ErrorKind, Result};
pub use request_builder::RequestBuilder;
pub use sid::{SidFile, SidTable};
pub use transport::Transport;
pub use types::{LeafType, YangType};
