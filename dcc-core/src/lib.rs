//! Reading and verifying Digital Calibration Certificates (DCC).
//!
//! A DCC is loaded into a generic tree that can be searched by `refType`,
//! validated against the DCC XSD and, when it carries an enveloped XML-DSig
//! signature, verified against a [`trust::TrustStore`].
//!
//! # Examples
//! ```rust,no_run
//! use dcc_core::{Dcc, query::ResultLabel};
//!
//! let dcc = Dcc::from_path("dcc_gp_temperature_typical_v12.xml")?;
//! println!("{:?} calibrated on {:?}", dcc.uid(), dcc.calibration_date());
//! for (label, quantity) in dcc.get_calibration_results(ResultLabel::XPath) {
//!     println!("{label}: {quantity:?}");
//! }
//! # Ok::<(), dcc_core::Error>(())
//! ```
pub mod compression;
pub mod config;
pub mod constants;
pub mod dcc;
pub mod fetch;
pub mod query;
pub mod revocation;
pub mod schema;
pub mod signature;
pub mod status;
pub mod tree;
pub mod trust;

pub use dcc::{Dcc, DccBuilder, LoadError};
pub use signature::SignatureError;
pub use status::{CheckState, StatusKind, StatusReport};
pub use tree::Value;

/// Top-level error wrapper for core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] dcc::LoadError),
    #[error(transparent)]
    Signature(#[from] signature::SignatureError),
    #[error(transparent)]
    Trust(#[from] trust::TrustError),
    #[error(transparent)]
    Codec(#[from] compression::CodecError),
}
