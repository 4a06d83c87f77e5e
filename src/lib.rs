//! Epub distributor
//!
//! A Rust library for preparing EPUB eBook files for multichannel distribution.
//!
//! This library writes bibliographic metadata, harvested from a registration
//! form, into the package document of a book, and embeds a small traceable
//! marker for each distribution platform into the book's text. Every marked
//! copy is verified to differ from the original only by the recorded markers
//! before it is allowed to be written.
//!
//! ## Features
//!
//! - Harvest registration form fields and normalize them into a metadata record.
//! - Namespace-aware, lossless editing of the OPF package document.
//! - Random, seedable choice of the files to mark, with content-safe insertion.
//! - Byte-exact integrity verification of every platform variant.
//! - Parallel production of platform variants, configured through TOML.
//!
//! ## Quick Start
//!
//! ```rust, ignore
//! # use epub_distributor::{config::DistributionConfig, distributor::{Distributor, book_id}};
//! # use epub_distributor::{form::harvest_form_fields, types::FileTree};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DistributionConfig::load("distribution.toml")?;
//!
//! // Extract the metadata from the decoded registration form
//! let fields = harvest_form_fields(&std::fs::read_to_string("form.html")?);
//! let record = config.extractor().extract(fields)?;
//!
//! // Produce and write one variant per platform
//! let book = FileTree::read_epub("book.epub")?;
//! for variant in Distributor::from_config(&config)?.run(&book, &record) {
//!     variant?.persist("output", &book_id(&record))?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `archive` (default): Enable reading and writing `.epub` files and unpacked
//!   directories, and `PlatformVariant::persist`.

pub(crate) mod utils;

#[cfg(feature = "archive")]
mod archive;
pub mod config;
pub mod distributor;
pub mod error;
pub mod form;
pub mod integrity;
pub mod metadata;
pub mod package;
pub mod types;
pub mod watermark;

pub use utils::{DecodeBytes, XmlElement, XmlNode};
