//! MMS and GOOSE for IEC 61850 in pure rust.
//!
//! The crate provides:
//!
//! - the BER codec and the MMS value and type model ([`mms::ber`], [`mms::value`],
//!   [`mms::type_spec`]);
//! - an MMS client ([`MmsClient`]) and an MMS server ([`MmsServer`]) speaking the
//!   variable access and named variable list services over TPKT framed TCP;
//! - a GOOSE subscriber ([`GooseSubscriber`]) decoding raw Ethernet frames;
//! - the IEC 61850 view of a device model ([`IedModel`]).
//!
//! For an example of how to use the client and the server see the demos folder.

pub mod goose;
pub mod iec61850;
pub mod mms;
pub use goose::{GooseSubscriber, GooseSubscriberConfig};
pub use iec61850::IedModel;
pub use mms::{ClientConfig, MmsClient, MmsServer, ServerConfig};
