//! Command authorization and session pipeline, command-audit subsystem, and
//! entity resolution layer for a software TPM 2.0 implementation.
//!
//! This crate is the part of a TPM core that decides whether a command is
//! authorized to run and builds the authorization area of its response; it
//! does not implement command handlers, wire marshaling, or key material
//! itself. Those are external collaborators reached through the traits
//! defined here ([`crypto::Crypto`], [`crypto::Rng`], [`nv::NvStore`],
//! [`store::ObjectStore`], [`store::NvIndexStore`], [`store::PcrStore`],
//! [`platform::Platform`]).

pub mod audit;
pub mod bitmem;
pub mod command_table;
pub mod crypto;
pub mod da;
pub mod entity;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod nv;
pub mod pipeline;
pub mod platform;
pub mod session;
pub mod store;
pub mod tpm;

pub use error::{TpmError, TpmResult};
pub use tpm::Tpm;
