//! Reconciliation of partitions on a managed network device.
//!
//! A partition is an administrative container on the device, optionally bound
//! to a route domain. This crate takes a declarative description of the
//! partition the caller wants and makes the device agree with it:
//!
//! 1. [`state::CanonicalState`] normalizes both the caller's parameters and
//!    the device's responses into one shape, so they can be compared.
//! 2. [`device::PartitionDevice`] is the narrow interface to the device:
//!    existence check, read, create and update.
//! 3. [`reconcile::Reconciler`] decides between create, update and no-op and
//!    produces a [`reconcile::ChangeReport`].
//!
//! Only the fields the caller specified are compared and sent, so partial
//! parameter sets never reset fields the caller did not mention.

pub mod device;
pub mod error;
pub mod reconcile;
pub mod state;

pub use error::Error;
