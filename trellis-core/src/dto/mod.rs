//! Data Transfer Objects
//!
//! Request payloads exchanged with cloud providers. These are the
//! provider-neutral shapes every `CloudApi` implementation accepts.

pub mod acl;
pub mod request;

pub use acl::{AclAction, AclEntry, AclProtocol};
pub use request::{Association, CreateResource, InstanceAction};
