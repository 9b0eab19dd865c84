//! Switchyard core.
//!
//! This crate contains the domain models, error taxonomy, routing table,
//! selection policies, and health tracking that power the Switchyard edge
//! layer. It is runtime-agnostic: the async plumbing lives in the gateway
//! and registry crates.

pub mod balancer;
pub mod domain;
pub mod error;
pub mod health;
