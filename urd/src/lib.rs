//! The urd CloudWatch-to-Prometheus exporter.
//!
//! This library supports the urd binary found elsewhere in this project. Once
//! a period urd discovers every Kubernetes service of type `LoadBalancer`,
//! fetches the CloudWatch statistics of the ELB backing each one and records
//! them into a Prometheus registry that is scraped over HTTP.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod backend;
pub mod catalog;
pub mod config;
pub mod cycle;
pub mod discovery;
pub mod registry;
pub mod resolve;
pub mod scheduler;
