//! Map an ELB public hostname to its load balancer name.
//!
//! Kubernetes learns the DNS name of a classic ELB once the cloud provider has
//! provisioned it, for instance
//! `internal-a8280213c611d114o7340onc0d34252-152337689.us-east-1.elb.amazonaws.com`.
//! CloudWatch, however, keys ELB metrics by the load balancer name,
//! `a8280213c611d114o7340onc0d34252` in the example. The name is everything
//! before the first dash-and-six-digits group, less any `internal-` prefix.

use once_cell::sync::Lazy;
use regex::Regex;

/// Errors produced by [`resource_id`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The hostname does not have the shape of an ELB DNS name.
    #[error("hostname {0:?} does not look like an ELB DNS name")]
    Unrecognized(String),
}

const INTERNAL_PREFIX: &str = "internal-";

static ELB_DNS: Lazy<Regex> = Lazy::new(|| {
    // A DNS label cannot hold a '.', so the name is bounded to the first label
    // and the lazy repetition stops at the first numeric group.
    Regex::new(r"^([^.]+?)-[0-9]{6}").expect("Invalid regex pattern provided")
});

/// Derive the ELB name from the public hostname Kubernetes recorded for it.
///
/// # Errors
///
/// Returns [`Error::Unrecognized`] if, once the `internal-` prefix is
/// removed, the first DNS label has no name followed by a `-NNNNNN` numeric
/// group.
pub fn resource_id(hostname: &str) -> Result<String, Error> {
    let unrecognized = || Error::Unrecognized(hostname.to_string());

    // The prefix goes first: its trailing dash must never be mistaken for the
    // one that opens the numeric group.
    let unprefixed = hostname.strip_prefix(INTERNAL_PREFIX).unwrap_or(hostname);
    let captures = ELB_DNS.captures(unprefixed).ok_or_else(unrecognized)?;
    let name = captures.get(1).ok_or_else(unrecognized)?.as_str();
    Ok(name.to_string())
}
