//! Device identity type

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, RouteError};

/// Opaque identity of a hands-free device
///
/// Usually the Bluetooth MAC address reported by the platform. The value is
/// compared verbatim and never normalized, so the same device must always be
/// reported with the same spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Creates a new DeviceAddress
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Creates a DeviceAddress, rejecting blank input
    pub fn parse(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(RouteError::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        DeviceAddress::new(s)
    }
}

impl From<String> for DeviceAddress {
    fn from(s: String) -> Self {
        DeviceAddress::new(s)
    }
}

impl AsRef<str> for DeviceAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
