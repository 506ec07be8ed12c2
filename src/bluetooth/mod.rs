//! Bluetooth communication layer for ASHA devices.
//!
//! This module provides GATT access, L2CAP audio channels and the
//! adapter/device discovery and connection handling.

pub mod gatt;
pub mod l2cap;
pub mod manager;
