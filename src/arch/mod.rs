//! This module provides the architecture-specific definitions of the guest.

pub mod x86_64;
