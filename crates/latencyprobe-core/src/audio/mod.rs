//! Audio path of the measurement engine
//!
//! This module contains everything that touches samples:
//! - Lock-free capture transport ([`ring`])
//! - Probe signal generation ([`probe`])
//! - FFT cross-correlation detection ([`correlator`])
//! - Duplex stream session over the driver seam ([`session`])
//! - cpal-backed hardware driver ([`hardware`])
//! - Deterministic in-process loopback for tests ([`synthetic`])

pub mod correlator;
pub mod hardware;
pub mod probe;
pub mod ring;
pub mod session;
pub mod synthetic;
