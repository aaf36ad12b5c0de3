//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: the frame cipher (AES-CBC + HMAC-SHA256) and session keys
//! - **Logging**: structured logging configuration
//! - **Metrics**: per-connection observability counters
//! - **Time**: epoch timestamps and jittered durations
//! - **Timeout**: async timeout wrappers and default intervals
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom) for IVs
//! - Constant-time tag verification before decryption
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use crypto::SessionKeys;
pub use metrics::{Metrics, MetricsSnapshot};
