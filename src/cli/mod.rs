//! Operator commands for the `pushpool` binary
//!
//! ```bash
//! # Send one request through the pool named `apns`
//! pushpool --config pools.yaml send --pool apns --path /3/device/<token> \
//!     -H apns-topic:com.example.app --data '{"aps":{"alert":"hi"}}'
//!
//! # Start every configured pool and report its workers
//! pushpool --config pools.yaml check
//! ```

pub mod commands;
