//! Warden - offline-capable license validation and kill switch
//!
//! Decides whether a host application may run, based on a remotely hosted,
//! signed credential. The application stays usable offline for a bounded
//! grace window after the last successful online check, and local state
//! resists casual tampering (clock rollback, edited state files, swapped
//! executables).
//!
//! # Example
//!
//! ```rust,no_run
//! use warden::client::engine::LicenseDecisionEngine;
//! use warden::config::get_config;
//!
//! # async fn startup() -> warden::errors::LicenseResult<()> {
//! let engine = LicenseDecisionEngine::from_config(get_config()?)?;
//! let decision = engine.decide().await;
//! if !decision.is_allowed() {
//!     eprintln!("{}", decision.summary());
//!     std::process::exit(2);
//! }
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod clock;
pub mod config;
pub mod encryption;
pub mod errors;
pub mod fingerprint;
pub mod logging;
pub mod signature;

// Client-side license checking
pub mod client {
    pub mod cache;
    pub mod decision;
    pub mod engine;
    pub mod fetcher;
    pub mod grace;
    pub mod secret;
    pub mod state;
    pub mod storage;
    pub mod verifier;
}
