//! ovpn-manager - OpenVPN connection lifecycle manager
//!
//! This crate supervises OpenVPN sessions started through a privileged helper
//! script. The helper is launched via `sudo`, `pkexec` or directly. Its output
//! and the shared OpenVPN log drive the connection state, with periodic status
//! polls as a fallback. A single teardown routine undoes everything a session set up.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `state`: Connection state machine and event bus
//! - `classify`: OpenVPN log line classification
//! - `logtail`: Incremental reading of the shared log file
//! - `auth`: Transient credential files
//! - `helper`: Helper command lines and short helper calls
//! - `process`: Process-group supervision of the running helper
//! - `poller`: Status poll interpretation
//! - `teardown`: The single cleanup routine
//! - `platform`: IPv6 leak protection (Linux)
//! - `manager`: The [`VpnManager`] facade
//!
//! # Usage
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ovpn_manager::{Config, ConnectionRequest, Credentials, VpnManager};
//!
//! let manager = VpnManager::new(Config::discover()?)?;
//! let mut events = manager.subscribe();
//! let request = ConnectionRequest::new("office.ovpn", Credentials::new("bob", "secret"))?;
//! manager.connect(request).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod classify;
pub mod config;
pub mod helper;
pub mod logtail;
pub mod manager;
pub mod platform;
pub mod poller;
pub mod process;
pub mod state;
pub mod teardown;

pub use auth::Credentials;
pub use config::Config;
pub use manager::{ConnectionRequest, LaunchError, RequestError, VpnManager};
pub use state::{ConnectionState, ManagerEvent, SessionFailure};
