//! Platform-specific leak protection

#[cfg(target_os = "linux")]
pub mod linux;

use crate::config::LeakProtectionConfig;
use crate::helper::Helper;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to add firewall rule: {0}")]
    EngageError(String),
    #[error("Failed to remove firewall rule: {0}")]
    ReleaseError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

pub type LeakFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PlatformError>> + Send + 'a>>;

/// Firewall rules that keep traffic from bypassing the tunnel.
///
/// `release` must be safe to call when nothing is engaged. Both calls are
/// expected to finish in bounded time.
pub trait LeakProtection: Send + Sync {
    fn engage(&self) -> LeakFuture<'_>;
    fn release(&self) -> LeakFuture<'_>;
}

/// Used when leak protection is disabled
pub struct NoLeakProtection;

impl LeakProtection for NoLeakProtection {
    fn engage(&self) -> LeakFuture<'_> {
        Box::pin(async {
            debug!("Leak protection disabled");
            Ok(())
        })
    }

    fn release(&self) -> LeakFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Get the leak protection for the current platform
pub fn get_leak_protection(
    config: &LeakProtectionConfig,
    helper: &Helper,
) -> Result<Box<dyn LeakProtection>, PlatformError> {
    if !config.enabled {
        return Ok(Box::new(NoLeakProtection));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::Ip6tablesLeakProtection::new(
            helper.clone(),
            config.timeout(),
        )))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = helper;
        Err(PlatformError::UnsupportedPlatform)
    }
}
