//! Collaborator contracts for the two housekeeping jobs in the Maintenance
//! Loop (§4.J) whose backing stores are out of scope here: auth/session
//! tokens and sandbox provisioning both live behind their own services, so
//! this crate only names the shape of "go clean up" and lets the host
//! process wire in a real implementation.

use async_trait::async_trait;

use conduit_core::Result;

#[async_trait]
pub trait TokenCleanup: Send + Sync {
    /// Delete expired refresh tokens. Returns the number removed, for logging.
    async fn cleanup_expired_tokens(&self) -> Result<u64>;
}

#[async_trait]
pub trait SandboxGc: Send + Sync {
    /// Tear down sandboxes with no owning chat (orphaned by a crash between
    /// sandbox creation and `set_sandbox`, or a chat hard-deleted upstream).
    /// Returns the number collected, for logging.
    async fn collect_orphaned_sandboxes(&self) -> Result<u64>;
}

/// No-op hooks for hosts that have not wired a token store or sandbox
/// inventory yet; logs at debug level so the gap is visible without
/// failing the loop.
pub struct NoopHooks;

#[async_trait]
impl TokenCleanup for NoopHooks {
    async fn cleanup_expired_tokens(&self) -> Result<u64> {
        tracing::debug!("token cleanup hook not configured, skipping");
        Ok(0)
    }
}

#[async_trait]
impl SandboxGc for NoopHooks {
    async fn collect_orphaned_sandboxes(&self) -> Result<u64> {
        tracing::debug!("sandbox gc hook not configured, skipping");
        Ok(0)
    }
}
