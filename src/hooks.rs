//! The application hook surface (§6): collaborators that embed this crate
//! supply an [`AdapterHooks`] implementation to react to assembly writes,
//! freshness queries, device resets, and connection lifecycle events. A
//! [`NullHooks`] no-op default lets the adapter run standalone for tests
//! and the scenarios in §8.

use crate::error::Result;

/// Lifecycle events reported to [`AdapterHooks::notify_io_connection_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    TimedOut,
    Closed,
}

/// Collaborator hooks invoked by the CIP object model and connection
/// manager. Async because an embedding application may itself need to
/// await I/O (e.g. writing through to real hardware) in response.
#[async_trait::async_trait]
pub trait AdapterHooks: Send + Sync {
    /// Called once at startup, before the network handler starts
    /// accepting connections, so the collaborator can create assembly
    /// instances and configure connection points.
    async fn application_initialization(&self) {}

    /// Called after a valid write into an assembly instance.
    async fn after_assembly_data_received(
        &self,
        _instance: u32,
        _run_idle: bool,
        _byte_count: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before a producing emission; the return value indicates
    /// whether the payload should be considered fresh (vs. stale/repeated).
    async fn before_assembly_data_send(&self, _instance: u32) -> bool {
        true
    }

    /// Invoked by Identity.Reset, reset type 0 or 1.
    async fn reset_device(&self) {}

    /// Invoked by Identity.Reset, reset type 2.
    async fn reset_device_to_initial_configuration(&self, _keep_comms: bool) {}

    /// Invoked when the Run/Idle header of a Class-1 datagram changes.
    async fn run_idle_changed(&self, _run: bool) {}

    /// Connection lifecycle notification.
    async fn notify_io_connection_event(&self, _conn_id: u32, _event: ConnectionEvent) {}
}

/// A no-op [`AdapterHooks`] implementation, used when no application is
/// wired in (standalone adapter, tests, the scenarios in §8).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHooks;

#[async_trait::async_trait]
impl AdapterHooks for NullHooks {}
