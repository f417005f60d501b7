//! `conduit-runtime` — the Stream Runtime (§4.G) and its in-process
//! registries: Cancellation (§4.F), Permission (§4.D), and background-task
//! bookkeeping (§5).

pub mod background;
pub mod cancel;
pub mod error;
pub mod permission;
pub mod stream;

pub use background::BackgroundRegistry;
pub use cancel::{CancelEvent, CancellationRegistry};
pub use error::{Result, RuntimeError};
pub use permission::{PermissionRegistry, PermissionRequestInfo, PermissionResponse};
pub use stream::{RuntimeConfig, RuntimeHandles, StreamRequest, StreamRuntime};
