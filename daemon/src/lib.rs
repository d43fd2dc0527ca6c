//! Driver for a long-lived completion daemon speaking a tab-separated,
//! newline-terminated request/response protocol (e.g. `racer daemon`).

mod driver;
pub mod protocol;

pub use driver::{DaemonError, DaemonRpcDriver, DaemonState};
pub use protocol::{MatchItem, PendingQueue, Request, ResponseAssembler};
