/*
Everything related to the cloud the controller is connected to.

Requests go through an external HTTP client authenticated with the
device certificate. On top of it live the startup handshake, the event
poll loop and the handlers applying remote commands, diagnostics upload
and detaching the controller when a provider is removed.
*/

mod activation;
mod context;
mod curl;
mod daemon;
mod diagnostics;
mod events;
mod handlers;
mod lifecycle;
mod reachability;
mod startup;
mod transport;
mod unbind;

#[cfg(test)]
mod testing;

pub use activation::{read_activation_link, write_activation_link};
pub use context::Context;
pub use curl::Curl;
pub use daemon::{announce, run, spawn_hardware_revision_reporter, start};
pub use diagnostics::{fetch_diagnostics, upload_diagnostic};
pub use events::{Event, EventError, EventKind, process_one_event};
pub use handlers::HandlerError;
pub use lifecycle::teardown;
pub use reachability::{DEFAULT_MAX_ATTEMPTS, ReachabilityError, wait_for_cloud_reachable};
pub use startup::StartupError;
pub use transport::{Method, Request, Response, RetryPolicy, Transport, TransportError};
pub use unbind::{UnbindError, delete_controller};

use cloud_agent_bus as bus;
use cloud_agent_util as util;
