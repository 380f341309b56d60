use std::sync::Arc;

use crate::bus::Presence;
use crate::util::config::{Paths, Settings};
use crate::util::systemd::ServiceManager;

use super::transport::Transport;

/// Everything an agent operation needs to reach the outside world
#[derive(Clone)]
pub struct Context {
    pub settings: Settings,
    pub paths: Paths,
    pub transport: Arc<dyn Transport>,
    pub bus: Arc<Presence>,
    pub services: Arc<dyn ServiceManager>,
}
