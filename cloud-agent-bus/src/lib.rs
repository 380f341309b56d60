/*
Presence of the agent on the controller's local MQTT bus.

The agent exposes a virtual device showing its cloud connection status,
the activation link and the cloud URL, and keeps those values in place
across broker restarts. It also listens for the controller hardware
revision, which is reported to the cloud once.
*/

mod broker;
mod presence;

pub use broker::{Broker, BrokerUrl, BusError};
pub use presence::{HW_REVISION_TOPIC, PROVIDERS_TOPIC, Presence};

use cloud_agent_util as util;
