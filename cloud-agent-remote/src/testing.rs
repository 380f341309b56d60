//! Fakes for the transport, bus and service manager seams

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use tempfile::TempDir;

use crate::bus::{Broker, BusError, Presence};
use crate::context::Context;
use crate::transport::{Request, Response, Transport, TransportError};
use crate::util::config::{Paths, Settings};
use crate::util::systemd::{self, ServiceManager};

pub fn reply(status: u16, body: Value) -> Result<Response, TransportError> {
    Ok(Response {
        body,
        status: StatusCode::from_u16(status).unwrap(),
    })
}

/// Answers requests from a script, then with `204` once it runs out
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<Result<Response, TransportError>>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeTransport {
    pub fn push(&self, response: Result<Response, TransportError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.endpoint).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(
        &self,
        _settings: &Settings,
        request: Request,
    ) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| reply(204, Value::Null))
    }
}

/// Never answers
pub struct HangingTransport;

#[async_trait]
impl Transport for HangingTransport {
    async fn request(
        &self,
        _settings: &Settings,
        _request: Request,
    ) -> Result<Response, TransportError> {
        std::future::pending().await
    }
}

#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingBroker {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Values published on a control of the test provider, in order
    pub fn control_values(&self, control: &str) -> Vec<String> {
        let topic = format!("/devices/system__wb-cloud-agent__test/controls/{control}");
        self.published()
            .into_iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, v)| v)
            .collect()
    }
}

impl Broker for RecordingBroker {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload.to_owned()));
        Ok(())
    }

    fn subscribe(&self, _topic: &str) -> Result<(), BusError> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<(), BusError> {
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeServices {
    calls: Mutex<Vec<String>>,
}

impl FakeServices {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn start_and_enable(&self, unit: &str, restart: bool) -> Result<(), systemd::Error> {
        let action = if restart { "restart" } else { "start" };
        self.calls.lock().unwrap().push(format!("{action} {unit}"));
        Ok(())
    }

    async fn stop_and_disable(&self, unit: &str) -> Result<(), systemd::Error> {
        self.calls.lock().unwrap().push(format!("stop {unit}"));
        Ok(())
    }
}

pub struct Fixture {
    pub ctx: Context,
    pub transport: Arc<FakeTransport>,
    pub broker: Arc<RecordingBroker>,
    pub services: Arc<FakeServices>,
    pub dir: TempDir,
}

/// A context for provider `test` with all state under a temporary directory
pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    fixture_with(dir, transport.clone(), transport)
}

pub fn fixture_with(
    dir: TempDir,
    transport: Arc<dyn Transport>,
    fake: Arc<FakeTransport>,
) -> Fixture {
    let paths = Paths::with_root(dir.path());
    let mut settings = Settings::new(&paths, "test").unwrap();
    settings.diag_archive = dir.path().join("diag");

    let broker = Arc::new(RecordingBroker::default());
    let services = Arc::new(FakeServices::default());
    let bus = Arc::new(Presence::new(broker.clone(), &settings.mqtt_prefix));

    Fixture {
        ctx: Context {
            settings,
            paths,
            transport,
            bus,
            services: services.clone(),
        },
        transport: fake,
        broker,
        services,
        dir,
    }
}
