// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-adapter session context.
//!
//! A [`Session`] owns everything a running peripheral needs: the bus, the
//! device directory, the attribute registry and at most one pairing agent.
//! Handlers receive what they need from here instead of reaching for globals.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::bluetooth::agent::{Agent, IoCapability};
use crate::bluetooth::application::Application;
use crate::bluetooth::device::DeviceDirectory;
use crate::error::TransportError;
use crate::events::SessionEvent;
use crate::rpc::Bus;

pub struct Session {
    bus: Arc<dyn Bus>,
    directory: Arc<DeviceDirectory>,
    application: Arc<Application>,
    agent: Option<Agent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Session {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            bus,
            directory: Arc::new(DeviceDirectory::with_events(events_tx.clone())),
            application: Arc::new(Application::new()),
            agent: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn directory(&self) -> &Arc<DeviceDirectory> {
        &self.directory
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    /// Receiver of directory and agent events. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Register the session's pairing agent, replacing any previous one.
    pub async fn register_agent(
        &mut self,
        path: &str,
        capability: IoCapability,
    ) -> Result<&Agent, TransportError> {
        if let Some(mut previous) = self.agent.take() {
            info!("Replacing agent at {}", previous.path());
            previous.unregister().await;
        }

        let agent = Agent::register(self.bus.clone(), self.directory.clone(), path, capability).await?;
        agent.set_event_sender(self.events_tx.clone());
        Ok(self.agent.insert(agent))
    }

    pub async fn unregister_agent(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            agent.unregister().await;
        }
    }
}
