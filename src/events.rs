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

//! Session event processing.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::bluetooth::device::{BondingState, ConnectionState, Device};
use crate::storage::TrustedDeviceStore;

/// Events emitted by the device directory and the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A remote central connected or disconnected.
    ConnectionStateChanged(Device),
    /// A device moved through the bonding state machine.
    BondingStateChanged {
        device: Device,
        previous: BondingState,
    },
    /// The platform aborted an in-flight pairing.
    PairingCanceled { device_path: Option<String> },
    /// The platform released the agent endpoint.
    AgentReleased,
}

/// Starts and stops advertising on behalf of the event processor.
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn start_advertising(&mut self) -> Result<()>;
    async fn stop_advertising(&mut self) -> Result<()>;
}

/// Process events from the Bluetooth session.
pub struct EventProcessor {
    advertiser: Box<dyn Advertiser>,
    trusted_devices: Option<Arc<Mutex<TrustedDeviceStore>>>,
}

impl EventProcessor {
    /// Create a new event processor.
    pub fn new(advertiser: Box<dyn Advertiser>) -> Self {
        Self {
            advertiser,
            trusted_devices: None,
        }
    }

    /// Create a new event processor that records bonded devices as trusted.
    pub fn with_trusted_devices(
        advertiser: Box<dyn Advertiser>,
        trusted_devices: Arc<Mutex<TrustedDeviceStore>>,
    ) -> Self {
        Self {
            advertiser,
            trusted_devices: Some(trusted_devices),
        }
    }

    /// Process a single event.
    pub async fn process_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::ConnectionStateChanged(device) => {
                self.handle_connection(&device).await?;
            }
            SessionEvent::BondingStateChanged { device, previous } => {
                self.handle_bonding(&device, previous);
            }
            SessionEvent::PairingCanceled { device_path } => {
                info!(
                    "Pairing canceled ({})",
                    device_path.as_deref().unwrap_or("no device")
                );
            }
            SessionEvent::AgentReleased => {
                info!("Agent released by the platform");
            }
        }
        Ok(())
    }

    /// Stop advertising for good.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.advertiser.stop_advertising().await
    }

    /// Stop advertising while a central is connected, resume once it leaves.
    async fn handle_connection(&mut self, device: &Device) -> Result<()> {
        debug!("{}", device);
        match device.connection_state {
            ConnectionState::Connected => self.advertiser.stop_advertising().await,
            ConnectionState::Disconnected => self.advertiser.start_advertising().await,
            ConnectionState::Connecting | ConnectionState::Disconnecting => Ok(()),
        }
    }

    fn handle_bonding(&mut self, device: &Device, previous: BondingState) {
        info!(
            "Bonding state of {} changed {} -> {}",
            device.address, previous, device.bonding_state
        );

        if device.bonding_state != BondingState::Bonded {
            return;
        }
        if let Some(store) = &self.trusted_devices {
            if let Err(e) = store
                .lock()
                .add_trusted(device.address.clone(), device.name.clone())
            {
                error!("Failed to record trusted device: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Calls {
        started: usize,
        stopped: usize,
    }

    struct FakeAdvertiser(Arc<Mutex<Calls>>);

    #[async_trait]
    impl Advertiser for FakeAdvertiser {
        async fn start_advertising(&mut self) -> Result<()> {
            self.0.lock().started += 1;
            Ok(())
        }

        async fn stop_advertising(&mut self) -> Result<()> {
            self.0.lock().stopped += 1;
            Ok(())
        }
    }

    fn device(state: ConnectionState) -> Device {
        let mut device = Device::new("/org/bluez/hci0/dev_01", "00:00:00:00:00:01");
        device.connection_state = state;
        device
    }

    #[tokio::test]
    async fn test_advertising_follows_connection() -> Result<()> {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut processor = EventProcessor::new(Box::new(FakeAdvertiser(calls.clone())));

        processor
            .process_event(SessionEvent::ConnectionStateChanged(device(
                ConnectionState::Connected,
            )))
            .await?;
        processor
            .process_event(SessionEvent::ConnectionStateChanged(device(
                ConnectionState::Disconnected,
            )))
            .await?;

        let calls = calls.lock();
        assert_eq!(calls.stopped, 1);
        assert_eq!(calls.started, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_bonded_device_becomes_trusted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(Mutex::new(TrustedDeviceStore::new(temp_dir.path())?));
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut processor =
            EventProcessor::with_trusted_devices(Box::new(FakeAdvertiser(calls)), store.clone());

        let mut bonded = device(ConnectionState::Connected);
        bonded.bonding_state = BondingState::Bonding;
        processor
            .process_event(SessionEvent::BondingStateChanged {
                device: bonded.clone(),
                previous: BondingState::None,
            })
            .await?;
        assert!(!store.lock().is_trusted("00:00:00:00:00:01"));

        bonded.bonding_state = BondingState::Bonded;
        processor
            .process_event(SessionEvent::BondingStateChanged {
                device: bonded,
                previous: BondingState::Bonding,
            })
            .await?;
        assert!(store.lock().is_trusted("00:00:00:00:00:01"));
        Ok(())
    }
}
