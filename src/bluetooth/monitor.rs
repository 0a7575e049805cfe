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

//! Keeps the device directory in sync with BlueZ.

use anyhow::{Context, Result};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty};
use futures::{pin_mut, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::{device_path, ConnectionState, Device, DeviceDirectory};

fn connection_state(connected: bool) -> ConnectionState {
    if connected {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    }
}

/// Watches adapter and device property changes.
pub struct DeviceMonitor {
    adapter: Adapter,
    directory: Arc<DeviceDirectory>,
    watchers: HashMap<Address, JoinHandle<()>>,
}

impl DeviceMonitor {
    pub fn new(adapter: Adapter, directory: Arc<DeviceDirectory>) -> Self {
        Self {
            adapter,
            directory,
            watchers: HashMap::new(),
        }
    }

    /// Track known devices, then follow device additions and removals until
    /// the adapter event stream ends.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting BlueZ device monitor on {}", self.adapter.name());

        let events = self
            .adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        pin_mut!(events);

        let addresses = self
            .adapter
            .device_addresses()
            .await
            .context("Failed to query device addresses")?;
        for address in addresses {
            self.track(address).await;
        }

        while let Some(event) = events.next().await {
            match event {
                AdapterEvent::DeviceAdded(address) => self.track(address).await,
                AdapterEvent::DeviceRemoved(address) => self.untrack(address),
                other => debug!("Adapter event: {:?}", other),
            }
        }

        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
        info!("Device monitor stopped");
        Ok(())
    }

    async fn track(&mut self, address: Address) {
        if self.watchers.contains_key(&address) {
            return;
        }

        let device = match self.adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                debug!("Failed to get device object for {}: {}", address, e);
                return;
            }
        };

        let path = device_path(self.adapter.name(), &address.to_string());
        let mut record = Device::new(path.clone(), address.to_string());
        record.name = device.name().await.ok().flatten();
        record.connection_state = connection_state(device.is_connected().await.unwrap_or(false));
        self.directory.insert(record);

        if device.is_paired().await.unwrap_or(false) {
            if let Err(e) = self.directory.apply_platform_paired(&path, true) {
                warn!("{}", e);
            }
        }

        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to watch device {}: {}", address, e);
                return;
            }
        };

        let directory = self.directory.clone();
        let watcher = tokio::spawn(async move {
            pin_mut!(events);
            while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
                apply_property(&directory, &path, property);
            }
        });
        self.watchers.insert(address, watcher);
    }

    fn untrack(&mut self, address: Address) {
        if let Some(watcher) = self.watchers.remove(&address) {
            watcher.abort();
        }
        self.directory
            .remove(&device_path(self.adapter.name(), &address.to_string()));
    }
}

fn apply_property(directory: &DeviceDirectory, path: &str, property: DeviceProperty) {
    let result = match property {
        DeviceProperty::Connected(connected) => {
            directory.set_connection_state(path, connection_state(connected))
        }
        DeviceProperty::Paired(paired) => directory.apply_platform_paired(path, paired),
        DeviceProperty::Name(name) => {
            directory.set_name(path, Some(name));
            Ok(())
        }
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::device::BondingState;

    const PATH: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

    #[test]
    fn test_properties_update_directory() {
        let directory = DeviceDirectory::new();
        directory.insert(Device::new(PATH, "00:11:22:33:44:55"));

        apply_property(&directory, PATH, DeviceProperty::Connected(true));
        apply_property(&directory, PATH, DeviceProperty::Name("Phone".to_string()));
        apply_property(&directory, PATH, DeviceProperty::Paired(true));

        let device = directory.resolve_device_by_path(PATH).unwrap();
        assert_eq!(device.connection_state, ConnectionState::Connected);
        assert_eq!(device.name.as_deref(), Some("Phone"));
        assert_eq!(device.bonding_state, BondingState::Bonded);
    }

    #[test]
    fn test_unknown_device_ignored() {
        let directory = DeviceDirectory::new();
        apply_property(&directory, PATH, DeviceProperty::Connected(true));
        assert!(directory.is_empty());
    }
}
