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

//! Directory of remote devices known to the adapter.
//!
//! Bonding state is only changed through [`DeviceDirectory::set_bonding_state`],
//! which accepts `None -> Bonding`, `Bonding -> Bonded` and `Bonding -> None`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;

/// Bonding state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondingState {
    #[default]
    None,
    Bonding,
    Bonded,
}

impl BondingState {
    fn can_transition_to(self, next: BondingState) -> bool {
        matches!(
            (self, next),
            (BondingState::None, BondingState::Bonding)
                | (BondingState::Bonding, BondingState::Bonded)
                | (BondingState::Bonding, BondingState::None)
        )
    }
}

impl fmt::Display for BondingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BondingState::None => "BOND_NONE",
            BondingState::Bonding => "BONDING",
            BondingState::Bonded => "BONDED",
        };
        f.write_str(name)
    }
}

/// Connection state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

/// Snapshot of a device record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: String,
    pub address: String,
    pub name: Option<String>,
    pub connection_state: ConnectionState,
    pub bonding_state: BondingState,
}

impl Device {
    pub fn new(path: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            address: address.into(),
            name: None,
            connection_state: ConnectionState::Disconnected,
            bonding_state: BondingState::None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device{{name='{}', address='{}', connection={}, bonding={}, path='{}'}}",
            self.name.as_deref().unwrap_or(""),
            self.address,
            self.connection_state,
            self.bonding_state,
            self.path
        )
    }
}

/// BlueZ object path of the device with `address` on `adapter` (e.g. `hci0`).
pub fn device_path(adapter: &str, address: &str) -> String {
    format!("/org/bluez/{}/dev_{}", adapter, address.replace(':', "_"))
}

/// Result of an accepted bonding state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: BondingState, to: BondingState },
    Unchanged,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BondingError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Illegal bonding transition {from} -> {to} for {path}")]
    IllegalTransition {
        path: String,
        from: BondingState,
        to: BondingState,
    },
}

/// Thread-safe directory of devices keyed by object path.
#[derive(Default)]
pub struct DeviceDirectory {
    devices: Mutex<HashMap<String, Device>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that publishes state changes on `events`.
    pub fn with_events(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            events: Some(events),
        }
    }

    /// Add a device, replacing any previous record at the same path.
    pub fn insert(&self, device: Device) {
        debug!("Device added: {}", device);
        self.devices.lock().insert(device.path.clone(), device);
    }

    pub fn remove(&self, path: &str) -> Option<Device> {
        let removed = self.devices.lock().remove(path);
        if removed.is_some() {
            debug!("Device removed: {}", path);
        }
        removed
    }

    pub fn resolve_device_by_path(&self, path: &str) -> Option<Device> {
        self.devices.lock().get(path).cloned()
    }

    pub fn device_by_address(&self, address: &str) -> Option<Device> {
        self.devices
            .lock()
            .values()
            .find(|d| d.address.eq_ignore_ascii_case(address))
            .cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_name(&self, path: &str, name: Option<String>) {
        if let Some(device) = self.devices.lock().get_mut(path) {
            device.name = name;
        }
    }

    /// Record a connection state change reported by the platform.
    pub fn set_connection_state(
        &self,
        path: &str,
        state: ConnectionState,
    ) -> Result<(), BondingError> {
        let snapshot = {
            let mut devices = self.devices.lock();
            let device = devices
                .get_mut(path)
                .ok_or_else(|| BondingError::UnknownDevice(path.to_string()))?;
            if device.connection_state == state {
                return Ok(());
            }
            device.connection_state = state;
            device.clone()
        };

        info!(
            "Remote central {} is {}",
            snapshot.address, snapshot.connection_state
        );
        self.publish(SessionEvent::ConnectionStateChanged(snapshot));
        Ok(())
    }

    /// Move a device to `state` if the bonding state machine allows it.
    pub fn set_bonding_state(
        &self,
        path: &str,
        state: BondingState,
    ) -> Result<Transition, BondingError> {
        let (from, snapshot) = {
            let mut devices = self.devices.lock();
            let device = devices
                .get_mut(path)
                .ok_or_else(|| BondingError::UnknownDevice(path.to_string()))?;

            let from = device.bonding_state;
            if from == state {
                return Ok(Transition::Unchanged);
            }
            if !from.can_transition_to(state) {
                return Err(BondingError::IllegalTransition {
                    path: path.to_string(),
                    from,
                    to: state,
                });
            }
            device.bonding_state = state;
            (from, device.clone())
        };

        debug!("Bonding state {} -> {} for {}", from, state, path);
        self.publish(SessionEvent::BondingStateChanged {
            device: snapshot,
            previous: from,
        });
        Ok(Transition::Changed { from, to: state })
    }

    /// Apply a `Paired` property report from the platform using legal steps only.
    pub fn apply_platform_paired(&self, path: &str, paired: bool) -> Result<(), BondingError> {
        let current = self
            .resolve_device_by_path(path)
            .ok_or_else(|| BondingError::UnknownDevice(path.to_string()))?
            .bonding_state;

        match (paired, current) {
            (true, BondingState::None) => {
                self.set_bonding_state(path, BondingState::Bonding)?;
                self.set_bonding_state(path, BondingState::Bonded)?;
            }
            (true, BondingState::Bonding) => {
                self.set_bonding_state(path, BondingState::Bonded)?;
            }
            (false, BondingState::Bonding) => {
                self.set_bonding_state(path, BondingState::None)?;
            }
            (false, BondingState::Bonded) => {
                warn!("Platform dropped bond for {}, keeping record until removal", path);
            }
            (true, BondingState::Bonded) | (false, BondingState::None) => {}
        }
        Ok(())
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

    fn directory() -> DeviceDirectory {
        let directory = DeviceDirectory::new();
        directory.insert(Device::new(PATH, "00:11:22:33:44:55"));
        directory
    }

    #[test]
    fn test_device_path_format() {
        assert_eq!(device_path("hci0", "00:11:22:33:44:55"), PATH);
    }

    #[test]
    fn test_legal_bonding_path() {
        let directory = directory();

        assert_eq!(
            directory.set_bonding_state(PATH, BondingState::Bonding),
            Ok(Transition::Changed {
                from: BondingState::None,
                to: BondingState::Bonding
            })
        );
        assert!(directory.set_bonding_state(PATH, BondingState::Bonded).is_ok());
        assert_eq!(
            directory.resolve_device_by_path(PATH).unwrap().bonding_state,
            BondingState::Bonded
        );
    }

    #[test]
    fn test_bonding_can_be_abandoned() {
        let directory = directory();
        directory.set_bonding_state(PATH, BondingState::Bonding).unwrap();
        directory.set_bonding_state(PATH, BondingState::None).unwrap();
        assert_eq!(
            directory.resolve_device_by_path(PATH).unwrap().bonding_state,
            BondingState::None
        );
    }

    #[test]
    fn test_illegal_transition_rejected_without_change() {
        let directory = directory();
        let err = directory
            .set_bonding_state(PATH, BondingState::Bonded)
            .unwrap_err();
        assert!(matches!(err, BondingError::IllegalTransition { .. }));
        assert_eq!(
            directory.resolve_device_by_path(PATH).unwrap().bonding_state,
            BondingState::None
        );
    }

    #[test]
    fn test_same_state_is_unchanged() {
        let directory = directory();
        directory.set_bonding_state(PATH, BondingState::Bonding).unwrap();
        assert_eq!(
            directory.set_bonding_state(PATH, BondingState::Bonding),
            Ok(Transition::Unchanged)
        );
    }

    #[test]
    fn test_unknown_device() {
        let directory = DeviceDirectory::new();
        assert_eq!(
            directory.set_bonding_state("/nope", BondingState::Bonding),
            Err(BondingError::UnknownDevice("/nope".to_string()))
        );
        assert!(directory.resolve_device_by_path("/nope").is_none());
    }

    #[test]
    fn test_platform_paired_walks_legal_steps() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let directory = DeviceDirectory::with_events(tx);
        directory.insert(Device::new(PATH, "00:11:22:33:44:55"));

        directory.apply_platform_paired(PATH, true).unwrap();
        assert_eq!(
            directory.resolve_device_by_path(PATH).unwrap().bonding_state,
            BondingState::Bonded
        );

        let mut seen = Vec::new();
        while let Ok(SessionEvent::BondingStateChanged { device, .. }) = rx.try_recv() {
            seen.push(device.bonding_state);
        }
        assert_eq!(seen, vec![BondingState::Bonding, BondingState::Bonded]);
    }

    #[test]
    fn test_lookup_by_address_ignores_case() {
        let directory = directory();
        assert!(directory.device_by_address("00:11:22:33:44:55").is_some());
        assert!(directory.device_by_address("aa:bb:cc:dd:ee:ff").is_none());
        let directory = DeviceDirectory::new();
        directory.insert(Device::new("/d", "AA:BB:CC:DD:EE:FF"));
        assert!(directory.device_by_address("aa:bb:cc:dd:ee:ff").is_some());
    }

    #[test]
    fn test_connection_state_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let directory = DeviceDirectory::with_events(tx);
        directory.insert(Device::new(PATH, "00:11:22:33:44:55"));

        directory
            .set_connection_state(PATH, ConnectionState::Connected)
            .unwrap();
        match rx.try_recv() {
            Ok(SessionEvent::ConnectionStateChanged(device)) => {
                assert_eq!(device.connection_state, ConnectionState::Connected)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
