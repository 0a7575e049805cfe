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

//! Local attribute registry.
//!
//! [`Application`] owns the service/characteristic/descriptor tree served to
//! remote centrals and routes their read, write and notify requests to the
//! registered callbacks. The tree itself is transport independent; the GATT
//! server maps it onto BlueZ and re-serves it whenever [`Application::revisions`]
//! ticks.
//!
//! Callbacks run without any registry lock held, so they may freely read and
//! update values or add services through their [`AccessContext`].

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use super::ble_constants::APPLICATION_PATH;
use crate::error::ProtocolError;

/// GATT characteristic/descriptor properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties(u8);

impl Properties {
    pub const READ: Properties = Properties(1 << 0);
    pub const WRITE: Properties = Properties(1 << 1);
    pub const WRITE_WITHOUT_RESPONSE: Properties = Properties(1 << 2);
    pub const NOTIFY: Properties = Properties(1 << 3);
    pub const INDICATE: Properties = Properties(1 << 4);

    pub const fn empty() -> Self {
        Properties(0)
    }

    pub const fn contains(self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn notifiable(self) -> bool {
        self.contains(Self::NOTIFY) || self.contains(Self::INDICATE)
    }

    /// BlueZ flag strings.
    pub fn flags(self) -> Vec<&'static str> {
        [
            (Self::READ, "read"),
            (Self::WRITE, "write"),
            (Self::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (Self::NOTIFY, "notify"),
            (Self::INDICATE, "indicate"),
        ]
        .into_iter()
        .filter(|(p, _)| self.contains(*p))
        .map(|(_, name)| name)
        .collect()
    }
}

impl BitOr for Properties {
    type Output = Properties;

    fn bitor(self, rhs: Properties) -> Properties {
        Properties(self.0 | rhs.0)
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.flags().join(", "))
    }
}

/// Errors building or addressing the attribute tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Service {0} already exists")]
    DuplicateService(Uuid),
    #[error("Characteristic {characteristic} already exists in {service}")]
    DuplicateCharacteristic { service: Uuid, characteristic: Uuid },
    #[error("Unknown service {0}")]
    UnknownService(Uuid),
    #[error("Unknown characteristic {characteristic} in {service}")]
    UnknownCharacteristic { service: Uuid, characteristic: Uuid },
    #[error("Unknown descriptor {descriptor} on {characteristic}")]
    UnknownDescriptor { characteristic: Uuid, descriptor: Uuid },
}

impl From<RegistryError> for ProtocolError {
    fn from(e: RegistryError) -> Self {
        ProtocolError::failed(e.to_string())
    }
}

struct LocalDescriptor {
    uuid: Uuid,
    properties: Properties,
    value: Vec<u8>,
}

struct LocalCharacteristic {
    uuid: Uuid,
    properties: Properties,
    value: Vec<u8>,
    descriptors: Vec<LocalDescriptor>,
    /// `Some` exactly while notifying.
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

struct LocalService {
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<LocalCharacteristic>,
}

#[derive(Default)]
struct Tree {
    services: Vec<LocalService>,
}

impl Tree {
    fn service_mut(&mut self, service: Uuid) -> Result<&mut LocalService, RegistryError> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == service)
            .ok_or(RegistryError::UnknownService(service))
    }

    fn characteristic_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<&mut LocalCharacteristic, RegistryError> {
        self.service_mut(service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == characteristic)
            .ok_or(RegistryError::UnknownCharacteristic {
                service,
                characteristic,
            })
    }

    fn descriptor_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<&mut LocalDescriptor, RegistryError> {
        self.characteristic_mut(service, characteristic)?
            .descriptors
            .iter_mut()
            .find(|d| d.uuid == descriptor)
            .ok_or(RegistryError::UnknownDescriptor {
                characteristic,
                descriptor,
            })
    }
}

/// Snapshot of one descriptor for serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub uuid: Uuid,
    pub path: String,
    pub properties: Properties,
}

/// Snapshot of one characteristic for serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicLayout {
    pub uuid: Uuid,
    pub path: String,
    pub properties: Properties,
    pub descriptors: Vec<DescriptorLayout>,
}

/// Snapshot of one service for serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    pub uuid: Uuid,
    pub path: String,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicLayout>,
}

/// What a callback is being asked about, plus access to the registry.
pub struct AccessContext<'a> {
    application: &'a Application,
    /// Address of the remote central, when the platform reports it.
    pub address: Option<String>,
    pub service_uuid: Uuid,
    pub char_uuid: Uuid,
}

impl<'a> AccessContext<'a> {
    pub fn application(&self) -> &'a Application {
        self.application
    }

    /// Replace the value of the characteristic being accessed.
    pub fn set_value(&self, value: impl Into<Vec<u8>>) -> Result<(), RegistryError> {
        self.application
            .set_char_value(self.service_uuid, self.char_uuid, value)
    }

    pub fn set_char_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), RegistryError> {
        self.application.set_char_value(service, characteristic, value)
    }
}

pub type CharReadCallback = Arc<dyn Fn(&AccessContext<'_>) -> Result<(), ProtocolError> + Send + Sync>;
pub type CharWriteCallback =
    Arc<dyn Fn(&AccessContext<'_>, &[u8]) -> Result<(), ProtocolError> + Send + Sync>;
pub type NotifyStateCallback = Arc<dyn Fn(&AccessContext<'_>) + Send + Sync>;
pub type DescWriteCallback =
    Arc<dyn Fn(&AccessContext<'_>, Uuid, &[u8]) -> Result<(), ProtocolError> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    char_read: Option<CharReadCallback>,
    char_write: Option<CharWriteCallback>,
    char_start_notify: Option<NotifyStateCallback>,
    char_stop_notify: Option<NotifyStateCallback>,
    desc_write: Option<DescWriteCallback>,
}

/// The attribute registry.
pub struct Application {
    tree: Mutex<Tree>,
    callbacks: RwLock<Callbacks>,
    revision: watch::Sender<u64>,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            tree: Mutex::new(Tree::default()),
            callbacks: RwLock::new(Callbacks::default()),
            revision,
        }
    }

    /// Object path of the registry root.
    pub fn path(&self) -> &'static str {
        APPLICATION_PATH
    }

    /// Receiver that ticks whenever services, characteristics or descriptors are added.
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub fn add_service(&self, uuid: Uuid) -> Result<(), RegistryError> {
        self.add_service_with(uuid, true)
    }

    pub fn add_service_with(&self, uuid: Uuid, primary: bool) -> Result<(), RegistryError> {
        {
            let mut tree = self.tree.lock();
            if tree.services.iter().any(|s| s.uuid == uuid) {
                return Err(RegistryError::DuplicateService(uuid));
            }
            tree.services.push(LocalService {
                uuid,
                primary,
                characteristics: Vec::new(),
            });
        }
        info!("Added service {}", uuid);
        self.bump_revision();
        Ok(())
    }

    pub fn has_service(&self, uuid: Uuid) -> bool {
        self.tree.lock().services.iter().any(|s| s.uuid == uuid)
    }

    pub fn add_characteristic(
        &self,
        service: Uuid,
        uuid: Uuid,
        properties: Properties,
    ) -> Result<(), RegistryError> {
        {
            let mut tree = self.tree.lock();
            let local = tree.service_mut(service)?;
            if local.characteristics.iter().any(|c| c.uuid == uuid) {
                return Err(RegistryError::DuplicateCharacteristic {
                    service,
                    characteristic: uuid,
                });
            }
            local.characteristics.push(LocalCharacteristic {
                uuid,
                properties,
                value: Vec::new(),
                descriptors: Vec::new(),
                subscriber: None,
            });
        }
        debug!("Added characteristic {} {} to {}", uuid, properties, service);
        self.bump_revision();
        Ok(())
    }

    pub fn add_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        uuid: Uuid,
        properties: Properties,
    ) -> Result<(), RegistryError> {
        self.tree
            .lock()
            .characteristic_mut(service, characteristic)?
            .descriptors
            .push(LocalDescriptor {
                uuid,
                properties,
                value: Vec::new(),
            });
        debug!("Added descriptor {} to {}", uuid, characteristic);
        self.bump_revision();
        Ok(())
    }

    pub fn set_char_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), RegistryError> {
        self.tree.lock().characteristic_mut(service, characteristic)?.value = value.into();
        Ok(())
    }

    pub fn char_value(&self, service: Uuid, characteristic: Uuid) -> Option<Vec<u8>> {
        self.tree
            .lock()
            .characteristic_mut(service, characteristic)
            .ok()
            .map(|c| c.value.clone())
    }

    pub fn set_desc_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), RegistryError> {
        self.tree
            .lock()
            .descriptor_mut(service, characteristic, descriptor)?
            .value = value.into();
        Ok(())
    }

    pub fn desc_value(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Option<Vec<u8>> {
        self.tree
            .lock()
            .descriptor_mut(service, characteristic, descriptor)
            .ok()
            .map(|d| d.value.clone())
    }

    pub fn is_notifying(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.tree
            .lock()
            .characteristic_mut(service, characteristic)
            .map(|c| c.subscriber.is_some())
            .unwrap_or(false)
    }

    /// Store `value` and push it to the subscribed central.
    ///
    /// Fails with `NotPermitted`, leaving the value untouched, when nobody is
    /// subscribed.
    pub fn notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), ProtocolError> {
        let value = value.into();
        let mut tree = self.tree.lock();
        let local = tree.characteristic_mut(service, characteristic)?;
        let Some(subscriber) = &local.subscriber else {
            return Err(ProtocolError::not_permitted("Not notifying"));
        };
        if subscriber.send(value.clone()).is_err() {
            debug!("Subscriber for {} went away", characteristic);
        }
        local.value = value;
        Ok(())
    }

    /// Current tree with registration paths.
    pub fn layout(&self) -> Vec<ServiceLayout> {
        let tree = self.tree.lock();
        tree.services
            .iter()
            .enumerate()
            .map(|(n, service)| {
                let service_path = format!("{}/service{}", APPLICATION_PATH, n);
                ServiceLayout {
                    uuid: service.uuid,
                    primary: service.primary,
                    characteristics: service
                        .characteristics
                        .iter()
                        .enumerate()
                        .map(|(m, c)| {
                            let char_path = format!("{}/char{}", service_path, m);
                            CharacteristicLayout {
                                uuid: c.uuid,
                                properties: c.properties,
                                descriptors: c
                                    .descriptors
                                    .iter()
                                    .enumerate()
                                    .map(|(k, d)| DescriptorLayout {
                                        uuid: d.uuid,
                                        path: format!("{}/desc{}", char_path, k),
                                        properties: d.properties,
                                    })
                                    .collect(),
                                path: char_path,
                            }
                        })
                        .collect(),
                    path: service_path,
                }
            })
            .collect()
    }

    pub fn on_char_read(
        &self,
        callback: impl Fn(&AccessContext<'_>) -> Result<(), ProtocolError> + Send + Sync + 'static,
    ) {
        self.callbacks.write().char_read = Some(Arc::new(callback));
    }

    pub fn on_char_write(
        &self,
        callback: impl Fn(&AccessContext<'_>, &[u8]) -> Result<(), ProtocolError>
            + Send
            + Sync
            + 'static,
    ) {
        self.callbacks.write().char_write = Some(Arc::new(callback));
    }

    pub fn on_char_start_notify(&self, callback: impl Fn(&AccessContext<'_>) + Send + Sync + 'static) {
        self.callbacks.write().char_start_notify = Some(Arc::new(callback));
    }

    pub fn on_char_stop_notify(&self, callback: impl Fn(&AccessContext<'_>) + Send + Sync + 'static) {
        self.callbacks.write().char_stop_notify = Some(Arc::new(callback));
    }

    pub fn on_desc_write(
        &self,
        callback: impl Fn(&AccessContext<'_>, Uuid, &[u8]) -> Result<(), ProtocolError>
            + Send
            + Sync
            + 'static,
    ) {
        self.callbacks.write().desc_write = Some(Arc::new(callback));
    }

    fn context(&self, address: Option<&str>, service: Uuid, characteristic: Uuid) -> AccessContext<'_> {
        AccessContext {
            application: self,
            address: address.map(str::to_string),
            service_uuid: service,
            char_uuid: characteristic,
        }
    }

    fn char_properties(&self, service: Uuid, characteristic: Uuid) -> Result<Properties, RegistryError> {
        Ok(self
            .tree
            .lock()
            .characteristic_mut(service, characteristic)?
            .properties)
    }

    /// Serve a read request from a remote central.
    pub fn handle_read(
        &self,
        address: Option<&str>,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, ProtocolError> {
        if !self.char_properties(service, characteristic)?.readable() {
            return Err(ProtocolError::not_permitted("Read not permitted"));
        }

        let callback = self.callbacks.read().char_read.clone();
        if let Some(callback) = callback {
            callback(&self.context(address, service, characteristic))?;
        }

        let value = self
            .char_value(service, characteristic)
            .ok_or(RegistryError::UnknownCharacteristic {
                service,
                characteristic,
            })?;
        debug!("Read of {} returns {}", characteristic, hex::encode(&value));
        Ok(value)
    }

    /// Serve a write request from a remote central. Rejected writes are not stored.
    pub fn handle_write(
        &self,
        address: Option<&str>,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), ProtocolError> {
        if !self.char_properties(service, characteristic)?.writable() {
            return Err(ProtocolError::not_permitted("Write not permitted"));
        }
        debug!("Write of {} to {}", hex::encode(value), characteristic);

        let callback = self.callbacks.read().char_write.clone();
        if let Some(callback) = callback {
            callback(&self.context(address, service, characteristic), value)?;
        }

        self.set_char_value(service, characteristic, value)?;
        Ok(())
    }

    pub fn handle_desc_read(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut tree = self.tree.lock();
        let local = tree.descriptor_mut(service, characteristic, descriptor)?;
        if !local.properties.readable() {
            return Err(ProtocolError::not_permitted("Read not permitted"));
        }
        Ok(local.value.clone())
    }

    pub fn handle_desc_write(
        &self,
        address: Option<&str>,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), ProtocolError> {
        let properties = self
            .tree
            .lock()
            .descriptor_mut(service, characteristic, descriptor)?
            .properties;
        if !properties.writable() {
            return Err(ProtocolError::not_permitted("Write not permitted"));
        }

        let callback = self.callbacks.read().desc_write.clone();
        if let Some(callback) = callback {
            callback(&self.context(address, service, characteristic), descriptor, value)?;
        }

        self.set_desc_value(service, characteristic, descriptor, value)?;
        Ok(())
    }

    /// Start notifying a subscriber.
    ///
    /// Returns the receiver of notified values, or `None` when the
    /// characteristic is already notifying. The start callback runs after the
    /// notifying flag is set and only for an actual transition.
    pub fn start_notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<mpsc::UnboundedReceiver<Vec<u8>>>, ProtocolError> {
        let rx = {
            let mut tree = self.tree.lock();
            let local = tree.characteristic_mut(service, characteristic)?;
            if !local.properties.notifiable() {
                return Err(ProtocolError::not_permitted("Notify not permitted"));
            }
            if local.subscriber.is_some() {
                debug!("{} already notifying", characteristic);
                return Ok(None);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            local.subscriber = Some(tx);
            rx
        };

        debug!("Start notify on {}", characteristic);
        let callback = self.callbacks.read().char_start_notify.clone();
        if let Some(callback) = callback {
            callback(&self.context(None, service, characteristic));
        }
        Ok(Some(rx))
    }

    /// Stop notifying. Returns false when the characteristic was not notifying.
    pub fn stop_notify(&self, service: Uuid, characteristic: Uuid) -> bool {
        let stopped = self
            .tree
            .lock()
            .characteristic_mut(service, characteristic)
            .map(|c| c.subscriber.take().is_some())
            .unwrap_or(false);
        if !stopped {
            return false;
        }

        debug!("Stop notify on {}", characteristic);
        let callback = self.callbacks.read().char_stop_notify.clone();
        if let Some(callback) = callback {
            callback(&self.context(None, service, characteristic));
        }
        true
    }

    /// End every notify subscription, running the stop callback for each.
    pub fn clear_subscriptions(&self) {
        let active: Vec<(Uuid, Uuid)> = {
            let tree = self.tree.lock();
            tree.services
                .iter()
                .flat_map(|service| {
                    service
                        .characteristics
                        .iter()
                        .filter(|c| c.subscriber.is_some())
                        .map(move |c| (service.uuid, c.uuid))
                })
                .collect()
        };
        for (service, characteristic) in active {
            self.stop_notify(service, characteristic);
        }
    }
}
