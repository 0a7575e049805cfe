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

//! BLE GATT server serving the attribute registry through BlueZ.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application as GattApplication, ApplicationHandle, Characteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
    CharacteristicReadRequest, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, Descriptor, DescriptorRead, DescriptorReadRequest,
    DescriptorWrite, DescriptorWriteRequest, ReqError, Service,
};
use bluer::Adapter;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::application::{Application, CharacteristicLayout, DescriptorLayout, Properties};
use crate::error::{ErrorKind, ProtocolError};
use crate::events::Advertiser;

/// Map a registry error onto the errors BlueZ lets a GATT server return.
pub fn req_error(error: ProtocolError) -> ReqError {
    debug!("Answering GATT request with {}", error);
    match error.kind {
        ErrorKind::NotPermitted => ReqError::NotPermitted,
        ErrorKind::InvalidValueLength => ReqError::InvalidValueLength,
        ErrorKind::InProgress => ReqError::InProgress,
        ErrorKind::NotAuthorized => ReqError::NotAuthorized,
        ErrorKind::NotSupported => ReqError::NotSupported,
        _ => ReqError::Failed,
    }
}

/// Serves an [`Application`] on an adapter.
pub struct GattServer {
    adapter: Adapter,
    application: Arc<Application>,
    app_handle: Option<ApplicationHandle>,
}

impl GattServer {
    pub fn new(adapter: Adapter, application: Arc<Application>) -> Self {
        Self {
            adapter,
            application,
            app_handle: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.app_handle.is_some()
    }

    /// Register the current attribute tree with BlueZ.
    pub async fn register(&mut self) -> Result<()> {
        let app = build_application(&self.application);
        let services = app.services.len();

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .context("Failed to register GATT application")?;
        self.app_handle = Some(handle);

        info!(
            "GATT application registered at {} with {} service(s)",
            self.application.path(),
            services
        );
        Ok(())
    }

    /// Re-register after the attribute tree changed.
    pub async fn refresh(&mut self) -> Result<()> {
        debug!("Attribute tree changed, re-registering GATT application");
        self.unregister();
        self.register().await
    }

    /// Remove the application from BlueZ.
    pub fn unregister(&mut self) {
        if self.app_handle.take().is_some() {
            self.application.clear_subscriptions();
            info!("GATT application unregistered");
        }
    }
}

/// Build the bluer application tree for the current registry contents.
fn build_application(application: &Arc<Application>) -> GattApplication {
    let services = application
        .layout()
        .into_iter()
        .map(|service| {
            debug!("Registering service {} at {}", service.uuid, service.path);
            Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| build_characteristic(application, service.uuid, c))
                    .collect(),
                ..Default::default()
            }
        })
        .collect();

    GattApplication {
        services,
        ..Default::default()
    }
}

fn build_characteristic(
    application: &Arc<Application>,
    service: Uuid,
    layout: &CharacteristicLayout,
) -> Characteristic {
    let uuid = layout.uuid;
    let properties = layout.properties;
    debug!(
        "Registering characteristic {} {} at {}",
        uuid, properties, layout.path
    );

    let read = properties.readable().then(|| {
        let application = application.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let application = application.clone();
                Box::pin(async move {
                    let address = req.device_address.to_string();
                    application
                        .handle_read(Some(&address), service, uuid)
                        .map_err(req_error)
                })
            }),
            ..Default::default()
        }
    });

    let write = properties.writable().then(|| {
        let application = application.clone();
        CharacteristicWrite {
            write: properties.contains(Properties::WRITE),
            write_without_response: properties.contains(Properties::WRITE_WITHOUT_RESPONSE),
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                    let application = application.clone();
                    Box::pin(async move {
                        let address = req.device_address.to_string();
                        application
                            .handle_write(Some(&address), service, uuid, &value)
                            .map_err(req_error)
                    })
                },
            )),
            ..Default::default()
        }
    });

    let notify = properties.notifiable().then(|| {
        let application = application.clone();
        CharacteristicNotify {
            notify: properties.contains(Properties::NOTIFY),
            indicate: properties.contains(Properties::INDICATE),
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let application = application.clone();
                Box::pin(notify_session(application, service, uuid, notifier))
            })),
            ..Default::default()
        }
    });

    Characteristic {
        uuid,
        read,
        write,
        notify,
        descriptors: layout
            .descriptors
            .iter()
            .map(|d| build_descriptor(application, service, uuid, d))
            .collect(),
        ..Default::default()
    }
}

fn build_descriptor(
    application: &Arc<Application>,
    service: Uuid,
    characteristic: Uuid,
    layout: &DescriptorLayout,
) -> Descriptor {
    let uuid = layout.uuid;

    let read = layout.properties.readable().then(|| {
        let application = application.clone();
        DescriptorRead {
            read: true,
            fun: Box::new(move |_req: DescriptorReadRequest| {
                let application = application.clone();
                Box::pin(async move {
                    application
                        .handle_desc_read(service, characteristic, uuid)
                        .map_err(req_error)
                })
            }),
            ..Default::default()
        }
    });

    let write = layout.properties.writable().then(|| {
        let application = application.clone();
        DescriptorWrite {
            write: true,
            fun: Box::new(move |value: Vec<u8>, req: DescriptorWriteRequest| {
                let application = application.clone();
                Box::pin(async move {
                    let address = req.device_address.to_string();
                    application
                        .handle_desc_write(Some(&address), service, characteristic, uuid, &value)
                        .map_err(req_error)
                })
            }),
            ..Default::default()
        }
    });

    Descriptor {
        uuid,
        read,
        write,
        ..Default::default()
    }
}

/// Forward registry notifications to one subscribed central until it leaves.
async fn notify_session(
    application: Arc<Application>,
    service: Uuid,
    characteristic: Uuid,
    mut notifier: CharacteristicNotifier,
) {
    let mut values = match application.start_notify(service, characteristic) {
        Ok(Some(values)) => values,
        Ok(None) => {
            debug!("{} already has a subscriber", characteristic);
            return;
        }
        Err(e) => {
            warn!("Cannot notify on {}: {}", characteristic, e);
            return;
        }
    };
    debug!("Notification session started for {}", characteristic);

    loop {
        let value = tokio::select! {
            value = values.recv() => value,
            _ = notifier.stopped() => None,
        };
        let Some(value) = value else {
            break;
        };

        debug!("Sending notification: {} bytes", value.len());
        if let Err(e) = notifier.notify(value).await {
            warn!("Failed to send notification: {}", e);
            break;
        }
    }

    application.stop_notify(service, characteristic);
    debug!("Notification session ended for {}", characteristic);
}

/// Advertises the peripheral's services under a local name.
pub struct BluerAdvertiser {
    adapter: Adapter,
    local_name: String,
    service_uuids: BTreeSet<Uuid>,
    handle: Option<AdvertisementHandle>,
}

impl BluerAdvertiser {
    pub fn new(adapter: Adapter, local_name: impl Into<String>, service_uuids: &[Uuid]) -> Self {
        Self {
            adapter,
            local_name: local_name.into(),
            service_uuids: service_uuids.iter().copied().collect(),
            handle: None,
        }
    }
}

#[async_trait]
impl Advertiser for BluerAdvertiser {
    async fn start_advertising(&mut self) -> Result<()> {
        if self.handle.is_some() {
            debug!("Already advertising");
            return Ok(());
        }

        let adv = Advertisement {
            service_uuids: self.service_uuids.clone(),
            discoverable: Some(true),
            local_name: Some(self.local_name.clone()),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(adv)
            .await
            .context("Failed to start advertising")?;
        self.handle = Some(handle);

        info!("BLE advertising started as '{}'", self.local_name);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            info!("BLE advertising stopped");
        }
        Ok(())
    }
}
