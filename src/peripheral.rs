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

//! Vehicle peripheral.
//!
//! Centrals first see only the authentication service. Writing the 24-bit
//! password to the password characteristic authenticates the session and
//! installs the vehicle service.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::bluetooth::application::{AccessContext, Application, Properties, RegistryError};
use crate::bluetooth::ble_constants::*;
use crate::bluetooth::device::Device;
use crate::error::ProtocolError;
use crate::storage::TrustedDeviceStore;

/// Default authentication password.
pub const DEFAULT_PASSWORD: u32 = 0x123456;

/// Password length in bytes.
pub const PASSWORD_LEN: usize = 3;

/// Decode a big-endian 24-bit password.
pub fn parse_password(value: &[u8]) -> Result<u32, ProtocolError> {
    if value.len() != PASSWORD_LEN {
        return Err(ProtocolError::invalid_value_length(format!(
            "Invalid password length: {} (expected {})",
            value.len(),
            PASSWORD_LEN
        )));
    }
    Ok(value
        .iter()
        .fold(0u32, |password, byte| (password << 8) | u32::from(*byte)))
}

pub fn install_auth_service(application: &Application) -> Result<(), RegistryError> {
    info!("Adding Auth Service");
    application.add_service(AUTH_SERVICE_UUID)?;
    application.add_characteristic(AUTH_SERVICE_UUID, PASSWORD_CHAR_UUID, Properties::WRITE)?;
    application.add_characteristic(AUTH_SERVICE_UUID, IS_AUTHENTICATED_CHAR_UUID, Properties::READ)?;
    application.add_descriptor(
        AUTH_SERVICE_UUID,
        PASSWORD_CHAR_UUID,
        CUD_DESCRIPTOR_UUID,
        Properties::READ,
    )?;
    application.set_desc_value(
        AUTH_SERVICE_UUID,
        PASSWORD_CHAR_UUID,
        CUD_DESCRIPTOR_UUID,
        b"Password".to_vec(),
    )?;
    application.set_char_value(AUTH_SERVICE_UUID, IS_AUTHENTICATED_CHAR_UUID, b"no".to_vec())
}

pub fn install_vehicle_service(application: &Application) -> Result<(), RegistryError> {
    info!("Adding Vehicle Service");
    application.add_service(VEHICLE_SERVICE_UUID)?;
    for uuid in [CAN_CHAR_UUID, GPS_CHAR_UUID] {
        application.add_characteristic(VEHICLE_SERVICE_UUID, uuid, Properties::NOTIFY)?;
    }
    for uuid in [
        GPS_FREQ_CHAR_UUID,
        CAN_FREQ_CHAR_UUID,
        IMU_FREQ_CHAR_UUID,
        UNLOCK_VEHICLE_CHAR_UUID,
    ] {
        application.add_characteristic(VEHICLE_SERVICE_UUID, uuid, Properties::WRITE)?;
    }
    Ok(())
}

/// The auth/vehicle application logic bound to an attribute registry.
pub struct Peripheral {
    application: Arc<Application>,
    authenticated: Arc<AtomicBool>,
}

impl Peripheral {
    /// Install the auth service and the access callbacks.
    pub fn install(application: Arc<Application>, password: u32) -> Result<Self, RegistryError> {
        install_auth_service(&application)?;

        let authenticated = Arc::new(AtomicBool::new(false));

        let auth = authenticated.clone();
        application.on_char_read(move |ctx| {
            debug!("on char read {}", ctx.char_uuid);
            if ctx.service_uuid == AUTH_SERVICE_UUID && ctx.char_uuid == IS_AUTHENTICATED_CHAR_UUID {
                let value: &[u8] = if auth.load(Ordering::SeqCst) { b"yes" } else { b"no" };
                ctx.set_value(value.to_vec())?;
                return Ok(());
            }
            Err(ProtocolError::rejected("Read rejected"))
        });

        let auth = authenticated.clone();
        application.on_char_write(move |ctx, value| {
            debug!("on char write {}", ctx.char_uuid);
            if ctx.service_uuid == AUTH_SERVICE_UUID && ctx.char_uuid == PASSWORD_CHAR_UUID {
                return authenticate(ctx, value, password, &auth);
            }
            Ok(())
        });

        application.on_char_start_notify(|ctx| debug!("on start notify {}", ctx.char_uuid));
        application.on_char_stop_notify(|ctx| debug!("on stop notify {}", ctx.char_uuid));

        Ok(Self {
            application,
            authenticated,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }
}

fn authenticate(
    ctx: &AccessContext<'_>,
    value: &[u8],
    password: u32,
    authenticated: &AtomicBool,
) -> Result<(), ProtocolError> {
    debug!("Password write received, length: {}", value.len());
    let received = parse_password(value).map_err(|e| {
        error!("{}", e);
        e
    })?;
    debug!("Received password: 0x{:06x}", received);

    if received != password {
        error!("Authentication failed, received password: 0x{:06x}", received);
        return Err(ProtocolError::failed("Authentication failed"));
    }

    authenticated.store(true, Ordering::SeqCst);
    ctx.set_char_value(AUTH_SERVICE_UUID, IS_AUTHENTICATED_CHAR_UUID, b"yes".to_vec())?;
    info!("Authentication successful");

    let application = ctx.application();
    if !application.has_service(VEHICLE_SERVICE_UUID) {
        install_vehicle_service(application)?;
    }
    Ok(())
}

/// Authorization policy accepting trusted centrals, or anyone while none are trusted.
pub fn trusted_authorization_policy(
    store: Arc<Mutex<TrustedDeviceStore>>,
) -> impl Fn(Option<&Device>) -> bool + Send + Sync + 'static {
    move |device| {
        let store = store.lock();
        if store.is_empty() {
            return true;
        }
        device.map(|d| store.is_trusted(&d.address)).unwrap_or(false)
    }
}
