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

//! binc-peripheral: BLE vehicle peripheral with password authentication.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use binc_peripheral::bluetooth::ble_constants::{AUTH_SERVICE_UUID, VEHICLE_SERVICE_UUID};
use binc_peripheral::bluetooth::{BluerAdvertiser, DeviceMonitor, GattServer};
use binc_peripheral::events::{Advertiser, EventProcessor};
use binc_peripheral::peripheral::{trusted_authorization_policy, Peripheral};
use binc_peripheral::rpc::dbus::DbusBus;
use binc_peripheral::storage::TrustedDeviceStore;
use binc_peripheral::{Config, Session};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting binc-peripheral v{}", env!("CARGO_PKG_VERSION"));

    let bus = DbusBus::connect_system().context("Failed to connect to the system bus")?;
    let mut session = Session::new(Arc::new(bus));

    let bluer_session = bluer::Session::new().await?;
    let adapter = match &config.adapter {
        Some(name) => bluer_session.adapter(name)?,
        None => bluer_session.default_adapter().await?,
    };
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }

    let trusted_devices = Arc::new(Mutex::new(TrustedDeviceStore::new(&config.data_dir()?)?));

    let agent = session
        .register_agent(&config.agent_path, config.io_capability)
        .await
        .context("Failed to export pairing agent")?;
    agent.set_pin_code(config.pin_code.clone());
    agent.set_authorization_policy(trusted_authorization_policy(trusted_devices.clone()));
    let registration = agent.manager_registration();
    if !registration.registered || !registration.default_agent {
        warn!("Agent registration incomplete: {:?}", registration);
    }

    let _peripheral = Peripheral::install(session.application().clone(), config.password)?;

    let mut server = GattServer::new(adapter.clone(), session.application().clone());
    server.register().await?;

    let mut advertiser = BluerAdvertiser::new(
        adapter.clone(),
        config.local_name.clone(),
        &[VEHICLE_SERVICE_UUID, AUTH_SERVICE_UUID],
    );
    advertiser.start_advertising().await?;
    let mut processor =
        EventProcessor::with_trusted_devices(Box::new(advertiser), trusted_devices);

    let monitor = DeviceMonitor::new(adapter.clone(), session.directory().clone());
    let monitor_task = tokio::spawn(async move {
        if let Err(e) = monitor.run().await {
            error!("Device monitor failed: {:#}", e);
        }
    });

    let mut events = session
        .take_events()
        .context("Session events already taken")?;
    let mut revisions = session.application().revisions();

    let timeout = match config.shutdown_after_secs {
        0 => Duration::MAX,
        secs => Duration::from_secs(secs),
    };
    let shutdown = tokio::time::sleep(timeout);
    tokio::pin!(shutdown);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let Err(e) = processor.process_event(event).await {
                    error!("Failed to process event: {:#}", e);
                }
            }
            Ok(()) = revisions.changed() => {
                if let Err(e) = server.refresh().await {
                    error!("Failed to re-register GATT application: {:#}", e);
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down after {} seconds", config.shutdown_after_secs);
                break;
            }
            _ = &mut ctrl_c => {
                info!("Received SIGINT");
                break;
            }
        }
    }

    server.unregister();
    if let Err(e) = processor.shutdown().await {
        warn!("Failed to stop advertising: {:#}", e);
    }
    session.unregister_agent().await;
    monitor_task.abort();

    info!("binc-peripheral stopped");
    Ok(())
}
