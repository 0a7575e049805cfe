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

//! Client for a characteristic exposed by a remote GATT server.
//!
//! Reads, writes and notify subscriptions go through `org.bluez.GattCharacteristic1`
//! on the bus. Operations on one characteristic are serialized.

use parking_lot::Mutex as SyncMutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ble_constants::{BLUEZ_SERVICE, GATT_CHARACTERISTIC_INTERFACE};
use crate::error::{CallError, TransportError};
use crate::rpc::{Bus, RemoteCall, SignalRule, SubscriptionId, Value};

/// Whether a write waits for the remote acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
}

impl WriteType {
    fn as_option(self) -> &'static str {
        match self {
            WriteType::WithResponse => "request",
            WriteType::WithoutResponse => "command",
        }
    }
}

/// Identity of a remote characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub path: String,
    pub uuid: Uuid,
    pub service_path: String,
    pub service_uuid: Uuid,
    /// BlueZ flag strings such as `read` or `write-without-response`.
    pub flags: Vec<String>,
}

type NotifyStateCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

/// A remote GATT characteristic.
pub struct Characteristic {
    bus: Arc<dyn Bus>,
    info: CharacteristicInfo,
    /// Serializes read and write round trips.
    io: Arc<Mutex<()>>,
    /// `Some` exactly while notifying.
    subscription: Mutex<Option<Subscription>>,
    notify_state_callback: SyncMutex<Option<NotifyStateCallback>>,
}

impl Characteristic {
    pub fn new(bus: Arc<dyn Bus>, info: CharacteristicInfo) -> Self {
        Self {
            bus,
            info,
            io: Arc::new(Mutex::new(())),
            subscription: Mutex::new(None),
            notify_state_callback: SyncMutex::new(None),
        }
    }

    pub fn info(&self) -> &CharacteristicInfo {
        &self.info
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    pub fn uuid(&self) -> Uuid {
        self.info.uuid
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.info.flags.iter().any(|f| f == flag)
    }

    pub async fn is_notifying(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Read the current value and wait for the result.
    ///
    /// Must not be awaited from inside a read callback of the same
    /// characteristic, as reads are serialized.
    pub async fn read(&self) -> Result<Vec<u8>, CallError> {
        read_value(self.bus.clone(), self.io.clone(), self.info.path.clone()).await
    }

    /// Read in the background; `callback` runs exactly once with the result.
    pub fn read_with(&self, callback: impl FnOnce(Result<Vec<u8>, CallError>) + Send + 'static) {
        let read = read_value(self.bus.clone(), self.io.clone(), self.info.path.clone());
        tokio::spawn(async move {
            callback(read.await);
        });
    }

    /// Write `value`.
    ///
    /// `WithoutResponse` completes once the message has been queued.
    pub async fn write(&self, value: &[u8], write_type: WriteType) -> Result<(), CallError> {
        write_value(
            self.bus.clone(),
            self.io.clone(),
            self.info.path.clone(),
            value.to_vec(),
            write_type,
        )
        .await
    }

    /// Write in the background; `callback` runs exactly once with the result.
    pub fn write_with(
        &self,
        value: Vec<u8>,
        write_type: WriteType,
        callback: impl FnOnce(Result<(), CallError>) + Send + 'static,
    ) {
        let write = write_value(
            self.bus.clone(),
            self.io.clone(),
            self.info.path.clone(),
            value,
            write_type,
        );
        tokio::spawn(async move {
            callback(write.await);
        });
    }

    /// Called with the new state each time notifications turn on or off.
    pub fn on_notifying_state_changed(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self.notify_state_callback.lock() = Some(Arc::new(callback));
    }

    /// Subscribe to value changes. A second call while notifying does nothing.
    pub async fn start_notify(
        &self,
        on_notify: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Result<(), CallError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            debug!("Already notifying on {}", self.info.path);
            return Ok(());
        }

        let rule = SignalRule::properties_changed(BLUEZ_SERVICE, self.info.path.clone());
        let (id, mut signals) = self.bus.subscribe(rule).await?;

        let call = RemoteCall::new(
            BLUEZ_SERVICE,
            self.info.path.clone(),
            GATT_CHARACTERISTIC_INTERFACE,
            "StartNotify",
        );
        if let Err(e) = self.bus.call_remote(call).await {
            warn!("StartNotify failed for {}: {}", self.info.path, e);
            self.bus.unsubscribe(id).await;
            return Err(e);
        }

        let task = tokio::spawn(async move {
            while let Some(args) = signals.recv().await {
                if let Some(value) = changed_value(&args) {
                    on_notify(value);
                }
            }
        });

        *subscription = Some(Subscription { id, task });
        drop(subscription);

        debug!("Notifications enabled on {}", self.info.path);
        self.fire_notify_state(true);
        Ok(())
    }

    /// Unsubscribe from value changes. Does nothing when not notifying.
    ///
    /// The local subscription is released even if `StopNotify` fails; that
    /// failure is still returned.
    pub async fn stop_notify(&self) -> Result<(), CallError> {
        let mut subscription = self.subscription.lock().await;
        let Some(active) = subscription.take() else {
            return Ok(());
        };

        let call = RemoteCall::new(
            BLUEZ_SERVICE,
            self.info.path.clone(),
            GATT_CHARACTERISTIC_INTERFACE,
            "StopNotify",
        );
        let result = self.bus.call_remote(call).await.map(|_| ());
        if let Err(e) = &result {
            warn!("StopNotify failed for {}: {}", self.info.path, e);
        }

        active.task.abort();
        self.bus.unsubscribe(active.id).await;
        drop(subscription);

        debug!("Notifications disabled on {}", self.info.path);
        self.fire_notify_state(false);
        result
    }

    fn fire_notify_state(&self, notifying: bool) {
        let callback = self.notify_state_callback.lock().clone();
        if let Some(callback) = callback {
            callback(notifying);
        }
    }
}

/// A characteristic dropped while notifying asks BlueZ to stop and releases
/// its signal subscription in the background.
impl Drop for Characteristic {
    fn drop(&mut self) {
        let Some(active) = self.subscription.get_mut().take() else {
            return;
        };
        active.task.abort();

        let call = RemoteCall::new(
            BLUEZ_SERVICE,
            self.info.path.clone(),
            GATT_CHARACTERISTIC_INTERFACE,
            "StopNotify",
        );
        if let Err(e) = self.bus.send_remote(call) {
            debug!("StopNotify on drop failed for {}: {}", self.info.path, e);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.bus.clone();
                let id = active.id;
                handle.spawn(async move {
                    bus.unsubscribe(id).await;
                });
            }
            Err(_) => warn!(
                "No runtime to release the notify subscription of {}",
                self.info.path
            ),
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Characteristic{{uuid='{}', flags='[{}]', service_uuid='{}'}}",
            self.info.uuid,
            self.info.flags.join(", "),
            self.info.service_uuid
        )
    }
}

async fn read_value(
    bus: Arc<dyn Bus>,
    io: Arc<Mutex<()>>,
    path: String,
) -> Result<Vec<u8>, CallError> {
    let _guard = io.lock().await;
    let call = RemoteCall::new(BLUEZ_SERVICE, path.clone(), GATT_CHARACTERISTIC_INTERFACE, "ReadValue")
        .arg(Value::Dict(BTreeMap::new()));

    let reply = bus.call_remote(call).await?;
    let value = reply
        .first()
        .and_then(Value::as_bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| TransportError::Failed(format!("Malformed ReadValue reply from {}", path)))?;

    debug!("Read {} bytes from {}: {}", value.len(), path, hex::encode(&value));
    Ok(value)
}

async fn write_value(
    bus: Arc<dyn Bus>,
    io: Arc<Mutex<()>>,
    path: String,
    value: Vec<u8>,
    write_type: WriteType,
) -> Result<(), CallError> {
    let _guard = io.lock().await;
    debug!("Writing {} to {} ({:?})", hex::encode(&value), path, write_type);

    let mut options = BTreeMap::new();
    options.insert(
        "type".to_string(),
        Value::Variant(Box::new(Value::Str(write_type.as_option().to_string()))),
    );
    let call = RemoteCall::new(BLUEZ_SERVICE, path, GATT_CHARACTERISTIC_INTERFACE, "WriteValue")
        .arg(Value::Bytes(value))
        .arg(Value::Dict(options));

    match write_type {
        WriteType::WithResponse => bus.call_remote(call).await.map(|_| ()),
        WriteType::WithoutResponse => Ok(bus.send_remote(call)?),
    }
}

/// Extract `Value` from a `PropertiesChanged(s, a{sv}, as)` signal.
fn changed_value(args: &[Value]) -> Option<Vec<u8>> {
    if args.first()?.as_str()? != GATT_CHARACTERISTIC_INTERFACE {
        return None;
    }
    args.get(1)?
        .as_dict()?
        .get("Value")?
        .as_bytes()
        .map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ProtocolError};
    use crate::rpc::loopback::LoopbackBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PATH: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55/service0010/char0011";

    fn characteristic(bus: Arc<LoopbackBus>) -> Characteristic {
        Characteristic::new(
            bus,
            CharacteristicInfo {
                path: PATH.to_string(),
                uuid: Uuid::from_u128(0x2a37),
                service_path: "/org/bluez/hci0/dev_00_11_22_33_44_55/service0010".to_string(),
                service_uuid: Uuid::from_u128(0x180d),
                flags: vec!["read".to_string(), "notify".to_string()],
            },
        )
    }

    fn value_changed(bytes: &[u8]) -> Vec<Value> {
        let mut changed = BTreeMap::new();
        changed.insert(
            "Value".to_string(),
            Value::Variant(Box::new(Value::Bytes(bytes.to_vec()))),
        );
        vec![
            Value::Str(GATT_CHARACTERISTIC_INTERFACE.to_string()),
            Value::Dict(changed),
            Value::Strings(vec![]),
        ]
    }

    #[tokio::test]
    async fn test_read_returns_bytes() {
        let bus = Arc::new(LoopbackBus::new());
        bus.set_remote(|_| Ok(vec![Value::Bytes(vec![0x01, 0x02])]));
        let characteristic = characteristic(bus.clone());

        assert_eq!(characteristic.read().await, Ok(vec![0x01, 0x02]));
        assert_eq!(bus.calls()[0].member, "ReadValue");
    }

    #[tokio::test]
    async fn test_read_error_propagated_unchanged() {
        let bus = Arc::new(LoopbackBus::new());
        bus.set_remote(|_| {
            Err(ProtocolError::new(ErrorKind::NotConnected, "Not Connected").into())
        });
        let characteristic = characteristic(bus);

        let err = characteristic.read().await.unwrap_err();
        assert_eq!(err.protocol().unwrap().kind, ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_read_with_calls_back_once() {
        let bus = Arc::new(LoopbackBus::new());
        bus.set_remote(|_| Ok(vec![Value::Bytes(vec![7])]));
        let characteristic = characteristic(bus);

        let (tx, rx) = tokio::sync::oneshot::channel();
        characteristic.read_with(move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(vec![7]));
    }

    #[tokio::test]
    async fn test_write_with_response_waits_for_reply() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());

        characteristic
            .write(&[0xAB], WriteType::WithResponse)
            .await
            .unwrap();

        let calls = bus.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].member, "WriteValue");
        assert_eq!(calls[0].args[0], Value::Bytes(vec![0xAB]));
        assert_eq!(
            calls[0].args[1].as_dict().unwrap()["type"].as_str(),
            Some("request")
        );
        assert!(bus.sent().is_empty());
    }

    #[tokio::test]
    async fn test_write_without_response_is_fire_and_forget() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        characteristic.write_with(vec![1, 2, 3], WriteType::WithoutResponse, move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(()));

        assert!(bus.calls().is_empty());
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].args[1].as_dict().unwrap()["type"].as_str(), Some("command"));
    }

    #[tokio::test]
    async fn test_stop_notify_when_idle_is_noop() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());

        characteristic.stop_notify().await.unwrap();
        assert!(!characteristic.is_notifying().await);
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_notify_round_trip() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());

        let transitions = Arc::new(SyncMutex::new(Vec::new()));
        let seen = transitions.clone();
        characteristic.on_notifying_state_changed(move |notifying| seen.lock().push(notifying));

        characteristic.start_notify(|_| {}).await.unwrap();
        assert!(characteristic.is_notifying().await);
        assert_eq!(bus.subscription_count(), 1);

        characteristic.stop_notify().await.unwrap();
        assert!(!characteristic.is_notifying().await);
        assert_eq!(bus.subscription_count(), 0);

        assert_eq!(*transitions.lock(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_noop() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());
        let transitions = Arc::new(AtomicUsize::new(0));
        let count = transitions.clone();
        characteristic.on_notifying_state_changed(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        characteristic.start_notify(|_| {}).await.unwrap();
        characteristic.start_notify(|_| {}).await.unwrap();

        assert_eq!(bus.subscription_count(), 1);
        assert_eq!(
            bus.calls().iter().filter(|c| c.member == "StartNotify").count(),
            1
        );
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_releases_subscription() {
        let bus = Arc::new(LoopbackBus::new());
        bus.set_remote(|_| Err(ProtocolError::not_permitted("Notify not permitted").into()));
        let characteristic = characteristic(bus.clone());

        assert!(characteristic.start_notify(|_| {}).await.is_err());
        assert!(!characteristic.is_notifying().await);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_while_notifying_releases_subscription() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());
        characteristic.start_notify(|_| {}).await.unwrap();
        assert_eq!(bus.subscription_count(), 1);

        drop(characteristic);
        for _ in 0..10 {
            if bus.subscription_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(bus.subscription_count(), 0);
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].member, "StopNotify");
        assert_eq!(sent[0].path, PATH);
    }

    #[tokio::test]
    async fn test_notifications_delivered() {
        let bus = Arc::new(LoopbackBus::new());
        let characteristic = characteristic(bus.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        characteristic
            .start_notify(move |value| {
                let _ = tx.send(value);
            })
            .await
            .unwrap();

        bus.emit_signal(
            PATH,
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
            value_changed(&[0x42]),
        );

        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(value, Some(vec![0x42]));
    }

    #[test]
    fn test_display() {
        let characteristic = characteristic(Arc::new(LoopbackBus::new()));
        let rendered = characteristic.to_string();
        assert!(rendered.contains("flags='[read, notify]'"));
        assert!(rendered.contains("00000000-0000-0000-0000-00000000180d"));
    }
}
