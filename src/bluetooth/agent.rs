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

//! BlueZ pairing agent.
//!
//! The agent exports `org.bluez.Agent1` on the bus, registers itself with
//! `org.bluez.AgentManager1` and answers every pairing request exactly once.
//! Requests are decoded into [`AgentRequest`] before any handling happens, so
//! an unknown method is just another variant that gets an error reply.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::device::{BondingError, BondingState, Device, DeviceDirectory};
use super::ble_constants::{AGENT_INTERFACE, AGENT_MANAGER_INTERFACE, BLUEZ_ROOT_PATH, BLUEZ_SERVICE};
use crate::error::{ErrorKind, ProtocolError, TransportError};
use crate::events::SessionEvent;
use crate::rpc::{
    ArgSpec, Bus, InterfaceDescriptor, MethodCall, MethodHandler, MethodSpec, RegistrationId,
    RemoteCall, Value,
};

/// Default object path of the agent endpoint.
pub const DEFAULT_AGENT_PATH: &str = "/org/bluez/BincAgent";

/// PIN returned to `RequestPinCode` unless configured otherwise.
pub const DEFAULT_PIN_CODE: &str = "123";

static AGENT_METHODS: &[MethodSpec] = &[
    MethodSpec {
        name: "Release",
        args: &[],
    },
    MethodSpec {
        name: "RequestPinCode",
        args: &[ArgSpec::input("device", "o"), ArgSpec::output("pincode", "s")],
    },
    MethodSpec {
        name: "DisplayPinCode",
        args: &[ArgSpec::input("device", "o"), ArgSpec::input("pincode", "s")],
    },
    MethodSpec {
        name: "RequestPasskey",
        args: &[ArgSpec::input("device", "o"), ArgSpec::output("passkey", "u")],
    },
    MethodSpec {
        name: "DisplayPasskey",
        args: &[
            ArgSpec::input("device", "o"),
            ArgSpec::input("passkey", "u"),
            ArgSpec::input("entered", "q"),
        ],
    },
    MethodSpec {
        name: "RequestConfirmation",
        args: &[ArgSpec::input("device", "o"), ArgSpec::input("passkey", "u")],
    },
    MethodSpec {
        name: "RequestAuthorization",
        args: &[ArgSpec::input("device", "o")],
    },
    MethodSpec {
        name: "AuthorizeService",
        args: &[ArgSpec::input("device", "o"), ArgSpec::input("uuid", "s")],
    },
    MethodSpec {
        name: "Cancel",
        args: &[],
    },
];

/// The `org.bluez.Agent1` interface as exported by [`Agent`].
pub static AGENT1: InterfaceDescriptor = InterfaceDescriptor {
    name: AGENT_INTERFACE,
    methods: AGENT_METHODS,
};

/// Input/output capability announced to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    /// Capability string understood by `AgentManager1.RegisterAgent`.
    pub fn as_str(self) -> &'static str {
        match self {
            IoCapability::DisplayOnly => "DisplayOnly",
            IoCapability::DisplayYesNo => "DisplayYesNo",
            IoCapability::KeyboardOnly => "KeyboardOnly",
            IoCapability::NoInputNoOutput => "NoInputNoOutput",
            IoCapability::KeyboardDisplay => "KeyboardDisplay",
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IoCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DisplayOnly" => Ok(IoCapability::DisplayOnly),
            "DisplayYesNo" => Ok(IoCapability::DisplayYesNo),
            "KeyboardOnly" => Ok(IoCapability::KeyboardOnly),
            "NoInputNoOutput" => Ok(IoCapability::NoInputNoOutput),
            "KeyboardDisplay" => Ok(IoCapability::KeyboardDisplay),
            other => Err(format!("Unknown IO capability: {}", other)),
        }
    }
}

/// A pairing request received from the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    Release,
    RequestPinCode { device: String },
    DisplayPinCode { device: String, pincode: String },
    RequestPasskey { device: String },
    DisplayPasskey { device: String, passkey: u32, entered: u16 },
    RequestConfirmation { device: String, passkey: u32 },
    RequestAuthorization { device: String },
    AuthorizeService { device: String, uuid: String },
    Cancel,
    Unknown { member: String },
}

impl AgentRequest {
    /// Decode a method call. Argument mismatches become `InvalidArgs`.
    pub fn decode(member: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        let request = match member {
            "Release" => AgentRequest::Release,
            "Cancel" => AgentRequest::Cancel,
            "RequestPinCode" => AgentRequest::RequestPinCode {
                device: object_path(member, args, 0)?,
            },
            "DisplayPinCode" => AgentRequest::DisplayPinCode {
                device: object_path(member, args, 0)?,
                pincode: string(member, args, 1)?,
            },
            "RequestPasskey" => AgentRequest::RequestPasskey {
                device: object_path(member, args, 0)?,
            },
            "DisplayPasskey" => AgentRequest::DisplayPasskey {
                device: object_path(member, args, 0)?,
                passkey: uint32(member, args, 1)?,
                entered: args
                    .get(2)
                    .and_then(Value::as_u16)
                    .ok_or_else(|| invalid_args(member))?,
            },
            "RequestConfirmation" => AgentRequest::RequestConfirmation {
                device: object_path(member, args, 0)?,
                passkey: uint32(member, args, 1)?,
            },
            "RequestAuthorization" => AgentRequest::RequestAuthorization {
                device: object_path(member, args, 0)?,
            },
            "AuthorizeService" => AgentRequest::AuthorizeService {
                device: object_path(member, args, 0)?,
                uuid: string(member, args, 1)?,
            },
            other => AgentRequest::Unknown {
                member: other.to_string(),
            },
        };
        Ok(request)
    }
}

fn invalid_args(member: &str) -> ProtocolError {
    let signature = AGENT1
        .method(member)
        .map(|m| m.input_signature())
        .unwrap_or_default();
    ProtocolError::new(
        ErrorKind::InvalidArgs,
        format!("Expected ({}) for {}", signature, member),
    )
}

fn object_path(member: &str, args: &[Value], index: usize) -> Result<String, ProtocolError> {
    args.get(index)
        .and_then(Value::as_object_path)
        .map(str::to_string)
        .ok_or_else(|| invalid_args(member))
}

fn string(member: &str, args: &[Value], index: usize) -> Result<String, ProtocolError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid_args(member))
}

fn uint32(member: &str, args: &[Value], index: usize) -> Result<u32, ProtocolError> {
    args.get(index)
        .and_then(Value::as_u32)
        .ok_or_else(|| invalid_args(member))
}

/// Decides whether a device may pair. `None` when the device is unknown.
pub type AuthorizationPolicy = Arc<dyn Fn(Option<&Device>) -> bool + Send + Sync>;

/// Supplies the passkey for a device. `None` when the device is unknown.
pub type PasskeyPolicy = Arc<dyn Fn(Option<&Device>) -> u32 + Send + Sync>;

struct Policy {
    pin_code: String,
    authorization: Option<AuthorizationPolicy>,
    passkey: Option<PasskeyPolicy>,
}

/// The object answering `Agent1` calls.
struct AgentEndpoint {
    directory: Arc<DeviceDirectory>,
    policy: RwLock<Policy>,
    /// Device most recently moved to `Bonding` by this agent.
    bonding_device: Mutex<Option<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
}

impl AgentEndpoint {
    fn respond(&self, request: AgentRequest) -> Result<Vec<Value>, ProtocolError> {
        match request {
            AgentRequest::RequestPinCode { device } => {
                debug!("Request pincode for {}", device);
                let pin = self.policy.read().pin_code.clone();
                Ok(vec![Value::Str(pin)])
            }
            AgentRequest::DisplayPinCode { device, pincode } => {
                debug!("Displaying pincode {} for {}", pincode, device);
                Ok(Vec::new())
            }
            AgentRequest::RequestPasskey { device } => {
                debug!("Request passkey for {}", device);
                let resolved = self.begin_bonding(&device);
                let policy = self.policy.read().passkey.clone();
                match policy {
                    Some(passkey) => Ok(vec![Value::U32(passkey(resolved.as_ref()))]),
                    None => {
                        info!("No passkey policy, rejecting {}", device);
                        Err(ProtocolError::rejected("No passkey inputted"))
                    }
                }
            }
            AgentRequest::DisplayPasskey {
                device,
                passkey,
                entered,
            } => {
                debug!("Passkey {:06} for {}, entered: {}", passkey, device, entered);
                Ok(Vec::new())
            }
            AgentRequest::RequestConfirmation { device, passkey } => {
                debug!("Request confirmation of {:06} for {}", passkey, device);
                Ok(Vec::new())
            }
            AgentRequest::RequestAuthorization { device } => {
                debug!("Request for authorization {}", device);
                let resolved = self.begin_bonding(&device);
                let policy = self.policy.read().authorization.clone();
                match policy {
                    Some(authorize) if !authorize(resolved.as_ref()) => {
                        info!("Pairing rejected for {}", device);
                        Err(ProtocolError::rejected("Pairing rejected"))
                    }
                    _ => Ok(Vec::new()),
                }
            }
            AgentRequest::AuthorizeService { device, uuid } => {
                debug!("Authorize service {} for {}", uuid, device);
                Ok(Vec::new())
            }
            AgentRequest::Cancel => {
                debug!("Cancelling pairing");
                self.cancel_bonding();
                Ok(Vec::new())
            }
            AgentRequest::Release => {
                debug!("Agent released");
                self.publish(SessionEvent::AgentReleased);
                Ok(Vec::new())
            }
            AgentRequest::Unknown { member } => {
                warn!("Unknown agent method {}", member);
                Err(ProtocolError::new(
                    ErrorKind::UnknownMethod,
                    format!("Unknown method {} on {}", member, AGENT_INTERFACE),
                ))
            }
        }
    }

    /// Resolve the device and mark it as bonding. Unknown devices are not an error.
    ///
    /// A request always supersedes the previously tracked device.
    fn begin_bonding(&self, path: &str) -> Option<Device> {
        let tracked = match self.directory.set_bonding_state(path, BondingState::Bonding) {
            Ok(_) => Some(path.to_string()),
            Err(BondingError::UnknownDevice(_)) => {
                debug!("Device {} not found, continuing without bonding state", path);
                None
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        *self.bonding_device.lock() = tracked;
        self.directory.resolve_device_by_path(path)
    }

    /// Reset the tracked device if its pairing is still in flight.
    fn cancel_bonding(&self) {
        let path = self.bonding_device.lock().take().filter(|path| {
            self.directory
                .resolve_device_by_path(path)
                .map(|d| d.bonding_state == BondingState::Bonding)
                .unwrap_or(false)
        });
        if let Some(path) = &path {
            if let Err(e) = self.directory.set_bonding_state(path, BondingState::None) {
                warn!("{}", e);
            }
        }
        self.publish(SessionEvent::PairingCanceled { device_path: path });
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl MethodHandler for AgentEndpoint {
    fn method_call(&self, call: MethodCall) {
        let MethodCall {
            member,
            args,
            invocation,
            ..
        } = call;

        let result = AgentRequest::decode(&member, &args).and_then(|r| self.respond(r));
        match result {
            Ok(values) => invocation.reply(values),
            Err(e) => {
                debug!("{} answered with {}", member, e);
                invocation.reply_error(e);
            }
        }
    }
}

/// Outcome of the `AgentManager1` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentRegistration {
    /// `RegisterAgent` succeeded.
    pub registered: bool,
    /// `RequestDefaultAgent` succeeded.
    pub default_agent: bool,
}

/// A pairing agent exported on the bus.
pub struct Agent {
    bus: Arc<dyn Bus>,
    path: String,
    capability: IoCapability,
    endpoint: Arc<AgentEndpoint>,
    registration: Option<RegistrationId>,
    manager: AgentRegistration,
}

impl Agent {
    /// Export the agent at `path` and register it as the default agent.
    ///
    /// Fails only if the endpoint itself cannot be exported. The two
    /// `AgentManager1` calls are independent; their failures are logged and
    /// reported through [`Agent::manager_registration`].
    pub async fn register(
        bus: Arc<dyn Bus>,
        directory: Arc<DeviceDirectory>,
        path: &str,
        capability: IoCapability,
    ) -> Result<Self, TransportError> {
        let endpoint = Arc::new(AgentEndpoint {
            directory,
            policy: RwLock::new(Policy {
                pin_code: DEFAULT_PIN_CODE.to_string(),
                authorization: None,
                passkey: None,
            }),
            bonding_device: Mutex::new(None),
            events: Mutex::new(None),
        });

        let registration = bus
            .register_object(path, &AGENT1, endpoint.clone())
            .await?;

        let mut agent = Self {
            bus,
            path: path.to_string(),
            capability,
            endpoint,
            registration: Some(registration),
            manager: AgentRegistration::default(),
        };
        agent.manager = agent.register_with_manager().await;
        info!("Agent registered at {} ({})", agent.path, agent.capability);
        Ok(agent)
    }

    async fn register_with_manager(&self) -> AgentRegistration {
        let register = RemoteCall::new(
            BLUEZ_SERVICE,
            BLUEZ_ROOT_PATH,
            AGENT_MANAGER_INTERFACE,
            "RegisterAgent",
        )
        .arg(Value::ObjectPath(self.path.clone()))
        .arg(Value::Str(self.capability.as_str().to_string()));

        let registered = match self.bus.call_remote(register).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to register agent: {}", e);
                false
            }
        };

        let request_default = RemoteCall::new(
            BLUEZ_SERVICE,
            BLUEZ_ROOT_PATH,
            AGENT_MANAGER_INTERFACE,
            "RequestDefaultAgent",
        )
        .arg(Value::ObjectPath(self.path.clone()));

        let default_agent = match self.bus.call_remote(request_default).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to register agent as default agent: {}", e);
                false
            }
        };

        AgentRegistration {
            registered,
            default_agent,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn capability(&self) -> IoCapability {
        self.capability
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn manager_registration(&self) -> AgentRegistration {
        self.manager
    }

    pub fn set_authorization_policy(
        &self,
        policy: impl Fn(Option<&Device>) -> bool + Send + Sync + 'static,
    ) {
        self.endpoint.policy.write().authorization = Some(Arc::new(policy));
    }

    pub fn set_passkey_policy(&self, policy: impl Fn(Option<&Device>) -> u32 + Send + Sync + 'static) {
        self.endpoint.policy.write().passkey = Some(Arc::new(policy));
    }

    pub fn set_pin_code(&self, pin_code: impl Into<String>) {
        self.endpoint.policy.write().pin_code = pin_code.into();
    }

    /// Publish cancel/release notifications on `events`.
    pub fn set_event_sender(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        *self.endpoint.events.lock() = Some(events);
    }

    /// Remove the endpoint from the bus. Calling this again only logs a warning.
    pub async fn unregister(&mut self) {
        let Some(id) = self.registration.take() else {
            warn!("Agent at {} already unregistered", self.path);
            return;
        };

        if !self.bus.unregister_object(id) {
            warn!("Could not unregister agent at {}", self.path);
        }

        let call = RemoteCall::new(
            BLUEZ_SERVICE,
            BLUEZ_ROOT_PATH,
            AGENT_MANAGER_INTERFACE,
            "UnregisterAgent",
        )
        .arg(Value::ObjectPath(self.path.clone()));
        if let Err(e) = self.bus.call_remote(call).await {
            debug!("UnregisterAgent failed: {}", e);
        }
        info!("Agent at {} unregistered", self.path);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(id) = self.registration.take() {
            if !self.bus.unregister_object(id) {
                warn!("Could not unregister agent at {}", self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::rpc::loopback::LoopbackBus;
    use crate::rpc::Reply;

    const DEVICE: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

    fn path(p: &str) -> Value {
        Value::ObjectPath(p.to_string())
    }

    async fn setup() -> (Arc<LoopbackBus>, Arc<DeviceDirectory>, Agent) {
        let bus = Arc::new(LoopbackBus::new());
        let directory = Arc::new(DeviceDirectory::new());
        directory.insert(Device::new(DEVICE, "00:11:22:33:44:55"));
        let agent = Agent::register(
            bus.clone(),
            directory.clone(),
            DEFAULT_AGENT_PATH,
            IoCapability::KeyboardDisplay,
        )
        .await
        .unwrap();
        (bus, directory, agent)
    }

    fn call(bus: &LoopbackBus, member: &str, args: Vec<Value>) -> Reply {
        let mut replies = bus.deliver(DEFAULT_AGENT_PATH, AGENT_INTERFACE, member, args);
        assert_eq!(replies.len(), 1, "{} must be answered exactly once", member);
        replies.remove(0)
    }

    fn error_name(reply: &Reply) -> &str {
        match reply {
            Reply::Error(e) => e.name(),
            Reply::Return(v) => panic!("expected error, got {:?}", v),
        }
    }

    #[test]
    fn test_capability_strings() {
        for capability in [
            IoCapability::DisplayOnly,
            IoCapability::DisplayYesNo,
            IoCapability::KeyboardOnly,
            IoCapability::NoInputNoOutput,
            IoCapability::KeyboardDisplay,
        ] {
            assert_eq!(capability.as_str().parse::<IoCapability>(), Ok(capability));
        }
        assert!("Keyboard".parse::<IoCapability>().is_err());
    }

    #[test]
    fn test_interface_declares_nine_methods() {
        let names: Vec<_> = AGENT1.methods.iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            vec![
                "Release",
                "RequestPinCode",
                "DisplayPinCode",
                "RequestPasskey",
                "DisplayPasskey",
                "RequestConfirmation",
                "RequestAuthorization",
                "AuthorizeService",
                "Cancel"
            ]
        );
        assert_eq!(AGENT1.method("DisplayPasskey").unwrap().input_signature(), "ouq");
    }

    #[test]
    fn test_decode_requests() {
        assert_eq!(
            AgentRequest::decode(
                "DisplayPasskey",
                &[path(DEVICE), Value::U32(123456), Value::U16(2)]
            ),
            Ok(AgentRequest::DisplayPasskey {
                device: DEVICE.to_string(),
                passkey: 123456,
                entered: 2
            })
        );
        assert_eq!(
            AgentRequest::decode("Bogus", &[]),
            Ok(AgentRequest::Unknown {
                member: "Bogus".to_string()
            })
        );
        let err = AgentRequest::decode("RequestPasskey", &[Value::Str("x".to_string())]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgs);
        assert_eq!(err.message, "Expected (o) for RequestPasskey");
    }

    #[tokio::test]
    async fn test_every_method_answered_once_without_policies() {
        let (bus, _directory, _agent) = setup().await;

        let calls: Vec<(&str, Vec<Value>)> = vec![
            ("Release", vec![]),
            ("RequestPinCode", vec![path(DEVICE)]),
            ("DisplayPinCode", vec![path(DEVICE), Value::Str("0000".to_string())]),
            ("RequestPasskey", vec![path(DEVICE)]),
            ("DisplayPasskey", vec![path(DEVICE), Value::U32(1), Value::U16(0)]),
            ("RequestConfirmation", vec![path(DEVICE), Value::U32(1)]),
            ("RequestAuthorization", vec![path(DEVICE)]),
            ("AuthorizeService", vec![path(DEVICE), Value::Str("180d".to_string())]),
            ("Cancel", vec![]),
            ("NotAMethod", vec![]),
        ];
        for (member, args) in calls {
            call(&bus, member, args);
        }
    }

    #[tokio::test]
    async fn test_pin_code_default_and_override() {
        let (bus, _directory, agent) = setup().await;
        assert_eq!(
            call(&bus, "RequestPinCode", vec![path(DEVICE)]),
            Reply::Return(vec![Value::Str("123".to_string())])
        );

        agent.set_pin_code("4711");
        assert_eq!(
            call(&bus, "RequestPinCode", vec![path(DEVICE)]),
            Reply::Return(vec![Value::Str("4711".to_string())])
        );
    }

    #[tokio::test]
    async fn test_passkey_without_policy_is_rejected() {
        let (bus, directory, _agent) = setup().await;
        let reply = call(&bus, "RequestPasskey", vec![path(DEVICE)]);
        assert_eq!(error_name(&reply), "org.bluez.Error.Rejected");
        assert_eq!(
            directory.resolve_device_by_path(DEVICE).unwrap().bonding_state,
            BondingState::Bonding
        );
    }

    #[tokio::test]
    async fn test_authorization_without_policy_is_allowed() {
        let (bus, _directory, _agent) = setup().await;
        assert_eq!(
            call(&bus, "RequestAuthorization", vec![path(DEVICE)]),
            Reply::Return(vec![])
        );
    }

    #[tokio::test]
    async fn test_authorization_policy_denies() {
        let (bus, _directory, agent) = setup().await;
        agent.set_authorization_policy(|device| device.is_none());
        let reply = call(&bus, "RequestAuthorization", vec![path(DEVICE)]);
        assert_eq!(error_name(&reply), "org.bluez.Error.Rejected");
    }

    #[tokio::test]
    async fn test_policy_sees_bonding_device() {
        let (bus, _directory, agent) = setup().await;
        agent.set_authorization_policy(|device| {
            device.map(|d| d.bonding_state == BondingState::Bonding) == Some(true)
        });
        assert_eq!(
            call(&bus, "RequestAuthorization", vec![path(DEVICE)]),
            Reply::Return(vec![])
        );
    }

    #[tokio::test]
    async fn test_unknown_device_completes_without_mutation() {
        let (bus, directory, agent) = setup().await;
        agent.set_passkey_policy(|device| if device.is_none() { 1 } else { 2 });

        let reply = call(&bus, "RequestPasskey", vec![path("/org/bluez/hci0/dev_FF")]);
        assert_eq!(reply, Reply::Return(vec![Value::U32(1)]));

        let reply = call(&bus, "RequestAuthorization", vec![path("/org/bluez/hci0/dev_FF")]);
        assert_eq!(reply, Reply::Return(vec![]));

        assert_eq!(
            directory.resolve_device_by_path(DEVICE).unwrap().bonding_state,
            BondingState::None
        );
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_arguments_answered_with_invalid_args() {
        let (bus, _directory, _agent) = setup().await;
        let reply = call(&bus, "DisplayPasskey", vec![path(DEVICE), Value::U32(1)]);
        assert_eq!(error_name(&reply), "org.freedesktop.DBus.Error.InvalidArgs");
    }

    #[tokio::test]
    async fn test_unknown_method_answered() {
        let (bus, _directory, _agent) = setup().await;
        let reply = call(&bus, "Frobnicate", vec![]);
        assert_eq!(error_name(&reply), "org.freedesktop.DBus.Error.UnknownMethod");
    }

    #[tokio::test]
    async fn test_cancel_abandons_bonding() {
        let (bus, directory, agent) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent.set_event_sender(tx);

        call(&bus, "RequestAuthorization", vec![path(DEVICE)]);
        call(&bus, "Cancel", vec![]);

        assert_eq!(
            directory.resolve_device_by_path(DEVICE).unwrap().bonding_state,
            BondingState::None
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::PairingCanceled {
                device_path: Some(DEVICE.to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_ignores_finished_bonding() {
        let (bus, directory, agent) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent.set_event_sender(tx);

        call(&bus, "RequestAuthorization", vec![path(DEVICE)]);
        directory
            .set_bonding_state(DEVICE, BondingState::Bonded)
            .unwrap();
        call(&bus, "RequestAuthorization", vec![path("/org/bluez/hci0/dev_unknown")]);
        call(&bus, "Cancel", vec![]);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::PairingCanceled { device_path: None }
        );
        assert_eq!(
            directory.resolve_device_by_path(DEVICE).unwrap().bonding_state,
            BondingState::Bonded
        );
    }

    #[tokio::test]
    async fn test_cancel_after_bonded_reports_no_device() {
        let (bus, directory, agent) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent.set_event_sender(tx);

        call(&bus, "RequestPasskey", vec![path(DEVICE)]);
        directory
            .set_bonding_state(DEVICE, BondingState::Bonded)
            .unwrap();
        call(&bus, "Cancel", vec![]);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::PairingCanceled { device_path: None }
        );
    }

    #[tokio::test]
    async fn test_registration_handshake() {
        let (bus, _directory, agent) = setup().await;

        assert_eq!(
            bus.exported_interface(DEFAULT_AGENT_PATH).map(|i| i.name),
            Some(AGENT_INTERFACE)
        );
        let calls = bus.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].member, "RegisterAgent");
        assert_eq!(
            calls[0].args,
            vec![path(DEFAULT_AGENT_PATH), Value::Str("KeyboardDisplay".to_string())]
        );
        assert_eq!(calls[1].member, "RequestDefaultAgent");
        assert_eq!(calls[1].args, vec![path(DEFAULT_AGENT_PATH)]);
        assert_eq!(
            agent.manager_registration(),
            AgentRegistration {
                registered: true,
                default_agent: true
            }
        );
    }

    #[tokio::test]
    async fn test_registration_steps_fail_independently() {
        let bus = Arc::new(LoopbackBus::new());
        bus.set_remote(|call| {
            if call.member == "RegisterAgent" {
                Err(CallError::Remote(ProtocolError::new(
                    ErrorKind::Other("org.bluez.Error.AlreadyExists".to_string()),
                    "Already Exists",
                )))
            } else {
                Ok(vec![])
            }
        });

        let agent = Agent::register(
            bus.clone(),
            Arc::new(DeviceDirectory::new()),
            DEFAULT_AGENT_PATH,
            IoCapability::NoInputNoOutput,
        )
        .await
        .unwrap();

        assert_eq!(
            agent.manager_registration(),
            AgentRegistration {
                registered: false,
                default_agent: true
            }
        );
        assert!(agent.is_registered());
    }

    #[tokio::test]
    async fn test_default_agent_failure_keeps_registration() {
        let bus = Arc::new(LoopbackBus::new());
        bus.set_remote(|call| {
            if call.member == "RequestDefaultAgent" {
                Err(CallError::Remote(ProtocolError::new(
                    ErrorKind::Other("org.bluez.Error.DoesNotExist".to_string()),
                    "Does Not Exist",
                )))
            } else {
                Ok(vec![])
            }
        });

        let agent = Agent::register(
            bus.clone(),
            Arc::new(DeviceDirectory::new()),
            DEFAULT_AGENT_PATH,
            IoCapability::DisplayYesNo,
        )
        .await
        .unwrap();

        assert_eq!(
            agent.manager_registration(),
            AgentRegistration {
                registered: true,
                default_agent: false
            }
        );
        assert!(agent.is_registered());
        assert!(bus.is_registered(DEFAULT_AGENT_PATH));
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let (bus, _directory, mut agent) = setup().await;

        agent.unregister().await;
        assert!(!agent.is_registered());
        assert!(!bus.is_registered(DEFAULT_AGENT_PATH));

        agent.unregister().await;
        assert!(!agent.is_registered());
        assert_eq!(
            bus.calls().iter().filter(|c| c.member == "UnregisterAgent").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_drop_unregisters_endpoint() {
        let (bus, _directory, agent) = setup().await;
        drop(agent);
        assert!(!bus.is_registered(DEFAULT_AGENT_PATH));
    }
}
