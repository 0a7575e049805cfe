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

//! Message bus abstraction used to receive and answer remote invocations.
//!
//! The pairing agent and the remote characteristic client only talk to the
//! platform through the [`Bus`] trait. Production code uses [`dbus::DbusBus`];
//! tests and offline tooling use [`loopback::LoopbackBus`].

pub mod dbus;
pub mod loopback;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::bluetooth::ble_constants::PROPERTIES_INTERFACE;
use crate::error::{CallError, ProtocolError, TransportError};

/// A dynamically typed bus argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U16(u16),
    U32(u32),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    Strings(Vec<String>),
    Dict(BTreeMap<String, Value>),
    Variant(Box<Value>),
}

impl Value {
    /// D-Bus type signature of this value.
    pub fn signature(&self) -> &'static str {
        match self {
            Value::Bool(_) => "b",
            Value::U16(_) => "q",
            Value::U32(_) => "u",
            Value::Str(_) => "s",
            Value::ObjectPath(_) => "o",
            Value::Bytes(_) => "ay",
            Value::Strings(_) => "as",
            Value::Dict(_) => "a{sv}",
            Value::Variant(_) => "v",
        }
    }

    /// Strip any variant wrapping.
    pub fn unwrap_variant(&self) -> &Value {
        match self {
            Value::Variant(inner) => inner.unwrap_variant(),
            other => other,
        }
    }

    pub fn as_object_path(&self) -> Option<&str> {
        match self.unwrap_variant() {
            Value::ObjectPath(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unwrap_variant() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.unwrap_variant() {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self.unwrap_variant() {
            Value::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unwrap_variant() {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.unwrap_variant() {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self.unwrap_variant() {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Answer to a method call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Return(Vec<Value>),
    Error(ProtocolError),
}

type Responder = Box<dyn FnOnce(Reply) + Send>;

/// Handle used to answer one inbound method call.
///
/// Answering consumes the handle, so a second answer does not compile. An
/// invocation dropped without an answer replies `org.bluez.Error.Failed`.
pub struct Invocation {
    member: String,
    responder: Option<Responder>,
}

impl Invocation {
    pub fn new(member: impl Into<String>, responder: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            member: member.into(),
            responder: Some(Box::new(responder)),
        }
    }

    /// Answer with a return value.
    pub fn reply(mut self, values: Vec<Value>) {
        self.send(Reply::Return(values));
    }

    /// Answer with an empty return.
    pub fn reply_empty(self) {
        self.reply(Vec::new());
    }

    /// Answer with a named error.
    pub fn reply_error(mut self, error: ProtocolError) {
        self.send(Reply::Error(error));
    }

    fn send(&mut self, reply: Reply) {
        if let Some(responder) = self.responder.take() {
            responder(reply);
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!("Invocation of {} dropped without a response", self.member);
            self.send(Reply::Error(ProtocolError::failed("No response")));
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("member", &self.member)
            .field("answered", &self.responder.is_none())
            .finish()
    }
}

/// An inbound method call delivered to a registered object.
#[derive(Debug)]
pub struct MethodCall {
    pub sender: Option<String>,
    pub path: String,
    pub interface: Option<String>,
    pub member: String,
    pub args: Vec<Value>,
    pub invocation: Invocation,
}

/// Receiver of method calls for a registered object.
///
/// Calls are delivered in arrival order from the bus dispatch context.
pub trait MethodHandler: Send + Sync {
    fn method_call(&self, call: MethodCall);
}

/// Direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One argument in a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub direction: Direction,
}

impl ArgSpec {
    pub const fn input(name: &'static str, signature: &'static str) -> Self {
        Self {
            name,
            signature,
            direction: Direction::In,
        }
    }

    pub const fn output(name: &'static str, signature: &'static str) -> Self {
        Self {
            name,
            signature,
            direction: Direction::Out,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub args: &'static [ArgSpec],
}

impl MethodSpec {
    /// Concatenated signature of the input arguments.
    pub fn input_signature(&self) -> String {
        self.args
            .iter()
            .filter(|a| a.direction == Direction::In)
            .map(|a| a.signature)
            .collect()
    }
}

/// Interface exported by a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: &'static str,
    pub methods: &'static [MethodSpec],
}

impl InterfaceDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// An outbound method call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

impl RemoteCall {
    pub fn new(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }
}

/// Signals to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRule {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl SignalRule {
    /// `PropertiesChanged` emitted for one object.
    pub fn properties_changed(sender: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            path: path.into(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: "PropertiesChanged".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiver of signal argument tuples for one subscription.
pub type SignalReceiver = mpsc::UnboundedReceiver<Vec<Value>>;

/// The message bus collaborator.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Export an object implementing `interface` at `path`.
    async fn register_object(
        &self,
        path: &str,
        interface: &'static InterfaceDescriptor,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<RegistrationId, TransportError>;

    /// Remove an exported object. Returns false if `id` was not registered.
    fn unregister_object(&self, id: RegistrationId) -> bool;

    /// Call a remote method and wait for its reply.
    async fn call_remote(&self, call: RemoteCall) -> Result<Vec<Value>, CallError>;

    /// Send a method call without waiting for a reply.
    fn send_remote(&self, call: RemoteCall) -> Result<(), TransportError>;

    /// Subscribe to signals matching `rule`.
    async fn subscribe(
        &self,
        rule: SignalRule,
    ) -> Result<(SubscriptionId, SignalReceiver), TransportError>;

    /// Drop a subscription. Returns false if `id` was not active.
    async fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn capture() -> (Arc<Mutex<Vec<Reply>>>, impl FnOnce(Reply) + Send + 'static) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        (replies, move |reply| sink.lock().push(reply))
    }

    #[test]
    fn test_invocation_reply_once() {
        let (replies, responder) = capture();
        let invocation = Invocation::new("Release", responder);
        invocation.reply_empty();

        let replies = replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], Reply::Return(Vec::new()));
    }

    #[test]
    fn test_dropped_invocation_answers_failed() {
        let (replies, responder) = capture();
        drop(Invocation::new("RequestPasskey", responder));

        let replies = replies.lock();
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            Reply::Error(e) => assert_eq!(e.name(), "org.bluez.Error.Failed"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_value_accessors_see_through_variants() {
        let value = Value::Variant(Box::new(Value::Bytes(vec![1, 2])));
        assert_eq!(value.as_bytes(), Some(&[1u8, 2][..]));
        assert_eq!(value.as_u32(), None);
    }

    #[test]
    fn test_method_lookup_and_input_signature() {
        static METHODS: &[MethodSpec] = &[MethodSpec {
            name: "RequestPasskey",
            args: &[ArgSpec::input("device", "o"), ArgSpec::output("passkey", "u")],
        }];
        static IFACE: InterfaceDescriptor = InterfaceDescriptor {
            name: "org.bluez.Agent1",
            methods: METHODS,
        };

        assert_eq!(IFACE.method("RequestPasskey").unwrap().input_signature(), "o");
        assert!(IFACE.method("Introspect").is_none());
    }

    #[test]
    fn test_properties_changed_rule() {
        let rule = SignalRule::properties_changed("org.bluez", "/org/bluez/hci0/dev_01/service1/char2");
        assert_eq!(rule.interface, "org.freedesktop.DBus.Properties");
        assert_eq!(rule.member, "PropertiesChanged");
        assert_eq!(rule.sender.as_deref(), Some("org.bluez"));
    }
}
