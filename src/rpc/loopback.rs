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

//! In-process bus.
//!
//! Objects registered here are invoked directly through [`LoopbackBus::deliver`].
//! Outbound calls are recorded and answered by an optional scripted remote.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    Bus, InterfaceDescriptor, Invocation, MethodCall, MethodHandler, RegistrationId, RemoteCall,
    Reply, SignalReceiver, SignalRule, SubscriptionId, Value,
};
use crate::error::{CallError, TransportError};

type RemoteFn = Box<dyn Fn(&RemoteCall) -> Result<Vec<Value>, CallError> + Send + Sync>;

struct Registered {
    path: String,
    interface: &'static InterfaceDescriptor,
    handler: Arc<dyn MethodHandler>,
}

#[derive(Default)]
struct State {
    objects: HashMap<RegistrationId, Registered>,
    subscriptions: HashMap<SubscriptionId, (SignalRule, mpsc::UnboundedSender<Vec<Value>>)>,
    calls: Vec<RemoteCall>,
    sent: Vec<RemoteCall>,
}

/// Bus that keeps everything in the current process.
#[derive(Default)]
pub struct LoopbackBus {
    state: Mutex<State>,
    remote: Mutex<Option<RemoteFn>>,
    next_id: AtomicU64,
    disconnected: AtomicBool,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer outbound calls with `f` instead of an empty success.
    pub fn set_remote(
        &self,
        f: impl Fn(&RemoteCall) -> Result<Vec<Value>, CallError> + Send + Sync + 'static,
    ) {
        *self.remote.lock() = Some(Box::new(f));
    }

    /// Make every outbound operation fail as if the bus went away.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Calls made through [`Bus::call_remote`], in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Calls made through [`Bus::send_remote`], in order.
    pub fn sent(&self) -> Vec<RemoteCall> {
        self.state.lock().sent.clone()
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.state.lock().objects.values().any(|o| o.path == path)
    }

    /// Interface exported at `path`, if any.
    pub fn exported_interface(&self, path: &str) -> Option<&'static InterfaceDescriptor> {
        self.state
            .lock()
            .objects
            .values()
            .find(|o| o.path == path)
            .map(|o| o.interface)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Invoke a method on a registered object, returning every reply sent.
    ///
    /// A well-behaved handler produces exactly one reply. An empty vector
    /// means nothing is registered at `path`.
    pub fn deliver(&self, path: &str, interface: &str, member: &str, args: Vec<Value>) -> Vec<Reply> {
        let handler = {
            let state = self.state.lock();
            state
                .objects
                .values()
                .find(|o| o.path == path)
                .map(|o| o.handler.clone())
        };
        let Some(handler) = handler else {
            return Vec::new();
        };

        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = replies.clone();
        handler.method_call(MethodCall {
            sender: Some(":loopback".to_string()),
            path: path.to_string(),
            interface: Some(interface.to_string()),
            member: member.to_string(),
            args,
            invocation: Invocation::new(member, move |reply| sink.lock().push(reply)),
        });

        let result = replies.lock().clone();
        result
    }

    /// Emit a signal to all matching subscriptions.
    pub fn emit_signal(&self, path: &str, interface: &str, member: &str, args: Vec<Value>) {
        let state = self.state.lock();
        for (rule, tx) in state.subscriptions.values() {
            if rule.path == path && rule.interface == interface && rule.member == member {
                let _ = tx.send(args.clone());
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Bus for LoopbackBus {
    async fn register_object(
        &self,
        path: &str,
        interface: &'static InterfaceDescriptor,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<RegistrationId, TransportError> {
        self.check_connected()?;
        if !path.starts_with('/') {
            return Err(TransportError::InvalidPath(path.to_string()));
        }

        let mut state = self.state.lock();
        if state.objects.values().any(|o| o.path == path) {
            return Err(TransportError::PathInUse(path.to_string()));
        }

        let id = RegistrationId(self.next_id());
        state.objects.insert(
            id,
            Registered {
                path: path.to_string(),
                interface,
                handler,
            },
        );
        debug!("Loopback object registered at {}", path);
        Ok(id)
    }

    fn unregister_object(&self, id: RegistrationId) -> bool {
        self.state.lock().objects.remove(&id).is_some()
    }

    async fn call_remote(&self, call: RemoteCall) -> Result<Vec<Value>, CallError> {
        self.check_connected()?;
        self.state.lock().calls.push(call.clone());

        let remote = self.remote.lock();
        match remote.as_ref() {
            Some(f) => f(&call),
            None => Ok(Vec::new()),
        }
    }

    fn send_remote(&self, call: RemoteCall) -> Result<(), TransportError> {
        self.check_connected()?;
        self.state.lock().sent.push(call);
        Ok(())
    }

    async fn subscribe(
        &self,
        rule: SignalRule,
    ) -> Result<(SubscriptionId, SignalReceiver), TransportError> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_id());
        self.state.lock().subscriptions.insert(id, (rule, tx));
        Ok((id, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().subscriptions.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::rpc::{ArgSpec, MethodSpec};

    static METHODS: &[MethodSpec] = &[MethodSpec {
        name: "Ping",
        args: &[ArgSpec::output("pong", "s")],
    }];
    static IFACE: InterfaceDescriptor = InterfaceDescriptor {
        name: "org.example.Ping",
        methods: METHODS,
    };

    struct Pong;

    impl MethodHandler for Pong {
        fn method_call(&self, call: MethodCall) {
            call.invocation.reply(vec![Value::Str("pong".to_string())]);
        }
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let bus = LoopbackBus::new();
        let id = bus.register_object("/ping", &IFACE, Arc::new(Pong)).await.unwrap();

        let replies = bus.deliver("/ping", "org.example.Ping", "Ping", vec![]);
        assert_eq!(replies, vec![Reply::Return(vec![Value::Str("pong".to_string())])]);

        assert!(bus.unregister_object(id));
        assert!(!bus.unregister_object(id));
        assert!(bus.deliver("/ping", "org.example.Ping", "Ping", vec![]).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_path_rejected() {
        let bus = LoopbackBus::new();
        bus.register_object("/ping", &IFACE, Arc::new(Pong)).await.unwrap();
        let err = bus.register_object("/ping", &IFACE, Arc::new(Pong)).await.unwrap_err();
        assert_eq!(err, TransportError::PathInUse("/ping".to_string()));
    }

    #[tokio::test]
    async fn test_remote_calls_recorded_and_scripted() {
        let bus = LoopbackBus::new();
        bus.set_remote(|call| {
            if call.member == "Fail" {
                Err(ProtocolError::rejected("no").into())
            } else {
                Ok(vec![Value::U32(7)])
            }
        });

        let ok = bus
            .call_remote(RemoteCall::new("org.bluez", "/", "org.example", "Get"))
            .await
            .unwrap();
        assert_eq!(ok, vec![Value::U32(7)]);

        let err = bus
            .call_remote(RemoteCall::new("org.bluez", "/", "org.example", "Fail"))
            .await
            .unwrap_err();
        assert_eq!(err.protocol().unwrap().name(), "org.bluez.Error.Rejected");
        assert_eq!(bus.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_bus_fails_calls() {
        let bus = LoopbackBus::new();
        bus.set_disconnected(true);
        let err = bus
            .call_remote(RemoteCall::new("org.bluez", "/", "org.example", "Get"))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Transport(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_signals_reach_matching_subscribers() {
        let bus = LoopbackBus::new();
        let (id, mut rx) = bus
            .subscribe(SignalRule::properties_changed("org.bluez", "/char"))
            .await
            .unwrap();

        bus.emit_signal("/other", "org.freedesktop.DBus.Properties", "PropertiesChanged", vec![]);
        bus.emit_signal(
            "/char",
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
            vec![Value::U16(1)],
        );

        assert_eq!(rx.recv().await, Some(vec![Value::U16(1)]));
        assert!(bus.unsubscribe(id).await);
        assert_eq!(bus.subscription_count(), 0);
    }
}
