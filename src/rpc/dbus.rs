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

//! System D-Bus implementation of [`Bus`].

use ::dbus::arg::{AppendAll, ArgAll, ArgType, Iter, IterAppend, PropMap, ReadAll, RefArg, TypeMismatchError, Variant};
use ::dbus::channel::{MatchingReceiver, Sender};
use ::dbus::message::MatchRule;
use ::dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use ::dbus::strings::{BusName, ErrorName, Interface, Member, Path, Signature};
use ::dbus::{MethodErr, Message};
use async_trait::async_trait;
use dbus_crossroads::{Context, Crossroads, IfaceBuilder, IfaceToken};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::{
    ArgSpec, Bus, Direction, InterfaceDescriptor, Invocation, MethodCall, MethodHandler,
    RegistrationId, RemoteCall, Reply, SignalReceiver, SignalRule, SubscriptionId, Value,
};
use crate::error::{CallError, ErrorKind, ProtocolError, TransportError};

/// Timeout for outbound method calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Bus errors that mean the call never reached its target.
const TRANSPORT_ERRORS: &[&str] = &[
    "org.freedesktop.DBus.Error.NoReply",
    "org.freedesktop.DBus.Error.Disconnected",
    "org.freedesktop.DBus.Error.ServiceUnknown",
    "org.freedesktop.DBus.Error.Timeout",
    "org.freedesktop.DBus.Error.NoServer",
];

/// Object data stored in the crossroads tree.
struct Exported {
    handler: Arc<dyn MethodHandler>,
}

#[derive(Default)]
struct Exports {
    interfaces: HashMap<&'static str, IfaceToken<Exported>>,
    objects: HashMap<RegistrationId, Path<'static>>,
}

/// [`Bus`] backed by a connection to the system bus.
///
/// Exported objects live in a [`Crossroads`] tree, which also answers
/// introspection and property queries. Handlers run with that tree locked, so
/// they must not register or remove objects from inside a call.
pub struct DbusBus {
    conn: Arc<SyncConnection>,
    crossroads: Arc<Mutex<Crossroads>>,
    exports: Mutex<Exports>,
    subscriptions: Mutex<HashMap<SubscriptionId, MsgMatch>>,
    next_id: AtomicU64,
}

impl DbusBus {
    /// Connect to the system bus. Must be called from within a Tokio runtime.
    pub fn connect_system() -> Result<Self, TransportError> {
        let (resource, conn) = dbus_tokio::connection::new_system_sync()
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        tokio::spawn(async move {
            let err = resource.await;
            error!("Lost connection to D-Bus: {}", err);
        });

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            conn.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        let crossroads = Arc::new(Mutex::new(crossroads));

        let dispatcher = crossroads.clone();
        conn.start_receive(
            MatchRule::new_method_call(),
            Box::new(move |msg: Message, conn: &SyncConnection| {
                if dispatcher.lock().handle_message(msg, conn).is_err() {
                    debug!("Ignored a message that is not a method call");
                }
                true
            }),
        );

        debug!("Connected to system bus as {}", conn.unique_name());
        Ok(Self {
            conn,
            crossroads,
            exports: Mutex::new(Exports::default()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Bus for DbusBus {
    async fn register_object(
        &self,
        path: &str,
        interface: &'static InterfaceDescriptor,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<RegistrationId, TransportError> {
        let object_path =
            Path::new(path.to_string()).map_err(|_| TransportError::InvalidPath(path.to_string()))?;

        let mut exports = self.exports.lock();
        if exports.objects.values().any(|p| *p == object_path) {
            return Err(TransportError::PathInUse(path.to_string()));
        }

        let mut cr = self.crossroads.lock();
        let token = *exports
            .interfaces
            .entry(interface.name)
            .or_insert_with(|| register_interface(&mut cr, interface));
        cr.insert(object_path.clone(), &[token], Exported { handler });

        let id = RegistrationId(self.next_id());
        exports.objects.insert(id, object_path);
        debug!("Registered {} at {}", interface.name, path);
        Ok(id)
    }

    fn unregister_object(&self, id: RegistrationId) -> bool {
        let Some(path) = self.exports.lock().objects.remove(&id) else {
            return false;
        };
        let removed = self.crossroads.lock().remove::<Exported>(&path).is_some();
        debug!("Unregistered object at {} (removed={})", path, removed);
        removed
    }

    async fn call_remote(&self, call: RemoteCall) -> Result<Vec<Value>, CallError> {
        let (destination, path, interface, member) = validate(&call)?;
        let proxy = Proxy::new(destination, path, CALL_TIMEOUT, self.conn.clone());
        let reply: Result<Inbound, ::dbus::Error> = proxy
            .method_call(interface, member, Outbound(call.args))
            .await;
        match reply {
            Ok(Inbound(Ok(values))) => Ok(values),
            Ok(Inbound(Err(unsupported))) => Err(CallError::Transport(TransportError::Failed(
                format!("Reply to {} has an {}", call.member, unsupported),
            ))),
            Err(e) => Err(call_error(e)),
        }
    }

    fn send_remote(&self, call: RemoteCall) -> Result<(), TransportError> {
        let (destination, path, interface, member) = validate(&call)?;
        let mut msg = Message::new_method_call(destination, path, interface, member)
            .map_err(TransportError::Failed)?;
        msg.set_no_reply(true);
        append_values(&mut msg, &call.args);
        self.conn
            .send(msg)
            .map(|_| ())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn subscribe(
        &self,
        rule: SignalRule,
    ) -> Result<(SubscriptionId, SignalReceiver), TransportError> {
        let interface = Interface::new(rule.interface.clone()).map_err(TransportError::Failed)?;
        let member = Member::new(rule.member.clone()).map_err(TransportError::Failed)?;
        let path = Path::new(rule.path.clone()).map_err(|_| TransportError::InvalidPath(rule.path.clone()))?;

        // Signals carry the unique sender name, so a well-known sender in the
        // rule would never match locally.
        let match_rule = MatchRule::new_signal(interface, member).with_path(path);

        let (tx, rx) = mpsc::unbounded_channel();
        let msg_match = self
            .conn
            .add_match(match_rule)
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?
            .msg_cb(move |msg: Message| {
                match read_values(&msg) {
                    Ok(values) => {
                        let _ = tx.send(values);
                    }
                    Err(unsupported) => debug!("Dropping signal with an {}", unsupported),
                }
                true
            });

        let id = SubscriptionId(self.next_id());
        self.subscriptions.lock().insert(id, msg_match);
        Ok((id, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(msg_match) = self.subscriptions.lock().remove(&id) else {
            return false;
        };
        match self.conn.remove_match(msg_match.token()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove signal match: {}", e);
                false
            }
        }
    }
}

/// Register `descriptor` with crossroads. Every method answers asynchronously
/// once the handler consumes its [`Invocation`].
fn register_interface(
    cr: &mut Crossroads,
    descriptor: &'static InterfaceDescriptor,
) -> IfaceToken<Exported> {
    cr.register(descriptor.name, |ib: &mut IfaceBuilder<Exported>| {
        for method in descriptor.methods {
            let member = method.name;
            ib.method_with_cr_async(
                member,
                method.args,
                method.args,
                move |mut ctx: Context, cr: &mut Crossroads, Inbound(args): Inbound| {
                    let sender = ctx.message().sender().map(|s| s.to_string());
                    let path = ctx.path().to_string();
                    let reply = match cr.data_mut::<Exported>(ctx.path()) {
                        Some(exported) => dispatch(
                            exported.handler.as_ref(),
                            &path,
                            descriptor.name,
                            member,
                            sender,
                            args,
                        ),
                        None => answered(Reply::Error(ProtocolError::failed(format!(
                            "No object at {}",
                            path
                        )))),
                    };
                    async move {
                        let reply = reply
                            .await
                            .unwrap_or_else(|_| Reply::Error(ProtocolError::failed("No response")));
                        ctx.reply(into_result(reply))
                    }
                },
            );
        }
    })
}

/// Hand one decoded call to `handler`. The receiver yields its single reply.
///
/// Arguments that could not be decoded are answered with `InvalidArgs`
/// without reaching the handler.
fn dispatch(
    handler: &dyn MethodHandler,
    path: &str,
    interface: &str,
    member: &str,
    sender: Option<String>,
    args: Result<Vec<Value>, Unsupported>,
) -> oneshot::Receiver<Reply> {
    let args = match args {
        Ok(args) => args,
        Err(unsupported) => {
            debug!("{} called with an {}", member, unsupported);
            return answered(Reply::Error(ProtocolError::new(
                ErrorKind::InvalidArgs,
                unsupported.to_string(),
            )));
        }
    };

    let (tx, rx) = oneshot::channel();
    handler.method_call(MethodCall {
        sender,
        path: path.to_string(),
        interface: Some(interface.to_string()),
        member: member.to_string(),
        args,
        invocation: Invocation::new(member, move |reply| {
            let _ = tx.send(reply);
        }),
    });
    rx
}

fn answered(reply: Reply) -> oneshot::Receiver<Reply> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(reply);
    rx
}

fn into_result(reply: Reply) -> Result<Outbound, MethodErr> {
    match reply {
        Reply::Return(values) => Ok(Outbound(values)),
        Reply::Error(err) => Err(method_err(&err)),
    }
}

/// Error reply for `err`. Names the bus would refuse become `Failed`.
fn method_err(err: &ProtocolError) -> MethodErr {
    let text = err.message.replace('\0', "");
    match ErrorName::new(err.name().to_string()) {
        Ok(name) => MethodErr::from((name, text)),
        Err(_) => {
            warn!("Invalid error name {}, replying Failed", err.name());
            MethodErr::from((ErrorName::from("org.bluez.Error.Failed"), text))
        }
    }
}

fn call_error(e: ::dbus::Error) -> CallError {
    let message = e.message().unwrap_or_default().to_string();
    match e.name() {
        Some(name) if !TRANSPORT_ERRORS.contains(&name) => {
            CallError::Remote(ProtocolError::new(ErrorKind::from_name(name), message))
        }
        _ => CallError::Transport(TransportError::Failed(e.to_string())),
    }
}

fn validate(
    call: &RemoteCall,
) -> Result<(BusName<'static>, Path<'static>, Interface<'static>, Member<'static>), TransportError> {
    let destination = BusName::new(call.destination.clone()).map_err(TransportError::Failed)?;
    let path =
        Path::new(call.path.clone()).map_err(|_| TransportError::InvalidPath(call.path.clone()))?;
    let interface = Interface::new(call.interface.clone()).map_err(TransportError::Failed)?;
    let member = Member::new(call.member.clone()).map_err(TransportError::Failed)?;
    Ok((destination, path, interface, member))
}

/// An argument with no [`Value`] mapping. Decoding stops there so later
/// arguments never shift into its position.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Unsupported {
    position: usize,
    signature: String,
}

impl std::fmt::Display for Unsupported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unsupported argument type {} at position {}",
            self.signature, self.position
        )
    }
}

/// Outbound argument list.
struct Outbound(Vec<Value>);

impl AppendAll for Outbound {
    fn append(&self, ia: &mut IterAppend) {
        for value in &self.0 {
            to_refarg(value).append(ia);
        }
    }
}

impl ArgAll for Outbound {
    type strs = &'static [ArgSpec];

    fn strs_sig<F: FnMut(&'static str, Signature<'static>)>(args: Self::strs, f: F) {
        describe_args(args, Direction::Out, f)
    }
}

/// Inbound argument list.
struct Inbound(Result<Vec<Value>, Unsupported>);

impl ReadAll for Inbound {
    fn read(i: &mut Iter) -> Result<Self, TypeMismatchError> {
        Ok(Inbound(read_all(i)))
    }
}

impl ArgAll for Inbound {
    type strs = &'static [ArgSpec];

    fn strs_sig<F: FnMut(&'static str, Signature<'static>)>(args: Self::strs, f: F) {
        describe_args(args, Direction::In, f)
    }
}

/// Feed the introspection data of one direction of a method signature.
fn describe_args<F: FnMut(&'static str, Signature<'static>)>(
    args: &'static [ArgSpec],
    direction: Direction,
    mut f: F,
) {
    for arg in args.iter().filter(|a| a.direction == direction) {
        match Signature::new(arg.signature) {
            Ok(signature) => f(arg.name, signature),
            Err(e) => warn!("Skipping argument {} with bad signature: {}", arg.name, e),
        }
    }
}

fn append_values(msg: &mut Message, values: &[Value]) {
    let mut ia = IterAppend::new(msg);
    for value in values {
        to_refarg(value).append(&mut ia);
    }
}

fn to_refarg(value: &Value) -> Box<dyn RefArg> {
    match value {
        Value::Bool(b) => Box::new(*b),
        Value::U16(v) => Box::new(*v),
        Value::U32(v) => Box::new(*v),
        Value::Str(s) => Box::new(s.clone()),
        Value::ObjectPath(p) => match Path::new(p.clone()) {
            Ok(path) => Box::new(path),
            Err(_) => {
                warn!("Invalid object path {:?}, sending root", p);
                Box::new(Path::from("/"))
            }
        },
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Strings(s) => Box::new(s.clone()),
        Value::Dict(d) => Box::new(to_propmap(d)),
        Value::Variant(inner) => Box::new(Variant(to_refarg(inner.unwrap_variant()))),
    }
}

fn to_propmap(dict: &BTreeMap<String, Value>) -> PropMap {
    dict.iter()
        .map(|(k, v)| (k.clone(), Variant(to_refarg(v.unwrap_variant()))))
        .collect()
}

fn read_values(msg: &Message) -> Result<Vec<Value>, Unsupported> {
    read_all(&mut msg.iter_init())
}

fn read_all(iter: &mut Iter) -> Result<Vec<Value>, Unsupported> {
    let mut values = Vec::new();
    while iter.arg_type() != ArgType::Invalid {
        match read_value(iter) {
            Some(value) => values.push(value),
            None => {
                return Err(Unsupported {
                    position: values.len(),
                    signature: iter.signature().to_string(),
                })
            }
        }
        if !iter.next() {
            break;
        }
    }
    Ok(values)
}

fn read_value(iter: &mut Iter) -> Option<Value> {
    match iter.arg_type() {
        ArgType::Boolean => iter.get::<bool>().map(Value::Bool),
        ArgType::UInt16 => iter.get::<u16>().map(Value::U16),
        ArgType::UInt32 => iter.get::<u32>().map(Value::U32),
        ArgType::String => iter.get::<String>().map(Value::Str),
        ArgType::ObjectPath => iter
            .get::<Path>()
            .map(|p| Value::ObjectPath(p.to_string())),
        ArgType::Variant => {
            let mut inner = iter.recurse(ArgType::Variant)?;
            read_value(&mut inner).map(|v| Value::Variant(Box::new(v)))
        }
        ArgType::Array => {
            let signature = iter.signature().to_string();
            match signature.as_str() {
                "ay" => iter.get::<Vec<u8>>().map(Value::Bytes),
                "as" => iter.get::<Vec<String>>().map(Value::Strings),
                s if s.starts_with("a{s") => read_dict(iter),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Entries whose value has no [`Value`] mapping are skipped; the rest stay
/// addressable by key.
fn read_dict(iter: &mut Iter) -> Option<Value> {
    let mut entries = iter.recurse(ArgType::Array)?;
    let mut dict = BTreeMap::new();
    while entries.arg_type() == ArgType::DictEntry {
        if let Some(mut entry) = entries.recurse(ArgType::DictEntry) {
            if let Some(key) = entry.get::<String>() {
                entry.next();
                match read_value(&mut entry) {
                    Some(value) => {
                        dict.insert(key, value);
                    }
                    None => debug!("Skipping dictionary entry {} of type {}", key, entry.signature()),
                }
            }
        }
        if !entries.next() {
            break;
        }
    }
    Some(Value::Dict(dict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MethodSpec;

    fn call_message() -> Message {
        Message::new_method_call("org.bluez", "/org/bluez/BincAgent", "org.bluez.Agent1", "Test")
            .unwrap()
    }

    struct Recorder(Mutex<Vec<MethodCall>>);

    impl MethodHandler for Recorder {
        fn method_call(&self, call: MethodCall) {
            self.0.lock().push(call);
        }
    }

    #[test]
    fn test_values_survive_message_encoding() {
        let mut options = BTreeMap::new();
        options.insert(
            "type".to_string(),
            Value::Variant(Box::new(Value::Str("request".to_string()))),
        );
        let values = vec![
            Value::ObjectPath("/org/bluez/hci0/dev_00_11_22_33_44_55".to_string()),
            Value::U32(654321),
            Value::U16(3),
            Value::Str("0000a001-0000-1000-8000-00805f9b34fb".to_string()),
            Value::Bytes(vec![0x12, 0x34, 0x56]),
            Value::Dict(options),
            Value::Strings(vec!["read".to_string(), "notify".to_string()]),
            Value::Bool(true),
            Value::Variant(Box::new(Value::U32(7))),
        ];

        let mut msg = call_message();
        append_values(&mut msg, &values);

        assert_eq!(read_values(&msg), Ok(values));
    }

    #[test]
    fn test_unsupported_argument_stops_decoding() {
        let msg = call_message().append3(7u8, Path::from("/dev"), 5u32);

        let err = read_values(&msg).unwrap_err();
        assert_eq!(err.position, 0);
        assert_eq!(err.signature, "y");
    }

    #[test]
    fn test_unsupported_dict_entry_is_skipped() {
        let mut props = PropMap::new();
        props.insert("RSSI".to_string(), Variant(Box::new(-40i16) as Box<dyn RefArg>));
        props.insert("Paired".to_string(), Variant(Box::new(true) as Box<dyn RefArg>));
        let msg = call_message().append1(props);

        let values = read_values(&msg).unwrap();
        let dict = values[0].as_dict().unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict["Paired"].as_bool(), Some(true));
    }

    #[tokio::test]
    async fn test_undecodable_call_answers_invalid_args() {
        let handler = Recorder(Mutex::new(Vec::new()));
        let unsupported = Unsupported {
            position: 0,
            signature: "y".to_string(),
        };

        let reply = dispatch(
            &handler,
            "/org/bluez/BincAgent",
            "org.bluez.Agent1",
            "RequestConfirmation",
            None,
            Err(unsupported),
        )
        .await
        .unwrap();

        match reply {
            Reply::Error(e) => assert_eq!(e.kind, ErrorKind::InvalidArgs),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(handler.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_invocation() {
        let handler = Recorder(Mutex::new(Vec::new()));
        let reply = dispatch(
            &handler,
            "/org/bluez/BincAgent",
            "org.bluez.Agent1",
            "RequestPasskey",
            Some(":1.7".to_string()),
            Ok(vec![Value::ObjectPath("/dev".to_string())]),
        );

        let call = handler.0.lock().pop().unwrap();
        assert_eq!(call.sender.as_deref(), Some(":1.7"));
        assert_eq!(call.interface.as_deref(), Some("org.bluez.Agent1"));
        call.invocation.reply(vec![Value::U32(1)]);

        assert_eq!(reply.await.unwrap(), Reply::Return(vec![Value::U32(1)]));
    }

    #[test]
    fn test_call_error_splits_transport_and_remote() {
        let no_reply = ::dbus::Error::new_custom("org.freedesktop.DBus.Error.NoReply", "timed out");
        assert!(matches!(call_error(no_reply), CallError::Transport(_)));

        let not_connected = ::dbus::Error::new_custom("org.bluez.Error.NotConnected", "Not connected");
        assert_eq!(
            call_error(not_connected),
            CallError::Remote(ProtocolError::new(ErrorKind::NotConnected, "Not connected"))
        );

        let foreign = ::dbus::Error::new_custom("com.example.Error.Busy", "busy");
        match call_error(foreign) {
            CallError::Remote(e) => assert_eq!(e.name(), "com.example.Error.Busy"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_method_err_keeps_valid_names() {
        let err = method_err(&ProtocolError::rejected("Pairing rejected"));
        assert_eq!(&**err.errorname(), "org.bluez.Error.Rejected");
        assert_eq!(err.description(), "Pairing rejected");
    }

    #[test]
    fn test_method_err_replaces_invalid_name() {
        let err = method_err(&ProtocolError::new(
            ErrorKind::Other("not a valid name".to_string()),
            "odd\0text",
        ));
        assert_eq!(&**err.errorname(), "org.bluez.Error.Failed");
        assert_eq!(err.description(), "oddtext");
    }

    #[test]
    fn test_introspection_follows_direction() {
        static ARGS: &[ArgSpec] = &[ArgSpec::input("device", "o"), ArgSpec::output("passkey", "u")];
        let method = MethodSpec {
            name: "RequestPasskey",
            args: ARGS,
        };

        let mut inputs = Vec::new();
        <Inbound as ArgAll>::strs_sig(method.args, |name, sig| inputs.push((name, sig.to_string())));
        let mut outputs = Vec::new();
        <Outbound as ArgAll>::strs_sig(method.args, |name, sig| outputs.push((name, sig.to_string())));

        assert_eq!(inputs, vec![("device", "o".to_string())]);
        assert_eq!(outputs, vec![("passkey", "u".to_string())]);
    }
}
