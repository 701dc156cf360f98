//! # Configuration Store
//!
//! A typed property bag addressed by dotted keys (§4.6): `SetProperty`/
//! `GetProperty` for a single key, `SetProperties`/`UpdateProperties` for
//! atomic batches, `GetProperties`/`GetPropertiesStartingWith` for regex
//! and prefix queries, and change subscribers (typed and as-string).
//!
//! Channel configuration mirrors bidirectionally into the
//! `chans.<name>.<index>.<field>` keyspace, so a channel can be
//! reconfigured either through its own setters or by writing the mirrored
//! keys (§4.3, §4.6).
//!
//! Grounded on `ProgOptions.cxx`'s `ValInfo`/`GetPropertiesMatching`/
//! `UpdateProperties`, with the command-line and JSON front ends it also
//! provides left out (non-goals): only the store itself is in scope.

use crate::channel::{Channel, Method, SocketType};
use crate::error::DeviceError;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A dynamically-typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => write!(f, "{s}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}
impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}
impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}
impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}
impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

/// Extracts a concrete type back out of a [`PropertyValue`], the
/// counterpart to the `From` impls used to store one.
pub trait FromProperty: Sized {
    fn from_property(v: &PropertyValue) -> Option<Self>;
    fn type_name() -> &'static str;
}

impl FromProperty for String {
    fn from_property(v: &PropertyValue) -> Option<Self> {
        match v {
            PropertyValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }
    fn type_name() -> &'static str {
        "String"
    }
}
impl FromProperty for i64 {
    fn from_property(v: &PropertyValue) -> Option<Self> {
        match v {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }
    fn type_name() -> &'static str {
        "i64"
    }
}
impl FromProperty for f64 {
    fn from_property(v: &PropertyValue) -> Option<Self> {
        match v {
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }
    fn type_name() -> &'static str {
        "f64"
    }
}
impl FromProperty for bool {
    fn from_property(v: &PropertyValue) -> Option<Self> {
        match v {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
    fn type_name() -> &'static str {
        "bool"
    }
}

/// Invoked on every property change, typed subscribers filtered by key
/// prefix by the caller; the as-string mirror (`subscribe_as_string`)
/// instead receives every change regardless of key.
pub type PropertyChangeFn = Arc<dyn Fn(&str, &PropertyValue) + Send + Sync>;

struct Subscription {
    id: String,
    callback: PropertyChangeFn,
}

/// The property bag a device and its channels read configuration from.
#[derive(Default)]
pub struct ConfigStore {
    properties: RwLock<HashMap<String, PropertyValue>>,
    subscribers: RwLock<Vec<Subscription>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `SetProperty(key, value)`: set one key, notifying subscribers.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        let key = key.into();
        let value = value.into();
        self.properties.write().unwrap().insert(key.clone(), value.clone());
        self.notify(&key, &value);
    }

    /// `GetProperty(key)`.
    pub fn get_property(&self, key: &str) -> Result<PropertyValue, DeviceError> {
        self.properties
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| DeviceError::PropertyNotFound { key: key.to_string() })
    }

    /// Typed accessor: `GetProperty<T>(key)`.
    pub fn get<T: FromProperty>(&self, key: &str) -> Result<T, DeviceError> {
        let value = self.get_property(key)?;
        T::from_property(&value).ok_or_else(|| DeviceError::PropertyTypeMismatch {
            key: key.to_string(),
            expected: T::type_name(),
        })
    }

    pub fn get_or(&self, key: &str, default: PropertyValue) -> PropertyValue {
        self.properties.read().unwrap().get(key).cloned().unwrap_or(default)
    }

    /// `SetProperties(props)`: replace/insert every key in `props`
    /// atomically. Since every value is independently well-typed on
    /// construction, the only failure mode the original type enforces
    /// (a type-changing overwrite) cannot occur here; the batch is applied
    /// under a single write lock so no partial update is observable.
    pub fn set_properties(&self, props: HashMap<String, PropertyValue>) {
        {
            let mut store = self.properties.write().unwrap();
            for (k, v) in &props {
                store.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &props {
            self.notify(k, v);
        }
    }

    /// `UpdateProperties(props)`: like `SetProperties`, but a key must
    /// already exist and keep its existing value's variant. All-or-nothing:
    /// every key is validated before anything is written, so a batch
    /// containing even one unknown key or type-changing overwrite leaves
    /// every property untouched. Returns the keys that failed validation.
    pub fn update_properties(&self, props: HashMap<String, PropertyValue>) -> Result<(), Vec<String>> {
        let rejected: Vec<String> = {
            let store = self.properties.read().unwrap();
            props
                .iter()
                .filter(|(k, v)| {
                    !matches!(store.get(*k), Some(existing) if std::mem::discriminant(existing) == std::mem::discriminant(*v))
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        if !rejected.is_empty() {
            return Err(rejected);
        }
        self.set_properties(props);
        Ok(())
    }

    /// `UpdateProperty(key, value)`: singular form of [`Self::update_properties`]
    /// — the key must already exist and keep its existing value's variant.
    pub fn update_property(&self, key: &str, value: impl Into<PropertyValue>) -> Result<(), DeviceError> {
        let value = value.into();
        {
            let store = self.properties.read().unwrap();
            match store.get(key) {
                None => return Err(DeviceError::PropertyNotFound { key: key.to_string() }),
                Some(existing) if std::mem::discriminant(existing) != std::mem::discriminant(&value) => {
                    return Err(DeviceError::PropertyTypeMismatch { key: key.to_string(), expected: existing_type_name(existing) });
                }
                Some(_) => {}
            }
        }
        self.set_property(key.to_string(), value);
        Ok(())
    }

    /// `PropertyExists(key)`.
    pub fn property_exists(&self, key: &str) -> bool {
        self.properties.read().unwrap().contains_key(key)
    }

    /// `GetPropertyAsString(key)`: the stored value rendered through
    /// [`PropertyValue`]'s `Display` impl, independent of its variant.
    pub fn get_property_as_string(&self, key: &str) -> Result<String, DeviceError> {
        self.get_property(key).map(|v| v.to_string())
    }

    /// `GetProperties(regex)`: every key/value pair whose key matches the
    /// given regular expression.
    pub fn get_properties(&self, pattern: &str) -> Result<HashMap<String, PropertyValue>, DeviceError> {
        let re = Regex::new(pattern)
            .map_err(|e| DeviceError::Fatal(format!("invalid property query regex \"{pattern}\": {e}")))?;
        Ok(self
            .properties
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| re.is_match(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// `GetPropertiesStartingWith(prefix)`.
    pub fn get_properties_starting_with(&self, prefix: &str) -> HashMap<String, PropertyValue> {
        self.properties
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// `DeleteProperty(key)`.
    pub fn delete_property(&self, key: &str) -> bool {
        self.properties.write().unwrap().remove(key).is_some()
    }

    /// Subscribe to every property change under `id`; unsubscribe by the
    /// same `id`.
    pub fn subscribe(&self, id: impl Into<String>, callback: PropertyChangeFn) {
        self.subscribers.write().unwrap().push(Subscription { id: id.into(), callback });
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.write().unwrap().retain(|s| s.id != id);
    }

    /// Subscribe to every change rendered as a `(key, value-as-string)`
    /// pair, independent of the underlying type — the "as-string mirror
    /// channel" used by diagnostics that don't care about the concrete
    /// `PropertyValue` variant.
    pub fn subscribe_as_string(&self, id: impl Into<String>, callback: Arc<dyn Fn(&str, String) + Send + Sync>) {
        self.subscribe(id, Arc::new(move |k, v| callback(k, v.to_string())));
    }

    fn notify(&self, key: &str, value: &PropertyValue) {
        for sub in self.subscribers.read().unwrap().iter() {
            (sub.callback)(key, value);
        }
    }

    /// Push a channel's fields into the `chans.<name>.<index>.<field>`
    /// mirror keyspace (§4.6). Called whenever a channel is (re)validated.
    pub fn mirror_channel(&self, channel: &Channel) {
        let base = format!("chans.{}.{}", channel.name, channel.subchannel_index);
        self.set_property(format!("{base}.type"), channel.type_name_public().to_string());
        self.set_property(format!("{base}.method"), method_name(channel.default_method).to_string());
        self.set_property(format!("{base}.address"), channel.address.clone());
        self.set_property(format!("{base}.transport"), channel.transport.clone());
        self.set_property(format!("{base}.sndBufSize"), channel.snd_buf_size);
        self.set_property(format!("{base}.rcvBufSize"), channel.rcv_buf_size);
        self.set_property(format!("{base}.rateLogging"), channel.rate_logging_interval_s);
    }

    /// Read the mirror keyspace back into a channel's mutable fields, as
    /// happens when a user overwrites `chans.<name>.<index>.<field>`
    /// directly instead of going through the channel's own API.
    pub fn apply_channel_overrides(&self, channel: &mut Channel) {
        let base = format!("chans.{}.{}", channel.name, channel.subchannel_index);
        if let Ok(address) = self.get::<String>(&format!("{base}.address")) {
            channel.address = address;
            channel.invalidate();
        }
        if let Ok(method) = self.get::<String>(&format!("{base}.method")) {
            if let Some(m) = parse_method(&method) {
                channel.default_method = m;
                channel.invalidate();
            }
        }
        if let Ok(transport) = self.get::<String>(&format!("{base}.transport")) {
            channel.transport = transport;
        }
        if let Ok(n) = self.get::<i64>(&format!("{base}.sndBufSize")) {
            channel.snd_buf_size = n;
            channel.invalidate();
        }
        if let Ok(n) = self.get::<i64>(&format!("{base}.rcvBufSize")) {
            channel.rcv_buf_size = n;
            channel.invalidate();
        }
        if let Ok(n) = self.get::<i64>(&format!("{base}.rateLogging")) {
            channel.rate_logging_interval_s = n;
            channel.invalidate();
        }
    }
}

fn existing_type_name(v: &PropertyValue) -> &'static str {
    match v {
        PropertyValue::String(_) => "String",
        PropertyValue::Int(_) => "i64",
        PropertyValue::Float(_) => "f64",
        PropertyValue::Bool(_) => "bool",
    }
}

fn method_name(m: Method) -> &'static str {
    match m {
        Method::Bind => "bind",
        Method::Connect => "connect",
    }
}

fn parse_method(s: &str) -> Option<Method> {
    match s {
        "bind" => Some(Method::Bind),
        "connect" => Some(Method::Connect),
        _ => None,
    }
}

impl Channel {
    /// Public accessor for the socket type name, used by the mirror
    /// keyspace without exposing the private `type_name` helper.
    pub fn type_name_public(&self) -> &'static str {
        match self.socket_type {
            SocketType::Sub => "sub",
            SocketType::Pub => "pub",
            SocketType::Pull => "pull",
            SocketType::Push => "push",
            SocketType::Req => "req",
            SocketType::Rep => "rep",
            SocketType::XSub => "xsub",
            SocketType::XPub => "xpub",
            SocketType::Dealer => "dealer",
            SocketType::Router => "router",
            SocketType::Pair => "pair",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_and_get_round_trips_a_typed_value() {
        let store = ConfigStore::new();
        store.set_property("io-threads", 4i64);
        assert_eq!(store.get::<i64>("io-threads").unwrap(), 4);
    }

    #[test]
    fn get_unknown_key_reports_property_not_found() {
        let store = ConfigStore::new();
        assert!(matches!(store.get_property("nope"), Err(DeviceError::PropertyNotFound { .. })));
    }

    #[test]
    fn get_wrong_type_reports_type_mismatch() {
        let store = ConfigStore::new();
        store.set_property("name", "device-a");
        assert!(matches!(store.get::<i64>("name"), Err(DeviceError::PropertyTypeMismatch { .. })));
    }

    #[test]
    fn get_properties_matches_by_regex() {
        let store = ConfigStore::new();
        store.set_property("chans.data.0.method", "bind");
        store.set_property("chans.data.1.method", "connect");
        store.set_property("other", "x");
        let matched = store.get_properties(r"^chans\.data\.\d+\.method$").unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn get_properties_starting_with_filters_by_prefix() {
        let store = ConfigStore::new();
        store.set_property("chans.data.0.method", "bind");
        store.set_property("io-threads", 4i64);
        let matched = store.get_properties_starting_with("chans.");
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn update_properties_is_all_or_nothing_on_an_unknown_key() {
        let store = ConfigStore::new();
        store.set_property("io-threads", 4i64);
        let mut batch = HashMap::new();
        batch.insert("io-threads".to_string(), PropertyValue::Int(8));
        batch.insert("unknown".to_string(), PropertyValue::Int(1));
        let rejected = store.update_properties(batch).unwrap_err();
        assert_eq!(rejected, vec!["unknown".to_string()]);
        assert_eq!(store.get::<i64>("io-threads").unwrap(), 4);
        assert!(store.get_property("unknown").is_err());
    }

    #[test]
    fn update_properties_rejects_a_type_changing_overwrite() {
        let store = ConfigStore::new();
        store.set_property("io-threads", 4i64);
        let mut batch = HashMap::new();
        batch.insert("io-threads".to_string(), PropertyValue::String("four".to_string()));
        let rejected = store.update_properties(batch).unwrap_err();
        assert_eq!(rejected, vec!["io-threads".to_string()]);
        assert_eq!(store.get::<i64>("io-threads").unwrap(), 4);
    }

    #[test]
    fn update_property_updates_an_existing_key_in_place() {
        let store = ConfigStore::new();
        store.set_property("io-threads", 4i64);
        store.update_property("io-threads", 8i64).unwrap();
        assert_eq!(store.get::<i64>("io-threads").unwrap(), 8);
    }

    #[test]
    fn update_property_rejects_an_unknown_key() {
        let store = ConfigStore::new();
        assert!(matches!(store.update_property("unknown", 1i64), Err(DeviceError::PropertyNotFound { .. })));
    }

    #[test]
    fn update_property_rejects_a_type_changing_overwrite() {
        let store = ConfigStore::new();
        store.set_property("io-threads", 4i64);
        assert!(matches!(
            store.update_property("io-threads", "four"),
            Err(DeviceError::PropertyTypeMismatch { .. })
        ));
        assert_eq!(store.get::<i64>("io-threads").unwrap(), 4);
    }

    #[test]
    fn property_exists_reflects_the_store() {
        let store = ConfigStore::new();
        assert!(!store.property_exists("io-threads"));
        store.set_property("io-threads", 4i64);
        assert!(store.property_exists("io-threads"));
    }

    #[test]
    fn get_property_as_string_renders_any_variant() {
        let store = ConfigStore::new();
        store.set_property("io-threads", 4i64);
        assert_eq!(store.get_property_as_string("io-threads").unwrap(), "4");
        assert!(matches!(store.get_property_as_string("nope"), Err(DeviceError::PropertyNotFound { .. })));
    }

    #[test]
    fn subscribers_are_notified_on_every_change_until_unsubscribed() {
        let store = ConfigStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        store.subscribe("counter", Arc::new(move |_k, _v| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        store.set_property("a", 1i64);
        store.set_property("b", 2i64);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        store.unsubscribe("counter");
        store.set_property("c", 3i64);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn as_string_subscriber_sees_every_variant_rendered_as_text() {
        let store = ConfigStore::new();
        let seen: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        store.subscribe_as_string("mirror", Arc::new(move |_k, v| seen_clone.write().unwrap().push(v)));
        store.set_property("flag", true);
        store.set_property("count", 3i64);
        assert_eq!(*seen.read().unwrap(), vec!["true".to_string(), "3".to_string()]);
    }

    #[test]
    fn mirror_channel_publishes_fields_into_the_chans_keyspace() {
        let store = ConfigStore::new();
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "tcp://127.0.0.1:5555");
        store.mirror_channel(&chan);
        assert_eq!(store.get::<String>("chans.data.0.address").unwrap(), "tcp://127.0.0.1:5555");
        assert_eq!(store.get::<String>("chans.data.0.method").unwrap(), "bind");
    }

    #[test]
    fn apply_channel_overrides_reads_the_mirror_keyspace_back() {
        let store = ConfigStore::new();
        let mut chan = Channel::new("data", SocketType::Push, Method::Bind, "tcp://127.0.0.1:5555");
        store.mirror_channel(&chan);
        store.set_property("chans.data.0.address", "tcp://127.0.0.1:6666");
        store.apply_channel_overrides(&mut chan);
        assert_eq!(chan.address, "tcp://127.0.0.1:6666");
        assert!(!chan.is_valid());
    }
}
