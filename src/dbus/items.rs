//! VeDbus-style BusItem objects and value conversion
//!
//! D-Bus has no null; the Victron convention encodes an invalid value as an
//! empty `ai` array. The conversions here map that to `serde_json::Value::Null`
//! and back, so the rest of the crate can treat "unknown" uniformly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use super::fmt::format_path_value;
use super::shared::SharedState;
use crate::engine::EngineCommand;

/// One exported output path implementing com.victronenergy.BusItem
pub struct BusItem {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<SharedState>>,
}

impl BusItem {
    pub fn new(path: String, shared: Arc<Mutex<SharedState>>) -> Self {
        Self { path, shared }
    }

    /// Normalize an incoming relay write. Only the integers 0 and 1 are
    /// acceptable states.
    fn normalize_relay_state(value: &serde_json::Value) -> Option<serde_json::Value> {
        match value.as_f64() {
            Some(v) if v == 0.0 => Some(serde_json::json!(0)),
            Some(v) if v == 1.0 => Some(serde_json::json!(1)),
            _ => None,
        }
    }

    fn accept_write(&self, value: &serde_json::Value) -> Option<serde_json::Value> {
        match self.path.as_str() {
            "/Relay/0/State" => Self::normalize_relay_state(value),
            _ => Some(value.clone()),
        }
    }

    fn dispatch_command(&self, shared: &SharedState, normalized: &serde_json::Value) {
        if self.path.as_str() == "/Relay/0/State" {
            let _ = shared
                .commands_tx
                .send(EngineCommand::SetRelayState(normalized.clone()));
        }
    }
}

fn variant_to_serde(v: &Value<'_>) -> serde_json::Value {
    match v {
        Value::U8(x) => serde_json::json!(x),
        Value::Bool(x) => serde_json::json!(x),
        Value::I16(x) => serde_json::json!(x),
        Value::U16(x) => serde_json::json!(x),
        Value::I32(x) => serde_json::json!(x),
        Value::U32(x) => serde_json::json!(x),
        Value::I64(x) => serde_json::json!(x),
        Value::U64(x) => serde_json::json!(x),
        Value::F64(x) => serde_json::json!(x),
        Value::Str(s) => serde_json::json!(s.as_str()),
        Value::ObjectPath(p) => serde_json::json!(p.as_str()),
        Value::Value(inner) => variant_to_serde(inner),
        Value::Array(a) => {
            // An empty array is the wire encoding of an invalid value
            if a.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::Array(a.iter().map(variant_to_serde).collect())
            }
        }
        // Dicts and structures are never mirrored as scalars
        _ => serde_json::Value::Null,
    }
}

/// Decode a received bus value into the crate's value model
pub fn owned_value_to_serde(v: &OwnedValue) -> serde_json::Value {
    variant_to_serde(v)
}

fn serde_to_variant(v: &serde_json::Value) -> Value<'static> {
    match v {
        serde_json::Value::Null => Value::from(Vec::<i32>::new()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::from(s.clone()),
        serde_json::Value::Array(items) => {
            // Published arrays are integer lists (product ids)
            let ints: Vec<i32> = items
                .iter()
                .filter_map(|x| x.as_i64())
                .map(|x| x as i32)
                .collect();
            Value::from(ints)
        }
        serde_json::Value::Object(map) => {
            let dict: HashMap<String, Value<'static>> = map
                .iter()
                .map(|(k, val)| (k.clone(), serde_to_variant(val)))
                .collect();
            Value::from(dict)
        }
    }
}

/// Encode a crate value for the wire
pub fn serde_to_owned_value(v: &serde_json::Value) -> OwnedValue {
    OwnedValue::try_from(serde_to_variant(v)).unwrap_or_else(|_| OwnedValue::from(0i64))
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl BusItem {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        let val = {
            let shared = self.shared.lock().unwrap();
            shared
                .paths
                .get(&self.path)
                .cloned()
                .unwrap_or(serde_json::Value::Null)
        };
        serde_to_owned_value(&val)
    }

    #[zbus(name = "SetValue")]
    async fn set_value(&self, value: OwnedValue) -> i32 {
        let (conn_opt, root_path, normalized) = {
            let mut shared = self.shared.lock().unwrap();
            if !shared.writable.contains(&self.path) {
                return 1;
            }
            let incoming = owned_value_to_serde(&value);
            let Some(normalized) = self.accept_write(&incoming) else {
                return 1;
            };
            shared.paths.insert(self.path.clone(), normalized.clone());
            (shared.connection.clone(), shared.root_path.clone(), normalized)
        };

        if let Some(conn) = conn_opt {
            notify_change(&conn, &root_path, &self.path, &normalized).await;
        }

        let shared = self.shared.lock().unwrap();
        self.dispatch_command(&shared, &normalized);

        0
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> String {
        let val = {
            let shared = self.shared.lock().unwrap();
            shared
                .paths
                .get(&self.path)
                .cloned()
                .unwrap_or(serde_json::Value::Null)
        };
        format_path_value(&self.path, &val)
    }

    #[zbus(signal)]
    pub async fn properties_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;
}

/// The {Value, Text} dictionary the BusItem interface exposes for a path,
/// shared by `GetItems` and the change signals.
pub(crate) fn change_entry(path: &str, value: &serde_json::Value) -> HashMap<String, OwnedValue> {
    let text = format_path_value(path, value);
    let text = OwnedValue::try_from(Value::from(text.as_str()))
        .unwrap_or_else(|_| OwnedValue::from(0i64));
    HashMap::from([
        ("Value".to_string(), serde_to_owned_value(value)),
        ("Text".to_string(), text),
    ])
}

/// Announce a changed value the VeDbus way: `PropertiesChanged` on the item
/// object itself and `ItemsChanged` on the root, both carrying the same
/// entry. Emission failures are ignored; the local cache is authoritative.
pub(crate) async fn notify_change(
    conn: &zbus::Connection,
    root_path: &OwnedObjectPath,
    path: &str,
    value: &serde_json::Value,
) {
    let entry = change_entry(path, value);
    if let Ok(ctxt) = SignalEmitter::new(conn, path) {
        let _ = BusItem::properties_changed(&ctxt, entry.clone()).await;
    }
    if let Ok(ctxt) = SignalEmitter::new(conn, root_path.clone()) {
        let tree = HashMap::from([(path.to_string(), entry)]);
        let _ = super::root::RootBus::items_changed(&ctxt, tree).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_item(path: &str, writable: bool) -> (BusItem, mpsc::UnboundedReceiver<EngineCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let root = OwnedObjectPath::try_from("/").unwrap();
        let shared = Arc::new(Mutex::new(SharedState::new(tx, root)));
        {
            let mut s = shared.lock().unwrap();
            s.paths.insert(path.to_string(), serde_json::Value::Null);
            if writable {
                s.writable.insert(path.to_string());
            }
        }
        (BusItem::new(path.to_string(), shared), rx)
    }

    #[test]
    fn null_round_trips_as_empty_array() {
        let ov = serde_to_owned_value(&serde_json::Value::Null);
        assert_eq!(owned_value_to_serde(&ov), serde_json::Value::Null);
    }

    #[test]
    fn primitives_round_trip() {
        for v in [
            serde_json::json!(true),
            serde_json::json!(-5),
            serde_json::json!(5u64),
            serde_json::json!(12.25),
            serde_json::json!("VE.Direct"),
        ] {
            let ov = serde_to_owned_value(&v);
            assert_eq!(owned_value_to_serde(&ov), v);
        }
    }

    #[test]
    fn int_arrays_round_trip() {
        let v = serde_json::json!([0xA142, 0xB004]);
        let ov = serde_to_owned_value(&v);
        assert_eq!(owned_value_to_serde(&ov), v);
    }

    #[tokio::test]
    async fn relay_write_accepts_only_zero_and_one() {
        let (item, mut rx) = make_item("/Relay/0/State", true);

        let rc = item.set_value(OwnedValue::from(1i64)).await;
        assert_eq!(rc, 0);
        match rx.try_recv().unwrap() {
            EngineCommand::SetRelayState(v) => assert_eq!(v, serde_json::json!(1)),
        }

        let rc = item.set_value(OwnedValue::from(2i64)).await;
        assert_eq!(rc, 1);
        assert!(rx.try_recv().is_err());
        // The stored state keeps the last accepted write
        let shared = item.shared.lock().unwrap();
        assert_eq!(
            shared.paths.get("/Relay/0/State"),
            Some(&serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn read_only_paths_reject_writes() {
        let (item, mut rx) = make_item("/Dc/Battery/Soc", false);
        let rc = item.set_value(OwnedValue::from(50i64)).await;
        assert_eq!(rc, 1);
        assert!(rx.try_recv().is_err());
    }
}
