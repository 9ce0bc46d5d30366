use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedValue, Value};

use super::fmt::format_path_value;
use super::items::serde_to_owned_value;
use super::shared::SharedState;

fn collect_subtree(
    shared: &Arc<Mutex<SharedState>>,
    prefix: &str,
    as_text: bool,
) -> HashMap<String, OwnedValue> {
    let shared = shared.lock().unwrap();
    let mut px = prefix.to_string();
    if !px.ends_with('/') {
        px.push('/');
    }
    let mut result: HashMap<String, OwnedValue> = HashMap::new();
    for (path, val) in shared.paths.iter() {
        if let Some(suffix) = path.strip_prefix(&px) {
            let ov = if as_text {
                let text = format_path_value(path, val);
                OwnedValue::try_from(Value::from(text.as_str()))
                    .unwrap_or_else(|_| OwnedValue::from(0i64))
            } else {
                serde_to_owned_value(val)
            };
            result.insert(suffix.to_string(), ov);
        }
    }
    result
}

/// The root object: whole-tree reads and the aggregated change signal
pub struct RootBus {
    pub(crate) shared: Arc<Mutex<SharedState>>,
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl RootBus {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree(&self.shared, "/", false))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree(&self.shared, "/", true))
    }

    #[zbus(name = "GetItems")]
    async fn get_items(&self) -> HashMap<String, HashMap<String, OwnedValue>> {
        let shared = self.shared.lock().unwrap();
        shared
            .paths
            .iter()
            .map(|(path, val)| (path.clone(), super::items::change_entry(path, val)))
            .collect()
    }

    #[zbus(signal)]
    pub async fn items_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<String, HashMap<String, OwnedValue>>,
    ) -> zbus::Result<()>;
}

/// Intermediate tree nodes (e.g. `/Dc/Battery`) serving subtree reads
pub struct TreeNode {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<SharedState>>,
}

impl TreeNode {
    pub fn new(path: String, shared: Arc<Mutex<SharedState>>) -> Self {
        Self { path, shared }
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl TreeNode {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree(&self.shared, &self.path, false))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree(&self.shared, &self.path, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use zbus::zvariant::OwnedObjectPath;

    fn make_shared_with_paths(paths: &[(&str, serde_json::Value)]) -> Arc<Mutex<SharedState>> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let root = OwnedObjectPath::try_from("/").unwrap();
        let shared = Arc::new(Mutex::new(SharedState::new(tx, root)));
        {
            let mut s = shared.lock().unwrap();
            for (k, v) in paths {
                s.paths.insert((*k).to_string(), v.clone());
            }
        }
        shared
    }

    #[test]
    fn collect_subtree_filters_by_prefix() {
        let shared = make_shared_with_paths(&[
            ("/Dc/Battery/Voltage", serde_json::json!(12.15)),
            ("/Dc/Battery/Soc", serde_json::json!(15.3)),
            ("/Hub", serde_json::json!(1)),
        ]);

        let map = collect_subtree(&shared, "/Dc/Battery", false);
        assert!(map.contains_key("Voltage"));
        assert!(map.contains_key("Soc"));
        assert!(!map.contains_key("Hub"));

        let text = collect_subtree(&shared, "/Dc/Battery", true);
        assert!(text.contains_key("Voltage"));
    }

    #[tokio::test]
    async fn get_items_includes_text_fields() {
        let shared = make_shared_with_paths(&[
            ("/Ac/Grid/L1/Power", serde_json::json!(800.0)),
            ("/Dc/Battery/State", serde_json::json!(1)),
        ]);
        let root = RootBus { shared };
        let items = root.get_items().await;
        let p = items.get("/Ac/Grid/L1/Power").unwrap();
        assert!(p.get("Value").is_some());
        assert!(p.get("Text").is_some());
    }
}
