use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::{Connection, Result as ZbusResult, names::WellKnownName};

use crate::engine::EngineCommand;
use crate::error::{Result, SystemCalcError};
use crate::logging::get_logger;

use super::items::{BusItem, notify_change};
use super::root::{RootBus, TreeNode};
use super::shared::SharedState;

/// Well-known name of the published service
pub const SERVICE_NAME: &str = "com.victronenergy.system";

/// Output paths recomputed by the aggregation pipeline. Every tick assigns
/// all of them; paths whose inputs disappeared are explicitly nulled, never
/// left stale.
pub fn summed_paths() -> &'static [&'static str] {
    &[
        "/Ac/Grid/L1/Power",
        "/Ac/Grid/L2/Power",
        "/Ac/Grid/L3/Power",
        "/Ac/Grid/Total/Power",
        "/Ac/Grid/NumberOfPhases",
        "/Ac/Grid/ProductId",
        "/Ac/Grid/DeviceType",
        "/Ac/Genset/L1/Power",
        "/Ac/Genset/L2/Power",
        "/Ac/Genset/L3/Power",
        "/Ac/Genset/Total/Power",
        "/Ac/Genset/NumberOfPhases",
        "/Ac/Genset/ProductId",
        "/Ac/Genset/DeviceType",
        "/Ac/Consumption/L1/Power",
        "/Ac/Consumption/L2/Power",
        "/Ac/Consumption/L3/Power",
        "/Ac/Consumption/Total/Power",
        "/Ac/Consumption/NumberOfPhases",
        "/Ac/PvOnOutput/L1/Power",
        "/Ac/PvOnOutput/L2/Power",
        "/Ac/PvOnOutput/L3/Power",
        "/Ac/PvOnOutput/Total/Power",
        "/Ac/PvOnOutput/NumberOfPhases",
        "/Ac/PvOnGrid/L1/Power",
        "/Ac/PvOnGrid/L2/Power",
        "/Ac/PvOnGrid/L3/Power",
        "/Ac/PvOnGrid/Total/Power",
        "/Ac/PvOnGrid/NumberOfPhases",
        "/Ac/PvOnGenset/L1/Power",
        "/Ac/PvOnGenset/L2/Power",
        "/Ac/PvOnGenset/L3/Power",
        "/Ac/PvOnGenset/Total/Power",
        "/Ac/PvOnGenset/NumberOfPhases",
        "/Dc/Pv/Power",
        "/Dc/Pv/Current",
        "/Dc/Battery/Voltage",
        "/Dc/Battery/Current",
        "/Dc/Battery/Power",
        "/Dc/Battery/Soc",
        "/Dc/Battery/State",
        "/Dc/Battery/TimeToGo",
        "/Dc/Battery/ConsumedAmphours",
        "/Dc/Charger/Power",
        "/Dc/Vebus/Current",
        "/Dc/Vebus/Power",
        "/Dc/System/Power",
        "/Hub",
        "/Ac/ActiveIn/Source",
        "/VebusService",
    ]
}

/// Paths declared once at startup and maintained outside the per-tick sweep
fn static_paths() -> &'static [&'static str] {
    &[
        "/Serial",
        "/AvailableBatteryServices",
        "/AvailableBatteryMeasurements",
        "/AutoSelectedBatteryService",
        "/AutoSelectedBatteryMeasurement",
        "/ActiveBatteryService",
        "/PvInvertersProductIds",
        "/Dc/Battery/Alarms/CircuitBreakerTripped",
    ]
}

/// Object paths of the tree nodes above a leaf, outermost first:
/// `/Dc/Battery/Soc` yields `/Dc`, then `/Dc/Battery`.
fn node_paths(leaf: &str) -> impl Iterator<Item = &str> {
    leaf.char_indices()
        .skip(1)
        .filter(|(_, c)| *c == '/')
        .map(|(end, _)| &leaf[..end])
}

/// The local `com.victronenergy.system` service
pub struct SystemService {
    logger: crate::logging::StructuredLogger,
    connection: Option<Connection>,
    pub(crate) shared: Arc<Mutex<SharedState>>,
    exported: HashSet<String>,
    root_path: OwnedObjectPath,
}

impl SystemService {
    pub fn new(commands_tx: mpsc::UnboundedSender<EngineCommand>) -> Result<Self> {
        let logger = get_logger("dbus");
        let root_path = OwnedObjectPath::try_from("/")
            .map_err(|e| SystemCalcError::dbus(format!("Invalid object path: {}", e)))?;
        Ok(Self {
            logger,
            connection: None,
            shared: Arc::new(Mutex::new(SharedState::new(commands_tx, root_path.clone()))),
            exported: HashSet::new(),
            root_path,
        })
    }

    /// Connect the service to the bus: claim the well-known name and export
    /// the root object. Output paths are exported by `declare_paths`.
    pub async fn start(&mut self, connection: Connection) -> Result<()> {
        self.request_name(&connection)
            .await
            .map_err(|e| SystemCalcError::dbus(format!("RequestName failed: {}", e)))?;
        self.logger
            .info(&format!("D-Bus service started: {}", SERVICE_NAME));

        let root = RootBus {
            shared: Arc::clone(&self.shared),
        };
        connection
            .object_server()
            .at(&self.root_path, root)
            .await
            .map_err(|e| SystemCalcError::dbus(format!("Register root BusItem failed: {}", e)))?;
        self.connection = Some(connection.clone());
        {
            let mut shared = self.shared.lock().unwrap();
            shared.connection = Some(connection);
        }
        Ok(())
    }

    /// Declare the fixed output schema: mandatory service metadata, the
    /// selector/identity paths and every aggregated path. Works without a
    /// bus connection, in which case values are only tracked locally.
    pub async fn declare_paths(&mut self, device_instance: u32) -> Result<()> {
        let metadata: [(&str, serde_json::Value); 9] = [
            ("/Mgmt/ProcessName", serde_json::json!("systemcalc")),
            (
                "/Mgmt/ProcessVersion",
                serde_json::json!(env!("CARGO_PKG_VERSION")),
            ),
            (
                "/Mgmt/Connection",
                serde_json::json!("data from other dbus processes"),
            ),
            ("/DeviceInstance", serde_json::json!(device_instance)),
            ("/ProductId", serde_json::Value::Null),
            ("/ProductName", serde_json::Value::Null),
            ("/FirmwareVersion", serde_json::Value::Null),
            ("/HardwareVersion", serde_json::Value::Null),
            ("/Connected", serde_json::json!(1)),
        ];
        for (path, value) in metadata {
            self.declare(path, value, false).await?;
        }

        self.declare("/Relay/0/State", serde_json::Value::Null, true)
            .await?;
        for path in static_paths() {
            self.declare(path, serde_json::Value::Null, false).await?;
        }
        for path in summed_paths() {
            self.declare(path, serde_json::Value::Null, false).await?;
        }
        Ok(())
    }

    /// Read a published value from the local cache
    pub fn get(&self, path: &str) -> Option<serde_json::Value> {
        let shared = self.shared.lock().unwrap();
        shared.paths.get(path).cloned()
    }

    pub fn has_path(&self, path: &str) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.paths.contains_key(path)
    }

    /// Publish a value. Unchanged values are skipped, which keeps repeated
    /// aggregation runs signal-free.
    pub async fn publish(&mut self, path: &str, value: serde_json::Value) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.paths.get(path) == Some(&value) {
                return Ok(());
            }
            shared.paths.insert(path.to_string(), value.clone());
        }
        self.export_path(path).await?;
        if let Some(conn) = &self.connection {
            notify_change(conn, &self.root_path, path, &value).await;
        }
        Ok(())
    }

    /// Convenience to publish multiple paths
    pub async fn publish_many(
        &mut self,
        updates: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<()> {
        for (k, v) in updates {
            self.publish(&k, v).await?;
        }
        Ok(())
    }

    /// Retract a dynamically-declared path (service mappings of departed
    /// devices)
    pub async fn remove_path(&mut self, path: &str) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.paths.remove(path);
        }
        if self.exported.remove(path)
            && let Some(conn) = &self.connection
            && let Ok(obj_path) = OwnedObjectPath::try_from(path)
        {
            let _ = conn.object_server().remove::<BusItem, _>(&obj_path).await;
        }
    }

    /// Declare one path: seed its value and writability, then export it
    async fn declare(
        &mut self,
        path: &str,
        initial_value: serde_json::Value,
        writable: bool,
    ) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            shared
                .paths
                .entry(path.to_string())
                .or_insert(initial_value);
            if writable {
                shared.writable.insert(path.to_string());
            }
        }
        self.export_path(path).await
    }

    /// Export the object tree for a leaf path: TreeNode objects for the
    /// levels above it, a BusItem at the leaf itself. Idempotent, and a
    /// no-op while offline; `start` must have run for objects to appear.
    async fn export_path(&mut self, path: &str) -> Result<()> {
        let Some(conn) = self.connection.clone() else {
            return Ok(());
        };
        for node in node_paths(path) {
            if self.exported.insert(node.to_string()) {
                let tree = TreeNode::new(node.to_string(), Arc::clone(&self.shared));
                Self::serve(&conn, node, tree).await?;
            }
        }
        if self.exported.insert(path.to_string()) {
            let item = BusItem::new(path.to_string(), Arc::clone(&self.shared));
            Self::serve(&conn, path, item).await?;
        }
        Ok(())
    }

    /// Put one object on the bus
    async fn serve<I>(conn: &Connection, path: &str, object: I) -> Result<()>
    where
        I: zbus::object_server::Interface,
    {
        let obj_path = ObjectPath::try_from(path)
            .map_err(|e| SystemCalcError::dbus(format!("Bad object path {}: {}", path, e)))?;
        conn.object_server()
            .at(obj_path, object)
            .await
            .map_err(|e| SystemCalcError::dbus(format!("Exporting {} failed: {}", path, e)))?;
        Ok(())
    }

    async fn request_name(&self, connection: &Connection) -> ZbusResult<()> {
        use zbus::fdo::{DBusProxy, RequestNameFlags};
        let proxy = DBusProxy::new(connection).await?;
        let name = WellKnownName::try_from(SERVICE_NAME)?;
        let _ = proxy
            .request_name(name, RequestNameFlags::ReplaceExisting.into())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn offline_service() -> SystemService {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut svc = SystemService::new(tx).unwrap();
        svc.declare_paths(0).await.unwrap();
        svc
    }

    #[test]
    fn node_paths_walk_the_tree() {
        let nodes: Vec<&str> = node_paths("/Dc/Battery/Soc").collect();
        assert_eq!(nodes, vec!["/Dc", "/Dc/Battery"]);
        assert!(node_paths("/Serial").next().is_none());
    }

    #[tokio::test]
    async fn declare_paths_covers_schema() {
        let svc = offline_service().await;
        for path in summed_paths() {
            assert!(svc.has_path(path), "missing path: {}", path);
            assert_eq!(svc.get(path), Some(serde_json::Value::Null));
        }
        assert!(svc.has_path("/Relay/0/State"));
        assert!(svc.has_path("/Serial"));
        assert_eq!(svc.get("/Connected"), Some(serde_json::json!(1)));
        assert_eq!(
            svc.get("/Mgmt/Connection"),
            Some(serde_json::json!("data from other dbus processes"))
        );
    }

    #[tokio::test]
    async fn publish_and_remove_roundtrip() {
        let mut svc = offline_service().await;
        svc.publish("/Dc/Battery/Soc", serde_json::json!(55.5))
            .await
            .unwrap();
        assert_eq!(svc.get("/Dc/Battery/Soc"), Some(serde_json::json!(55.5)));

        svc.publish(
            "/ServiceMapping/com_victronenergy_battery_2",
            serde_json::json!("com.victronenergy.battery.ttyO2"),
        )
        .await
        .unwrap();
        assert!(svc.has_path("/ServiceMapping/com_victronenergy_battery_2"));
        svc.remove_path("/ServiceMapping/com_victronenergy_battery_2")
            .await;
        assert!(!svc.has_path("/ServiceMapping/com_victronenergy_battery_2"));
    }

    #[tokio::test]
    async fn only_relay_is_writable() {
        let svc = offline_service().await;
        let shared = svc.shared.lock().unwrap();
        assert_eq!(shared.writable.len(), 1);
        assert!(shared.writable.contains("/Relay/0/State"));
    }
}
