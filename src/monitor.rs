//! Mirror of remote device services
//!
//! The monitor keeps a local cache of every (service, path) pair declared in
//! the subscription schema, fed by the bus glue in [`bus`]. The engine only
//! ever reads this cache; it never performs a synchronous bus round-trip
//! during aggregation.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub mod bus;

/// Device service classification, derived from the third dotted segment of
/// the fully-qualified bus name (`com.victronenergy.battery.ttyO2` ->
/// `Battery`). Classes outside the subscription schema map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    SolarCharger,
    PvInverter,
    Battery,
    Vebus,
    Charger,
    Grid,
    Genset,
    Settings,
    Unknown,
}

impl ServiceKind {
    /// Classify a bare class string (`"battery"`, `"vebus"`, ...)
    pub fn from_class(class: &str) -> Self {
        match class {
            "solarcharger" => ServiceKind::SolarCharger,
            "pvinverter" => ServiceKind::PvInverter,
            "battery" => ServiceKind::Battery,
            "vebus" => ServiceKind::Vebus,
            "charger" => ServiceKind::Charger,
            "grid" => ServiceKind::Grid,
            "genset" => ServiceKind::Genset,
            "settings" => ServiceKind::Settings,
            _ => ServiceKind::Unknown,
        }
    }

    /// Classify a fully-qualified service name
    pub fn of_service(service: &str) -> Self {
        match service.split('.').nth(2) {
            Some(class) => Self::from_class(class),
            None => ServiceKind::Unknown,
        }
    }

    /// The class string as it appears in service names
    pub fn class(&self) -> &'static str {
        match self {
            ServiceKind::SolarCharger => "solarcharger",
            ServiceKind::PvInverter => "pvinverter",
            ServiceKind::Battery => "battery",
            ServiceKind::Vebus => "vebus",
            ServiceKind::Charger => "charger",
            ServiceKind::Grid => "grid",
            ServiceKind::Genset => "genset",
            ServiceKind::Settings => "settings",
            ServiceKind::Unknown => "",
        }
    }
}

/// Classes the monitor subscribes to
pub const SUBSCRIBED_KINDS: &[ServiceKind] = &[
    ServiceKind::SolarCharger,
    ServiceKind::PvInverter,
    ServiceKind::Battery,
    ServiceKind::Vebus,
    ServiceKind::Charger,
    ServiceKind::Grid,
    ServiceKind::Genset,
    ServiceKind::Settings,
];

/// The static subscription schema: paths of interest per service class.
pub fn subscribed_paths(kind: ServiceKind) -> &'static [&'static str] {
    match kind {
        ServiceKind::SolarCharger => &[
            "/Connected",
            "/ProductName",
            "/Mgmt/Connection",
            "/Dc/0/Voltage",
            "/Dc/0/Current",
        ],
        ServiceKind::PvInverter => &[
            "/Connected",
            "/ProductName",
            "/Mgmt/Connection",
            "/Ac/L1/Power",
            "/Ac/L2/Power",
            "/Ac/L3/Power",
            "/Position",
            "/ProductId",
        ],
        ServiceKind::Battery => &[
            "/Connected",
            "/ProductName",
            "/Mgmt/Connection",
            "/Dc/0/Voltage",
            "/Dc/0/Current",
            "/Dc/0/Power",
            "/Soc",
            "/TimeToGo",
            "/ConsumedAmphours",
            "/ProductId",
        ],
        ServiceKind::Vebus => &[
            "/Ac/ActiveIn/ActiveInput",
            "/Ac/ActiveIn/L1/P",
            "/Ac/ActiveIn/L2/P",
            "/Ac/ActiveIn/L3/P",
            "/Ac/Out/L1/P",
            "/Ac/Out/L2/P",
            "/Ac/Out/L3/P",
            "/Connected",
            "/Hub4/AcPowerSetpoint",
            "/ProductId",
            "/ProductName",
            "/Mgmt/Connection",
            "/Mode",
            "/State",
            "/Dc/0/Voltage",
            "/Dc/0/Current",
            "/Dc/0/Power",
            "/Soc",
        ],
        ServiceKind::Charger => &[
            "/Connected",
            "/ProductName",
            "/Mgmt/Connection",
            "/Dc/0/Voltage",
            "/Dc/0/Current",
        ],
        ServiceKind::Grid | ServiceKind::Genset => &[
            "/Connected",
            "/ProductName",
            "/Mgmt/Connection",
            "/ProductId",
            "/DeviceType",
            "/Ac/L1/Power",
            "/Ac/L2/Power",
            "/Ac/L3/Power",
        ],
        ServiceKind::Settings => &[
            "/Settings/SystemSetup/AcInput1",
            "/Settings/SystemSetup/AcInput2",
            "/Settings/SystemSetup/BatteryService",
            "/Settings/SystemSetup/HasDcSystem",
            "/Settings/SystemSetup/WriteVebusSoc",
        ],
        ServiceKind::Unknown => &[],
    }
}

/// Events delivered from the bus glue to the engine loop
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A service of a subscribed class appeared; carries its initial values
    ServiceAdded {
        service: String,
        instance: u32,
        values: HashMap<String, Value>,
    },
    /// The owner of a mirrored service disappeared from the bus
    ServiceRemoved { service: String },
    /// A mirrored path changed value
    ValueChanged {
        service: String,
        path: String,
        value: Value,
    },
}

/// One mirrored service
#[derive(Debug, Clone, Default)]
pub struct ServiceEntry {
    pub instance: u32,
    values: HashMap<String, Value>,
}

/// Local cache of the last-known values of all mirrored services.
///
/// Keyed by fully-qualified name in a `BTreeMap` so iteration order is the
/// lexicographic name order; the battery auto-selection and the published
/// snapshots rely on that determinism.
#[derive(Debug, Default)]
pub struct Monitor {
    services: BTreeMap<String, ServiceEntry>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service and its initial values
    pub fn add_service(&mut self, service: &str, instance: u32, values: HashMap<String, Value>) {
        self.services
            .insert(service.to_string(), ServiceEntry { instance, values });
    }

    /// Drop a service from the mirror. Returns whether it was present.
    pub fn remove_service(&mut self, service: &str) -> bool {
        self.services.remove(service).is_some()
    }

    /// Update a single mirrored value. Returns false for unknown services.
    pub fn set_value(&mut self, service: &str, path: &str, value: Value) -> bool {
        match self.services.get_mut(service) {
            Some(entry) => {
                entry.values.insert(path.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn instance_of(&self, service: &str) -> Option<u32> {
        self.services.get(service).map(|e| e.instance)
    }

    /// Last-known value of a mirrored path; `Null` when the service or path
    /// was never observed.
    pub fn get_value(&self, service: &str, path: &str) -> Value {
        self.services
            .get(service)
            .and_then(|e| e.values.get(path))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Numeric view of a mirrored value (integers widen to f64)
    pub fn get_f64(&self, service: &str, path: &str) -> Option<f64> {
        self.services
            .get(service)
            .and_then(|e| e.values.get(path))
            .and_then(Value::as_f64)
    }

    /// Point-in-time snapshot of known services, optionally filtered by
    /// class. Callers must tolerate services disappearing afterwards.
    pub fn service_list(&self, filter: Option<ServiceKind>) -> BTreeMap<String, u32> {
        self.services
            .iter()
            .filter(|(name, _)| filter.is_none_or(|kind| ServiceKind::of_service(name) == kind))
            .map(|(name, entry)| (name.clone(), entry.instance))
            .collect()
    }

    /// The connected-service predicate: a vebus counts as connected when its
    /// `/State` is published (mk2dbus never implements `/Connected`), every
    /// other class when `/Connected == 1`. Both additionally require
    /// `/ProductName` and `/Mgmt/Connection`.
    pub fn is_connected(&self, service: &str) -> bool {
        let present = match ServiceKind::of_service(service) {
            ServiceKind::Vebus => !self.get_value(service, "/State").is_null(),
            _ => self.get_f64(service, "/Connected") == Some(1.0),
        };
        present
            && !self.get_value(service, "/ProductName").is_null()
            && !self.get_value(service, "/Mgmt/Connection").is_null()
    }

    /// Snapshot of connected services, optionally filtered by class
    pub fn connected_services(&self, filter: Option<ServiceKind>) -> BTreeMap<String, u32> {
        let mut services = self.service_list(filter);
        services.retain(|name, _| self.is_connected(name));
        services
    }

    /// First (name-ordered) connected service of a class
    pub fn first_connected(&self, kind: ServiceKind) -> Option<(String, u32)> {
        self.connected_services(Some(kind)).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected_values(extra: &[(&str, Value)]) -> HashMap<String, Value> {
        let mut values: HashMap<String, Value> = HashMap::new();
        values.insert("/Connected".to_string(), json!(1));
        values.insert("/ProductName".to_string(), json!("product"));
        values.insert("/Mgmt/Connection".to_string(), json!("VE.Direct"));
        for (k, v) in extra {
            values.insert((*k).to_string(), v.clone());
        }
        values
    }

    #[test]
    fn service_kind_from_name() {
        assert_eq!(
            ServiceKind::of_service("com.victronenergy.battery.ttyO2"),
            ServiceKind::Battery
        );
        assert_eq!(
            ServiceKind::of_service("com.victronenergy.vebus.ttyO1"),
            ServiceKind::Vebus
        );
        assert_eq!(
            ServiceKind::of_service("com.victronenergy.fridge.ttyUSB0"),
            ServiceKind::Unknown
        );
        assert_eq!(ServiceKind::of_service("org.freedesktop"), ServiceKind::Unknown);
    }

    #[test]
    fn unknown_class_has_no_subscription() {
        assert!(subscribed_paths(ServiceKind::Unknown).is_empty());
        for kind in SUBSCRIBED_KINDS {
            assert!(!subscribed_paths(*kind).is_empty());
        }
    }

    #[test]
    fn service_list_filters_by_class() {
        let mut monitor = Monitor::new();
        monitor.add_service("com.victronenergy.battery.ttyO2", 2, HashMap::new());
        monitor.add_service("com.victronenergy.solarcharger.ttyO1", 0, HashMap::new());

        let all = monitor.service_list(None);
        assert_eq!(all.len(), 2);

        let batteries = monitor.service_list(Some(ServiceKind::Battery));
        assert_eq!(batteries.len(), 1);
        assert_eq!(batteries.get("com.victronenergy.battery.ttyO2"), Some(&2));
    }

    #[test]
    fn connected_predicate_for_vebus_uses_state() {
        let mut monitor = Monitor::new();
        let mut values = connected_values(&[]);
        values.remove("/Connected");
        monitor.add_service("com.victronenergy.vebus.ttyO1", 0, values);
        // No /State yet: not connected
        assert!(!monitor.is_connected("com.victronenergy.vebus.ttyO1"));

        monitor.set_value("com.victronenergy.vebus.ttyO1", "/State", json!(3));
        assert!(monitor.is_connected("com.victronenergy.vebus.ttyO1"));
    }

    #[test]
    fn connected_predicate_requires_identity_paths() {
        let mut monitor = Monitor::new();
        let mut values = connected_values(&[]);
        values.remove("/ProductName");
        monitor.add_service("com.victronenergy.battery.ttyO2", 2, values);
        assert!(!monitor.is_connected("com.victronenergy.battery.ttyO2"));

        monitor.set_value("com.victronenergy.battery.ttyO2", "/ProductName", json!("BMV"));
        assert!(monitor.is_connected("com.victronenergy.battery.ttyO2"));

        monitor.set_value("com.victronenergy.battery.ttyO2", "/Connected", json!(0));
        assert!(!monitor.is_connected("com.victronenergy.battery.ttyO2"));
    }

    #[test]
    fn first_connected_is_name_ordered() {
        let mut monitor = Monitor::new();
        monitor.add_service("com.victronenergy.battery.ttyO9", 9, connected_values(&[]));
        monitor.add_service("com.victronenergy.battery.ttyO2", 2, connected_values(&[]));
        let (name, instance) = monitor.first_connected(ServiceKind::Battery).unwrap();
        assert_eq!(name, "com.victronenergy.battery.ttyO2");
        assert_eq!(instance, 2);
    }

    #[test]
    fn get_value_null_for_unknown() {
        let monitor = Monitor::new();
        assert!(monitor.get_value("com.victronenergy.battery.ttyO2", "/Soc").is_null());
        assert_eq!(monitor.get_f64("com.victronenergy.battery.ttyO2", "/Soc"), None);
    }

    #[test]
    fn removed_service_disappears_from_lists() {
        let mut monitor = Monitor::new();
        monitor.add_service("com.victronenergy.grid.cgwacs", 30, connected_values(&[]));
        assert!(monitor.remove_service("com.victronenergy.grid.cgwacs"));
        assert!(!monitor.remove_service("com.victronenergy.grid.cgwacs"));
        assert!(monitor.service_list(None).is_empty());
    }
}
