//! Typed view of the system-setup settings
//!
//! The persistent settings live in the `com.victronenergy.settings` service,
//! which the monitor mirrors like any other service. This adapter applies
//! defaults for unset keys and detects changes so the engine can re-run the
//! battery selection when the user picks another source.

use serde_json::Value;

use crate::monitor::ServiceKind;

pub const BATSERVICE_DEFAULT: &str = "default";
pub const BATSERVICE_NOBATTERY: &str = "nobattery";

const PATH_BATTERY_SERVICE: &str = "/Settings/SystemSetup/BatteryService";
const PATH_HAS_DC_SYSTEM: &str = "/Settings/SystemSetup/HasDcSystem";
const PATH_WRITE_VEBUS_SOC: &str = "/Settings/SystemSetup/WriteVebusSoc";

/// Current values of the settings keys the engine consumes
#[derive(Debug, Clone)]
pub struct Settings {
    battery_service: String,
    has_dc_system: bool,
    write_vebus_soc: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            battery_service: BATSERVICE_DEFAULT.to_string(),
            has_dc_system: false,
            write_vebus_soc: false,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw battery-service selection (`"default"`, `"nobattery"` or a
    /// pinned `class/instance`)
    pub fn battery_service(&self) -> &str {
        &self.battery_service
    }

    /// Whether unmonitored DC loads/sources are present
    pub fn has_dc_system(&self) -> bool {
        self.has_dc_system
    }

    /// Whether the selected SoC is mirrored into the inverter/charger
    pub fn write_vebus_soc(&self) -> bool {
        self.write_vebus_soc
    }

    /// Whether a mirrored path belongs to this adapter
    pub fn owns_path(path: &str) -> bool {
        matches!(
            path,
            PATH_BATTERY_SERVICE | PATH_HAS_DC_SYSTEM | PATH_WRITE_VEBUS_SOC
        )
    }

    /// Apply a mirrored settings value. Unset (null) keys fall back to their
    /// defaults. Returns true when a known key changed value.
    pub fn apply(&mut self, path: &str, value: &Value) -> bool {
        match path {
            PATH_BATTERY_SERVICE => {
                let new = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| BATSERVICE_DEFAULT.to_string());
                if new != self.battery_service {
                    self.battery_service = new;
                    return true;
                }
                false
            }
            PATH_HAS_DC_SYSTEM => {
                let new = value.as_f64() == Some(1.0);
                if new != self.has_dc_system {
                    self.has_dc_system = new;
                    return true;
                }
                false
            }
            PATH_WRITE_VEBUS_SOC => {
                let new = value.as_f64() == Some(1.0);
                if new != self.write_vebus_soc {
                    self.write_vebus_soc = new;
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

/// Parsed battery-service selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatterySetting {
    /// Automatic selection
    Default,
    /// Explicitly no battery monitor
    NoBattery,
    /// User-pinned service class and device instance
    Pinned { kind: ServiceKind, instance: u32 },
}

impl BatterySetting {
    /// Parse the setting string. Pinned selections accept both the short
    /// class form (`battery/2`) and the fully-qualified one
    /// (`com.victronenergy.battery/2`). Returns None for structurally
    /// invalid values; the caller treats those as `Default`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            BATSERVICE_DEFAULT => return Some(BatterySetting::Default),
            BATSERVICE_NOBATTERY => return Some(BatterySetting::NoBattery),
            _ => {}
        }
        let (class_part, instance_part) = value.split_once('/')?;
        if instance_part.contains('/') {
            return None;
        }
        let instance: u32 = instance_part.parse().ok()?;
        let kind = if class_part.contains('.') {
            ServiceKind::of_service(class_part)
        } else {
            ServiceKind::from_class(class_part)
        };
        Some(BatterySetting::Pinned { kind, instance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let s = Settings::new();
        assert_eq!(s.battery_service(), "default");
        assert!(!s.has_dc_system());
        assert!(!s.write_vebus_soc());
    }

    #[test]
    fn apply_detects_changes() {
        let mut s = Settings::new();
        assert!(s.apply("/Settings/SystemSetup/BatteryService", &json!("battery/2")));
        assert!(!s.apply("/Settings/SystemSetup/BatteryService", &json!("battery/2")));
        assert_eq!(s.battery_service(), "battery/2");

        assert!(s.apply("/Settings/SystemSetup/HasDcSystem", &json!(1)));
        assert!(s.has_dc_system());
        assert!(s.apply("/Settings/SystemSetup/HasDcSystem", &json!(0)));
        assert!(!s.has_dc_system());

        // Unknown paths are ignored
        assert!(!s.apply("/Settings/SystemSetup/AcInput1", &json!(1)));
    }

    #[test]
    fn apply_null_restores_default() {
        let mut s = Settings::new();
        s.apply("/Settings/SystemSetup/BatteryService", &json!("nobattery"));
        assert!(s.apply("/Settings/SystemSetup/BatteryService", &Value::Null));
        assert_eq!(s.battery_service(), "default");
    }

    #[test]
    fn parse_sentinels() {
        assert_eq!(BatterySetting::parse("default"), Some(BatterySetting::Default));
        assert_eq!(
            BatterySetting::parse("nobattery"),
            Some(BatterySetting::NoBattery)
        );
    }

    #[test]
    fn parse_pinned_short_and_qualified() {
        assert_eq!(
            BatterySetting::parse("battery/2"),
            Some(BatterySetting::Pinned {
                kind: ServiceKind::Battery,
                instance: 2
            })
        );
        assert_eq!(
            BatterySetting::parse("com.victronenergy.vebus/261"),
            Some(BatterySetting::Pinned {
                kind: ServiceKind::Vebus,
                instance: 261
            })
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(BatterySetting::parse(""), None);
        assert_eq!(BatterySetting::parse("battery"), None);
        assert_eq!(BatterySetting::parse("battery/"), None);
        assert_eq!(BatterySetting::parse("battery/x"), None);
        assert_eq!(BatterySetting::parse("battery/2/extra"), None);
    }
}
