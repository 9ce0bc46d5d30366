//! The periodic recomputation pipeline
//!
//! Builds a fresh map of every derived output from the mirror and the
//! settings, then writes it through the published service. Absence of data
//! is null at every layer: `safe_add`/`safe_max` propagate null exactly, so
//! "unknown" never degrades into a fabricated zero.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::dbus::summed_paths;
use crate::monitor::ServiceKind;

const SETTINGS_SERVICE: &str = "com.victronenergy.settings";

const STATE_IDLE: i64 = 0;
const STATE_CHARGING: i64 = 1;
const STATE_DISCHARGING: i64 = 2;

/// Sum the non-null values; null iff all are null
fn safe_add(values: &[Option<f64>]) -> Option<f64> {
    values
        .iter()
        .flatten()
        .copied()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// Null if either side is null, else the maximum
fn safe_max(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

fn num(v: Option<f64>) -> Value {
    match v {
        Some(x) => serde_json::json!(x),
        None => Value::Null,
    }
}

fn map_f64(map: &BTreeMap<String, Value>, path: &str) -> Option<f64> {
    map.get(path).and_then(Value::as_f64)
}

/// For a prefix `X`, derive `X/Total/Power` and `X/NumberOfPhases`: the
/// null-propagating sum and the highest phase carrying data.
fn compute_phase_totals(prefix: &str, newvalues: &mut BTreeMap<String, Value>) {
    let mut total_power: Option<f64> = None;
    let mut number_of_phases: Option<i64> = None;
    for phase in 1..=3 {
        let p = map_f64(newvalues, &format!("{}/L{}/Power", prefix, phase));
        total_power = safe_add(&[total_power, p]);
        if p.is_some() {
            number_of_phases = Some(phase);
        }
    }
    newvalues.insert(format!("{}/Total/Power", prefix), num(total_power));
    newvalues.insert(
        format!("{}/NumberOfPhases", prefix),
        number_of_phases.map(|n| serde_json::json!(n)).unwrap_or(Value::Null),
    );
}

impl super::SystemCalc {
    /// Recompute all derived outputs and write them through. Every summed
    /// path is assigned; paths whose inputs disappeared become null.
    pub(crate) async fn update_values(&mut self) {
        let (newvalues, multi) = self.compute_values();

        self.check_lg_battery(multi.as_deref()).await;

        for path in summed_paths() {
            let value = newvalues.get(*path).cloned().unwrap_or(Value::Null);
            self.publish(path, value).await;
        }
    }

    /// Pure derivation of the output snapshot from the mirror and settings.
    /// Returns the new values plus the primary inverter/charger, which the
    /// LG detector needs afterwards.
    pub(crate) fn compute_values(&self) -> (BTreeMap<String, Value>, Option<String>) {
        let monitor = &self.monitor;
        let mut newvalues: BTreeMap<String, Value> = BTreeMap::new();

        // Summed DC power of all inverter/chargers, used in the DC
        // bookkeeping below. Not per-device: currents of multis on different
        // DC voltages must never be added, powers may.
        let mut vebuspower = 0.0;
        for vebus in monitor.service_list(Some(ServiceKind::Vebus)).keys() {
            if let (Some(v), Some(i)) = (
                monitor.get_f64(vebus, "/Dc/0/Voltage"),
                monitor.get_f64(vebus, "/Dc/0/Current"),
            ) {
                vebuspower += v * i;
            }
        }

        // PV inverters, accumulated per position and phase
        for pvinverter in monitor.service_list(Some(ServiceKind::PvInverter)).keys() {
            // Position reads null when the service has just been removed
            // after the service list was taken.
            let prefix = match monitor.get_f64(pvinverter, "/Position") {
                Some(p) if p == 0.0 => "/Ac/PvOnGrid",
                Some(p) if p == 1.0 => "/Ac/PvOnOutput",
                Some(p) if p == 2.0 => "/Ac/PvOnGenset",
                _ => continue,
            };
            for phase in 1..=3 {
                if let Some(power) = monitor.get_f64(pvinverter, &format!("/Ac/L{}/Power", phase))
                {
                    let path = format!("{}/L{}/Power", prefix, phase);
                    let sum = safe_add(&[map_f64(&newvalues, &path), Some(power)]);
                    newvalues.insert(path, num(sum));
                }
            }
        }
        for prefix in ["/Ac/PvOnGrid", "/Ac/PvOnOutput", "/Ac/PvOnGenset"] {
            compute_phase_totals(prefix, &mut newvalues);
        }

        // Solar chargers
        let mut solar_voltage: Option<f64> = None;
        let mut solar_power: Option<f64> = None;
        let mut solar_current: Option<f64> = None;
        for solarcharger in monitor.service_list(Some(ServiceKind::SolarCharger)).keys() {
            let Some(v) = monitor.get_f64(solarcharger, "/Dc/0/Voltage") else {
                continue;
            };
            let Some(i) = monitor.get_f64(solarcharger, "/Dc/0/Current") else {
                continue;
            };
            if solar_power.is_none() {
                solar_voltage = Some(v);
            }
            solar_power = safe_add(&[solar_power, Some(v * i)]);
            solar_current = safe_add(&[solar_current, Some(i)]);
        }
        if let Some(p) = solar_power {
            newvalues.insert("/Dc/Pv/Power".to_string(), num(Some(p)));
            newvalues.insert("/Dc/Pv/Current".to_string(), num(solar_current));
        }

        // Other DC chargers; the battery on output 0 is taken as the main one
        let mut charger_voltage: Option<f64> = None;
        let mut charger_power: Option<f64> = None;
        for charger in monitor.service_list(Some(ServiceKind::Charger)).keys() {
            let Some(v) = monitor.get_f64(charger, "/Dc/0/Voltage") else {
                continue;
            };
            charger_voltage = Some(v);
            let Some(i) = monitor.get_f64(charger, "/Dc/0/Current") else {
                continue;
            };
            charger_power = safe_add(&[charger_power, Some(v * i)]);
        }
        if let Some(p) = charger_power {
            newvalues.insert("/Dc/Charger/Power".to_string(), num(Some(p)));
        }

        // Battery outputs
        let mut battery_kind: Option<ServiceKind> = None;
        if let Some(battery) = &self.battery_service {
            let kind = ServiceKind::of_service(battery);
            battery_kind = Some(kind);
            newvalues.insert(
                "/Dc/Battery/Soc".to_string(),
                monitor.get_value(battery, "/Soc"),
            );
            newvalues.insert(
                "/Dc/Battery/TimeToGo".to_string(),
                monitor.get_value(battery, "/TimeToGo"),
            );
            newvalues.insert(
                "/Dc/Battery/ConsumedAmphours".to_string(),
                monitor.get_value(battery, "/ConsumedAmphours"),
            );

            match kind {
                ServiceKind::Battery => {
                    newvalues.insert(
                        "/Dc/Battery/Voltage".to_string(),
                        monitor.get_value(battery, "/Dc/0/Voltage"),
                    );
                    newvalues.insert(
                        "/Dc/Battery/Current".to_string(),
                        monitor.get_value(battery, "/Dc/0/Current"),
                    );
                    newvalues.insert(
                        "/Dc/Battery/Power".to_string(),
                        monitor.get_value(battery, "/Dc/0/Power"),
                    );
                }
                ServiceKind::Vebus => {
                    let v = monitor.get_f64(battery, "/Dc/0/Voltage");
                    let i = monitor.get_f64(battery, "/Dc/0/Current");
                    newvalues.insert("/Dc/Battery/Voltage".to_string(), num(v));
                    newvalues.insert("/Dc/Battery/Current".to_string(), num(i));
                    if let (Some(v), Some(i)) = (v, i) {
                        newvalues.insert("/Dc/Battery/Power".to_string(), num(Some(v * i)));
                    }
                }
                _ => {}
            }

            if let Some(p) = map_f64(&newvalues, "/Dc/Battery/Power") {
                let state = if p > 30.0 {
                    STATE_CHARGING
                } else if p < -30.0 {
                    STATE_DISCHARGING
                } else {
                    STATE_IDLE
                };
                newvalues.insert("/Dc/Battery/State".to_string(), serde_json::json!(state));
            }
        } else {
            // No battery monitor: best-effort voltage from the DC sources.
            // With several multis the last one iterated wins.
            let mut voltage = solar_voltage.or(charger_voltage);
            if voltage.is_none() {
                for vebus in monitor.service_list(Some(ServiceKind::Vebus)).keys() {
                    if let Some(v) = monitor.get_f64(vebus, "/Dc/0/Voltage") {
                        voltage = Some(v);
                    }
                }
            }
            if let Some(v) = voltage {
                newvalues.insert("/Dc/Battery/Voltage".to_string(), num(Some(v)));
            }

            if !self.settings.has_dc_system() && voltage.is_some() {
                // Every DC source is accounted for, so the battery flow is
                // the sum of all of them.
                debug_assert!(!newvalues.contains_key("/Dc/Battery/Power"));
                debug_assert!(!newvalues.contains_key("/Dc/Battery/Current"));
                let p = map_f64(&newvalues, "/Dc/Pv/Power").unwrap_or(0.0)
                    + map_f64(&newvalues, "/Dc/Charger/Power").unwrap_or(0.0)
                    + vebuspower;
                let v = voltage.unwrap_or(0.0);
                let current = if v > 0.0 { Some(p / v) } else { None };
                newvalues.insert("/Dc/Battery/Current".to_string(), num(current));
                newvalues.insert("/Dc/Battery/Power".to_string(), num(Some(p)));
            }
        }

        // Power of the unmeasured DC loads/sources:
        // battery = solarcharger + charger + ve.bus - system
        if self.settings.has_dc_system() && battery_kind == Some(ServiceKind::Battery) {
            if let Some(battery_power) = map_f64(&newvalues, "/Dc/Battery/Power") {
                let system = map_f64(&newvalues, "/Dc/Pv/Power").unwrap_or(0.0)
                    + map_f64(&newvalues, "/Dc/Charger/Power").unwrap_or(0.0)
                    + vebuspower
                    - battery_power;
                newvalues.insert("/Dc/System/Power".to_string(), num(Some(system)));
            }
        }

        // The primary inverter/charger
        let multi = monitor
            .first_connected(ServiceKind::Vebus)
            .map(|(name, _)| name);
        if let Some(multi) = &multi {
            let dc_current = monitor.get_f64(multi, "/Dc/0/Current");
            newvalues.insert("/Dc/Vebus/Current".to_string(), num(dc_current));
            let mut dc_power = monitor.get_f64(multi, "/Dc/0/Power");
            // Fall back to V*I when /Dc/0/Power is not published
            if dc_power.is_none()
                && let Some(i) = dc_current
                && let Some(v) = monitor.get_f64(multi, "/Dc/0/Voltage")
            {
                dc_power = Some(v * i);
            }
            newvalues.insert("/Dc/Vebus/Power".to_string(), num(dc_power));
        }
        newvalues.insert(
            "/VebusService".to_string(),
            multi
                .as_ref()
                .map(|m| Value::String(m.clone()))
                .unwrap_or(Value::Null),
        );

        // Which AC source the multi's active input is wired to
        let mut ac_in_source: Option<f64> = None;
        if let Some(multi) = &multi
            && let Some(active_input) = monitor.get_f64(multi, "/Ac/ActiveIn/ActiveInput")
        {
            let settings_path =
                format!("/Settings/SystemSetup/AcInput{}", active_input as i64 + 1);
            ac_in_source = monitor.get_f64(SETTINGS_SERVICE, &settings_path);
        }
        newvalues.insert("/Ac/ActiveIn/Source".to_string(), num(ac_in_source));

        // Hub mode, first match wins
        let hub: Option<i64> = if multi
            .as_ref()
            .is_some_and(|m| !monitor.get_value(m, "/Hub4/AcPowerSetpoint").is_null())
        {
            Some(4)
        } else if map_f64(&newvalues, "/Dc/Pv/Power").is_some() {
            Some(1)
        } else if map_f64(&newvalues, "/Ac/PvOnOutput/Total/Power").is_some() {
            Some(2)
        } else if map_f64(&newvalues, "/Ac/PvOnGrid/Total/Power").is_some()
            || map_f64(&newvalues, "/Ac/PvOnGenset/Total/Power").is_some()
        {
            Some(3)
        } else {
            None
        };
        newvalues.insert(
            "/Hub".to_string(),
            hub.map(|h| serde_json::json!(h)).unwrap_or(Value::Null),
        );

        // Grid/genset meters and consumption
        let phases = ["L1", "L2", "L3"];
        let mut consumption: [Option<f64>; 3] = [None, None, None];
        for (role, kind) in [("Grid", ServiceKind::Grid), ("Genset", ServiceKind::Genset)] {
            let em = monitor.first_connected(kind).map(|(name, _)| name);
            // A meter service indicates a dedicated energy meter; without
            // one, the multi's active input is the best available reading.
            let mut uses_active_input = false;
            if multi.is_some()
                && let Some(source) = ac_in_source
            {
                uses_active_input = source > 0.0 && ((source == 2.0) == (role == "Genset"));
            }
            for (idx, phase) in phases.iter().enumerate() {
                let pvpower = map_f64(&newvalues, &format!("/Ac/PvOn{}/{}/Power", role, phase));
                let p: Option<f64>;
                if let Some(em) = &em {
                    p = monitor.get_f64(em, &format!("/Ac/{}/Power", phase));
                    // Consumption between the meter and the multi, plus any
                    // PV inverter feeding the same input. PV on the inactive
                    // input still counts: a load there may consume it, or it
                    // is fed back through the meter.
                    let mut c: Option<f64> = None;
                    if uses_active_input
                        && let Some(m) = &multi
                        && let Some(ac_in) =
                            monitor.get_f64(m, &format!("/Ac/ActiveIn/{}/P", phase))
                    {
                        c = safe_add(&[c, Some(-ac_in)]);
                    }
                    c = safe_add(&[c, p, pvpower]);
                    consumption[idx] = safe_add(&[consumption[idx], safe_max(Some(0.0), c)]);
                } else {
                    let mut direct: Option<f64> = None;
                    if uses_active_input
                        && let Some(m) = &multi
                    {
                        direct = monitor.get_f64(m, &format!("/Ac/ActiveIn/{}/P", phase));
                    }
                    // No meter: assume no load between the source and the
                    // multi, minus whatever a PV inverter feeds in between.
                    if let Some(pv) = pvpower {
                        direct = safe_add(&[direct, Some(-pv)]);
                    }
                    p = direct;
                }
                newvalues.insert(format!("/Ac/{}/{}/Power", role, phase), num(p));
            }
            compute_phase_totals(&format!("/Ac/{}", role), &mut newvalues);

            let mut product_id = em
                .as_ref()
                .and_then(|em| monitor.get_f64(em, "/ProductId"));
            let device_type = em
                .as_ref()
                .and_then(|em| monitor.get_f64(em, "/DeviceType"));
            if product_id.is_none()
                && uses_active_input
                && let Some(multi) = &multi
            {
                product_id = monitor.get_f64(multi, "/ProductId");
            }
            newvalues.insert(format!("/Ac/{}/ProductId", role), num(product_id));
            newvalues.insert(format!("/Ac/{}/DeviceType", role), num(device_type));
        }

        // Consumption on the inverter output, clamped at zero per phase
        for (idx, phase) in phases.iter().enumerate() {
            let mut c = map_f64(&newvalues, &format!("/Ac/PvOnOutput/{}/Power", phase));
            if let Some(multi) = &multi {
                let ac_out = monitor.get_f64(multi, &format!("/Ac/Out/{}/P", phase));
                c = safe_add(&[c, ac_out]);
            }
            newvalues.insert(
                format!("/Ac/Consumption/{}/Power", phase),
                num(safe_add(&[consumption[idx], safe_max(Some(0.0), c)])),
            );
        }
        compute_phase_totals("/Ac/Consumption", &mut newvalues);

        (newvalues, multi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_add_propagates_null() {
        assert_eq!(safe_add(&[None, None]), None);
        assert_eq!(safe_add(&[Some(1.0), None]), Some(1.0));
        assert_eq!(safe_add(&[Some(1.0), Some(2.5), None]), Some(3.5));
        assert_eq!(safe_add(&[None, Some(-4.0)]), Some(-4.0));
    }

    #[test]
    fn safe_max_is_strict() {
        assert_eq!(safe_max(Some(0.0), None), None);
        assert_eq!(safe_max(None, Some(1.0)), None);
        assert_eq!(safe_max(Some(0.0), Some(-5.0)), Some(0.0));
        assert_eq!(safe_max(Some(0.0), Some(5.0)), Some(5.0));
    }

    #[test]
    fn phase_totals_track_highest_phase() {
        let mut map = BTreeMap::new();
        map.insert("/Ac/Grid/L1/Power".to_string(), serde_json::json!(100.0));
        map.insert("/Ac/Grid/L3/Power".to_string(), serde_json::json!(50.0));
        compute_phase_totals("/Ac/Grid", &mut map);
        assert_eq!(map_f64(&map, "/Ac/Grid/Total/Power"), Some(150.0));
        assert_eq!(map.get("/Ac/Grid/NumberOfPhases"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn phase_totals_null_when_empty() {
        let mut map = BTreeMap::new();
        compute_phase_totals("/Ac/Genset", &mut map);
        assert_eq!(map.get("/Ac/Genset/Total/Power"), Some(&Value::Null));
        assert_eq!(map.get("/Ac/Genset/NumberOfPhases"), Some(&Value::Null));
    }
}
