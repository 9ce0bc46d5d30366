//! Battery-source selection
//!
//! Chooses the authoritative battery data source from the user setting and
//! the currently-present services, and publishes the selectable sources for
//! the settings UI.

use serde_json::Value;

use crate::engine::{flatten, instance_service_name, short_handle};
use crate::monitor::ServiceKind;
use crate::settings::{BATSERVICE_DEFAULT, BATSERVICE_NOBATTERY, BatterySetting};

impl super::SystemCalc {
    /// Automatic pick: a battery monitor when one is connected (the
    /// name-smallest when there are several). With no battery monitor but
    /// solar or DC chargers present, refuse to guess: their flows are not
    /// summarised by any single service. Failing those, a connected
    /// inverter/charger carries a usable SoC.
    pub(crate) fn autoselect_battery_service(&self) -> Option<String> {
        let batteries = self.monitor.connected_services(Some(ServiceKind::Battery));
        if let Some((name, _)) = batteries.into_iter().next() {
            return Some(name);
        }
        if self.monitor.first_connected(ServiceKind::SolarCharger).is_some() {
            return None;
        }
        if self.monitor.first_connected(ServiceKind::Charger).is_some() {
            return None;
        }
        self.monitor
            .first_connected(ServiceKind::Vebus)
            .map(|(name, _)| name)
    }

    /// Resolve the battery setting against the present services and publish
    /// the selection paths. Runs on setting changes and on every
    /// service-set change.
    pub(crate) async fn determine_battery_service(&mut self) {
        let auto = self.autoselect_battery_service();

        let auto_measurement = auto.as_ref().and_then(|service| {
            self.monitor.instance_of(service).map(|instance| {
                format!("{}/Dc/0", flatten(&instance_service_name(service, instance)))
            })
        });
        self.publish(
            "/AutoSelectedBatteryMeasurement",
            auto_measurement.map(Value::String).unwrap_or(Value::Null),
        )
        .await;

        let setting = self.settings.battery_service().to_string();
        let parsed = BatterySetting::parse(&setting).unwrap_or_else(|| {
            self.logger
                .error(&format!("The battery setting ({}) is invalid!", setting));
            BatterySetting::Default
        });

        let new_battery_service = match parsed {
            BatterySetting::Default => {
                let label = match &auto {
                    None => Value::String("No battery monitor found".to_string()),
                    Some(service) => Value::String(
                        self.readable_service_name(service)
                            .unwrap_or_else(|| service.clone()),
                    ),
                };
                self.publish("/AutoSelectedBatteryService", label).await;
                auto
            }
            BatterySetting::NoBattery => {
                self.publish("/AutoSelectedBatteryService", Value::Null).await;
                None
            }
            BatterySetting::Pinned { kind, instance } => {
                self.publish("/AutoSelectedBatteryService", Value::Null).await;
                // A pinned monitor that is gone may come back; neither
                // overwrite the setting nor fall back to another source.
                self.monitor
                    .connected_services(Some(kind))
                    .into_iter()
                    .find(|(_, i)| *i == instance)
                    .map(|(name, _)| name)
            }
        };

        if new_battery_service != self.battery_service {
            let active = new_battery_service.as_ref().and_then(|service| {
                self.monitor
                    .instance_of(service)
                    .map(|instance| short_handle(service, instance))
            });
            self.logger.info(&format!(
                "Battery service, setting == {}, changed from {} to {}",
                setting,
                self.battery_service.as_deref().unwrap_or("None"),
                new_battery_service.as_deref().unwrap_or("None"),
            ));
            self.publish(
                "/ActiveBatteryService",
                active.map(Value::String).unwrap_or(Value::Null),
            )
            .await;
            self.battery_service = new_battery_service;
        }
    }

    /// Rebuild everything derived from the service set: the selectable
    /// sources, the selection itself and the PV-inverter product-id list.
    pub(crate) async fn handle_service_change(&mut self) {
        let mut services = self.monitor.connected_services(Some(ServiceKind::Vebus));
        services.extend(self.monitor.connected_services(Some(ServiceKind::Battery)));

        // The dropdown keys use the class/instance handle: the trailing name
        // segment of a service is connection-dependent and not stable.
        let mut selectable = serde_json::Map::new();
        selectable.insert(
            BATSERVICE_DEFAULT.to_string(),
            Value::String("Automatic".to_string()),
        );
        selectable.insert(
            BATSERVICE_NOBATTERY.to_string(),
            Value::String("No battery monitor".to_string()),
        );
        let mut measurements = selectable.clone();
        for (service, instance) in &services {
            let label = self
                .readable_service_name(service)
                .unwrap_or_else(|| service.clone());
            selectable.insert(
                short_handle(service, *instance),
                Value::String(label.clone()),
            );
            measurements.insert(
                format!("{}/Dc/0", flatten(&instance_service_name(service, *instance))),
                Value::String(label),
            );
        }
        let selectable_json =
            serde_json::to_string(&Value::Object(selectable)).unwrap_or_default();
        self.publish("/AvailableBatteryServices", Value::String(selectable_json))
            .await;
        self.publish("/AvailableBatteryMeasurements", Value::Object(measurements))
            .await;

        self.determine_battery_service().await;
        self.update_pvinverter_pid_list().await;

        self.changed = true;
    }

    /// Deduplicated product ids of the present PV inverters
    pub(crate) async fn update_pvinverter_pid_list(&mut self) {
        let mut product_ids: Vec<Value> = Vec::new();
        for pvinverter in self.monitor.service_list(Some(ServiceKind::PvInverter)).keys() {
            let pid = self.monitor.get_value(pvinverter, "/ProductId");
            if !pid.is_null() && !product_ids.contains(&pid) {
                product_ids.push(pid);
            }
        }
        self.publish("/PvInvertersProductIds", Value::Array(product_ids))
            .await;
    }

    /// `<ProductName> on <Mgmt/Connection>`, the human label of a service
    pub(crate) fn readable_service_name(&self, service: &str) -> Option<String> {
        let product_name = self.monitor.get_value(service, "/ProductName");
        let connection = self.monitor.get_value(service, "/Mgmt/Connection");
        match (product_name.as_str(), connection.as_str()) {
            (Some(p), Some(c)) => Some(format!("{} on {}", p, c)),
            _ => None,
        }
    }
}
