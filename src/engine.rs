//! Core aggregation engine
//!
//! `SystemCalc` owns every piece of mutable state: the service mirror, the
//! published snapshot, the battery selection, the LG detector, the
//! supervision set and the relay handle. Bus events and commands reach it
//! through channels and are processed to completion one at a time, so the
//! aggregation pipeline always sees a consistent mirror.

use serde_json::Value;
use tokio::sync::mpsc;
use zbus::Connection;

use crate::config::Config;
use crate::dbus::SystemService;
use crate::monitor::bus::RemoteWrite;
use crate::monitor::{Monitor, MonitorEvent, ServiceKind};
use crate::settings::Settings;

mod aggregation;
pub(crate) mod lg;
mod relay;
mod runtime;
mod selector;
mod supervisor;

pub use lg::LG_PRODUCT_ID;
pub use relay::RelayIo;

/// Commands sent to the engine from the published service
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// A bus write to `/Relay/0/State`
    SetRelayState(Value),
}

/// The aggregation engine
pub struct SystemCalc {
    pub(crate) config: Config,
    pub(crate) logger: crate::logging::StructuredLogger,

    /// Mirror of the remote device services
    pub(crate) monitor: Monitor,

    /// The published com.victronenergy.system service
    pub(crate) service: SystemService,

    /// Typed view of the system-setup settings
    pub(crate) settings: Settings,

    /// Currently selected battery service (fully-qualified name)
    pub(crate) battery_service: Option<String>,

    /// Services probed for liveness
    pub(crate) supervised: std::collections::BTreeSet<String>,

    /// LG fault detector, present while an LG battery is on the bus
    pub(crate) lg_battery: Option<lg::LgDetector>,

    /// Relay GPIO handle; None when the file could not be opened
    pub(crate) relay: Option<RelayIo>,

    /// Set by every mirror change; the 1 s tick recomputes only when set
    pub(crate) changed: bool,

    /// Independent counter driving the 10 s SoC mirror
    pub(crate) soc_counter: u8,

    pub(crate) connection: Option<Connection>,

    pub(crate) events_tx: mpsc::UnboundedSender<MonitorEvent>,
    pub(crate) events_rx: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
    pub(crate) commands_tx: mpsc::UnboundedSender<EngineCommand>,
    pub(crate) commands_rx: Option<mpsc::UnboundedReceiver<EngineCommand>>,
    pub(crate) writes_tx: mpsc::UnboundedSender<RemoteWrite>,
    pub(crate) writes_rx: Option<mpsc::UnboundedReceiver<RemoteWrite>>,
}

/// `class/instance` short handle, the stable identity of a device
/// (`battery/2`); the trailing name segment of a service is not.
pub(crate) fn short_handle(service: &str, instance: u32) -> String {
    format!("{}/{}", ServiceKind::of_service(service).class(), instance)
}

/// First three segments of the service name plus the instance
/// (`com.victronenergy.battery/2`), the form used in measurement ids and
/// mapping paths.
pub(crate) fn instance_service_name(service: &str, instance: u32) -> String {
    let base: Vec<&str> = service.split('.').take(3).collect();
    format!("{}/{}", base.join("."), instance)
}

/// Flatten a name for use as a path segment
pub(crate) fn flatten(name: &str) -> String {
    name.replace(['.', '/'], "_")
}

pub(crate) fn service_mapping_path(service: &str, instance: u32) -> String {
    format!(
        "/ServiceMapping/{}",
        flatten(&instance_service_name(service, instance))
    )
}

impl SystemCalc {
    /// Handle one monitor event, updating the mirror and everything derived
    /// from the service set.
    pub async fn handle_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::ServiceAdded {
                service,
                instance,
                values,
            } => {
                self.monitor.add_service(&service, instance, values);
                self.changed = true;

                // Seeded settings values must reach the typed adapter before
                // the selection below runs.
                if ServiceKind::of_service(&service) == ServiceKind::Settings {
                    for path in crate::monitor::subscribed_paths(ServiceKind::Settings) {
                        if Settings::owns_path(path) {
                            let value = self.monitor.get_value(&service, path);
                            self.settings.apply(path, &value);
                        }
                    }
                }

                let path = service_mapping_path(&service, instance);
                self.publish(&path, Value::String(service.clone())).await;

                self.supervisor_track(&service);
                self.lg_attach(&service).await;
                self.handle_service_change().await;
            }
            MonitorEvent::ServiceRemoved { service } => {
                if let Some(instance) = self.monitor.instance_of(&service) {
                    let path = service_mapping_path(&service, instance);
                    self.service.remove_path(&path).await;
                }
                self.supervisor_untrack(&service);
                self.lg_detach(&service).await;
                self.monitor.remove_service(&service);
                self.changed = true;
                self.handle_service_change().await;
            }
            MonitorEvent::ValueChanged {
                service,
                path,
                value,
            } => {
                if !self.monitor.set_value(&service, &path, value.clone()) {
                    return;
                }
                self.changed = true;

                let kind = ServiceKind::of_service(&service);
                if kind == ServiceKind::Settings && Settings::owns_path(&path) {
                    if self.settings.apply(&path, &value) {
                        self.determine_battery_service().await;
                    }
                    return;
                }

                // The connected-service predicate depends on these paths, so
                // the selectable-service set may have changed.
                if matches!(path.as_str(), "/Connected" | "/ProductName" | "/Mgmt/Connection")
                    || (path == "/State" && kind == ServiceKind::Vebus)
                {
                    self.handle_service_change().await;
                }
            }
        }
    }

    /// Handle a command from the published service
    pub async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetRelayState(value) => self.write_relay_state(&value).await,
        }
    }

    /// The 1 s tick: recompute when dirty, advance the SoC-mirror counter
    pub async fn tick(&mut self) {
        if self.changed {
            self.update_values().await;
        }
        self.changed = false;

        self.soc_counter += 1;
        if self.soc_counter >= 10 {
            self.write_vebus_soc();
            self.soc_counter = 0;
        }
    }

    /// Mirror the selected SoC into the primary inverter/charger, unless the
    /// selected source is the inverter/charger itself.
    fn write_vebus_soc(&mut self) {
        if !self.settings.write_vebus_soc() {
            return;
        }
        let Some(battery_service) = &self.battery_service else {
            return;
        };
        if ServiceKind::of_service(battery_service) == ServiceKind::Vebus {
            return;
        }
        let Some(multi) = self.service.get("/VebusService").filter(|v| !v.is_null()) else {
            return;
        };
        let Some(multi) = multi.as_str().map(str::to_string) else {
            return;
        };
        let Some(soc) = self.service.get("/Dc/Battery/Soc").filter(|v| !v.is_null()) else {
            return;
        };
        self.logger
            .debug(&format!("writing soc {} to {}", soc, multi));
        let _ = self.writes_tx.send(RemoteWrite {
            service: multi,
            path: "/Soc".to_string(),
            value: soc,
        });
    }

    /// Read a published output value (test and diagnostics accessor)
    pub fn published(&self, path: &str) -> Value {
        self.service.get(path).unwrap_or(Value::Null)
    }

    /// Detach the remote-write queue. The runtime hands it to the bus glue;
    /// tests inspect it directly.
    pub fn take_remote_writes(&mut self) -> Option<mpsc::UnboundedReceiver<RemoteWrite>> {
        self.writes_rx.take()
    }

    /// Sender half of the engine command channel
    pub fn command_sender(&self) -> mpsc::UnboundedSender<EngineCommand> {
        self.commands_tx.clone()
    }

    /// Publish a value, logging rather than propagating failures: a bus
    /// hiccup must not stop the loop.
    pub(crate) async fn publish(&mut self, path: &str, value: Value) {
        if let Err(e) = self.service.publish(path, value).await {
            self.logger.warn(&format!("Publish of {} failed: {}", path, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_handle_uses_class_and_instance() {
        assert_eq!(short_handle("com.victronenergy.battery.ttyO2", 2), "battery/2");
        assert_eq!(short_handle("com.victronenergy.vebus.ttyO1", 261), "vebus/261");
    }

    #[test]
    fn instance_service_name_keeps_three_segments() {
        assert_eq!(
            instance_service_name("com.victronenergy.battery.ttyO2", 2),
            "com.victronenergy.battery/2"
        );
    }

    #[test]
    fn mapping_path_is_flattened() {
        assert_eq!(
            service_mapping_path("com.victronenergy.battery.ttyO2", 2),
            "/ServiceMapping/com_victronenergy_battery_2"
        );
    }
}
