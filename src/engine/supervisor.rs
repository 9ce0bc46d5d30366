//! Liveness supervision of battery and solar-charger services
//!
//! Some device daemons can wedge while keeping their bus name alive, which
//! freezes the data a whole installation runs on. A periodic `/ProductId`
//! probe detects that: a `NoReply` means the owning process is stuck and is
//! forcefully killed so the service supervisor restarts it.

use crate::monitor::{ServiceKind, bus};

impl super::SystemCalc {
    /// Track a newly-appeared service if its class is supervised
    pub(crate) fn supervisor_track(&mut self, service: &str) {
        if matches!(
            ServiceKind::of_service(service),
            ServiceKind::Battery | ServiceKind::SolarCharger
        ) {
            self.supervised.insert(service.to_string());
        }
    }

    pub(crate) fn supervisor_untrack(&mut self, service: &str) {
        self.supervised.remove(service);
    }

    /// Fire one asynchronous probe per supervised service. Fire-and-forget:
    /// the outcome is handled entirely by the probe task.
    pub(crate) fn process_supervised(&self) {
        let Some(conn) = &self.connection else { return };
        for service in &self.supervised {
            bus::spawn_supervision_probe(conn.clone(), service.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::SystemCalc;
    use crate::monitor::MonitorEvent;
    use std::collections::HashMap;

    fn engine() -> SystemCalc {
        let mut config = Config::default();
        config.relay_gpio_file = "/nonexistent/gpio".to_string();
        SystemCalc::new(config).unwrap()
    }

    #[tokio::test]
    async fn supervised_set_follows_service_lifecycle() {
        let mut calc = engine();
        for service in [
            "com.victronenergy.battery.ttyO2",
            "com.victronenergy.solarcharger.ttyO1",
            "com.victronenergy.grid.cgwacs",
        ] {
            calc.handle_event(MonitorEvent::ServiceAdded {
                service: service.to_string(),
                instance: 0,
                values: HashMap::new(),
            })
            .await;
        }
        assert_eq!(calc.supervised.len(), 2);
        assert!(calc.supervised.contains("com.victronenergy.battery.ttyO2"));
        assert!(!calc.supervised.contains("com.victronenergy.grid.cgwacs"));

        calc.handle_event(MonitorEvent::ServiceRemoved {
            service: "com.victronenergy.battery.ttyO2".to_string(),
        })
        .await;
        assert_eq!(calc.supervised.len(), 1);
    }
}
