//! LG resu battery fault detection
//!
//! When the LG battery is quiescent (|I| below 10 mA) the inverter/charger
//! must see the same stable DC voltage. A sustained discrepancy means the
//! battery's internal circuit breaker has opened, so raise the alarm and
//! switch the inverter/charger off before it drains the link capacitors.

use serde_json::Value;

use crate::monitor::ServiceKind;
use crate::monitor::bus::RemoteWrite;

/// Product id of the LG resu battery family
pub const LG_PRODUCT_ID: i64 = 0xB004;

const BUFFER_CAPACITY: usize = 40;
const MIN_SAMPLES: usize = 20;
const QUIESCENT_CURRENT: f64 = 0.01;

/// Sliding window of inverter/charger voltages while the battery is idle
#[derive(Debug)]
pub(crate) struct LgDetector {
    pub(crate) service: String,
    pub(crate) buffer: Vec<f64>,
}

impl LgDetector {
    fn new(service: String) -> Self {
        Self {
            service,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
        }
    }

    fn push(&mut self, voltage: f64) {
        self.buffer.push(voltage);
        if self.buffer.len() > BUFFER_CAPACITY {
            let excess = self.buffer.len() - BUFFER_CAPACITY;
            self.buffer.drain(0..excess);
        }
    }
}

impl super::SystemCalc {
    /// Activate the detector when an LG battery appears
    pub(crate) async fn lg_attach(&mut self, service: &str) {
        if ServiceKind::of_service(service) != ServiceKind::Battery {
            return;
        }
        if self.monitor.get_f64(service, "/ProductId") != Some(LG_PRODUCT_ID as f64) {
            return;
        }
        self.logger
            .info(&format!("LG battery service appeared: {}", service));
        self.lg_battery = Some(LgDetector::new(service.to_string()));
        self.publish("/Dc/Battery/Alarms/CircuitBreakerTripped", serde_json::json!(0))
            .await;
    }

    /// Deactivate when the LG battery disappears
    pub(crate) async fn lg_detach(&mut self, service: &str) {
        if self.lg_battery.as_ref().map(|lg| lg.service.as_str()) != Some(service) {
            return;
        }
        self.logger
            .info(&format!("LG battery service disappeared: {}", service));
        self.lg_battery = None;
        self.publish("/Dc/Battery/Alarms/CircuitBreakerTripped", Value::Null)
            .await;
    }

    /// One detector pass, run after each aggregation
    pub(crate) async fn check_lg_battery(&mut self, multi: Option<&str>) {
        let Some(multi) = multi else { return };
        let Some(lg) = &self.lg_battery else { return };
        let lg_service = lg.service.clone();

        let battery_current = self.monitor.get_f64(&lg_service, "/Dc/0/Current");
        match battery_current {
            Some(i) if i.abs() <= QUIESCENT_CURRENT => {}
            _ => {
                // Current flowing (or unknown): the window is meaningless
                if let Some(lg) = &mut self.lg_battery
                    && !lg.buffer.is_empty()
                {
                    self.logger.debug("LG voltage buffer reset");
                    lg.buffer.clear();
                }
                return;
            }
        }

        let Some(vebus_voltage) = self.monitor.get_f64(multi, "/Dc/0/Voltage") else {
            return;
        };
        let (min_voltage, max_voltage, samples) = {
            let Some(lg) = &mut self.lg_battery else { return };
            lg.push(vebus_voltage);
            if lg.buffer.len() < MIN_SAMPLES {
                return;
            }
            let min = lg.buffer.iter().copied().fold(f64::INFINITY, f64::min);
            let max = lg.buffer.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (min, max, lg.buffer.len())
        };

        let Some(battery_voltage) = self.monitor.get_f64(&lg_service, "/Dc/0/Voltage") else {
            return;
        };
        self.logger.debug(&format!(
            "LG battery V={} I={:?} samples={}",
            battery_voltage, battery_current, samples
        ));
        if min_voltage < 0.9 * battery_voltage || max_voltage > 1.1 * battery_voltage {
            self.logger.error(&format!(
                "LG shutdown detected V={} multi range {}..{}",
                battery_voltage, min_voltage, max_voltage
            ));
            self.publish(
                "/Dc/Battery/Alarms/CircuitBreakerTripped",
                serde_json::json!(2),
            )
            .await;
            let _ = self.writes_tx.send(RemoteWrite {
                service: multi.to_string(),
                path: "/Mode".to_string(),
                value: serde_json::json!(4),
            });
            if let Some(lg) = &mut self.lg_battery {
                lg.buffer.clear();
            }
        }
    }
}
