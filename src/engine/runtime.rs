use std::path::Path;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use crate::error::{Result, SystemCalcError};
use crate::monitor::{Monitor, bus};
use crate::settings::Settings;

impl super::SystemCalc {
    /// Create the engine from a loaded configuration. Opens the relay GPIO
    /// file; failure to do so is logged once and leaves the relay a no-op.
    pub fn new(config: crate::config::Config) -> Result<Self> {
        let logger = crate::logging::get_logger("engine");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();

        let service = crate::dbus::SystemService::new(commands_tx.clone())?;

        let relay = match super::RelayIo::open(&config.relay_gpio_file) {
            Ok(r) => Some(r),
            Err(e) => {
                logger.warn(&format!(
                    "Could not open {} (relay): {}",
                    config.relay_gpio_file, e
                ));
                None
            }
        };

        Ok(Self {
            config,
            logger,
            monitor: Monitor::new(),
            service,
            settings: Settings::new(),
            battery_service: None,
            supervised: std::collections::BTreeSet::new(),
            lg_battery: None,
            relay,
            changed: true,
            // One short of the mirror threshold so the first tick mirrors
            soc_counter: 9,
            connection: None,
            events_tx,
            events_rx: Some(events_rx),
            commands_tx,
            commands_rx: Some(commands_rx),
            writes_tx,
            writes_rx: Some(writes_rx),
        })
    }

    /// Run the engine: connect, publish the service, spawn the bus glue and
    /// dispatch events and timers until a termination signal arrives.
    pub async fn run(&mut self) -> Result<()> {
        let conn = bus::connect().await?;
        self.service.start(conn.clone()).await?;
        self.service.declare_paths(self.config.device_instance).await?;
        self.connection = Some(conn.clone());

        let serial = read_serial(Path::new(&self.config.serial_source));
        if serial.is_none() {
            self.logger.warn(&format!(
                "No node identity available from {}",
                self.config.serial_source
            ));
        }
        self.publish(
            "/Serial",
            serial.map(serde_json::Value::String).unwrap_or_default(),
        )
        .await;

        // Initial relay reflection, then every 5 s
        self.relay_tick().await;

        bus::spawn_monitor(conn.clone(), self.events_tx.clone());
        let writes_rx = self
            .take_remote_writes()
            .ok_or_else(|| SystemCalcError::generic("Engine already running"))?;
        bus::spawn_write_pump(conn, writes_rx);

        let mut events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| SystemCalcError::generic("Engine already running"))?;
        let mut commands_rx = self
            .commands_rx
            .take()
            .ok_or_else(|| SystemCalcError::generic("Engine already running"))?;

        // Publish the selector outputs and an initial (mostly null) snapshot
        // before the first services are seeded.
        self.handle_service_change().await;
        self.update_values().await;
        self.changed = false;

        let mut update_interval = interval(Duration::from_millis(self.config.update_interval_ms));
        let mut relay_interval =
            interval(Duration::from_millis(self.config.relay_poll_interval_ms));
        let mut supervision_interval =
            interval(Duration::from_millis(self.config.supervision_interval_ms));

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| SystemCalcError::generic(format!("Signal setup failed: {}", e)))?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        self.logger.info("Starting mainloop, responding only on events");
        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => {
                    self.handle_event(event).await;
                }
                Some(command) = commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = update_interval.tick() => {
                    self.tick().await;
                }
                _ = relay_interval.tick() => {
                    self.relay_tick().await;
                }
                _ = supervision_interval.tick() => {
                    self.process_supervised();
                }
                _ = &mut ctrl_c => {
                    self.logger.info("Interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    self.logger.info("Termination signal received, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Node identity: the MAC address of the primary interface, flattened to a
/// bare hex string
fn read_serial(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let id: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_lowercase();
    if id.is_empty() { None } else { Some(id) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn serial_flattens_mac_address() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "0C:B2:B7:0A:1B:2C").unwrap();
        assert_eq!(
            read_serial(f.path()),
            Some("0cb2b70a1b2c".to_string())
        );
    }

    #[test]
    fn serial_missing_file_is_none() {
        assert_eq!(read_serial(Path::new("/nonexistent/address")), None);
    }
}
