//! Relay GPIO reflection
//!
//! The local digital output is a sysfs value file holding ASCII `0` or `1`.
//! The engine republishes its state every 5 s and accepts writes from the
//! bus. When the file cannot be opened at startup the path stays writable
//! but inert, and the published state remains null.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use serde_json::Value;

use crate::error::{Result, SystemCalcError};

/// Open handle to the relay GPIO value file, held for the process lifetime
pub struct RelayIo {
    file: File,
}

impl RelayIo {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Read the current pin state
    pub fn read_state(&mut self) -> Result<i64> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        self.file.read_to_string(&mut contents)?;
        contents
            .trim()
            .parse()
            .map_err(|e| SystemCalcError::relay(format!("Unparsable relay state: {}", e)))
    }

    /// Write a pin state (0 or 1)
    pub fn write_state(&mut self, state: i64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(state.to_string().as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl super::SystemCalc {
    /// The 5 s reflection: read the pin and publish what it actually holds.
    /// Read failures are logged and published as null.
    pub async fn relay_tick(&mut self) {
        let Some(relay) = &mut self.relay else { return };
        let state = match relay.read_state() {
            Ok(s) => Value::from(s),
            Err(e) => {
                self.logger.warn(&format!("Relay read failed: {}", e));
                Value::Null
            }
        };
        self.publish("/Relay/0/State", state).await;
    }

    /// A bus write to `/Relay/0/State`. Only the integers 0 and 1 reach the
    /// pin; everything else is rejected.
    pub(crate) async fn write_relay_state(&mut self, value: &Value) {
        let state = match value.as_f64() {
            Some(v) if v == 0.0 => 0,
            Some(v) if v == 1.0 => 1,
            _ => {
                self.logger
                    .warn(&format!("Rejecting relay state write: {}", value));
                return;
            }
        };
        let Some(relay) = &mut self.relay else {
            self.logger.debug("Relay write ignored, no GPIO available");
            return;
        };
        match relay.write_state(state) {
            Ok(()) => {
                self.publish("/Relay/0/State", Value::from(state)).await;
            }
            Err(e) => {
                self.logger.warn(&format!("Relay write failed: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_parses_ascii_state() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1").unwrap();
        let mut relay = RelayIo::open(f.path().to_str().unwrap()).unwrap();
        assert_eq!(relay.read_state().unwrap(), 1);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "0").unwrap();
        let mut relay = RelayIo::open(f.path().to_str().unwrap()).unwrap();
        relay.write_state(1).unwrap();
        assert_eq!(relay.read_state().unwrap(), 1);
        relay.write_state(0).unwrap();
        assert_eq!(relay.read_state().unwrap(), 0);
    }

    #[test]
    fn garbage_contents_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "on").unwrap();
        let mut relay = RelayIo::open(f.path().to_str().unwrap()).unwrap();
        assert!(relay.read_state().is_err());
    }

    #[test]
    fn missing_file_does_not_open() {
        assert!(RelayIo::open("/nonexistent/gpio182/value").is_err());
    }
}
