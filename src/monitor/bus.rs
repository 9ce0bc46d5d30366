//! Bus-side glue for the monitor
//!
//! Discovers services whose class appears in the subscription schema, seeds
//! their initial values, and pumps change notifications and ownership
//! changes into the engine's event channel. Also drains the engine's
//! write-back queue and hosts the liveness probe used by the supervisor.
//!
//! Change notifications are the per-item `PropertiesChanged` signals of
//! `com.victronenergy.BusItem`; aggregated root `ItemsChanged` signals are
//! not consumed.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use zbus::names::{BusName, OwnedUniqueName};
use zbus::zvariant::OwnedValue;
use zbus::{Connection, MatchRule, MessageStream, fdo::DBusProxy, message};

use crate::dbus::items::{owned_value_to_serde, serde_to_owned_value};
use crate::error::{Result, SystemCalcError};
use crate::logging::get_logger;
use crate::monitor::{MonitorEvent, ServiceKind, subscribed_paths};

const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(600);

/// A write-back request from the engine to a remote service
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub service: String,
    pub path: String,
    pub value: Value,
}

/// Connect to the system bus, falling back to the session bus (useful for
/// development against a private bus).
pub async fn connect() -> Result<Connection> {
    let logger = get_logger("bus");
    match Connection::system().await {
        Ok(c) => {
            logger.info("Connected to D-Bus: system bus");
            Ok(c)
        }
        Err(e_sys) => match Connection::session().await {
            Ok(c) => {
                logger.warn(&format!(
                    "System bus unavailable ({}); using session bus",
                    e_sys
                ));
                Ok(c)
            }
            Err(e_sess) => Err(SystemCalcError::dbus(format!(
                "DBus connect failed: system={} session={}",
                e_sys, e_sess
            ))),
        },
    }
}

/// Whether a bus name belongs to a service class we mirror
fn is_monitored_name(name: &str) -> bool {
    name.starts_with("com.victronenergy.")
        && ServiceKind::of_service(name) != ServiceKind::Unknown
}

/// Read one remote BusItem value; null when the item is missing or the call
/// fails.
async fn read_item(conn: &Connection, service: &str, path: &str) -> Value {
    let proxy = match tokio::time::timeout(
        CALL_TIMEOUT,
        zbus::Proxy::new(conn, service.to_string(), path.to_string(), "com.victronenergy.BusItem"),
    )
    .await
    {
        Ok(Ok(p)) => p,
        _ => return Value::Null,
    };
    match tokio::time::timeout(CALL_TIMEOUT, proxy.call::<_, _, OwnedValue>("GetValue", &())).await
    {
        Ok(Ok(v)) => owned_value_to_serde(&v),
        _ => Value::Null,
    }
}

/// Read all subscribed paths of a newly-discovered service and emit a
/// `ServiceAdded` event. The device instance defaults to 0 when the service
/// does not publish one.
async fn seed_service(
    conn: &Connection,
    service: &str,
    events_tx: &mpsc::UnboundedSender<MonitorEvent>,
) {
    let kind = ServiceKind::of_service(service);
    let instance = read_item(conn, service, "/DeviceInstance")
        .await
        .as_u64()
        .map(|v| v as u32)
        .unwrap_or(0);

    let mut values: HashMap<String, Value> = HashMap::new();
    for path in subscribed_paths(kind) {
        values.insert((*path).to_string(), read_item(conn, service, path).await);
    }

    let _ = events_tx.send(MonitorEvent::ServiceAdded {
        service: service.to_string(),
        instance,
        values,
    });
}

/// Spawn the discovery/notification pump. Runs until the connection dies.
pub fn spawn_monitor(
    conn: Connection,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let logger = get_logger("monitor");
        if let Err(e) = run_monitor(&conn, &events_tx).await {
            logger.error(&format!("Bus monitor stopped: {}", e));
        }
    })
}

async fn run_monitor(
    conn: &Connection,
    events_tx: &mpsc::UnboundedSender<MonitorEvent>,
) -> Result<()> {
    let logger = get_logger("monitor");
    let dbus_proxy = DBusProxy::new(conn)
        .await
        .map_err(|e| SystemCalcError::dbus(format!("DBusProxy creation failed: {}", e)))?;

    // Owner bookkeeping: PropertiesChanged signals arrive with the sender's
    // unique name, so track which unique name owns which service name.
    let mut owners: HashMap<OwnedUniqueName, String> = HashMap::new();

    let mut owner_changes = dbus_proxy
        .receive_name_owner_changed()
        .await
        .map_err(|e| SystemCalcError::dbus(format!("NameOwnerChanged subscribe failed: {}", e)))?;

    let rule = MatchRule::builder()
        .msg_type(message::Type::Signal)
        .interface("com.victronenergy.BusItem")
        .map_err(|e| SystemCalcError::dbus(e.to_string()))?
        .member("PropertiesChanged")
        .map_err(|e| SystemCalcError::dbus(e.to_string()))?
        .build();
    let mut changes = MessageStream::for_match_rule(rule, conn, Some(256))
        .await
        .map_err(|e| SystemCalcError::dbus(format!("Signal subscribe failed: {}", e)))?;

    // Initial scan
    let names = dbus_proxy
        .list_names()
        .await
        .map_err(|e| SystemCalcError::dbus(format!("ListNames failed: {}", e)))?;
    for name in names {
        let name = name.to_string();
        if !is_monitored_name(&name) {
            continue;
        }
        if let Ok(bus_name) = BusName::try_from(name.as_str())
            && let Ok(owner) = dbus_proxy.get_name_owner(bus_name).await
        {
            owners.insert(owner, name.clone());
        }
        seed_service(conn, &name, events_tx).await;
    }
    logger.info(&format!("Initial scan complete, {} services mirrored", owners.len()));

    loop {
        tokio::select! {
            Some(signal) = owner_changes.next() => {
                let Ok(args) = signal.args() else { continue };
                let name = args.name().to_string();
                if !is_monitored_name(&name) {
                    continue;
                }
                match (args.old_owner().as_ref(), args.new_owner().as_ref()) {
                    (_, Some(new_owner)) => {
                        owners.retain(|_, svc| svc != &name);
                        owners.insert(OwnedUniqueName::from(new_owner.clone()), name.clone());
                        logger.info(&format!("Service appeared on the bus: {}", name));
                        seed_service(conn, &name, events_tx).await;
                    }
                    (Some(_), None) => {
                        owners.retain(|_, svc| svc != &name);
                        logger.info(&format!("Service left the bus: {}", name));
                        let _ = events_tx.send(MonitorEvent::ServiceRemoved { service: name });
                    }
                    (None, None) => {}
                }
            }
            Some(msg) = changes.next() => {
                let Ok(msg) = msg else { continue };
                let header = msg.header();
                let Some(sender) = header.sender() else { continue };
                let Some(service) = owners.get(&OwnedUniqueName::from(sender.to_owned())).cloned()
                else {
                    continue;
                };
                let Some(path) = header.path() else { continue };
                let path = path.to_string();
                let kind = ServiceKind::of_service(&service);
                if !subscribed_paths(kind).contains(&path.as_str()) {
                    continue;
                }
                let Ok(body) = msg.body().deserialize::<HashMap<String, OwnedValue>>() else {
                    continue;
                };
                if let Some(value) = body.get("Value") {
                    let _ = events_tx.send(MonitorEvent::ValueChanged {
                        service,
                        path,
                        value: owned_value_to_serde(value),
                    });
                }
            }
            else => break,
        }
    }
    Ok(())
}

/// Spawn the write-back pump draining the engine's remote-write queue.
/// Failures are logged and dropped; the engine never blocks on them.
pub fn spawn_write_pump(
    conn: Connection,
    mut writes_rx: mpsc::UnboundedReceiver<RemoteWrite>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let logger = get_logger("bus");
        while let Some(write) = writes_rx.recv().await {
            let proxy = match zbus::Proxy::new(
                &conn,
                write.service.clone(),
                write.path.clone(),
                "com.victronenergy.BusItem",
            )
            .await
            {
                Ok(p) => p,
                Err(e) => {
                    logger.warn(&format!(
                        "Write to {}{} failed: {}",
                        write.service, write.path, e
                    ));
                    continue;
                }
            };
            let value = serde_to_owned_value(&write.value);
            match tokio::time::timeout(CALL_TIMEOUT, proxy.call::<_, _, i32>("SetValue", &value))
                .await
            {
                Ok(Ok(0)) => {}
                Ok(Ok(code)) => logger.warn(&format!(
                    "Write to {}{} rejected with code {}",
                    write.service, write.path, code
                )),
                Ok(Err(e)) => logger.warn(&format!(
                    "Write to {}{} failed: {}",
                    write.service, write.path, e
                )),
                Err(_) => logger.warn(&format!(
                    "Write to {}{} timed out",
                    write.service, write.path
                )),
            }
        }
    })
}

/// The D-Bus error name of a failed call, if the error carries one
pub fn dbus_error_name(err: &zbus::Error) -> Option<&str> {
    match err {
        zbus::Error::MethodError(name, _, _) => Some(name.as_str()),
        _ => None,
    }
}

/// Peer-unresponsive is signalled by exactly this error; everything else is
/// log-and-continue.
pub fn is_no_reply(err: &zbus::Error) -> bool {
    dbus_error_name(err) == Some("org.freedesktop.DBus.Error.NoReply")
}

/// Fire one liveness probe at a supervised service. A `NoReply` outcome
/// resolves the owning process and terminates it with SIGKILL; any other
/// error is logged and ignored.
pub fn spawn_supervision_probe(conn: Connection, service: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let logger = get_logger("supervisor");
        let proxy = match zbus::Proxy::new(
            &conn,
            service.clone(),
            "/ProductId",
            "com.victronenergy.BusItem",
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                logger.info(&format!("Ignoring supervise error from {}: {}", service, e));
                return;
            }
        };
        // No client-side timeout here: the NoReply classification relies on
        // the bus daemon's own reply deadline.
        match proxy.call::<_, _, OwnedValue>("GetValue", &()).await {
            Ok(_) => {}
            Err(err) if is_no_reply(&err) => {
                logger.error(&format!("{} is not responding to D-Bus requests", service));
                kill_service_owner(&conn, &service, &logger).await;
            }
            Err(err) => {
                logger.info(&format!("Ignoring supervise error from {}: {}", service, err));
            }
        }
    })
}

async fn kill_service_owner(
    conn: &Connection,
    service: &str,
    logger: &crate::logging::StructuredLogger,
) {
    let proxy = match DBusProxy::new(conn).await {
        Ok(p) => p,
        Err(e) => {
            logger.error(&format!("Cannot resolve owner of {}: {}", service, e));
            return;
        }
    };
    let name = match BusName::try_from(service) {
        Ok(n) => n,
        Err(e) => {
            logger.error(&format!("Invalid bus name {}: {}", service, e));
            return;
        }
    };
    match proxy.get_connection_unix_process_id(name).await {
        Ok(pid) if pid > 1 => {
            logger.error(&format!("killing owner of {} (pid={})", service, pid));
            if let Err(e) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                logger.error(&format!("kill failed for pid {}: {}", pid, e));
            }
        }
        Ok(pid) => {
            logger.error(&format!("Refusing to kill pid {} for {}", pid, service));
        }
        Err(e) => {
            logger.error(&format!("Cannot resolve owner of {}: {}", service, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitored_name_matching() {
        assert!(is_monitored_name("com.victronenergy.battery.ttyO2"));
        assert!(is_monitored_name("com.victronenergy.settings"));
        // Our own service and foreign names stay out of the mirror
        assert!(!is_monitored_name("com.victronenergy.system"));
        assert!(!is_monitored_name("org.freedesktop.DBus"));
        assert!(!is_monitored_name("com.victronenergy.fridge.ttyUSB0"));
    }

    #[test]
    fn no_reply_classification_ignores_other_errors() {
        let err = zbus::Error::InvalidReply;
        assert!(!is_no_reply(&err));
        assert_eq!(dbus_error_name(&err), None);
    }
}
