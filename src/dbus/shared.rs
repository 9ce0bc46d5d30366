use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use zbus::Connection;
use zbus::zvariant::OwnedObjectPath;

use crate::engine::EngineCommand;

/// State shared between the service handle and the exported bus objects
pub struct SharedState {
    pub(crate) paths: HashMap<String, serde_json::Value>,
    pub(crate) writable: HashSet<String>,
    pub(crate) commands_tx: mpsc::UnboundedSender<EngineCommand>,
    pub(crate) connection: Option<Connection>,
    pub(crate) root_path: OwnedObjectPath,
}

impl SharedState {
    pub fn new(
        commands_tx: mpsc::UnboundedSender<EngineCommand>,
        root_path: OwnedObjectPath,
    ) -> Self {
        Self {
            paths: HashMap::new(),
            writable: HashSet::new(),
            commands_tx,
            connection: None,
            root_path,
        }
    }
}
