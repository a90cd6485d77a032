//! Document schema descriptors and the handshake compatibility check.
//!
//! A descriptor lists a schema version plus one migration sequence per record
//! family. The engine never migrates records, so a client may only connect
//! when every sequence it declares matches the server exactly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::error;

use crate::protocol::{IncompatibilityReason, PROTOCOL_VERSION};

const BOARD_SCHEMA_JSON: &str = include_str!("board_schema.json");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    pub schema_version: u32,
    pub sequences: BTreeMap<String, u32>,
}

impl SchemaDescriptor {
    /// The board schema bundled with the server.
    ///
    /// An unreadable bundle is logged and yields an empty descriptor, which
    /// refuses every client as `serverTooOld`.
    pub fn board() -> Self {
        Self::bundled(BOARD_SCHEMA_JSON)
    }

    fn bundled(json: &str) -> Self {
        match Self::from_json(json) {
            Ok(schema) => schema,
            Err(e) => {
                error!("Bundled board schema is invalid: {}", e);
                Self::default()
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Check a client's `connect` against this (the server's) schema.
    pub fn check_client(
        &self,
        protocol_version: u32,
        client_schema: &Value,
    ) -> Result<(), IncompatibilityReason> {
        compare(protocol_version, PROTOCOL_VERSION)?;

        let client: SchemaDescriptor = serde_json::from_value(client_schema.clone())
            .map_err(|_| IncompatibilityReason::InvalidRecord)?;

        compare(client.schema_version, self.schema_version)?;

        for (name, client_version) in &client.sequences {
            match self.sequences.get(name) {
                Some(server_version) => compare(*client_version, *server_version)?,
                None => return Err(IncompatibilityReason::ServerTooOld),
            }
        }

        Ok(())
    }
}

fn compare(client: u32, server: u32) -> Result<(), IncompatibilityReason> {
    match client.cmp(&server) {
        Ordering::Equal => Ok(()),
        Ordering::Less => Err(IncompatibilityReason::ClientTooOld),
        Ordering::Greater => Err(IncompatibilityReason::ServerTooOld),
    }
}
