//! OPC UA adapter: publishes every tag as a variable node under a `Tags`
//! folder and folds client writes back through the store's patch path.
//!
//! Node variants derive from the declared datatype; Decimal tags surface as
//! `String` nodes bearing the exact textual form, matching the REST rule.
//! A type-mismatched client write is rejected and logged (the node is
//! restored from the store); never fatal to the process.

// Leading `::` keeps the extern crate distinct from this module's path.
use ::opcua::server::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::poll::poller::{WriteHandle, WriteRequest};
use crate::tags::store::{TagPatch, TagStore};
use crate::tags::structures::{PlcName, TagDatatype, TagRecord, TagValue};

const NAMESPACE_URI: &str = "urn:plc-gateway";
const TAGS_FOLDER: &str = "Tags";

/// How often node values are reconciled with the store, in milliseconds.
const SYNC_INTERVAL_MS: u64 = 250;

struct NodeEntry {
    node_id: NodeId,
    /// Last value this adapter pushed; a node holding anything else means a
    /// client wrote to it.
    last_pushed: TagValue,
}

pub struct OpcUaAdapter {
    store: TagStore,
    writers: Arc<HashMap<PlcName, WriteHandle>>,
    namespace: u16,
    folder_id: NodeId,
    nodes: Mutex<HashMap<String, NodeEntry>>,
}

impl OpcUaAdapter {
    /// Build the server, seed the address space, and run it on a blocking
    /// task. Returns once the server is launched.
    pub fn spawn(
        store: TagStore,
        writers: Arc<HashMap<PlcName, WriteHandle>>,
        port: u16,
    ) -> Result<()> {
        let mut server = ServerBuilder::new_anonymous("PLC Gateway")
            .application_uri(NAMESPACE_URI)
            .product_uri(NAMESPACE_URI)
            .host_and_port("0.0.0.0", port)
            .discovery_urls(vec!["/".into()])
            .create_sample_keypair(true)
            .trust_client_certs()
            .server()
            .ok_or_else(|| GatewayError::Internal("failed to build OPC UA server".into()))?;

        let address_space = server.address_space();
        let (namespace, folder_id) = {
            let mut space = address_space.write();
            let namespace = space
                .register_namespace(NAMESPACE_URI)
                .map_err(|_| GatewayError::Internal("failed to register namespace".into()))?;
            let folder_id = space
                .add_folder(TAGS_FOLDER, TAGS_FOLDER, &NodeId::objects_folder_id())
                .map_err(|_| GatewayError::Internal("failed to add Tags folder".into()))?;
            (namespace, folder_id)
        };

        let adapter = Arc::new(OpcUaAdapter {
            store,
            writers,
            namespace,
            folder_id,
            nodes: Mutex::new(HashMap::new()),
        });

        let sync_adapter = Arc::clone(&adapter);
        let sync_space = Arc::clone(&address_space);
        server.add_polling_action(SYNC_INTERVAL_MS, move || {
            let mut space = sync_space.write();
            sync_adapter.sync(&mut space);
        });

        info!(port, "OPC UA server starting on opc.tcp://0.0.0.0:{port}/");
        tokio::task::spawn_blocking(move || {
            server.run();
        });
        Ok(())
    }

    /// Reconcile store and address space: create/delete nodes, push fresh
    /// store values out, and fold client writes back in.
    fn sync(&self, space: &mut AddressSpace) {
        let snapshot = self.store.snapshot();
        let mut nodes = self.nodes.lock().unwrap();

        for record in &snapshot {
            match nodes.get_mut(&record.id) {
                None => {
                    let node_id = NodeId::new(self.namespace, record.id.clone());
                    let variant = value_to_variant(&record.value);
                    let builder =
                        VariableBuilder::new(&node_id, record.id.clone(), record.name.clone())
                            .organized_by(&self.folder_id)
                            .data_type(variant_data_type(record.datatype))
                            .value(variant);
                    let builder = if record.writable {
                        builder.writable()
                    } else {
                        builder
                    };
                    builder.insert(space);
                    debug!(id = %record.id, "OPC UA node created");
                    nodes.insert(
                        record.id.clone(),
                        NodeEntry {
                            node_id,
                            last_pushed: record.value.clone(),
                        },
                    );
                }
                Some(entry) => {
                    let node_value = space
                        .get_variable_value(entry.node_id.clone())
                        .ok()
                        .and_then(|dv| dv.value);
                    let client_value = node_value
                        .as_ref()
                        .and_then(|v| variant_to_value(v, record.datatype));

                    match client_value {
                        Some(value) if value != entry.last_pushed => {
                            self.apply_client_write(record, value, entry, space);
                        }
                        Some(_) => {
                            if record.value != entry.last_pushed {
                                self.push(record, entry, space);
                            }
                        }
                        None => {
                            // BadTypeMismatch territory: a client stored a
                            // variant the datatype cannot absorb.
                            if node_value.is_some() {
                                warn!(
                                    id = %record.id,
                                    "OPC UA write with mismatched variant rejected"
                                );
                            }
                            self.push(record, entry, space);
                        }
                    }
                }
            }
        }

        // Tags deleted over REST disappear from the address space.
        let live: std::collections::HashSet<&str> =
            snapshot.iter().map(|r| r.id.as_str()).collect();
        nodes.retain(|id, entry| {
            if live.contains(id.as_str()) {
                true
            } else {
                space.delete(&entry.node_id, true);
                debug!(%id, "OPC UA node removed");
                false
            }
        });
    }

    fn push(&self, record: &TagRecord, entry: &mut NodeEntry, space: &mut AddressSpace) {
        let now = DateTime::now();
        space.set_variable_value(
            entry.node_id.clone(),
            value_to_variant(&record.value),
            &now,
            &now,
        );
        entry.last_pushed = record.value.clone();
    }

    fn apply_client_write(
        &self,
        record: &TagRecord,
        value: TagValue,
        entry: &mut NodeEntry,
        space: &mut AddressSpace,
    ) {
        if !record.writable {
            warn!(id = %record.id, "OPC UA write to read-only tag rejected");
            self.push(record, entry, space);
            return;
        }
        if let Some(writer) = self.writers.get(&record.plc) {
            let request = WriteRequest {
                id: record.id.clone(),
                address: record.address.clone(),
                value: value.clone(),
            };
            if let Err(e) = writer.submit(request) {
                warn!(id = %record.id, "OPC UA write-through rejected: {e}");
                self.push(record, entry, space);
                return;
            }
        }
        let patch = TagPatch {
            value: Some(value.clone()),
            ..Default::default()
        };
        match self.store.patch(&record.id, patch) {
            Ok(_) => {
                debug!(id = %record.id, "OPC UA client write applied");
                entry.last_pushed = value;
            }
            Err(e) => {
                warn!(id = %record.id, "OPC UA client write rejected: {e}");
                self.push(record, entry, space);
            }
        }
    }
}

fn variant_data_type(datatype: TagDatatype) -> DataTypeId {
    match datatype {
        TagDatatype::Bool => DataTypeId::Boolean,
        TagDatatype::Int => DataTypeId::Int64,
        TagDatatype::Real => DataTypeId::Double,
        // Exact textual form, preserving the REST rule.
        TagDatatype::Decimal => DataTypeId::String,
        TagDatatype::String => DataTypeId::String,
    }
}

fn value_to_variant(value: &TagValue) -> Variant {
    match value {
        TagValue::Bool(b) => Variant::Boolean(*b),
        TagValue::Int(i) => Variant::Int64(*i),
        TagValue::Real(f) => Variant::Double(*f),
        TagValue::Decimal(d) => Variant::String(UAString::from(d.to_string())),
        TagValue::Text(s) => Variant::String(UAString::from(s.as_str())),
    }
}

/// Interpret a node variant under the tag's declared datatype. `None`
/// means the variant cannot be absorbed (type mismatch).
fn variant_to_value(variant: &Variant, datatype: TagDatatype) -> Option<TagValue> {
    match datatype {
        TagDatatype::Bool => match variant {
            Variant::Boolean(b) => Some(TagValue::Bool(*b)),
            _ => None,
        },
        TagDatatype::Int => match variant {
            Variant::Int64(i) => Some(TagValue::Int(*i)),
            Variant::Int32(i) => Some(TagValue::Int(*i as i64)),
            Variant::Int16(i) => Some(TagValue::Int(*i as i64)),
            Variant::UInt32(u) => Some(TagValue::Int(*u as i64)),
            Variant::UInt16(u) => Some(TagValue::Int(*u as i64)),
            _ => None,
        },
        TagDatatype::Real => match variant {
            Variant::Double(f) => Some(TagValue::Real(*f)),
            Variant::Float(f) => Some(TagValue::Real(*f as f64)),
            Variant::Int64(i) => Some(TagValue::Real(*i as f64)),
            _ => None,
        },
        TagDatatype::Decimal => match variant {
            Variant::String(s) => {
                Decimal::from_str(s.as_ref()).ok().map(TagValue::Decimal)
            }
            _ => None,
        },
        TagDatatype::String => match variant {
            Variant::String(s) => Some(TagValue::Text(s.as_ref().to_string())),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_maps_to_string_variant_with_exact_text() {
        let d = TagValue::Decimal(Decimal::from_str("1.2300").unwrap());
        match value_to_variant(&d) {
            Variant::String(s) => assert_eq!(s.as_ref(), "1.2300"),
            other => panic!("expected string variant, got {:?}", other),
        }
    }

    #[test]
    fn variant_conversion_respects_declared_type() {
        assert_eq!(
            variant_to_value(&Variant::Int32(7), TagDatatype::Int),
            Some(TagValue::Int(7))
        );
        assert_eq!(variant_to_value(&Variant::Double(1.5), TagDatatype::Int), None);
        assert_eq!(
            variant_to_value(&Variant::String(UAString::from("2.50")), TagDatatype::Decimal),
            Some(TagValue::Decimal(Decimal::from_str("2.50").unwrap()))
        );
        assert_eq!(
            variant_to_value(&Variant::Boolean(true), TagDatatype::Decimal),
            None
        );
    }
}
