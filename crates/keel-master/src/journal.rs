//! Journaling of registry transitions through the replicated log.
//!
//! Only the transitions that must survive master failover are journaled:
//! framework and worker additions and removals. Offers are rescinded by
//! failover and in-flight statuses are retransmitted by workers, so
//! neither is persisted.

use std::collections::BTreeSet;
use std::time::Duration;

use prost::Message;

use keel_log::{Position, Reader, Writer};

use crate::error::{MasterError, MasterResult};
use crate::id::{FrameworkId, WorkerId};
use crate::messages::{FrameworkInfo, WorkerInfo};
use crate::resources::{Resources, Value};

/// A journaled registry transition.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    FrameworkAdded {
        id: FrameworkId,
        info: FrameworkInfo,
    },
    FrameworkRemoved {
        id: FrameworkId,
    },
    WorkerAdded {
        id: WorkerId,
        info: WorkerInfo,
    },
    WorkerRemoved {
        id: WorkerId,
    },
}

pub struct Journal {
    writer: Writer,
}

impl Journal {
    pub fn new(writer: Writer) -> Self {
        Self { writer }
    }

    /// Durably record a transition; returns once a quorum has committed.
    pub async fn record(&mut self, event: &RegistryEvent) -> MasterResult<Position> {
        let bytes = encode(event);
        Ok(self.writer.append(&bytes).await?)
    }

    /// Drop journal entries below the given position, typically after the
    /// surviving state has been re-recorded past it.
    pub async fn truncate(&mut self, to: Position) -> MasterResult<Position> {
        Ok(self.writer.truncate(to).await?)
    }

    /// Read every surviving transition from the log, oldest first.
    pub async fn recover(reader: &Reader) -> MasterResult<Vec<RegistryEvent>> {
        let beginning = reader.beginning().await?;
        let ending = reader.ending().await?;
        let Some(first) = Position::decode(&1u64.to_be_bytes()) else {
            return Ok(vec![]);
        };
        if ending < first {
            // Nothing has ever been appended.
            return Ok(vec![]);
        }
        let from = beginning.max(first);
        let mut events = vec![];
        for entry in reader.read(from, ending).await? {
            events.push(decode(&entry.data)?);
        }
        Ok(events)
    }
}

fn encode(event: &RegistryEvent) -> Vec<u8> {
    let kind = match event {
        RegistryEvent::FrameworkAdded { id, info } => record::Kind::FrameworkAdded(PFramework {
            id: id.to_string(),
            name: info.name.clone(),
            user: info.user.clone(),
            failover_timeout_secs: info.failover_timeout.as_secs_f64(),
        }),
        RegistryEvent::FrameworkRemoved { id } => record::Kind::FrameworkRemoved(PRemoved {
            id: id.to_string(),
        }),
        RegistryEvent::WorkerAdded { id, info } => record::Kind::WorkerAdded(PWorker {
            id: id.to_string(),
            hostname: info.hostname.clone(),
            port: info.port as u32,
            resources: encode_resources(&info.resources),
        }),
        RegistryEvent::WorkerRemoved { id } => record::Kind::WorkerRemoved(PRemoved {
            id: id.to_string(),
        }),
    };
    JournalRecord { kind: Some(kind) }.encode_to_vec()
}

fn decode(bytes: &[u8]) -> MasterResult<RegistryEvent> {
    let record = JournalRecord::decode(bytes)
        .map_err(|e| MasterError::InternalError(format!("undecodable journal record: {e}")))?;
    match record.kind {
        Some(record::Kind::FrameworkAdded(framework)) => Ok(RegistryEvent::FrameworkAdded {
            id: FrameworkId::from(framework.id),
            info: FrameworkInfo {
                name: framework.name,
                user: framework.user,
                failover_timeout: Duration::from_secs_f64(framework.failover_timeout_secs),
            },
        }),
        Some(record::Kind::FrameworkRemoved(removed)) => Ok(RegistryEvent::FrameworkRemoved {
            id: FrameworkId::from(removed.id),
        }),
        Some(record::Kind::WorkerAdded(worker)) => Ok(RegistryEvent::WorkerAdded {
            id: WorkerId::from(worker.id),
            info: WorkerInfo {
                hostname: worker.hostname,
                port: worker.port as u16,
                resources: decode_resources(worker.resources),
            },
        }),
        Some(record::Kind::WorkerRemoved(removed)) => Ok(RegistryEvent::WorkerRemoved {
            id: WorkerId::from(removed.id),
        }),
        None => Err(MasterError::InternalError(
            "journal record with no payload".to_string(),
        )),
    }
}

fn encode_resources(resources: &Resources) -> Vec<PResource> {
    resources
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::Scalar(scalar) => presource::Value::Scalar(*scalar),
                Value::Ranges(ranges) => presource::Value::Ranges(PRanges {
                    ranges: ranges
                        .iter()
                        .map(|&(begin, end)| PRange { begin, end })
                        .collect(),
                }),
                Value::Set(items) => presource::Value::Set(PSet {
                    items: items.iter().cloned().collect(),
                }),
            };
            PResource {
                name: name.to_string(),
                value: Some(value),
            }
        })
        .collect()
}

fn decode_resources(resources: Vec<PResource>) -> Resources {
    let mut out = Resources::new();
    for resource in resources {
        out = match resource.value {
            Some(presource::Value::Scalar(scalar)) => out.with_scalar(&resource.name, scalar),
            Some(presource::Value::Ranges(ranges)) => out.with_ranges(
                &resource.name,
                ranges.ranges.into_iter().map(|r| (r.begin, r.end)).collect(),
            ),
            Some(presource::Value::Set(set)) => {
                out.with_set(&resource.name, set.items.into_iter().collect::<BTreeSet<_>>())
            }
            None => out,
        };
    }
    out
}

#[derive(Clone, PartialEq, Message)]
struct JournalRecord {
    #[prost(oneof = "record::Kind", tags = "1, 2, 3, 4")]
    kind: Option<record::Kind>,
}

mod record {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        FrameworkAdded(super::PFramework),
        #[prost(message, tag = "2")]
        FrameworkRemoved(super::PRemoved),
        #[prost(message, tag = "3")]
        WorkerAdded(super::PWorker),
        #[prost(message, tag = "4")]
        WorkerRemoved(super::PRemoved),
    }
}

#[derive(Clone, PartialEq, Message)]
struct PFramework {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "2")]
    name: String,
    #[prost(string, tag = "3")]
    user: String,
    #[prost(double, tag = "4")]
    failover_timeout_secs: f64,
}

#[derive(Clone, PartialEq, Message)]
struct PRemoved {
    #[prost(string, tag = "1")]
    id: String,
}

#[derive(Clone, PartialEq, Message)]
struct PWorker {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "2")]
    hostname: String,
    #[prost(uint32, tag = "3")]
    port: u32,
    #[prost(message, repeated, tag = "4")]
    resources: Vec<PResource>,
}

#[derive(Clone, PartialEq, Message)]
struct PResource {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(oneof = "presource::Value", tags = "2, 3, 4")]
    value: Option<presource::Value>,
}

mod presource {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "2")]
        Scalar(f64),
        #[prost(message, tag = "3")]
        Ranges(super::PRanges),
        #[prost(message, tag = "4")]
        Set(super::PSet),
    }
}

#[derive(Clone, PartialEq, Message)]
struct PRanges {
    #[prost(message, repeated, tag = "1")]
    ranges: Vec<PRange>,
}

#[derive(Clone, PartialEq, Message)]
struct PRange {
    #[prost(uint64, tag = "1")]
    begin: u64,
    #[prost(uint64, tag = "2")]
    end: u64,
}

#[derive(Clone, PartialEq, Message)]
struct PSet {
    #[prost(string, repeated, tag = "1")]
    items: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trip() {
        let event = RegistryEvent::WorkerAdded {
            id: WorkerId::from("202608011234-0"),
            info: WorkerInfo {
                hostname: "host1".to_string(),
                port: 5051,
                resources: Resources::cpus_mem(8.0, 16384.0)
                    .with_ranges("ports", vec![(31000, 32000)])
                    .with_set("disks", ["sda", "sdb"]),
            },
        };
        let decoded = decode(&encode(&event)).unwrap();
        let RegistryEvent::WorkerAdded { id, info } = decoded else {
            panic!("expected a worker addition");
        };
        assert_eq!(id, WorkerId::from("202608011234-0"));
        assert_eq!(info.hostname, "host1");
        assert_eq!(info.port, 5051);
        assert_eq!(info.resources.cpus(), 8.0);
        assert_eq!(
            info.resources.get("ports"),
            Some(&Value::Ranges(vec![(31000, 32000)]))
        );
    }

    #[test]
    fn test_framework_event_round_trip() {
        let event = RegistryEvent::FrameworkAdded {
            id: FrameworkId::from("epoch-1"),
            info: FrameworkInfo {
                name: "analytics".to_string(),
                user: "alice".to_string(),
                failover_timeout: Duration::from_secs(60),
            },
        };
        let decoded = decode(&encode(&event)).unwrap();
        let RegistryEvent::FrameworkAdded { id, info } = decoded else {
            panic!("expected a framework addition");
        };
        assert_eq!(id, FrameworkId::from("epoch-1"));
        assert_eq!(info.user, "alice");
        assert_eq!(info.failover_timeout, Duration::from_secs(60));
    }
}
