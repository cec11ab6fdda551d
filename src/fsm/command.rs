use crate::wire::{MessageError, PayloadReader, PayloadWriter, WireMessage};

const PUT_TAG: u8 = 1;
const DELETE_TAG: u8 = 2;

/// Mutation carried in a committed log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KvCommand {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            KvCommand::Put { key, .. } | KvCommand::Delete { key } => key,
        }
    }
}

impl WireMessage for KvCommand {
    const NAME: &'static str = "kv_command";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        match self {
            KvCommand::Put { key, value } => PayloadWriter::versioned(Self::NAME, 7 + key.len() + value.len())
                .u8(PUT_TAG)
                .string("key", key)
                .bytes("value", value)
                .finish(),
            KvCommand::Delete { key } => PayloadWriter::versioned(Self::NAME, 3 + key.len())
                .u8(DELETE_TAG)
                .string("key", key)
                .finish(),
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let command = match reader.u8()? {
            PUT_TAG => KvCommand::Put {
                key: reader.string("key")?,
                value: reader.bytes()?,
            },
            DELETE_TAG => KvCommand::Delete {
                key: reader.string("key")?,
            },
            other => return Err(reader.unknown("tag", other as u64)),
        };
        reader.finish()?;
        Ok(command)
    }
}

/// Read-only query served by `lookup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupQuery {
    Get { key: String },
    AppliedIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Value(Option<Vec<u8>>),
    AppliedIndex(u64),
}

/// Per-entry result recorded in `SmResult::data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Written { bytes: u64 },
    Deleted { existed: bool },
    /// The entry could not be applied; every replica rejects it the same way.
    Rejected { reason: String },
}

impl WireMessage for ApplyOutcome {
    const NAME: &'static str = "apply_outcome";

    fn encode(&self) -> Result<Vec<u8>, MessageError> {
        match self {
            ApplyOutcome::Written { bytes } => PayloadWriter::versioned(Self::NAME, 9).u8(1).u64(*bytes).finish(),
            ApplyOutcome::Deleted { existed } => {
                PayloadWriter::versioned(Self::NAME, 2).u8(2).bool(*existed).finish()
            }
            ApplyOutcome::Rejected { reason } => PayloadWriter::versioned(Self::NAME, 3 + reason.len())
                .u8(3)
                .string("reason", reason)
                .finish(),
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = PayloadReader::versioned(bytes, Self::NAME)?;
        let outcome = match reader.u8()? {
            1 => ApplyOutcome::Written {
                bytes: reader.u64()?,
            },
            2 => ApplyOutcome::Deleted {
                existed: reader.bool()?,
            },
            3 => ApplyOutcome::Rejected {
                reason: reader.string("reason")?,
            },
            other => return Err(reader.unknown("outcome", other as u64)),
        };
        reader.finish()?;
        Ok(outcome)
    }
}
