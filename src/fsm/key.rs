//! Resource names and the bucket paths derived from them.
//!
//! A resource name `[prn:]partition:service:region:account:type/id[/sub..]`
//! maps every non-empty field to one nested bucket; the last `/` segment of the
//! resource id is the leaf key. Keys may also be given directly in slash form,
//! `/bucket/.../leaf`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Deepest bucket nesting accepted.
pub const MAX_KEY_DEPTH: usize = 25;
/// Fewest path components (buckets plus leaf) accepted.
pub const MIN_KEY_SEGMENTS: usize = 5;
/// Longest key accepted, measured in its slash form.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;
/// Optional scheme; only recognised when all five fields follow it, so `prn`
/// stays usable as a partition name.
pub const RESOURCE_SCHEME: &str = "prn";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("key contains a NUL byte")]
    NulByte,
    #[error("resource name needs partition:service:region:account:type/id, got {fields} fields")]
    MissingFields { fields: usize },
    #[error("resource name has no resource id")]
    MissingResourceId,
    #[error("empty path segment at position {position}")]
    EmptySegment { position: usize },
    #[error("leaf key is empty")]
    EmptyLeaf,
    #[error("key has {components} path components, at least {min} required")]
    TooShallow { components: usize, min: usize },
    #[error("key nests {depth} buckets, at most {max} allowed")]
    TooDeep { depth: usize, max: usize },
    #[error("key is {len} bytes long, at most {max} allowed")]
    TooLong { len: usize, max: usize },
}

/// Validated bucket path plus the leaf key inside the innermost bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    buckets: Vec<String>,
    leaf: String,
}

impl KeyPath {
    pub fn new(buckets: Vec<String>, leaf: impl Into<String>) -> Result<Self, KeyError> {
        let leaf = leaf.into();
        if leaf.is_empty() {
            return Err(KeyError::EmptyLeaf);
        }
        if leaf.contains('\0') {
            return Err(KeyError::NulByte);
        }
        for (position, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                return Err(KeyError::EmptySegment { position });
            }
            if bucket.contains('\0') {
                return Err(KeyError::NulByte);
            }
        }
        if buckets.len() > MAX_KEY_DEPTH {
            return Err(KeyError::TooDeep {
                depth: buckets.len(),
                max: MAX_KEY_DEPTH,
            });
        }
        let components = buckets.len() + 1;
        if components < MIN_KEY_SEGMENTS {
            return Err(KeyError::TooShallow {
                components,
                min: MIN_KEY_SEGMENTS,
            });
        }
        let len = buckets.iter().map(|bucket| bucket.len() + 1).sum::<usize>() + 1 + leaf.len();
        if len > MAX_KEY_LEN {
            return Err(KeyError::TooLong {
                len,
                max: MAX_KEY_LEN,
            });
        }
        Ok(Self { buckets, leaf })
    }

    /// Accepts either a resource name or a `/`-prefixed slash path.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key.starts_with('/') {
            Self::parse_slash(key)
        } else {
            ResourceName::parse(key)?.key_path()
        }
    }

    fn parse_slash(key: &str) -> Result<Self, KeyError> {
        let mut segments: Vec<String> = key[1..].split('/').map(str::to_string).collect();
        let leaf = segments.pop().unwrap_or_default();
        Self::new(segments, leaf)
    }

    pub fn buckets(&self) -> &[String] {
        &self.buckets
    }

    pub fn leaf(&self) -> &str {
        &self.leaf
    }

    pub fn depth(&self) -> usize {
        self.buckets.len()
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bucket in &self.buckets {
            write!(f, "/{bucket}")?;
        }
        write!(f, "/{}", self.leaf)
    }
}

impl FromStr for KeyPath {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource_type: String,
    /// May contain `/` to address nested sub-resources.
    pub resource_id: String,
}

impl ResourceName {
    pub fn parse(name: &str) -> Result<Self, KeyError> {
        if name.is_empty() {
            return Err(KeyError::Empty);
        }
        let head = name.split('/').next().unwrap_or(name);
        let scheme_less = name
            .strip_prefix(RESOURCE_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'));
        let body = match scheme_less {
            Some(rest) if head.matches(':').count() >= 5 => rest,
            _ => name,
        };
        let fields: Vec<&str> = body.splitn(5, ':').collect();
        if fields.len() < 5 {
            return Err(KeyError::MissingFields {
                fields: fields.len(),
            });
        }
        let Some((resource_type, resource_id)) = fields[4].split_once('/') else {
            return Err(KeyError::MissingResourceId);
        };
        if resource_id.is_empty() {
            return Err(KeyError::MissingResourceId);
        }
        Ok(Self {
            partition: fields[0].to_string(),
            service: fields[1].to_string(),
            region: fields[2].to_string(),
            account_id: fields[3].to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        })
    }

    pub fn key_path(&self) -> Result<KeyPath, KeyError> {
        let mut buckets: Vec<String> = [
            &self.partition,
            &self.service,
            &self.region,
            &self.account_id,
            &self.resource_type,
        ]
        .into_iter()
        .filter(|field| !field.is_empty())
        .cloned()
        .collect();
        let mut id_segments: Vec<&str> = self.resource_id.split('/').collect();
        let leaf = id_segments.pop().unwrap_or_default();
        for segment in id_segments {
            if segment.is_empty() {
                return Err(KeyError::EmptySegment {
                    position: buckets.len(),
                });
            }
            buckets.push(segment.to_string());
        }
        KeyPath::new(buckets, leaf)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{RESOURCE_SCHEME}:{}:{}:{}:{}:{}/{}",
            self.partition,
            self.service,
            self.region,
            self.account_id,
            self.resource_type,
            self.resource_id
        )
    }
}

impl FromStr for ResourceName {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
