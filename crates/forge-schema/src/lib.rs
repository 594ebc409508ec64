//! Reflective, read-only view over modeled shapes (component C3).
//!
//! The runtime never builds shape graphs itself — it only *queries* one
//! supplied by a code-generated or hand-assembled model (see
//! [`SchemaIndex`], the external collaborator of §6.1). Recursive shape
//! graphs are represented as an arena of [`Schema`] values addressed by
//! [`ShapeId`], with member targets resolved through the arena rather than
//! owned pointers, so a structure can reference itself without a cycle in
//! the Rust ownership graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A fully qualified shape identifier: `namespace#name`, optionally suffixed
/// with `$member` for a member reference. Equality is plain string equality
/// over the canonical form, matching the source model's identifier
/// semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(String);

#[derive(Debug, thiserror::Error)]
pub enum ShapeIdError {
    #[error("shape id '{0}' is missing the '#' namespace separator")]
    MissingNamespaceSeparator(String),
}

impl ShapeId {
    pub fn new(namespace: &str, name: &str) -> Self {
        ShapeId(format!("{namespace}#{name}"))
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, ShapeIdError> {
        let s = s.into();
        if !s.splitn(2, '$').next().unwrap_or("").contains('#') {
            return Err(ShapeIdError::MissingNamespaceSeparator(s));
        }
        Ok(ShapeId(s))
    }

    /// A new id referring to `member` of this shape.
    pub fn member(&self, member: &str) -> ShapeId {
        let base = self.0.splitn(2, '$').next().unwrap();
        ShapeId(format!("{base}${member}"))
    }

    pub fn namespace(&self) -> &str {
        self.0.split('#').next().unwrap_or("")
    }

    /// The shape name, excluding any `$member` suffix.
    pub fn name(&self) -> &str {
        let after_hash = self.0.split('#').nth(1).unwrap_or("");
        after_hash.split('$').next().unwrap_or("")
    }

    pub fn member_name(&self) -> Option<&str> {
        self.0.split('$').nth(1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The shape of a shape: what kind of value it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Structure,
    Union,
    List,
    Map,
    Set,
    String,
    Enum,
    IntEnum,
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    BigInteger,
    Float,
    Double,
    BigDecimal,
    Blob,
    Timestamp,
    Document,
    Service,
    Resource,
    Operation,
}

/// The standard trait vocabulary the runtime inspects (§3), plus an escape
/// hatch for traits it does not special-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TraitId {
    Http,
    HttpLabel,
    HttpHeader,
    HttpQuery,
    HttpPayload,
    HttpPrefixHeaders,
    HttpQueryParams,
    XmlName,
    XmlAttribute,
    XmlFlattened,
    XmlNamespace,
    JsonName,
    TimestampFormat,
    Required,
    Default,
    Endpoint,
    HostLabel,
    Error,
    HttpError,
    Retryable,
    Idempotent,
    Readonly,
    IdempotencyToken,
    Streaming,
    Pagination,
    Auth,
    Sigv4,
    HttpApiKey,
    HttpBearer,
    HttpDigest,
    HttpBasic,
    EventStream,
    Custom(ShapeId),
}

impl TraitId {
    /// A bit position in the hot-path vocabulary bitset, or `None` for
    /// [`TraitId::Custom`] traits, which fall back to a hash lookup.
    const fn bit(&self) -> Option<u32> {
        use TraitId::*;
        Some(match self {
            Http => 0,
            HttpLabel => 1,
            HttpHeader => 2,
            HttpQuery => 3,
            HttpPayload => 4,
            HttpPrefixHeaders => 5,
            HttpQueryParams => 6,
            XmlName => 7,
            XmlAttribute => 8,
            XmlFlattened => 9,
            XmlNamespace => 10,
            JsonName => 11,
            TimestampFormat => 12,
            Required => 13,
            Default => 14,
            Endpoint => 15,
            HostLabel => 16,
            Error => 17,
            HttpError => 18,
            Retryable => 19,
            Idempotent => 20,
            Readonly => 21,
            IdempotencyToken => 22,
            Streaming => 23,
            Pagination => 24,
            Auth => 25,
            Sigv4 => 26,
            HttpApiKey => 27,
            HttpBearer => 28,
            HttpDigest => 29,
            HttpBasic => 30,
            EventStream => 31,
            Custom(_) => return None,
        })
    }
}

/// An opaque trait payload. Structured enough for the runtime's own
/// decisions (http bindings, retry hints, pagination) without pulling in a
/// full value-model dependency — protocol codecs interpret richer trait
/// values on their own terms.
#[derive(Debug, Clone, PartialEq)]
pub enum TraitValue {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<TraitValue>),
    Map(Vec<(String, TraitValue)>),
}

impl TraitValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TraitValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TraitValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&TraitValue> {
        match self {
            TraitValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Direct-vs-inherited trait storage for one shape, with an O(1) bitset
/// fast path over the standard vocabulary (Design Notes: "trait lookup
/// micro-optimization").
#[derive(Debug, Clone, Default)]
pub struct TraitMap {
    direct: HashMap<TraitId, TraitValue>,
    inherited: HashMap<TraitId, TraitValue>,
    direct_bits: u64,
    effective_bits: u64,
}

impl TraitMap {
    pub fn builder() -> TraitMapBuilder {
        TraitMapBuilder::default()
    }

    pub fn has_trait(&self, id: &TraitId) -> bool {
        match id.bit() {
            Some(bit) => self.effective_bits & (1 << bit) != 0,
            None => self.direct.contains_key(id) || self.inherited.contains_key(id),
        }
    }

    pub fn get_trait(&self, id: &TraitId) -> Option<&TraitValue> {
        self.direct.get(id).or_else(|| self.inherited.get(id))
    }

    pub fn get_direct_trait(&self, id: &TraitId) -> Option<&TraitValue> {
        self.direct.get(id)
    }

    pub fn is_direct(&self, id: &TraitId) -> bool {
        match id.bit() {
            Some(bit) => self.direct_bits & (1 << bit) != 0,
            None => self.direct.contains_key(id),
        }
    }
}

#[derive(Default)]
pub struct TraitMapBuilder {
    direct: HashMap<TraitId, TraitValue>,
    inherited: HashMap<TraitId, TraitValue>,
}

impl TraitMapBuilder {
    pub fn direct(mut self, id: TraitId, value: TraitValue) -> Self {
        self.direct.insert(id, value);
        self
    }

    pub fn inherited(mut self, id: TraitId, value: TraitValue) -> Self {
        self.inherited.insert(id, value);
        self
    }

    pub fn build(self) -> TraitMap {
        let mut direct_bits = 0u64;
        let mut effective_bits = 0u64;
        for id in self.direct.keys() {
            if let Some(bit) = id.bit() {
                direct_bits |= 1 << bit;
                effective_bits |= 1 << bit;
            }
        }
        for id in self.inherited.keys() {
            if let Some(bit) = id.bit() {
                effective_bits |= 1 << bit;
            }
        }
        TraitMap {
            direct: self.direct,
            inherited: self.inherited,
            direct_bits,
            effective_bits,
        }
    }
}

/// One member of a structure, union, list, or map shape.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub target: ShapeId,
    pub index: usize,
    pub traits: TraitMap,
}

/// Operation-only metadata: input/output shapes, the auth schemes effective
/// for this operation (in priority order), and whether it carries an
/// event-stream member.
#[derive(Debug, Clone, Default)]
pub struct OperationInfo {
    pub input_schema: Option<ShapeId>,
    pub output_schema: Option<ShapeId>,
    pub effective_auth_schemes: Vec<TraitId>,
    pub event_stream_member: Option<String>,
}

/// An immutable description of one modeled shape.
#[derive(Debug, Clone)]
pub struct Schema {
    id: ShapeId,
    kind: ShapeKind,
    members: Vec<Member>,
    member_index: HashMap<String, usize>,
    traits: TraitMap,
    operation: Option<OperationInfo>,
}

impl Schema {
    pub fn id(&self) -> &ShapeId {
        &self.id
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.member_index.get(name).map(|&i| &self.members[i])
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.member_index.get(name).copied()
    }

    pub fn has_trait(&self, id: &TraitId) -> bool {
        self.traits.has_trait(id)
    }

    pub fn get_trait(&self, id: &TraitId) -> Option<&TraitValue> {
        self.traits.get_trait(id)
    }

    pub fn get_direct_trait(&self, id: &TraitId) -> Option<&TraitValue> {
        self.traits.get_direct_trait(id)
    }

    pub fn operation(&self) -> Option<&OperationInfo> {
        self.operation.as_ref()
    }
}

pub struct SchemaBuilder {
    id: ShapeId,
    kind: ShapeKind,
    members: Vec<Member>,
    traits: TraitMap,
    operation: Option<OperationInfo>,
}

impl SchemaBuilder {
    pub fn new(id: ShapeId, kind: ShapeKind) -> Self {
        SchemaBuilder {
            id,
            kind,
            members: Vec::new(),
            traits: TraitMap::default(),
            operation: None,
        }
    }

    pub fn member(mut self, name: impl Into<String>, target: ShapeId, traits: TraitMap) -> Self {
        let index = self.members.len();
        self.members.push(Member {
            name: name.into(),
            target,
            index,
            traits,
        });
        self
    }

    pub fn traits(mut self, traits: TraitMap) -> Self {
        self.traits = traits;
        self
    }

    pub fn operation(mut self, info: OperationInfo) -> Self {
        self.operation = Some(info);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut member_index = HashMap::with_capacity(self.members.len());
        for member in &self.members {
            if member_index.insert(member.name.clone(), member.index).is_some() {
                return Err(SchemaError::DuplicateMember {
                    shape: self.id.clone(),
                    member: member.name.clone(),
                });
            }
        }
        Ok(Schema {
            id: self.id,
            kind: self.kind,
            members: self.members,
            member_index,
            traits: self.traits,
            operation: self.operation,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("shape '{shape}' declares member '{member}' more than once")]
    DuplicateMember { shape: ShapeId, member: String },
    #[error("unknown shape id: {0}")]
    NotFound(ShapeId),
}

impl From<SchemaError> for forge_error::RuntimeError {
    fn from(err: SchemaError) -> Self {
        forge_error::RuntimeError::new(forge_error::ErrorKind::CallValidation, err.to_string())
            .with_cause(err)
    }
}

/// §6.1 external collaborator: a read-only index from [`ShapeId`] to
/// [`Schema`]. The runtime only ever calls `get`; it never constructs
/// schemas itself.
pub trait SchemaIndex: Send + Sync {
    fn get(&self, id: &ShapeId) -> Option<Arc<Schema>>;
}

/// §6.1 external collaborator: produces a builder capable of assembling a
/// polymorphic shape (a union variant or a modeled error) during
/// deserialization. The runtime treats the returned builder opaquely and
/// hands it to the protocol's [`crate`]-external `Codec`.
pub trait TypeRegistry: Send + Sync {
    fn new_builder(&self, id: &ShapeId) -> Option<Box<dyn ShapeBuilder>>;
}

pub trait ShapeBuilder: std::any::Any + Send {
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// An arena-backed [`SchemaIndex`]: shapes are built once, stored by value,
/// and referenced by [`ShapeId`] rather than by pointer, so recursive shape
/// graphs (a structure that contains itself, directly or through a union)
/// never need an owning cycle.
#[derive(Default)]
pub struct SchemaArena {
    schemas: Vec<Arc<Schema>>,
    by_id: HashMap<ShapeId, usize>,
}

impl SchemaArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: Schema) -> &ShapeId {
        let id = schema.id().clone();
        let index = self.schemas.len();
        self.schemas.push(Arc::new(schema));
        self.by_id.insert(id, index);
        &self.schemas[index].id
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl SchemaIndex for SchemaArena {
    fn get(&self, id: &ShapeId) -> Option<Arc<Schema>> {
        self.by_id.get(id).map(|&i| self.schemas[i].clone())
    }
}
