//! Type registration
//!
//! The store has no built-in knowledge of value types. At open time the caller
//! registers an encoder/decoder pair per type; each pair is filed under a
//! [`TypeTag`] that is persisted with every `Set` record so replay can find
//! the right decoder again.
//!
//! Values travel through the store type-erased as [`AnyValue`]. The erased
//! encoder checks the concrete type before encoding and reports a mismatch
//! as an error rather than aborting.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// A type-erased, shareable value as held in the cache
pub type AnyValue = Arc<dyn Any + Send + Sync>;

type EncodeFn = dyn Fn(&(dyn Any + Send + Sync)) -> StoreResult<Vec<u8>> + Send + Sync;
type DecodeFn = dyn Fn(&[u8]) -> StoreResult<AnyValue> + Send + Sync;

/// Stable string identifier of a registered value type
///
/// Defaults to the fully-qualified Rust type name. Renaming a registered type
/// changes its default tag and orphans records written under the old one;
/// use [`RegistryBuilder::register_named`] to pin a tag across renames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    /// Create a tag from an explicit name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Default tag for a Rust type
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(type_name::<T>().to_string())
    }

    /// The tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoder/decoder pair for one registered type
pub struct Codec {
    tag: TypeTag,
    type_name: &'static str,
    encode: Box<EncodeFn>,
    decode: Box<DecodeFn>,
}

impl Codec {
    /// Tag this codec is registered under
    pub fn tag(&self) -> &TypeTag {
        &self.tag
    }

    /// Rust type name of the values this codec handles
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Encode a type-erased value
    pub fn encode(&self, value: &(dyn Any + Send + Sync)) -> StoreResult<Vec<u8>> {
        (self.encode)(value)
    }

    /// Decode bytes into a type-erased value
    pub fn decode(&self, bytes: &[u8]) -> StoreResult<AnyValue> {
        (self.decode)(bytes)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Closed table of codecs, fixed once the store is open
#[derive(Debug, Default)]
pub struct Registry {
    by_tag: HashMap<TypeTag, Arc<Codec>>,
    by_type: HashMap<TypeId, TypeTag>,
}

impl Registry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Tag registered for the Rust type `T`
    pub fn tag_for<T: 'static>(&self) -> StoreResult<&TypeTag> {
        self.by_type
            .get(&TypeId::of::<T>())
            .ok_or_else(|| StoreError::NoEncoderFound(type_name::<T>().to_string()))
    }

    /// Codec able to decode records carrying `tag`
    pub fn decoder(&self, tag: &TypeTag) -> StoreResult<&Arc<Codec>> {
        self.by_tag
            .get(tag)
            .ok_or_else(|| StoreError::NoDecoderFound(tag.clone()))
    }

    /// Codec able to encode values cached under `tag`
    pub fn encoder(&self, tag: &TypeTag) -> StoreResult<&Arc<Codec>> {
        self.by_tag
            .get(tag)
            .ok_or_else(|| StoreError::NoEncoderFound(tag.to_string()))
    }

    /// Whether a codec exists for `tag`
    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Registered tags, sorted
    pub fn tags(&self) -> Vec<&TypeTag> {
        let mut tags: Vec<_> = self.by_tag.keys().collect();
        tags.sort();
        tags
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    /// Whether nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

/// Collects codec registrations before the store opens
#[derive(Default)]
pub struct RegistryBuilder {
    by_tag: HashMap<TypeTag, Arc<Codec>>,
    by_type: HashMap<TypeId, TypeTag>,
    conflicts: Vec<String>,
}

impl RegistryBuilder {
    /// Register `T` under its default tag with explicit encode/decode functions
    pub fn register<T, E, D>(&mut self, encode: E, decode: D) -> &mut Self
    where
        T: Send + Sync + 'static,
        E: Fn(&T) -> StoreResult<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> StoreResult<T> + Send + Sync + 'static,
    {
        self.register_named(TypeTag::of::<T>(), encode, decode)
    }

    /// Register `T` under an explicit tag
    pub fn register_named<T, E, D>(&mut self, tag: TypeTag, encode: E, decode: D) -> &mut Self
    where
        T: Send + Sync + 'static,
        E: Fn(&T) -> StoreResult<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> StoreResult<T> + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();

        if let Some(existing) = self.by_tag.get(&tag)
            && existing.type_name != type_name::<T>()
        {
            self.conflicts.push(format!(
                "tag {} registered for both {} and {}",
                tag,
                existing.type_name,
                type_name::<T>()
            ));
            return self;
        }

        // Re-registering a type under a new tag drops the old one
        if let Some(previous) = self.by_type.insert(type_id, tag.clone())
            && previous != tag
        {
            self.by_tag.remove(&previous);
        }

        let codec = Codec {
            tag: tag.clone(),
            type_name: type_name::<T>(),
            encode: Box::new(move |value: &(dyn Any + Send + Sync)| {
                match value.downcast_ref::<T>() {
                    Some(value) => encode(value),
                    None => Err(StoreError::serialization(format!(
                        "value is not a {}",
                        type_name::<T>()
                    ))),
                }
            }),
            decode: Box::new(move |bytes: &[u8]| {
                decode(bytes).map(|value| Arc::new(value) as AnyValue)
            }),
        };

        debug!(tag = %tag, type_name = type_name::<T>(), "Registered codec");
        self.by_tag.insert(tag, Arc::new(codec));
        self
    }

    /// Register `T` with a JSON codec
    pub fn register_json<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register::<T, _, _>(
            |value| serde_json::to_vec(value).map_err(|e| StoreError::serialization(e.to_string())),
            |bytes| serde_json::from_slice(bytes).map_err(StoreError::from),
        )
    }

    /// Register `T` with a compact postcard codec
    pub fn register_postcard<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register::<T, _, _>(
            |value| {
                postcard::to_allocvec(value).map_err(|e| StoreError::serialization(e.to_string()))
            },
            |bytes| postcard::from_bytes(bytes).map_err(StoreError::from),
        )
    }

    /// Freeze the registrations
    ///
    /// Fails if one tag was claimed by two different types.
    pub fn build(self) -> StoreResult<Registry> {
        if !self.conflicts.is_empty() {
            return Err(StoreError::InvalidConfig(self.conflicts.join("; ")));
        }
        Ok(Registry {
            by_tag: self.by_tag,
            by_type: self.by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: u64,
        handle: String,
    }

    #[test]
    fn test_default_tag_is_type_name() {
        assert_eq!(TypeTag::of::<String>().as_str(), type_name::<String>());
        assert_ne!(TypeTag::of::<String>(), TypeTag::of::<u64>());
    }

    #[test]
    fn test_json_codec_round_trip() {
        let mut builder = Registry::builder();
        builder.register_json::<Account>();
        let registry = builder.build().unwrap();

        let tag = registry.tag_for::<Account>().unwrap().clone();
        let codec = registry.encoder(&tag).unwrap();
        let account = Account {
            id: 7,
            handle: "@ferris".into(),
        };

        let bytes = codec.encode(&account).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Account>(), Some(&account));
    }

    #[test]
    fn test_postcard_codec_round_trip() {
        let mut builder = Registry::builder();
        builder.register_postcard::<Vec<u32>>();
        let registry = builder.build().unwrap();

        let tag = TypeTag::of::<Vec<u32>>();
        let codec = registry.decoder(&tag).unwrap();
        let bytes = codec.encode(&vec![1u32, 2, 3]).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Vec<u32>>(), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn test_encode_wrong_type_is_error() {
        let mut builder = Registry::builder();
        builder.register_json::<String>();
        let registry = builder.build().unwrap();

        let codec = registry.encoder(&TypeTag::of::<String>()).unwrap();
        let result = codec.encode(&42u64);
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_missing_codecs() {
        let registry = Registry::builder().build().unwrap();
        let tag = TypeTag::new("missing");

        assert!(matches!(
            registry.decoder(&tag),
            Err(StoreError::NoDecoderFound(_))
        ));
        assert!(matches!(
            registry.encoder(&tag),
            Err(StoreError::NoEncoderFound(_))
        ));
        assert!(matches!(
            registry.tag_for::<String>(),
            Err(StoreError::NoEncoderFound(_))
        ));
    }

    #[test]
    fn test_named_tag_survives_rename() {
        let mut builder = Registry::builder();
        builder.register_named::<Account, _, _>(
            TypeTag::new("account.v1"),
            |value| {
                serde_json::to_vec(value).map_err(|e| StoreError::serialization(e.to_string()))
            },
            |bytes| serde_json::from_slice(bytes).map_err(StoreError::from),
        );
        let registry = builder.build().unwrap();

        assert_eq!(registry.tag_for::<Account>().unwrap().as_str(), "account.v1");
        assert!(registry.contains(&TypeTag::new("account.v1")));
        assert!(!registry.contains(&TypeTag::of::<Account>()));
    }

    #[test]
    fn test_reregister_replaces_tag() {
        let mut builder = Registry::builder();
        builder.register_json::<String>();
        builder.register_named::<String, _, _>(
            TypeTag::new("text"),
            |value| Ok(value.as_bytes().to_vec()),
            |bytes| {
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| StoreError::deserialization(e.to_string()))
            },
        );
        let registry = builder.build().unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tag_for::<String>().unwrap().as_str(), "text");
    }

    #[test]
    fn test_conflicting_tag_rejected() {
        let mut builder = Registry::builder();
        builder.register_named::<String, _, _>(
            TypeTag::new("shared"),
            |value| Ok(value.as_bytes().to_vec()),
            |bytes| {
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| StoreError::deserialization(e.to_string()))
            },
        );
        builder.register_named::<u64, _, _>(
            TypeTag::new("shared"),
            |value| Ok(value.to_le_bytes().to_vec()),
            |_| Ok(0),
        );

        assert!(matches!(builder.build(), Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_tags_and_codec_metadata() {
        let mut builder = Registry::builder();
        builder.register_json::<u64>();
        builder.register_json::<Account>();
        let registry = builder.build().unwrap();

        let mut expected = vec![TypeTag::of::<u64>(), TypeTag::of::<Account>()];
        expected.sort();
        let tags: Vec<TypeTag> = registry.tags().into_iter().cloned().collect();
        assert_eq!(tags, expected);

        let codec = registry.decoder(&TypeTag::of::<Account>()).unwrap();
        assert_eq!(codec.tag(), &TypeTag::of::<Account>());
        assert_eq!(codec.type_name(), type_name::<Account>());
    }
}
