//! Message type registry.
//!
//! Every payload on the wire is a varint registry id followed by the bitcode
//! encoding of the value. Both peers must register the same types in the same
//! order; the framework messages occupy the first ids.

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    sync::Arc,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::SerializeError,
    frame::{read_varint, write_varint},
    msg::{Ping, RegisterTcp, RegisterUdp},
};

/// A decoded message as handed to listeners. Downcast with
/// [`Object::downcast_ref`].
pub type Object = Arc<dyn Any + Send + Sync>;

/// Anything that can travel through the registry.
pub trait Message: Serialize + DeserializeOwned + Any + Send + Sync {}
impl<T: Serialize + DeserializeOwned + Any + Send + Sync> Message for T {}

struct Entry {
    type_name: &'static str,
    decode: fn(&[u8]) -> Result<Object, SerializeError>,
}

/// Maps registered message types to stable wire ids.
///
/// [`Registry::new`] claims the leading ids for the handshake and ping
/// messages; application types follow in registration order.
pub struct Registry {
    ids: HashMap<TypeId, u32>,
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self { ids: HashMap::new(), entries: Vec::new() };
        registry.register::<RegisterTcp>();
        registry.register::<RegisterUdp>();
        registry.register::<Ping>();
        registry
    }

    /// Registers `M`, assigning it the next id. Registering the same type
    /// twice keeps the original id.
    pub fn register<M: Message>(&mut self) -> u32 {
        if let Some(&id) = self.ids.get(&TypeId::of::<M>()) {
            return id;
        }
        let id = self.entries.len() as u32;
        self.entries.push(Entry { type_name: type_name::<M>(), decode: decode_value::<M> });
        self.ids.insert(TypeId::of::<M>(), id);
        id
    }

    /// Number of registered types, framework messages included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends the encoded form of `msg` (id prefix + bitcode bytes).
    pub fn encode<M: Message>(&self, msg: &M, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        let Some(&id) = self.ids.get(&TypeId::of::<M>()) else {
            return Err(SerializeError::Unregistered(type_name::<M>()));
        };
        write_varint(out, id);
        let bytes = bitcode::serialize(msg)
            .map_err(|source| SerializeError::Encode { type_name: type_name::<M>(), source })?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    /// Decodes one payload back into an [`Object`].
    pub fn decode(&self, payload: &[u8]) -> Result<Object, SerializeError> {
        let Ok(Some((id, used))) = read_varint(payload) else {
            return Err(SerializeError::BadPrefix);
        };
        let Some(entry) = self.entries.get(id as usize) else {
            return Err(SerializeError::UnknownId(id));
        };
        (entry.decode)(&payload[used..])
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_value<M: Message>(bytes: &[u8]) -> Result<Object, SerializeError> {
    let value: M = bitcode::deserialize(bytes)
        .map_err(|source| SerializeError::Decode { type_name: type_name::<M>(), source })?;
    Ok(Arc::new(value))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    #[test]
    fn round_trips_registered_type() {
        let mut registry = Registry::new();
        registry.register::<Note>();

        let mut payload = Vec::new();
        registry.encode(&Note { text: "hi".into() }, &mut payload).unwrap();
        let object = registry.decode(&payload).unwrap();
        assert_eq!(object.downcast_ref::<Note>(), Some(&Note { text: "hi".into() }));
    }

    #[test]
    fn rejects_unregistered_type_and_unknown_id() {
        let registry = Registry::new();
        let mut payload = Vec::new();
        let err = registry.encode(&Note { text: String::new() }, &mut payload).unwrap_err();
        assert!(matches!(err, SerializeError::Unregistered(_)));

        let err = registry.decode(&[0x7f]).unwrap_err();
        assert!(matches!(err, SerializeError::UnknownId(127)));
    }

    #[test]
    fn duplicate_registration_keeps_id() {
        let mut registry = Registry::new();
        let first = registry.register::<Note>();
        let len = registry.len();
        assert_eq!(registry.register::<Note>(), first);
        assert_eq!(registry.len(), len);
    }
}
