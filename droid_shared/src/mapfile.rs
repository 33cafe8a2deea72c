//! The identity map written next to every container.
//!
//! For every compiled type, field and method it records the stable scope key of the source
//! entity together with the name it was given inside the container. The compiler cache of the
//! next build uses it to find previous bodies and to translate the references inside them.
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAP_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MapFileError {
    #[error("cannot access map file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed map file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("map file version {found} is not supported, expected {expected}")]
    Version { found: u32, expected: u32 },
}

/// One source input of a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    pub name: String,
    pub scope: String,
    /// Hex encoded SHA-256 of the input
    pub content_hash: String,
    /// Modification time in seconds since the Unix epoch
    pub timestamp: u64,
}

/// Maps a code unit address of a compiled body back to the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub offset: u32,
    pub document: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodEntry {
    pub name: String,
    pub scope_key: String,
    pub dex_name: String,
    pub dex_signature: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<SourcePosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    pub scope_key: String,
    pub dex_name: String,
    pub dex_type: String,
}

/// What a class synthesized for a delegate was made from, in the compiler's own notation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateEntry {
    pub delegate_type: serde_json::Value,
    pub method: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub name: String,
    pub scope_key: String,
    /// Descriptor of the class inside the container
    pub dex_name: String,
    /// Name of the input that declares the type
    pub input: String,
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    pub methods: Vec<MethodEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<DelegateEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMap {
    pub version: u32,
    pub package: String,
    pub inputs: Vec<InputEntry>,
    pub types: Vec<TypeEntry>,
}

impl IdentityMap {
    pub fn new(package: impl Into<String>) -> IdentityMap {
        IdentityMap {
            version: MAP_VERSION,
            package: package.into(),
            inputs: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<IdentityMap, MapFileError> {
        let map: IdentityMap = serde_json::from_str(text)?;
        if map.version != MAP_VERSION {
            return Err(MapFileError::Version {
                found: map.version,
                expected: MAP_VERSION,
            });
        }
        Ok(map)
    }

    pub fn to_json(&self) -> Result<String, MapFileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<IdentityMap, MapFileError> {
        let text = std::fs::read_to_string(path)?;
        IdentityMap::from_json(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MapFileError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn input(&self, name: &str) -> Option<&InputEntry> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Puts inputs and types in a fixed order so that equal builds write equal maps
    pub fn sort(&mut self) {
        self.inputs.sort_by(|a, b| a.name.cmp(&b.name));
        self.types.sort_by(|a, b| a.scope_key.cmp(&b.scope_key));
        for entry in self.types.iter_mut() {
            entry.fields.sort_by(|a, b| a.scope_key.cmp(&b.scope_key));
            entry.methods.sort_by(|a, b| a.scope_key.cmp(&b.scope_key));
        }
    }
}

/// Read-only lookup tables over an identity map, by scope key and by container name
#[derive(Debug)]
pub struct IndexedMap {
    map: IdentityMap,
    types_by_scope: HashMap<String, usize>,
    types_by_dex: HashMap<String, usize>,
    fields_by_scope: HashMap<(String, String), (usize, usize)>,
    fields_by_dex: HashMap<(String, String), (usize, usize)>,
    methods_by_scope: HashMap<(String, String), (usize, usize)>,
    methods_by_dex: HashMap<(String, String, String), (usize, usize)>,
}

impl IndexedMap {
    pub fn new(map: IdentityMap) -> IndexedMap {
        let mut types_by_scope = HashMap::new();
        let mut types_by_dex = HashMap::new();
        let mut fields_by_scope = HashMap::new();
        let mut fields_by_dex = HashMap::new();
        let mut methods_by_scope = HashMap::new();
        let mut methods_by_dex = HashMap::new();
        for (type_index, entry) in map.types.iter().enumerate() {
            types_by_scope.insert(entry.scope_key.clone(), type_index);
            types_by_dex.insert(entry.dex_name.clone(), type_index);
            for (index, field) in entry.fields.iter().enumerate() {
                fields_by_scope.insert((entry.scope_key.clone(), field.scope_key.clone()), (type_index, index));
                fields_by_dex.insert((entry.dex_name.clone(), field.dex_name.clone()), (type_index, index));
            }
            for (index, method) in entry.methods.iter().enumerate() {
                methods_by_scope.insert((entry.scope_key.clone(), method.scope_key.clone()), (type_index, index));
                methods_by_dex.insert(
                    (entry.dex_name.clone(), method.dex_name.clone(), method.dex_signature.clone()),
                    (type_index, index),
                );
            }
        }
        IndexedMap {
            map,
            types_by_scope,
            types_by_dex,
            fields_by_scope,
            fields_by_dex,
            methods_by_scope,
            methods_by_dex,
        }
    }

    pub fn map(&self) -> &IdentityMap {
        &self.map
    }

    pub fn type_by_scope(&self, scope_key: &str) -> Option<&TypeEntry> {
        self.types_by_scope.get(scope_key).map(|i| &self.map.types[*i])
    }

    pub fn type_by_dex(&self, descriptor: &str) -> Option<&TypeEntry> {
        self.types_by_dex.get(descriptor).map(|i| &self.map.types[*i])
    }

    pub fn field_by_scope(&self, type_scope: &str, field_scope: &str) -> Option<(&TypeEntry, &FieldEntry)> {
        let (t, f) = self
            .fields_by_scope
            .get(&(type_scope.to_string(), field_scope.to_string()))?;
        let entry = &self.map.types[*t];
        Some((entry, &entry.fields[*f]))
    }

    pub fn field_by_dex(&self, owner: &str, name: &str) -> Option<(&TypeEntry, &FieldEntry)> {
        let (t, f) = self.fields_by_dex.get(&(owner.to_string(), name.to_string()))?;
        let entry = &self.map.types[*t];
        Some((entry, &entry.fields[*f]))
    }

    pub fn method_by_scope(&self, type_scope: &str, method_scope: &str) -> Option<(&TypeEntry, &MethodEntry)> {
        let (t, m) = self
            .methods_by_scope
            .get(&(type_scope.to_string(), method_scope.to_string()))?;
        let entry = &self.map.types[*t];
        Some((entry, &entry.methods[*m]))
    }

    pub fn method_by_dex(&self, owner: &str, name: &str, signature: &str) -> Option<(&TypeEntry, &MethodEntry)> {
        let (t, m) = self
            .methods_by_dex
            .get(&(owner.to_string(), name.to_string(), signature.to_string()))?;
        let entry = &self.map.types[*t];
        Some((entry, &entry.methods[*m]))
    }
}
