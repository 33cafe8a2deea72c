//! Reuses method bodies of the previous build.
//!
//! The previous container and its identity map are loaded once, before any worker starts, and
//! are only read afterwards. A body is reused when its input is unchanged and every internal
//! reference inside it can be translated into the names of the current build. Delegate instance
//! classes a reused body refers to are requested again, as compiling the body would have done.
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use droid_shared::bytecode::{DebugPosition, MethodBody, Operand};
use droid_shared::dexfile::{reader, DexFile};
use droid_shared::mapfile::{IdentityMap, IndexedMap, SourcePosition};
use droid_shared::{ClassReference, FieldReference, MethodReference, Prototype, TypeReference};

use crate::backend::pre_compilation::delegates::{DelegateInstance, INSTANCE_MARKER};
use crate::backend::pre_compilation::{ConversionContext, DelegateRegistry};
use crate::backend::structure::ScopeKey;
use crate::config::{CacheMode, CONTAINER_FILE, MAP_FILE};
use crate::error::CacheFixupError;
use crate::trees::{MethodRef, SourceLocation, TypeRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: usize,
    pub misses: usize,
    /// Misses caused by a body whose references could not be translated
    pub fixup_failures: usize,
}

impl CacheStatistics {
    pub fn lookups(&self) -> usize {
        self.hits + self.misses
    }
}

struct PreviousBuild {
    dex: DexFile,
    map: IndexedMap,
    methods: HashMap<MethodReference, (usize, usize)>,
}

impl PreviousBuild {
    fn body(&self, reference: &MethodReference) -> Option<&MethodBody> {
        let (class, method) = self.methods.get(reference)?;
        self.dex.classes.get(*class)?.methods.get(*method)?.body.as_ref()
    }
}

pub struct CompilerCache {
    mode: CacheMode,
    previous: Option<PreviousBuild>,
    current: IndexedMap,
    /// Inputs whose content hash and timestamp match the previous build
    unchanged: HashSet<String>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    fixup_failures: AtomicUsize,
}

impl CompilerCache {
    fn new(mode: CacheMode, previous: Option<PreviousBuild>, current: &IdentityMap) -> CompilerCache {
        let unchanged = match &previous {
            Some(previous) => current
                .inputs
                .iter()
                .filter(|input| {
                    previous.map.map().input(&input.name).is_some_and(|old| {
                        old.scope == input.scope && old.content_hash == input.content_hash && old.timestamp == input.timestamp
                    })
                })
                .map(|input| input.name.clone())
                .collect(),
            None => HashSet::new(),
        };
        CompilerCache {
            mode,
            previous,
            current: IndexedMap::new(current.clone()),
            unchanged,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            fixup_failures: AtomicUsize::new(0),
        }
    }

    /// A cache that never hits
    pub fn disabled(current: &IdentityMap) -> CompilerCache {
        CompilerCache::new(CacheMode::Disabled, None, current)
    }

    /// Loads the previous build from `directory`. Anything missing or unreadable leaves the
    /// cache empty.
    pub fn load(mode: CacheMode, directory: Option<&Path>, current: &IdentityMap) -> CompilerCache {
        if mode == CacheMode::Disabled {
            log::info!("compiler cache disabled");
            return CompilerCache::disabled(current);
        }
        let Some(directory) = directory else {
            log::info!("no cache directory given, compiling every method");
            return CompilerCache::new(mode, None, current);
        };
        let previous = match CompilerCache::read_previous(directory) {
            Ok(previous) => previous,
            Err(reason) => {
                log::info!("cache in {} not used: {}", directory.display(), reason);
                return CompilerCache::new(mode, None, current);
            }
        };
        let cache = CompilerCache::new(mode, Some(previous), current);
        log::info!(
            "cache loaded from {}: {} of {} inputs unchanged",
            directory.display(),
            cache.unchanged.len(),
            current.inputs.len()
        );
        cache
    }

    fn read_previous(directory: &Path) -> Result<PreviousBuild, String> {
        let container = directory.join(CONTAINER_FILE);
        let bytes = std::fs::read(&container).map_err(|e| format!("{}: {}", container.display(), e))?;
        let dex = reader::read(&bytes).map_err(|e| format!("{}: {}", container.display(), e))?;
        let map = IdentityMap::load(directory.join(MAP_FILE)).map_err(|e| format!("{}: {}", MAP_FILE, e))?;
        let mut methods = HashMap::new();
        for (class_index, class) in dex.classes.iter().enumerate() {
            for (method_index, method) in class.methods.iter().enumerate() {
                methods.insert(method.reference.clone(), (class_index, method_index));
            }
        }
        Ok(PreviousBuild {
            dex,
            map: IndexedMap::new(map),
            methods,
        })
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn is_loaded(&self) -> bool {
        self.previous.is_some()
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fixup_failures: self.fixup_failures.load(Ordering::Relaxed),
        }
    }

    fn miss(&self, key: &ScopeKey, reason: &str) -> Option<MethodBody> {
        log::debug!("cache miss {} {}: {}", key.type_scope, key.method_scope, reason);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// The previous body of the method, translated into the current build.
    ///
    /// In advisory mode the lookup runs in full and is counted, but nothing is returned and no
    /// delegate instance is requested.
    pub fn lookup(&self, key: &ScopeKey, context: &ConversionContext) -> Option<MethodBody> {
        let previous = self.previous.as_ref()?;
        if !self.unchanged.contains(&key.input) {
            return self.miss(key, "input changed");
        }
        let Some((entry, method)) = previous.map.method_by_scope(&key.type_scope, &key.method_scope) else {
            return self.miss(key, "not in the previous map");
        };
        let Some(prototype) = Prototype::parse_signature(&method.dex_signature) else {
            return self.miss(key, "malformed signature");
        };
        let reference = MethodReference::new(ClassReference::new(entry.dex_name.as_str()), method.dex_name.clone(), prototype);
        let Some(body) = previous.body(&reference) else {
            return self.miss(key, "no previous body");
        };

        let mut body = body.clone();
        let fixup = Fixup {
            previous: &previous.map,
            current: &self.current,
            context,
            instances: RefCell::new(Vec::new()),
        };
        if let Err(error) = fixup.apply(&mut body) {
            self.fixup_failures.fetch_add(1, Ordering::Relaxed);
            return self.miss(key, &error.to_string());
        }
        restore_positions(&mut body, &method.positions);

        self.hits.fetch_add(1, Ordering::Relaxed);
        log::debug!("cache hit {} {}", key.type_scope, key.method_scope);
        match self.mode {
            CacheMode::Enabled => {
                for instance in fixup.instances.into_inner() {
                    context.delegates.register(instance);
                }
                Some(body)
            }
            CacheMode::Advisory | CacheMode::Disabled => None,
        }
    }
}

/// Puts the line table recorded in the map back onto the body
fn restore_positions(body: &mut MethodBody, positions: &[SourcePosition]) {
    let offsets = body.offsets();
    let ids: HashMap<u32, _> = offsets
        .iter()
        .zip(body.instructions().iter())
        .map(|(offset, instruction)| (*offset, instruction.id()))
        .collect();
    body.debug_info.positions = positions
        .iter()
        .filter_map(|position| {
            ids.get(&position.offset).map(|instruction| DebugPosition {
                instruction: *instruction,
                line: position.line,
            })
        })
        .collect();
}

/// Translates references of a previous body into the names of the current build
struct Fixup<'c> {
    previous: &'c IndexedMap,
    current: &'c IndexedMap,
    context: &'c ConversionContext<'c>,
    /// Delegate instances the body refers to, registered once the whole body translates
    instances: RefCell<Vec<DelegateInstance>>,
}

impl Fixup<'_> {
    fn apply(&self, body: &mut MethodBody) -> Result<(), CacheFixupError> {
        for instruction in body.instructions_mut() {
            instruction.operand = match &instruction.operand {
                Operand::Type(ty) => Operand::Type(self.type_reference(ty)?),
                Operand::Field(field) => Operand::Field(self.field(field)?),
                Operand::Method(method) => Operand::Method(self.method(method)?),
                _ => continue,
            };
        }
        for handler in body.exception_handlers.iter_mut() {
            for catch in handler.catches.iter_mut() {
                catch.exception_type = self.class(&catch.exception_type)?;
            }
        }
        Ok(())
    }

    fn class(&self, class: &ClassReference) -> Result<ClassReference, CacheFixupError> {
        let descriptor = class.descriptor();
        if descriptor.contains(INSTANCE_MARKER) {
            return self.delegate_instance(descriptor);
        }
        if descriptor.starts_with('[') {
            let ty = TypeReference::parse(descriptor).ok_or_else(|| CacheFixupError::MalformedSignature(descriptor.to_string()))?;
            return Ok(ClassReference::new(self.type_reference(&ty)?.descriptor()));
        }
        match self.previous.type_by_dex(descriptor) {
            Some(entry) => self
                .current
                .type_by_scope(&entry.scope_key)
                .map(|current| ClassReference::new(current.dex_name.as_str()))
                .ok_or_else(|| CacheFixupError::UnresolvedType(descriptor.to_string())),
            None => Ok(class.clone()),
        }
    }

    /// The current name of a previous delegate instance class, re-created from its map entry
    fn delegate_instance(&self, descriptor: &str) -> Result<ClassReference, CacheFixupError> {
        let unavailable = || CacheFixupError::SyntheticReference(descriptor.to_string());
        let entry = self.previous.type_by_dex(descriptor).ok_or_else(unavailable)?;
        let delegate = entry.delegate.as_ref().ok_or_else(unavailable)?;
        let delegate_type: TypeRef = serde_json::from_value(delegate.delegate_type.clone()).map_err(|_| unavailable())?;
        let method: MethodRef = serde_json::from_value(delegate.method.clone()).map_err(|_| unavailable())?;
        let module = self.context.module;
        if module.definition(&method.owner).is_some() && module.find_method(&method).is_none() {
            return Err(unavailable());
        }

        // The instance bodies were compiled at the creation site, which their line tables still name
        let location = entry
            .methods
            .iter()
            .flat_map(|method| method.positions.first())
            .next()
            .map(|position| SourceLocation::new(position.document.as_str(), position.line, position.column))
            .unwrap_or_else(|| self.context.source.location.clone());
        let instance = DelegateRegistry::describe(self.context, &delegate_type, &method, &location).map_err(|_| unavailable())?;
        let TypeRef::Descriptor(class) = &instance.class else {
            unreachable!("delegate instance classes are named by descriptor");
        };
        let class = ClassReference::new(class.as_str());
        self.instances.borrow_mut().push(instance);
        Ok(class)
    }

    fn type_reference(&self, ty: &TypeReference) -> Result<TypeReference, CacheFixupError> {
        Ok(match ty {
            TypeReference::Primitive(_) => ty.clone(),
            TypeReference::Class(class) => TypeReference::Class(self.class(class)?),
            TypeReference::Array(element) => TypeReference::array_of(self.type_reference(element)?),
        })
    }

    fn parse(&self, descriptor: &str) -> Result<TypeReference, CacheFixupError> {
        TypeReference::parse(descriptor).ok_or_else(|| CacheFixupError::MalformedSignature(descriptor.to_string()))
    }

    fn field(&self, field: &FieldReference) -> Result<FieldReference, CacheFixupError> {
        let owner = field.owner.descriptor();
        let synthesized = owner.contains(INSTANCE_MARKER);
        if let Some((entry, previous)) = self.previous.field_by_dex(owner, &field.name).filter(|_| !synthesized) {
            let (current_type, current) = self
                .current
                .field_by_scope(&entry.scope_key, &previous.scope_key)
                .ok_or_else(|| CacheFixupError::UnresolvedField(format!("{}->{}", owner, field.name)))?;
            return Ok(FieldReference::new(
                ClassReference::new(current_type.dex_name.as_str()),
                current.dex_name.clone(),
                self.parse(&current.dex_type)?,
            ));
        }
        if !synthesized && self.previous.type_by_dex(owner).is_some() {
            return Err(CacheFixupError::UnresolvedField(format!("{}->{}", owner, field.name)));
        }
        Ok(FieldReference::new(self.class(&field.owner)?, field.name.clone(), self.type_reference(&field.field_type)?))
    }

    fn method(&self, method: &MethodReference) -> Result<MethodReference, CacheFixupError> {
        let owner = method.owner.descriptor();
        let signature = method.prototype.signature();
        let synthesized = owner.contains(INSTANCE_MARKER);
        if let Some((entry, previous)) = self.previous.method_by_dex(owner, &method.name, &signature).filter(|_| !synthesized) {
            let (current_type, current) = self
                .current
                .method_by_scope(&entry.scope_key, &previous.scope_key)
                .ok_or_else(|| CacheFixupError::UnresolvedMethod(format!("{}->{}{}", owner, method.name, signature)))?;
            let prototype = Prototype::parse_signature(&current.dex_signature)
                .ok_or_else(|| CacheFixupError::MalformedSignature(current.dex_signature.clone()))?;
            return Ok(MethodReference::new(
                ClassReference::new(current_type.dex_name.as_str()),
                current.dex_name.clone(),
                prototype,
            ));
        }
        if !synthesized && self.previous.type_by_dex(owner).is_some() {
            return Err(CacheFixupError::UnresolvedMethod(format!("{}->{}{}", owner, method.name, signature)));
        }
        let parameters = method
            .prototype
            .parameters
            .iter()
            .map(|p| self.type_reference(p))
            .collect::<Result<Vec<_>, _>>()?;
        let prototype = Prototype::new(self.type_reference(&method.prototype.return_type)?, parameters);
        Ok(MethodReference::new(self.class(&method.owner)?, method.name.clone(), prototype))
    }
}
