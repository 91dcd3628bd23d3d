//! Type registry - named, shared type descriptors
//!
//! Built-in primitives are installed at construction and never removed.
//! Aliases share the descriptor they name; aggregates own references to
//! their element descriptors, so an element stays alive as long as any
//! aggregate built from it.

use super::types::{builtin_types, TypeDesc};
use crate::config::MismatchPolicy;
use crate::error::{FfiError, Result, UsageContext};
use crate::logging;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

pub struct TypeRegistry {
    types: DashMap<String, Arc<TypeDesc>>,
    builtins: HashSet<&'static str>,
    mismatch: MismatchPolicy,
}

impl TypeRegistry {
    pub fn new(mismatch: MismatchPolicy) -> Self {
        let types = DashMap::new();
        let mut builtins = HashSet::new();
        for (name, desc) in builtin_types() {
            types.insert(name.to_string(), desc);
            builtins.insert(name);
        }
        Self { types, builtins, mismatch }
    }

    /// Define `name` from a list of existing type names
    ///
    /// One element makes an alias sharing that descriptor; two or more make
    /// an aggregate whose layout is verified against the backend.
    pub fn define(&self, name: &str, elements: &[&str]) -> Result<Arc<TypeDesc>> {
        if self.types.contains_key(name) {
            return Err(FfiError::TypeExists { name: name.to_string() });
        }

        let desc = match elements {
            [] => return Err(FfiError::EmptyAggregate { name: name.to_string() }),
            [target] => self.lookup(target)?,
            _ => Arc::new(self.build_aggregate(name, elements)?),
        };

        match self.types.entry(name.to_string()) {
            Entry::Occupied(_) => Err(FfiError::TypeExists { name: name.to_string() }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&desc));
                logging::log_type_defined(name, desc.size(), desc.align(), elements.len());
                Ok(desc)
            }
        }
    }

    fn build_aggregate(&self, name: &str, elements: &[&str]) -> Result<TypeDesc> {
        let resolved = elements
            .iter()
            .map(|element| {
                let desc = self.lookup(element)?;
                if !desc.permits(UsageContext::Element) {
                    return Err(FfiError::ContextViolation {
                        name: element.to_string(),
                        context: UsageContext::Element,
                    });
                }
                Ok(desc)
            })
            .collect::<Result<Vec<_>>>()?;

        let desc = TypeDesc::aggregate(resolved);
        let (backend_size, backend_align) = desc
            .backend_layout()
            .ok_or_else(|| FfiError::BackendRejected { name: name.to_string() })?;

        if (backend_size, backend_align) != (desc.size(), desc.align()) {
            let err = FfiError::LayoutMismatch {
                name: name.to_string(),
                size: desc.size(),
                align: desc.align(),
                backend_size,
                backend_align,
            };
            match self.mismatch {
                MismatchPolicy::Error => {
                    tracing::error!(event = "layout_mismatch", name, error = %err);
                    return Err(err);
                }
                MismatchPolicy::Warn => {
                    tracing::warn!(event = "layout_mismatch", name, error = %err);
                }
            }
        }

        Ok(desc)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<TypeDesc>> {
        self.types
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FfiError::UnknownType { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn size_of(&self, name: &str) -> Result<usize> {
        self.lookup(name).map(|t| t.size())
    }

    pub fn align_of(&self, name: &str) -> Result<usize> {
        self.lookup(name).map(|t| t.align())
    }

    /// Tcl `binary` format string describing the layout of `name`
    pub fn format(&self, name: &str) -> Result<String> {
        self.lookup(name)?
            .format()
            .ok_or_else(|| FfiError::Unformattable { name: name.to_string() })
    }

    /// Live references to the descriptor bound to `name`, including the
    /// registry's own
    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.types.get(name).map(|entry| Arc::strong_count(entry.value()))
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }

    /// Drop a user definition; the descriptor is freed once nothing else
    /// references it
    pub fn undefine(&self, name: &str) -> Result<()> {
        if self.is_builtin(name) {
            return Err(FfiError::BuiltinType { name: name.to_string() });
        }
        self.types
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FfiError::UnknownType { name: name.to_string() })
    }

    /// Sorted list of defined names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Release every user definition
    pub fn clear_user_types(&self) {
        self.types.retain(|name, _| self.builtins.contains(name.as_str()));
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(MismatchPolicy::default())
    }
}
