//! Signature cache - shared call descriptors keyed by canonical signature
//!
//! A call descriptor is prepared once per distinct `(protocol, return, args)`
//! triple and shared by every binding that uses it. Lookups take a read lock;
//! inserts and releases take the write lock, so a descriptor is only ever
//! removed while no reader can be bumping its count.

use super::abi::Protocol;
use super::registry::TypeRegistry;
use super::types::TypeDesc;
use crate::error::{FfiError, Result};
use crate::logging;
use libffi::low;
use libffi::raw;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Prepared call interface for one signature
pub struct CallDescriptor {
    key: String,
    protocol: Protocol,
    rtype: Arc<TypeDesc>,
    atypes: Vec<Arc<TypeDesc>>,
    // Backend pointers into `rtype`/`atypes`; must stay below them
    raw_atypes: Box<[*mut raw::ffi_type]>,
    cif: Box<raw::ffi_cif>,
    refs: AtomicUsize,
}

// SAFETY: the prepared cif and the type array it points into are written
// once in `prepare` and only read afterwards
unsafe impl Send for CallDescriptor {}
unsafe impl Sync for CallDescriptor {}

impl CallDescriptor {
    fn prepare(
        key: String,
        protocol: Protocol,
        rtype: Arc<TypeDesc>,
        atypes: Vec<Arc<TypeDesc>>,
    ) -> Result<Self> {
        let mut raw_atypes: Box<[*mut raw::ffi_type]> =
            atypes.iter().map(|t| t.backend_ptr()).collect();
        // SAFETY: ffi_cif is plain data, fully initialized by prep_cif
        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { std::mem::zeroed() });

        // SAFETY: rtype and every entry of raw_atypes point at type records
        // kept alive by the Arcs stored alongside the cif
        unsafe {
            low::prep_cif(
                &mut *cif,
                protocol.abi(),
                atypes.len(),
                rtype.backend_ptr(),
                raw_atypes.as_mut_ptr(),
            )
        }
        .map_err(|_| FfiError::PrepFailed { signature: key.clone() })?;

        Ok(Self {
            key,
            protocol,
            rtype,
            atypes,
            raw_atypes,
            cif,
            refs: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline]
    pub fn rtype(&self) -> &Arc<TypeDesc> {
        &self.rtype
    }

    #[inline]
    pub fn atypes(&self) -> &[Arc<TypeDesc>] {
        &self.atypes
    }

    #[inline]
    pub fn argc(&self) -> usize {
        self.atypes.len()
    }

    /// Number of live handles on this descriptor
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Raw cif for the backend's call and closure entry points
    #[inline]
    pub(crate) fn raw_cif(&self) -> *mut raw::ffi_cif {
        debug_assert_eq!(self.raw_atypes.len(), self.atypes.len());
        &*self.cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }

    /// Whether this descriptor was prepared from exactly these type records
    fn matches(&self, rtype: &Arc<TypeDesc>, atypes: &[Arc<TypeDesc>]) -> bool {
        Arc::ptr_eq(&self.rtype, rtype)
            && self.atypes.len() == atypes.len()
            && self.atypes.iter().zip(atypes).all(|(a, b)| Arc::ptr_eq(a, b))
    }

    #[inline]
    fn incref(&self) -> usize {
        let old = self.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old < usize::MAX, "refcount overflow");
        old + 1
    }
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("key", &self.key)
            .field("argc", &self.argc())
            .field("refs", &self.refcount())
            .finish()
    }
}

/// Counted reference to a cached descriptor; releases on drop
pub struct CifHandle {
    desc: Arc<CallDescriptor>,
    cache: Weak<CacheShared>,
}

impl CifHandle {
    /// Identity of the shared descriptor
    pub fn ptr_eq(&self, other: &CifHandle) -> bool {
        Arc::ptr_eq(&self.desc, &other.desc)
    }

    pub fn descriptor(&self) -> &Arc<CallDescriptor> {
        &self.desc
    }
}

impl Deref for CifHandle {
    type Target = CallDescriptor;

    fn deref(&self) -> &CallDescriptor {
        &self.desc
    }
}

impl Clone for CifHandle {
    fn clone(&self) -> Self {
        match self.cache.upgrade() {
            Some(cache) => {
                let _guard = cache.entries.read();
                self.desc.incref();
            }
            None => {
                self.desc.incref();
            }
        }
        Self { desc: Arc::clone(&self.desc), cache: Weak::clone(&self.cache) }
    }
}

impl Drop for CifHandle {
    fn drop(&mut self) {
        match self.cache.upgrade() {
            Some(cache) => cache.release(&self.desc),
            None => {
                self.desc.refs.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl fmt::Debug for CifHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.desc.fmt(f)
    }
}

struct CacheShared {
    entries: RwLock<HashMap<String, Arc<CallDescriptor>>>,
}

impl CacheShared {
    fn release(&self, desc: &Arc<CallDescriptor>) {
        let mut entries = self.entries.write();
        let old = desc.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "refcount underflow");
        if old == 1 {
            // Only drop the entry if it is still this descriptor
            if entries.get(desc.key()).is_some_and(|e| Arc::ptr_eq(e, desc)) {
                entries.remove(desc.key());
                logging::log_signature_released(desc.key());
            }
        }
    }
}

/// Shared cache of prepared call descriptors
pub struct SignatureCache {
    shared: Arc<CacheShared>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self { shared: Arc::new(CacheShared { entries: RwLock::new(HashMap::new()) }) }
    }

    /// Find or prepare the descriptor for a signature, counting the new
    /// reference
    pub fn resolve(
        &self,
        registry: &TypeRegistry,
        args: &[&str],
        ret: &str,
        protocol: Option<&str>,
    ) -> Result<CifHandle> {
        let protocol = Protocol::resolve(protocol)?;
        let key = canonical_key(protocol.key_name(), ret, args);
        let rtype = registry.lookup(ret)?;
        let atypes = args
            .iter()
            .map(|name| registry.lookup(name))
            .collect::<Result<Vec<_>>>()?;

        {
            let entries = self.shared.entries.read();
            if let Some(desc) = entries.get(&key).filter(|d| d.matches(&rtype, &atypes)) {
                let refs = desc.incref();
                logging::log_signature_hit(&key, refs);
                return Ok(self.handle(Arc::clone(desc)));
            }
        }

        logging::log_signature_miss(&key);
        let prepared = Arc::new(CallDescriptor::prepare(key.clone(), protocol, rtype, atypes)?);

        let mut entries = self.shared.entries.write();
        let desc = match entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if !entry.get().matches(prepared.rtype(), prepared.atypes()) {
                    // A name in the key was redefined; older handles keep the
                    // replaced descriptor alive until they are released
                    logging::log_signature_replaced(entry.key());
                    entry.insert(prepared);
                }
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => Arc::clone(entry.insert(prepared)),
        };
        desc.incref();
        drop(entries);
        Ok(self.handle(desc))
    }

    fn handle(&self, desc: Arc<CallDescriptor>) -> CifHandle {
        CifHandle { desc, cache: Arc::downgrade(&self.shared) }
    }

    /// Cached descriptor for an exact key, without taking a reference
    pub fn get(&self, key: &str) -> Option<Arc<CallDescriptor>> {
        self.shared.entries.read().get(key).cloned()
    }

    /// Sorted canonical keys of every cached descriptor
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every cached descriptor; outstanding handles keep theirs alive
    pub fn clear(&self) {
        self.shared.entries.write().clear();
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `"<protocol> "` (omitted for the default) + `ret(arg,arg,...)`
pub fn canonical_key(protocol: Option<&str>, ret: &str, args: &[&str]) -> String {
    let mut key = String::new();
    if let Some(protocol) = protocol {
        key.push_str(protocol);
        key.push(' ');
    }
    key.push_str(ret);
    key.push('(');
    key.push_str(&args.join(","));
    key.push(')');
    key
}
