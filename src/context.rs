//! Per-session owning context
//!
//! One [`FfiContext`] holds the type registry, the signature cache, the named
//! outbound and inbound bindings, and the loaded libraries of a session.
//! Every operation goes through it; nothing lives in process globals.
//!
//! Dropping the context tears down in dependency order: callbacks, callouts,
//! signatures, then user types.

use crate::config::FfiConfig;
use crate::error::{FfiError, Result, UsageContext};
use crate::host::Host;
use crate::interop::{
    ArgResolver, Callback, Callout, LibraryTable, LoadFlags, SignatureCache, TypeDesc,
    TypeRegistry,
};
use crate::logging;
use crate::value::{ByteBuffer, Value};
use dashmap::DashMap;
use std::sync::Arc;

/// Optional capabilities of this build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    pub callbacks: bool,
    pub int64: bool,
    pub long_double: bool,
    pub host: String,
}

pub struct FfiContext {
    registry: TypeRegistry,
    signatures: SignatureCache,
    callouts: DashMap<String, Arc<Callout>>,
    callbacks: DashMap<String, Arc<Callback>>,
    libraries: LibraryTable,
    host: Arc<dyn Host>,
}

impl FfiContext {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self::with_registry(host, TypeRegistry::default())
    }

    fn with_registry(host: Arc<dyn Host>, registry: TypeRegistry) -> Self {
        Self {
            registry,
            signatures: SignatureCache::new(),
            callouts: DashMap::new(),
            callbacks: DashMap::new(),
            libraries: LibraryTable::new(),
            host,
        }
    }

    /// Build a context and apply the config's libraries and typedefs in order
    pub fn from_config(host: Arc<dyn Host>, config: &FfiConfig) -> Result<Self> {
        let ctx = Self::with_registry(host, TypeRegistry::new(config.layout.mismatch));
        for library in &config.libraries {
            ctx.load_library(&library.path, library.flags())?;
        }
        for typedef in &config.typedefs {
            let elements: Vec<&str> = typedef.elements.iter().map(String::as_str).collect();
            ctx.define_type(&typedef.name, &elements)?;
        }
        Ok(ctx)
    }

    #[inline]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    #[inline]
    pub fn signatures(&self) -> &SignatureCache {
        &self.signatures
    }

    #[inline]
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    // -- types --

    pub fn define_type(&self, name: &str, elements: &[&str]) -> Result<Arc<TypeDesc>> {
        self.registry.define(name, elements)
    }

    pub fn undefine_type(&self, name: &str) -> Result<()> {
        self.registry.undefine(name)
    }

    pub fn size_of(&self, name: &str) -> Result<usize> {
        self.registry.size_of(name)
    }

    pub fn align_of(&self, name: &str) -> Result<usize> {
        self.registry.align_of(name)
    }

    pub fn format(&self, name: &str) -> Result<String> {
        self.registry.format(name)
    }

    // -- bindings --

    fn check_context(&self, name: &str, context: UsageContext) -> Result<()> {
        let desc = self.registry.lookup(name)?;
        if desc.permits(context) {
            Ok(())
        } else {
            Err(FfiError::ContextViolation { name: name.to_string(), context })
        }
    }

    fn check_signature(
        &self,
        args: &[&str],
        ret: &str,
        arg_context: UsageContext,
        ret_context: UsageContext,
    ) -> Result<()> {
        self.check_context(ret, ret_context)?;
        args.iter().try_for_each(|arg| self.check_context(arg, arg_context))
    }

    /// Bind `name` to the native function at `address`, replacing any
    /// previous callout of that name
    ///
    /// # Safety
    /// `address` must be a function with exactly the described signature
    /// and calling convention, and must stay valid while the binding exists.
    pub unsafe fn bind_outbound(
        &self,
        name: &str,
        args: &[&str],
        ret: &str,
        address: usize,
        protocol: Option<&str>,
    ) -> Result<Arc<Callout>> {
        self.check_signature(args, ret, UsageContext::Argument, UsageContext::Return)?;
        let cif = self.signatures.resolve(&self.registry, args, ret, protocol)?;
        let callout = Arc::new(Callout::new(name, cif, address));
        let replaced = self.callouts.insert(name.to_string(), Arc::clone(&callout)).is_some();
        logging::log_binding("callout", name, callout.cif().key(), replaced);
        Ok(callout)
    }

    /// Resolve `symbol` in `library` and bind it as `name`
    ///
    /// # Safety
    /// Same as [`FfiContext::bind_outbound`].
    pub unsafe fn bind_symbol(
        &self,
        name: &str,
        library: &str,
        symbol: &str,
        args: &[&str],
        ret: &str,
        protocol: Option<&str>,
    ) -> Result<Arc<Callout>> {
        let address = self.libraries.symbol(library, symbol)?;
        self.bind_outbound(name, args, ret, address, protocol)
    }

    /// Install an inbound binding and return its native entry address
    ///
    /// Native arguments are appended to `prefix` (or to `[name]` when no
    /// prefix is given) and the result is run as a host command. A previous
    /// callback of the same name is freed first.
    pub fn bind_inbound(
        &self,
        name: &str,
        args: &[&str],
        ret: &str,
        protocol: Option<&str>,
        prefix: Option<Vec<Value>>,
    ) -> Result<usize> {
        self.check_signature(
            args,
            ret,
            UsageContext::CallbackArgument,
            UsageContext::CallbackReturn,
        )?;
        let cif = self.signatures.resolve(&self.registry, args, ret, protocol)?;
        let replaced = self.callbacks.remove(name).is_some();
        let callback = Arc::new(Callback::new(name, cif, prefix, &self.host)?);
        let entry = callback.entry();
        logging::log_binding("callback", name, callback.cif().key(), replaced);
        self.callbacks.insert(name.to_string(), callback);
        Ok(entry)
    }

    pub fn unbind_outbound(&self, name: &str) -> Result<()> {
        self.callouts
            .remove(name)
            .map(|_| logging::log_unbound("callout", name))
            .ok_or_else(|| FfiError::UnknownCallout { name: name.to_string() })
    }

    pub fn unbind_inbound(&self, name: &str) -> Result<()> {
        self.callbacks
            .remove(name)
            .map(|_| logging::log_unbound("callback", name))
            .ok_or_else(|| FfiError::UnknownCallback { name: name.to_string() })
    }

    pub fn callout(&self, name: &str) -> Option<Arc<Callout>> {
        self.callouts.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn callback(&self, name: &str) -> Option<Arc<Callback>> {
        self.callbacks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Invoke a named callout
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        // Clone out so the call can reenter the binding table
        let callout =
            self.callout(name).ok_or_else(|| FfiError::UnknownCallout { name: name.to_string() })?;
        callout.invoke(args, self)
    }

    // -- libraries --

    pub fn load_library(&self, path: &str, flags: LoadFlags) -> Result<()> {
        self.libraries.load(path, flags).map(|_| ())
    }

    /// Address of `symbol` in `library`, loading the library if needed
    pub fn symbol(&self, library: &str, symbol: &str) -> Result<usize> {
        self.libraries.symbol(library, symbol)
    }

    // -- introspection --

    pub fn typedefs(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn signature_keys(&self) -> Vec<String> {
        self.signatures.keys()
    }

    pub fn callouts(&self) -> Vec<String> {
        sorted_keys(&self.callouts)
    }

    pub fn callbacks(&self) -> Vec<String> {
        sorted_keys(&self.callbacks)
    }

    pub fn libraries(&self) -> Vec<String> {
        self.libraries.names()
    }

    /// The null pointer value
    pub fn null(&self) -> Value {
        Value::null()
    }

    pub fn features(&self) -> Features {
        Features {
            callbacks: true,
            int64: true,
            long_double: self.registry.size_of("long double").is_ok_and(|size| size > 8),
            host: host_triple(),
        }
    }
}

impl ArgResolver for FfiContext {
    fn variable(&self, name: &str) -> Result<Arc<ByteBuffer>> {
        match self.host.unshare_var(name) {
            Some(Value::Bytes(bytes)) => Ok(bytes),
            Some(other) => Err(FfiError::conversion("a byte buffer", other)),
            None => Err(FfiError::UnknownVariable { name: name.to_string() }),
        }
    }

    fn callback_entry(&self, name: &str) -> Result<usize> {
        self.callbacks
            .get(name)
            .map(|entry| entry.entry())
            .ok_or_else(|| FfiError::UnknownCallback { name: name.to_string() })
    }
}

impl Drop for FfiContext {
    fn drop(&mut self) {
        self.callbacks.clear();
        self.callouts.clear();
        self.signatures.clear();
        self.registry.clear_user_types();
    }
}

impl std::fmt::Debug for FfiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfiContext")
            .field("types", &self.registry.names().len())
            .field("signatures", &self.signatures.len())
            .field("callouts", &self.callouts.len())
            .field("callbacks", &self.callbacks.len())
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

fn sorted_keys<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.iter().map(|entry| entry.key().clone()).collect();
    keys.sort();
    keys
}

fn host_triple() -> String {
    let env = if cfg!(target_env = "gnu") {
        "-gnu"
    } else if cfg!(target_env = "musl") {
        "-musl"
    } else if cfg!(target_env = "msvc") {
        "-msvc"
    } else {
        ""
    };
    format!("{}-{}{}", std::env::consts::ARCH, std::env::consts::OS, env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::Session;

    extern "C" fn twice(x: i32) -> i32 {
        x * 2
    }

    fn context() -> FfiContext {
        FfiContext::new(Session::new())
    }

    #[test]
    fn test_bind_and_call_named() {
        let ctx = context();
        unsafe {
            ctx.bind_outbound("twice", &["sint32"], "sint32", twice as usize, None).unwrap();
        }
        assert_eq!(ctx.call("twice", &[Value::Int(21)]).unwrap(), Value::Int(42));
        assert_eq!(ctx.callouts(), vec!["twice".to_string()]);
        assert_eq!(ctx.signature_keys(), vec!["sint32(sint32)".to_string()]);

        ctx.unbind_outbound("twice").unwrap();
        assert!(ctx.signature_keys().is_empty());
        assert!(matches!(ctx.call("twice", &[]), Err(FfiError::UnknownCallout { .. })));
        assert!(matches!(ctx.unbind_outbound("twice"), Err(FfiError::UnknownCallout { .. })));
    }

    #[test]
    fn test_rebind_releases_previous_signature() {
        let ctx = context();
        unsafe {
            ctx.bind_outbound("f", &["sint32"], "sint32", twice as usize, None).unwrap();
            ctx.bind_outbound("f", &["int"], "int", twice as usize, None).unwrap();
        }
        assert_eq!(ctx.signature_keys(), vec!["int(int)".to_string()]);
    }

    #[test]
    fn test_context_checks() {
        let ctx = context();
        let err = unsafe { ctx.bind_outbound("v", &["void"], "void", 0, None) }.unwrap_err();
        assert!(matches!(
            err,
            FfiError::ContextViolation { ref name, context: UsageContext::Argument } if name == "void"
        ));
        assert_eq!(err.kind(), ErrorKind::Definition);
        assert!(ctx.signature_keys().is_empty());

        let err = ctx.bind_inbound("cb", &["pointer-byte"], "void", None, None).unwrap_err();
        assert!(matches!(
            err,
            FfiError::ContextViolation { context: UsageContext::CallbackArgument, .. }
        ));

        let err = ctx.bind_inbound("cb", &[], "pointer-utf8", None, None).unwrap_err();
        assert!(matches!(
            err,
            FfiError::ContextViolation { context: UsageContext::CallbackReturn, .. }
        ));
        assert!(ctx.callbacks().is_empty());
    }

    #[test]
    fn test_teardown_order_frees_user_types() {
        let ctx = context();
        let point = ctx.define_type("point", &["sint32", "sint32"]).unwrap();
        unsafe {
            ctx.bind_outbound("p", &["point"], "void", 0, None).unwrap();
        }
        ctx.bind_inbound("cb", &["point"], "void", None, None).unwrap();
        // registry, the one shared descriptor, test handle
        assert_eq!(Arc::strong_count(&point), 3);
        drop(ctx);
        assert_eq!(Arc::strong_count(&point), 1);
    }

    #[test]
    fn test_features_and_null() {
        let ctx = context();
        let features = ctx.features();
        assert!(features.callbacks);
        assert!(features.int64);
        assert!(features.host.starts_with(std::env::consts::ARCH));
        assert_eq!(ctx.null(), Value::Pointer(0));
    }

    #[test]
    fn test_variable_resolution() {
        let session = Session::new();
        session.set_var("buf", Value::bytes(vec![0u8; 4]));
        session.set_var("text", "abc");
        let ctx = FfiContext::new(session);

        assert_eq!(ctx.variable("buf").unwrap().len(), 4);
        assert!(matches!(ctx.variable("text"), Err(FfiError::Conversion { .. })));
        assert!(matches!(ctx.variable("nope"), Err(FfiError::UnknownVariable { .. })));
        assert!(matches!(ctx.callback_entry("nope"), Err(FfiError::UnknownCallback { .. })));
    }
}
