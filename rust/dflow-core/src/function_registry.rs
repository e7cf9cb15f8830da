//! Task-function registry and the `dyld`-style device-plugin symbol
//! resolution named in spec §6: a name and capability resolve to a
//! concrete kernel symbol by scanning a `;`-separated search path,
//! falling back to the host process's own symbol table. The DSL compiler
//! that populates [`TaskFunction`]s is out of scope; this module is the
//! interface it is consumed through.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use crate::task::{DeviceClass, TaskFunction};

/// Resolves whether a symbol is available, abstracted behind a trait so
/// device-plugin resolution is testable without real `.so` files (the
/// corpus this crate is grounded on has no `libloading`/`dlopen` usage
/// anywhere; production wiring for a real accelerator backend would
/// implement this trait against its own loader instead).
pub trait SymbolResolver: Send + Sync {
    /// `search_entry` is one element of the `;`-separated path: a
    /// directory (resolved to `lib<symbol>.so` inside it, spec §6) or a
    /// file used directly. An empty `search_entry` means "no path
    /// configured" — the host process's own symbol table only.
    fn resolve(&self, search_entry: &str, symbol: &str) -> bool;
}

/// Resolver backed by the running process's exported dynamic symbols —
/// the "host process's own symbol table" fallback named in spec §6.
/// Ignores `search_entry`: whatever the process was linked against is
/// either present or it isn't.
pub struct ProcessSymbolResolver;

impl SymbolResolver for ProcessSymbolResolver {
    fn resolve(&self, _search_entry: &str, symbol: &str) -> bool {
        let Ok(cname) = CString::new(symbol) else {
            return false;
        };
        #[cfg(unix)]
        unsafe {
            !libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()).is_null()
        }
        #[cfg(not(unix))]
        {
            let _ = cname;
            false
        }
    }
}

/// Splits a `;`-separated search path into trimmed, non-empty entries
/// (spec §6 `device_cuda.path` / `DEVICE_LIB_PATH`).
pub fn split_search_path(path: &str) -> Vec<&str> {
    path.split(';').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Capability-ranked candidate symbol names for `dyld_name`, highest
/// capability first and ending on the bare name: `axpy_sm80`, `axpy_sm79`,
/// ..., `axpy_sm0`, `axpy` (spec §6: "retried at successively lower
/// capability versions, down to no suffix").
pub fn candidate_symbols(dyld_name: &str, capability: Option<u32>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(cap) = capability {
        let mut c = cap;
        loop {
            out.push(format!("{dyld_name}_sm{c}"));
            if c == 0 {
                break;
            }
            c -= 1;
        }
    }
    out.push(dyld_name.to_string());
    out
}

/// Maps `(function, device class)` to its incarnation and runs device-kernel
/// symbol resolution at device-registration time. Lives on [`crate::engine::Engine`]
/// rather than as an ambient global (DESIGN NOTES §9).
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<&'static str, Arc<TaskFunction>>,
    /// Whether `(function, device_class)`'s device-kernel symbol resolved.
    /// A missing or `false` entry clears that device from consideration
    /// for the function (spec §7 "symbol-resolution failure"), it does
    /// not fail registration as a whole.
    availability: HashMap<(&'static str, DeviceClass), bool>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: Arc<TaskFunction>) {
        self.functions.insert(function.name, function);
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<TaskFunction>> {
        self.functions.values()
    }

    /// Resolves every registered function's `device_class` incarnation
    /// against `search_path` using `resolver`, recording availability.
    /// Incarnations with no `dyld_name` (CPU hooks) are always available.
    pub fn register_device(
        &mut self,
        device_class: DeviceClass,
        search_path: &str,
        capability: Option<u32>,
        resolver: &dyn SymbolResolver,
    ) {
        let entries = split_search_path(search_path);
        let resolutions: Vec<(&'static str, bool)> = self
            .functions
            .values()
            .filter_map(|function| {
                let incarnation = function.incarnation_for(device_class)?;
                let found = match incarnation.dyld_name {
                    None => true,
                    Some(dyld_name) => Self::resolve_one(&entries, dyld_name, capability, resolver),
                };
                Some((function.name, found))
            })
            .collect();

        for (name, found) in resolutions {
            if !found {
                tracing::warn!(function = name, ?device_class, "device-kernel symbol not found");
            }
            self.availability.insert((name, device_class), found);
        }
    }

    fn resolve_one(
        entries: &[&str],
        dyld_name: &str,
        capability: Option<u32>,
        resolver: &dyn SymbolResolver,
    ) -> bool {
        for symbol in candidate_symbols(dyld_name, capability) {
            if entries.is_empty() {
                if resolver.resolve("", &symbol) {
                    return true;
                }
                continue;
            }
            for entry in entries {
                if resolver.resolve(entry, &symbol) {
                    return true;
                }
            }
        }
        false
    }

    /// Whether `function`'s incarnation for `device_class` is usable.
    /// Functions that never ran `register_device` for a class (e.g. `Cpu`,
    /// which needs no symbol resolution) default to available whenever an
    /// incarnation for that class exists at all.
    pub fn is_available(&self, function: &str, device_class: DeviceClass) -> bool {
        match self.availability.get(&(function, device_class)) {
            Some(&available) => available,
            None => self
                .functions
                .get(function)
                .and_then(|f| f.incarnation_for(device_class))
                .is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AccessMode, FlowDecl, Incarnation};

    fn axpy(dyld_name: Option<&'static str>) -> Arc<TaskFunction> {
        Arc::new(TaskFunction {
            name: "axpy",
            flows: vec![FlowDecl {
                index: 0,
                access: AccessMode::ReadWrite,
                name: Some("x"),
            }],
            incarnations: vec![Incarnation {
                device_class: DeviceClass::Cuda,
                dyld_name,
                hook: None,
                submit: None,
            }],
            key_fn: None,
        })
    }

    struct FakeResolver {
        known: Vec<&'static str>,
    }

    impl SymbolResolver for FakeResolver {
        fn resolve(&self, _search_entry: &str, symbol: &str) -> bool {
            self.known.iter().any(|k| *k == symbol)
        }
    }

    #[test]
    fn candidate_symbols_rank_capability_down_to_bare_name() {
        let names = candidate_symbols("axpy", Some(2));
        assert_eq!(names, vec!["axpy_sm2", "axpy_sm1", "axpy_sm0", "axpy"]);
    }

    #[test]
    fn split_search_path_trims_and_drops_empties() {
        assert_eq!(split_search_path(" /a/b ;; /c "), vec!["/a/b", "/c"]);
    }

    #[test]
    fn registers_and_looks_up_functions() {
        let mut registry = FunctionRegistry::new();
        registry.register(axpy(None));
        assert!(registry.get("axpy").is_some());
        assert!(registry.get("saxpy").is_none());
    }

    #[test]
    fn falls_back_through_capability_levels() {
        let mut registry = FunctionRegistry::new();
        registry.register(axpy(Some("axpy_kernel")));
        let resolver = FakeResolver {
            known: vec!["axpy_kernel"], // only the bare name resolves
        };
        registry.register_device(DeviceClass::Cuda, "", Some(3), &resolver);
        assert!(registry.is_available("axpy", DeviceClass::Cuda));
    }

    #[test]
    fn missing_symbol_marks_device_unavailable() {
        let mut registry = FunctionRegistry::new();
        registry.register(axpy(Some("axpy_kernel")));
        let resolver = FakeResolver { known: vec![] };
        registry.register_device(DeviceClass::Cuda, "", Some(1), &resolver);
        assert!(!registry.is_available("axpy", DeviceClass::Cuda));
    }

    #[test]
    fn no_dyld_name_is_always_available() {
        let mut registry = FunctionRegistry::new();
        registry.register(axpy(None));
        let resolver = FakeResolver { known: vec![] };
        registry.register_device(DeviceClass::Cuda, "", None, &resolver);
        assert!(registry.is_available("axpy", DeviceClass::Cuda));
    }

    #[test]
    fn unresolved_class_without_incarnation_is_unavailable() {
        let registry = FunctionRegistry::new();
        assert!(!registry.is_available("axpy", DeviceClass::Cuda));
    }
}
