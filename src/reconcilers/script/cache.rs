// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Process wide cache of compiled script modules.
//!
//! Loads are single-flight: the first loader of a module compiles it while later
//! callers block on the entry until it is ready. Each top-level load is a loader
//! node whose `waiting_for` edge names the entry it currently blocks on. Before
//! blocking, the waiter follows entry → owner → owner's wait target under the
//! cache lock. Reaching itself means the wait could never finish, so the load
//! fails with a cycle error instead.

use super::{module_name, sandboxed_engine};
use crate::error::{ControllerError, Result};
use crate::types::ReconcilerConfig;
use rhai::module_resolvers::ModuleResolver;
use rhai::{Engine, EvalAltResult, Module, Position, Scope};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Where module sources come from
pub trait ModuleSource: Send + Sync {
    fn source(&self, name: &str) -> Option<String>;
}

/// Module sources gathered from the `code` of every script reconciler
#[derive(Clone, Debug, Default)]
pub struct CodeModules {
    modules: BTreeMap<String, String>,
}

impl CodeModules {
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a ReconcilerConfig>) -> Self {
        let mut modules = BTreeMap::new();
        for config in configs {
            for (name, source) in &config.code {
                let name = module_name(name);
                if modules.contains_key(&name) {
                    warn!("Module {} of reconciler {} shadowed by an earlier definition", name, config.name);
                    continue;
                }
                modules.insert(name, source.clone());
            }
        }
        Self { modules }
    }
}

impl ModuleSource for CodeModules {
    fn source(&self, name: &str) -> Option<String> {
        self.modules.get(name).cloned()
    }
}

#[derive(Clone, Debug)]
struct LoadFailure {
    message: String,
    cycle: bool,
}

impl From<LoadFailure> for ControllerError {
    fn from(failure: LoadFailure) -> Self {
        if failure.cycle {
            ControllerError::ModuleCycle(failure.message)
        } else {
            ControllerError::ModuleLoad(failure.message)
        }
    }
}

type LoadResult = std::result::Result<Arc<Module>, LoadFailure>;

/// One top-level load, shared by the nested imports it triggers
struct Loader {
    waiting_for: Mutex<Option<Arc<Entry>>>,
    hit_cycle: AtomicBool,
}

struct Entry {
    name: String,
    owner: Arc<Loader>,
    state: Mutex<Option<LoadResult>>,
    ready: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Loader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            waiting_for: Mutex::new(None),
            hit_cycle: AtomicBool::new(false),
        })
    }
}

impl Entry {
    fn is_ready(&self) -> bool {
        lock(&self.state).is_some()
    }

    fn complete(&self, result: LoadResult) {
        *lock(&self.state) = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> LoadResult {
        let mut state = lock(&self.state);
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone();
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct Inner {
    source: Arc<dyn ModuleSource>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

#[derive(Clone)]
pub struct ModuleCache {
    inner: Arc<Inner>,
}

enum Claim {
    Owned(Arc<Entry>),
    Waiting(Arc<Entry>),
    Done(LoadResult),
}

impl ModuleCache {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Top-level load of a module. Blocks; call it off the async runtime.
    pub fn load(&self, name: &str) -> Result<Arc<Module>> {
        Ok(self.load_as(&module_name(name), &Loader::new())?)
    }

    /// Resolver for `import` statements, acting as a fresh top-level loader
    pub fn resolver(&self) -> CacheResolver {
        CacheResolver {
            cache: self.clone(),
            loader: Loader::new(),
        }
    }

    fn load_as(&self, name: &str, loader: &Arc<Loader>) -> LoadResult {
        let claim = {
            let mut entries = lock(&self.inner.entries);
            match entries.get(name) {
                Some(entry) if entry.is_ready() => Claim::Done(entry.wait()),
                Some(entry) => match wait_chain(entry, loader) {
                    Some(chain) => {
                        loader.hit_cycle.store(true, Ordering::SeqCst);
                        Claim::Done(Err(LoadFailure {
                            message: format!("import of {} waits on itself via {}", name, chain.join(" -> ")),
                            cycle: true,
                        }))
                    }
                    None => {
                        *lock(&loader.waiting_for) = Some(Arc::clone(entry));
                        Claim::Waiting(Arc::clone(entry))
                    }
                },
                None => {
                    let entry = Arc::new(Entry {
                        name: name.to_string(),
                        owner: Arc::clone(loader),
                        state: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    entries.insert(name.to_string(), Arc::clone(&entry));
                    Claim::Owned(entry)
                }
            }
        };

        match claim {
            Claim::Done(result) => result,
            Claim::Waiting(entry) => {
                debug!("Waiting for module {} loaded elsewhere", name);
                let result = entry.wait();
                *lock(&loader.waiting_for) = None;
                if matches!(&result, Err(f) if f.cycle) {
                    loader.hit_cycle.store(true, Ordering::SeqCst);
                }
                result
            }
            Claim::Owned(entry) => {
                let result = self.compile(name, loader);
                entry.complete(result.clone());
                result
            }
        }
    }

    fn compile(&self, name: &str, loader: &Arc<Loader>) -> LoadResult {
        let failure = |message: String| LoadFailure {
            message,
            cycle: loader.hit_cycle.load(Ordering::SeqCst),
        };
        let source = self
            .inner
            .source
            .source(name)
            .ok_or_else(|| failure(format!("module {} not found", name)))?;

        let mut engine = sandboxed_engine();
        engine.set_module_resolver(CacheResolver {
            cache: self.clone(),
            loader: Arc::clone(loader),
        });
        let ast = engine
            .compile(&source)
            .map_err(|e| failure(format!("{}: {}", name, e)))?;
        let module = Module::eval_ast_as_new(Scope::new(), &ast, &engine)
            .map_err(|e| failure(format!("{}: {}", name, e)))?;
        debug!("Compiled module {}", name);
        Ok(Arc::new(module))
    }
}

/// Follow entry → owner → owner's wait target until the chain ends.
/// Returns the module chain when it leads back to `loader`.
fn wait_chain(entry: &Arc<Entry>, loader: &Arc<Loader>) -> Option<Vec<String>> {
    let mut chain = vec![entry.name.clone()];
    let mut owner = Arc::clone(&entry.owner);
    let mut visited = HashSet::new();
    loop {
        if Arc::ptr_eq(&owner, loader) {
            return Some(chain);
        }
        if !visited.insert(Arc::as_ptr(&owner)) {
            return None;
        }
        let next = lock(&owner.waiting_for).clone()?;
        // a finished entry releases its waiter
        if next.is_ready() {
            return None;
        }
        chain.push(next.name.clone());
        owner = Arc::clone(&next.owner);
    }
}

/// Resolves `import "name" as alias;` through the cache
pub struct CacheResolver {
    cache: ModuleCache,
    loader: Arc<Loader>,
}

impl ModuleResolver for CacheResolver {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> std::result::Result<Arc<Module>, Box<EvalAltResult>> {
        self.cache
            .load_as(&module_name(path), &self.loader)
            .map_err(|failure| {
                Box::new(EvalAltResult::ErrorInModule(
                    path.to_string(),
                    Box::new(EvalAltResult::ErrorRuntime(failure.message.into(), pos)),
                    pos,
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts loads and can stall them to widen race windows
    struct SlowSource {
        modules: BTreeMap<String, String>,
        delay: Duration,
        loads: AtomicUsize,
    }

    impl SlowSource {
        fn new(modules: &[(&str, &str)], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                modules: modules
                    .iter()
                    .map(|(n, s)| (n.to_string(), s.to_string()))
                    .collect(),
                delay,
                loads: AtomicUsize::new(0),
            })
        }
    }

    impl ModuleSource for SlowSource {
        fn source(&self, name: &str) -> Option<String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.modules.get(name).cloned()
        }
    }

    #[test]
    fn test_load_with_imports() {
        let source = SlowSource::new(
            &[
                ("main", "import \"util\" as util;\nfn reconcile(obj) { util::double(2) }"),
                ("util", "fn double(x) { x * 2 }"),
            ],
            Duration::ZERO,
        );
        let cache = ModuleCache::new(source.clone());

        cache.load("main.rhai").unwrap();
        cache.load("util").unwrap();

        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_loads_compile_once() {
        let source = SlowSource::new(&[("main", "fn reconcile(obj) { obj }")], Duration::from_millis(100));
        let cache = ModuleCache::new(source.clone());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.load("main").is_ok())
            })
            .collect();
        for thread in threads {
            assert!(thread.join().unwrap());
        }

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_import_is_a_cycle() {
        let source = SlowSource::new(&[("a", "import \"a\" as a;")], Duration::ZERO);
        let cache = ModuleCache::new(source);

        let err = cache.load("a").unwrap_err();

        assert!(matches!(err, ControllerError::ModuleCycle(_)), "got {}", err);
    }

    #[test]
    fn test_concurrent_cycle_fails_in_bounded_time() {
        let source = SlowSource::new(
            &[("a", "import \"b\" as b;"), ("b", "import \"a\" as a;")],
            Duration::from_millis(50),
        );
        let cache = ModuleCache::new(source);
        let (tx, rx) = std::sync::mpsc::channel();

        for name in ["a", "b"] {
            let cache = cache.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let _ = tx.send(cache.load(name));
            });
        }

        for _ in 0..2 {
            let result = rx.recv_timeout(Duration::from_secs(5)).expect("cyclic load hung");
            assert!(matches!(result, Err(ControllerError::ModuleCycle(_))));
        }
    }

    #[test]
    fn test_missing_module_is_load_error() {
        let cache = ModuleCache::new(SlowSource::new(&[], Duration::ZERO));

        let err = cache.load("nope").unwrap_err();

        assert!(matches!(err, ControllerError::ModuleLoad(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_code_modules_first_definition_wins() {
        let first = crate::test_utils::widget_config("script", "main.rhai", &[("main.rhai", "1")]);
        let mut second = first.clone();
        second.name = "other".to_string();
        second.code.insert("main.rhai".to_string(), "2".to_string());

        let modules = CodeModules::from_configs([&first, &second]);

        assert_eq!(modules.source("main").as_deref(), Some("1"));
        assert_eq!(modules.source("main.rhai"), None);
    }
}
