// Plugin Registry - Ordered lazy factories for plugin instances
//
// Factories are kept in registration order together with an explicit order key.
// Building sorts by (order, registration sequence) and invokes each factory once.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use super::Plugin;

/// Deferred plugin constructor
pub type PluginFactoryFn = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Registry Entries
// ─────────────────────────────────────────────────────────────────────────────

/// Entry in the plugin registry
struct PluginFactory {
    identifier: String,
    order: i32,
    /// Position in registration history, used as the tiebreak for equal orders
    sequence: u64,
    build: PluginFactoryFn,
}

/// Ordered view of one registry entry (without building it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEntry {
    pub identifier: String,
    pub order: i32,
}

#[derive(Default)]
struct RegistryState {
    factories: Vec<PluginFactory>,
    next_sequence: u64,
    /// Registrants already applied by discovery
    applied: HashSet<&'static str>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Registry
// ─────────────────────────────────────────────────────────────────────────────

static GLOBAL: Lazy<PluginRegistry> = Lazy::new(PluginRegistry::new);

/// Registry of plugin factories
///
/// All reads and writes go through one mutex, so callers can share the
/// registry freely. Factories are never invoked while the lock is held.
pub struct PluginRegistry {
    state: Mutex<RegistryState>,
    /// Held for a whole discovery pass
    discovery: Mutex<()>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            discovery: Mutex::new(()),
        }
    }

    /// The process-wide registry used by `discover`
    pub fn global() -> &'static PluginRegistry {
        &GLOBAL
    }

    /// Register a plugin factory
    ///
    /// Registering an identifier again replaces the earlier entry: the new
    /// factory and order key win, and the entry moves to the end of the
    /// registration sequence.
    pub fn register<F>(&self, identifier: impl Into<String>, order: i32, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        let mut state = self.state.lock();

        let before = state.factories.len();
        state.factories.retain(|f| f.identifier != identifier);
        if state.factories.len() != before {
            tracing::debug!(plugin = %identifier, order, "Replacing plugin registration");
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.factories.push(PluginFactory {
            identifier,
            order,
            sequence,
            build: Arc::new(factory),
        });
    }

    /// Build every registered plugin, ordered by `order` then registration sequence
    ///
    /// Each call invokes every factory again and returns fresh instances.
    pub fn build_all(&self) -> Vec<Box<dyn Plugin>> {
        let factories: Vec<(String, PluginFactoryFn)> = self
            .sorted(|f| (f.identifier.clone(), Arc::clone(&f.build)));

        factories
            .into_iter()
            .map(|(identifier, build)| {
                let plugin = build();
                tracing::trace!(plugin = %identifier, "Built plugin");
                plugin
            })
            .collect()
    }

    /// Registered entries in build order
    pub fn entries(&self) -> Vec<PluginEntry> {
        self.sorted(|f| PluginEntry {
            identifier: f.identifier.clone(),
            order: f.order,
        })
    }

    /// Check if an identifier is registered
    pub fn contains(&self, identifier: &str) -> bool {
        self.state
            .lock()
            .factories
            .iter()
            .any(|f| f.identifier == identifier)
    }

    /// Get the number of registered factories
    pub fn len(&self) -> usize {
        self.state.lock().factories.len()
    }

    /// Check if there are no registered factories
    pub fn is_empty(&self) -> bool {
        self.state.lock().factories.is_empty()
    }

    /// Serialize discovery passes; a concurrent pass waits until this one has
    /// finished registering
    pub(crate) fn lock_discovery(&self) -> MutexGuard<'_, ()> {
        self.discovery.lock()
    }

    /// Record that a discovery registrant ran; false if it already had
    pub(crate) fn mark_applied(&self, registrant: &'static str) -> bool {
        self.state.lock().applied.insert(registrant)
    }

    fn sorted<T>(&self, project: impl Fn(&PluginFactory) -> T) -> Vec<T> {
        let state = self.state.lock();
        let mut refs: Vec<&PluginFactory> = state.factories.iter().collect();
        refs.sort_by_key(|f| (f.order, f.sequence));
        refs.into_iter().map(project).collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("entries", &self.entries())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named(String);

    impl Plugin for Named {
        fn id(&self) -> &str {
            &self.0
        }
    }

    fn named(id: &'static str) -> impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static {
        move || Box::new(Named(id.to_string())) as Box<dyn Plugin>
    }

    fn ids(plugins: &[Box<dyn Plugin>]) -> Vec<&str> {
        plugins.iter().map(|p| p.id()).collect()
    }

    #[test]
    fn test_build_all_orders_by_order_then_sequence() {
        let registry = PluginRegistry::new();
        registry.register("A", 5, named("A"));
        registry.register("B", 1, named("B"));
        registry.register("C", 1, named("C"));

        let plugins = registry.build_all();
        assert_eq!(ids(&plugins), vec!["B", "C", "A"]);

        // Deterministic across repeated builds
        let again = registry.build_all();
        assert_eq!(ids(&again), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_build_all_invokes_each_factory_once_per_call() {
        let registry = PluginRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        registry.register("counted", 0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Named("counted".into())) as Box<dyn Plugin>
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        registry.build_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        registry.build_all();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_identifier_last_registration_wins() {
        let registry = PluginRegistry::new();
        registry.register("progress", 1, named("progress"));
        registry.register("control", 2, named("control"));
        registry.register("progress", 3, named("progress"));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.entries(),
            vec![
                PluginEntry { identifier: "control".into(), order: 2 },
                PluginEntry { identifier: "progress".into(), order: 3 },
            ]
        );
    }

    #[test]
    fn test_negative_and_equal_orders() {
        let registry = PluginRegistry::new();
        registry.register("late", 0, named("late"));
        registry.register("first", -10, named("first"));
        registry.register("also-late", 0, named("also-late"));

        assert_eq!(ids(&registry.build_all()), vec!["first", "late", "also-late"]);
    }

    #[test]
    fn test_concurrent_registration_keeps_order_invariant() {
        let registry = Arc::new(PluginRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("t{t}-{i}");
                        let plugin_id = id.clone();
                        registry.register(id, (i % 5) as i32, move || {
                            Box::new(Named(plugin_id.clone())) as Box<dyn Plugin>
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = registry.entries();
        assert_eq!(entries.len(), 400);
        assert!(entries.windows(2).all(|w| w[0].order <= w[1].order));

        // Within one thread, equal orders keep that thread's registration order
        for t in 0..8 {
            let prefix = format!("t{t}-");
            for order in 0..5 {
                let seen: Vec<usize> = entries
                    .iter()
                    .filter(|e| e.order == order && e.identifier.starts_with(&prefix))
                    .map(|e| e.identifier[prefix.len()..].parse().unwrap())
                    .collect();
                assert!(seen.windows(2).all(|w| w[0] < w[1]));
            }
        }

        let built = registry.build_all();
        let built_ids: Vec<&str> = ids(&built);
        let entry_ids: Vec<&str> = entries.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(built_ids, entry_ids);
    }

    #[test]
    fn test_mark_applied_is_once() {
        let registry = PluginRegistry::new();
        assert!(registry.mark_applied("unit"));
        assert!(!registry.mark_applied("unit"));
    }
}
