//! Plugin Discovery
//!
//! Every self-registering unit submits a [`Registrant`] at link time through
//! `register_plugin!`. `discover` walks the collected registrants and applies
//! each one to a registry at most once, so running discovery again (or listing
//! a registrant twice) never duplicates registrations.

use super::PluginRegistry;

/// A self-registering unit
pub struct Registrant {
    /// Unique registrant name, used to guard against double application
    pub name: &'static str,
    /// Registration entry point
    pub register: fn(&PluginRegistry),
}

inventory::collect!(Registrant);

/// What a discovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Registrants applied during this pass
    pub applied: Vec<&'static str>,
    /// Registrants skipped because they were already applied
    pub skipped: Vec<&'static str>,
}

/// Apply every link-time registrant to the registry
///
/// Registrants are applied sorted by name, which keeps registration sequence
/// (and therefore tie ordering) independent of link order. Passes over the
/// same registry are serialized: when this returns, every registrant has
/// finished registering, even if another thread applied it.
pub fn discover(registry: &PluginRegistry) -> DiscoveryReport {
    discover_from(registry, inventory::iter::<Registrant>.into_iter())
}

/// Apply an explicit list of registrants to the registry
pub fn discover_from<'a>(
    registry: &PluginRegistry,
    registrants: impl IntoIterator<Item = &'a Registrant>,
) -> DiscoveryReport {
    let mut registrants: Vec<&Registrant> = registrants.into_iter().collect();
    registrants.sort_by_key(|r| r.name);

    let _pass = registry.lock_discovery();
    let mut report = DiscoveryReport::default();
    for registrant in registrants {
        if registry.mark_applied(registrant.name) {
            (registrant.register)(registry);
            report.applied.push(registrant.name);
        } else {
            tracing::debug!(registrant = registrant.name, "Registrant already applied");
            report.skipped.push(registrant.name);
        }
    }

    tracing::info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        plugins = registry.len(),
        "Plugin discovery complete"
    );

    report
}

/// Submit a plugin factory for discovery
///
/// ```rust,ignore
/// cadence_runtime::register_plugin!(id = "library.hashes", order = 10, plugin = HashPlugin::new);
/// ```
///
/// `plugin` is any path callable with no arguments that returns the plugin.
#[macro_export]
macro_rules! register_plugin {
    (id = $id:expr, order = $order:expr, plugin = $ctor:path $(,)?) => {
        $crate::inventory::submit! {
            $crate::plugin::Registrant {
                name: $id,
                register: |registry: &$crate::plugin::PluginRegistry| {
                    registry.register($id, $order, || {
                        ::std::boxed::Box::new($ctor()) as ::std::boxed::Box<dyn $crate::plugin::Plugin>
                    });
                },
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Plugin;
    use std::time::Duration;

    struct Probe;

    impl Probe {
        fn new() -> Self {
            Probe
        }
    }

    impl Plugin for Probe {
        fn id(&self) -> &str {
            "test.probe"
        }
    }

    crate::register_plugin!(id = "test.probe", order = 7, plugin = Probe::new);

    fn register_alpha(registry: &PluginRegistry) {
        registry.register("alpha", 2, || Box::new(Probe) as Box<dyn Plugin>);
    }

    fn register_beta(registry: &PluginRegistry) {
        registry.register("beta", 2, || Box::new(Probe) as Box<dyn Plugin>);
    }

    #[test]
    fn test_discover_applies_link_time_registrants() {
        let registry = PluginRegistry::new();
        let report = discover(&registry);

        assert!(report.applied.contains(&"test.probe"));
        assert!(registry.contains("test.probe"));
        assert!(registry.entries().iter().any(|e| e.identifier == "test.probe" && e.order == 7));
    }

    #[test]
    fn test_second_discovery_is_a_no_op() {
        let registry = PluginRegistry::new();
        discover(&registry);
        let count = registry.len();

        let report = discover(&registry);
        assert!(report.applied.is_empty());
        assert!(report.skipped.contains(&"test.probe"));
        assert_eq!(registry.len(), count);
    }

    fn register_slowly(registry: &PluginRegistry) {
        std::thread::sleep(Duration::from_millis(300));
        registry.register("slow", 1, || Box::new(Probe) as Box<dyn Plugin>);
    }

    static SLOW: [Registrant; 1] = [Registrant {
        name: "slow",
        register: register_slowly,
    }];

    #[test]
    fn test_concurrent_pass_waits_for_registration() {
        let registry = PluginRegistry::new();

        std::thread::scope(|scope| {
            let first = scope.spawn(|| discover_from(&registry, &SLOW));

            std::thread::sleep(Duration::from_millis(50));
            let second = discover_from(&registry, &SLOW);
            // Whichever pass applied it, the factory is in place on return
            assert_eq!(registry.build_all().len(), 1);

            let first = first.join().unwrap();
            let mut applied = [first.applied, second.applied].concat();
            let mut skipped = [first.skipped, second.skipped].concat();
            applied.sort();
            skipped.sort();
            assert_eq!(applied, vec!["slow"]);
            assert_eq!(skipped, vec!["slow"]);
        });
    }

    #[test]
    fn test_curated_list_is_applied_in_name_order() {
        let registrants = [
            Registrant { name: "beta", register: register_beta },
            Registrant { name: "alpha", register: register_alpha },
            Registrant { name: "alpha", register: register_alpha },
        ];
        let registry = PluginRegistry::new();

        let report = discover_from(&registry, &registrants);

        assert_eq!(report.applied, vec!["alpha", "beta"]);
        assert_eq!(report.skipped, vec!["alpha"]);
        let ids: Vec<String> = registry.entries().into_iter().map(|e| e.identifier).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
