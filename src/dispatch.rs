//! Decides which bindings and ties fire for a change and what they do.
//!
//! [`Dispatcher::dispatch`] is a pure planning step: it reads the registry
//! but never writes to it. The returned [`Action`]s are ordered so that
//! every binding (direct ones first, then pattern ones) precedes every tie
//! write; the session performs them in that order.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::binding::{Binding, CompiledRef, CompiledTrigger, Pattern, Tie};
use crate::protocol::{AspectValue, BindingMessage};
use crate::store::{AspectStore, Aspects, Registry};
use crate::transform::{self, Transform};

/// One effect of a dispatch pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a `binding` frame over the socket.
    Send(BindingMessage),
    /// Perform a binding `PATCH` call and apply its output.
    Call(BindingMessage),
    /// Merge `aspects` into the store of `identity` and dispatch again.
    Write {
        /// Target identity.
        identity: String,
        /// Aspects to merge.
        aspects: Aspects,
    },
}

#[derive(Debug)]
struct CompiledBinding {
    id: usize,
    trigger: CompiledTrigger,
    states: Vec<CompiledRef>,
    key: String,
    call: bool,
}

#[derive(Debug)]
struct CompiledTie {
    id: usize,
    trigger: CompiledTrigger,
    targets: Vec<CompiledRef>,
    transforms: Vec<Transform>,
}

/// Compiled binding and tie tables for one bootstrapped page.
#[derive(Debug, Default)]
pub struct Dispatcher {
    /// Exact bindings keyed by trigger identity, then aspect.
    direct: BTreeMap<String, BTreeMap<String, Vec<CompiledBinding>>>,
    /// Bindings whose trigger is a pattern, in bootstrap order.
    patterned: Vec<CompiledBinding>,
    ties: Vec<CompiledTie>,
}

impl Dispatcher {
    /// Compile the bootstrap rules. Rules with an invalid pattern are
    /// logged and dropped.
    pub fn new(bindings: Vec<Binding>, ties: Vec<Tie>) -> Self {
        let mut dispatcher = Self::default();
        let mut next_id = 0;
        let mut allocate = || {
            next_id += 1;
            next_id
        };

        for binding in bindings {
            let compiled = CompiledTrigger::compile(&binding.trigger).and_then(|trigger| {
                let states = binding
                    .states
                    .iter()
                    .map(|state| CompiledRef::compile(state, false))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((trigger, states))
            });
            let (trigger, states) = match compiled {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::warn!(key = %binding.key, error = %e, "dropping binding");
                    continue;
                }
            };
            let compiled = CompiledBinding {
                id: allocate(),
                trigger,
                states,
                key: binding.key,
                call: binding.call,
            };
            match (
                compiled.trigger.identity.as_exact(),
                compiled.trigger.aspect.as_exact(),
            ) {
                (Some(identity), Some(aspect)) => {
                    let (identity, aspect) = (identity.to_owned(), aspect.to_owned());
                    dispatcher
                        .direct
                        .entry(identity)
                        .or_default()
                        .entry(aspect)
                        .or_default()
                        .push(compiled);
                }
                _ => dispatcher.patterned.push(compiled),
            }
        }

        for tie in ties {
            let compiled = CompiledTrigger::compile(&tie.trigger).and_then(|trigger| {
                let exact = tie.targets.iter().map(|t| CompiledRef::compile(t, false));
                let patterns = tie.regex_targets.iter().map(|t| CompiledRef::compile(t, true));
                let targets = exact.chain(patterns).collect::<Result<Vec<_>, _>>()?;
                Ok((trigger, targets))
            });
            match compiled {
                Ok((trigger, targets)) => dispatcher.ties.push(CompiledTie {
                    id: allocate(),
                    trigger,
                    targets,
                    transforms: tie.transforms,
                }),
                Err(e) => tracing::warn!(
                    identity = %tie.trigger.identity,
                    aspect = %tie.trigger.aspect,
                    error = %e,
                    "dropping tie"
                ),
            }
        }

        dispatcher
    }

    /// Whether any binding travels over the websocket.
    pub fn needs_socket(&self) -> bool {
        self.bindings().any(|b| !b.call)
    }

    /// Number of live bindings.
    pub fn binding_count(&self) -> usize {
        self.bindings().count()
    }

    /// Number of live ties.
    pub fn tie_count(&self) -> usize {
        self.ties.len()
    }

    fn bindings(&self) -> impl Iterator<Item = &CompiledBinding> {
        self.direct
            .values()
            .flat_map(|aspects| aspects.values().flatten())
            .chain(&self.patterned)
    }

    /// Plan the effects of `changed` aspects on `identity`.
    ///
    /// `initial` marks the dispatch a store performs right after mounting;
    /// `skip_initial` rules sit it out. Rules flagged `once` fire at most
    /// once and are removed afterwards.
    pub fn dispatch(
        &mut self,
        page: &str,
        identity: &str,
        changed: &Aspects,
        initial: bool,
        registry: &Registry,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut spent = HashSet::new();

        if let Some(by_aspect) = self.direct.get(identity) {
            for (aspect, value) in changed {
                for binding in by_aspect.get(aspect).into_iter().flatten() {
                    if binding.trigger.applies(initial)
                        && claim(&mut spent, binding.id, binding.trigger.once)
                    {
                        actions.push(binding_action(
                            binding, page, identity, aspect, value, registry,
                        ));
                    }
                }
            }
        }

        for binding in &self.patterned {
            for (aspect, value) in changed {
                if binding.trigger.matches(identity, aspect)
                    && binding.trigger.applies(initial)
                    && claim(&mut spent, binding.id, binding.trigger.once)
                {
                    actions.push(binding_action(
                        binding, page, identity, aspect, value, registry,
                    ));
                }
            }
        }

        for tie in &self.ties {
            for (aspect, value) in changed {
                if !tie.trigger.matches(identity, aspect)
                    || !tie.trigger.applies(initial)
                    || !claim(&mut spent, tie.id, tie.trigger.once)
                {
                    continue;
                }
                let output = transform::apply(&tie.transforms, value.clone(), registry);
                for target in &tie.targets {
                    plan_writes(target, &output, registry, &mut actions);
                }
            }
        }

        if !spent.is_empty() {
            self.prune(&spent);
        }
        actions
    }

    fn prune(&mut self, spent: &HashSet<usize>) {
        for by_aspect in self.direct.values_mut() {
            for bindings in by_aspect.values_mut() {
                bindings.retain(|b| !spent.contains(&b.id));
            }
            by_aspect.retain(|_, bindings| !bindings.is_empty());
        }
        self.direct.retain(|_, by_aspect| !by_aspect.is_empty());
        self.patterned.retain(|b| !spent.contains(&b.id));
        self.ties.retain(|t| !spent.contains(&t.id));
        tracing::debug!(rules = spent.len(), "pruned once rules");
    }
}

/// Record that rule `id` fired; `false` if it is a `once` rule that already
/// fired in this pass.
fn claim(spent: &mut HashSet<usize>, id: usize, once: bool) -> bool {
    !once || spent.insert(id)
}

fn binding_action(
    binding: &CompiledBinding,
    page: &str,
    identity: &str,
    aspect: &str,
    value: &Value,
    registry: &Registry,
) -> Action {
    let message = BindingMessage {
        trigger: AspectValue::new(identity, aspect, value.clone()),
        states: collect_states(&binding.states, registry),
        page: page.to_owned(),
        key: binding.key.clone(),
    };
    if binding.call {
        Action::Call(message)
    } else {
        Action::Send(message)
    }
}

/// Current values of the state refs. Exact refs always contribute (null
/// when missing); pattern refs contribute one entry per matching aspect of
/// every matching store.
fn collect_states(refs: &[CompiledRef], registry: &Registry) -> Vec<AspectValue> {
    let mut states = Vec::new();
    for state in refs {
        if let Some((identity, aspect)) = state.as_exact() {
            let value = registry
                .get(identity)
                .and_then(|store| store.get_aspect(aspect))
                .unwrap_or(Value::Null);
            states.push(AspectValue::new(identity, aspect, value));
            continue;
        }
        for store in matching_stores(&state.identity, registry) {
            for (aspect, value) in store.aspects() {
                if state.aspect.matches(&aspect) {
                    states.push(AspectValue::new(store.identity(), aspect, value));
                }
            }
        }
    }
    states
}

fn matching_stores<'r>(identity: &Pattern, registry: &'r Registry) -> Vec<&'r AspectStore> {
    match identity.as_exact() {
        Some(identity) => registry.get(identity).into_iter().collect(),
        None => registry
            .stores()
            .filter(|store| identity.matches(store.identity()))
            .collect(),
    }
}

fn plan_writes(
    target: &CompiledRef,
    output: &Value,
    registry: &Registry,
    actions: &mut Vec<Action>,
) {
    let stores = matching_stores(&target.identity, registry);
    if stores.is_empty() {
        tracing::debug!(identity = ?target.identity, "tie target not mounted, skipping");
    }
    for store in stores {
        let aspects: Aspects = match &target.aspect {
            Pattern::Exact(name) => Aspects::from_iter([(name.clone(), output.clone())]),
            Pattern::Regex(re) => store
                .match_aspects(re)
                .into_iter()
                .map(|(name, _)| (name, output.clone()))
                .collect(),
        };
        if aspects.is_empty() {
            continue;
        }
        actions.push(Action::Write {
            identity: store.identity().to_owned(),
            aspects,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{AspectRef, Trigger};
    use crate::store::test_support::{as_map, mounted};
    use serde_json::json;

    fn registry(entries: &[(&str, Value)]) -> Registry {
        let mut registry = Registry::new();
        for (identity, aspects) in entries {
            registry.register(mounted(identity, aspects.clone()));
        }
        registry
    }

    fn binding(trigger: Trigger, key: &str) -> Binding {
        Binding {
            trigger,
            states: Vec::new(),
            key: key.into(),
            call: false,
        }
    }

    fn keys(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .map(|action| match action {
                Action::Send(m) => format!("send:{}", m.key),
                Action::Call(m) => format!("call:{}", m.key),
                Action::Write { identity, .. } => format!("write:{identity}"),
            })
            .collect()
    }

    #[test]
    fn once_binding_fires_a_single_time() {
        let reg = registry(&[("btn", json!({"clicks": 0}))]);
        let once = Trigger {
            once: true,
            ..Trigger::new("btn", "clicks")
        };
        let mut dispatcher = Dispatcher::new(vec![binding(once, "first")], vec![]);

        let changed = as_map(json!({"clicks": 1}));
        let first = dispatcher.dispatch("home", "btn", &changed, false, &reg);
        let second = dispatcher.dispatch("home", "btn", &changed, false, &reg);
        assert_eq!(keys(&first), vec!["send:first"]);
        assert!(second.is_empty());
        assert_eq!(dispatcher.binding_count(), 0);
    }

    #[test]
    fn skip_initial_sits_out_the_mount_dispatch() {
        let reg = registry(&[("input", json!({"value": ""}))]);
        let trigger = Trigger {
            skip_initial: true,
            ..Trigger::new("input", "value")
        };
        let mut dispatcher = Dispatcher::new(vec![binding(trigger, "typed")], vec![]);
        let changed = as_map(json!({"value": "a"}));
        assert!(dispatcher.dispatch("p", "input", &changed, true, &reg).is_empty());
        let later = dispatcher.dispatch("p", "input", &changed, false, &reg);
        assert_eq!(keys(&later), vec!["send:typed"]);
    }

    #[test]
    fn pattern_binding_reaches_identities_unknown_at_bootstrap() {
        let trigger = Trigger {
            regex: true,
            ..Trigger::new("^row-", "^value$")
        };
        let mut dispatcher = Dispatcher::new(vec![binding(trigger, "row")], vec![]);
        let reg = registry(&[("row-42", json!({"value": 1}))]);

        let actions = dispatcher.dispatch("p", "row-42", &as_map(json!({"value": 2})), false, &reg);
        let [Action::Send(message)] = actions.as_slice() else {
            panic!("expected one send, got {actions:?}");
        };
        assert_eq!(message.trigger, AspectValue::new("row-42", "value", json!(2)));
    }

    #[test]
    fn bindings_precede_ties_and_direct_precede_patterns() {
        let reg = registry(&[("slider", json!({"value": 1})), ("label", json!({"text": ""}))]);
        let pattern = Trigger {
            regex: true,
            ..Trigger::new("slid", "val")
        };
        let tie = Tie {
            trigger: Trigger::new("slider", "value"),
            targets: vec![AspectRef::new("label", "text")],
            regex_targets: vec![],
            transforms: vec![Transform::new("ToString")],
        };
        let mut dispatcher = Dispatcher::new(
            vec![
                binding(pattern, "pattern"),
                binding(Trigger::new("slider", "value"), "direct"),
            ],
            vec![tie],
        );
        let actions = dispatcher.dispatch("p", "slider", &as_map(json!({"value": 5})), false, &reg);
        assert_eq!(keys(&actions), vec!["send:direct", "send:pattern", "write:label"]);
        assert_eq!(
            actions[2],
            Action::Write {
                identity: "label".into(),
                aspects: as_map(json!({"text": "5"})),
            }
        );
    }

    #[test]
    fn states_collect_exact_and_pattern_refs() {
        let reg = registry(&[
            ("form", json!({"field_a": 1, "field_b": 2, "title": "t"})),
            ("other", json!({"field_c": 3})),
        ]);
        let mut b = binding(Trigger::new("form", "title"), "save");
        b.call = true;
        b.states = vec![
            AspectRef::new("missing", "value"),
            AspectRef::pattern("^form$", "^field_"),
        ];
        let mut dispatcher = Dispatcher::new(vec![b], vec![]);
        let actions = dispatcher.dispatch("p", "form", &as_map(json!({"title": "u"})), false, &reg);
        let [Action::Call(message)] = actions.as_slice() else {
            panic!("expected one call, got {actions:?}");
        };
        assert_eq!(
            message.states,
            vec![
                AspectValue::new("missing", "value", Value::Null),
                AspectValue::new("form", "field_a", json!(1)),
                AspectValue::new("form", "field_b", json!(2)),
            ]
        );
    }

    #[test]
    fn regex_targets_fan_out_over_matching_aspects() {
        let reg = registry(&[
            ("src", json!({"v": 1})),
            ("card-1", json!({"color_bg": "", "color_fg": "", "size": 1})),
            ("card-2", json!({"size": 2})),
        ]);
        let tie = Tie {
            trigger: Trigger::new("src", "v"),
            targets: vec![],
            regex_targets: vec![AspectRef::new("^card-", "^color_")],
            transforms: vec![Transform::new("Constant").arg("value", "red")],
        };
        let mut dispatcher = Dispatcher::new(vec![], vec![tie]);
        let actions = dispatcher.dispatch("p", "src", &as_map(json!({"v": 2})), false, &reg);
        assert_eq!(
            actions,
            vec![Action::Write {
                identity: "card-1".into(),
                aspects: as_map(json!({"color_bg": "red", "color_fg": "red"})),
            }]
        );
    }

    #[test]
    fn tie_on_unmounted_target_is_skipped() {
        let reg = registry(&[("src", json!({"v": 1}))]);
        let tie = Tie {
            trigger: Trigger::new("src", "v"),
            targets: vec![AspectRef::new("gone", "v")],
            regex_targets: vec![],
            transforms: vec![],
        };
        let mut dispatcher = Dispatcher::new(vec![], vec![tie]);
        assert!(dispatcher.dispatch("p", "src", &as_map(json!({"v": 2})), false, &reg).is_empty());
        assert_eq!(dispatcher.tie_count(), 1);
    }

    #[test]
    fn once_tie_is_pruned_by_id_even_when_targets_match_another_tie() {
        let reg = registry(&[("src", json!({"v": 1})), ("dst", json!({"v": 0}))]);
        let make = |once| Tie {
            trigger: Trigger {
                once,
                ..Trigger::new("src", "v")
            },
            targets: vec![AspectRef::new("dst", "v")],
            regex_targets: vec![],
            transforms: vec![],
        };
        let mut dispatcher = Dispatcher::new(vec![], vec![make(true), make(false)]);
        let changed = as_map(json!({"v": 2}));
        assert_eq!(dispatcher.dispatch("p", "src", &changed, false, &reg).len(), 2);
        assert_eq!(dispatcher.dispatch("p", "src", &changed, false, &reg).len(), 1);
        assert_eq!(dispatcher.tie_count(), 1);
    }

    #[test]
    fn invalid_patterns_drop_only_their_rule() {
        let broken = Trigger {
            regex: true,
            ..Trigger::new("(", "x")
        };
        let dispatcher = Dispatcher::new(
            vec![binding(broken, "broken"), binding(Trigger::new("a", "b"), "ok")],
            vec![],
        );
        assert_eq!(dispatcher.binding_count(), 1);
    }

    #[test]
    fn socket_needed_only_for_non_call_bindings() {
        let mut call = binding(Trigger::new("a", "b"), "rpc");
        call.call = true;
        assert!(!Dispatcher::new(vec![call.clone()], vec![]).needs_socket());
        let mixed = vec![call, binding(Trigger::new("a", "c"), "ws")];
        assert!(Dispatcher::new(mixed, vec![]).needs_socket());
    }
}
