//! Reconciliation of prior state with new configuration.
//!
//! [`proposed_new`] merges the computed attribute values of a prior object
//! into the configured values, producing the value that is handed to the
//! provider for planning. Nested blocks are correlated according to their
//! nesting mode; for sets that correlation is a heuristic based on the
//! non-computed attributes of each element.

use crate::{
    schema::{Attribute, Block, NestedBlock, NestingMode, Object},
    value::{PathStep, Value},
};
use std::collections::BTreeMap;

/// Combine the computed attribute values from `prior` with the configured
/// attribute values from `config`.
///
/// `prior` must be wholly known or null. `config` may contain unknowns.
pub fn proposed_new(schema: &Block, prior: &Value, config: &Value) -> Value {
    // Avoids materializing an empty block that neither side has.
    if config.is_null() && prior.is_null() {
        return prior.clone();
    }
    if prior.is_null() {
        let empty = schema.empty_value();
        return proposed_new_block(schema, &empty, config);
    }
    proposed_new_block(schema, prior, config)
}

/// The planned value of a data source: computed attributes that are not set
/// in the configuration become unknown, to be filled in when it is read.
pub fn planned_data_resource_object(schema: &Block, config: &Value) -> Value {
    proposed_new_block(schema, &Value::Unknown, config)
}

fn proposed_new_block(schema: &Block, prior: &Value, config: &Value) -> Value {
    if config.is_null() || config.is_unknown() {
        return prior.clone();
    }
    let mut attrs = proposed_new_attributes(&schema.attributes, prior, config);
    for (name, nested) in &schema.block_types {
        let v = proposed_new_nested_block(nested, &prior.get_attr(name), &config.get_attr(name));
        attrs.insert(name.clone(), v);
    }
    Value::Object(attrs)
}

/// The schema of the elements of a nested collection.
#[derive(Clone, Copy)]
enum ElementSchema<'a> {
    Block(&'a Block),
    Object(&'a Object),
}

impl ElementSchema<'_> {
    fn attribute_by_path(&self, path: &[PathStep]) -> Option<&Attribute> {
        match self {
            ElementSchema::Block(block) => block.attribute_by_path(path),
            ElementSchema::Object(object) => object.attribute_by_path(path),
        }
    }

    fn propose(&self, prior: &Value, config: &Value) -> Value {
        match self {
            ElementSchema::Block(block) => proposed_new(block, prior, config),
            ElementSchema::Object(object) => proposed_new_object_attributes(object, prior, config),
        }
    }
}

fn proposed_new_nested_block(schema: &NestedBlock, prior: &Value, config: &Value) -> Value {
    // Reconciliation of unknown blocks is deferred until they are known.
    if config.is_unknown() {
        return config.clone();
    }
    match schema.nesting {
        NestingMode::Single if config.is_null() => config.clone(),
        NestingMode::Single | NestingMode::Group => proposed_new(&schema.block, prior, config),
        NestingMode::List => proposed_new_nesting_list(ElementSchema::Block(&schema.block), prior, config),
        NestingMode::Map => proposed_new_nesting_map(ElementSchema::Block(&schema.block), prior, config),
        NestingMode::Set => proposed_new_nesting_set(ElementSchema::Block(&schema.block), prior, config),
    }
}

fn proposed_new_nested_type(schema: &Object, prior: &Value, config: &Value) -> Value {
    if config.is_unknown() {
        return config.clone();
    }
    match schema.nesting {
        NestingMode::Single | NestingMode::Group if config.is_null() => config.clone(),
        NestingMode::Single | NestingMode::Group => proposed_new_object_attributes(schema, prior, config),
        NestingMode::List => proposed_new_nesting_list(ElementSchema::Object(schema), prior, config),
        NestingMode::Map => proposed_new_nesting_map(ElementSchema::Object(schema), prior, config),
        NestingMode::Set => proposed_new_nesting_set(ElementSchema::Object(schema), prior, config),
    }
}

fn proposed_new_nesting_list(schema: ElementSchema, prior: &Value, config: &Value) -> Value {
    let Value::List(config_items) = config else {
        return config.clone();
    };
    if config_items.is_empty() {
        return config.clone();
    }
    let prior_items = match prior {
        Value::List(items) => Some(items),
        _ => None,
    };
    let mut new_items = Vec::with_capacity(config_items.len());
    for (idx, config_ev) in config_items.iter().enumerate() {
        // An index the prior value does not have is wholly new.
        let prior_ev = match prior_items {
            Some(items) => match items.get(idx) {
                Some(prior_ev) => prior_ev.clone(),
                None => {
                    new_items.push(config_ev.clone());
                    continue;
                }
            },
            None if prior.is_unknown() => Value::Unknown,
            None => {
                new_items.push(config_ev.clone());
                continue;
            }
        };
        new_items.push(schema.propose(&prior_ev, config_ev));
    }
    Value::List(new_items)
}

fn proposed_new_nesting_map(schema: ElementSchema, prior: &Value, config: &Value) -> Value {
    let Value::Map(config_items) = config else {
        return config.clone();
    };
    if config_items.is_empty() {
        return config.clone();
    }
    let empty = BTreeMap::new();
    let prior_items = match prior {
        Value::Map(items) => items,
        _ => &empty,
    };
    let new_items = config_items
        .iter()
        .map(|(key, config_ev)| {
            let v = match prior_items.get(key) {
                Some(prior_ev) => schema.propose(prior_ev, config_ev),
                None => config_ev.clone(),
            };
            (key.clone(), v)
        })
        .collect();
    Value::Map(new_items)
}

fn proposed_new_nesting_set(schema: ElementSchema, prior: &Value, config: &Value) -> Value {
    let Value::Set(config_items) = config else {
        return config.clone();
    };
    if config_items.is_empty() {
        return config.clone();
    }

    // Each prior element paired with its comparable projection.
    let compare_values: Vec<(&Value, Value)> = match prior {
        Value::Set(prior_items) => prior_items
            .iter()
            .map(|ev| (ev, set_element_computed_as_null(schema, ev)))
            .collect(),
        _ => Vec::new(),
    };

    // Several prior elements may share a projection; each is used only once.
    let mut used = vec![false; compare_values.len()];
    let mut new_items = Vec::with_capacity(config_items.len());
    for config_ev in config_items {
        let mut prior_ev = Value::Null;
        for (i, (candidate, projection)) in compare_values.iter().enumerate() {
            if used[i] {
                continue;
            }
            if projection == config_ev {
                prior_ev = (*candidate).clone();
                used[i] = true;
                break;
            }
        }
        new_items.push(schema.propose(&prior_ev, config_ev));
    }
    Value::set(new_items)
}

fn proposed_new_object_attributes(schema: &Object, prior: &Value, config: &Value) -> Value {
    if config.is_null() {
        return config.clone();
    }
    Value::Object(proposed_new_attributes(&schema.attributes, prior, config))
}

fn proposed_new_attributes(
    attrs: &BTreeMap<String, Attribute>,
    prior: &Value,
    config: &Value,
) -> BTreeMap<String, Value> {
    attrs
        .iter()
        .map(|(name, attr)| {
            let prior_v = prior.get_attr(name);
            let config_v = config.get_attr(name);
            let new_v = if attr.computed && config_v.is_null() {
                if optional_value_not_computable(attr, &prior_v) {
                    config_v
                } else {
                    prior_v
                }
            } else if let Some(nested) = &attr.nested_type {
                proposed_new_nested_type(nested, &prior_v, &config_v)
            } else {
                config_v
            };
            (name.clone(), new_v)
        })
        .collect()
}

/// Replace every computed attribute in a set element with null, leaving only
/// what configuration could have produced.
fn set_element_computed_as_null(schema: ElementSchema, elem: &Value) -> Value {
    elem.clone().transform(&mut |path, v| {
        if v.is_null() || v.is_unknown() {
            return v;
        }
        match schema.attribute_by_path(path) {
            Some(attr) if attr.computed => Value::Null,
            _ => v,
        }
    })
}

/// Whether a prior value for an optional+computed attribute with a nested
/// type was set by configuration rather than computed by the provider. That
/// is the case when any attribute inside it that is not computed has a
/// non-null value. A configured null must then be honoured.
fn optional_value_not_computable(attr: &Attribute, value: &Value) -> bool {
    if !attr.optional {
        return false;
    }
    let Some(nested) = &attr.nested_type else {
        return false;
    };
    let mut found_non_computed = false;
    value.walk(&mut |path, v| {
        if v.is_null() {
            return true;
        }
        match nested.attribute_by_path(path) {
            Some(attr) if !attr.computed => {
                found_non_computed = true;
                false
            }
            _ => true,
        }
    });
    found_non_computed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Type;
    use proptest::prelude::*;

    fn attrs(list: Vec<(&str, Attribute)>) -> BTreeMap<String, Attribute> {
        list.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn foo_schema() -> Block {
        Block {
            attributes: attrs(vec![("foo", Attribute::optional_computed(Type::String))]),
            ..Default::default()
        }
    }

    #[test]
    fn computed_attribute_keeps_prior_when_unset() {
        let schema = foo_schema();
        let prior = Value::object([("foo", Value::from("x"))]);
        let config = Value::object([("foo", Value::Null)]);
        assert_eq!(proposed_new(&schema, &prior, &config), prior);
    }

    #[test]
    fn configured_nested_attribute_is_not_treated_as_computed() {
        // `foo` was set through configuration: its non-computed `bar` is set
        // in the prior value. Removing it from the configuration must
        // propose null rather than keep the old value.
        let nested = Object {
            attributes: attrs(vec![
                ("bar", Attribute::optional(Type::String)),
                ("id", Attribute::computed(Type::String)),
            ]),
            nesting: NestingMode::Single,
        };
        let schema = Block {
            attributes: attrs(vec![
                ("name", Attribute::optional(Type::String)),
                ("foo", Attribute::optional_computed(Type::Dynamic).with_nested_type(nested)),
            ]),
            ..Default::default()
        };
        let prior = Value::object([
            ("name", Value::from("n")),
            ("foo", Value::object([("bar", Value::from("x")), ("id", Value::from("i"))])),
        ]);
        let config = Value::object([("name", Value::from("n")), ("foo", Value::Null)]);
        assert_eq!(
            proposed_new(&schema, &prior, &config),
            Value::object([("name", Value::from("n")), ("foo", Value::Null)])
        );

        // Only computed values inside: the provider produced it, keep it.
        let prior = Value::object([
            ("name", Value::from("n")),
            ("foo", Value::object([("bar", Value::Null), ("id", Value::from("i"))])),
        ]);
        assert_eq!(proposed_new(&schema, &prior, &config), prior);
    }

    fn listed_block(nesting: NestingMode) -> Block {
        Block {
            block_types: BTreeMap::from([(
                "rule".to_string(),
                NestedBlock {
                    block: Block {
                        attributes: attrs(vec![
                            ("port", Attribute::required(Type::Number)),
                            ("rule_id", Attribute::computed(Type::String)),
                        ]),
                        ..Default::default()
                    },
                    nesting,
                    min_items: 0,
                    max_items: 0,
                },
            )]),
            ..Default::default()
        }
    }

    fn rule(port: i64, id: Option<&str>) -> Value {
        Value::object([
            ("port", Value::from(port)),
            ("rule_id", id.map(Value::from).unwrap_or(Value::Null)),
        ])
    }

    #[test]
    fn list_elements_beyond_prior_are_new() {
        let schema = listed_block(NestingMode::List);
        let prior = Value::object([(
            "rule",
            Value::List(vec![rule(1, Some("a")), rule(2, Some("b"))]),
        )]);
        let config = Value::object([(
            "rule",
            Value::List(vec![rule(1, None), rule(2, None), rule(3, None)]),
        )]);
        let proposed = proposed_new(&schema, &prior, &config);
        assert_eq!(
            proposed.get_attr("rule"),
            Value::List(vec![rule(1, Some("a")), rule(2, Some("b")), rule(3, None)])
        );
    }

    #[test]
    fn map_elements_correlate_by_key() {
        let schema = listed_block(NestingMode::Map);
        let prior = Value::object([(
            "rule",
            Value::Map(BTreeMap::from([("http".to_string(), rule(80, Some("a")))])),
        )]);
        let config = Value::object([(
            "rule",
            Value::Map(BTreeMap::from([
                ("http".to_string(), rule(8080, None)),
                ("https".to_string(), rule(443, None)),
            ])),
        )]);
        let proposed = proposed_new(&schema, &prior, &config);
        assert_eq!(
            proposed.get_attr("rule"),
            Value::Map(BTreeMap::from([
                ("http".to_string(), rule(8080, Some("a"))),
                ("https".to_string(), rule(443, None)),
            ]))
        );
    }

    #[test]
    fn set_elements_correlate_on_non_computed_attributes() {
        let schema = listed_block(NestingMode::Set);
        let prior = Value::object([(
            "rule",
            Value::set(vec![rule(80, Some("a")), rule(443, Some("b"))]),
        )]);
        let config = Value::object([("rule", Value::set(vec![rule(443, None), rule(22, None)]))]);
        let proposed = proposed_new(&schema, &prior, &config);
        assert_eq!(
            proposed.get_attr("rule"),
            Value::set(vec![rule(443, Some("b")), rule(22, None)])
        );
    }

    #[test]
    fn set_prior_elements_are_used_at_most_once() {
        // Two prior elements share a projection; two config elements with
        // that projection cannot both be matched with the same prior element.
        let nested = Object {
            attributes: attrs(vec![
                ("port", Attribute::required(Type::Number)),
                ("rule_id", Attribute::computed(Type::String)),
            ]),
            nesting: NestingMode::Set,
        };
        let prior = Value::set(vec![rule(80, Some("a")), rule(80, Some("b"))]);
        // A set of configured values cannot hold duplicates, so exercise the
        // correlation directly with a hand-built element list.
        let config = Value::Set(vec![rule(80, None), rule(80, None)]);
        let proposed = proposed_new_nesting_set(ElementSchema::Object(&nested), &prior, &config);
        assert_eq!(proposed, Value::set(vec![rule(80, Some("a")), rule(80, Some("b"))]));
    }

    #[test]
    fn unknown_config_is_deferred() {
        let schema = listed_block(NestingMode::List);
        let prior = Value::object([("rule", Value::List(vec![rule(1, Some("a"))]))]);
        let config = Value::object([("rule", Value::Unknown)]);
        let proposed = proposed_new(&schema, &prior, &config);
        assert_eq!(proposed.get_attr("rule"), Value::Unknown);
        assert_eq!(proposed_new(&schema, &prior, &Value::Unknown), prior);
    }

    #[test]
    fn both_null_stays_null() {
        let schema = listed_block(NestingMode::Single);
        assert_eq!(proposed_new(&schema, &Value::Null, &Value::Null), Value::Null);
        let config = Value::object([("rule", Value::Null)]);
        assert_eq!(
            proposed_new(&schema, &Value::Null, &config),
            Value::object([("rule", Value::Null)])
        );
    }

    #[test]
    fn data_source_computed_attributes_become_unknown() {
        let schema = Block {
            attributes: attrs(vec![
                ("path", Attribute::required(Type::String)),
                ("content", Attribute::computed(Type::String)),
                ("mode", Attribute::optional_computed(Type::String)),
            ]),
            ..Default::default()
        };
        let config = Value::object([
            ("path", Value::from("/etc/motd")),
            ("content", Value::Null),
            ("mode", Value::from("0644")),
        ]);
        assert_eq!(
            planned_data_resource_object(&schema, &config),
            Value::object([
                ("path", Value::from("/etc/motd")),
                ("content", Value::Unknown),
                ("mode", Value::from("0644")),
            ])
        );
    }

    fn mixed_schema() -> Block {
        let mut schema = listed_block(NestingMode::Set);
        schema.attributes = attrs(vec![
            ("name", Attribute::required(Type::String)),
            ("tag", Attribute::optional(Type::String)),
            ("id", Attribute::computed(Type::String)),
            ("zone", Attribute::optional_computed(Type::String)),
        ]);
        schema
    }

    fn opt_string() -> impl Strategy<Value = Value> {
        prop_oneof![Just(Value::Null), "[a-c]{1,2}".prop_map(Value::from)]
    }

    fn rules(computed: bool) -> impl Strategy<Value = Value> {
        prop::collection::vec((0i64..4, "[xy]"), 0..4).prop_map(move |items| {
            Value::set(
                items
                    .into_iter()
                    .map(|(port, id)| rule(port, computed.then_some(id.as_str()))),
            )
        })
    }

    fn prior_value() -> impl Strategy<Value = Value> {
        ("[a-c]", opt_string(), "[a-c]", opt_string(), rules(true)).prop_map(|(name, tag, id, zone, rules)| {
            Value::object([
                ("name", Value::from(name)),
                ("tag", tag),
                ("id", Value::from(id)),
                ("zone", zone),
                ("rule", rules),
            ])
        })
    }

    fn config_value() -> impl Strategy<Value = Value> {
        ("[a-c]", opt_string(), opt_string(), rules(false)).prop_map(|(name, tag, zone, rules)| {
            Value::object([
                ("name", Value::from(name)),
                ("tag", tag),
                ("id", Value::Null),
                ("zone", zone),
                ("rule", rules),
            ])
        })
    }

    proptest! {
        #[test]
        fn non_computed_attributes_pass_through(prior in prior_value(), config in config_value()) {
            let proposed = proposed_new(&mixed_schema(), &prior, &config);
            prop_assert_eq!(proposed.get_attr("name"), config.get_attr("name"));
            prop_assert_eq!(proposed.get_attr("tag"), config.get_attr("tag"));
        }

        #[test]
        fn computed_attributes_keep_prior_when_unset(prior in prior_value(), config in config_value()) {
            let proposed = proposed_new(&mixed_schema(), &prior, &config);
            prop_assert_eq!(proposed.get_attr("id"), prior.get_attr("id"));
            if config.get_attr("zone").is_null() {
                prop_assert_eq!(proposed.get_attr("zone"), prior.get_attr("zone"));
            } else {
                prop_assert_eq!(proposed.get_attr("zone"), config.get_attr("zone"));
            }
        }

        #[test]
        fn reconciling_is_idempotent(prior in prior_value(), config in config_value()) {
            let schema = mixed_schema();
            let once = proposed_new(&schema, &prior, &config);
            let twice = proposed_new(&schema, &once, &config);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn set_correlation_never_duplicates_prior_elements(prior in prior_value(), config in config_value()) {
            let proposed = proposed_new(&mixed_schema(), &prior, &config);
            let prior_rules = prior.get_attr("rule");
            let prior_ids: Vec<Value> = prior_rules
                .elements()
                .unwrap_or_default()
                .iter()
                .map(|r| r.get_attr("rule_id"))
                .collect();
            let proposed_rules = proposed.get_attr("rule");
            let proposed_elems = proposed_rules.elements().unwrap_or_default();
            prop_assert_eq!(
                proposed_elems.len(),
                config.get_attr("rule").elements().unwrap_or_default().len()
            );
            // Every inherited element carries the computed id of a distinct
            // prior element with the same port.
            let mut remaining = prior_rules.elements().unwrap_or_default().to_vec();
            for elem in proposed_elems {
                let id = elem.get_attr("rule_id");
                if id.is_null() {
                    continue;
                }
                prop_assert!(prior_ids.contains(&id));
                let pos = remaining.iter().position(|r| r == elem);
                prop_assert!(pos.is_some(), "{} matched twice or not at all", elem);
                remaining.remove(pos.unwrap());
            }
        }
    }
}
