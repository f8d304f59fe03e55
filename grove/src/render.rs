//! Text rendering of plans for the terminal.

use grove::config::output_display;
use grove_core::{
    plans::{Action, ActionReason, OutputChange, Plan, ResourceInstanceChange},
    value::Value,
};
use std::{collections::BTreeSet, fmt::Write as _};

/// A single-line rendering of a value. Unknown values render as
/// `(known after apply)`.
pub fn value(v: &Value) -> String {
    let mut out = String::new();
    write_value(v, &mut out);
    out
}

fn write_value(v: &Value, out: &mut String) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Unknown => out.push_str("(known after apply)"),
        Value::String(s) => {
            let _ = write!(out, "{:?}", s);
        }
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::List(items) | Value::Set(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Map(attrs) | Value::Object(attrs) => {
            out.push('{');
            for (i, (k, item)) in attrs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{} = ", k);
                write_value(item, out);
            }
            out.push('}');
        }
    }
}

fn headline(change: &ResourceInstanceChange) -> String {
    let what = change.object_display();
    let mut line = match change.action {
        Action::Create => format!("{} will be created", what),
        Action::Update => format!("{} will be updated in-place", what),
        Action::Delete => format!("{} will be destroyed", what),
        Action::DeleteThenCreate | Action::CreateThenDelete => format!("{} must be replaced", what),
        Action::Read => format!("{} will be read during apply", what),
        Action::NoOp => format!("{} is up to date", what),
    };
    let because = match change.action_reason {
        ActionReason::None => None,
        ActionReason::Tainted => Some("it is tainted, so it must be replaced"),
        ActionReason::RequiresReplace => Some("a changed attribute forces replacement"),
        ActionReason::DeleteNoConfig => Some("it is not in the configuration"),
        ActionReason::DeleteCountIndexOutOfRange => Some("its index is out of range for count"),
        ActionReason::DeleteEachKeyMissing => Some("its key is not in for_each"),
        ActionReason::DeleteByDestroyMode => None,
    };
    if let Some(because) = because {
        let _ = write!(line, " ({})", because);
    }
    line
}

fn write_change(change: &ResourceInstanceChange, out: &mut String) {
    let _ = writeln!(out, "  # {}", headline(change));
    let _ = writeln!(out, "  {} {}", change.action.symbol(), change.object_display());
    let empty = Default::default();
    let before = change.before.as_attrs().unwrap_or(&empty);
    let after = change.after.as_attrs().unwrap_or(&empty);
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    for name in names {
        let b = before.get(name).unwrap_or(&Value::Null);
        let a = after.get(name).unwrap_or(&Value::Null);
        match change.action {
            Action::Delete => {
                if !b.is_null() {
                    let _ = writeln!(out, "      - {} = {}", name, value(b));
                }
            }
            Action::Create => {
                if !a.is_null() {
                    let _ = writeln!(out, "      + {} = {}", name, value(a));
                }
            }
            _ if a == b => {}
            _ => {
                let forces = change
                    .requires_replace
                    .iter()
                    .any(|path| matches!(path.first(), Some(grove_core::value::PathStep::Attr(n)) if n == name));
                let _ = writeln!(
                    out,
                    "      ~ {} = {} -> {}{}",
                    name,
                    value(b),
                    value(a),
                    if forces { " # forces replacement" } else { "" }
                );
            }
        }
    }
}

fn write_output_change(change: &OutputChange, out: &mut String) {
    let name = output_display(&change.module, &change.name);
    let shown = |v: &Value| {
        if change.sensitive {
            "(sensitive value)".to_string()
        } else {
            value(v)
        }
    };
    let _ = match change.action {
        Action::Create => writeln!(out, "  + {} = {}", name, shown(&change.after)),
        Action::Update => writeln!(out, "  ~ {} = {} -> {}", name, shown(&change.before), shown(&change.after)),
        Action::Delete => writeln!(out, "  - {} = {}", name, shown(&change.before)),
        _ => Ok(()),
    };
}

/// The summary counts: objects to add, to change and to destroy.
pub fn counts(plan: &Plan) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for change in &plan.changes {
        if change.action.creates() {
            counts.0 += 1;
        }
        if change.action == Action::Update {
            counts.1 += 1;
        }
        if change.action.deletes() {
            counts.2 += 1;
        }
    }
    counts
}

pub fn plan(plan: &Plan) -> String {
    let mut out = String::new();
    if !plan.has_changes() {
        out.push_str("No changes. The resources match the configuration.\n");
        return out;
    }
    for change in plan.changes.iter().filter(|c| c.action != Action::NoOp) {
        write_change(change, &mut out);
        out.push('\n');
    }
    let outputs: Vec<_> = plan
        .output_changes
        .iter()
        .filter(|c| c.action != Action::NoOp)
        .collect();
    if !outputs.is_empty() {
        out.push_str("Changes to outputs:\n");
        for change in outputs {
            write_output_change(change, &mut out);
        }
        out.push('\n');
    }
    let (add, change, destroy) = counts(plan);
    let _ = writeln!(out, "Plan: {} to add, {} to change, {} to destroy.", add, change, destroy);
    out
}
