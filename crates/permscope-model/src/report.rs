//! Text rendering of reported failures as policy-file snippets.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::{Component, FailureOrigin, FailureRecord, PermissionSet, Reported, Solution};

/// How grant blocks are laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportStyle {
    /// Modular runtime: one `grant bundles` block may name several bundles.
    #[default]
    Modular,
    /// One `grant codeBase` block per component.
    Classic,
}

pub fn render_record(record: &FailureRecord<Reported>, style: ReportStyle) -> String {
    let mut out = String::new();
    match record.origin() {
        FailureOrigin::AccessCheck { thread } => {
            let _ = writeln!(out, "permission check failed in thread \"{thread}\"");
        }
        FailureOrigin::ServiceEvent { listener } => {
            let _ = writeln!(out, "service event hidden from listener {listener}");
        }
    }
    out.push_str(&render(record.permissions(), record.solutions(), style));
    if record.applied_to_ledger() {
        out.push_str("  (grant recorded for the rest of this session)\n");
    }
    out
}

/// Renders the permission set and each ranked solution.
pub fn render(permissions: &PermissionSet, solutions: &[Solution], style: ReportStyle) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  missing: {permissions}");
    for (rank, solution) in solutions.iter().enumerate() {
        let _ = writeln!(
            out,
            "  solution {}: {} grant(s), {} elevation(s)",
            rank + 1,
            solution.grants.len(),
            solution.elevations.len()
        );
        render_grants(&mut out, solution, style);
        for (idx, frame) in solution.elevations.iter().enumerate() {
            let _ = writeln!(out, "    elevate #{} after {frame}", idx + 1);
        }
    }
    out
}

fn render_grants(out: &mut String, solution: &Solution, style: ReportStyle) {
    if solution.grants.is_empty() {
        return;
    }
    match style {
        ReportStyle::Modular => {
            let bundles: BTreeSet<&str> = solution
                .grants
                .iter()
                .filter_map(|c| match c {
                    Component::Bundle(name) => Some(name.as_str()),
                    _ => None,
                })
                .collect();
            if !bundles.is_empty() {
                let names: Vec<String> = bundles.iter().map(|b| format!("\"{b}\"")).collect();
                grant_block(out, &format!("bundles {}", names.join(", ")), &solution.permissions);
            }
            for component in &solution.grants {
                if let Component::CodeSource(location) = component {
                    grant_block(out, &format!("codeBase \"{location}\""), &solution.permissions);
                }
            }
        }
        ReportStyle::Classic => {
            for component in &solution.grants {
                if let Some(name) = component.name() {
                    grant_block(out, &format!("codeBase \"{name}\""), &solution.permissions);
                }
            }
        }
    }
}

fn grant_block(out: &mut String, target: &str, permissions: &PermissionSet) {
    let _ = writeln!(out, "    grant {target} {{");
    for permission in permissions.iter() {
        let _ = writeln!(out, "      permission {permission};");
    }
    out.push_str("    };\n");
}
