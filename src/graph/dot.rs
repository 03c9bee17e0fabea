//! Graphviz export for parsed graph definitions.

use crate::graph::schema::GraphDefinition;

/// Render a graph definition as Graphviz DOT for quick inspection.
pub fn definition_to_dot(definition: &GraphDefinition) -> String {
    let mut lines = vec!["digraph workflow {".to_string()];
    for node in &definition.nodes {
        let label = format!("{}\\n{}", node.id, node.node_type);
        lines.push(format!(
            "  \"{id}\" [label=\"{label}\"];",
            id = node.id,
            label = escape_label(&label)
        ));
    }

    for edge in &definition.edges {
        lines.push(format!(
            "  \"{from}\" -> \"{to}\";",
            from = edge.from(),
            to = edge.to()
        ));
    }

    for conditional in &definition.conditional_edges {
        for (key, target) in &conditional.branches {
            lines.push(format!(
                "  \"{from}\" -> \"{to}\" [label=\"{label}\"];",
                from = conditional.source,
                to = target,
                label = escape_label(&truncate(&format!("{} == {key}", conditional.predicate), 60))
            ));
        }
        if let Some(default) = &conditional.default {
            lines.push(format!(
                "  \"{from}\" -> \"{to}\" [label=\"default\"];",
                from = conditional.source,
                to = default
            ));
        }
    }

    lines.push("}".to_string());
    lines.join("\n")
}

fn truncate(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        value.to_string()
    } else {
        let cut: String = value.chars().take(limit).collect();
        format!("{cut}...")
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\"', "\\\"")
}
