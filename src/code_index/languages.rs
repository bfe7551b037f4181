//! Concrete [`LanguagePack`]s: one curly-brace language (Rust) and one
//! dynamic language (Python), proving the capability-trait abstraction with
//! two structurally different grammars.

use std::collections::HashMap;

use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Parser, Query, QueryCursor};

use super::{EntityKind, LanguagePack, RawEntity};
use crate::error::{EngineError, Result};

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::BackendError(message.into())
}

/// Walk `node`'s ancestors, collecting the name of every enclosing
/// class/module/impl scope, to build a dotted/`::`-joined qualified name.
fn enclosing_scope_names(node: Node, source: &str, container_kinds: &[&str], separator: &str) -> String {
    let mut parts = Vec::new();
    let mut current = node.parent();
    while let Some(n) = current {
        if container_kinds.contains(&n.kind()) {
            if let Some(name_node) = n.child_by_field_name("name").or_else(|| n.child_by_field_name("type")) {
                if let Ok(text) = name_node.utf8_text(source.as_bytes()) {
                    parts.push(text.to_string());
                }
            }
        }
        current = n.parent();
    }
    parts.reverse();
    parts.join(separator)
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn leading_comment(node: Node, source: &str, comment_kinds: &[&str]) -> Option<String> {
    let mut sibling = node.prev_sibling();
    let mut lines = Vec::new();
    while let Some(n) = sibling {
        if comment_kinds.contains(&n.kind()) {
            lines.push(node_text(n, source).trim_start_matches(['/', '#', '*', ' ']).to_string());
            sibling = n.prev_sibling();
        } else {
            break;
        }
    }
    if lines.is_empty() {
        None
    } else {
        lines.reverse();
        Some(lines.join("\n"))
    }
}

/// Curly-brace language pack: Rust, via `tree-sitter-rust`.
pub struct RustPack;

impl LanguagePack for RustPack {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn extract(&self, source: &str) -> Result<Vec<RawEntity>> {
        let language: tree_sitter::Language = tree_sitter_rust::LANGUAGE.into();
        let mut parser = Parser::new();
        parser.set_language(&language).map_err(|e| parse_error(e.to_string()))?;
        let tree = parser.parse(source, None).ok_or_else(|| parse_error("rust parse failed"))?;
        let root = tree.root_node();

        const QUERY: &str = r#"
            (function_item name: (identifier) @name) @function
            (struct_item name: (type_identifier) @name) @struct
            (enum_item name: (type_identifier) @name) @enum
            (trait_item name: (type_identifier) @name) @trait
            (use_declaration) @import
        "#;
        let query = Query::new(&language, QUERY).map_err(|e| parse_error(e.to_string()))?;
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&query, root, source.as_bytes());

        const CONTAINERS: &[&str] = &["impl_item", "mod_item", "trait_item"];
        let mut entities = Vec::new();

        while let Some(m) = matches.next() {
            let mut name = String::new();
            let mut kind: Option<EntityKind> = None;
            let mut node = None;

            for capture in m.captures {
                let capture_name = query.capture_names()[capture.index as usize];
                match capture_name {
                    "name" => name = node_text(capture.node, source).to_string(),
                    "function" => {
                        node = Some(capture.node);
                        let is_method = has_ancestor(capture.node, "impl_item");
                        kind = Some(if is_method { EntityKind::Method } else { EntityKind::Function });
                    }
                    "struct" | "enum" => {
                        node = Some(capture.node);
                        kind = Some(EntityKind::Class);
                    }
                    "trait" => {
                        node = Some(capture.node);
                        kind = Some(EntityKind::Interface);
                    }
                    "import" => {
                        node = Some(capture.node);
                        kind = Some(EntityKind::Import);
                    }
                    _ => {}
                }
            }

            let (Some(node), Some(kind)) = (node, kind) else { continue };
            let scope = enclosing_scope_names(node, source, CONTAINERS, "::");
            let qualified_name = if kind == EntityKind::Import {
                node_text(node, source).trim_end_matches(';').trim_start_matches("use ").trim().to_string()
            } else if scope.is_empty() {
                name.clone()
            } else {
                format!("{scope}::{name}")
            };

            let signature = match kind {
                EntityKind::Function | EntityKind::Method => {
                    node.child_by_field_name("parameters").map(|p| node_text(p, source).to_string())
                }
                _ => None,
            };
            let docstring = leading_comment(node, source, &["line_comment", "block_comment"]);

            entities.push(RawEntity {
                kind,
                qualified_name,
                name: if kind == EntityKind::Import { qualified_name_last(&node_text(node, source)) } else { name },
                line_start: node.start_position().row + 1,
                line_end: node.end_position().row + 1,
                signature,
                docstring,
                imports: Vec::new(),
                inherits: Vec::new(),
                calls: Vec::new(),
            });
        }

        let file_imports: Vec<String> = entities
            .iter()
            .filter(|e| e.kind == EntityKind::Import)
            .map(|e| e.name.clone())
            .collect();
        let trait_impls = collect_trait_impls(root, source);
        for entity in entities.iter_mut() {
            if entity.kind == EntityKind::Import {
                continue;
            }
            entity.imports = file_imports.clone();
            if entity.kind == EntityKind::Class {
                if let Some(traits) = trait_impls.get(&entity.name) {
                    entity.inherits = traits.clone();
                }
            }
        }

        Ok(entities)
    }
}

/// Walk every `impl Trait for Type` block in the file, mapping the
/// implementing type's name to the trait names it implements. Plain
/// inherent `impl Type { .. }` blocks (no `trait` field) are skipped.
fn collect_trait_impls(root: Node, source: &str) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    collect_trait_impls_rec(root, source, &mut map);
    map
}

fn collect_trait_impls_rec(node: Node, source: &str, map: &mut HashMap<String, Vec<String>>) {
    if node.kind() == "impl_item" {
        if let (Some(trait_node), Some(type_node)) =
            (node.child_by_field_name("trait"), node.child_by_field_name("type"))
        {
            let trait_name = node_text(trait_node, source).to_string();
            let type_name = node_text(type_node, source).to_string();
            map.entry(type_name).or_default().push(trait_name);
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_trait_impls_rec(child, source, map);
    }
}

fn qualified_name_last(use_decl: &str) -> String {
    use_decl
        .trim_end_matches(';')
        .trim_start_matches("use ")
        .rsplit("::")
        .next()
        .unwrap_or(use_decl)
        .trim()
        .to_string()
}

fn has_ancestor(node: Node, kind: &str) -> bool {
    let mut current = node.parent();
    while let Some(n) = current {
        if n.kind() == kind {
            return true;
        }
        current = n.parent();
    }
    false
}

/// Dynamic language pack: Python, via `tree-sitter-python`.
pub struct PythonPack;

impl LanguagePack for PythonPack {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn extract(&self, source: &str) -> Result<Vec<RawEntity>> {
        let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
        let mut parser = Parser::new();
        parser.set_language(&language).map_err(|e| parse_error(e.to_string()))?;
        let tree = parser.parse(source, None).ok_or_else(|| parse_error("python parse failed"))?;
        let root = tree.root_node();

        const QUERY: &str = r#"
            (function_definition name: (identifier) @name) @function
            (class_definition name: (identifier) @name) @class
            (import_statement) @import
            (import_from_statement) @import
        "#;
        let query = Query::new(&language, QUERY).map_err(|e| parse_error(e.to_string()))?;
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&query, root, source.as_bytes());

        const CONTAINERS: &[&str] = &["class_definition"];
        let mut entities = Vec::new();

        while let Some(m) = matches.next() {
            let mut name = String::new();
            let mut kind: Option<EntityKind> = None;
            let mut node = None;

            for capture in m.captures {
                let capture_name = query.capture_names()[capture.index as usize];
                match capture_name {
                    "name" => name = node_text(capture.node, source).to_string(),
                    "function" => {
                        node = Some(capture.node);
                        let is_method = has_ancestor(capture.node, "class_definition");
                        kind = Some(if is_method { EntityKind::Method } else { EntityKind::Function });
                    }
                    "class" => {
                        node = Some(capture.node);
                        kind = Some(EntityKind::Class);
                    }
                    "import" => {
                        node = Some(capture.node);
                        kind = Some(EntityKind::Import);
                    }
                    _ => {}
                }
            }

            let (Some(node), Some(kind)) = (node, kind) else { continue };
            let scope = enclosing_scope_names(node, source, CONTAINERS, ".");
            let import_text = node_text(node, source).to_string();
            let qualified_name = if kind == EntityKind::Import {
                import_text.clone()
            } else if scope.is_empty() {
                name.clone()
            } else {
                format!("{scope}.{name}")
            };

            let signature = match kind {
                EntityKind::Function | EntityKind::Method => {
                    node.child_by_field_name("parameters").map(|p| node_text(p, source).to_string())
                }
                _ => None,
            };
            let docstring = python_docstring(node, source);

            entities.push(RawEntity {
                kind,
                qualified_name,
                name: if kind == EntityKind::Import { python_import_symbol(&import_text) } else { name },
                line_start: node.start_position().row + 1,
                line_end: node.end_position().row + 1,
                signature,
                docstring,
                imports: Vec::new(),
                inherits: Vec::new(),
                calls: Vec::new(),
            });
        }

        let file_imports: Vec<String> = entities
            .iter()
            .filter(|e| e.kind == EntityKind::Import)
            .map(|e| e.name.clone())
            .collect();
        let class_bases = collect_class_bases(root, source);
        for entity in entities.iter_mut() {
            if entity.kind == EntityKind::Import {
                continue;
            }
            entity.imports = file_imports.clone();
            if entity.kind == EntityKind::Class {
                if let Some(bases) = class_bases.get(&entity.name) {
                    entity.inherits = bases.clone();
                }
            }
        }

        Ok(entities)
    }
}

/// Walk every `class Name(Base1, Base2): ...` definition, mapping the
/// class name to its base-class names (`superclasses` field). Classes
/// with no base list get no entry.
fn collect_class_bases(root: Node, source: &str) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    collect_class_bases_rec(root, source, &mut map);
    map
}

fn collect_class_bases_rec(node: Node, source: &str, map: &mut HashMap<String, Vec<String>>) {
    if node.kind() == "class_definition" {
        if let (Some(name_node), Some(bases_node)) =
            (node.child_by_field_name("name"), node.child_by_field_name("superclasses"))
        {
            let class_name = node_text(name_node, source).to_string();
            let mut cursor = bases_node.walk();
            let bases: Vec<String> = bases_node
                .named_children(&mut cursor)
                .map(|n| node_text(n, source).to_string())
                .collect();
            if !bases.is_empty() {
                map.insert(class_name, bases);
            }
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_class_bases_rec(child, source, map);
    }
}

/// Reduce an `import x` / `from pkg import Name, Other as alias` statement
/// to the single bound symbol name a reference elsewhere in the project
/// would use, mirroring `qualified_name_last`'s role for `use` paths.
fn python_import_symbol(import_text: &str) -> String {
    let target = if let Some(rest) = import_text.strip_prefix("from ") {
        rest.split_once(" import ").map(|(_, names)| names).unwrap_or(rest)
    } else {
        import_text.strip_prefix("import ").unwrap_or(import_text)
    };
    target
        .split(',')
        .next()
        .unwrap_or(target)
        .split(" as ")
        .last()
        .unwrap_or(target)
        .trim()
        .rsplit('.')
        .next()
        .unwrap_or(target)
        .to_string()
}

/// Python docstrings are the first statement in the body, a bare string
/// expression, rather than a leading comment.
fn python_docstring(def_node: Node, source: &str) -> Option<String> {
    let body = def_node.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string_node = first.named_child(0)?;
    if string_node.kind() != "string" {
        return None;
    }
    Some(node_text(string_node, source).trim_matches(['"', '\'', '\n', ' ']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_pack_extracts_function_and_struct() {
        let source = "struct UserService;\n\nimpl UserService {\n    fn authenticate(&self) -> bool { true }\n}\n";
        let entities = RustPack.extract(source).unwrap();
        assert!(entities.iter().any(|e| e.kind == EntityKind::Class && e.name == "UserService"));
        assert!(entities
            .iter()
            .any(|e| e.kind == EntityKind::Method && e.qualified_name == "UserService::authenticate"));
    }

    #[test]
    fn test_rust_pack_stable_id_survives_line_shift() {
        let original = "struct UserService;\nimpl UserService {\n    fn authenticate(&self) -> bool { true }\n}\n";
        let shifted = format!("{}{}", "\n".repeat(50), original);

        let before = RustPack.extract(original).unwrap();
        let after = RustPack.extract(&shifted).unwrap();
        let before_method = before.iter().find(|e| e.name == "authenticate").unwrap();
        let after_method = after.iter().find(|e| e.name == "authenticate").unwrap();
        assert_eq!(before_method.qualified_name, after_method.qualified_name);
        assert_ne!(before_method.line_start, after_method.line_start);
    }

    #[test]
    fn test_python_pack_extracts_class_and_method() {
        let source = "class UserService:\n    def authenticate(self):\n        \"\"\"Check credentials.\"\"\"\n        return True\n";
        let entities = PythonPack.extract(source).unwrap();
        assert!(entities.iter().any(|e| e.kind == EntityKind::Class && e.name == "UserService"));
        let method = entities
            .iter()
            .find(|e| e.kind == EntityKind::Method && e.qualified_name == "UserService.authenticate")
            .unwrap();
        assert_eq!(method.docstring.as_deref(), Some("Check credentials."));
    }

    #[test]
    fn test_python_pack_extracts_top_level_function() {
        let source = "def add(a, b):\n    return a + b\n";
        let entities = PythonPack.extract(source).unwrap();
        assert!(entities.iter().any(|e| e.kind == EntityKind::Function && e.qualified_name == "add"));
    }

    #[test]
    fn test_rust_pack_populates_inherits_from_trait_impl() {
        let source = "trait Shape { fn area(&self) -> f64; }\nstruct Circle;\nimpl Shape for Circle { fn area(&self) -> f64 { 1.0 } }";
        let entities = RustPack.extract(source).unwrap();
        let circle = entities.iter().find(|e| e.kind == EntityKind::Class && e.name == "Circle").unwrap();
        assert_eq!(circle.inherits, vec!["Shape".to_string()]);
    }

    #[test]
    fn test_rust_pack_populates_imports_on_non_import_entities() {
        let source = "use std::collections::HashMap;\n\nfn build() -> HashMap<String, i32> { HashMap::new() }";
        let entities = RustPack.extract(source).unwrap();
        let func = entities.iter().find(|e| e.kind == EntityKind::Function && e.name == "build").unwrap();
        assert_eq!(func.imports, vec!["HashMap".to_string()]);
    }

    #[test]
    fn test_python_pack_populates_inherits_from_base_class() {
        let source = "class Shape:\n    pass\n\nclass Circle(Shape):\n    pass\n";
        let entities = PythonPack.extract(source).unwrap();
        let circle = entities.iter().find(|e| e.kind == EntityKind::Class && e.name == "Circle").unwrap();
        assert_eq!(circle.inherits, vec!["Shape".to_string()]);
    }

    #[test]
    fn test_python_pack_populates_imports_on_non_import_entities() {
        let source = "import json\n\ndef dump(value):\n    return json.dumps(value)\n";
        let entities = PythonPack.extract(source).unwrap();
        let func = entities.iter().find(|e| e.kind == EntityKind::Function && e.name == "dump").unwrap();
        assert_eq!(func.imports, vec!["json".to_string()]);
    }

    #[test]
    fn test_python_import_symbol_reduces_from_import_statement() {
        let source = "from shapes import Shape\n\ndef describe(s):\n    return s\n";
        let entities = PythonPack.extract(source).unwrap();
        let func = entities.iter().find(|e| e.kind == EntityKind::Function && e.name == "describe").unwrap();
        assert_eq!(func.imports, vec!["Shape".to_string()]);
    }
}
