//! Module linker.
//!
//! Resolves `import` statements against a virtual file system (the core does
//! no real I/O), parses each module exactly once, and produces a merged
//! translation unit. Import cycles are permitted: modules only carry
//! declarations, which the semantic analyzer registers before resolving
//! bodies, so a cycle never needs forward evaluation.

use std::collections::HashMap;

use log::debug;

use crate::error::{AlthreadError, AlthreadResult, ErrorKind, Pos};
use crate::frontend::ast::Ast;
use crate::frontend::parser;

/// The virtual file system handed to the linker: logical path to content.
pub type VirtualFs = HashMap<String, String>;

/// An import edge resolved to a canonical module path.
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    /// Canonical path of the imported module.
    pub path: String,
    /// Namespace alias, when the import was `import "p" as A`.
    pub alias: Option<String>,
    /// Position of the import statement.
    pub pos: Pos,
}

/// One parsed module of the translation unit.
#[derive(Debug)]
pub struct Module {
    /// Canonical path.
    pub path: String,
    /// Parsed file.
    pub ast: Ast,
    /// Outgoing import edges.
    pub imports: Vec<ResolvedImport>,
}

/// The linker's output: an AST forest with import edges.
#[derive(Debug)]
pub struct LinkedUnit {
    /// Canonical path of the entry module.
    pub entry: String,
    /// All modules by canonical path.
    pub modules: HashMap<String, Module>,
    /// Deterministic module order: entry first, then import preorder.
    pub order: Vec<String>,
}

impl LinkedUnit {
    /// The entry module.
    pub fn entry_module(&self) -> &Module {
        &self.modules[&self.entry]
    }
}

/// Link `entry_source` (at logical path `entry_path`) against `vfs`.
pub fn link(entry_path: &str, entry_source: &str, vfs: &VirtualFs) -> AlthreadResult<LinkedUnit> {
    let entry = normalize(entry_path);
    let mut unit = LinkedUnit {
        entry: entry.clone(),
        modules: HashMap::new(),
        order: Vec::new(),
    };
    load(&entry, entry_source, vfs, &mut unit)?;
    debug!("linked {} module(s) from {}", unit.modules.len(), entry);
    Ok(unit)
}

fn load(path: &str, source: &str, vfs: &VirtualFs, unit: &mut LinkedUnit) -> AlthreadResult<()> {
    let ast = parser::parse(path, source)?;
    if path != unit.entry {
        if let Some(main) = &ast.main {
            return Err(AlthreadError::new(
                ErrorKind::Import,
                main.pos.clone(),
                format!("imported module '{}' must not declare 'main'", path),
            ));
        }
    }

    let mut imports = Vec::new();
    for import in &ast.imports {
        let resolved = resolve(path, &import.value.path, vfs).ok_or_else(|| {
            AlthreadError::new(
                ErrorKind::Import,
                import.pos.clone(),
                format!("import '{}' not found", import.value.path),
            )
        })?;
        imports.push(ResolvedImport {
            path: resolved,
            alias: import.value.alias.clone(),
            pos: import.pos.clone(),
        });
    }

    unit.order.push(path.to_string());
    unit.modules.insert(
        path.to_string(),
        Module {
            path: path.to_string(),
            ast,
            imports: imports.clone(),
        },
    );

    for import in imports {
        // A module already present was parsed by an earlier edge; revisiting
        // it would loop on import cycles.
        if unit.modules.contains_key(&import.path) {
            continue;
        }
        let content = vfs
            .get(&import.path)
            .expect("resolve() only returns paths present in the vfs");
        let content = content.clone();
        load(&import.path, &content, vfs, unit)?;
    }
    Ok(())
}

/// Resolve `target` relative to the directory of `importer`, returning the
/// canonical path if the file exists in the VFS (trying an `.alt` suffix when
/// the bare path misses).
fn resolve(importer: &str, target: &str, vfs: &VirtualFs) -> Option<String> {
    let dir = match importer.rfind('/') {
        Some(i) => &importer[..i],
        None => "",
    };
    let joined = if target.starts_with('/') {
        target.to_string()
    } else if dir.is_empty() {
        target.to_string()
    } else {
        format!("{}/{}", dir, target)
    };
    let candidate = normalize(&joined);
    if vfs.contains_key(&candidate) {
        return Some(candidate);
    }
    let with_ext = format!("{}.alt", candidate);
    if vfs.contains_key(&with_ext) {
        return Some(with_ext);
    }
    None
}

/// Collapse `.` and `..` segments and leading `./`.
fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs(files: &[(&str, &str)]) -> VirtualFs {
        files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_single_file() {
        let unit = link("main.alt", "main { }", &vfs(&[])).unwrap();
        assert_eq!(unit.order, vec!["main.alt"]);
    }

    #[test]
    fn test_import_resolution() {
        let fs = vfs(&[("lib/util.alt", "fn id(x: int) -> int { return x; }")]);
        let unit = link(
            "lib/main.alt",
            "import \"util.alt\" as Util;\nmain { }",
            &fs,
        )
        .unwrap();
        assert!(unit.modules.contains_key("lib/util.alt"));
        assert_eq!(
            unit.entry_module().imports[0].alias.as_deref(),
            Some("Util")
        );
    }

    #[test]
    fn test_relative_parent_path() {
        let fs = vfs(&[("shared.alt", "shared { let N: int = 3; }")]);
        let unit = link("nested/main.alt", "import \"../shared.alt\";\nmain { }", &fs).unwrap();
        assert!(unit.modules.contains_key("shared.alt"));
    }

    #[test]
    fn test_missing_import() {
        let err = link("main.alt", "import \"nope.alt\";\nmain { }", &vfs(&[])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Import);
        assert!(err.message.contains("nope.alt"));
    }

    #[test]
    fn test_import_cycle_is_permitted() {
        let fs = vfs(&[
            ("a.alt", "import \"b.alt\";\nfn fa() -> int { return 1; }"),
            ("b.alt", "import \"a.alt\";\nfn fb() -> int { return 2; }"),
        ]);
        let unit = link("main.alt", "import \"a.alt\";\nmain { }", &fs).unwrap();
        assert_eq!(unit.modules.len(), 3);
    }

    #[test]
    fn test_imported_main_rejected() {
        let fs = vfs(&[("other.alt", "main { }")]);
        let err = link("main.alt", "import \"other.alt\";\nmain { }", &fs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Import);
    }

    #[test]
    fn test_extension_inferred() {
        let fs = vfs(&[("util.alt", "fn f() -> int { return 0; }")]);
        let unit = link("main.alt", "import \"util\";\nmain { }", &fs).unwrap();
        assert!(unit.modules.contains_key("util.alt"));
    }
}
