//! Selecting the methods to patch.
//!
//! A requested name selects every top-level type whose simple name (`Worker`) or full name
//! (`Game.Worker`) equals it, together with all types nested inside it at any depth. Names
//! that select nothing are not an error.

use std::collections::HashSet;

use log::debug;

use crate::{
    metadata::{module::Module, token::Token},
    Result,
};

/// Methods found by [`collect_methods`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodWorklist {
    /// Number of types visited, nested types included
    pub types_visited: usize,
    /// Methods with a body, in visiting order
    pub methods: Vec<Token>,
}

/// Collect the methods of the types named in `names` and of all their nested types.
///
/// Types are visited depth-first in table order, each type's own methods before those of
/// its nested types. Every type and method appears at most once, however many names select
/// it. Methods without a body are skipped.
///
/// # Errors
/// Returns [`crate::Error::InvalidToken`] if the module's type graph points at missing rows.
pub fn collect_methods(module: &Module, names: &[String]) -> Result<MethodWorklist> {
    let mut worklist = MethodWorklist::default();
    let mut seen = HashSet::new();

    let mut roots = Vec::new();
    for type_token in module.top_level_types() {
        let type_def = module.type_def(type_token)?;
        let full_name = module.type_full_name(type_token)?;
        if names
            .iter()
            .any(|name| *name == type_def.name || *name == full_name)
        {
            roots.push(type_token);
        }
    }

    for name in names {
        let selected = roots.iter().any(|root| {
            module.type_def(*root).is_ok_and(|def| def.name == *name)
                || module.type_full_name(*root).is_ok_and(|full| full == *name)
        });
        if !selected {
            debug!("No type named '{}' in {}", name, module.name());
        }
    }

    let mut stack: Vec<Token> = roots.into_iter().rev().collect();
    while let Some(type_token) = stack.pop() {
        if !seen.insert(type_token) {
            continue;
        }
        worklist.types_visited += 1;

        let type_def = module.type_def(type_token)?;
        for method in type_def.methods() {
            if module.method_def(*method)?.body.is_some() {
                worklist.methods.push(*method);
            }
        }
        stack.extend(type_def.nested_types().iter().rev());
    }

    Ok(worklist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        method::{MethodAttributes, MethodBody},
        tables::AssemblyVersion,
    };

    fn method(module: &mut Module, owner: Token, name: &str, body: bool) -> Token {
        let body = body.then(|| MethodBody::new(8, Vec::new()));
        module
            .add_method(owner, MethodAttributes::PUBLIC, name, vec![0x20, 0x00, 0x01], body)
            .unwrap()
    }

    fn sample() -> (Module, Vec<Token>) {
        let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
        let worker = module.add_type_def(0x0010_0001, "Game", "Worker", None).unwrap();
        let other = module.add_type_def(0x0010_0001, "Game", "Other", None).unwrap();
        let job = module.add_type_def(0x0010_0002, "", "Job", Some(worker)).unwrap();
        let step = module.add_type_def(0x0010_0002, "", "Step", Some(job)).unwrap();
        let queue = module.add_type_def(0x0010_0002, "", "Queue", Some(worker)).unwrap();

        let tokens = vec![
            method(&mut module, worker, "Run", true),
            method(&mut module, other, "Run", true),
            method(&mut module, step, "Execute", true),
            method(&mut module, job, "Start", true),
            method(&mut module, queue, "Drain", true),
            method(&mut module, worker, "Abstract", false),
        ];
        (module, tokens)
    }

    #[test]
    fn nested_types_are_visited_depth_first() {
        let (module, m) = sample();
        let worklist = collect_methods(&module, &["Worker".to_string()]).unwrap();

        assert_eq!(worklist.types_visited, 4);
        // Worker, Worker/Job, Worker/Job/Step, Worker/Queue
        assert_eq!(worklist.methods, vec![m[0], m[3], m[2], m[4]]);
    }

    #[test]
    fn full_names_select_too() {
        let (module, m) = sample();
        let worklist = collect_methods(&module, &["Game.Other".to_string()]).unwrap();
        assert_eq!(worklist.methods, vec![m[1]]);
    }

    #[test]
    fn nested_names_do_not_select() {
        let (module, _) = sample();
        let worklist =
            collect_methods(&module, &["Job".to_string(), "Missing".to_string()]).unwrap();
        assert_eq!(worklist, MethodWorklist::default());
    }

    #[test]
    fn duplicate_names_visit_once() {
        let (module, _) = sample();
        let worklist = collect_methods(
            &module,
            &["Worker".to_string(), "Game.Worker".to_string()],
        )
        .unwrap();
        assert_eq!(worklist.types_visited, 4);
        assert_eq!(worklist.methods.len(), 4);
    }

    #[test]
    fn deep_nesting_does_not_recurse() {
        let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
        let mut parent = module.add_type_def(0, "Game", "Deep", None).unwrap();
        for depth in 0..10_000 {
            parent = module
                .add_type_def(0, "", format!("Level{depth}"), Some(parent))
                .unwrap();
        }
        method(&mut module, parent, "Leaf", true);

        let worklist = collect_methods(&module, &["Deep".to_string()]).unwrap();
        assert_eq!(worklist.types_visited, 10_001);
        assert_eq!(worklist.methods.len(), 1);
    }
}
