//! Planning and applying constructor call-site rewrites.
//!
//! Patching runs in two phases. [`Patcher::plan`] walks the selected types, snapshots every
//! matching call site and resolves the replacement constructor without touching the module.
//! [`Patcher::apply`] checks the whole plan against the module and only then rewrites it, so
//! a module is either patched completely or left exactly as it was.
//!
//! For the `k`-th call site of a method (counting from zero) at original position `p`, the
//! argument push is inserted at `p + k` and the call, now at `p + k + 1`, is redirected.

use log::debug;

use crate::{
    assembly::{Instruction, OpCode, Operand},
    metadata::{import::Importer, module::Module, token::Token},
    patch::{
        config::CtorRewrite,
        resolver::{AssemblyResolver, ReferenceResolver, ResolvedConstructor},
        scanner::{method_display_name, CallSite, Scanner},
        walker::collect_methods,
    },
    Error, Result,
};

/// The call sites of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPlan {
    /// The method
    pub method: Token,
    /// Matching call sites in ascending position order
    pub sites: Vec<CallSite>,
}

/// Everything [`Patcher::apply`] needs, computed from an unmodified module.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    /// Types visited by the walk, nested types included
    pub types_visited: usize,
    /// Methods with a body that were scanned
    pub methods_visited: usize,
    /// Methods with at least one call site
    pub methods: Vec<MethodPlan>,
    /// The constructor call sites are redirected to, resolved only if there are any
    pub replacement: Option<ResolvedConstructor>,
}

impl PatchPlan {
    /// Returns true if there is nothing to rewrite.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Total number of call sites.
    #[must_use]
    pub fn call_sites(&self) -> usize {
        self.methods.iter().map(|method| method.sites.len()).sum()
    }
}

/// A method changed by [`Patcher::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedMethod {
    /// The method
    pub method: Token,
    /// `Namespace.Type::Method`
    pub name: String,
    /// Number of rewritten call sites
    pub call_sites: usize,
}

/// Rewrites call sites of one constructor overload.
pub struct Patcher<'r> {
    rewrite: CtorRewrite,
    resolver: ReferenceResolver<'r>,
}

impl<'r> Patcher<'r> {
    /// Apply `rewrite`, resolving the replacement through `assemblies`.
    pub fn new(rewrite: CtorRewrite, assemblies: &'r mut dyn AssemblyResolver) -> Self {
        Patcher {
            rewrite,
            resolver: ReferenceResolver::new(assemblies),
        }
    }

    /// The rewrite this patcher applies.
    #[must_use]
    pub fn rewrite(&self) -> &CtorRewrite {
        &self.rewrite
    }

    /// Find the call sites in the types named `types` and resolve the replacement.
    ///
    /// The replacement constructor is resolved only if at least one call site was found,
    /// so a module without matching calls needs none of its references to be available.
    ///
    /// # Errors
    /// Returns the resolution errors of [`ReferenceResolver::resolve_constructor`], and
    /// [`crate::Error::InvalidToken`] or signature errors for broken modules.
    pub fn plan(&mut self, module: &Module, types: &[String]) -> Result<PatchPlan> {
        let worklist = collect_methods(module, types)?;

        let mut scanner = Scanner::new(module, self.rewrite.original_ref());
        let mut methods = Vec::new();
        for method in &worklist.methods {
            let sites = scanner.scan(*method)?;
            if !sites.is_empty() {
                methods.push(MethodPlan {
                    method: *method,
                    sites,
                });
            }
        }

        let replacement = if methods.is_empty() {
            None
        } else {
            Some(
                self.resolver
                    .resolve_constructor(module, &self.rewrite.replacement_ref())?,
            )
        };

        Ok(PatchPlan {
            types_visited: worklist.types_visited,
            methods_visited: worklist.methods.len(),
            methods,
            replacement,
        })
    }

    /// Rewrite every call site in `plan`.
    ///
    /// `module` is only modified if every step succeeds.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if `plan` was not computed from `module` as it is now,
    /// or the import error of the replacement constructor.
    pub fn apply(&self, module: &mut Module, plan: &PatchPlan) -> Result<Vec<PatchedMethod>> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let replacement = plan.replacement.as_ref().ok_or_else(|| {
            Error::Error("Patch plan has call sites but no replacement constructor".to_string())
        })?;
        Self::validate(module, plan)?;

        let mut staged = module.clone();
        let constructor =
            Importer::new(&mut staged).import_constructor(&replacement.module, replacement.token)?;

        let mut patched = Vec::with_capacity(plan.methods.len());
        for method_plan in &plan.methods {
            let name = method_display_name(&staged, method_plan.method);
            let body = staged
                .method_def_mut(method_plan.method)?
                .body
                .as_mut()
                .ok_or(Error::InvalidToken(method_plan.method))?;

            for (shift, site) in method_plan.sites.iter().enumerate() {
                let position = site.index + shift;
                body.insert(position, self.rewrite.argument.clone())?;
                body.replace(
                    position + 1,
                    Instruction::new(OpCode::NEWOBJ, Operand::Token(constructor)),
                )?;
                debug!(
                    "{} IL_{:04}: {} + newobj {} (was {})",
                    name, position, self.rewrite.argument, constructor, site.token
                );
            }
            // Each pushed argument is consumed by the call right after it
            body.grow_max_stack(1);

            patched.push(PatchedMethod {
                method: method_plan.method,
                name,
                call_sites: method_plan.sites.len(),
            });
        }

        *module = staged;
        Ok(patched)
    }

    fn validate(module: &Module, plan: &PatchPlan) -> Result<()> {
        let stale = |method: Token, reason: String| {
            Error::Error(format!(
                "Patch plan does not match {}: {}",
                method_display_name(module, method),
                reason
            ))
        };

        for method_plan in &plan.methods {
            let method = method_plan.method;
            let Some(body) = &module.method_def(method)?.body else {
                return Err(stale(method, "method has no body".to_string()));
            };

            let mut previous = None;
            for site in &method_plan.sites {
                if previous.is_some_and(|previous| site.index <= previous) {
                    return Err(stale(method, "call sites are not in order".to_string()));
                }
                previous = Some(site.index);

                match body.instructions().get(site.index) {
                    Some(instruction)
                        if instruction.opcode == OpCode::NEWOBJ
                            && instruction.token() == Some(site.token) => {}
                    _ => {
                        return Err(stale(
                            method,
                            format!("no newobj {} at {}", site.token, site.index),
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}
