use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use smol_str::{SmolStr, format_smolstr};

use crate::error::CompileError;
use crate::shared::shared_cell;
use crate::symbols::{FieldId, Symbols, TypeId};
use crate::tree::node::{CatchHandler, Node, NodeKind};
use crate::tree::{ExprTree, NodeId};
use crate::types::Ty;
use crate::value::{Object, Value};

/// Captured variables hoisted into one synthesized closure record shared by
/// the whole lambda nest.
#[derive(Debug)]
pub struct ClosurePlan {
    pub ty: TypeId,
    /// Synthesized parameter node standing for the closure reference.
    pub param: NodeId,
    /// Per rewritten lambda node: which of its own parameters must be copied
    /// into the closure at entry, as (parameter position, closure field
    /// position) pairs.
    pub prologues: FxHashMap<NodeId, Vec<(u16, u16)>>,
}

/// Opaque constants hoisted into a pre-built record instance; scalar and
/// string constants stay inline in the tree.
#[derive(Debug)]
pub struct ConstantsPlan {
    pub ty: TypeId,
    pub param: NodeId,
    pub instance: Value,
}

/// Resolver output: a rewritten tree in which every captured-variable use
/// and hoisted constant has become a field access on a synthesized record.
#[derive(Debug)]
pub struct Resolved {
    pub tree: ExprTree,
    pub root: NodeId,
    pub closure: Option<ClosurePlan>,
    pub constants: Option<ConstantsPlan>,
}

pub fn resolve(tree: &ExprTree, root: NodeId, symbols: &Symbols) -> Result<Resolved, CompileError> {
    let NodeKind::Lambda { .. } = tree.kind(root) else {
        return Err(CompileError::Internal("compilation root must be a lambda"));
    };

    let mut analysis = Analysis {
        tree,
        decl_depth: FxHashMap::default(),
        lambda_depth: 0,
        captured: Vec::new(),
        captured_set: FxHashSet::default(),
        hoisted: Vec::new(),
        catch_vars: FxHashSet::default(),
    };
    analysis.walk(root)?;

    let captured = analysis.captured;
    let hoisted = analysis.hoisted;
    let catch_vars = analysis.catch_vars;

    // Synthesize the closure record, one field per captured variable.
    let closure_ty = if captured.is_empty() {
        None
    } else {
        let fields = captured
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let name = match tree.kind(*id) {
                    NodeKind::Parameter { name } => name.clone(),
                    _ => SmolStr::new_static("var"),
                };
                (format_smolstr!("{name}#{i}"), tree.ty(*id).clone())
            })
            .collect::<Vec<_>>();
        let borrowed = fields
            .iter()
            .map(|(name, ty)| (name.as_str(), ty.clone()))
            .collect::<Vec<_>>();
        Some(symbols.register_record(format_smolstr!("closure#{}", root.index()), &borrowed))
    };

    // Synthesize the constants record and its instance.
    let constants_ty = if hoisted.is_empty() {
        None
    } else {
        let fields = hoisted
            .iter()
            .enumerate()
            .map(|(i, id)| (format_smolstr!("const#{i}"), tree.ty(*id).clone()))
            .collect::<Vec<_>>();
        let borrowed = fields
            .iter()
            .map(|(name, ty)| (name.as_str(), ty.clone()))
            .collect::<Vec<_>>();
        Some(symbols.register_record(format_smolstr!("constants#{}", root.index()), &borrowed))
    };

    let mut rewriter = Rewriter {
        src: tree,
        dst: ExprTree::new(),
        symbols,
        param_map: FxHashMap::default(),
        captured_fields: FxHashMap::default(),
        hoisted_fields: FxHashMap::default(),
        closure_param: None,
        constants_param: None,
        prologues: FxHashMap::default(),
        catch_vars,
    };

    if let Some(ty) = closure_ty {
        let param = rewriter.dst.alloc(Node {
            kind: NodeKind::Parameter {
                name: SmolStr::new_static("closure"),
            },
            ty: Ty::Object(ty),
        });
        rewriter.closure_param = Some(param);
        for (i, id) in captured.iter().enumerate() {
            let field = rewriter.symbols.type_layout(ty).fields[i];
            rewriter.captured_fields.insert(*id, field);
        }
    }
    if let Some(ty) = constants_ty {
        let param = rewriter.dst.alloc(Node {
            kind: NodeKind::Parameter {
                name: SmolStr::new_static("constants"),
            },
            ty: Ty::Object(ty),
        });
        rewriter.constants_param = Some(param);
        for (i, id) in hoisted.iter().enumerate() {
            let field = rewriter.symbols.type_layout(ty).fields[i];
            rewriter.hoisted_fields.insert(*id, field);
        }
    }

    let new_root = rewriter.rewrite(root);

    let closure = closure_ty.map(|ty| ClosurePlan {
        ty,
        param: rewriter.closure_param.unwrap_or_else(|| NodeId::new(0)),
        prologues: std::mem::take(&mut rewriter.prologues),
    });
    let constants = constants_ty.map(|ty| {
        let fields = hoisted
            .iter()
            .map(|id| match tree.kind(*id) {
                NodeKind::Constant(value) => value.clone(),
                _ => Value::Null,
            })
            .collect();
        ConstantsPlan {
            ty,
            param: rewriter.constants_param.unwrap_or_else(|| NodeId::new(0)),
            instance: Value::Obj(shared_cell(Object { ty, fields })),
        }
    });

    Ok(Resolved {
        tree: rewriter.dst,
        root: new_root,
        closure,
        constants,
    })
}

fn is_hoisted_constant(value: &Value) -> bool {
    matches!(
        value,
        Value::Array(_) | Value::Dict(_) | Value::Obj(_) | Value::Routine(_)
    )
}

struct Analysis<'t> {
    tree: &'t ExprTree,
    /// Declared variable -> lambda nesting depth of the declaration.
    decl_depth: FxHashMap<NodeId, usize>,
    lambda_depth: usize,
    captured: Vec<NodeId>,
    captured_set: FxHashSet<NodeId>,
    hoisted: Vec<NodeId>,
    catch_vars: FxHashSet<NodeId>,
}

impl Analysis<'_> {
    fn declare(&mut self, id: NodeId) {
        self.decl_depth.insert(id, self.lambda_depth);
    }

    fn undeclare(&mut self, id: NodeId) {
        self.decl_depth.remove(&id);
    }

    fn use_var(&mut self, id: NodeId) -> Result<(), CompileError> {
        let Some(depth) = self.decl_depth.get(&id) else {
            let name = match self.tree.kind(id) {
                NodeKind::Parameter { name } => name.clone(),
                _ => SmolStr::new_static("?"),
            };
            return Err(CompileError::ScopeResolution(name));
        };
        if *depth < self.lambda_depth && self.captured_set.insert(id) {
            self.captured.push(id);
        }
        Ok(())
    }

    fn walk_opt(&mut self, id: Option<NodeId>) -> Result<(), CompileError> {
        match id {
            Some(id) => self.walk(id),
            None => Ok(()),
        }
    }

    fn walk(&mut self, id: NodeId) -> Result<(), CompileError> {
        match self.tree.kind(id) {
            NodeKind::Constant(value) => {
                if is_hoisted_constant(value) && !self.hoisted.contains(&id) {
                    self.hoisted.push(id);
                }
                Ok(())
            }
            NodeKind::Default
            | NodeKind::StaticMember { .. }
            | NodeKind::DebugInfo { .. } => Ok(()),
            NodeKind::Parameter { .. } => self.use_var(id),
            NodeKind::Binary { left, right, .. } => {
                self.walk(*left)?;
                self.walk(*right)
            }
            NodeKind::Unary { operand, .. } => self.walk(*operand),
            NodeKind::Member { target, .. } => self.walk(*target),
            NodeKind::Index { target, key } => {
                self.walk(*target)?;
                self.walk(*key)
            }
            NodeKind::ArrayIndex { target, indexes } => {
                self.walk(*target)?;
                for index in indexes {
                    self.walk(*index)?;
                }
                Ok(())
            }
            NodeKind::Call { target, args, .. } => {
                self.walk_opt(*target)?;
                for arg in args {
                    self.walk(*arg)?;
                }
                Ok(())
            }
            NodeKind::Invoke { target, args } => {
                self.walk(*target)?;
                for arg in args {
                    self.walk(*arg)?;
                }
                Ok(())
            }
            NodeKind::New { args, .. } => {
                for arg in args {
                    self.walk(*arg)?;
                }
                Ok(())
            }
            NodeKind::NewArray { items, .. } => {
                for item in items {
                    self.walk(*item)?;
                }
                Ok(())
            }
            NodeKind::Conditional {
                test,
                then,
                otherwise,
            } => {
                self.walk(*test)?;
                self.walk(*then)?;
                self.walk(*otherwise)
            }
            NodeKind::Block { vars, body } => {
                for var in vars {
                    self.declare(*var);
                }
                for expr in body {
                    self.walk(*expr)?;
                }
                for var in vars {
                    self.undeclare(*var);
                }
                Ok(())
            }
            NodeKind::Assign { target, value, .. } => {
                self.walk(*target)?;
                self.walk(*value)
            }
            NodeKind::Loop { body, .. } => self.walk(*body),
            NodeKind::Goto { value, .. } => self.walk_opt(*value),
            NodeKind::Label { default, .. } => self.walk_opt(*default),
            NodeKind::Switch {
                value,
                cases,
                default,
            } => {
                self.walk(*value)?;
                for case in cases {
                    for test in &case.tests {
                        self.walk(*test)?;
                    }
                    self.walk(case.body)?;
                }
                self.walk_opt(*default)
            }
            NodeKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                self.walk(*body)?;
                for handler in handlers {
                    if let Some(var) = handler.var {
                        self.declare(var);
                        self.catch_vars.insert(var);
                    }
                    self.walk(handler.body)?;
                    if let Some(var) = handler.var {
                        self.undeclare(var);
                    }
                }
                self.walk_opt(*finally)?;
                self.walk_opt(*fault)
            }
            NodeKind::Throw { value } => self.walk_opt(*value),
            NodeKind::Lambda { params, body, .. } => {
                self.lambda_depth += 1;
                for param in params {
                    self.declare(*param);
                }
                self.walk(*body)?;
                for param in params {
                    self.undeclare(*param);
                }
                self.lambda_depth -= 1;
                Ok(())
            }
            NodeKind::MemberInit { new, bindings } => {
                self.walk(*new)?;
                for (_, value) in bindings {
                    self.walk(*value)?;
                }
                Ok(())
            }
            NodeKind::ListInit { new, items } => {
                self.walk(*new)?;
                for item in items {
                    self.walk(*item)?;
                }
                Ok(())
            }
            NodeKind::RuntimeVariables { vars } => {
                for var in vars {
                    self.use_var(*var)?;
                }
                Ok(())
            }
        }
    }
}

struct Rewriter<'t, 's> {
    src: &'t ExprTree,
    dst: ExprTree,
    symbols: &'s Symbols,
    /// Old parameter node -> its copy; parameters keep shared identity.
    param_map: FxHashMap<NodeId, NodeId>,
    captured_fields: FxHashMap<NodeId, FieldId>,
    hoisted_fields: FxHashMap<NodeId, FieldId>,
    closure_param: Option<NodeId>,
    constants_param: Option<NodeId>,
    prologues: FxHashMap<NodeId, Vec<(u16, u16)>>,
    catch_vars: FxHashSet<NodeId>,
}

impl Rewriter<'_, '_> {
    fn alloc(&mut self, kind: NodeKind, ty: Ty) -> NodeId {
        self.dst.alloc(Node { kind, ty })
    }

    /// The declaration-site copy of a parameter node, memoized so every
    /// mention maps to one node.
    fn param_decl(&mut self, id: NodeId) -> NodeId {
        if let Some(copy) = self.param_map.get(&id) {
            return *copy;
        }
        let node = self.src.node(id).clone();
        let copy = self.dst.alloc(node);
        self.param_map.insert(id, copy);
        copy
    }

    /// A read/write mention of a variable: captured ones become closure
    /// field accesses.
    fn param_use(&mut self, id: NodeId) -> NodeId {
        if let Some(field) = self.captured_fields.get(&id).copied() {
            let closure = self
                .closure_param
                .unwrap_or_else(|| NodeId::new(0));
            let ty = self.src.ty(id).clone();
            self.alloc(
                NodeKind::Member {
                    target: closure,
                    field,
                },
                ty,
            )
        } else {
            self.param_decl(id)
        }
    }

    fn rewrite_opt(&mut self, id: Option<NodeId>) -> Option<NodeId> {
        id.map(|id| self.rewrite(id))
    }

    fn rewrite(&mut self, id: NodeId) -> NodeId {
        let ty = self.src.ty(id).clone();
        match self.src.kind(id).clone() {
            NodeKind::Constant(value) => {
                if let Some(field) = self.hoisted_fields.get(&id).copied() {
                    let constants = self
                        .constants_param
                        .unwrap_or_else(|| NodeId::new(0));
                    self.alloc(
                        NodeKind::Member {
                            target: constants,
                            field,
                        },
                        ty,
                    )
                } else {
                    self.alloc(NodeKind::Constant(value), ty)
                }
            }
            NodeKind::Default => self.alloc(NodeKind::Default, ty),
            NodeKind::Parameter { .. } => self.param_use(id),
            NodeKind::Binary { op, left, right } => {
                let left = self.rewrite(left);
                let right = self.rewrite(right);
                self.alloc(NodeKind::Binary { op, left, right }, ty)
            }
            NodeKind::Unary { op, operand } => {
                let operand = self.rewrite(operand);
                self.alloc(NodeKind::Unary { op, operand }, ty)
            }
            NodeKind::Member { target, field } => {
                let target = self.rewrite(target);
                self.alloc(NodeKind::Member { target, field }, ty)
            }
            NodeKind::StaticMember { field } => self.alloc(NodeKind::StaticMember { field }, ty),
            NodeKind::Index { target, key } => {
                let target = self.rewrite(target);
                let key = self.rewrite(key);
                self.alloc(NodeKind::Index { target, key }, ty)
            }
            NodeKind::ArrayIndex { target, indexes } => {
                let target = self.rewrite(target);
                let indexes = indexes.iter().map(|i| self.rewrite(*i)).collect();
                self.alloc(NodeKind::ArrayIndex { target, indexes }, ty)
            }
            NodeKind::Call { func, target, args } => {
                let target = self.rewrite_opt(target);
                let args = args.iter().map(|a| self.rewrite(*a)).collect();
                self.alloc(NodeKind::Call { func, target, args }, ty)
            }
            NodeKind::Invoke { target, args } => {
                let target = self.rewrite(target);
                let args = args.iter().map(|a| self.rewrite(*a)).collect();
                self.alloc(NodeKind::Invoke { target, args }, ty)
            }
            NodeKind::New { ty: type_id, args } => {
                let args = args.iter().map(|a| self.rewrite(*a)).collect();
                self.alloc(NodeKind::New { ty: type_id, args }, ty)
            }
            NodeKind::NewArray { kind, items } => {
                let items = items.iter().map(|i| self.rewrite(*i)).collect();
                self.alloc(NodeKind::NewArray { kind, items }, ty)
            }
            NodeKind::Conditional {
                test,
                then,
                otherwise,
            } => {
                let test = self.rewrite(test);
                let then = self.rewrite(then);
                let otherwise = self.rewrite(otherwise);
                self.alloc(
                    NodeKind::Conditional {
                        test,
                        then,
                        otherwise,
                    },
                    ty,
                )
            }
            NodeKind::Block { vars, body } => {
                // Captured variables live in the closure record, so they
                // stop being block locals.
                let kept: Vec<NodeId> = vars
                    .iter()
                    .filter(|v| !self.captured_fields.contains_key(v))
                    .copied()
                    .collect();
                let vars = kept.into_iter().map(|v| self.param_decl(v)).collect();
                let body = body.iter().map(|e| self.rewrite(*e)).collect();
                self.alloc(NodeKind::Block { vars, body }, ty)
            }
            NodeKind::Assign { target, value, op } => {
                let target = self.rewrite(target);
                let value = self.rewrite(value);
                self.alloc(NodeKind::Assign { target, value, op }, ty)
            }
            NodeKind::Loop {
                body,
                break_label,
                continue_label,
            } => {
                let body = self.rewrite(body);
                self.alloc(
                    NodeKind::Loop {
                        body,
                        break_label,
                        continue_label,
                    },
                    ty,
                )
            }
            NodeKind::Goto {
                kind,
                target,
                value,
            } => {
                let value = self.rewrite_opt(value);
                self.alloc(
                    NodeKind::Goto {
                        kind,
                        target,
                        value,
                    },
                    ty,
                )
            }
            NodeKind::Label { label, default } => {
                let default = self.rewrite_opt(default);
                self.alloc(NodeKind::Label { label, default }, ty)
            }
            NodeKind::Switch {
                value,
                cases,
                default,
            } => {
                let value = self.rewrite(value);
                let cases = cases
                    .iter()
                    .map(|case| crate::tree::SwitchCase {
                        tests: case.tests.iter().map(|t| self.rewrite(*t)).collect(),
                        body: self.rewrite(case.body),
                    })
                    .collect();
                let default = self.rewrite_opt(default);
                self.alloc(
                    NodeKind::Switch {
                        value,
                        cases,
                        default,
                    },
                    ty,
                )
            }
            NodeKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                let body = self.rewrite(body);
                let handlers = handlers
                    .iter()
                    .map(|handler| self.rewrite_handler(handler))
                    .collect();
                let finally = self.rewrite_opt(finally);
                let fault = self.rewrite_opt(fault);
                self.alloc(
                    NodeKind::Try {
                        body,
                        handlers,
                        finally,
                        fault,
                    },
                    ty,
                )
            }
            NodeKind::Throw { value } => {
                let value = self.rewrite_opt(value);
                self.alloc(NodeKind::Throw { value }, ty)
            }
            NodeKind::Lambda { params, body, name } => {
                let new_params: SmallVec<[NodeId; 4]> =
                    params.iter().map(|p| self.param_decl(*p)).collect();
                let body = self.rewrite(body);
                let lambda = self.alloc(
                    NodeKind::Lambda {
                        params: new_params,
                        body,
                        name,
                    },
                    ty,
                );
                let prologue = params
                    .iter()
                    .enumerate()
                    .filter_map(|(position, param)| {
                        self.captured_fields.get(param).map(|field| {
                            (position as u16, self.symbols.field_def(*field).index)
                        })
                    })
                    .collect::<Vec<_>>();
                if !prologue.is_empty() {
                    self.prologues.insert(lambda, prologue);
                }
                lambda
            }
            NodeKind::MemberInit { new, bindings } => {
                let new = self.rewrite(new);
                let bindings = bindings
                    .iter()
                    .map(|(field, value)| (*field, self.rewrite(*value)))
                    .collect();
                self.alloc(NodeKind::MemberInit { new, bindings }, ty)
            }
            NodeKind::ListInit { new, items } => {
                let new = self.rewrite(new);
                let items = items.iter().map(|i| self.rewrite(*i)).collect();
                self.alloc(NodeKind::ListInit { new, items }, ty)
            }
            NodeKind::DebugInfo { line, column } => {
                self.alloc(NodeKind::DebugInfo { line, column }, ty)
            }
            NodeKind::RuntimeVariables { vars } => {
                let vars = vars.iter().map(|v| self.rewrite(*v)).collect();
                self.alloc(NodeKind::RuntimeVariables { vars }, ty)
            }
        }
    }

    /// A captured catch variable cannot be the handler's binding slot; the
    /// handler binds a fresh temporary and stores it into the closure before
    /// the original body runs.
    fn rewrite_handler(&mut self, handler: &CatchHandler) -> CatchHandler {
        match handler.var {
            Some(var) if self.catch_vars.contains(&var) && self.captured_fields.contains_key(&var) => {
                let var_ty = self.src.ty(var).clone();
                let tmp = self.alloc(
                    NodeKind::Parameter {
                        name: SmolStr::new_static("caught"),
                    },
                    var_ty.clone(),
                );
                let member = self.param_use(var);
                let store = self.alloc(
                    NodeKind::Assign {
                        target: member,
                        value: tmp,
                        op: None,
                    },
                    var_ty,
                );
                let body = self.rewrite(handler.body);
                let body_ty = self.dst.ty(body).clone();
                let block = self.alloc(
                    NodeKind::Block {
                        vars: SmallVec::new(),
                        body: smallvec::smallvec![store, body],
                    },
                    body_ty,
                );
                CatchHandler {
                    filter: handler.filter,
                    var: Some(tmp),
                    body: block,
                }
            }
            Some(var) => CatchHandler {
                filter: handler.filter,
                var: Some(self.param_decl(var)),
                body: self.rewrite(handler.body),
            },
            None => CatchHandler {
                filter: handler.filter,
                var: None,
                body: self.rewrite(handler.body),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{BinOp, TreeBuilder};

    #[test]
    fn test_unbound_variable_rejected() {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let stray = b.param("stray", Ty::I32);
        let body = b.binary(BinOp::Add, x, stray);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();
        assert_eq!(
            resolve(&tree, lambda, &symbols).err(),
            Some(CompileError::ScopeResolution("stray".into()))
        );
    }

    #[test]
    fn test_no_captures_no_closure() {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let body = b.binary(BinOp::Add, x, x);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();
        let resolved = resolve(&tree, lambda, &symbols).unwrap();
        assert!(resolved.closure.is_none());
        assert!(resolved.constants.is_none());
    }

    #[test]
    fn test_captured_parameter_gets_closure_field() {
        // x => () => x
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let inner = b.lambda(&[], x);
        let outer = b.lambda(&[x], inner);
        let tree = b.finish();
        let resolved = resolve(&tree, outer, &symbols).unwrap();
        let closure = resolved.closure.expect("closure expected");
        assert_eq!(symbols.field_count(closure.ty), 1);
        // The outer lambda copies its captured parameter at entry.
        assert_eq!(
            closure.prologues.get(&resolved.root),
            Some(&vec![(0u16, 0u16)])
        );
        // The inner lambda use is now a member access on the closure.
        let NodeKind::Lambda { body, .. } = resolved.tree.kind(resolved.root) else {
            panic!("root should stay a lambda");
        };
        let NodeKind::Lambda { body: inner_body, .. } = resolved.tree.kind(*body) else {
            panic!("inner lambda expected");
        };
        assert!(matches!(
            resolved.tree.kind(*inner_body),
            NodeKind::Member { .. }
        ));
    }

    #[test]
    fn test_captured_block_var_leaves_block() {
        // x => { var acc; acc = x; () => acc }
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let acc = b.var("acc", Ty::I32);
        let init = b.assign(acc, x);
        let inner = b.lambda(&[], acc);
        let block = b.block(&[acc], &[init, inner]);
        let outer = b.lambda(&[x], block);
        let tree = b.finish();
        let resolved = resolve(&tree, outer, &symbols).unwrap();
        let closure = resolved.closure.expect("closure expected");
        assert_eq!(symbols.field_count(closure.ty), 1);
        let NodeKind::Lambda { body, .. } = resolved.tree.kind(resolved.root) else {
            panic!("root should stay a lambda");
        };
        let NodeKind::Block { vars, .. } = resolved.tree.kind(*body) else {
            panic!("block expected");
        };
        assert!(vars.is_empty());
    }

    #[test]
    fn test_uncaptured_block_var_stays_declared() {
        // x => { var keep; var esc; keep = x; esc = keep; () => esc }
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let keep = b.var("keep", Ty::I32);
        let esc = b.var("esc", Ty::I32);
        let init_keep = b.assign(keep, x);
        let init_esc = b.assign(esc, keep);
        let inner = b.lambda(&[], esc);
        let block = b.block(&[keep, esc], &[init_keep, init_esc, inner]);
        let outer = b.lambda(&[x], block);
        let tree = b.finish();
        let resolved = resolve(&tree, outer, &symbols).unwrap();
        let NodeKind::Lambda { body, .. } = resolved.tree.kind(resolved.root) else {
            panic!("root should stay a lambda");
        };
        let NodeKind::Block { vars, .. } = resolved.tree.kind(*body) else {
            panic!("block expected");
        };
        // `esc` moved into the closure record; `keep` is still a block local.
        assert_eq!(vars.len(), 1);
        match resolved.tree.kind(vars[0]) {
            NodeKind::Parameter { name } => assert_eq!(name, "keep"),
            other => panic!("parameter expected, got {other:?}"),
        }
    }

    #[test]
    fn test_opaque_constant_hoisted() {
        let symbols = Symbols::new();
        let array = Value::Array(shared_cell(crate::value::ArrayData::from_items(
            Ty::I32,
            vec![Value::I32(5)],
        )));
        let mut b = TreeBuilder::new(&symbols);
        let table = b.constant(array, Ty::array(Ty::I32));
        let zero = b.i32(0);
        let elem = b.array_index(table, &[zero]);
        let lambda = b.lambda(&[], elem);
        let tree = b.finish();
        let resolved = resolve(&tree, lambda, &symbols).unwrap();
        let constants = resolved.constants.expect("constants expected");
        assert_eq!(symbols.field_count(constants.ty), 1);
        match &constants.instance {
            Value::Obj(obj) => assert_eq!(obj.read().fields.len(), 1),
            other => panic!("expected object instance, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_scalar_constants_stay_inline() {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let one = b.i32(1);
        let s = b.str("tag");
        let pair = b.binary(BinOp::Eq, s, s);
        let _ = pair;
        let lambda = b.lambda(&[], one);
        let tree = b.finish();
        let resolved = resolve(&tree, lambda, &symbols).unwrap();
        assert!(resolved.constants.is_none());
    }
}
