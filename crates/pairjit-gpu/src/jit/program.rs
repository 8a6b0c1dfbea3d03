//! Semantic analysis, code generation and evaluation of host kernels.
//!
//! A kernel compiles to a postfix instruction stream evaluated on a small
//! stack of dual numbers. The derivative channel tracks d/dr, so kernels
//! that only assign `energy` get `force` (F/r) for free:
//!
//! ```text
//! force_divr = -(dE/dr) / r
//! ```

use super::syntax::{BinOp, Diagnostic, Expr, KernelDef, Span, Stmt};
use std::collections::HashMap;
use thiserror::Error;

/// Value with its derivative with respect to the pair distance.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Dual {
    pub v: f32,
    pub d: f32,
}

impl Dual {
    #[inline]
    pub const fn constant(v: f32) -> Self {
        Self { v, d: 0.0 }
    }

    #[inline]
    pub const fn new(v: f32, d: f32) -> Self {
        Self { v, d }
    }
}

/// Per-pair quantities visible to kernel source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    R,
    Rsq,
    Rcut,
    Dx,
    Dy,
    Dz,
    Dvdr,
    TypeI,
    TypeJ,
    ChargeI,
    ChargeJ,
    DiameterI,
    DiameterJ,
    /// Orientation component `c` (w, x, y, z) of particle `i` or `j`
    Orient { j: bool, c: u8 },
    Timestep,
    Rand,
}

impl Input {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "r" => Input::R,
            "rsq" => Input::Rsq,
            "rcut" => Input::Rcut,
            "dx" => Input::Dx,
            "dy" => Input::Dy,
            "dz" => Input::Dz,
            "dvdr" => Input::Dvdr,
            "type_i" => Input::TypeI,
            "type_j" => Input::TypeJ,
            "charge_i" => Input::ChargeI,
            "charge_j" => Input::ChargeJ,
            "diameter_i" => Input::DiameterI,
            "diameter_j" => Input::DiameterJ,
            "timestep" => Input::Timestep,
            "rand" => Input::Rand,
            _ => return Self::orientation(name),
        })
    }

    /// `qw_i`, `qx_i`, ... `qz_j`.
    fn orientation(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('q')?;
        let (comp, side) = rest.split_once('_')?;
        let c = match comp {
            "w" => 0,
            "x" => 1,
            "y" => 2,
            "z" => 3,
            _ => return None,
        };
        let j = match side {
            "i" => false,
            "j" => true,
            _ => return None,
        };
        Some(Input::Orient { j, c })
    }
}

/// Values of every `Input` for one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairInputs {
    pub r: f32,
    pub rsq: f32,
    pub rcut: f32,
    pub dx: [f32; 3],
    pub dvdr: f32,
    pub type_i: u32,
    pub type_j: u32,
    pub charge: [f32; 2],
    pub diameter: [f32; 2],
    /// World-frame orientations as (w, x, y, z)
    pub orientation: [[f32; 4]; 2],
    pub timestep: u64,
    pub rand: f32,
}

impl Default for PairInputs {
    fn default() -> Self {
        Self {
            r: 0.0,
            rsq: 0.0,
            rcut: 0.0,
            dx: [0.0; 3],
            dvdr: 0.0,
            type_i: 0,
            type_j: 0,
            charge: [0.0; 2],
            diameter: [0.0; 2],
            orientation: [[1.0, 0.0, 0.0, 0.0]; 2],
            timestep: 0,
            rand: 0.0,
        }
    }
}

impl PairInputs {
    #[inline]
    fn get(&self, input: Input) -> Dual {
        // d(dx)/dr = dx / r: components scale with the separation
        let inv_r = if self.r > 0.0 { 1.0 / self.r } else { 0.0 };
        match input {
            Input::R => Dual::new(self.r, 1.0),
            Input::Rsq => Dual::new(self.rsq, 2.0 * self.r),
            Input::Rcut => Dual::constant(self.rcut),
            Input::Dx => Dual::new(self.dx[0], self.dx[0] * inv_r),
            Input::Dy => Dual::new(self.dx[1], self.dx[1] * inv_r),
            Input::Dz => Dual::new(self.dx[2], self.dx[2] * inv_r),
            Input::Dvdr => Dual::constant(self.dvdr),
            Input::TypeI => Dual::constant(self.type_i as f32),
            Input::TypeJ => Dual::constant(self.type_j as f32),
            Input::ChargeI => Dual::constant(self.charge[0]),
            Input::ChargeJ => Dual::constant(self.charge[1]),
            Input::DiameterI => Dual::constant(self.diameter[0]),
            Input::DiameterJ => Dual::constant(self.diameter[1]),
            Input::Orient { j, c } => Dual::constant(self.orientation[j as usize][c as usize]),
            Input::Timestep => Dual::constant(self.timestep as f32),
            Input::Rand => Dual::constant(self.rand),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Abs,
    Pow,
    Min,
    Max,
    Select,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Builtin::Sqrt,
            "exp" => Builtin::Exp,
            "log" => Builtin::Log,
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "abs" => Builtin::Abs,
            "pow" => Builtin::Pow,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "select" => Builtin::Select,
            _ => return None,
        })
    }

    fn arity(&self) -> usize {
        match self {
            Builtin::Pow | Builtin::Min | Builtin::Max => 2,
            Builtin::Select => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Const(f32),
    Input(Input),
    Load(u16),
    Store(u16),
    Extern(u16),
    Neg,
    Bin(BinOp),
    Call(Builtin),
    SetEnergy,
    SetForce,
}

/// Fault raised while evaluating a kernel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalFault {
    #[error("index {index} out of range for extern '{symbol}' of length {len}")]
    ExternOutOfRange {
        symbol: String,
        index: f32,
        len: usize,
    },
}

/// Energy and F/r of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairResult {
    pub energy: f32,
    pub force_divr: f32,
}

/// Reusable evaluation buffers; one per worker.
#[derive(Debug, Default)]
pub struct Scratch {
    stack: Vec<Dual>,
    locals: Vec<Dual>,
}

/// A compiled kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    name: String,
    ops: Vec<Op>,
    n_locals: usize,
    externs: Vec<String>,
    uses_rand: bool,
    explicit_force: bool,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extern arrays in slot order.
    pub fn externs(&self) -> &[String] {
        &self.externs
    }

    /// Whether the kernel reads `rand`, so callers can skip generating it.
    pub fn uses_rand(&self) -> bool {
        self.uses_rand
    }

    pub fn has_explicit_force(&self) -> bool {
        self.explicit_force
    }

    /// Evaluate for one pair. `externs[k]` backs extern slot `k`.
    pub fn eval(
        &self,
        inputs: &PairInputs,
        externs: &[&[f32]],
        scratch: &mut Scratch,
    ) -> Result<PairResult, EvalFault> {
        let stack = &mut scratch.stack;
        stack.clear();
        scratch.locals.clear();
        scratch.locals.resize(self.n_locals, Dual::default());
        let mut energy = Dual::default();
        let mut force = None;

        for op in &self.ops {
            match *op {
                Op::Const(v) => stack.push(Dual::constant(v)),
                Op::Input(input) => stack.push(inputs.get(input)),
                Op::Load(slot) => stack.push(scratch.locals[slot as usize]),
                Op::Store(slot) => scratch.locals[slot as usize] = pop(stack),
                Op::Extern(slot) => {
                    let idx = pop(stack).v.floor();
                    let data = externs[slot as usize];
                    if !idx.is_finite() || idx < 0.0 || idx >= data.len() as f32 {
                        return Err(EvalFault::ExternOutOfRange {
                            symbol: self.externs[slot as usize].clone(),
                            index: idx,
                            len: data.len(),
                        });
                    }
                    stack.push(Dual::constant(data[idx as usize]));
                }
                Op::Neg => {
                    let a = pop(stack);
                    stack.push(Dual::new(-a.v, -a.d));
                }
                Op::Bin(bin) => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(apply_bin(bin, a, b));
                }
                Op::Call(builtin) => {
                    let mut args = [Dual::default(); 3];
                    for k in (0..builtin.arity()).rev() {
                        args[k] = pop(stack);
                    }
                    stack.push(apply_call(builtin, &args));
                }
                Op::SetEnergy => energy = pop(stack),
                Op::SetForce => force = Some(pop(stack).v),
            }
        }

        let force_divr = match force {
            Some(f) => f,
            None if inputs.r > 0.0 => -energy.d / inputs.r,
            None => 0.0,
        };
        Ok(PairResult {
            energy: energy.v,
            force_divr,
        })
    }
}

#[inline]
fn pop(stack: &mut Vec<Dual>) -> Dual {
    stack.pop().unwrap_or_default()
}

fn apply_bin(op: BinOp, a: Dual, b: Dual) -> Dual {
    let flag = |c: bool| Dual::constant(if c { 1.0 } else { 0.0 });
    match op {
        BinOp::Add => Dual::new(a.v + b.v, a.d + b.d),
        BinOp::Sub => Dual::new(a.v - b.v, a.d - b.d),
        BinOp::Mul => Dual::new(a.v * b.v, a.d * b.v + a.v * b.d),
        BinOp::Div => Dual::new(a.v / b.v, (a.d * b.v - a.v * b.d) / (b.v * b.v)),
        BinOp::Pow => {
            let v = a.v.powf(b.v);
            let d = if b.d == 0.0 {
                if a.d == 0.0 {
                    0.0
                } else {
                    b.v * a.v.powf(b.v - 1.0) * a.d
                }
            } else {
                v * (b.d * a.v.ln() + b.v * a.d / a.v)
            };
            Dual::new(v, d)
        }
        BinOp::Lt => flag(a.v < b.v),
        BinOp::Le => flag(a.v <= b.v),
        BinOp::Gt => flag(a.v > b.v),
        BinOp::Ge => flag(a.v >= b.v),
        BinOp::Eq => flag(a.v == b.v),
        BinOp::Ne => flag(a.v != b.v),
    }
}

fn apply_call(f: Builtin, args: &[Dual; 3]) -> Dual {
    let a = args[0];
    match f {
        Builtin::Sqrt => {
            let s = a.v.sqrt();
            Dual::new(s, if s > 0.0 { a.d / (2.0 * s) } else { 0.0 })
        }
        Builtin::Exp => {
            let e = a.v.exp();
            Dual::new(e, e * a.d)
        }
        Builtin::Log => Dual::new(a.v.ln(), a.d / a.v),
        Builtin::Sin => Dual::new(a.v.sin(), a.v.cos() * a.d),
        Builtin::Cos => Dual::new(a.v.cos(), -a.v.sin() * a.d),
        Builtin::Abs => Dual::new(a.v.abs(), if a.v < 0.0 { -a.d } else { a.d }),
        Builtin::Pow => apply_bin(BinOp::Pow, a, args[1]),
        Builtin::Min => {
            if args[1].v < a.v {
                args[1]
            } else {
                a
            }
        }
        Builtin::Max => {
            if args[1].v > a.v {
                args[1]
            } else {
                a
            }
        }
        Builtin::Select => {
            if a.v != 0.0 {
                args[1]
            } else {
                args[2]
            }
        }
    }
}

/// Fold a constant expression that may reference earlier constants.
pub fn fold_const(
    unit: &str,
    expr: &Expr,
    consts: &HashMap<String, f32>,
) -> Result<f32, Diagnostic> {
    fn go(unit: &str, e: &Expr, consts: &HashMap<String, f32>) -> Result<Dual, Diagnostic> {
        Ok(match e {
            Expr::Num(v) => Dual::constant(*v),
            Expr::Var(name, span) => match consts.get(name) {
                Some(v) => Dual::constant(*v),
                None => {
                    return Err(Diagnostic::new(
                        unit,
                        *span,
                        format!("'{}' is not a constant", name),
                    ))
                }
            },
            Expr::Index(name, _, span) => {
                return Err(Diagnostic::new(
                    unit,
                    *span,
                    format!("extern '{}' cannot appear in a constant", name),
                ))
            }
            Expr::Neg(a) => {
                let a = go(unit, a, consts)?;
                Dual::constant(-a.v)
            }
            Expr::Binary(op, a, b) => apply_bin(*op, go(unit, a, consts)?, go(unit, b, consts)?),
            Expr::Call(name, args, span) => {
                let f = check_call(unit, name, args.len(), *span)?;
                let mut vals = [Dual::default(); 3];
                for (k, arg) in args.iter().enumerate() {
                    vals[k] = go(unit, arg, consts)?;
                }
                apply_call(f, &vals)
            }
        })
    }
    go(unit, expr, consts).map(|d| d.v)
}

fn check_call(unit: &str, name: &str, n_args: usize, span: Span) -> Result<Builtin, Diagnostic> {
    let f = Builtin::from_name(name)
        .ok_or_else(|| Diagnostic::new(unit, span, format!("unknown function '{}'", name)))?;
    if f.arity() != n_args {
        return Err(Diagnostic::new(
            unit,
            span,
            format!(
                "'{}' takes {} argument(s), {} given",
                name,
                f.arity(),
                n_args
            ),
        ));
    }
    Ok(f)
}

struct Codegen<'a> {
    unit: &'a str,
    consts: &'a HashMap<String, f32>,
    locals: HashMap<String, u16>,
    externs: Vec<String>,
    ops: Vec<Op>,
    uses_rand: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Codegen<'a> {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(self.unit, span, message));
    }

    fn expr(&mut self, e: &Expr) {
        match e {
            Expr::Num(v) => self.ops.push(Op::Const(*v)),
            Expr::Var(name, span) => {
                if let Some(&slot) = self.locals.get(name) {
                    self.ops.push(Op::Load(slot));
                } else if let Some(&v) = self.consts.get(name) {
                    self.ops.push(Op::Const(v));
                } else if let Some(input) = Input::from_name(name) {
                    self.uses_rand |= input == Input::Rand;
                    self.ops.push(Op::Input(input));
                } else if self.externs.contains(name) {
                    self.error(*span, format!("extern '{}' must be indexed", name));
                } else {
                    self.error(*span, format!("unknown identifier '{}'", name));
                }
            }
            Expr::Index(name, index, span) => match self.externs.iter().position(|x| x == name) {
                Some(slot) => {
                    self.expr(index);
                    self.ops.push(Op::Extern(slot as u16));
                }
                None => self.error(*span, format!("'{}' is not a declared extern", name)),
            },
            Expr::Neg(a) => {
                self.expr(a);
                self.ops.push(Op::Neg);
            }
            Expr::Binary(op, a, b) => {
                self.expr(a);
                self.expr(b);
                self.ops.push(Op::Bin(*op));
            }
            Expr::Call(name, args, span) => match check_call(self.unit, name, args.len(), *span) {
                Ok(f) => {
                    for a in args {
                        self.expr(a);
                    }
                    self.ops.push(Op::Call(f));
                }
                Err(d) => self.diagnostics.push(d),
            },
        }
    }

    fn is_reserved(&self, name: &str) -> bool {
        Input::from_name(name).is_some()
            || self.consts.contains_key(name)
            || name == "energy"
            || name == "force"
    }
}

/// Compile one kernel definition against the unit's constants.
pub fn compile_kernel(
    unit: &str,
    def: &KernelDef,
    consts: &HashMap<String, f32>,
) -> Result<Program, Vec<Diagnostic>> {
    let mut cg = Codegen {
        unit,
        consts,
        locals: HashMap::new(),
        externs: Vec::new(),
        ops: Vec::new(),
        uses_rand: false,
        diagnostics: Vec::new(),
    };
    let mut has_energy = false;
    let mut explicit_force = false;

    for stmt in &def.body {
        match stmt {
            Stmt::Extern(name, span) => {
                if cg.is_reserved(name) || cg.externs.contains(name) {
                    cg.error(*span, format!("'{}' is already defined", name));
                } else {
                    cg.externs.push(name.clone());
                }
            }
            Stmt::Let(name, value, span) => {
                if cg.is_reserved(name) || cg.externs.contains(name) {
                    cg.error(*span, format!("cannot rebind '{}'", name));
                    continue;
                }
                cg.expr(value);
                let next = cg.locals.len() as u16;
                let slot = *cg.locals.entry(name.clone()).or_insert(next);
                cg.ops.push(Op::Store(slot));
            }
            Stmt::Assign(target, value, span) => match target.as_str() {
                "energy" => {
                    cg.expr(value);
                    cg.ops.push(Op::SetEnergy);
                    has_energy = true;
                }
                "force" => {
                    cg.expr(value);
                    cg.ops.push(Op::SetForce);
                    explicit_force = true;
                }
                other => cg.error(
                    *span,
                    format!(
                        "cannot assign to '{}' (only 'energy' and 'force' are outputs)",
                        other
                    ),
                ),
            },
        }
    }

    if !has_energy {
        cg.error(
            def.span,
            format!("kernel '{}' never assigns 'energy'", def.name),
        );
    }
    if !cg.diagnostics.is_empty() {
        return Err(cg.diagnostics);
    }

    Ok(Program {
        name: def.name.clone(),
        n_locals: cg.locals.len(),
        ops: cg.ops,
        externs: cg.externs,
        uses_rand: cg.uses_rand,
        explicit_force,
    })
}
