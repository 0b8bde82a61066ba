use crate::lexer::SrcPos;

/// A complete Flap program
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Source file name, carried into diagnostics
    pub file: String,
    /// `import` declarations, in source order
    pub imports: Vec<Import>,
    /// Top-level statements in source order (function bindings included)
    pub statements: Vec<Stmt>,
}

/// A dynamic-library import: `import c "libc.so.6"`
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    /// Alias the library is referenced through (`c.puts`)
    pub alias: String,
    /// The DT_NEEDED library name
    pub library: String,
    /// Where the declaration appears
    pub pos: SrcPos,
}

/// How many workers a parallel loop requests
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCount {
    /// `@@ i in …` — one worker per detected core
    Auto,
    /// `n @ i in …` — an expression evaluated before fan-out
    Count(Expr),
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Variable binding or reassignment: `x = expr`
    Assign {
        /// Name being bound
        name: String,
        /// Value expression (a `Lambda` here defines a function)
        value: Expr,
        /// Source position of the name
        pos: SrcPos,
    },

    /// In-place element store: `l[i] <- x`
    IndexAssign {
        /// The list or map being mutated
        target: Expr,
        /// Element index or key
        index: Expr,
        /// Value stored
        value: Expr,
        /// Source position of the store arrow
        pos: SrcPos,
    },

    /// Guarded statement: `cond -> stmt`
    Guarded {
        /// Guard condition
        cond: Expr,
        /// Statement run when the guard is truthy
        body: Box<Stmt>,
        /// Source position of the arrow
        pos: SrcPos,
    },

    /// Range loop: `@ i in lo..<hi { body }`
    RangeLoop {
        /// Induction variable name
        var: String,
        /// Lower bound (inclusive)
        start: Expr,
        /// Upper bound
        end: Expr,
        /// Whether the upper bound is included (`..` vs `..<`)
        inclusive: bool,
        /// Loop body
        body: Vec<Stmt>,
        /// Source position of the `@`
        pos: SrcPos,
    },

    /// Parallel loop: `@@ i in lo..<hi { body }` or `n @ i in … { body }`
    ParallelLoop {
        /// Induction variable name
        var: String,
        /// Lower bound (inclusive)
        start: Expr,
        /// Upper bound
        end: Expr,
        /// Whether the upper bound is included
        inclusive: bool,
        /// Worker-count request
        workers: WorkerCount,
        /// Loop body, compiled as the worker body function
        body: Vec<Stmt>,
        /// Source position of the loop head
        pos: SrcPos,
    },

    /// `break`
    Break {
        /// Source position
        pos: SrcPos,
    },

    /// `continue`
    Continue {
        /// Source position
        pos: SrcPos,
    },

    /// `return expr?`
    Return {
        /// Optional return value
        value: Option<Expr>,
        /// Source position
        pos: SrcPos,
    },

    /// `defer { body }` — runs on every scope exit, reverse order
    Defer {
        /// Deferred statements
        body: Vec<Stmt>,
        /// Source position
        pos: SrcPos,
    },

    /// `arena { body }` — scoped bump allocator
    Arena {
        /// Scoped statements
        body: Vec<Stmt>,
        /// Source position
        pos: SrcPos,
    },

    /// `unsafe { body }`
    Unsafe {
        /// Unchecked statements
        body: Vec<Stmt>,
        /// Source position
        pos: SrcPos,
    },

    /// Bare expression evaluated for effect
    Expr(Expr),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `and`
    And,
    /// `or`
    Or,
    /// `or!` — error-default
    OrElse,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical not
    Not,
}

/// Channel operations, recognized from their builtin names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpKind {
    /// `channel(capacity)` — create
    Create,
    /// `send(ch, val)`
    Send,
    /// `recv(ch)`
    Recv,
    /// `close(ch)`
    Close,
}

/// One guarded arm of a match block
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    /// Guard condition
    pub guard: Expr,
    /// Arm value
    pub value: Expr,
    /// Source position of the arm
    pub pos: SrcPos,
}

/// Body of a lambda: a single expression or a statement block
#[derive(Debug, Clone, PartialEq)]
pub enum LambdaBody {
    /// `x => expr`
    Expr(Box<Expr>),
    /// `x => { stmts }`
    Block(Vec<Stmt>),
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Number {
        /// The IEEE-754 double value
        value: f64,
        /// Source position
        pos: SrcPos,
    },

    /// String literal
    Str {
        /// Literal bytes, escapes resolved
        value: String,
        /// Source position
        pos: SrcPos,
    },

    /// List literal: `[a, b, c]`
    List {
        /// Element expressions
        items: Vec<Expr>,
        /// Source position
        pos: SrcPos,
    },

    /// Map literal: `["k": v, …]` (`[:]` is empty)
    Map {
        /// Key/value pairs in source order
        entries: Vec<(Expr, Expr)>,
        /// Source position
        pos: SrcPos,
    },

    /// Identifier reference
    Ident {
        /// The name
        name: String,
        /// Source position
        pos: SrcPos,
    },

    /// Import member reference: `c.puts`
    Member {
        /// Import alias
        object: String,
        /// Member name
        name: String,
        /// Source position
        pos: SrcPos,
    },

    /// Error-code accessor: `v.error`
    ErrorCode {
        /// Operand value
        value: Box<Expr>,
        /// Source position
        pos: SrcPos,
    },

    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
        /// Source position of the operator
        pos: SrcPos,
    },

    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
        /// Source position
        pos: SrcPos,
    },

    /// Call: `f(a, b)` or `c.puts(s)`
    Call {
        /// Callee (identifier or member)
        callee: Box<Expr>,
        /// Argument expressions
        args: Vec<Expr>,
        /// Source position of the opening paren
        pos: SrcPos,
    },

    /// Channel operation (recognized builtin)
    ChannelOp {
        /// Which channel operation
        op: ChannelOpKind,
        /// Arguments
        args: Vec<Expr>,
        /// Source position
        pos: SrcPos,
    },

    /// Indexing: `l[i]` / `m[k]`
    Index {
        /// Collection
        target: Box<Expr>,
        /// Index or key
        index: Box<Expr>,
        /// Source position of the bracket
        pos: SrcPos,
    },

    /// Lambda: `(a, b) => body` or `x => body`
    Lambda {
        /// Parameter names
        params: Vec<String>,
        /// Body
        body: LambdaBody,
        /// Source position of the arrow
        pos: SrcPos,
    },

    /// Guard-match block: `{ | g1 -> v1 | g2 -> v2 ~> default }`
    Match {
        /// Guarded arms in source order
        arms: Vec<MatchArm>,
        /// `~>` default value
        default: Option<Box<Expr>>,
        /// Source position of the opening brace
        pos: SrcPos,
    },
}

impl Expr {
    /// Source position of this expression
    pub fn pos(&self) -> SrcPos {
        match self {
            Expr::Number { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::List { pos, .. }
            | Expr::Map { pos, .. }
            | Expr::Ident { pos, .. }
            | Expr::Member { pos, .. }
            | Expr::ErrorCode { pos, .. }
            | Expr::Binary { pos, .. }
            | Expr::Unary { pos, .. }
            | Expr::Call { pos, .. }
            | Expr::ChannelOp { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::Lambda { pos, .. }
            | Expr::Match { pos, .. } => *pos,
        }
    }
}

impl Stmt {
    /// Source position of this statement
    pub fn pos(&self) -> SrcPos {
        match self {
            Stmt::Assign { pos, .. }
            | Stmt::IndexAssign { pos, .. }
            | Stmt::Guarded { pos, .. }
            | Stmt::RangeLoop { pos, .. }
            | Stmt::ParallelLoop { pos, .. }
            | Stmt::Break { pos }
            | Stmt::Continue { pos }
            | Stmt::Return { pos, .. }
            | Stmt::Defer { pos, .. }
            | Stmt::Arena { pos, .. }
            | Stmt::Unsafe { pos, .. } => *pos,
            Stmt::Expr(e) => e.pos(),
        }
    }
}
