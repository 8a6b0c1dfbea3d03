//! Lexer and parser for host evaluator source.
//!
//! ```text
//! unit  := item*
//! item  := "kernel" IDENT "{" stmt* "}"
//!        | "const" IDENT "=" expr ";"
//! stmt  := "extern" IDENT ";"
//!        | "let" IDENT "=" expr ";"
//!        | IDENT "=" expr ";"                 (energy / force outputs)
//! expr  := sum (("<" | "<=" | ">" | ">=" | "==" | "!=") sum)?
//! sum   := term (("+" | "-") term)*
//! term  := unary (("*" | "/") unary)*
//! unary := "-" unary | power
//! power := postfix ("^" unary)?
//! postfix := primary ("[" expr "]")?
//! primary := NUMBER | IDENT | IDENT "(" args ")" | "(" expr ")"
//! ```
//!
//! Comments run from `//` to the end of the line.

use std::fmt;

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// One compiler message.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub unit: String,
    pub span: Span,
    pub message: String,
}

impl Diagnostic {
    pub fn new(unit: &str, span: Span, message: impl Into<String>) -> Self {
        Self {
            unit: unit.to_string(),
            span,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: error: {}", self.unit, self.span, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f32),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f32),
    Var(String, Span),
    Index(String, Box<Expr>, Span),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>, Span),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Extern(String, Span),
    Let(String, Expr, Span),
    Assign(String, Expr, Span),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelDef {
    pub name: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDef {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

/// Parsed translation unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceUnit {
    pub name: String,
    pub consts: Vec<ConstDef>,
    pub kernels: Vec<KernelDef>,
}

const PUNCTS: [&str; 20] = [
    "<=", ">=", "==", "!=", "{", "}", "(", ")", "[", "]", ";", ",", "=", "+", "-", "*", "/",
    "^", "<", ">",
];

fn lex(unit: &str, src: &str) -> Result<Vec<(Tok, Span)>, Diagnostic> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let (mut i, mut line, mut col) = (0usize, 1u32, 1u32);

    while i < chars.len() {
        let c = chars[i];
        let span = Span { line, col };
        if c == '\n' {
            i += 1;
            line += 1;
            col = 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            col += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            col += (i - start) as u32;
            toks.push((Tok::Ident(word), span));
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            col += (i - start) as u32;
            let value = text
                .parse::<f32>()
                .map_err(|_| Diagnostic::new(unit, span, format!("malformed number '{}'", text)))?;
            toks.push((Tok::Num(value), span));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match PUNCTS.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                i += p.len();
                col += p.len() as u32;
                toks.push((Tok::Punct(*p), span));
            }
            None => {
                return Err(Diagnostic::new(
                    unit,
                    span,
                    format!("unexpected character '{}'", c),
                ))
            }
        }
    }
    toks.push((Tok::Eof, Span { line, col }));
    Ok(toks)
}

struct Parser<'a> {
    unit: &'a str,
    toks: Vec<(Tok, Span)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos].0
    }

    fn span(&self) -> Span {
        self.toks[self.pos].1
    }

    fn bump(&mut self) -> (Tok, Span) {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, Diagnostic> {
        Err(Diagnostic::new(self.unit, self.span(), message))
    }

    fn describe(tok: &Tok) -> String {
        match tok {
            Tok::Ident(s) => format!("'{}'", s),
            Tok::Num(v) => format!("number {}", v),
            Tok::Punct(p) => format!("'{}'", p),
            Tok::Eof => "end of input".to_string(),
        }
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Tok::Punct(q) if *q == p)
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), Diagnostic> {
        if self.is_punct(p) {
            self.bump();
            Ok(())
        } else {
            self.err(format!("expected '{}', found {}", p, Self::describe(self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), Diagnostic> {
        match self.bump() {
            (Tok::Ident(name), span) => Ok((name, span)),
            (other, span) => Err(Diagnostic::new(
                self.unit,
                span,
                format!("expected identifier, found {}", Self::describe(&other)),
            )),
        }
    }

    fn unit(&mut self) -> Result<SourceUnit, Diagnostic> {
        let mut unit = SourceUnit {
            name: self.unit.to_string(),
            ..Default::default()
        };
        loop {
            match self.peek().clone() {
                Tok::Eof => break,
                Tok::Ident(kw) if kw == "kernel" => {
                    let span = self.span();
                    self.bump();
                    let (name, _) = self.expect_ident()?;
                    self.expect_punct("{")?;
                    let mut body = Vec::new();
                    while !self.is_punct("}") {
                        if matches!(self.peek(), Tok::Eof) {
                            return self.err(format!("unterminated kernel '{}'", name));
                        }
                        body.push(self.stmt()?);
                    }
                    self.expect_punct("}")?;
                    unit.kernels.push(KernelDef { name, body, span });
                }
                Tok::Ident(kw) if kw == "const" => {
                    self.bump();
                    let (name, span) = self.expect_ident()?;
                    self.expect_punct("=")?;
                    let value = self.expr()?;
                    self.expect_punct(";")?;
                    unit.consts.push(ConstDef { name, value, span });
                }
                other => {
                    return self.err(format!(
                        "expected 'kernel' or 'const', found {}",
                        Self::describe(&other)
                    ))
                }
            }
        }
        Ok(unit)
    }

    fn stmt(&mut self) -> Result<Stmt, Diagnostic> {
        let (word, span) = self.expect_ident()?;
        let stmt = match word.as_str() {
            "extern" => {
                let (name, span) = self.expect_ident()?;
                Stmt::Extern(name, span)
            }
            "let" => {
                let (name, span) = self.expect_ident()?;
                self.expect_punct("=")?;
                Stmt::Let(name, self.expr()?, span)
            }
            _ => {
                self.expect_punct("=")?;
                Stmt::Assign(word, self.expr()?, span)
            }
        };
        self.expect_punct(";")?;
        Ok(stmt)
    }

    fn expr(&mut self) -> Result<Expr, Diagnostic> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Tok::Punct("<") => BinOp::Lt,
            Tok::Punct("<=") => BinOp::Le,
            Tok::Punct(">") => BinOp::Gt,
            Tok::Punct(">=") => BinOp::Ge,
            Tok::Punct("==") => BinOp::Eq,
            Tok::Punct("!=") => BinOp::Ne,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.sum()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("+") => BinOp::Add,
                Tok::Punct("-") => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("*") => BinOp::Mul,
                Tok::Punct("/") => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, Diagnostic> {
        if self.is_punct("-") {
            self.bump();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        let base = self.postfix()?;
        if self.is_punct("^") {
            self.bump();
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, Diagnostic> {
        let base = self.primary()?;
        if self.is_punct("[") {
            let Expr::Var(name, span) = base else {
                return self.err("only extern arrays can be indexed");
            };
            self.bump();
            let index = self.expr()?;
            self.expect_punct("]")?;
            return Ok(Expr::Index(name, Box::new(index), span));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, Diagnostic> {
        match self.bump() {
            (Tok::Num(v), _) => Ok(Expr::Num(v)),
            (Tok::Ident(name), span) => {
                if self.is_punct("(") {
                    self.bump();
                    let mut args = Vec::new();
                    if !self.is_punct(")") {
                        args.push(self.expr()?);
                        while self.is_punct(",") {
                            self.bump();
                            args.push(self.expr()?);
                        }
                    }
                    self.expect_punct(")")?;
                    Ok(Expr::Call(name, args, span))
                } else {
                    Ok(Expr::Var(name, span))
                }
            }
            (Tok::Punct("("), _) => {
                let e = self.expr()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            (other, span) => Err(Diagnostic::new(
                self.unit,
                span,
                format!("expected expression, found {}", Self::describe(&other)),
            )),
        }
    }
}

/// Parse one translation unit.
pub fn parse(unit: &str, src: &str) -> Result<SourceUnit, Diagnostic> {
    let toks = lex(unit, src)?;
    let mut parser = Parser {
        unit,
        toks,
        pos: 0,
    };
    parser.unit()
}
