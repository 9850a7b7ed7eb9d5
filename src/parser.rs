//! Recursive-descent parser producing per-function statement lists and
//! expression trees.
//!
//! Each production of the grammar is one method on `Parser`:
//!
//! ```text
//! program    = function* | stmt*
//! function   = ident "(" (ident ("," ident)*)? ")" "{" stmt* "}"
//! stmt       = expr ";"
//!            | "{" stmt* "}"
//!            | "if" "(" expr ")" stmt ("else" stmt)?
//!            | "while" "(" expr ")" stmt
//!            | "for" "(" expr? ";" expr? ";" expr? ")" stmt
//!            | "return" expr ";"
//! expr       = assign
//! assign     = equality ("=" assign)?
//! equality   = relational ("==" relational | "!=" relational)*
//! relational = add ("<" add | "<=" add | ">" add | ">=" add)*
//! add        = mul ("+" mul | "-" mul)*
//! mul        = unary ("*" unary | "/" unary)*
//! unary      = ("+" | "-" | "&" | "*") unary | primary
//! primary    = num | ident ("(" (expr ("," expr)*)? ")")? | "(" expr ")"
//! ```
//!
//! A program that does not open with a function definition is treated as
//! the body of an implicit `main`.
//!
//! Locals are resolved while parsing: the first use of a name allocates a
//! frame slot and later uses share it. The table is flat per function, so
//! nested blocks do not shadow.

use tracing::debug;

use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind, describe_token, token_text};
use crate::ty::{SLOT_SIZE, STACK_ALIGN, Type, align_to};

/// Integer arguments beyond this count would need stack passing.
pub const MAX_ARGS: usize = 6;

/// Binary operators recognised by the language. `>` and `>=` never appear:
/// the parser rewrites them into `Lt`/`Le` with swapped operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// Expression tree produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstNode {
  Num {
    value: i64,
  },
  /// Reference to `Function::locals[obj]`.
  Var {
    obj: usize,
  },
  Neg {
    operand: Box<AstNode>,
  },
  Addr {
    operand: Box<AstNode>,
  },
  Deref {
    operand: Box<AstNode>,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
  },
  Assign {
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
  },
  FunCall {
    name: String,
    args: Vec<AstNode>,
  },
}

impl AstNode {
  pub fn number(value: i64) -> Self {
    Self::Num { value }
  }

  pub fn var(obj: usize) -> Self {
    Self::Var { obj }
  }

  pub fn unary_neg(operand: AstNode) -> Self {
    Self::Neg {
      operand: Box::new(operand),
    }
  }

  pub fn addr(operand: AstNode) -> Self {
    Self::Addr {
      operand: Box::new(operand),
    }
  }

  pub fn deref(operand: AstNode) -> Self {
    Self::Deref {
      operand: Box::new(operand),
    }
  }

  pub fn binary(op: BinaryOp, lhs: AstNode, rhs: AstNode) -> Self {
    Self::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn assign(lhs: AstNode, rhs: AstNode) -> Self {
    Self::Assign {
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  /// Whether the node denotes a storage location.
  pub fn is_lvalue(&self) -> bool {
    matches!(self, Self::Var { .. } | Self::Deref { .. })
  }

  /// Compute the type tag of this expression against a function's locals.
  pub fn ty(&self, locals: &[Obj]) -> Type {
    match self {
      Self::Var { obj } => locals[*obj].ty.clone(),
      Self::Addr { operand } => Type::pointer_to(operand.ty(locals)),
      Self::Deref { operand } => operand
        .ty(locals)
        .base()
        .cloned()
        .unwrap_or_else(Type::int),
      Self::Assign { lhs, .. } => lhs.ty(locals),
      Self::Binary {
        op: BinaryOp::Add | BinaryOp::Sub,
        lhs,
        rhs,
      } => {
        let lhs_ty = lhs.ty(locals);
        if lhs_ty.is_pointer() {
          return lhs_ty;
        }
        let rhs_ty = rhs.ty(locals);
        if rhs_ty.is_pointer() { rhs_ty } else { Type::int() }
      }
      Self::Num { .. } | Self::Neg { .. } | Self::Binary { .. } | Self::FunCall { .. } => {
        Type::int()
      }
    }
  }
}

/// Statements. Every statement leaves the operand stack as it found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
  Expr(AstNode),
  Return(AstNode),
  Block(Vec<Stmt>),
  If {
    cond: AstNode,
    then: Box<Stmt>,
    els: Option<Box<Stmt>>,
  },
  While {
    cond: AstNode,
    body: Box<Stmt>,
  },
  For {
    init: Option<AstNode>,
    cond: Option<AstNode>,
    inc: Option<AstNode>,
    body: Box<Stmt>,
  },
}

/// A local variable slot, addressed as `rbp - offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obj {
  pub name: String,
  pub ty: Type,
  pub offset: i64,
}

/// A parsed function. Its parameters occupy `locals[..params]`.
#[derive(Debug, Clone)]
pub struct Function {
  pub name: String,
  pub params: usize,
  pub body: Vec<Stmt>,
  pub locals: Vec<Obj>,
  pub stack_size: i64,
}

/// All functions of the compilation unit, in source order.
#[derive(Debug, Clone)]
pub struct Program {
  pub functions: Vec<Function>,
}

/// Parse a whole program from the token stream.
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Program> {
  let mut parser = Parser::new(tokens, source);

  let mut functions = Vec::new();
  if parser.stream.is_eof() || parser.stream.at_function_header() {
    while !parser.stream.is_eof() {
      if !parser.stream.at_function_header() {
        return Err(parser.stream.unexpected("expected a function definition"));
      }
      let func = parser.parse_function()?;
      if functions.iter().any(|f: &Function| f.name == func.name) {
        return Err(CompileError::syntax(
          source,
          parser.last_function_loc,
          format!("redefinition of function \"{}\"", func.name),
        ));
      }
      functions.push(func);
    }
  } else {
    functions.push(parser.parse_implicit_main()?);
  }

  debug!(count = functions.len(), "parsed program");
  Ok(Program { functions })
}

struct Parser<'a> {
  stream: TokenStream<'a>,
  /// Locals of the function being parsed; taken when the function ends.
  locals: Vec<Obj>,
  last_function_loc: usize,
}

impl<'a> Parser<'a> {
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      stream: TokenStream::new(tokens, source),
      locals: Vec::new(),
      last_function_loc: 0,
    }
  }

  fn source(&self) -> &'a str {
    self.stream.source
  }

  fn find_var(&self, name: &str) -> Option<usize> {
    self.locals.iter().position(|obj| obj.name == name)
  }

  /// Allocate the next slot. Offsets grow by one slot per variable.
  fn new_lvar(&mut self, name: &str) -> usize {
    let offset = self.locals.last().map_or(0, |obj| obj.offset) + SLOT_SIZE;
    self.locals.push(Obj {
      name: name.to_string(),
      ty: Type::int(),
      offset,
    });
    self.locals.len() - 1
  }

  fn finish_function(&mut self, name: String, params: usize, body: Vec<Stmt>) -> Function {
    let locals = std::mem::take(&mut self.locals);
    let frame = locals.last().map_or(0, |obj| obj.offset);
    let stack_size = align_to(frame, STACK_ALIGN);
    debug!(
      function = %name,
      params,
      locals = locals.len(),
      stack_size,
      "parsed function"
    );
    Function {
      name,
      params,
      body,
      locals,
      stack_size,
    }
  }

  fn parse_function(&mut self) -> CompileResult<Function> {
    self.locals.clear();
    let (name, loc) = self.stream.get_ident()?;
    self.last_function_loc = loc;
    self.stream.skip("(")?;

    let mut params = 0;
    if !self.stream.equal(")") {
      loop {
        let (param, param_loc) = self.stream.get_ident()?;
        if self.find_var(param).is_some() {
          return Err(CompileError::syntax(
            self.source(),
            param_loc,
            format!("duplicate parameter \"{param}\""),
          ));
        }
        if params == MAX_ARGS {
          return Err(CompileError::syntax(
            self.source(),
            param_loc,
            format!("too many parameters (at most {MAX_ARGS})"),
          ));
        }
        self.new_lvar(param);
        params += 1;
        if !self.stream.equal(",") {
          break;
        }
      }
      self.stream.skip(")")?;
    }

    self.stream.skip("{")?;
    let mut body = Vec::new();
    while !self.stream.equal("}") {
      body.push(self.parse_stmt()?);
    }

    Ok(self.finish_function(name.to_string(), params, body))
  }

  /// Parse a bare statement list as the body of `main`.
  fn parse_implicit_main(&mut self) -> CompileResult<Function> {
    self.locals.clear();
    let mut body = Vec::new();
    while !self.stream.is_eof() {
      body.push(self.parse_stmt()?);
    }
    Ok(self.finish_function("main".to_string(), 0, body))
  }

  fn parse_stmt(&mut self) -> CompileResult<Stmt> {
    if self.stream.equal("return") {
      let expr = self.parse_expr()?;
      self.stream.skip(";")?;
      return Ok(Stmt::Return(expr));
    }

    if self.stream.equal("if") {
      self.stream.skip("(")?;
      let cond = self.parse_expr()?;
      self.stream.skip(")")?;
      let then = Box::new(self.parse_stmt()?);
      let els = if self.stream.equal("else") {
        Some(Box::new(self.parse_stmt()?))
      } else {
        None
      };
      return Ok(Stmt::If { cond, then, els });
    }

    if self.stream.equal("while") {
      self.stream.skip("(")?;
      let cond = self.parse_expr()?;
      self.stream.skip(")")?;
      let body = Box::new(self.parse_stmt()?);
      return Ok(Stmt::While { cond, body });
    }

    if self.stream.equal("for") {
      self.stream.skip("(")?;
      let init = self.parse_optional_expr(";")?;
      let cond = self.parse_optional_expr(";")?;
      let inc = self.parse_optional_expr(")")?;
      let body = Box::new(self.parse_stmt()?);
      return Ok(Stmt::For {
        init,
        cond,
        inc,
        body,
      });
    }

    if self.stream.equal("{") {
      let mut stmts = Vec::new();
      while !self.stream.equal("}") {
        stmts.push(self.parse_stmt()?);
      }
      return Ok(Stmt::Block(stmts));
    }

    let expr = self.parse_expr()?;
    self.stream.skip(";")?;
    Ok(Stmt::Expr(expr))
  }

  /// Parse `expr? terminator`, as found in the clauses of a `for`.
  fn parse_optional_expr(&mut self, terminator: &str) -> CompileResult<Option<AstNode>> {
    if self.stream.equal(terminator) {
      return Ok(None);
    }
    let expr = self.parse_expr()?;
    self.stream.skip(terminator)?;
    Ok(Some(expr))
  }

  fn parse_expr(&mut self) -> CompileResult<AstNode> {
    self.parse_assign()
  }

  fn parse_assign(&mut self) -> CompileResult<AstNode> {
    let start = self.stream.loc();
    let node = self.parse_equality()?;

    if self.stream.equal("=") {
      if !node.is_lvalue() {
        return Err(CompileError::syntax(self.source(), start, "not an lvalue"));
      }
      let rhs = self.parse_assign()?;
      return Ok(AstNode::assign(node, rhs));
    }

    Ok(node)
  }

  fn parse_equality(&mut self) -> CompileResult<AstNode> {
    let mut node = self.parse_relational()?;

    loop {
      let op = match self.stream.peek_punct() {
        Some("==") => BinaryOp::Eq,
        Some("!=") => BinaryOp::Ne,
        _ => break,
      };
      self.stream.advance();
      let rhs = self.parse_relational()?;
      node = AstNode::binary(op, node, rhs);
    }

    Ok(node)
  }

  fn parse_relational(&mut self) -> CompileResult<AstNode> {
    let mut node = self.parse_add()?;

    loop {
      let (op, swap) = match self.stream.peek_punct() {
        Some("<") => (BinaryOp::Lt, false),
        Some("<=") => (BinaryOp::Le, false),
        Some(">") => (BinaryOp::Lt, true),
        Some(">=") => (BinaryOp::Le, true),
        _ => break,
      };
      self.stream.advance();
      let rhs = self.parse_add()?;
      node = if swap {
        AstNode::binary(op, rhs, node)
      } else {
        AstNode::binary(op, node, rhs)
      };
    }

    Ok(node)
  }

  fn parse_add(&mut self) -> CompileResult<AstNode> {
    let mut node = self.parse_mul()?;

    loop {
      let loc = self.stream.loc();
      match self.stream.peek_punct() {
        Some("+") => {
          self.stream.advance();
          let rhs = self.parse_mul()?;
          node = self.new_add(node, rhs, loc)?;
        }
        Some("-") => {
          self.stream.advance();
          let rhs = self.parse_mul()?;
          node = self.new_sub(node, rhs, loc)?;
        }
        _ => break,
      }
    }

    Ok(node)
  }

  /// `+` with pointer operands scales the integer side by the pointee size.
  fn new_add(&self, lhs: AstNode, rhs: AstNode, loc: usize) -> CompileResult<AstNode> {
    let lhs_ty = lhs.ty(&self.locals);
    let rhs_ty = rhs.ty(&self.locals);

    match (lhs_ty.is_pointer(), rhs_ty.is_pointer()) {
      (false, false) => Ok(AstNode::binary(BinaryOp::Add, lhs, rhs)),
      (true, false) => {
        let scaled = scale(rhs, &lhs_ty);
        Ok(AstNode::binary(BinaryOp::Add, lhs, scaled))
      }
      (false, true) => {
        let scaled = scale(lhs, &rhs_ty);
        Ok(AstNode::binary(BinaryOp::Add, scaled, rhs))
      }
      (true, true) => Err(CompileError::syntax(self.source(), loc, "invalid operands")),
    }
  }

  /// `ptr - int` scales like `+`; `ptr - ptr` yields the element distance.
  fn new_sub(&self, lhs: AstNode, rhs: AstNode, loc: usize) -> CompileResult<AstNode> {
    let lhs_ty = lhs.ty(&self.locals);
    let rhs_ty = rhs.ty(&self.locals);

    match (lhs_ty.is_pointer(), rhs_ty.is_pointer()) {
      (false, false) => Ok(AstNode::binary(BinaryOp::Sub, lhs, rhs)),
      (true, false) => {
        let scaled = scale(rhs, &lhs_ty);
        Ok(AstNode::binary(BinaryOp::Sub, lhs, scaled))
      }
      (true, true) => {
        let size = pointee_size(&lhs_ty);
        let distance = AstNode::binary(BinaryOp::Sub, lhs, rhs);
        Ok(AstNode::binary(
          BinaryOp::Div,
          distance,
          AstNode::number(size),
        ))
      }
      (false, true) => Err(CompileError::syntax(self.source(), loc, "invalid operands")),
    }
  }

  fn parse_mul(&mut self) -> CompileResult<AstNode> {
    let mut node = self.parse_unary()?;

    loop {
      let op = match self.stream.peek_punct() {
        Some("*") => BinaryOp::Mul,
        Some("/") => BinaryOp::Div,
        _ => break,
      };
      self.stream.advance();
      let rhs = self.parse_unary()?;
      node = AstNode::binary(op, node, rhs);
    }

    Ok(node)
  }

  fn parse_unary(&mut self) -> CompileResult<AstNode> {
    if self.stream.equal("+") {
      return self.parse_unary();
    }

    if self.stream.equal("-") {
      let operand = self.parse_unary()?;
      return Ok(AstNode::unary_neg(operand));
    }

    if self.stream.equal("&") {
      let start = self.stream.loc();
      let operand = self.parse_unary()?;
      if !operand.is_lvalue() {
        return Err(CompileError::syntax(self.source(), start, "not an lvalue"));
      }
      return Ok(AstNode::addr(operand));
    }

    if self.stream.equal("*") {
      let operand = self.parse_unary()?;
      return Ok(AstNode::deref(operand));
    }

    self.parse_primary()
  }

  fn parse_primary(&mut self) -> CompileResult<AstNode> {
    if self.stream.equal("(") {
      let node = self.parse_expr()?;
      self.stream.skip(")")?;
      return Ok(node);
    }

    if self.stream.peek_kind() == Some(TokenKind::Ident) {
      let (name, loc) = self.stream.get_ident()?;

      if self.stream.equal("(") {
        return self.parse_funcall(name, loc);
      }

      let obj = match self.find_var(name) {
        Some(obj) => obj,
        None => self.new_lvar(name),
      };
      return Ok(AstNode::var(obj));
    }

    let (value, _) = self.stream.get_number()?;
    Ok(AstNode::number(value))
  }

  /// Parse the argument list of a call; the callee name and "(" are consumed.
  fn parse_funcall(&mut self, name: &str, loc: usize) -> CompileResult<AstNode> {
    let mut args = Vec::new();
    if !self.stream.equal(")") {
      loop {
        args.push(self.parse_expr()?);
        if !self.stream.equal(",") {
          break;
        }
      }
      self.stream.skip(")")?;
    }

    if args.len() > MAX_ARGS {
      return Err(CompileError::syntax(
        self.source(),
        loc,
        format!("too many arguments (at most {MAX_ARGS})"),
      ));
    }

    Ok(AstNode::FunCall {
      name: name.to_string(),
      args,
    })
  }
}

fn pointee_size(ty: &Type) -> i64 {
  ty.base().map_or(SLOT_SIZE, Type::size)
}

fn scale(index: AstNode, ptr_ty: &Type) -> AstNode {
  AstNode::binary(
    BinaryOp::Mul,
    index,
    AstNode::number(pointee_size(ptr_ty)),
  )
}

/// Lightweight cursor over the token vector. It only ever moves forward.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  /// Take ownership of the token stream; the parser will advance `pos` as it consumes input.
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  /// Text of the current token when it is a punctuator.
  fn peek_punct(&self) -> Option<&'a str> {
    let source = self.source;
    self
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, source))
  }

  /// Byte offset of the current token, or the end of input.
  fn loc(&self) -> usize {
    self.peek().map_or(self.source.len(), |token| token.loc)
  }

  fn advance(&mut self) {
    self.pos += 1;
  }

  fn is_at(&self, index: usize, text: &str) -> bool {
    self.tokens.get(index).is_some_and(|token| {
      matches!(token.kind, TokenKind::Punctuator | TokenKind::Keyword)
        && token.len == text.len()
        && token_text(token, self.source) == text
    })
  }

  fn is_ident_at(&self, index: usize) -> bool {
    self
      .tokens
      .get(index)
      .is_some_and(|token| token.kind == TokenKind::Ident)
  }

  /// Peek for `ident "(" (ident ("," ident)*)? ")" "{"` without consuming.
  fn at_function_header(&self) -> bool {
    let mut i = self.pos;
    if !self.is_ident_at(i) || !self.is_at(i + 1, "(") {
      return false;
    }
    i += 2;

    if !self.is_at(i, ")") {
      loop {
        if !self.is_ident_at(i) {
          return false;
        }
        i += 1;
        if !self.is_at(i, ",") {
          break;
        }
        i += 1;
      }
    }

    self.is_at(i, ")") && self.is_at(i + 1, "{")
  }

  /// Consume the current token if it is the given punctuator or keyword.
  fn equal(&mut self, op: &str) -> bool {
    if self.is_at(self.pos, op) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      let got = describe_token(self.peek(), self.source);
      Err(CompileError::syntax(
        self.source,
        self.loc(),
        format!("expected \"{s}\", but got \"{got}\""),
      ))
    }
  }

  /// Error pointing at the current token.
  fn unexpected(&self, message: &str) -> CompileError {
    let got = describe_token(self.peek(), self.source);
    CompileError::syntax(self.source, self.loc(), format!("{message}, but got \"{got}\""))
  }

  /// Parse the current token as an integer literal returning its value and location.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Num
    {
      let value = token.value.ok_or_else(|| {
        CompileError::syntax(
          self.source,
          token.loc,
          "internal error: numeric token missing value",
        )
      })?;
      let loc = token.loc;
      self.pos += 1;
      return Ok((value, loc));
    }

    Err(self.unexpected("expected an expression"))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<(&'a str, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
    {
      let ident = token_text(token, self.source);
      let loc = token.loc;
      self.pos += 1;
      return Ok((ident, loc));
    }

    Err(self.unexpected("expected an identifier"))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
  }
}
