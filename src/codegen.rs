//! Code generation: lower the parsed program into Intel-syntax x86-64 assembly.
//!
//! The emitter uses a simple stack machine: every expression leaves a single
//! value on the stack and statements pop intermediate results as we chain
//! them. Locals live on the stack frame and are addressed relative to `rbp`.
//! Arguments travel in the System V integer registers.

use tracing::{debug, trace};

use crate::parser::{AstNode, BinaryOp, Function, MAX_ARGS, Program, Stmt};

const ARG_REGS: [&str; MAX_ARGS] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// Emit assembly for a whole program.
pub fn generate(program: &Program) -> String {
  let mut codegen = CodeGen::default();
  codegen.asm.push_str(".intel_syntax noprefix\n");
  codegen.asm.push_str(".global main\n");

  for func in &program.functions {
    codegen.emit_function(func);
  }

  debug!(
    functions = program.functions.len(),
    labels = codegen.label_seq,
    "generated assembly"
  );
  codegen.asm
}

/// Output buffer plus the label counter, which is shared by every function
/// of the compilation unit so labels never collide.
#[derive(Default)]
struct CodeGen {
  asm: String,
  label_seq: usize,
}

impl CodeGen {
  fn emit(&mut self, instr: &str) {
    self.asm.push_str("    ");
    self.asm.push_str(instr);
    self.asm.push('\n');
  }

  fn label(&mut self, name: &str) {
    self.asm.push_str(name);
    self.asm.push_str(":\n");
  }

  fn next_label(&mut self) -> usize {
    self.label_seq += 1;
    trace!(seq = self.label_seq, "allocated label");
    self.label_seq
  }

  fn emit_function(&mut self, func: &Function) {
    self.label(&func.name);

    // Prologue.
    self.emit("push rbp");
    self.emit("mov rbp, rsp");
    if func.stack_size > 0 {
      self.emit(&format!("sub rsp, {}", func.stack_size));
    }
    for (param, reg) in func.locals[..func.params].iter().zip(ARG_REGS) {
      self.emit(&format!("mov [rbp-{}], {reg}", param.offset));
    }

    for stmt in &func.body {
      self.emit_stmt(stmt, func);
    }

    // Epilogue, shared by every `return` and by falling off the end.
    self.label(&format!(".L.return.{}", func.name));
    self.emit("mov rsp, rbp");
    self.emit("pop rbp");
    self.emit("ret");
  }

  /// Emit one statement. The operand stack is balanced afterwards.
  fn emit_stmt(&mut self, stmt: &Stmt, func: &Function) {
    match stmt {
      Stmt::Expr(expr) => {
        self.emit_expr(expr, func);
        self.emit("pop rax");
      }
      Stmt::Return(expr) => {
        self.emit_expr(expr, func);
        self.emit("pop rax");
        self.emit(&format!("jmp .L.return.{}", func.name));
      }
      Stmt::Block(stmts) => {
        for stmt in stmts {
          self.emit_stmt(stmt, func);
        }
      }
      Stmt::If { cond, then, els } => {
        let seq = self.next_label();
        self.emit_expr(cond, func);
        self.emit_branch_if_zero(&format!(".L.else.{seq}"));
        self.emit_stmt(then, func);
        self.emit(&format!("jmp .L.end.{seq}"));
        self.label(&format!(".L.else.{seq}"));
        if let Some(els) = els {
          self.emit_stmt(els, func);
        }
        self.label(&format!(".L.end.{seq}"));
      }
      Stmt::While { cond, body } => {
        let seq = self.next_label();
        self.label(&format!(".L.begin.{seq}"));
        self.emit_expr(cond, func);
        self.emit_branch_if_zero(&format!(".L.end.{seq}"));
        self.emit_stmt(body, func);
        self.emit(&format!("jmp .L.begin.{seq}"));
        self.label(&format!(".L.end.{seq}"));
      }
      Stmt::For {
        init,
        cond,
        inc,
        body,
      } => {
        let seq = self.next_label();
        if let Some(init) = init {
          self.emit_expr(init, func);
          self.emit("pop rax");
        }
        self.label(&format!(".L.begin.{seq}"));
        if let Some(cond) = cond {
          self.emit_expr(cond, func);
          self.emit_branch_if_zero(&format!(".L.end.{seq}"));
        }
        self.emit_stmt(body, func);
        if let Some(inc) = inc {
          self.emit_expr(inc, func);
          self.emit("pop rax");
        }
        self.emit(&format!("jmp .L.begin.{seq}"));
        self.label(&format!(".L.end.{seq}"));
      }
    }
  }

  /// Pop the condition and jump to `target` when it is zero.
  fn emit_branch_if_zero(&mut self, target: &str) {
    self.emit("pop rax");
    self.emit("cmp rax, 0");
    self.emit(&format!("je {target}"));
  }

  /// Emit stack-based code for a single expression node.
  fn emit_expr(&mut self, node: &AstNode, func: &Function) {
    match node {
      AstNode::Num { value } => {
        if i32::try_from(*value).is_ok() {
          self.emit(&format!("push {value}"));
        } else {
          self.emit(&format!("mov rax, {value}"));
          self.emit("push rax");
        }
      }
      AstNode::Var { .. } => {
        self.emit_addr(node, func);
        self.emit_load();
      }
      AstNode::Addr { operand } => self.emit_addr(operand, func),
      AstNode::Deref { operand } => {
        self.emit_expr(operand, func);
        self.emit_load();
      }
      AstNode::Neg { operand } => {
        self.emit_expr(operand, func);
        self.emit("pop rax");
        self.emit("neg rax");
        self.emit("push rax");
      }
      AstNode::Assign { lhs, rhs } => {
        self.emit_addr(lhs, func);
        self.emit_expr(rhs, func);
        self.emit("pop rdi");
        self.emit("pop rax");
        self.emit("mov [rax], rdi");
        self.emit("push rdi");
      }
      AstNode::Binary { op, lhs, rhs } => {
        self.emit_expr(lhs, func);
        self.emit_expr(rhs, func);
        self.emit("pop rdi");
        self.emit("pop rax");
        match op {
          BinaryOp::Add => self.emit("add rax, rdi"),
          BinaryOp::Sub => self.emit("sub rax, rdi"),
          BinaryOp::Mul => self.emit("imul rax, rdi"),
          BinaryOp::Div => {
            self.emit("cqo");
            self.emit("idiv rdi");
          }
          BinaryOp::Eq => self.emit_compare("sete"),
          BinaryOp::Ne => self.emit_compare("setne"),
          BinaryOp::Lt => self.emit_compare("setl"),
          BinaryOp::Le => self.emit_compare("setle"),
        }
        self.emit("push rax");
      }
      AstNode::FunCall { name, args } => self.emit_call(name, args, func),
    }
  }

  fn emit_compare(&mut self, set: &str) {
    self.emit("cmp rax, rdi");
    self.emit(&format!("{set} al"));
    self.emit("movzb rax, al");
  }

  /// Evaluate arguments left to right, then move them into registers.
  ///
  /// `rsp` must be 16-byte aligned at the `call`. Its alignment depends on
  /// how many temporaries are live, so it is checked at run time.
  fn emit_call(&mut self, name: &str, args: &[AstNode], func: &Function) {
    for arg in args {
      self.emit_expr(arg, func);
    }
    for reg in ARG_REGS[..args.len()].iter().rev() {
      self.emit(&format!("pop {reg}"));
    }

    let seq = self.next_label();
    self.emit("mov rax, rsp");
    self.emit("and rax, 15");
    self.emit(&format!("jnz .L.call.{seq}"));
    self.emit("mov rax, 0");
    self.emit(&format!("call {name}"));
    self.emit(&format!("jmp .L.end.{seq}"));
    self.label(&format!(".L.call.{seq}"));
    self.emit("sub rsp, 8");
    self.emit("mov rax, 0");
    self.emit(&format!("call {name}"));
    self.emit("add rsp, 8");
    self.label(&format!(".L.end.{seq}"));
    self.emit("push rax");
  }

  /// Push the address of an lvalue.
  fn emit_addr(&mut self, node: &AstNode, func: &Function) {
    match node {
      AstNode::Var { obj } => {
        let offset = func.locals[*obj].offset;
        self.emit(&format!("lea rax, [rbp-{offset}]"));
        self.emit("push rax");
      }
      AstNode::Deref { operand } => self.emit_expr(operand, func),
      _ => panic!("not an lvalue"),
    }
  }

  /// Replace the address on top of the stack with the value it points to.
  fn emit_load(&mut self) {
    self.emit("pop rax");
    self.emit("mov rax, [rax]");
    self.emit("push rax");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{parser, tokenizer};

  fn compile(source: &str) -> String {
    let tokens = tokenizer::tokenize(source).unwrap();
    let program = parser::parse(tokens, source).unwrap();
    generate(&program)
  }

  fn count(asm: &str, line: &str) -> usize {
    asm.lines().filter(|l| *l == line).count()
  }

  #[test]
  fn starts_with_directives() {
    let asm = compile("return 42;");
    let mut lines = asm.lines();
    assert_eq!(lines.next(), Some(".intel_syntax noprefix"));
    assert_eq!(lines.next(), Some(".global main"));
    assert_eq!(lines.next(), Some("main:"));
    assert!(asm.contains("    push 42\n    pop rax\n    jmp .L.return.main\n"));
    assert!(asm.ends_with(".L.return.main:\n    mov rsp, rbp\n    pop rbp\n    ret\n"));
  }

  #[test]
  fn greater_than_matches_swapped_less_than() {
    assert_eq!(
      compile("a = 1; b = 2; return a > b;"),
      compile("a = 1; b = 2; return b < a;")
    );
    assert_eq!(
      compile("a = 1; b = 2; return a >= b;"),
      compile("a = 1; b = 2; return b <= a;")
    );
  }

  #[test]
  fn assignment_stores_and_repushes() {
    let asm = compile("a = b = 3;");
    let store = "    pop rdi\n    pop rax\n    mov [rax], rdi\n    push rdi\n";
    assert_eq!(asm.matches(store).count(), 2);
    assert!(asm.contains("    lea rax, [rbp-8]\n    push rax\n    lea rax, [rbp-16]\n"));
    assert!(asm.contains("    sub rsp, 16\n"));
  }

  #[test]
  fn labels_are_unique_across_functions() {
    let asm = compile(
      "f() { if (1) return 1; return 0; } main() { while (0) 1; if (1) return 2; return f(); }",
    );
    for label in [".L.else.1:", ".L.end.1:", ".L.begin.2:", ".L.end.2:", ".L.else.3:", ".L.end.3:", ".L.call.4:", ".L.end.4:"] {
      assert_eq!(count(&asm, label), 1, "{label} in\n{asm}");
    }
  }

  #[test]
  fn if_without_else_still_has_both_labels() {
    let asm = compile("if (a) a = 2;");
    assert!(asm.contains("    cmp rax, 0\n    je .L.else.1\n"));
    assert!(asm.contains("    jmp .L.end.1\n.L.else.1:\n.L.end.1:\n"));
  }

  #[test]
  fn for_without_condition_never_branches_out() {
    let asm = compile("for (;;) a = a + 1;");
    assert!(!asm.contains("je "));
    assert!(asm.contains(".L.begin.1:\n"));
    assert!(asm.contains("    jmp .L.begin.1\n.L.end.1:\n"));
  }

  #[test]
  fn for_runs_init_once_and_inc_after_body() {
    let asm = compile("for (i = 0; i < 10; i = i + 1) s = s + i;");
    let begin = asm.find(".L.begin.1:").unwrap();
    let init = asm.find("    push 0\n").unwrap();
    let inc_const = asm.rfind("    push 1\n").unwrap();
    let back_jump = asm.find("    jmp .L.begin.1").unwrap();
    assert!(init < begin);
    assert!(begin < inc_const && inc_const < back_jump);
  }

  #[test]
  fn prologue_spills_parameters() {
    let asm = compile("f(x, y) { return x - y; } main() { return f(1, 2); }");
    assert!(asm.contains(
      "f:\n    push rbp\n    mov rbp, rsp\n    sub rsp, 16\n    mov [rbp-8], rdi\n    mov [rbp-16], rsi\n"
    ));
    assert!(asm.contains("    push 1\n    push 2\n    pop rsi\n    pop rdi\n"));
    assert_eq!(count(&asm, "    call f"), 2);
    assert!(asm.contains("main:\n    push rbp\n    mov rbp, rsp\n    push 1\n"));
  }

  #[test]
  fn empty_program_is_just_the_directives() {
    assert_eq!(compile(""), ".intel_syntax noprefix\n.global main\n");
  }

  #[test]
  fn function_without_return_falls_into_the_epilogue() {
    let asm = compile("f() { a = 7; } main() { return f(); }");
    assert!(asm.contains(
      "    push 7\n    pop rdi\n    pop rax\n    mov [rax], rdi\n    push rdi\n    pop rax\n.L.return.f:\n    mov rsp, rbp\n"
    ));
  }

  #[test]
  fn wide_literals_go_through_rax() {
    let asm = compile("return 4294967296;");
    assert!(asm.contains("    mov rax, 4294967296\n    push rax\n"));
  }

  #[test]
  fn dereference_loads_through_the_address() {
    let asm = compile("x = 3; y = &x; return *y;");
    assert!(asm.contains("    lea rax, [rbp-16]\n    push rax\n    pop rax\n    mov rax, [rax]\n    push rax\n    pop rax\n    mov rax, [rax]\n"));
  }
}
