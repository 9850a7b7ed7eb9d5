//! End-to-end tests: compile, assemble with the host C compiler, run, and
//! check the exit status. Skipped unless the host is x86-64 Linux with `cc`.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// External functions called by some of the programs below.
const HELPERS: &str = r#"
long ret3(void) { return 3; }
long ret5(void) { return 5; }
long add2(long x, long y) { return x + y; }
long sub2(long x, long y) { return x - y; }
long add6(long a, long b, long c, long d, long e, long f) { return a + b + c + d + e + f; }
"#;

fn host_cc() -> Option<PathBuf> {
  if !cfg!(all(target_arch = "x86_64", target_os = "linux")) {
    return None;
  }
  which::which("cc").ok()
}

/// Build and run `source`, returning its exit status, or `None` when there
/// is no toolchain to run it with.
fn run(source: &str) -> Result<Option<i32>> {
  let Some(cc) = host_cc() else {
    return Ok(None);
  };

  let asm = pcc::generate_assembly(source)?;

  let dir = std::env::temp_dir().join(format!(
    "pcc-{}-{}",
    std::process::id(),
    SEQ.fetch_add(1, Ordering::Relaxed)
  ));
  fs::create_dir_all(&dir)?;
  let asm_path = dir.join("prog.s");
  let helper_path = dir.join("helpers.c");
  let exe_path = dir.join("prog");
  fs::write(&asm_path, asm)?;
  fs::write(&helper_path, HELPERS)?;

  let status = Command::new(&cc)
    .arg("-o")
    .arg(&exe_path)
    .arg(&asm_path)
    .arg(&helper_path)
    .status()
    .context("failed to spawn cc")?;
  if !status.success() {
    bail!("cc failed on {}", asm_path.display());
  }

  let status = Command::new(&exe_path).status()?;
  fs::remove_dir_all(&dir).ok();
  status
    .code()
    .map(Some)
    .context("program was killed by a signal")
}

fn assert_returns(expected: i32, source: &str) {
  match run(source) {
    Ok(Some(code)) => assert_eq!(code, expected, "{source}"),
    Ok(None) => eprintln!("skipping {source:?}: no x86-64 host toolchain"),
    Err(err) => panic!("{source}: {err:#}"),
  }
}

#[test]
fn arithmetic() {
  assert_returns(0, "return 0;");
  assert_returns(42, "return 42;");
  assert_returns(21, "return 5+20-4;");
  assert_returns(41, "return  12 + 34 - 5 ;");
  assert_returns(47, "return 5+6*7;");
  assert_returns(15, "return 5*(9-6);");
  assert_returns(4, "return (3+5)/2;");
  assert_returns(7, "return -7/2 + 10;");
  assert_returns(10, "return -10+20;");
  assert_returns(10, "return - -10;");
  assert_returns(10, "return - - +10;");
  assert_returns(1, "return 1+2*3-(4-1)==4;");
}

#[test]
fn comparisons() {
  assert_returns(0, "return 0==1;");
  assert_returns(1, "return 42==42;");
  assert_returns(1, "return 0!=1;");
  assert_returns(0, "return 42!=42;");
  assert_returns(1, "return 0<1;");
  assert_returns(0, "return 1<1;");
  assert_returns(0, "return 2<1;");
  assert_returns(1, "return 0<=1;");
  assert_returns(1, "return 1<=1;");
  assert_returns(0, "return 2<=1;");
  assert_returns(1, "return 1>0;");
  assert_returns(0, "return 1>1;");
  assert_returns(0, "return 1>2;");
  assert_returns(1, "return 1>=0;");
  assert_returns(1, "return 1>=1;");
  assert_returns(0, "return 1>=2;");
}

#[test]
fn variables_and_assignment() {
  assert_returns(3, "a=1; b=2; return a+b;");
  assert_returns(3, "a=3; return a;");
  assert_returns(8, "a=3; z=5; return a+z;");
  assert_returns(8, "foo=3; bar=5; return foo+bar;");
  assert_returns(33, "a=b=3; return a*10+b;");
  assert_returns(6, "return (a=5)+1;");
  assert_returns(1, "return 1; return 2;");
}

#[test]
fn control_flow() {
  assert_returns(3, "if (0) return 2; return 3;");
  assert_returns(3, "if (1-1) return 2; return 3;");
  assert_returns(2, "if (1) return 2; return 3;");
  assert_returns(2, "if (2-1) return 2; return 3;");
  assert_returns(2, "if (0) a=1; else a=2; return a;");
  assert_returns(10, "i=0; while(i<10) i=i+1; return i;");
  assert_returns(55, "i=0; j=0; for (i=0; i<=10; i=i+1) j=i+j; return j;");
  assert_returns(3, "for (;;) return 3; return 5;");
  assert_returns(3, "{1; {2;} return 3;}");
  assert_returns(55, "i=0; j=0; while(i<=10) {j=i+j; i=i+1;} return j;");
}

#[test]
fn calls_into_c() {
  assert_returns(3, "return ret3();");
  assert_returns(5, "return ret5();");
  assert_returns(8, "return add2(3, 5);");
  assert_returns(2, "return sub2(5, 3);");
  assert_returns(21, "return add6(1,2,3,4,5,6);");
  assert_returns(9, "return 1 + add2(3, 5);");
}

#[test]
fn arguments_are_evaluated_left_to_right() {
  // 2 - 20 = -18, seen as an exit status.
  assert_returns(238, "a = 1; return sub2(a = a + 1, a = a * 10);");
}

#[test]
fn binary_operands_are_evaluated_left_to_right() {
  // a becomes 2, then 6: 2 * 10 + 6.
  assert_returns(26, "a=1; return (a=a+1) * 10 + (a=a*3);");
}

#[test]
fn falling_off_the_end_returns_the_last_expression() {
  assert_returns(7, "f() { a = 7; } main() { return f(); }");
}

#[test]
fn function_definitions() {
  // -1 as an exit status.
  assert_returns(255, "main() { return f(1, 2); } f(x, y) { return x - y; }");
  assert_returns(1, "f(x, y) { return x - y; } main() { return f(1, 2) == -1; }");
  assert_returns(
    120,
    "main() { return fact(5); } fact(n) { if (n <= 1) return 1; return n * fact(n - 1); }",
  );
  assert_returns(
    55,
    "main() { return fib(9); } fib(x) { if (x<=1) return 1; return fib(x-1) + fib(x-2); }",
  );
  assert_returns(
    21,
    "main() { return sum(1,2,3,4,5,6); } sum(a,b,c,d,e,f) { return a+b+c+d+e+f; }",
  );
  assert_returns(7, "main() { a = 3; return g(4) + a; } g(a) { b = a; return b; }");
}

#[test]
fn pointers() {
  assert_returns(3, "x=3; return *&x;");
  assert_returns(3, "x=3; y=&x; z=&y; return **z;");
  assert_returns(3, "x=3; y=5; return *(&y+1);");
  assert_returns(5, "x=3; y=5; return *(&x-1);");
  assert_returns(5, "x=3; y=&x; *y=5; return x;");
  assert_returns(7, "x=3; y=5; *(&y+1)=7; return x;");
  assert_returns(1, "x=0; y=0; return &x - &y;");
}
