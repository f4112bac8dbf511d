use finrag_core::sandbox::{CodeExecutor, SandboxLimits, MAX_NESTING, NO_OUTPUT};
use std::time::Duration;

// --- Test: Printing ---
// Goal: Printed text comes back verbatim.
#[test]
fn test_print_hello() {
    assert_eq!(CodeExecutor::default().execute("print('hello')"), "hello\n");
}

// --- Test: Silent Code ---
// Goal: Code that prints nothing reports success with the sentinel.
#[test]
fn test_silent_code_sentinel() {
    assert_eq!(CodeExecutor::default().execute("x = 1"), NO_OUTPUT);
}

// --- Test: Syntax Errors ---
// Goal: Invalid syntax is reported as text, never raised.
#[test]
fn test_invalid_syntax() {
    let out = CodeExecutor::default().execute("print('hello'");
    assert!(out.starts_with("Error executing code: SyntaxError"), "{}", out);
}

// --- Test: Finance Calculation ---
// Goal: A typical model-written snippet computes an NPV and a loan payment.
#[test]
fn test_financial_snippet() {
    let code = "\
cash = [-1000, 300, 400, 500]
value = npv(0.05, cash)
print(round(value, 2))
print(round(pmt(0.05 / 12, 360, 200000), 2))
";
    let out = CodeExecutor::default().execute(code);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines, vec!["80.44", "-1073.64"]);
}

// --- Test: Loops and Lists ---
// Goal: Control flow and list building behave as the tool description promises.
#[test]
fn test_loops_and_append() {
    let code = "\
prices = [100, 110, 99, 120]
gains = []
for i in range(1, len(prices)) {
  change = prices[i] / prices[i - 1] - 1
  if change > 0 { gains = append(gains, round(change, 3)) }
}
print(gains)
print(len(gains), max(prices))
";
    let out = CodeExecutor::default().execute(code);
    assert_eq!(out, "[0.1, 0.212]\n2 120\n");
}

// --- Test: No Escape Hatches ---
// Goal: Names outside the builtin allow-list are rejected.
#[test]
fn test_unknown_functions_are_rejected() {
    for code in ["open('/etc/passwd')", "import('os')", "exec('1')"] {
        let out = CodeExecutor::default().execute(code);
        assert!(out.starts_with("Error executing code:"), "{} -> {}", code, out);
    }
}

// --- Test: Deep Nesting ---
// Goal: Pathologically nested input is refused as a syntax error instead of
// exhausting the interpreter's stack.
#[test]
fn test_deeply_nested_code_is_rejected() {
    let executor = CodeExecutor::default();
    let parens = format!("print({}1{})", "(".repeat(50_000), ")".repeat(50_000));
    let out = executor.execute(&parens);
    assert!(out.starts_with("Error executing code: SyntaxError: nesting too deep"), "{}", out);

    let lists = format!("x = {}1{}", "[".repeat(50_000), "]".repeat(50_000));
    assert!(executor.execute(&lists).contains("nesting too deep"));

    let blocks = format!("{}print(1){}", "if true {\n".repeat(5_000), "\n}".repeat(5_000));
    assert!(executor.execute(&blocks).contains("nesting too deep"));

    // Still usable afterwards.
    assert_eq!(executor.execute("print((1 + 2) * 3)"), "9\n");
}

// --- Test: Deep Values ---
// Goal: Values built up in a loop cannot nest past the cap either.
#[test]
fn test_values_cannot_nest_without_bound() {
    let executor = CodeExecutor::default();
    let out = executor.execute("x = 1\nfor i in range(100000) { x = [x] }\nprint(x)");
    assert!(out.starts_with("Error executing code: TypeError: values may nest"), "{}", out);

    let out = executor.execute("x = [1]\nfor i in range(100000) { x = append([], x) }");
    assert!(out.contains("values may nest"), "{}", out);

    let out = executor.execute("x = [1]\nfor i in range(100000) { x[0] = x }");
    assert!(out.contains("values may nest"), "{}", out);

    let ok = format!("x = 1\nfor i in range({}) {{ x = [x] }}\nprint(len(x))", MAX_NESTING);
    assert_eq!(executor.execute(&ok), "1\n");
}

// --- Test: Timeouts ---
// Goal: Runaway snippets return a timeout message within the configured limit.
#[test]
fn test_runaway_code_times_out() {
    let executor = CodeExecutor::new(SandboxLimits {
        timeout: Duration::from_millis(100),
        max_steps: u64::MAX,
        ..SandboxLimits::default()
    });
    let started = std::time::Instant::now();
    let out = executor.execute("for i in range(1000000) { for j in range(1000000) { x = 1 } }");
    assert!(out.contains("Timeout"), "{}", out);
    assert!(started.elapsed() < Duration::from_secs(2));
}
