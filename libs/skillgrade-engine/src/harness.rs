/// Language harnesses and the output comparison convention
///
/// **Conventions (fixed per language, see `config/languages.json`):**
///
/// `function_result` (Python):
/// - The candidate defines `solution(...)`.
/// - The test input is read as the argument list of a call: `1, [2, 3]` calls
///   `solution(1, [2, 3])`. Empty input calls `solution()`. Input that is not a
///   valid literal list is passed through as one raw string argument.
/// - The return value is stringified with `str()`.
/// - The expected output is parsed as one literal (raw string if it does not parse)
///   and stringified with `str()`, so `'abc'` and `abc`, or `[1,2]` and `[1, 2]`,
///   compare equal. This happens in a separate run of [`EXPECTATION_DRIVER`] that
///   never sees candidate code.
/// - The candidate's process never receives the expected output. Its driver prints
///   only the stringified result, on a JSON line prefixed with a per-run marker that
///   separates it from the candidate's own prints. The comparison happens on the host.
///
/// `stdout` (Java, Rust):
/// - The program reads the test input on stdin.
/// - stdout and expected output are compared after `\r\n` -> `\n` and trimming
///   leading/trailing whitespace. Case-sensitive, no float tolerance.
use crate::languages::Comparison;
use serde::Deserialize;
use serde_json::json;

const PYTHON_DRIVER: &str = r#"import ast
import json
import sys

_PARSE_ERRORS = (ValueError, SyntaxError, TypeError, MemoryError, RecursionError)


def _arguments(raw):
    if not raw.strip():
        return ()
    try:
        return ast.literal_eval("(" + raw + ",)")
    except _PARSE_ERRORS:
        return (raw,)


def _main():
    payload = json.loads(sys.stdin.read())
    marker = payload.pop("marker")
    namespace = {"__name__": "__candidate__"}
    exec(compile(payload.pop("source"), "solution.py", "exec"), namespace)
    solution = namespace.get("solution")
    if not callable(solution):
        sys.stderr.write("solution() is not defined\n")
        sys.exit(3)
    result = solution(*_arguments(payload["input"]))
    sys.stdout.write("\n" + marker + json.dumps({"actual": str(result)}) + "\n")
    sys.stdout.flush()


_main()
"#;

/// Renders an expected output literal the way the candidate driver renders results
const EXPECTATION_DRIVER: &str = r#"import ast
import json
import sys

_PARSE_ERRORS = (ValueError, SyntaxError, TypeError, MemoryError, RecursionError)


def _literal(raw):
    try:
        return ast.literal_eval(raw)
    except _PARSE_ERRORS:
        return raw


payload = json.loads(sys.stdin.read())
sys.stdout.write(payload["marker"] + json.dumps({"expected": str(_literal(payload["raw"]))}) + "\n")
"#;

/// Program text and stdin ready to be shipped into a sandbox
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub program: String,
    pub stdin: String,
    comparison: Comparison,
    marker: String,
}

/// Outcome of comparing produced output with the expectation
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub passed: bool,
    /// The candidate's result as seen by the comparison
    pub actual: String,
}

#[derive(Deserialize)]
struct ResultLine {
    actual: String,
}

#[derive(Deserialize)]
struct ExpectationLine {
    expected: String,
}

fn new_marker() -> String {
    format!("@@skillgrade:{}@@", uuid::Uuid::new_v4().simple())
}

impl PreparedRun {
    /// Candidate program for one test case. The expected output is not part of it.
    pub fn new(comparison: Comparison, code: &str, input: &str) -> Self {
        let marker = new_marker();

        match comparison {
            Comparison::FunctionResult => {
                let payload = json!({
                    "marker": marker,
                    "source": code,
                    "input": input,
                });
                Self {
                    program: PYTHON_DRIVER.to_string(),
                    stdin: payload.to_string(),
                    comparison,
                    marker,
                }
            }
            Comparison::Stdout => Self {
                program: code.to_string(),
                stdin: input.to_string(),
                comparison,
                marker,
            },
        }
    }

    /// Trusted run rendering `expected_output` for a `function_result` comparison
    pub fn expectation(expected_output: &str) -> Self {
        let marker = new_marker();
        let payload = json!({
            "marker": marker,
            "raw": expected_output,
        });
        Self {
            program: EXPECTATION_DRIVER.to_string(),
            stdin: payload.to_string(),
            comparison: Comparison::FunctionResult,
            marker,
        }
    }

    /// Rendered expected value printed by an [`PreparedRun::expectation`] run
    pub fn read_expectation(&self, stdout: &str) -> Option<String> {
        self.marked_line::<ExpectationLine>(stdout)
            .map(|line| line.expected)
    }

    fn marked_line<T: for<'de> Deserialize<'de>>(&self, stdout: &str) -> Option<T> {
        stdout
            .lines()
            .rev()
            .find_map(|l| l.strip_prefix(self.marker.as_str()))
            .and_then(|rest| serde_json::from_str::<T>(rest.trim()).ok())
    }

    /// Compare the program's stdout with the expected output.
    ///
    /// For `function_result` runs `expected_output` must already be rendered by
    /// an expectation run.
    pub fn judge(&self, stdout: &str, expected_output: &str) -> Judgement {
        match self.comparison {
            Comparison::Stdout => {
                let actual = normalize_output(stdout);
                Judgement {
                    passed: actual == normalize_output(expected_output),
                    actual,
                }
            }
            Comparison::FunctionResult => match self.marked_line::<ResultLine>(stdout) {
                Some(line) => Judgement {
                    passed: line.actual == expected_output,
                    actual: line.actual,
                },
                None => Judgement {
                    passed: false,
                    actual: String::new(),
                },
            },
        }
    }
}

/// Normalize output for stdout comparison
///
/// **Normalization Rules:**
/// - `\r\n` becomes `\n`
/// - Leading and trailing whitespace trimmed
///
/// **Preserves:** internal whitespace, case, empty lines within content
pub fn normalize_output(output: &str) -> String {
    output.replace("\r\n", "\n").trim().to_string()
}
