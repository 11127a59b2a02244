//! Step-recording helpers shared by the ikspoz unit and integration tests.
//!
//! A [`TestReport`] records what a test set up, what it did and what it
//! checked. When `TEST_REPORT_DIR` is set, the record is written to
//! `<dir>/<module__test>.txt` once the report is dropped, so a failing run
//! leaves a readable trail next to the panic message.

use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a [`TestReport`] named after the enclosing test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn here() {}
        fn name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let path = name_of(here);
        let path = path.strip_suffix("::here").unwrap_or(path);
        let path = path.strip_suffix("::{{closure}}").unwrap_or(path);
        $crate::TestReport::new(path, $title, file!(), line!())
    }};
}

const MAX_SHOWN: usize = 600;

#[derive(Debug)]
enum Step {
    Setup(String),
    Action(String),
    Check { passed: bool, message: String },
}

impl Step {
    fn line(&self) -> String {
        match self {
            Step::Setup(msg) => format!("setup: {}", msg),
            Step::Action(msg) => format!("action: {}", msg),
            Step::Check {
                passed: true,
                message,
            } => format!("pass: {}", message),
            Step::Check {
                passed: false,
                message,
            } => format!("FAIL: {}", message),
        }
    }
}

pub struct TestReport {
    path: String,
    title: String,
    location: String,
    steps: Mutex<Vec<Step>>,
    out_dir: Option<PathBuf>,
}

impl TestReport {
    pub fn new(path: &str, title: &str, file: &str, line: u32) -> Self {
        Self {
            path: path.to_string(),
            title: title.to_string(),
            location: format!("{}:{}", file, line),
            steps: Mutex::new(Vec::new()),
            out_dir: std::env::var_os("TEST_REPORT_DIR").map(PathBuf::from),
        }
    }

    fn push(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step);
        }
    }

    fn shown(value: &dyn Debug) -> String {
        let text = format!("{:?}", value);
        if text.len() <= MAX_SHOWN {
            text
        } else {
            let mut cut = MAX_SHOWN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}... ({} bytes)", &text[..cut], text.len())
        }
    }

    pub fn setup(&self, msg: impl Display) {
        self.push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Step::Action(msg.to_string()));
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let passed = actual == expected;
        self.push(Step::Check {
            passed,
            message: format!(
                "{}: {} == {}",
                label,
                Self::shown(actual),
                Self::shown(expected)
            ),
        });
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.push(Step::Check {
            passed: value,
            message: label.to_string(),
        });
        assert!(value, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let passed = haystack.contains(needle);
        self.push(Step::Check {
            passed,
            message: format!(
                "{}: {} contains {}",
                label,
                Self::shown(&haystack),
                Self::shown(&needle)
            ),
        });
        assert!(passed, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    fn write(&self) {
        let Some(dir) = &self.out_dir else {
            return;
        };
        let outcome = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };
        let mut lines = vec![
            format!("TEST: {}", self.path),
            format!("TITLE: {}", self.title),
            format!("SOURCE: {}", self.location),
        ];
        if let Ok(steps) = self.steps.lock() {
            lines.extend(steps.iter().map(Step::line));
        }
        lines.push(format!("RESULT: {}", outcome));
        lines.push(String::new());

        let _ = std::fs::create_dir_all(dir);
        let file = dir.join(format!("{}.txt", self.path.replace("::", "__")));
        let _ = std::fs::write(file, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write();
    }
}
