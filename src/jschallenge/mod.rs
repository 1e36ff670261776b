//! In-process JavaScript challenge solving.
//!
//! Some origins gate their endpoints behind lightweight JavaScript
//! challenges: dynamic math expressions, cookie-seeding snippets, obfuscated
//! one-liners. These are solved in-process with the Boa engine, no headless
//! browser required. The VM environment is seeded with minimal browser
//! globals (`window`, `document.cookie`, `navigator.userAgent`) so scripts
//! referencing them run without a ReferenceError.
//!
//! A solver serialises evaluations through an internal lock; for parallel
//! solving across many sessions, give each session its own solver.

use std::sync::Mutex;

use boa_engine::{Context, Source};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("bootstrap JS globals: {0}")]
    Bootstrap(String),
    #[error("eval: {0}")]
    Eval(String),
    #[error("convert interpreter output: {0}")]
    Convert(String),
}

/// Challenge-solving capability. Implementations evaluate a raw script and
/// return the final expression's value as a string.
pub trait Solver: Send + Sync {
    fn eval(&self, script: &str) -> Result<String, SolverError>;
}

/// Boa-backed solver.
///
/// Boa's `Context` is not `Send`, so the solver keeps the only piece of
/// cross-eval state (the `document.cookie` string) on the Rust side and
/// seeds a fresh context with it on every evaluation. The lock both
/// serialises evaluations and guards that state.
pub struct BoaSolver {
    user_agent: String,
    cookie: Mutex<String>,
}

impl BoaSolver {
    /// Creates a solver exposing `user_agent` to the JS environment. An
    /// empty string falls back to a generic identifier.
    pub fn new(user_agent: &str) -> Self {
        let user_agent = if user_agent.is_empty() {
            "Mozilla/5.0 (compatible; cohort/1.0)".to_string()
        } else {
            user_agent.to_string()
        };
        Self {
            user_agent,
            cookie: Mutex::new(String::new()),
        }
    }

    /// Value of `document.cookie` after the most recent evaluation.
    /// Challenge scripts seed cookies here; callers copy the value into
    /// their HTTP cookie jar afterwards.
    pub fn get_cookie(&self) -> String {
        self.cookie.lock().expect("solver lock poisoned").clone()
    }

    /// Injects a cookie string so challenge scripts that expect existing
    /// cookies find them in `document.cookie`.
    pub fn set_cookie(&self, cookie: &str) {
        *self.cookie.lock().expect("solver lock poisoned") = cookie.to_string();
    }

    fn prelude(&self, cookie: &str) -> String {
        // JSON string literals are valid JS string literals.
        let ua = serde_json::to_string(&self.user_agent).unwrap_or_else(|_| "\"\"".into());
        let cookie = serde_json::to_string(cookie).unwrap_or_else(|_| "\"\"".into());
        format!(
            r#"
var window = this;
var document = {{ cookie: {cookie} }};
var navigator = {{ userAgent: {ua} }};
window.document = document;
window.navigator = navigator;
"#
        )
    }
}

impl Solver for BoaSolver {
    fn eval(&self, script: &str) -> Result<String, SolverError> {
        let mut cookie = self.cookie.lock().expect("solver lock poisoned");

        let mut context = Context::default();
        context
            .eval(Source::from_bytes(&self.prelude(&cookie)))
            .map_err(|err| SolverError::Bootstrap(err.to_string()))?;

        let value = context
            .eval(Source::from_bytes(script))
            .map_err(|err| SolverError::Eval(err.to_string()))?;

        let result = value
            .to_string(&mut context)
            .map_err(|err| SolverError::Eval(err.to_string()))?
            .to_std_string()
            .map_err(|_| SolverError::Convert("interpreter output is not valid UTF-16".into()))?;

        // Persist whatever the script left in document.cookie.
        let after = context
            .eval(Source::from_bytes("document.cookie"))
            .map_err(|err| SolverError::Eval(err.to_string()))?;
        if let Ok(js_string) = after.to_string(&mut context) {
            if let Ok(text) = js_string.to_std_string() {
                *cookie = text;
            }
        }

        Ok(result)
    }
}
