//! Turns snippet text into a runnable unit.
//!
//! The parser decides the shape, not a textual search for `await`:
//! the snippet is tried as a single expression inside an async arrow,
//! then as a plain script, then as the statement body of an async arrow.
//! Trying the expression first keeps `await(x)` an await rather than a
//! call to a global named `await`. Whatever shape wins, the evaluator
//! awaits any Promise it produces.

use boa_engine::{Context, JsResult, JsValue, Script, Source};

use crate::report::{Failure, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitForm {
    /// Parsed as-is; the completion value is the result
    Script,
    /// `(async () => (code))()`; the expression value is the result
    AsyncExpression,
    /// `(async () => { code })()`; the `return` value is the result
    AsyncBody,
}

impl UnitForm {
    fn source_for(&self, code: &str) -> String {
        // Newlines keep a trailing `// comment` from swallowing the wrapper
        match self {
            UnitForm::Script => code.to_string(),
            UnitForm::AsyncExpression => format!("(async () => (\n{code}\n))()"),
            UnitForm::AsyncBody => format!("(async () => {{\n{code}\n}})()"),
        }
    }
}

pub struct CompiledUnit {
    form: UnitForm,
    script: Script,
}

impl CompiledUnit {
    pub fn form(&self) -> UnitForm {
        self.form
    }

    pub fn evaluate(&self, context: &mut Context) -> JsResult<JsValue> {
        self.script.evaluate(context)
    }
}

/// Compiles `code` against `context`'s realm.
pub fn compile(code: &str, max_code_size: usize, context: &mut Context) -> Result<CompiledUnit, Failure> {
    if code.len() > max_code_size {
        return Err(Failure::new(
            FailureKind::CompileError,
            format!(
                "snippet is too large ({} bytes, limit is {} bytes)",
                code.len(),
                max_code_size
            ),
            "",
        ));
    }

    if let Ok(unit) = parse(UnitForm::AsyncExpression, code, context) {
        return Ok(unit);
    }

    let script_error = match parse(UnitForm::Script, code, context) {
        Ok(unit) => return Ok(unit),
        Err(e) => e,
    };

    if let Ok(unit) = parse(UnitForm::AsyncBody, code, context) {
        return Ok(unit);
    }

    // Positions in the plain-script error line up with the operator's text
    Err(Failure::from_js_error(
        FailureKind::CompileError,
        &script_error,
        context,
    ))
}

fn parse(form: UnitForm, code: &str, context: &mut Context) -> JsResult<CompiledUnit> {
    let source = form.source_for(code);
    let script = Script::parse(Source::from_bytes(source.as_bytes()), None, context)?;
    Ok(CompiledUnit { form, script })
}
