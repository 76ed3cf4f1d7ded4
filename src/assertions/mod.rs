//! # Módulo de Assertions Declarativas
//!
//! Checks declarativos de nível de run, consumidos pelo subcomando
//! `test` da CLI.
//!
//! ## Para todos entenderem:
//!
//! Uma assertion é uma afirmação verificável sobre um run gravado:
//! "terminou com sucesso", "tem no máximo 10 steps", "nenhum payload
//! vazou segredo". O arquivo de assertions é um JSON plano que o CI
//! versiona junto com o resto do código - se o comportamento do agente
//! regride, o `test` sai com código 1.
//!
//! ## Checks disponíveis:
//!
//! | Check            | O que verifica                               |
//! |------------------|----------------------------------------------|
//! | `final_status`   | Status terminal do run                       |
//! | `max_steps`      | Contagem de steps não excede o teto          |
//! | `no_step_errors` | Nenhum step fechou com `status=error`        |
//! | `phase_at`       | Fase do step em um índice (0-based)          |
//! | `truncated`      | Valor da flag de truncamento                 |
//! | `no_secrets`     | Nenhum payload persistido vaza segredo       |
//!
//! O arquivo é validado contra um schema embutido antes da avaliação;
//! um check desconhecido é rejeitado na carga, não ignorado em
//! silêncio.

use anyhow::{Context, Result};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::analysis;
use crate::store::LoadedRun;

// ============================================================================
// TIPOS DE ASSERTION
// ============================================================================

/// Um arquivo de assertions: lista plana de checks avaliados contra um
/// único run.
///
/// ```json
/// {
///   "assertions": [
///     {"check": "final_status", "value": "success"},
///     {"check": "max_steps", "value": 10},
///     {"check": "no_step_errors"},
///     {"check": "phase_at", "index": 0, "value": "reason"},
///     {"check": "no_secrets"}
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct AssertionFile {
    /// Checks na ordem do arquivo.
    pub assertions: Vec<Assertion>,
}

/// Um check declarativo individual.
#[derive(Debug, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Assertion {
    /// Status terminal igual ao valor de wire informado.
    FinalStatus { value: String },
    /// Contagem de steps não excede o máximo informado.
    MaxSteps { value: u64 },
    /// Nenhum step fechou com `status=error`.
    NoStepErrors,
    /// O step no índice (0-based) tem a fase informada.
    PhaseAt { index: usize, value: String },
    /// A flag de truncamento tem o valor informado.
    Truncated { value: bool },
    /// Nenhum payload persistido vaza segredo.
    NoSecrets,
}

/// Resultado da avaliação de uma assertion.
#[derive(Debug, serde::Serialize)]
pub struct AssertionOutcome {
    /// Nome estável do check.
    pub name: String,
    /// Passou?
    pub passed: bool,
    /// Detalhe legível (sempre presente, inclusive em pass).
    pub detail: String,
}

// ============================================================================
// SCHEMA DO ARQUIVO
// ============================================================================

static FILE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["assertions"],
        "properties": {
            "assertions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["check"],
                    "properties": {
                        "check": {
                            "type": "string",
                            "enum": [
                                "final_status", "max_steps", "no_step_errors",
                                "phase_at", "truncated", "no_secrets"
                            ]
                        },
                        "index": {"type": "integer", "minimum": 0}
                    }
                }
            }
        }
    })
});

/// Carrega um arquivo de assertions e o valida contra o schema.
pub fn load_file(path: &Path) -> Result<AssertionFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read assertion file {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).context("Failed to parse assertion file JSON")?;

    let compiled =
        JSONSchema::compile(&FILE_SCHEMA).expect("embedded assertion schema compiles");
    if let Err(errors) = compiled.validate(&value) {
        let msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
        anyhow::bail!("Assertion file does not match schema: {}", msgs.join("; "));
    }

    serde_json::from_value(value).context("Failed to decode assertion file")
}

// ============================================================================
// AVALIAÇÃO
// ============================================================================

/// Avalia todas as assertions contra o run. Nunca encurta o circuito:
/// o relatório completo vale mais que a primeira falha.
pub fn evaluate(file: &AssertionFile, run: &LoadedRun) -> Vec<AssertionOutcome> {
    file.assertions.iter().map(|a| evaluate_one(a, run)).collect()
}

fn evaluate_one(assertion: &Assertion, run: &LoadedRun) -> AssertionOutcome {
    match assertion {
        Assertion::FinalStatus { value } => {
            let actual = serde_json::to_value(run.meta.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            AssertionOutcome {
                name: "final_status".into(),
                passed: &actual == value,
                detail: format!("expected '{}', found '{}'", value, actual),
            }
        }
        Assertion::MaxSteps { value } => AssertionOutcome {
            name: "max_steps".into(),
            passed: run.steps.len() as u64 <= *value,
            detail: format!("{} steps, limit {}", run.steps.len(), value),
        },
        Assertion::NoStepErrors => {
            let errors: Vec<u64> = run
                .steps
                .iter()
                .filter(|s| s.status == crate::protocol::StepStatus::Error)
                .map(|s| s.step_id)
                .collect();
            AssertionOutcome {
                name: "no_step_errors".into(),
                passed: errors.is_empty(),
                detail: if errors.is_empty() {
                    "no error steps".into()
                } else {
                    format!("error steps: {:?}", errors)
                },
            }
        }
        Assertion::PhaseAt { index, value } => match run.steps.get(*index) {
            Some(step) => AssertionOutcome {
                name: "phase_at".into(),
                passed: step.phase.as_str() == value,
                detail: format!(
                    "step at index {} is '{}', expected '{}'",
                    index,
                    step.phase.as_str(),
                    value
                ),
            },
            None => AssertionOutcome {
                name: "phase_at".into(),
                passed: false,
                detail: format!("no step at index {} ({} steps)", index, run.steps.len()),
            },
        },
        Assertion::Truncated { value } => AssertionOutcome {
            name: "truncated".into(),
            passed: run.meta.truncated == *value,
            detail: format!("truncated={}", run.meta.truncated),
        },
        Assertion::NoSecrets => {
            let check = analysis::check_redaction(run);
            AssertionOutcome {
                name: "no_secrets".into(),
                passed: check.passed,
                detail: check.detail,
            }
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
